//! # ATHENA Rods Instrument Box
//!
//! Runtime for the instrument box of the ATHENA rods teaching rig: a control
//! rod on a motorised slider drives a simulated point-kinetics reactor, and
//! the box streams the reactor state to a remote hub while taking motor,
//! servo and source settings back from it.
//!
//! ## Features
//!
//! - **Reactor simulation**: six-group point kinetics integrated with an
//!   embedded adaptive Dormand–Prince stepper, runaway detection and reset
//! - **Rod protection**: limit-switch hard stop plus an independent travel
//!   watchdog
//! - **Calibrated ranging**: speed of sound tracked from temperature and
//!   humidity
//! - **Hub links**: line-delimited JSON control, 20-byte binary telemetry,
//!   reconnect with backoff and a fail-safe stop while disconnected
//! - **Swappable devices**: capability traits with a simulated rig and a
//!   sysfs IIO environment sensor
//!
//! ## Quick Start
//!
//! ```no_run
//! use arod_instbox::config::InstrumentConfig;
//! use arod_instbox::devices::{Devices, RigParams, SimulatedRig};
//! use arod_instbox::display::LogSurface;
//! use arod_instbox::link::TcpConnector;
//! use arod_instbox::runtime::InstrumentBox;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let config = InstrumentConfig::default();
//! let rig = Arc::new(SimulatedRig::new(RigParams::default()));
//! let running = InstrumentBox::new(config.clone(), Devices::simulated(&rig))
//!     .with_rig(rig)
//!     .start(
//!         TcpConnector::new(config.network.ctrl_addr()),
//!         TcpConnector::new(config.network.stream_addr()),
//!         LogSurface::default(),
//!     );
//! running.wait(Duration::from_secs(2)).await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`runtime`] - Wires the components and owns their tasks
//! - [`kinetics`] - Point-kinetics model, solver and simulation engine
//! - [`devices`] - Capability traits, motor monitor and backends
//! - [`calibration`] - Rod gauge and speed-of-sound calibrator
//! - [`watchdog`] - Rod travel protection
//! - [`control`] / [`telemetry`] - Hub channels over [`link`]
//! - [`protocol`] - Wire formats
//! - [`display`] - Matrix display driver

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod calibration;
pub mod config;
pub mod control;
pub mod devices;
pub mod display;
pub mod events;
pub mod kinetics;
pub mod link;
pub mod protocol;
pub mod runtime;
pub mod telemetry;
pub mod watchdog;

// Re-export main public types for convenience
pub use config::InstrumentConfig;
pub use events::{Events, Shutdown, Signal};
pub use kinetics::{ReactorSimulator, ReactorState};
pub use protocol::{ControlMessage, TelemetryFrame};
pub use runtime::{InstrumentBox, RunningBox};
