pub mod iio;
pub mod motor;
pub mod simulated;

pub use iio::IioEnvironmentSensor;
pub use motor::MotorDriver;
pub use simulated::{RigParams, SimulatedRig};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorStatus {
    Stopped,
    MovingUp,
    MovingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServoState {
    Engaged,
    Scram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvReading {
    pub temperature_c: f64,
    pub humidity_pct: f64,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("reading out of range: {0}")]
    OutOfRange(String),

    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type SwitchHandler = Box<dyn Fn() + Send + Sync>;

/// Raw motor H-bridge. Implementations carry no state tracking; that is
/// layered on by [`MotorDriver`].
pub trait MotorOutput: Send + Sync {
    fn drive_up(&self);
    fn drive_down(&self);
    fn halt(&self);
}

/// Rod engagement servo. Scram releases the rod.
pub trait Servo: Send + Sync {
    fn engage(&self);
    fn scram(&self);
}

/// Ultrasonic rod position sensor.
pub trait RangeSensor: Send + Sync {
    /// Distance to the rod in centimetres.
    fn distance(&self) -> Result<f64, DeviceError>;
    fn set_speed_of_sound(&self, meters_per_second: f64);
    fn speed_of_sound(&self) -> f64;
}

/// Bottom-of-travel switch.
///
/// Press handlers run synchronously on the thread that detects the edge. They
/// must not block.
pub trait LimitSwitch: Send + Sync {
    fn on_press(&self, handler: SwitchHandler);
    fn on_release(&self, handler: SwitchHandler);
    fn is_pressed(&self) -> bool;
}

pub trait EnvironmentSensor: Send + Sync {
    fn read(&self) -> Result<EnvReading, DeviceError>;
}

/// Servo and source intent. Written only by the control channel; read by the
/// simulation on each step.
#[derive(Debug)]
pub struct Setpoints {
    servo_engaged: AtomicBool,
    source_on: AtomicBool,
}

impl Setpoints {
    pub fn new() -> Self {
        Self {
            servo_engaged: AtomicBool::new(false),
            source_on: AtomicBool::new(false),
        }
    }

    pub fn servo(&self) -> ServoState {
        if self.servo_engaged.load(Ordering::Acquire) {
            ServoState::Engaged
        } else {
            ServoState::Scram
        }
    }

    pub fn set_servo(&self, state: ServoState) {
        self.servo_engaged
            .store(state == ServoState::Engaged, Ordering::Release);
    }

    pub fn source(&self) -> SourceState {
        if self.source_on.load(Ordering::Acquire) {
            SourceState::On
        } else {
            SourceState::Off
        }
    }

    pub fn set_source(&self, state: SourceState) {
        self.source_on.store(state == SourceState::On, Ordering::Release);
    }
}

impl Default for Setpoints {
    fn default() -> Self {
        Self::new()
    }
}

/// The device set injected into the runtime at startup.
#[derive(Clone)]
pub struct Devices {
    pub motor: Arc<MotorDriver>,
    pub servo: Arc<dyn Servo>,
    pub sonar: Arc<dyn RangeSensor>,
    pub limit_switch: Arc<dyn LimitSwitch>,
    pub environment: Arc<dyn EnvironmentSensor>,
}

impl Devices {
    /// Every capability backed by one simulated rig.
    pub fn simulated(rig: &Arc<SimulatedRig>) -> Self {
        Self {
            motor: Arc::new(MotorDriver::new(rig.clone())),
            servo: rig.clone(),
            sonar: rig.clone(),
            limit_switch: rig.clone(),
            environment: rig.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setpoints_default_to_safe_state() {
        let setpoints = Setpoints::new();
        assert_eq!(setpoints.servo(), ServoState::Scram);
        assert_eq!(setpoints.source(), SourceState::Off);
    }

    #[test]
    fn test_setpoints_round_trip() {
        let setpoints = Setpoints::new();
        setpoints.set_servo(ServoState::Engaged);
        setpoints.set_source(SourceState::On);
        assert_eq!(setpoints.servo(), ServoState::Engaged);
        assert_eq!(setpoints.source(), SourceState::On);
    }
}
