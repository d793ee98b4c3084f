//! Instrument box configuration.
//!
//! Everything that is a device-calibration constant lives here rather than in
//! the code that uses it. The whole tree is loaded once at startup, validated,
//! and then shared read-only behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::kinetics::PRECURSOR_GROUPS;

pub const DEFAULT_HUB_HOST: &str = "192.168.1.56";
pub const DEFAULT_STREAM_PORT: u16 = 65432;
pub const DEFAULT_CTRL_PORT: u16 = 65433;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub limits: SafetyLimits,
    pub kinetics: KineticsParams,
    pub reactivity: ReactivityCurve,
    pub timing: Timing,
    pub network: NetworkConfig,
    pub display: DisplayConfig,
}

/// Hard limits that gate motion and the integrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_rod_distance_cm: f64,
    /// Neutron density above which the reactor "explodes" and is reset.
    pub runaway_threshold: f64,
    /// Smallest adaptive step the integrator may take before giving up.
    pub min_step_s: f64,
    pub rtol: f64,
    pub atol: f64,
    /// Upper bound on accepted + rejected sub-steps within one cadence interval.
    pub max_substeps: u32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_rod_distance_cm: 17.0,
            runaway_threshold: 1e30,
            min_step_s: 1e-10,
            rtol: 1e-6,
            atol: 1e-8,
            max_substeps: 10_000,
        }
    }
}

/// Point-kinetics parameters. Defaults are the U-235 thermal set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KineticsParams {
    pub beta: [f64; PRECURSOR_GROUPS],
    pub lambda: [f64; PRECURSOR_GROUPS],
    /// Prompt neutron generation time, seconds.
    pub generation_time: f64,
    pub n0: f64,
    /// Source term applied while the external source is on.
    pub source_strength: f64,
}

impl KineticsParams {
    pub fn beta_total(&self) -> f64 {
        self.beta.iter().sum()
    }
}

impl Default for KineticsParams {
    fn default() -> Self {
        Self {
            beta: [0.000215, 0.00142, 0.00127, 0.00257, 0.00075, 0.00027],
            lambda: [0.0126, 0.0337, 0.139, 0.325, 1.13, 2.50],
            generation_time: 5e-4,
            n0: 1.0,
            source_strength: 5.0,
        }
    }
}

/// Linear rod-position to reactivity map. Zero reactivity sits halfway
/// between `cr_min_cm` and `cr_max_cm`; `delta_rho` is covered across that span.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactivityCurve {
    pub cr_min_cm: f64,
    pub cr_max_cm: f64,
    pub delta_rho: f64,
}

impl Default for ReactivityCurve {
    fn default() -> Self {
        Self {
            cr_min_cm: 5.0,
            cr_max_cm: 15.0,
            delta_rho: 800.0e-5,
        }
    }
}

impl ReactivityCurve {
    pub fn zero_rho_position(&self) -> f64 {
        (self.cr_min_cm + self.cr_max_cm) / 2.0
    }

    pub fn span(&self) -> f64 {
        self.cr_max_cm - self.cr_min_cm
    }

    /// Reactivity for a rod distance. The input is clamped to
    /// `[0, max_distance]` so the result is always finite and monotonic.
    pub fn reactivity(&self, distance_cm: f64, max_distance: f64) -> f64 {
        let d = if distance_cm.is_nan() {
            0.0
        } else {
            distance_cm.clamp(0.0, max_distance)
        };
        (d - self.zero_rho_position()) * self.delta_rho / self.span()
    }
}

/// All loop cadences, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub simulation_step_ms: u64,
    pub watchdog_poll_ms: u64,
    pub calibration_interval_ms: u64,
    pub calibration_retry_ms: u64,
    pub telemetry_liveness_ms: u64,
    pub network_wait_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub rig_tick_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            simulation_step_ms: 50,
            watchdog_poll_ms: 100,
            calibration_interval_ms: 10 * 60 * 1000,
            calibration_retry_ms: 60 * 1000,
            telemetry_liveness_ms: 1000,
            network_wait_ms: 500,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 8000,
            rig_tick_ms: 10,
        }
    }
}

impl Timing {
    pub fn simulation_step(&self) -> Duration {
        Duration::from_millis(self.simulation_step_ms)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms)
    }

    pub fn calibration_interval(&self) -> Duration {
        Duration::from_millis(self.calibration_interval_ms)
    }

    pub fn calibration_retry(&self) -> Duration {
        Duration::from_millis(self.calibration_retry_ms)
    }

    pub fn telemetry_liveness(&self) -> Duration {
        Duration::from_millis(self.telemetry_liveness_ms)
    }

    pub fn network_wait(&self) -> Duration {
        Duration::from_millis(self.network_wait_ms)
    }

    pub fn rig_tick(&self) -> Duration {
        Duration::from_millis(self.rig_tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub hub_host: String,
    pub ctrl_port: u16,
    pub stream_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hub_host: DEFAULT_HUB_HOST.to_string(),
            ctrl_port: DEFAULT_CTRL_PORT,
            stream_port: DEFAULT_STREAM_PORT,
        }
    }
}

impl NetworkConfig {
    pub fn ctrl_addr(&self) -> String {
        format!("{}:{}", self.hub_host, self.ctrl_port)
    }

    pub fn stream_addr(&self) -> String {
        format!("{}:{}", self.hub_host, self.stream_port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Rod distance drawn as an empty bar.
    pub bar_min_cm: f64,
    pub frame_ms: u64,
    pub explosion_frame_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            bar_min_cm: 3.0,
            frame_ms: 200,
            explosion_frame_ms: 200,
        }
    }
}

impl InstrumentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let k = &self.kinetics;
        if k.beta.iter().chain(k.lambda.iter()).any(|v| !(*v > 0.0)) {
            return Err(ConfigError::Invalid("beta and lambda must be positive".into()));
        }
        if !(k.generation_time > 0.0) || !(k.n0 > 0.0) || k.source_strength < 0.0 {
            return Err(ConfigError::Invalid(
                "generation_time and n0 must be positive, source_strength non-negative".into(),
            ));
        }

        let l = &self.limits;
        if !(l.max_rod_distance_cm > 0.0) {
            return Err(ConfigError::Invalid("max_rod_distance_cm must be positive".into()));
        }
        if !(l.runaway_threshold > k.n0) {
            return Err(ConfigError::Invalid("runaway_threshold must exceed n0".into()));
        }
        if !(l.min_step_s > 0.0) || !(l.rtol > 0.0) || !(l.atol > 0.0) || l.max_substeps == 0 {
            return Err(ConfigError::Invalid("integrator bounds must be positive".into()));
        }

        if !(self.reactivity.cr_min_cm < self.reactivity.cr_max_cm) {
            return Err(ConfigError::Invalid("cr_min_cm must be below cr_max_cm".into()));
        }

        let t = &self.timing;
        let intervals = [
            t.simulation_step_ms,
            t.watchdog_poll_ms,
            t.calibration_interval_ms,
            t.calibration_retry_ms,
            t.telemetry_liveness_ms,
            t.network_wait_ms,
            t.reconnect_initial_ms,
            t.reconnect_max_ms,
            t.rig_tick_ms,
        ];
        if intervals.iter().any(|ms| *ms == 0) {
            return Err(ConfigError::Invalid("all intervals must be non-zero".into()));
        }
        if t.reconnect_initial_ms > t.reconnect_max_ms {
            return Err(ConfigError::Invalid("reconnect_initial_ms exceeds reconnect_max_ms".into()));
        }

        if !(self.display.bar_min_cm < l.max_rod_distance_cm) || self.display.frame_ms == 0 {
            return Err(ConfigError::Invalid("display bar range is empty".into()));
        }
        Ok(())
    }
}
