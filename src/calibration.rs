//! Rod position gauge and speed-of-sound calibration.
//!
//! The ultrasonic range sensor converts echo time to distance with a
//! configured propagation speed. [`Calibrator`] keeps that speed matched to
//! the air in the box; [`RodGauge`] owns the measured position and the
//! calibration it was measured with.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::devices::{DeviceError, EnvReading, EnvironmentSensor, RangeSensor};
use crate::events::Shutdown;

/// Distance published when the sonar read fails.
pub const DISTANCE_UNAVAILABLE: f64 = -999.9;

/// Speed of sound in humid air, m/s.
///
/// Empirical fit, valid for -20 < T < 100 °C and 0 ≤ RH ≤ 100 %.
pub fn speed_of_sound(temperature_c: f64, humidity_pct: f64) -> Result<f64, DeviceError> {
    if !(temperature_c > -20.0 && temperature_c < 100.0) {
        return Err(DeviceError::OutOfRange(format!(
            "temperature {:.2} C",
            temperature_c
        )));
    }
    if !(0.0..=100.0).contains(&humidity_pct) {
        return Err(DeviceError::OutOfRange(format!(
            "relative humidity {:.2} %",
            humidity_pct
        )));
    }
    let t = temperature_c;
    let humidity_term =
        humidity_pct * 9.604e-6 * 10f64.powf(0.032 * (t - 0.004 * t * t));
    Ok((331.296 + 0.606 * t) * (1.0 + humidity_term))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RodPosition {
    pub distance_cm: f64,
    /// Last good environment reading, if any calibration has succeeded.
    pub environment: Option<EnvReading>,
    pub speed_of_sound: f64,
}

impl RodPosition {
    pub fn is_valid(&self) -> bool {
        self.distance_cm != DISTANCE_UNAVAILABLE && self.distance_cm.is_finite()
    }
}

/// Single owner of the measured rod position.
pub struct RodGauge {
    sonar: Arc<dyn RangeSensor>,
    latest: RwLock<RodPosition>,
}

impl RodGauge {
    pub fn new(sonar: Arc<dyn RangeSensor>) -> Self {
        let speed = sonar.speed_of_sound();
        Self {
            sonar,
            latest: RwLock::new(RodPosition {
                distance_cm: DISTANCE_UNAVAILABLE,
                environment: None,
                speed_of_sound: speed,
            }),
        }
    }

    /// Read the sonar and publish the result.
    ///
    /// Measurement and calibration share the write lock, so every stored
    /// distance was taken with the speed of sound stored beside it.
    pub fn measure(&self) -> Result<f64, DeviceError> {
        let mut latest = self.latest.write();
        match self.sonar.distance() {
            Ok(distance) => {
                latest.distance_cm = distance;
                Ok(distance)
            }
            Err(e) => {
                latest.distance_cm = DISTANCE_UNAVAILABLE;
                Err(e)
            }
        }
    }

    pub fn latest(&self) -> RodPosition {
        *self.latest.read()
    }

    pub fn apply_calibration(&self, reading: EnvReading, speed: f64) {
        let mut latest = self.latest.write();
        self.sonar.set_speed_of_sound(speed);
        latest.environment = Some(reading);
        latest.speed_of_sound = speed;
    }
}

impl std::fmt::Debug for RodGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodGauge").field("latest", &self.latest()).finish()
    }
}

pub struct Calibrator {
    environment: Arc<dyn EnvironmentSensor>,
    gauge: Arc<RodGauge>,
    interval: Duration,
    retry: Duration,
}

impl Calibrator {
    pub fn new(
        environment: Arc<dyn EnvironmentSensor>,
        gauge: Arc<RodGauge>,
        interval: Duration,
        retry: Duration,
    ) -> Self {
        Self {
            environment,
            gauge,
            interval,
            retry,
        }
    }

    /// One calibration attempt. On failure the previous calibration stays in
    /// force.
    pub fn calibrate_once(&self) -> Result<f64, DeviceError> {
        let reading = self.environment.read()?;
        let speed = speed_of_sound(reading.temperature_c, reading.humidity_pct)?;
        self.gauge.apply_calibration(reading, speed);
        info!(
            "Temperature: {:.2} C, Humidity: {:.2} %, speed of sound set to {:.2} m/s",
            reading.temperature_c, reading.humidity_pct, speed
        );
        Ok(speed)
    }

    pub async fn run(self, shutdown: Shutdown) {
        info!("Speed-of-sound calibrator started");
        loop {
            let wait = match self.calibrate_once() {
                Ok(_) => self.interval,
                Err(DeviceError::Io(e)) => {
                    error!("Calibration I/O failure, keeping previous value: {}", e);
                    self.retry
                }
                Err(e) => {
                    warn!("Calibration skipped, keeping previous value: {}", e);
                    self.retry
                }
            };
            if shutdown.wait_timeout(wait).await {
                break;
            }
        }
        info!("Speed-of-sound calibrator stopped");
    }
}
