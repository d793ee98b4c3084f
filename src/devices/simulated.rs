//! Simulated rod rig.
//!
//! One [`SimulatedRig`] stands in for every piece of instrument-box hardware:
//! a rod on a motorised slider, the engagement servo, an ultrasonic sensor
//! looking at the rod, the bottom limit switch and the DHT11. The rod moves
//! while the motor runs and falls to the bottom stop when the servo scrams.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    DeviceError, EnvReading, EnvironmentSensor, LimitSwitch, MotorOutput, RangeSensor, Servo,
    SwitchHandler,
};
use crate::calibration::speed_of_sound;
use crate::events::Shutdown;

/// Factory default the sonar assumes before the first calibration.
pub const UNCALIBRATED_SPEED_OF_SOUND: f64 = 343.0;

#[derive(Debug, Clone, Copy)]
pub struct RigParams {
    /// Rod distance at the bottom stop, where the limit switch closes.
    pub bottom_cm: f64,
    /// Mechanical top stop. Deliberately above the software limit.
    pub top_cm: f64,
    pub drive_speed_cm_s: f64,
    pub fall_speed_cm_s: f64,
    pub start_cm: f64,
    pub ambient: EnvReading,
}

impl Default for RigParams {
    fn default() -> Self {
        Self {
            bottom_cm: 2.0,
            top_cm: 22.0,
            drive_speed_cm_s: 1.5,
            fall_speed_cm_s: 40.0,
            start_cm: 2.0,
            ambient: EnvReading {
                temperature_c: 21.0,
                humidity_pct: 45.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    Up,
    Down,
    Idle,
}

#[derive(Debug)]
struct RigPhysics {
    position_cm: f64,
    drive: Drive,
    engaged: bool,
    switch_pressed: bool,
    sonar_online: bool,
    environment: Option<EnvReading>,
    configured_speed: f64,
}

pub struct SimulatedRig {
    params: RigParams,
    physics: Mutex<RigPhysics>,
    press_handlers: Mutex<Vec<SwitchHandler>>,
    release_handlers: Mutex<Vec<SwitchHandler>>,
}

impl SimulatedRig {
    pub fn new(params: RigParams) -> Self {
        let start = params.start_cm.clamp(params.bottom_cm, params.top_cm);
        Self {
            params,
            physics: Mutex::new(RigPhysics {
                position_cm: start,
                drive: Drive::Idle,
                engaged: false,
                switch_pressed: start <= params.bottom_cm,
                sonar_online: true,
                environment: Some(params.ambient),
                configured_speed: UNCALIBRATED_SPEED_OF_SOUND,
            }),
            press_handlers: Mutex::new(Vec::new()),
            release_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn params(&self) -> &RigParams {
        &self.params
    }

    /// True rod position, independent of sonar calibration.
    pub fn position(&self) -> f64 {
        self.physics.lock().position_cm
    }

    pub fn set_position(&self, position_cm: f64) {
        let position = position_cm.clamp(self.params.bottom_cm, self.params.top_cm);
        let edge = {
            let mut physics = self.physics.lock();
            physics.position_cm = position;
            Self::update_switch(&mut physics, self.params.bottom_cm)
        };
        self.fire_switch_edge(edge);
    }

    pub fn set_sonar_online(&self, online: bool) {
        self.physics.lock().sonar_online = online;
    }

    /// `None` makes the environment sensor report unavailable.
    pub fn set_environment(&self, reading: Option<EnvReading>) {
        self.physics.lock().environment = reading;
    }

    pub fn is_engaged(&self) -> bool {
        self.physics.lock().engaged
    }

    /// Advance the rig by `dt_s` seconds of wall time.
    pub fn advance(&self, dt_s: f64) {
        let edge = {
            let mut physics = self.physics.lock();
            let step = if !physics.engaged {
                -self.params.fall_speed_cm_s * dt_s
            } else {
                match physics.drive {
                    Drive::Up => self.params.drive_speed_cm_s * dt_s,
                    Drive::Down => -self.params.drive_speed_cm_s * dt_s,
                    Drive::Idle => 0.0,
                }
            };
            physics.position_cm =
                (physics.position_cm + step).clamp(self.params.bottom_cm, self.params.top_cm);
            Self::update_switch(&mut physics, self.params.bottom_cm)
        };
        self.fire_switch_edge(edge);
    }

    /// Physics loop; ticks until shutdown.
    pub async fn run(self: Arc<Self>, tick: Duration, shutdown: Shutdown) {
        info!("Simulated rig started, tick {:?}", tick);
        let mut last = tokio::time::Instant::now();
        while !shutdown.wait_timeout(tick).await {
            let now = tokio::time::Instant::now();
            self.advance((now - last).as_secs_f64());
            last = now;
        }
        info!("Simulated rig stopped");
    }

    fn update_switch(physics: &mut RigPhysics, bottom_cm: f64) -> Option<bool> {
        let pressed = physics.position_cm <= bottom_cm;
        if pressed == physics.switch_pressed {
            None
        } else {
            physics.switch_pressed = pressed;
            Some(pressed)
        }
    }

    // Handlers run with the physics lock released: a press handler stops the
    // motor, which calls back into `halt`.
    fn fire_switch_edge(&self, edge: Option<bool>) {
        match edge {
            Some(true) => {
                debug!("Simulated limit switch pressed");
                for handler in self.press_handlers.lock().iter() {
                    handler();
                }
            }
            Some(false) => {
                debug!("Simulated limit switch released");
                for handler in self.release_handlers.lock().iter() {
                    handler();
                }
            }
            None => {}
        }
    }

    fn set_drive(&self, drive: Drive) {
        self.physics.lock().drive = drive;
    }
}

impl MotorOutput for SimulatedRig {
    fn drive_up(&self) {
        self.set_drive(Drive::Up);
    }

    fn drive_down(&self) {
        self.set_drive(Drive::Down);
    }

    fn halt(&self) {
        self.set_drive(Drive::Idle);
    }
}

impl Servo for SimulatedRig {
    fn engage(&self) {
        self.physics.lock().engaged = true;
    }

    fn scram(&self) {
        self.physics.lock().engaged = false;
    }
}

impl RangeSensor for SimulatedRig {
    /// Echo-time model: the pulse travels at the true speed of sound for the
    /// ambient air, and is converted back with the configured speed.
    fn distance(&self) -> Result<f64, DeviceError> {
        let physics = self.physics.lock();
        if !physics.sonar_online {
            return Err(DeviceError::SensorUnavailable("sonar echo timeout".into()));
        }
        let ambient = physics.environment.unwrap_or(self.params.ambient);
        let true_speed = speed_of_sound(ambient.temperature_c, ambient.humidity_pct)
            .unwrap_or(UNCALIBRATED_SPEED_OF_SOUND);
        let echo_s = 2.0 * physics.position_cm / 100.0 / true_speed;
        Ok(echo_s * physics.configured_speed / 2.0 * 100.0)
    }

    fn set_speed_of_sound(&self, meters_per_second: f64) {
        self.physics.lock().configured_speed = meters_per_second;
    }

    fn speed_of_sound(&self) -> f64 {
        self.physics.lock().configured_speed
    }
}

impl LimitSwitch for SimulatedRig {
    fn on_press(&self, handler: SwitchHandler) {
        self.press_handlers.lock().push(handler);
    }

    fn on_release(&self, handler: SwitchHandler) {
        self.release_handlers.lock().push(handler);
    }

    fn is_pressed(&self) -> bool {
        self.physics.lock().switch_pressed
    }
}

impl EnvironmentSensor for SimulatedRig {
    fn read(&self) -> Result<EnvReading, DeviceError> {
        self.physics
            .lock()
            .environment
            .ok_or_else(|| DeviceError::SensorUnavailable("DHT11 not responding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engaged_rig(start_cm: f64) -> SimulatedRig {
        let rig = SimulatedRig::new(RigParams {
            start_cm,
            ..RigParams::default()
        });
        rig.engage();
        rig
    }

    #[test]
    fn test_rod_moves_with_drive() {
        let rig = engaged_rig(10.0);
        rig.drive_up();
        rig.advance(2.0);
        assert!((rig.position() - 13.0).abs() < 1e-9);
        rig.drive_down();
        rig.advance(1.0);
        assert!((rig.position() - 11.5).abs() < 1e-9);
        rig.halt();
        rig.advance(5.0);
        assert!((rig.position() - 11.5).abs() < 1e-9);
    }

    #[test]
    fn test_scram_drops_rod_to_bottom() {
        let rig = engaged_rig(15.0);
        rig.scram();
        rig.advance(1.0);
        assert_eq!(rig.position(), rig.params().bottom_cm);
        assert!(rig.is_pressed());
    }

    #[test]
    fn test_mechanical_stops_clamp_travel() {
        let rig = engaged_rig(21.0);
        rig.drive_up();
        rig.advance(10.0);
        assert_eq!(rig.position(), rig.params().top_cm);
    }

    #[test]
    fn test_press_and_release_handlers_fire_on_edges() {
        let rig = engaged_rig(2.5);
        let presses = Arc::new(AtomicU32::new(0));
        let releases = Arc::new(AtomicU32::new(0));
        {
            let presses = presses.clone();
            rig.on_press(Box::new(move || {
                presses.fetch_add(1, Ordering::SeqCst);
            }));
            let releases = releases.clone();
            rig.on_release(Box::new(move || {
                releases.fetch_add(1, Ordering::SeqCst);
            }));
        }

        rig.drive_down();
        rig.advance(1.0);
        rig.advance(1.0);
        assert_eq!(presses.load(Ordering::SeqCst), 1);

        rig.drive_up();
        rig.advance(1.0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(!rig.is_pressed());
    }

    #[test]
    fn test_uncalibrated_sonar_is_biased_until_calibrated() {
        let rig = engaged_rig(10.0);
        let ambient = rig.params().ambient;
        let raw = rig.distance().unwrap();
        assert!((raw - 10.0).abs() > 1e-3);

        let speed = speed_of_sound(ambient.temperature_c, ambient.humidity_pct).unwrap();
        rig.set_speed_of_sound(speed);
        assert!((rig.distance().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_offline_sensors_report_unavailable() {
        let rig = engaged_rig(10.0);
        rig.set_sonar_online(false);
        rig.set_environment(None);
        assert!(matches!(rig.distance(), Err(DeviceError::SensorUnavailable(_))));
        assert!(matches!(rig.read(), Err(DeviceError::SensorUnavailable(_))));
    }
}
