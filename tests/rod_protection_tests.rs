use arod_instbox::calibration::{Calibrator, RodGauge};
use arod_instbox::control::{install_limit_switch_handlers, NOTICE_QUEUE_LEN};
use arod_instbox::devices::{
    LimitSwitch, MotorDriver, MotorStatus, RigParams, Servo, SimulatedRig,
};
use arod_instbox::events::Shutdown;
use arod_instbox::watchdog::{RodProtection, TripReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(100);
const RIG_TICK: Duration = Duration::from_millis(10);

fn rig_at(start_cm: f64) -> Arc<SimulatedRig> {
    let rig = Arc::new(SimulatedRig::new(RigParams {
        start_cm,
        ..RigParams::default()
    }));
    rig.engage();
    rig
}

async fn wait_until_stopped(motor: &MotorDriver, shutdown: &Shutdown, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while motor.current_status() != MotorStatus::Stopped {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        motor.wait_for_status_change(shutdown, Duration::from_millis(20)).await;
    }
    true
}

#[tokio::test]
async fn test_watchdog_stops_rod_at_travel_limit() {
    let rig = rig_at(16.5);
    let motor = Arc::new(MotorDriver::new(rig.clone()));
    let gauge = Arc::new(RodGauge::new(rig.clone()));
    Calibrator::new(rig.clone(), gauge.clone(), POLL, POLL)
        .calibrate_once()
        .unwrap();
    let protection = Arc::new(RodProtection::new(motor.clone(), gauge, 17.0, POLL));
    let shutdown = Shutdown::new();

    let physics = tokio::spawn(rig.clone().run(RIG_TICK, shutdown.clone()));
    let watchdog = tokio::spawn(protection.clone().run(shutdown.clone()));

    motor.forward();
    // 0.5 cm at 1.5 cm/s, plus at most one poll.
    assert!(wait_until_stopped(&motor, &shutdown, Duration::from_secs(2)).await);

    let trips = protection.trips();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].reason, TripReason::OverTravel);
    let tripped_at = trips[0].distance_cm.unwrap();
    assert!(tripped_at >= 17.0);
    let overshoot_budget = RigParams::default().drive_speed_cm_s * (POLL + RIG_TICK * 2).as_secs_f64();
    assert!(
        tripped_at < 17.0 + overshoot_budget,
        "tripped late at {:.3} cm",
        tripped_at
    );

    shutdown.trigger();
    physics.await.unwrap();
    watchdog.await.unwrap();
}

#[tokio::test]
async fn test_watchdog_refuses_to_be_outrun_by_repeated_commands() {
    let rig = rig_at(17.5);
    let motor = Arc::new(MotorDriver::new(rig.clone()));
    let gauge = Arc::new(RodGauge::new(rig.clone()));
    let protection = Arc::new(RodProtection::new(motor.clone(), gauge, 17.0, POLL));
    let shutdown = Shutdown::new();
    let watchdog = tokio::spawn(protection.clone().run(shutdown.clone()));

    for _ in 0..3 {
        motor.forward();
        assert!(wait_until_stopped(&motor, &shutdown, POLL * 2).await);
    }
    assert_eq!(protection.trips().len(), 3);

    shutdown.trigger();
    watchdog.await.unwrap();
}

#[tokio::test]
async fn test_limit_switch_press_stops_motor_immediately() {
    let rig = rig_at(2.2);
    let motor = Arc::new(MotorDriver::new(rig.clone()));
    let (tx, mut notices) = mpsc::channel(NOTICE_QUEUE_LEN);
    install_limit_switch_handlers(rig.as_ref(), motor.clone(), tx);
    let shutdown = Shutdown::new();
    let physics = tokio::spawn(rig.clone().run(RIG_TICK, shutdown.clone()));

    motor.backward();
    assert!(wait_until_stopped(&motor, &shutdown, Duration::from_secs(2)).await);
    assert!(rig.is_pressed());
    assert!(notices.recv().await.is_some());

    // Reaching the bottom pressed the switch and stopped the motor in the
    // same physics tick.
    assert_eq!(rig.position(), RigParams::default().bottom_cm);

    shutdown.trigger();
    physics.await.unwrap();
}

#[tokio::test]
async fn test_scram_drop_presses_switch_and_stops_motor() {
    let rig = rig_at(12.0);
    let motor = Arc::new(MotorDriver::new(rig.clone()));
    let (tx, _notices) = mpsc::channel(NOTICE_QUEUE_LEN);
    install_limit_switch_handlers(rig.as_ref(), motor.clone(), tx);

    motor.forward();
    rig.scram();
    rig.advance(1.0);

    assert!(rig.is_pressed());
    assert_eq!(motor.current_status(), MotorStatus::Stopped);
}
