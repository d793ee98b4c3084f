use arod_instbox::calibration::RodGauge;
use arod_instbox::control::{
    install_limit_switch_handlers, AllowAll, ControlChannel, ControlTargets, NOTICE_QUEUE_LEN,
};
use arod_instbox::devices::{
    MotorDriver, MotorStatus, RigParams, ServoState, Setpoints, SimulatedRig, SourceState,
};
use arod_instbox::events::Shutdown;
use arod_instbox::link::{Backoff, LinkStatus, TcpConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Harness {
    rig: Arc<SimulatedRig>,
    targets: ControlTargets,
    shutdown: Shutdown,
    task: JoinHandle<()>,
    hub: TcpStream,
}

async fn connected(start_cm: f64) -> Harness {
    let rig = Arc::new(SimulatedRig::new(RigParams {
        start_cm,
        ..RigParams::default()
    }));
    let links = Arc::new(LinkStatus::new());
    links.set_telemetry(true);
    let targets = ControlTargets {
        motor: Arc::new(MotorDriver::new(rig.clone())),
        servo: rig.clone(),
        setpoints: Arc::new(Setpoints::new()),
        gauge: Arc::new(RodGauge::new(rig.clone())),
        limit_switch: rig.clone(),
        links,
        max_distance_cm: 17.0,
    };
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_LEN);
    install_limit_switch_handlers(rig.as_ref(), targets.motor.clone(), notice_tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = Shutdown::new();
    let channel = ControlChannel::new(
        TcpConnector::new(listener.local_addr().unwrap().to_string()),
        targets.clone(),
        Arc::new(AllowAll),
        notice_rx,
        Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
        Duration::from_millis(200),
        shutdown.clone(),
    );
    let task = tokio::spawn(channel.run());
    let (hub, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("control channel never connected")
        .unwrap();

    Harness {
        rig,
        targets,
        shutdown,
        task,
        hub,
    }
}

async fn wait_for_status(motor: &MotorDriver, expected: MotorStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while motor.current_status() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "motor stuck at {:?}, expected {:?}",
            motor.current_status(),
            expected
        );
        let never = Shutdown::new();
        motor.wait_for_status_change(&never, Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_settings_move_safe_state_to_moving_up() {
    let mut h = connected(5.0).await;
    assert_eq!(h.targets.motor.current_status(), MotorStatus::Stopped);
    assert_eq!(h.targets.setpoints.servo(), ServoState::Scram);
    assert_eq!(h.targets.setpoints.source(), SourceState::Off);

    h.hub
        .write_all(b"{\"type\":\"settings\",\"motor_set\":1,\"servo_set\":1,\"source_set\":0}\n")
        .await
        .unwrap();

    wait_for_status(&h.targets.motor, MotorStatus::MovingUp).await;
    assert_eq!(h.targets.setpoints.servo(), ServoState::Engaged);
    assert_eq!(h.targets.setpoints.source(), SourceState::Off);
    assert!(h.rig.is_engaged());

    h.shutdown.trigger();
    h.task.await.unwrap();
    assert_eq!(h.targets.motor.current_status(), MotorStatus::Stopped);
}

#[tokio::test]
async fn test_malformed_line_keeps_state_and_connection() {
    let mut h = connected(5.0).await;

    h.hub
        .write_all(b"{\"type\":\"settings\",\"motor_set\":\"x\"}\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.targets.motor.current_status(), MotorStatus::Stopped);
    assert_eq!(h.targets.setpoints.servo(), ServoState::Scram);
    assert!(h.targets.links.control_up());

    // Same connection still serves valid settings.
    h.hub
        .write_all(b"{\"type\":\"settings\",\"motor_set\":-1,\"servo_set\":1,\"source_set\":1}\n")
        .await
        .unwrap();
    wait_for_status(&h.targets.motor, MotorStatus::MovingDown).await;
    assert_eq!(h.targets.setpoints.source(), SourceState::On);

    h.shutdown.trigger();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_oversized_line_is_dropped_and_connection_kept() {
    let mut h = connected(5.0).await;

    // Several megabytes of one unterminated line.
    let chunk = vec![b'x'; 1 << 20];
    for _ in 0..4 {
        h.hub.write_all(&chunk).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.targets.links.control_up());
    assert_eq!(h.targets.motor.current_status(), MotorStatus::Stopped);

    // The newline ends the discarded line; the next one is served normally.
    h.hub
        .write_all(b"\n{\"type\":\"settings\",\"motor_set\":1,\"servo_set\":1,\"source_set\":0}\n")
        .await
        .unwrap();
    wait_for_status(&h.targets.motor, MotorStatus::MovingUp).await;
    assert_eq!(h.targets.setpoints.servo(), ServoState::Engaged);

    h.shutdown.trigger();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_lost_connection_stops_motor_and_reconnects() {
    let h = connected(5.0).await;
    let Harness {
        targets,
        shutdown,
        task,
        mut hub,
        ..
    } = h;
    let hub_addr = hub.local_addr().unwrap();

    hub.write_all(b"{\"type\":\"settings\",\"motor_set\":1,\"servo_set\":1,\"source_set\":0}\n")
        .await
        .unwrap();
    wait_for_status(&targets.motor, MotorStatus::MovingUp).await;

    let listener = TcpListener::bind(hub_addr).await;
    drop(hub);
    wait_for_status(&targets.motor, MotorStatus::Stopped).await;

    // The original listener is gone with the harness; a rebind on the same
    // port is best effort, so only check reconnection when it succeeded.
    if let Ok(listener) = listener {
        let accepted = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(accepted.is_ok(), "channel did not reconnect");
    }

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("control channel ignored shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_limit_switch_notice_reaches_hub() {
    let h = connected(2.5).await;
    let (reader, mut writer) = h.hub.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"type\":\"settings\",\"motor_set\":-1,\"servo_set\":1,\"source_set\":0}\n")
        .await
        .unwrap();
    wait_for_status(&h.targets.motor, MotorStatus::MovingDown).await;

    h.rig.set_position(2.0);
    // The stop happened on this thread, before any I/O.
    assert_eq!(h.targets.motor.current_status(), MotorStatus::Stopped);

    let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
        .await
        .expect("no notice")
        .unwrap()
        .unwrap();
    assert_eq!(line, r#"{"type":"limit_switch","value":"pressed"}"#);

    h.shutdown.trigger();
    h.task.await.unwrap();
}
