//! Control channel: hub settings in, limit-switch notices out.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::calibration::RodGauge;
use crate::devices::{LimitSwitch, MotorDriver, MotorStatus, Servo, ServoState, Setpoints};
use crate::events::Shutdown;
use crate::link::{
    connect_with_backoff, write_with_timeout, Backoff, Connector, Line, LineReader, LinkError, LinkStatus,
};
use crate::protocol::{
    parse_line, ControlMessage, Inbound, MotorCommand, Outbound, ProtocolError, SwitchEdge, MAX_CONTROL_LINE,
};

pub const NOTICE_QUEUE_LEN: usize = 16;

/// Gate consulted before any settings are applied.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self) -> bool {
        true
    }
}

/// Why a motor request was turned into a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    AtTravelLimit,
    PositionUnknown,
    AtBottom,
    TelemetryDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub motor: MotorStatus,
    pub refused: Option<Refusal>,
}

/// Everything a settings message may act on.
#[derive(Clone)]
pub struct ControlTargets {
    pub motor: Arc<MotorDriver>,
    pub servo: Arc<dyn Servo>,
    pub setpoints: Arc<Setpoints>,
    pub gauge: Arc<RodGauge>,
    pub limit_switch: Arc<dyn LimitSwitch>,
    pub links: Arc<LinkStatus>,
    pub max_distance_cm: f64,
}

impl ControlTargets {
    /// Apply one settings message. The servo goes first so a scram is never
    /// delayed by motor interlock checks.
    pub fn apply(&self, msg: &ControlMessage) -> ApplyReport {
        match msg.servo {
            ServoState::Engaged => self.servo.engage(),
            ServoState::Scram => self.servo.scram(),
        }
        self.setpoints.set_servo(msg.servo);
        self.setpoints.set_source(msg.source);

        let refused = match msg.motor {
            MotorCommand::Stop => None,
            MotorCommand::Up => self.up_interlock(),
            MotorCommand::Down => self.down_interlock(),
        };
        match (msg.motor, refused) {
            (MotorCommand::Up, None) => {
                self.motor.forward();
            }
            (MotorCommand::Down, None) => {
                self.motor.backward();
            }
            _ => {
                self.motor.stop();
            }
        }

        ApplyReport {
            motor: self.motor.current_status(),
            refused,
        }
    }

    fn up_interlock(&self) -> Option<Refusal> {
        if !self.links.telemetry_up() {
            return Some(Refusal::TelemetryDown);
        }
        match self.gauge.measure() {
            Ok(d) if d >= self.max_distance_cm => Some(Refusal::AtTravelLimit),
            Ok(_) => None,
            Err(_) => Some(Refusal::PositionUnknown),
        }
    }

    fn down_interlock(&self) -> Option<Refusal> {
        if !self.links.telemetry_up() {
            Some(Refusal::TelemetryDown)
        } else if self.limit_switch.is_pressed() {
            Some(Refusal::AtBottom)
        } else {
            None
        }
    }
}

/// Register the bottom-switch handlers.
///
/// The press handler stops the motor on the detecting thread before doing
/// anything else. Notices are queued without blocking; a full queue drops
/// the notice, never the stop.
pub fn install_limit_switch_handlers(
    limit_switch: &dyn LimitSwitch,
    motor: Arc<MotorDriver>,
    notices: mpsc::Sender<Outbound>,
) {
    let press_notices = notices.clone();
    limit_switch.on_press(Box::new(move || {
        motor.stop();
        warn!("Limit switch pressed, motor stopped");
        queue_notice(&press_notices, SwitchEdge::Pressed);
    }));
    limit_switch.on_release(Box::new(move || {
        info!("Limit switch released");
        queue_notice(&notices, SwitchEdge::Released);
    }));
}

fn queue_notice(notices: &mpsc::Sender<Outbound>, edge: SwitchEdge) {
    match notices.try_send(Outbound::LimitSwitch { value: edge }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Notice queue full, dropping limit switch {:?} notice", edge)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Control channel gone, limit switch {:?} notice dropped", edge)
        }
    }
}

pub struct ControlChannel<C: Connector> {
    connector: C,
    targets: ControlTargets,
    authorizer: Arc<dyn Authorizer>,
    notices: mpsc::Receiver<Outbound>,
    backoff: Backoff,
    network_wait: Duration,
    shutdown: Shutdown,
    applied: u64,
    dropped: u64,
}

impl<C: Connector> ControlChannel<C> {
    pub fn new(
        connector: C,
        targets: ControlTargets,
        authorizer: Arc<dyn Authorizer>,
        notices: mpsc::Receiver<Outbound>,
        backoff: Backoff,
        network_wait: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connector,
            targets,
            authorizer,
            notices,
            backoff,
            network_wait,
            shutdown,
            applied: 0,
            dropped: 0,
        }
    }

    pub async fn run(mut self) {
        info!("Control channel started, hub {}", self.connector.describe());
        let shutdown = self.shutdown.clone();

        loop {
            self.hold_motor();
            let Some(stream) =
                connect_with_backoff(&self.connector, &mut self.backoff, &shutdown, "control").await
            else {
                break;
            };
            self.targets.links.set_control(true);

            match self.serve(stream).await {
                Ok(()) => break,
                Err(e) => warn!("Control link lost: {}", e),
            }
        }

        self.targets.links.set_control(false);
        self.targets.motor.stop();
        info!(
            "Control channel stopped ({} applied, {} dropped)",
            self.applied, self.dropped
        );
    }

    /// Serve one connection until it fails or shutdown is requested.
    async fn serve(&mut self, stream: C::Stream) -> Result<(), LinkError> {
        let shutdown = self.shutdown.clone();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = LineReader::new(BufReader::new(reader), MAX_CONTROL_LINE);
        let mut notices_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(Line::Text(bytes)) => self.handle_line(&bytes),
                    Some(Line::Oversized(len)) => {
                        warn!("Dropping control line: {} ({} bytes)", ProtocolError::MessageTooLarge, len);
                        self.dropped += 1;
                    }
                    None => return Err(LinkError::Closed),
                },
                notice = self.notices.recv(), if notices_open => match notice {
                    Some(notice) => {
                        write_with_timeout(&mut writer, notice.to_line().as_bytes(), self.network_wait)
                            .await?;
                    }
                    None => notices_open = false,
                },
            }
        }
    }

    fn handle_line(&mut self, bytes: &[u8]) {
        let Ok(text) = std::str::from_utf8(bytes) else {
            warn!("Dropping non-UTF-8 control line ({} bytes)", bytes.len());
            self.dropped += 1;
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        match parse_line(text) {
            Ok(Inbound::Settings(msg)) => {
                if !self.authorizer.is_authorized() {
                    warn!("Settings from unauthorized session dropped");
                    self.dropped += 1;
                    return;
                }
                let report = self.targets.apply(&msg);
                self.applied += 1;
                match report.refused {
                    Some(reason) => warn!(
                        "Motor {:?} refused ({:?}), holding {:?}",
                        msg.motor, reason, report.motor
                    ),
                    None => info!(
                        "Settings applied: motor {:?}, servo {:?}, source {:?}",
                        report.motor, msg.servo, msg.source
                    ),
                }
            }
            Ok(Inbound::Ack(ack)) => debug!("Hub: {}", ack),
            Err(e) => {
                warn!("Dropping malformed control line: {}", e);
                self.dropped += 1;
            }
        }
    }

    fn hold_motor(&self) {
        self.targets.links.set_control(false);
        if self.targets.motor.stop() {
            warn!("Control link down, motor held stopped");
        }
    }
}
