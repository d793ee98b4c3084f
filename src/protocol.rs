//! Hub wire formats.
//!
//! Control: one JSON object per line, hub to instrument box
//! (`{"type":"settings","motor_set":1,"servo_set":1,"source_set":0}`), and
//! limit-switch notices in the other direction.
//!
//! Telemetry: fixed 20-byte big-endian frames, instrument box to hub.
//!
//! | offset | size | field           | type |
//! |--------|------|-----------------|------|
//! | 0      | 4    | neutron density | f32  |
//! | 4      | 4    | reactivity      | f32  |
//! | 8      | 4    | distance (cm)   | f32  |
//! | 12     | 8    | timestamp (ms)  | f64  |

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::devices::{ServoState, SourceState};

pub const MAX_CONTROL_LINE: usize = 512;
pub const FRAME_SIZE: usize = 20;

const_assert_eq!(FRAME_SIZE, 4 + 4 + 4 + 8);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message exceeds the control line limit")]
    MessageTooLarge,

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorCommand {
    Down,
    Stop,
    Up,
}

impl MotorCommand {
    pub fn from_wire(value: i64) -> Result<Self, ProtocolError> {
        match value {
            -1 => Ok(MotorCommand::Down),
            0 => Ok(MotorCommand::Stop),
            1 => Ok(MotorCommand::Up),
            other => Err(ProtocolError::InvalidField {
                field: "motor_set",
                value: other,
            }),
        }
    }

    pub fn to_wire(self) -> i8 {
        match self {
            MotorCommand::Down => -1,
            MotorCommand::Stop => 0,
            MotorCommand::Up => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub motor: MotorCommand,
    pub servo: ServoState,
    pub source: SourceState,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawSettings {
    motor_set: i64,
    servo_set: i64,
    source_set: i64,
}

/// A parsed inbound control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Settings(ControlMessage),
    /// Plain-text `OK:`/`REJECT:` acknowledgements some hubs send.
    Ack(String),
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        let raw = RawSettings {
            motor_set: i64::from(self.motor.to_wire()),
            servo_set: match self.servo {
                ServoState::Engaged => 1,
                ServoState::Scram => 0,
            },
            source_set: match self.source {
                SourceState::On => 1,
                SourceState::Off => 0,
            },
        };
        serde_json::json!({
            "type": "settings",
            "motor_set": raw.motor_set,
            "servo_set": raw.servo_set,
            "source_set": raw.source_set,
        })
        .to_string()
    }
}

impl TryFrom<RawSettings> for ControlMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawSettings) -> Result<Self, Self::Error> {
        let servo = match raw.servo_set {
            0 => ServoState::Scram,
            1 => ServoState::Engaged,
            other => {
                return Err(ProtocolError::InvalidField {
                    field: "servo_set",
                    value: other,
                })
            }
        };
        let source = match raw.source_set {
            0 => SourceState::Off,
            1 => SourceState::On,
            other => {
                return Err(ProtocolError::InvalidField {
                    field: "source_set",
                    value: other,
                })
            }
        };
        Ok(Self {
            motor: MotorCommand::from_wire(raw.motor_set)?,
            servo,
            source,
        })
    }
}

pub fn parse_line(line: &str) -> Result<Inbound, ProtocolError> {
    if line.len() > MAX_CONTROL_LINE {
        return Err(ProtocolError::MessageTooLarge);
    }
    let trimmed = line.trim();
    if trimmed.starts_with("OK:") || trimmed.starts_with("REJECT:") {
        return Ok(Inbound::Ack(trimmed.to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::InvalidJson("missing \"type\"".into()))?;

    match kind {
        "settings" => {
            let raw: RawSettings = serde_json::from_value(value.clone())
                .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
            Ok(Inbound::Settings(ControlMessage::try_from(raw)?))
        }
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchEdge {
    Pressed,
    Released,
}

/// Messages the instrument box sends on the control link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    LimitSwitch { value: SwitchEdge },
}

impl Outbound {
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    pub neutron_density: f32,
    pub reactivity: f32,
    pub distance: f32,
    pub timestamp_ms: f64,
}

impl TelemetryFrame {
    pub fn new(neutron_density: f64, reactivity: f64, distance: f64, timestamp_ms: f64) -> Self {
        Self {
            neutron_density: neutron_density as f32,
            reactivity: reactivity as f32,
            distance: distance as f32,
            timestamp_ms,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0..4].copy_from_slice(&self.neutron_density.to_be_bytes());
        buf[4..8].copy_from_slice(&self.reactivity.to_be_bytes());
        buf[8..12].copy_from_slice(&self.distance.to_be_bytes());
        buf[12..20].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_SIZE {
            return Err(ProtocolError::BufferTooShort {
                expected: FRAME_SIZE,
                actual: buf.len(),
            });
        }
        let f32_at = |at: usize| f32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[12..20]);

        Ok(Self {
            neutron_density: f32_at(0),
            reactivity: f32_at(4),
            distance: f32_at(8),
            timestamp_ms: f64::from_be_bytes(ts),
        })
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}
