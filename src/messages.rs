// Message types shared by the synthesizer, the relay and the controller

use std::fmt;

use serde::{Deserialize, Serialize};

/// Directional intent. On the link each command is a single ASCII byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Search,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("Unknown command byte 0x{0:02X}")]
    UnknownByte(u8),

    #[error("Unknown command {0:?}")]
    UnknownText(String),
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Forward,
        Command::Backward,
        Command::Left,
        Command::Right,
        Command::Stop,
        Command::Search,
    ];

    /// Wire encoding
    pub fn as_byte(self) -> u8 {
        match self {
            Command::Forward => b'F',
            Command::Backward => b'B',
            Command::Left => b'L',
            Command::Right => b'R',
            Command::Stop => b'S',
            Command::Search => b'X',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }

    /// Strict decode: anything outside `{F, B, L, R, S, X}` is rejected, including lowercase.
    pub fn from_byte(byte: u8) -> Result<Self, CommandParseError> {
        match byte {
            b'F' => Ok(Command::Forward),
            b'B' => Ok(Command::Backward),
            b'L' => Ok(Command::Left),
            b'R' => Ok(Command::Right),
            b'S' => Ok(Command::Stop),
            b'X' => Ok(Command::Search),
            other => Err(CommandParseError::UnknownByte(other)),
        }
    }
}

impl std::str::FromStr for Command {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [byte] => Command::from_byte(*byte)
                .map_err(|_| CommandParseError::UnknownText(s.to_string())),
            _ => Err(CommandParseError::UnknownText(s.to_string())),
        }
    }
}

impl TryFrom<String> for Command {
    type Error = CommandParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Command> for String {
    fn from(cmd: Command) -> Self {
        cmd.as_char().to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Motor state owned by the motion controller. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    #[default]
    Stopped,
    Forward,
    Backward,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "port", rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connected(String),
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkStatus::Connected(_))
    }
}

/// One line received from the controller over the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkReply {
    Ack(Command),
    Nak(String),
    /// Filtered distance telemetry; `None` when the latest sample was not valid
    Distance(Option<f32>),
    Other(String),
}

impl LinkReply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ACK:") {
            return match rest.parse() {
                Ok(cmd) => LinkReply::Ack(cmd),
                Err(_) => LinkReply::Other(line.to_string()),
            };
        }
        if let Some(rest) = line.strip_prefix("NAK:") {
            return LinkReply::Nak(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("DIST:") {
            return match rest {
                "none" => LinkReply::Distance(None),
                value => match value.parse::<f32>() {
                    Ok(cm) => LinkReply::Distance(Some(cm)),
                    Err(_) => LinkReply::Other(line.to_string()),
                },
            };
        }
        LinkReply::Other(line.to_string())
    }

    pub fn ack_line(cmd: Command) -> String {
        format!("ACK:{}\n", cmd)
    }

    /// Printable bytes are echoed as-is, everything else as hex.
    pub fn nak_line(byte: u8) -> String {
        if byte.is_ascii_graphic() {
            format!("NAK:{}\n", byte as char)
        } else {
            format!("NAK:0x{:02X}\n", byte)
        }
    }

    pub fn distance_line(cm: Option<f32>) -> String {
        match cm {
            Some(cm) => format!("DIST:{:.1}\n", cm),
            None => "DIST:none\n".to_string(),
        }
    }
}

/// Subject geometry for one processed frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedSubject {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub frame_width: f32,
    pub frame_height: f32,
}

impl TrackedSubject {
    /// Horizontal distance from frame centre to box centre; positive means right of centre.
    pub fn lateral_offset(&self) -> f32 {
        (self.x + self.width / 2.0) - self.frame_width / 2.0
    }

    pub fn area_fraction(&self) -> f32 {
        (self.width * self.height) / (self.frame_width * self.frame_height)
    }

    pub fn is_degenerate(&self) -> bool {
        self.frame_width <= 0.0 || self.frame_height <= 0.0
    }
}

/// Intent submission request (network -> relay)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidCommand,
    LinkDown,
    Timeout,
    Rejected,
}

/// Intent submission response (relay -> network)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntentResponse {
    pub fn accepted(cmd: Command) -> Self {
        Self {
            ok: true,
            command: Some(cmd),
            reason: None,
            detail: None,
        }
    }

    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            command: None,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }
}

/// Status query response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub link: LinkStatus,
    pub last_command: Option<Command>,
    pub last_command_age_ms: Option<u64>,
    pub distance_cm: Option<f32>,
}
