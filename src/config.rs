// Timeouts, topics, thresholds and link settings
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// Zenoh keys
pub const KEY_RELAY_COMMAND: &str = "follow/relay/command"; // intent submission (queryable)
pub const KEY_RELAY_STATUS: &str = "follow/relay/status"; // status query (queryable)
pub const TOPIC_VISION_SUBJECT: &str = "follow/vision/subject"; // per-frame subject geometry

// Serial link
pub const LINK_BAUDRATE: u32 = 115_200;
pub const LINK_PORT_CANDIDATES: [&str; 4] =
    ["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0", "/dev/ttyUSB1"];
pub const ACK_TIMEOUT: Duration = Duration::from_millis(300);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

// Obstacle sensor
pub const SENSOR_INTERVAL: Duration = Duration::from_millis(40);
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(25);
pub const MIN_TRUSTED_CM: f32 = 2.0;
pub const MAX_TRUSTED_CM: f32 = 400.0;
pub const ROLLING_WINDOW: usize = 3;

// Motion controller
pub const SAFE_DISTANCE_CM: f32 = 50.0;
pub const MOVEMENT_DURATION: Duration = Duration::from_millis(400);
pub const PAUSE_DURATION: Duration = Duration::from_millis(300);
pub const SEARCH_TURN_DURATION: Duration = Duration::from_millis(250);
pub const SEARCH_PAUSE_DURATION: Duration = Duration::from_millis(900);
pub const CONTROL_LOOP_PERIOD: Duration = Duration::from_millis(5);
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(500);

// Command synthesizer
pub const LATERAL_DEADZONE_PX: f32 = 100.0;
pub const MIN_AREA_FRACTION: f32 = 0.10;
pub const MAX_AREA_FRACTION: f32 = 0.35;
pub const FORWARD_INTERVAL: Duration = Duration::from_millis(800);
pub const TURN_INTERVAL: Duration = Duration::from_millis(1200);
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(3);
pub const SEARCH_INTERVAL: Duration = Duration::from_millis(1500);
pub const SEARCH_MAX_DURATION: Duration = Duration::from_secs(30);
pub const SEARCH_REST: Duration = Duration::from_secs(10);
pub const SEND_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tuning for the command synthesizer. Durations are in milliseconds on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    pub lateral_deadzone_px: f32,
    pub min_area_fraction: f32,
    pub max_area_fraction: f32,
    pub back_off_when_close: bool,
    #[serde(with = "millis")]
    pub forward_interval: Duration,
    #[serde(with = "millis")]
    pub turn_interval: Duration,
    #[serde(with = "millis")]
    pub search_timeout: Duration,
    #[serde(with = "millis")]
    pub search_interval: Duration,
    #[serde(with = "millis")]
    pub search_max_duration: Duration,
    #[serde(with = "millis")]
    pub search_rest: Duration,
    #[serde(with = "millis")]
    pub send_timeout: Duration,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            lateral_deadzone_px: LATERAL_DEADZONE_PX,
            min_area_fraction: MIN_AREA_FRACTION,
            max_area_fraction: MAX_AREA_FRACTION,
            back_off_when_close: false,
            forward_interval: FORWARD_INTERVAL,
            turn_interval: TURN_INTERVAL,
            search_timeout: SEARCH_TIMEOUT,
            search_interval: SEARCH_INTERVAL,
            search_max_duration: SEARCH_MAX_DURATION,
            search_rest: SEARCH_REST,
            send_timeout: SEND_TIMEOUT,
        }
    }
}

/// Timing and safety thresholds for the on-board motion controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub safe_distance_cm: f32,
    #[serde(with = "millis")]
    pub movement_duration: Duration,
    #[serde(with = "millis")]
    pub pause_duration: Duration,
    #[serde(with = "millis")]
    pub search_turn_duration: Duration,
    #[serde(with = "millis")]
    pub search_pause_duration: Duration,
    #[serde(with = "millis")]
    pub sensor_interval: Duration,
    #[serde(with = "millis")]
    pub echo_timeout: Duration,
    pub min_trusted_cm: f32,
    pub max_trusted_cm: f32,
    pub rolling_window: usize,
    #[serde(with = "millis")]
    pub loop_period: Duration,
    #[serde(with = "millis")]
    pub telemetry_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            safe_distance_cm: SAFE_DISTANCE_CM,
            movement_duration: MOVEMENT_DURATION,
            pause_duration: PAUSE_DURATION,
            search_turn_duration: SEARCH_TURN_DURATION,
            search_pause_duration: SEARCH_PAUSE_DURATION,
            sensor_interval: SENSOR_INTERVAL,
            echo_timeout: ECHO_TIMEOUT,
            min_trusted_cm: MIN_TRUSTED_CM,
            max_trusted_cm: MAX_TRUSTED_CM,
            rolling_window: ROLLING_WINDOW,
            loop_period: CONTROL_LOOP_PERIOD,
            telemetry_interval: TELEMETRY_INTERVAL,
        }
    }
}

/// Serial link settings for the command relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port_candidates: Vec<String>,
    pub baudrate: u32,
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_candidates: LINK_PORT_CANDIDATES.iter().map(|p| p.to_string()).collect(),
            baudrate: LINK_BAUDRATE,
            ack_timeout: ACK_TIMEOUT,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

/// Whole-system config file: every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FollowBotConfig {
    pub synthesizer: SynthesizerConfig,
    pub controller: ControllerConfig,
    pub relay: RelayConfig,
}

impl FollowBotConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
