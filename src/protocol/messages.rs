//! Telemetry message schema
//!
//! Decrypted socket payloads are JSON objects tagged by an integer
//! `infoType` field:
//!
//! | infoType | Message | Content |
//! |----------|---------|---------|
//! | 20001 | [`StatusSnapshot`] | mode, battery, fan speed, errors, position |
//! | 20002 | [`MapRaster`] | compressed floor-map raster and geometry |
//! | 30000 | [`PathMeta`] | metadata for the active cleaning path |
//! | 21011 | [`PathBatch`] | ordered batch of path trace points |
//!
//! Unknown tags are ignored; a payload that fails its schema is dropped
//! whole rather than applied partially.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Robot operating mode as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "String")]
pub enum CleanMode {
    /// Docked and charging
    Charge,
    /// Actively cleaning
    Sweep,
    /// Cleaning paused
    Pause,
    /// Returning to the dock
    GoCharge,
    /// Fault reported by the robot
    Error,
    /// Mode string this client does not know
    Unknown,
}

impl From<String> for CleanMode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "charge" => CleanMode::Charge,
            "sweep" => CleanMode::Sweep,
            "pause" => CleanMode::Pause,
            "goCharge" => CleanMode::GoCharge,
            "error" => CleanMode::Error,
            _ => CleanMode::Unknown,
        }
    }
}

impl CleanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanMode::Charge => "charge",
            CleanMode::Sweep => "sweep",
            CleanMode::Pause => "pause",
            CleanMode::GoCharge => "goCharge",
            CleanMode::Error => "error",
            CleanMode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CleanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Robot error codes arrive as numbers from some firmware revisions and as
/// strings from others
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Code(i64),
    Text(String),
}

/// Live robot status (infoType 20001)
///
/// Replaced wholesale on every status frame; fields are never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current operating mode
    pub mode: CleanMode,

    /// Battery charge percentage
    #[serde(rename = "elec")]
    pub battery: u8,

    /// Fan/suction setting (`quiet`, `auto`, `strong`)
    #[serde(rename = "workNoisy", default, skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<String>,

    /// Active error codes, most recent first
    #[serde(rename = "errorState", default, skip_serializing_if = "Vec::is_empty")]
    pub error_state: Vec<ErrorCode>,

    /// Robot position in device millimeters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<[f64; 2]>,
}

impl StatusSnapshot {
    /// The error currently in effect, if any
    pub fn current_error(&self) -> Option<&ErrorCode> {
        self.error_state.first()
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            mode: CleanMode::Charge,
            battery: 0,
            fan_speed: None,
            error_state: Vec::new(),
            pos: None,
        }
    }
}

/// Compressed floor-map raster (infoType 20002)
///
/// `map` is base64 over an LZ4 block that decompresses to exactly
/// `width * height` grayscale bytes. Geometry fields are in meters;
/// positions elsewhere are in millimeters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRaster {
    pub map: String,
    pub width: u32,
    pub height: u32,
    pub x_min: f64,
    pub y_min: f64,
    /// Meters per pixel
    pub resolution: f64,
    /// Path the robot is currently tracing on this map
    #[serde(rename = "pathId", default, skip_serializing_if = "Option::is_none")]
    pub path_id: Option<i64>,
}

/// Metadata for the active cleaning path (infoType 30000)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathMeta {
    #[serde(rename = "pathID", alias = "pathId", default)]
    pub path_id: Option<i64>,
}

/// Batch of path trace points (infoType 21011)
///
/// `start_pos` is the index the server believes the first point lands at;
/// the state store only appends when it matches the held trace length.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathBatch {
    #[serde(rename = "pathID", alias = "pathId")]
    pub path_id: i64,

    #[serde(rename = "startPos")]
    pub start_pos: usize,

    /// Points in device millimeters, in traversal order
    #[serde(rename = "posArray")]
    pub points: Vec<[f64; 2]>,
}

/// One decoded telemetry message
#[derive(Debug, Clone)]
pub enum TelemetryMessage {
    Status(StatusSnapshot),
    Map(MapRaster),
    PathMeta(PathMeta),
    PathBatch(PathBatch),
}

/// Decode a decrypted payload into a telemetry message.
///
/// Returns `Ok(None)` for infoType values this client does not handle.
pub fn decode_message(plaintext: &str) -> Result<Option<TelemetryMessage>> {
    let value: Value = serde_json::from_str(plaintext)
        .map_err(|e| Error::Protocol(format!("payload is not JSON: {e}")))?;

    let info_type = value
        .get("infoType")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Protocol("payload lacks an integer infoType".to_string()))?;

    let data = value
        .get("data")
        .cloned()
        .ok_or_else(|| Error::Protocol(format!("infoType {info_type} payload lacks data")))?;

    let schema_err =
        |e: serde_json::Error| Error::Protocol(format!("infoType {info_type} schema: {e}"));

    let message = match info_type {
        20001 => Some(TelemetryMessage::Status(
            serde_json::from_value(data).map_err(schema_err)?,
        )),
        20002 => Some(TelemetryMessage::Map(
            serde_json::from_value(data).map_err(schema_err)?,
        )),
        30000 => Some(TelemetryMessage::PathMeta(
            serde_json::from_value(data).map_err(schema_err)?,
        )),
        21011 => Some(TelemetryMessage::PathBatch(
            serde_json::from_value(data).map_err(schema_err)?,
        )),
        _ => None,
    };
    Ok(message)
}
