//! Operator command issuance
//!
//! Commands are stateless REST calls under `/instructions/…`, independent
//! of the telemetry socket: they go out even while the connection is
//! reconnecting, and the local status is never mutated optimistically.
//! After a successful send the issuer fires the info poll, which prompts
//! the backend to push fresh telemetry reflecting the command.

use crate::api::session::CloudSession;
use crate::error::Result;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fan/suction power setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Quiet,
    Auto,
    Strong,
}

impl PowerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::Quiet => "quiet",
            PowerMode::Auto => "auto",
            PowerMode::Strong => "strong",
        }
    }
}

impl std::fmt::Display for PowerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator commands understood by the robot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Whole-home sweep
    StartClean,
    /// Slower, more thorough pass
    DeepClean,
    /// Restrict cleaning to the given map zone ids
    SegmentClean { segments: Vec<u32> },
    Pause,
    /// Resume a paused run
    Continue,
    ReturnToDock,
    /// Change the fan/suction setting
    PowerMode(PowerMode),
    /// Empty the dustbin into the dock's dust collector
    CollectDust,
}

impl CloudSession {
    /// Issue one command to a device.
    ///
    /// The REST call is attempted regardless of socket state; status will
    /// catch up once telemetry flows again.
    pub fn send_command(&self, sn: &str, command: &Command) -> Result<()> {
        let (path, body) = command_request(command, sn, self.username());
        let url = format!(
            "{}/instructions/{}?username={}",
            self.base_url(),
            path,
            self.username()
        );

        let _ack: Value = self.post(&url, &body, true)?;
        log::info!("{sn}: issued {command:?}");

        // Telemetry refresh trigger; best-effort
        if let Err(e) = self.get_info(sn) {
            log::debug!("{sn}: telemetry refresh trigger failed: {e}");
        }
        Ok(())
    }
}

/// Path segment under `/instructions/` and request body for one command.
pub(crate) fn command_request(command: &Command, sn: &str, username: &str) -> (String, Value) {
    match command {
        Command::StartClean => (
            format!("cmd21005/{sn}"),
            json!({ "cleanMode": "sweepOnly", "mode": "smartAreaClean" }),
        ),
        Command::DeepClean => (
            format!("cmd21005_2/{sn}"),
            json!({ "mode": "depthTotalClean" }),
        ),
        Command::SegmentClean { segments } => (
            format!("cmd21005/{sn}"),
            json!({ "segmentId": segment_list(segments) }),
        ),
        Command::Pause => (format!("{sn}/21017"), json!({ "mode": "pause" })),
        Command::Continue => (
            format!("{sn}/21017"),
            json!({ "pauseOrContinue": "continue" }),
        ),
        Command::ReturnToDock => (format!("{sn}/21012"), json!({ "charge": "start" })),
        Command::PowerMode(mode) => (format!("{sn}/21022"), json!({ "setMode": mode.as_str() })),
        Command::CollectDust => (
            format!("cmd/{sn}"),
            json!({
                "dInfo": { "ts": now_millis(), "userId": username },
                "data": { "cmd": "startDustCenter", "value": 0 },
                "infoType": 21024,
            }),
        ),
    }
}

/// Comma-separated zone list with duplicates dropped, first occurrence
/// order preserved.
fn segment_list(segments: &[u32]) -> String {
    let mut seen = Vec::with_capacity(segments.len());
    for &id in segments {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn now_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}
