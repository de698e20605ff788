//! Telemetry routing
//!
//! Drains decoded telemetry messages from the connection's channel and
//! applies them to the device's state store. Runs on its own thread per
//! device and exits when the connection drops its sender.

use crate::protocol::messages::TelemetryMessage;
use crate::state::SharedDeviceState;
use crossbeam_channel::Receiver;
use std::thread::{self, JoinHandle};

/// Apply one telemetry message to the state store.
pub fn route(state: &SharedDeviceState, message: TelemetryMessage) {
    let mut state = state.lock();
    match message {
        TelemetryMessage::Status(status) => state.apply_status(status),
        TelemetryMessage::Map(raster) => state.apply_map(raster),
        TelemetryMessage::PathMeta(meta) => state.apply_path_meta(meta),
        TelemetryMessage::PathBatch(batch) => state.apply_path_batch(batch),
    }
}

/// Spawn the router thread for one device.
pub fn spawn(
    sn: &str,
    state: SharedDeviceState,
    frames: Receiver<TelemetryMessage>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("router-{sn}"))
        .spawn(move || {
            while let Ok(message) = frames.recv() {
                route(&state, message);
            }
            log::debug!("telemetry router exiting");
        })
}
