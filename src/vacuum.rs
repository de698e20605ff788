//! Per-device handle
//!
//! Ties one discovered device to its session, state store, telemetry
//! connection and router thread. All consumer-facing reads go through the
//! state store; commands go straight to the REST backend.

use crate::api::{CloudSession, Command, Device};
use crate::connection::{Connection, ConnectionConfig, SessionBackend};
use crate::error::{Error, Result};
use crate::protocol::messages::StatusSnapshot;
use crate::router;
use crate::state::{self, SharedDeviceState, StateEvent};
use crossbeam_channel::{bounded, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Decoded frames buffered between the connection and the router
const FRAME_QUEUE: usize = 256;

/// One connected vacuum
pub struct Vacuum {
    device: Device,
    session: Arc<CloudSession>,
    state: SharedDeviceState,
    connection: Connection,
    router: Option<JoinHandle<()>>,
}

impl Vacuum {
    /// Start the telemetry pipeline for one device.
    pub(crate) fn start(
        session: Arc<CloudSession>,
        device: Device,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let state = state::shared();
        let (frames_tx, frames_rx) = bounded(FRAME_QUEUE);

        let router = router::spawn(&device.sn, Arc::clone(&state), frames_rx)
            .map_err(Error::Transport)?;
        let backend: Arc<dyn SessionBackend> = session.clone();
        let connection = Connection::start(device.sn.clone(), backend, frames_tx, config)?;

        Ok(Self {
            device,
            session,
            state,
            connection,
            router: Some(router),
        })
    }

    pub fn serial(&self) -> &str {
        &self.device.sn
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Latest status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.state.lock().status().clone()
    }

    /// Rendered floor map (placeholder until the first map frame).
    pub fn map_image(&self) -> Vec<u8> {
        self.state.lock().map_image()
    }

    /// Receive a change event per state update.
    pub fn subscribe(&self) -> Receiver<StateEvent> {
        self.state.lock().subscribe()
    }

    /// Shared state store, for consumers needing more than the snapshot.
    pub fn state(&self) -> &SharedDeviceState {
        &self.state
    }

    /// Issue a command, refreshing the session once on a rejected token.
    pub fn send_command(&self, command: &Command) -> Result<()> {
        self.session
            .with_auth_retry(|s| s.send_command(&self.device.sn, command))
    }

    /// REST info poll, for when socket telemetry is unavailable.
    pub fn poll_info(&self) -> Result<serde_json::Value> {
        self.session
            .with_auth_retry(|s| s.get_info(&self.device.sn))
    }

    /// Fetch the next page of path points over REST and fold it into the
    /// trace. Returns whether anything was fetched.
    pub fn poll_path_page(&self) -> Result<bool> {
        let cursor = self.state.lock().path_cursor();
        let Some((path_id, offset)) = cursor else {
            return Ok(false);
        };

        let batch = self
            .session
            .with_auth_retry(|s| s.get_path_page(&self.device.sn, path_id, offset))?;
        match batch {
            Some(batch) => {
                self.state.lock().apply_path_batch(batch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tear down the connection and router. Idempotent.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
        // The connection thread dropped its sender; the router drains
        // whatever is queued and exits
        if let Some(router) = self.router.take() {
            let _ = router.join();
        }
    }
}

impl Drop for Vacuum {
    fn drop(&mut self) {
        self.disconnect();
    }
}
