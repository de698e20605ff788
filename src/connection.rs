//! Per-device socket connection management
//!
//! Each device gets one named background thread that owns the telemetry
//! socket and walks an explicit state machine:
//!
//! ```text
//! Resolving ──ok──▶ Connected ──fault──▶ (one immediate reconnect)
//!     ▲                 │                        │ still failing
//!     │                 │                        ▼
//!     └──cool-down─── Faulted ◀──────────────────┘
//! ```
//!
//! The vendor's socket endpoints are ephemeral and token-scoped, so a
//! fault is ambiguous between a network blip and stale credentials. The
//! cheap fix is tried first (reconnect to the same endpoint); only when
//! that also fails does the manager refresh the session token, re-resolve
//! the endpoint and back off before the next full attempt. The loop
//! retries forever until [`Connection::disconnect`] is called.
//!
//! Frame buffers live and die with a single socket: a reconnect starts
//! from a clean reader, so no partial frame leaks across attempts.

use crate::crypto;
use crate::error::{Error, Result};
use crate::protocol::messages::{decode_message, TelemetryMessage};
use crate::protocol::{subscribe_frame, FrameEnvelope, FrameReader, SUBSCRIBE_MAP, SUBSCRIBE_STATUS};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Socket read timeout; bounds how long shutdown and silence checks wait
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Granularity of the cool-down wait's shutdown polling
const COOLDOWN_SLICE: Duration = Duration::from_millis(50);

/// Session operations the connection manager needs.
///
/// `CloudSession` implements this for production; tests substitute a mock
/// to drive the state machine without a backend.
pub trait SessionBackend: Send + Sync {
    /// Current session token.
    fn token(&self) -> Result<String>;

    /// Replace the session token via a fresh login.
    fn refresh_token(&self) -> Result<()>;

    /// Resolve the device's telemetry endpoint.
    fn resolve_endpoint(&self, sn: &str) -> Result<SocketEndpoint>;
}

/// Resolved socket endpoint for one device
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SocketEndpoint {
    pub ip: String,
    pub port: u16,
}

/// Connection timing knobs
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Silence on the socket beyond this is a no-data fault
    pub read_timeout: Duration,
    /// Wait between full reconnect cycles
    pub reconnect_cooldown: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(90),
            reconnect_cooldown: Duration::from_secs(60),
        }
    }
}

/// Handle to one device's connection thread
pub struct Connection {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

enum ConnState {
    Resolving,
    Connected(TcpStream),
    Faulted,
}

impl Connection {
    /// Spawn the connection thread for `sn`.
    ///
    /// Decoded telemetry messages are handed to `frames`; the sender is
    /// dropped when the thread exits, which lets the router drain and
    /// stop.
    pub fn start(
        sn: String,
        session: Arc<dyn SessionBackend>,
        frames: Sender<TelemetryMessage>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name(format!("telemetry-{sn}"))
            .spawn(move || {
                run_loop(&sn, session, frames, config, shutdown_flag);
            })
            .map_err(Error::Transport)?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the read loop and close the socket.
    ///
    /// Idempotent and safe from any state; the blocked read unblocks
    /// within the socket poll interval.
    pub fn disconnect(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn run_loop(
    sn: &str,
    session: Arc<dyn SessionBackend>,
    frames: Sender<TelemetryMessage>,
    config: ConnectionConfig,
    shutdown: Arc<AtomicBool>,
) {
    let mut state = ConnState::Resolving;
    let mut endpoint: Option<SocketEndpoint> = None;
    // Guards against hot-looping when resolution keeps rejecting the
    // token even right after a refresh
    let mut refreshed_for_resolve = false;

    while !shutdown.load(Ordering::Relaxed) {
        state = match state {
            ConnState::Resolving => match session.resolve_endpoint(sn) {
                Ok(ep) => {
                    debug!("{sn}: telemetry endpoint {}:{}", ep.ip, ep.port);
                    endpoint = Some(ep);
                    refreshed_for_resolve = false;
                    match try_connect(sn, &session, endpoint.as_ref(), &config) {
                        Some(stream) => ConnState::Connected(stream),
                        None => ConnState::Faulted,
                    }
                }
                Err(Error::Endpoint(reason)) if !refreshed_for_resolve => {
                    // The token is invalid for this device: refresh and
                    // retry resolution rather than backing off
                    info!("{sn}: endpoint resolution rejected ({reason}), refreshing token");
                    refreshed_for_resolve = true;
                    match session.refresh_token() {
                        Ok(()) => ConnState::Resolving,
                        Err(_) => ConnState::Faulted,
                    }
                }
                Err(e) => {
                    warn!("{sn}: endpoint resolution failed: {e}");
                    ConnState::Faulted
                }
            },

            ConnState::Connected(mut stream) => {
                let fault = read_loop(sn, &mut stream, &session, &frames, &config, &shutdown);
                if shutdown.load(Ordering::Relaxed) || frames_closed(&fault) {
                    break;
                }
                warn!("{sn}: telemetry connection fault: {fault}");
                ConnState::Faulted
            }

            ConnState::Faulted => {
                // Cheap fix first: one reconnect to the endpoint we had
                match try_connect(sn, &session, endpoint.as_ref(), &config) {
                    Some(stream) => ConnState::Connected(stream),
                    None => {
                        // Expensive fix: fresh token, fresh endpoint,
                        // cool-down before the next full attempt
                        if let Err(e) = session.refresh_token() {
                            warn!("{sn}: token refresh failed: {e}");
                        }
                        endpoint = None;
                        wait_cooldown(&shutdown, config.reconnect_cooldown);
                        ConnState::Resolving
                    }
                }
            }
        };
    }

    info!("{sn}: telemetry connection closed");
}

fn frames_closed(fault: &Error) -> bool {
    matches!(fault, Error::Protocol(reason) if reason == "frame channel closed")
}

/// Open the socket and send the subscribe frames. `None` means the caller
/// should fall through to the faulted path.
fn try_connect(
    sn: &str,
    session: &Arc<dyn SessionBackend>,
    endpoint: Option<&SocketEndpoint>,
    config: &ConnectionConfig,
) -> Option<TcpStream> {
    let endpoint = endpoint?;
    match open_session(sn, session, endpoint, config) {
        Ok(stream) => {
            info!("{sn}: telemetry session established with {}:{}", endpoint.ip, endpoint.port);
            Some(stream)
        }
        Err(e) => {
            debug!("{sn}: connect to {}:{} failed: {e}", endpoint.ip, endpoint.port);
            None
        }
    }
}

fn open_session(
    sn: &str,
    session: &Arc<dyn SessionBackend>,
    endpoint: &SocketEndpoint,
    config: &ConnectionConfig,
) -> Result<TcpStream> {
    let addr = (endpoint.ip.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Endpoint(format!("unresolvable address {}", endpoint.ip)))?;

    let mut stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_nodelay(true)?;

    let token = session.token()?;
    stream.write_all(&subscribe_frame(SUBSCRIBE_STATUS, &token, sn))?;
    stream.write_all(&subscribe_frame(SUBSCRIBE_MAP, &token, sn))?;
    stream.flush()?;
    Ok(stream)
}

/// Pump frames until the connection faults. Returns the fault cause.
fn read_loop(
    sn: &str,
    stream: &mut TcpStream,
    session: &Arc<dyn SessionBackend>,
    frames: &Sender<TelemetryMessage>,
    config: &ConnectionConfig,
    shutdown: &Arc<AtomicBool>,
) -> Error {
    // Reader state is scoped to this socket; a reconnect starts clean
    let mut reader = FrameReader::new();
    let mut last_data = Instant::now();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Error::Protocol("shutting down".to_string());
        }
        match reader.read_frame(stream) {
            Ok(Some(frame)) => {
                last_data = Instant::now();
                if let Err(e) = handle_frame(sn, &frame, session, frames) {
                    return e;
                }
            }
            Ok(None) => {
                if last_data.elapsed() >= config.read_timeout {
                    return Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no telemetry within the read timeout",
                    ));
                }
            }
            Err(e) => return e,
        }
    }
}

/// Decode one frame and hand it to the router.
///
/// Per-frame problems (unparseable envelope, plaintext frame, schema
/// miss) are dropped without failing the connection; only a closed frame
/// channel is escalated.
fn handle_frame(
    sn: &str,
    frame: &[u8],
    session: &Arc<dyn SessionBackend>,
    frames: &Sender<TelemetryMessage>,
) -> Result<()> {
    let envelope = match FrameEnvelope::parse(frame) {
        Ok(env) => env,
        Err(e) => {
            debug!("{sn}: dropping frame: {e}");
            return Ok(());
        }
    };
    if envelope.encrypt != 1 {
        debug!("{sn}: dropping unencrypted frame");
        return Ok(());
    }

    let plaintext = match decrypt_with_refresh(&envelope.data, session) {
        Some(text) => text,
        None => {
            debug!("{sn}: dropping undecryptable frame");
            return Ok(());
        }
    };

    match decode_message(&plaintext) {
        Ok(Some(message)) => frames
            .send(message)
            .map_err(|_| Error::Protocol("frame channel closed".to_string())),
        Ok(None) => Ok(()),
        Err(e) => {
            debug!("{sn}: dropping frame: {e}");
            Ok(())
        }
    }
}

/// Decrypt a payload, treating failure as a stale token: refresh once and
/// retry before giving up on the frame.
fn decrypt_with_refresh(ciphertext: &str, session: &Arc<dyn SessionBackend>) -> Option<String> {
    let token = session.token().ok()?;
    match crypto::decrypt(ciphertext, &token) {
        Ok(text) => Some(text),
        Err(first) => {
            debug!("decrypt failed ({first}), refreshing token");
            session.refresh_token().ok()?;
            let token = session.token().ok()?;
            crypto::decrypt(ciphertext, &token).ok()
        }
    }
}

fn wait_cooldown(shutdown: &Arc<AtomicBool>, cooldown: Duration) {
    let deadline = Instant::now() + cooldown;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(COOLDOWN_SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}
