//! Socket wire protocol
//!
//! # TCP Protocol Specification
//!
//! The vendor telemetry service speaks plaintext TCP with delimiter-based
//! framing:
//!
//! ```text
//! ┌──────────────────────────────┬───────────────┐
//! │ Payload (UTF-8 JSON)         │ `#\t#` (3 B)  │
//! └──────────────────────────────┴───────────────┘
//! ```
//!
//! ## Session setup
//!
//! After connecting, the client sends one subscribe frame per stream:
//! `{"data":{"token":…,"sn":…},"infoType":70001}` for the status stream and
//! `infoType` 70003 for the map/path stream.
//!
//! ## Response envelope
//!
//! Every response frame is a JSON object `{"encrypt":0|1,"data":…}`. With
//! `encrypt` = 1, `data` is base64 AES-ECB ciphertext keyed by the session
//! token; decrypting and JSON-decoding it yields an `infoType`-tagged
//! telemetry message (see [`messages`]). Frames without the envelope, or
//! not marked encrypted, carry nothing the client consumes and are dropped.
//!
//! ## Error handling
//!
//! - **Missing delimiter / EOF**: connection fault, reconnect
//! - **Oversized frame**: connection fault (runaway stream)
//! - **Unparseable frame**: dropped, connection remains open

pub mod messages;

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::io::Read;

/// Frame delimiter terminating every request and response
pub const FRAME_DELIMITER: &[u8; 3] = b"#\t#";

/// Subscribe to the live status stream
pub const SUBSCRIBE_STATUS: u32 = 70001;

/// Subscribe to the map and path stream
pub const SUBSCRIBE_MAP: u32 = 70003;

/// Frames beyond this size indicate a desynchronized or hostile stream
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read chunk size for the frame reader
const READ_CHUNK: usize = 4096;

/// Build a subscribe request frame (JSON body plus delimiter).
pub fn subscribe_frame(info_type: u32, token: &str, sn: &str) -> Vec<u8> {
    let body = json!({
        "data": {
            "token": token,
            "sn": sn,
        },
        "infoType": info_type,
    });
    let mut frame = body.to_string().into_bytes();
    frame.extend_from_slice(FRAME_DELIMITER);
    frame
}

/// Response frame envelope
///
/// `data` is ciphertext whenever `encrypt` is 1; other frames are not
/// consumed by this client.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameEnvelope {
    pub encrypt: i32,
    pub data: String,
}

impl FrameEnvelope {
    /// Parse an envelope from one delimiter-stripped frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| Error::Protocol(format!("bad envelope: {e}")))
    }
}

/// Accumulating reader for delimiter-terminated frames.
///
/// The internal buffer is per-connection state: dropping the reader on
/// reconnect discards any partial frame from the previous socket.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    /// Bytes already scanned for a delimiter, so each new chunk is only
    /// scanned once
    scanned: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the next complete frame, without its delimiter.
    ///
    /// Returns `Ok(None)` when the underlying read timed out before a
    /// complete frame arrived; the caller decides when silence becomes a
    /// fault. EOF and transport errors are returned as errors.
    pub fn read_frame(&mut self, stream: &mut impl Read) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.pop_frame() {
                return Ok(Some(frame));
            }
            if self.buf.len() > MAX_FRAME_SIZE {
                return Err(Error::Protocol(format!(
                    "frame exceeds {MAX_FRAME_SIZE} bytes without a delimiter"
                )));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "telemetry stream closed",
                    )))
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    /// Pop the first buffered frame, if a delimiter has arrived.
    fn pop_frame(&mut self) -> Option<Vec<u8>> {
        // Resume the scan just before the unscanned tail in case a
        // delimiter straddles the chunk boundary
        let from = self.scanned.saturating_sub(FRAME_DELIMITER.len() - 1);
        let found = self.buf[from..]
            .windows(FRAME_DELIMITER.len())
            .position(|w| w == FRAME_DELIMITER)
            .map(|i| from + i);

        match found {
            Some(at) => {
                let frame = self.buf[..at].to_vec();
                self.buf.drain(..at + FRAME_DELIMITER.len());
                self.scanned = 0;
                Some(frame)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out its data in fixed-size slices, to exercise
    /// frames straddling read boundaries.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "dry"));
            }
            let end = (self.pos + self.chunk).min(self.data.len()).min(self.pos + buf.len());
            let n = end - self.pos;
            buf[..n].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(n)
        }
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame(SUBSCRIBE_STATUS, "tok123", "SN42");
        assert!(frame.ends_with(FRAME_DELIMITER));

        let body: serde_json::Value =
            serde_json::from_slice(&frame[..frame.len() - FRAME_DELIMITER.len()]).unwrap();
        assert_eq!(body["infoType"], 70001);
        assert_eq!(body["data"]["token"], "tok123");
        assert_eq!(body["data"]["sn"], "SN42");
    }

    #[test]
    fn test_frames_across_read_boundaries() {
        for chunk in [1, 2, 3, 7, 4096] {
            let mut reader = ChunkedReader {
                data: b"{\"encrypt\":1,\"data\":\"aa\"}#\t#{\"encrypt\":0,\"data\":\"b\"}#\t#".to_vec(),
                pos: 0,
                chunk,
            };
            let mut frames = FrameReader::new();

            let first = frames.read_frame(&mut reader).unwrap().unwrap();
            assert_eq!(first, b"{\"encrypt\":1,\"data\":\"aa\"}");

            let second = frames.read_frame(&mut reader).unwrap().unwrap();
            assert_eq!(second, b"{\"encrypt\":0,\"data\":\"b\"}");

            // Nothing further buffered: the next read times out
            assert!(frames.read_frame(&mut reader).unwrap().is_none());
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut reader = ChunkedReader {
            data: b"{\"encrypt\":1".to_vec(),
            pos: 0,
            chunk: 4096,
        };
        let mut frames = FrameReader::new();
        assert!(frames.read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_eof_is_transport_error() {
        let mut reader = std::io::Cursor::new(b"no delimiter here".to_vec());
        let mut frames = FrameReader::new();
        assert!(matches!(
            frames.read_frame(&mut reader),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_envelope_parse() {
        let env = FrameEnvelope::parse(b"{\"encrypt\":1,\"data\":\"QUJD\"}").unwrap();
        assert_eq!(env.encrypt, 1);
        assert_eq!(env.data, "QUJD");

        assert!(FrameEnvelope::parse(b"not json").is_err());
        assert!(FrameEnvelope::parse(b"{\"data\":\"x\"}").is_err());
    }
}
