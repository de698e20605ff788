//! Session management against the vendor REST backend
//!
//! Owns the account credentials and the opaque session token. The token
//! doubles as the AES key for socket telemetry, so everything that can
//! invalidate it funnels through [`CloudSession::login`], which replaces
//! it wholesale.
//!
//! The backend signals a rejected token in-band (`code` 102 on socket
//! address lookups) rather than with HTTP status codes; callers wrap
//! token-scoped operations in [`CloudSession::with_auth_retry`] to get the
//! one-refresh-then-surface policy.

use crate::connection::{SessionBackend, SocketEndpoint};
use crate::error::{Error, Result};
use crate::protocol::messages::PathBatch;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Device class tag this client supports
pub const VACUUM_TYPE: &str = "CleanRobot";

/// In-band response code for "token invalid for this device"
const INVALID_TOKEN_CODE: i64 = 102;

/// Client metadata the backend expects on login
const APP_VERSION: &str = "1.7.8";
const USER_AGENT: &str = "ProscenicHome/1.7.8 (iPhone; iOS 14.2.1; Scale/3.00)";

/// REST request timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Regional backend hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Us,
    Eu,
    Cn,
}

impl Region {
    pub fn host(&self) -> &'static str {
        match self {
            Region::Us => "mobile.proscenic.tw",
            Region::Eu => "mobile.proscenic.com.de",
            Region::Cn => "mobile.proscenic.cn",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Us => f.write_str("us"),
            Region::Eu => f.write_str("eu"),
            Region::Cn => f.write_str("cn"),
        }
    }
}

/// One discovered device. Immutable after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Serial number, the stable identifier
    pub sn: String,
    /// Display name from the vendor app
    pub name: String,
    /// Device class tag
    pub type_name: String,
}

/// Raw device entry as returned by the listing endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct RawDevice {
    pub sn: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "typeName", default)]
    pub type_name: Option<String>,
}

/// Standard response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EquipData {
    #[serde(default)]
    content: Vec<RawDevice>,
}

#[derive(Debug, Default, Deserialize)]
struct SockAddrData {
    #[serde(default)]
    addr_list: Vec<SocketEndpoint>,
}

/// Authenticated session against one regional backend
pub struct CloudSession {
    username: String,
    password: String,
    base_url: String,
    host: String,
    token: Mutex<Option<String>>,
    http: reqwest::blocking::Client,
}

impl CloudSession {
    /// Create a session for the given region. No network traffic happens
    /// until [`login`](Self::login).
    pub fn new(username: &str, password: &str, region: Region) -> Result<Self> {
        let host = region.host();
        Self::with_base_url(&format!("https://{host}"), username, password)
    }

    /// Create a session against an explicit base URL. Intended for tests
    /// against a local fixture server.
    pub fn with_base_url(base_url: &str, username: &str, password: &str) -> Result<Self> {
        let host = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            host,
            token: Mutex::new(None),
            http,
        })
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The token currently held, if any.
    pub fn current_token(&self) -> Result<String> {
        self.token
            .lock()
            .clone()
            .ok_or_else(|| Error::Auth("no session token held".to_string()))
    }

    /// Log in and replace the session token wholesale.
    pub fn login(&self) -> Result<String> {
        let url = format!("{}/user/login", self.base_url);
        let body = json!({
            "state": "欧洲",
            "countryCode": "49",
            "appVer": APP_VERSION,
            "type": "2",
            "os": "IOS",
            "password": hashed_password(&self.password),
            "registrationId": "13165ffa4eb156ac484",
            "language": "EN",
            "username": self.username,
            "pwd": self.password,
        });

        let response = self
            .http
            .post(&url)
            .header("os", "i")
            .header("c", "338")
            .header("lan", "en")
            .header("User-Agent", USER_AGENT)
            .header("v", APP_VERSION)
            .json(&body)
            .send()
            .map_err(|e| Error::Auth(format!("login request failed: {e}")))?;

        let envelope: Envelope<LoginData> = response
            .json()
            .map_err(|e| Error::Auth(format!("login response not understood: {e}")))?;
        let token = envelope
            .data
            .and_then(|d| d.token)
            .ok_or_else(|| Error::Auth("login response carried no token".to_string()))?;

        log::info!("session token refreshed for {}", self.username);
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    /// List the account's devices, narrowed to the supported class.
    ///
    /// Entries without a class tag are skipped, not errored.
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let url = format!("{}/user/getEquips/{}", self.base_url, self.username);
        let envelope: Envelope<EquipData> =
            self.post(&url, &json!({ "username": self.username }), false)?;
        let content = envelope.data.map(|d| d.content).unwrap_or_default();
        Ok(filter_devices(content))
    }

    /// Resolve the telemetry socket endpoint for one device.
    pub fn socket_address(&self, sn: &str) -> Result<SocketEndpoint> {
        let url = format!("{}/appInit/getSockAddr", self.base_url);
        let envelope: Envelope<SockAddrData> =
            self.post(&url, &json!({ "username": self.username, "sn": sn }), true)?;

        if envelope.code == Some(INVALID_TOKEN_CODE) {
            return Err(Error::Endpoint(format!(
                "backend rejected the token for {sn} (code {INVALID_TOKEN_CODE})"
            )));
        }
        envelope
            .data
            .and_then(|d| d.addr_list.into_iter().next())
            .ok_or_else(|| Error::Endpoint(format!("no socket address returned for {sn}")))
    }

    /// Polling fallback for device info; also nudges the backend into
    /// pushing fresh telemetry over the socket.
    pub fn get_info(&self, sn: &str) -> Result<serde_json::Value> {
        let url = format!("{}/app/cleanRobot/info", self.base_url);
        self.post(&url, &json!({ "username": self.username, "sn": sn }), true)
    }

    /// Polling fallback for one page of path points, starting at `offset`.
    pub fn get_path_page(&self, sn: &str, path_id: i64, offset: usize) -> Result<Option<PathBatch>> {
        let url = format!("{}/app/cleanRobot/21011/{sn}/{offset}", self.base_url);
        let envelope: Envelope<PathBatch> =
            self.post(&url, &json!({ "username": self.username, "pathId": path_id }), true)?;
        Ok(envelope.data)
    }

    /// Run an operation, refreshing the session exactly once if it fails
    /// on a rejected token. A second failure surfaces to the caller.
    pub fn with_auth_retry<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&CloudSession) -> Result<T>,
    {
        match op(self) {
            Err(e @ (Error::Auth(_) | Error::Endpoint(_))) => {
                log::info!("operation rejected the session token ({e}); refreshing once");
                self.login()?;
                op(self)
            }
            other => other,
        }
    }

    pub(crate) fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        with_token: bool,
    ) -> Result<T> {
        let mut request = self.http.post(url).header("host", self.host.as_str());
        if with_token {
            request = request.header("token", self.current_token()?);
        }
        let response = request.json(body).send()?;
        Ok(response.json::<T>()?)
    }
}

impl SessionBackend for CloudSession {
    fn token(&self) -> Result<String> {
        self.current_token()
    }

    fn refresh_token(&self) -> Result<()> {
        self.login().map(|_| ())
    }

    fn resolve_endpoint(&self, sn: &str) -> Result<SocketEndpoint> {
        self.socket_address(sn)
    }
}

/// MD5 hex digest the backend expects in the login body.
fn hashed_password(password: &str) -> String {
    hex::encode(Md5::digest(password.as_bytes()))
}

/// Keep supported devices, dropping unknown classes and untagged entries.
pub(crate) fn filter_devices(raw: Vec<RawDevice>) -> Vec<Device> {
    raw.into_iter()
        .filter_map(|entry| match entry.type_name {
            Some(tag) if tag == VACUUM_TYPE => Some(Device {
                name: entry.name.unwrap_or_else(|| entry.sn.clone()),
                sn: entry.sn,
                type_name: tag,
            }),
            _ => {
                log::debug!("skipping unsupported device {}", entry.sn);
                None
            }
        })
        .collect()
}
