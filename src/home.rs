//! Account-level facade
//!
//! Authenticates once, discovers the account's supported devices and
//! brings up an independent telemetry pipeline per device. Devices of
//! other classes on the same account are ignored during discovery.

use crate::api::{CloudSession, Region};
use crate::config::AppConfig;
use crate::connection::ConnectionConfig;
use crate::error::Result;
use crate::vacuum::Vacuum;
use log::info;
use std::sync::Arc;

/// A connected Proscenic Home account
pub struct ProscenicHome {
    session: Arc<CloudSession>,
    vacuums: Vec<Vacuum>,
}

impl ProscenicHome {
    /// Connect using an application configuration.
    pub fn connect(config: &AppConfig) -> Result<Self> {
        Self::connect_with(
            &config.account.username,
            &config.account.password,
            config.account.region,
            config.connection.to_connection_config(),
        )
    }

    /// Connect with explicit credentials.
    ///
    /// Logs in, discovers devices and starts one connection per vacuum.
    /// Discovery failures on a stale token get one refresh-and-retry
    /// before surfacing.
    pub fn connect_with(
        username: &str,
        password: &str,
        region: Region,
        connection: ConnectionConfig,
    ) -> Result<Self> {
        let session = Arc::new(CloudSession::new(username, password, region)?);
        Self::connect_with_session(session, connection)
    }

    /// Connect over a prepared session, e.g. one pointed at a fixture
    /// backend in tests.
    pub fn connect_with_session(
        session: Arc<CloudSession>,
        connection: ConnectionConfig,
    ) -> Result<Self> {
        session.login()?;

        let devices = session.with_auth_retry(|s| s.list_devices())?;
        info!("discovered {} supported device(s)", devices.len());

        let mut vacuums = Vec::with_capacity(devices.len());
        for device in devices {
            info!("starting telemetry for {} ({})", device.name, device.sn);
            vacuums.push(Vacuum::start(
                Arc::clone(&session),
                device,
                connection.clone(),
            )?);
        }

        Ok(Self { session, vacuums })
    }

    /// The discovered vacuums.
    pub fn vacuums(&self) -> &[Vacuum] {
        &self.vacuums
    }

    pub fn vacuums_mut(&mut self) -> &mut [Vacuum] {
        &mut self.vacuums
    }

    /// The shared session, e.g. for issuing raw API calls.
    pub fn session(&self) -> &Arc<CloudSession> {
        &self.session
    }

    /// Tear down every vacuum's connection. Idempotent.
    pub fn disconnect(&mut self) {
        for vacuum in &mut self.vacuums {
            vacuum.disconnect();
        }
    }
}

impl Drop for ProscenicHome {
    fn drop(&mut self) {
        self.disconnect();
    }
}
