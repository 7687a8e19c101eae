//! Connection descriptors handed to other processes.

use crate::error::Result;
use crate::handle::Beekeeper;
use crate::settings::BeekeeperSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Serializable description of a running Beekeeper.
///
/// Holds no session token and no notification endpoint: both only make
/// sense inside the process that packed the handle. Unpacking yields an
/// attached handle that owns nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedBeekeeper {
    /// Name of the original handle.
    pub name: String,
    /// JSON-RPC webserver address.
    pub http_endpoint: SocketAddr,
    /// Unlock timeout new sessions start with.
    pub unlock_timeout: Duration,
    /// Per-request timeout.
    pub rpc_timeout: Duration,
    /// Wallet files of the service.
    pub wallet_directory: PathBuf,
}

impl PackedBeekeeper {
    pub(crate) fn from_settings(settings: &BeekeeperSettings) -> Self {
        Self {
            name: settings.name.clone(),
            http_endpoint: settings.http_endpoint,
            unlock_timeout: settings.unlock_timeout,
            rpc_timeout: settings.rpc_timeout,
            wallet_directory: settings.wallet_directory().to_path_buf(),
        }
    }

    /// Serialize for handing to another process.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a descriptor produced by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Attach a fresh handle to the packed service.
    pub fn unpack(&self) -> Result<Beekeeper> {
        let settings = BeekeeperSettings::builder()
            .name(self.name.clone())
            .wallet_directory(self.wallet_directory.clone())
            .unlock_timeout(self.unlock_timeout)
            .rpc_timeout(self.rpc_timeout)
            .build();
        Beekeeper::attach_with(self.http_endpoint, settings)
    }
}
