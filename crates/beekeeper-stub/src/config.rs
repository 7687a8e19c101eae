//! Command line of the service.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// `yes`/`no` flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    Yes,
    No,
}

/// CLI arguments of the stub, matching the Beekeeper flags.
#[derive(Parser, Debug, Clone)]
#[command(name = "beekeeper-stub")]
#[command(about = "Beekeeper-compatible wallet service for harness tests")]
pub struct StubConfig {
    /// Directory holding `<name>.wallet` files.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub wallet_dir: PathBuf,

    /// Seconds after which unlocked wallets of an idle session lock again.
    #[arg(long, value_name = "SECONDS", default_value_t = 900)]
    pub unlock_timeout: u64,

    /// Delay before answering a failed unlock, in milliseconds.
    #[arg(long, value_name = "MILLIS", default_value_t = 500)]
    pub unlock_interval: u64,

    /// Address of the JSON-RPC webserver.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:0")]
    pub webserver_http_endpoint: SocketAddr,

    /// Where to POST notifications.
    #[arg(long, value_name = "ADDR")]
    pub notifications_endpoint: Option<SocketAddr>,

    /// Print backtraces on crash.
    #[arg(long, value_enum, default_value = "yes")]
    pub backtrace: Toggle,

    /// Directory receiving `json_rpc.log`.
    #[arg(long, value_name = "DIR")]
    pub log_json_rpc: Option<PathBuf>,
}

impl StubConfig {
    /// Configuration for an in-process instance on an ephemeral port.
    pub fn in_directory(wallet_dir: impl Into<PathBuf>) -> Self {
        Self {
            wallet_dir: wallet_dir.into(),
            unlock_timeout: 900,
            unlock_interval: 500,
            webserver_http_endpoint: SocketAddr::from(([127, 0, 0, 1], 0)),
            notifications_endpoint: None,
            backtrace: Toggle::No,
            log_json_rpc: None,
        }
    }

    pub fn unlock_timeout(&self) -> Duration {
        Duration::from_secs(self.unlock_timeout)
    }

    pub fn unlock_interval(&self) -> Duration {
        Duration::from_millis(self.unlock_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_harness_arguments() {
        let config = StubConfig::try_parse_from([
            "beekeeper-stub",
            "--wallet-dir=/tmp/w",
            "--unlock-timeout=30",
            "--unlock-interval=10",
            "--webserver-http-endpoint=127.0.0.1:24001",
            "--notifications-endpoint=127.0.0.1:24002",
            "--backtrace=no",
        ])
        .unwrap();
        assert_eq!(config.wallet_dir, PathBuf::from("/tmp/w"));
        assert_eq!(config.unlock_timeout(), Duration::from_secs(30));
        assert_eq!(config.unlock_interval(), Duration::from_millis(10));
        assert_eq!(config.webserver_http_endpoint.port(), 24001);
        assert_eq!(config.notifications_endpoint.map(|a| a.port()), Some(24002));
        assert_eq!(config.backtrace, Toggle::No);
        assert!(config.log_json_rpc.is_none());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        assert!(StubConfig::try_parse_from([
            "beekeeper-stub",
            "--webserver-http-endpoint=localhost",
        ])
        .is_err());
    }
}
