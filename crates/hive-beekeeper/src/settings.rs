//! Launch settings for a Beekeeper process.
//!
//! Settings are loaded from environment variables with sensible defaults and
//! rendered into the command line of the service.

use crate::error::Result;
use hive_harness::{Context, NameRegistry, PortAllocator};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base used for generated Beekeeper names (`Beekeeper0`, `Beekeeper1`, ...).
pub const BEEKEEPER_BASE_NAME: &str = "Beekeeper";

/// Default time after which unlocked wallets lock again (15 minutes).
pub const DEFAULT_UNLOCK_TIMEOUT: Duration = Duration::from_secs(900);

/// Default delay the service applies between unlock attempts.
pub const DEFAULT_UNLOCK_INTERVAL: Duration = Duration::from_millis(500);

/// Default time allowed for the service to report that it is listening.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single JSON-RPC call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

fn any_local_port() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

/// Configuration for launching a Beekeeper process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeekeeperSettings {
    /// Name used in logs.
    pub name: String,

    /// Path to the Beekeeper executable.
    pub binary_path: PathBuf,

    /// Directory holding the process logs.
    pub working_directory: PathBuf,

    /// Directory holding `*.wallet` files (defaults to the working directory).
    pub wallet_directory: Option<PathBuf>,

    /// Time after which unlocked wallets lock again.
    pub unlock_timeout: Duration,

    /// Delay applied by the service between unlock attempts.
    pub unlock_interval: Duration,

    /// Address the JSON-RPC webserver binds (port 0 lets the service choose).
    pub http_endpoint: SocketAddr,

    /// Address the notification listener binds (port 0 picks a free port).
    pub notification_endpoint: SocketAddr,

    /// Whether the service prints backtraces on failure.
    pub backtrace: bool,

    /// Directory where the service logs every JSON-RPC exchange.
    pub log_json_rpc: Option<PathBuf>,

    /// Time allowed for startup.
    pub startup_timeout: Duration,

    /// Timeout for a single JSON-RPC call.
    pub rpc_timeout: Duration,

    /// Extra command-line arguments passed verbatim.
    pub extra_args: Vec<String>,
}

impl Default for BeekeeperSettings {
    fn default() -> Self {
        Self {
            name: BEEKEEPER_BASE_NAME.to_string(),
            binary_path: PathBuf::from("beekeeper"),
            working_directory: std::env::temp_dir().join(BEEKEEPER_BASE_NAME),
            wallet_directory: None,
            unlock_timeout: DEFAULT_UNLOCK_TIMEOUT,
            unlock_interval: DEFAULT_UNLOCK_INTERVAL,
            http_endpoint: any_local_port(),
            notification_endpoint: any_local_port(),
            backtrace: true,
            log_json_rpc: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            extra_args: Vec::new(),
        }
    }
}

impl BeekeeperSettings {
    /// Start a builder from the defaults.
    pub fn builder() -> BeekeeperSettingsBuilder {
        BeekeeperSettingsBuilder::default()
    }

    /// Load settings from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BEEKEEPER_PATH` | `beekeeper` (resolved through `PATH`) |
    /// | `BEEKEEPER_UNLOCK_TIMEOUT` | `900` (seconds) |
    /// | `BEEKEEPER_STARTUP_TIMEOUT` | `10` (seconds) |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let seconds = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            binary_path: lookup("BEEKEEPER_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.binary_path.clone()),
            unlock_timeout: seconds("BEEKEEPER_UNLOCK_TIMEOUT").unwrap_or(default.unlock_timeout),
            startup_timeout: seconds("BEEKEEPER_STARTUP_TIMEOUT")
                .unwrap_or(default.startup_timeout),
            ..default
        }
    }

    /// Settings for a new Beekeeper created inside `context`.
    ///
    /// Registers the next `Beekeeper{n}` name, places the working directory
    /// under the context's current directory and takes the webserver and
    /// notification ports from `ports`.
    pub fn for_context(
        context: &Context,
        names: &mut NameRegistry,
        ports: &PortAllocator,
    ) -> Result<Self> {
        let name = names.create_name(Some(BEEKEEPER_BASE_NAME));
        let http_port = ports.allocate_port()?;
        let notification_port = ports.allocate_port()?;
        let base = Self::from_env();
        tracing::debug!(
            name = %name,
            http_port,
            notification_port,
            "Prepared beekeeper settings"
        );
        Ok(Self {
            working_directory: context.current_directory().join(&name),
            http_endpoint: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, http_port)),
            notification_endpoint: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                notification_port,
            )),
            name,
            ..base
        })
    }

    /// Directory holding the wallet files.
    pub fn wallet_directory(&self) -> &Path {
        self.wallet_directory
            .as_deref()
            .unwrap_or(&self.working_directory)
    }

    /// Render the command-line arguments of the service.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--wallet-dir={}", self.wallet_directory().display()),
            format!("--unlock-timeout={}", self.unlock_timeout.as_secs()),
            format!("--unlock-interval={}", self.unlock_interval.as_millis()),
            format!("--webserver-http-endpoint={}", self.http_endpoint),
            format!("--notifications-endpoint={}", self.notification_endpoint),
            format!("--backtrace={}", if self.backtrace { "yes" } else { "no" }),
        ];
        if let Some(dir) = &self.log_json_rpc {
            args.push(format!("--log-json-rpc={}", dir.display()));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Fluent builder for [`BeekeeperSettings`].
#[derive(Debug, Clone, Default)]
pub struct BeekeeperSettingsBuilder {
    settings: BeekeeperSettings,
}

impl BeekeeperSettingsBuilder {
    /// Set the name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    /// Set the path to the executable.
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.binary_path = path.into();
        self
    }

    /// Set the working directory.
    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.working_directory = path.into();
        self
    }

    /// Set the wallet directory.
    pub fn wallet_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.wallet_directory = Some(path.into());
        self
    }

    /// Set the unlock timeout.
    pub fn unlock_timeout(mut self, timeout: Duration) -> Self {
        self.settings.unlock_timeout = timeout;
        self
    }

    /// Set the unlock interval.
    pub fn unlock_interval(mut self, interval: Duration) -> Self {
        self.settings.unlock_interval = interval;
        self
    }

    /// Set the webserver endpoint.
    pub fn http_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.settings.http_endpoint = endpoint;
        self
    }

    /// Set the notification listener endpoint.
    pub fn notification_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.settings.notification_endpoint = endpoint;
        self
    }

    /// Enable or disable backtraces.
    pub fn backtrace(mut self, enabled: bool) -> Self {
        self.settings.backtrace = enabled;
        self
    }

    /// Log every JSON-RPC exchange into `dir`.
    pub fn log_json_rpc(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.log_json_rpc = Some(dir.into());
        self
    }

    /// Set the startup timeout.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.settings.startup_timeout = timeout;
        self
    }

    /// Set the per-call timeout.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.settings.rpc_timeout = timeout;
        self
    }

    /// Append a raw command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.settings.extra_args.push(arg.into());
        self
    }

    /// Return the settings.
    pub fn build(self) -> BeekeeperSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_harness::PortRange;
    use std::sync::Arc;

    #[test]
    fn test_default_settings() {
        let settings = BeekeeperSettings::default();
        assert_eq!(settings.unlock_timeout, Duration::from_secs(900));
        assert_eq!(settings.http_endpoint.port(), 0);
        assert_eq!(settings.wallet_directory(), settings.working_directory);
    }

    #[test]
    fn test_env_overrides() {
        let settings = BeekeeperSettings::from_lookup(|key| match key {
            "BEEKEEPER_PATH" => Some("/opt/hive/beekeeper".to_string()),
            "BEEKEEPER_UNLOCK_TIMEOUT" => Some("60".to_string()),
            "BEEKEEPER_STARTUP_TIMEOUT" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(settings.binary_path, PathBuf::from("/opt/hive/beekeeper"));
        assert_eq!(settings.unlock_timeout, Duration::from_secs(60));
        assert_eq!(settings.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn test_args_rendering() {
        let settings = BeekeeperSettings::builder()
            .working_directory("/tmp/bk")
            .unlock_timeout(Duration::from_secs(5))
            .unlock_interval(Duration::from_millis(10))
            .http_endpoint("127.0.0.1:9000".parse().unwrap())
            .notification_endpoint("127.0.0.1:9001".parse().unwrap())
            .backtrace(false)
            .log_json_rpc("/tmp/bk/rpc")
            .build();
        assert_eq!(
            settings.to_args(),
            vec![
                "--wallet-dir=/tmp/bk",
                "--unlock-timeout=5",
                "--unlock-interval=10",
                "--webserver-http-endpoint=127.0.0.1:9000",
                "--notifications-endpoint=127.0.0.1:9001",
                "--backtrace=no",
                "--log-json-rpc=/tmp/bk/rpc",
            ]
        );
    }

    #[test]
    fn test_for_context_uses_registry_and_ports() {
        let context = Context::root("/tmp/run");
        let mut names = NameRegistry::new();
        let ports = PortRange::with_probe(46000, 46010, Arc::new(|_: u16| true)).unwrap();

        let first = BeekeeperSettings::for_context(&context, &mut names, &ports).unwrap();
        let second = BeekeeperSettings::for_context(&context, &mut names, &ports).unwrap();

        assert_eq!(first.name, "Beekeeper0");
        assert_eq!(second.name, "Beekeeper1");
        assert_eq!(first.working_directory, PathBuf::from("/tmp/run/Beekeeper0"));
        assert_eq!(first.http_endpoint.port(), 46000);
        assert_eq!(first.notification_endpoint.port(), 46001);
        assert_eq!(second.http_endpoint.port(), 46002);
    }

    #[test]
    fn test_for_context_fails_without_ports() {
        let context = Context::root("/tmp/run");
        let mut names = NameRegistry::new();
        let ports = PortRange::with_probe(46000, 46001, Arc::new(|_: u16| true)).unwrap();
        let err = BeekeeperSettings::for_context(&context, &mut names, &ports).unwrap_err();
        assert!(matches!(
            err,
            crate::BeekeeperError::Harness(hive_harness::HarnessError::LackOfPorts { .. })
        ));
    }
}
