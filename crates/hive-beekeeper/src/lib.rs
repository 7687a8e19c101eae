//! # hive-beekeeper
//!
//! Launch, attach to and drive the Beekeeper wallet-custody service from
//! test code.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Beekeeper (handle)                                       │
//! │    ├─ BeekeeperProcess     spawned binary, stderr.log     │
//! │    ├─ NotificationServer   POST / ◀── beekeeper pushes    │
//! │    ├─ RpcClient            POST / ──▶ beekeeper_api.*     │
//! │    └─ sessions: token ─▶ WalletTracker                    │
//! │                                                           │
//! │  Session  create_wallet / unlock / sign_digest / ...      │
//! │  PackedBeekeeper  pack() ──json──▶ unpack() elsewhere     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Closing a handle, directly, on drop, or through the [`BeekeeperGuard`]
//! registered with a scope, stops its process and invalidates every
//! [`Session`] created from it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hive_beekeeper::{Beekeeper, BeekeeperSettings};
//!
//! # async fn example() -> hive_beekeeper::Result<()> {
//! let beekeeper = Beekeeper::launch(BeekeeperSettings::from_env()).await?;
//! let session = beekeeper.create_session(None).await?;
//! let (_, password) = session.create_wallet("alice", None).await?;
//! session.lock("alice").await?;
//! session.unlock("alice", password.as_deref().unwrap_or_default()).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod handle;
pub mod notifications;
mod packed;
mod process;
mod session;
mod settings;
mod wallet;

pub use client::{RpcClient, API_PREFIX};
pub use error::{BeekeeperError, Result};
pub use handle::{Beekeeper, BeekeeperGuard};
pub use notifications::{Notification, NotificationHandler, NotificationKind};
pub use packed::PackedBeekeeper;
pub use process::{BeekeeperProcess, STDERR_LOG, STDOUT_LOG};
pub use session::{Session, SessionInfo};
pub use settings::{
    BeekeeperSettings, BeekeeperSettingsBuilder, BEEKEEPER_BASE_NAME, DEFAULT_RPC_TIMEOUT,
    DEFAULT_STARTUP_TIMEOUT, DEFAULT_UNLOCK_INTERVAL, DEFAULT_UNLOCK_TIMEOUT,
};
pub use wallet::{WalletInfo, WalletState, WalletTracker};
