//! # beekeeper-stub
//!
//! A self-contained service speaking the Beekeeper command line, JSON-RPC
//! API and notification stream. Harness tests launch it as the black-box
//! wallet process, or run it in-process with [`spawn`].
//!
//! ```text
//!  client ──POST / beekeeper_api.*──▶ handler ──▶ Keeper ──▶ <name>.wallet
//!                                                   │
//!  listener ◀──POST / notify──────────── Notifier ◀─┘
//! ```

pub mod config;
pub mod handler;
pub mod keeper;
pub mod notify;
pub mod protocol;
pub mod server;

pub use config::{StubConfig, Toggle};
pub use keeper::{Keeper, KeeperError};
pub use server::{spawn, StubError, StubServer, JSON_RPC_LOG};
