//! # hive-harness
//!
//! Resource lifecycle core for test harnesses that orchestrate external
//! processes.
//!
//! This crate names test subjects, hands out TCP ports, tears resources down
//! in a deterministic order and carries worker-thread failures back to the
//! test body.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        test body                           │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐   │
//! │  │ NameRegistry │   │  PortRange   │   │ HarnessConfig │   │
//! │  │ create_name  │   │ allocate_*   │──▶│ port_range()  │   │
//! │  └──────────────┘   └──────────────┘   └───────────────┘   │
//! │                                                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ ScopeStack                                           │  │
//! │  │   Scope (root) ── Context { dir, span }              │  │
//! │  │     └─ Scope ── registrants: [A, B, C]               │  │
//! │  │                  exit: C, B, A                       │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                                                            │
//! │  wait_for / wait_for_event        FatalErrorRelay          │
//! │  (blocking, timeout based)        ▲ raise_in_main_thread   │
//! └───────────────────────────────────┼────────────────────────┘
//!                                     │
//!                              worker threads
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use hive_harness::{Context, HarnessConfig, NameRegistry, OnExit};
//!
//! # fn example() -> hive_harness::Result<()> {
//! let config = HarnessConfig::from_env();
//! let ports = config.port_range()?;
//! let mut names = NameRegistry::new();
//! let mut stack = config.scope_stack()?;
//!
//! stack.with_scope("test", |stack| {
//!     let name = names.create_name(Some("Node"));
//!     let port = ports.allocate_port()?;
//!     stack.enter_directory(&name)?;
//!     stack.register(Box::new(OnExit::new(name, move |_: &mut Context| {
//!         tracing::info!(port, "stopping node");
//!         Ok(())
//!     })))?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod config;
mod directory;
mod error;
pub mod logging;
mod names;
mod ports;
mod relay;
mod scope;
mod wait;

pub use config::{HarnessConfig, HarnessConfigBuilder, DEFAULT_PORT_BEGIN, DEFAULT_PORT_END};
pub use directory::ScopedDirectory;
pub use error::{BoxError, HarnessError, Result, TeardownFailure};
pub use names::{NameRegistry, DEFAULT_BASE_NAME};
pub use ports::{is_port_free, PortAllocator, PortProbe, PortRange};
pub use relay::{FatalErrorRelay, RelayedError};
pub use scope::{
    Context, OnExit, Scope, ScopeId, ScopeStack, ScopeState, ScopedResource, TeardownResult,
};
pub use wait::{wait_for, wait_for_event, Event, DEFAULT_POLL_INTERVAL};
