//! Local mirror of the lock state of a session's wallets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Lock state of one wallet as seen through one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletState {
    /// Not opened in this session.
    Closed,
    /// Opened, keys not accessible.
    Locked,
    /// Opened, keys usable for signing.
    Unlocked,
}

impl fmt::Display for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Locked => write!(f, "locked"),
            Self::Unlocked => write!(f, "unlocked"),
        }
    }
}

/// Wallet as reported by `list_wallets` and `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    /// Wallet name.
    pub name: String,
    /// Whether the wallet is unlocked.
    pub unlocked: bool,
}

/// Per-session wallet states with the unlock timeout applied lazily.
///
/// The service locks every wallet of a session once `unlock_timeout` passed
/// without qualifying activity. The tracker reproduces that from the time of
/// the last activity instead of running a timer.
#[derive(Debug, Clone)]
pub struct WalletTracker {
    wallets: BTreeMap<String, WalletState>,
    unlock_timeout: Duration,
    last_activity: Instant,
}

impl WalletTracker {
    /// Create an empty tracker.
    pub fn new(unlock_timeout: Duration) -> Self {
        Self {
            wallets: BTreeMap::new(),
            unlock_timeout,
            last_activity: Instant::now(),
        }
    }

    /// Current unlock timeout.
    pub fn unlock_timeout(&self) -> Duration {
        self.unlock_timeout
    }

    /// Change the unlock timeout; counts as activity.
    pub fn set_unlock_timeout(&mut self, timeout: Duration) {
        self.expire(Instant::now());
        self.unlock_timeout = timeout;
        self.touch();
    }

    /// Record activity that resets the unlock timer.
    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    fn touch_at(&mut self, now: Instant) {
        self.expire(now);
        self.last_activity = now;
    }

    /// State of `name`; wallets never seen are `Closed`.
    pub fn state(&mut self, name: &str) -> WalletState {
        self.state_at(name, Instant::now())
    }

    fn state_at(&mut self, name: &str, now: Instant) -> WalletState {
        self.expire(now);
        self.wallets.get(name).copied().unwrap_or(WalletState::Closed)
    }

    /// Record a transition of `name` to `state`.
    pub fn set(&mut self, name: impl Into<String>, state: WalletState) {
        let name = name.into();
        self.expire(Instant::now());
        if state == WalletState::Closed {
            self.wallets.remove(&name);
        } else {
            self.wallets.insert(name, state);
        }
    }

    /// Lock every unlocked wallet.
    pub fn lock_all(&mut self) {
        for state in self.wallets.values_mut() {
            if *state == WalletState::Unlocked {
                *state = WalletState::Locked;
            }
        }
    }

    /// Forget every wallet.
    pub fn close_all(&mut self) {
        self.wallets.clear();
    }

    /// Replace the mirror with what the service reported.
    pub fn sync(&mut self, wallets: &[WalletInfo]) {
        self.wallets = wallets
            .iter()
            .map(|w| {
                let state = if w.unlocked {
                    WalletState::Unlocked
                } else {
                    WalletState::Locked
                };
                (w.name.clone(), state)
            })
            .collect();
    }

    /// Snapshot of all open wallets.
    pub fn snapshot(&mut self) -> BTreeMap<String, WalletState> {
        self.expire(Instant::now());
        self.wallets.clone()
    }

    fn expire(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_activity) >= self.unlock_timeout {
            let unlocked = self
                .wallets
                .values()
                .filter(|s| **s == WalletState::Unlocked)
                .count();
            if unlocked > 0 {
                tracing::debug!(unlocked, "Unlock timeout elapsed, locking wallets");
                self.lock_all();
            }
        }
    }
}
