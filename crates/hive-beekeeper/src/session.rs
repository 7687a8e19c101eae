//! Sessions: the unit against which wallet operations are authorized.

use crate::error::{BeekeeperError, Result};
use crate::handle::HandleShared;
use crate::wallet::{WalletInfo, WalletState, WalletTracker};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Session state shared with the owning handle.
#[derive(Debug)]
pub(crate) struct SessionShared {
    token: String,
    tracker: Mutex<WalletTracker>,
    invalidated: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(token: String, unlock_timeout: Duration) -> Self {
        Self {
            token,
            tracker: Mutex::new(WalletTracker::new(unlock_timeout)),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Token prefix safe to log.
    pub(crate) fn short_token(&self) -> &str {
        self.token
            .char_indices()
            .nth(8)
            .map_or(self.token.as_str(), |(end, _)| &self.token[..end])
    }

    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    /// Record wallets the service force-closed.
    pub(crate) fn mark_closed(&self, wallets: &[String]) {
        let mut tracker = self.lock_tracker();
        for wallet in wallets {
            tracker.set(wallet.as_str(), WalletState::Closed);
        }
    }

    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, WalletTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timing information reported by `get_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Service clock.
    pub now: String,
    /// Time at which unlocked wallets lock again.
    pub timeout_time: String,
}

/// A session on a Beekeeper service.
///
/// Cheap to clone; clones share the token and the wallet mirror.
#[derive(Clone)]
pub struct Session {
    handle: Arc<HandleShared>,
    shared: Arc<SessionShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("beekeeper", &self.handle.name())
            .field("token", &self.shared.short_token())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(handle: Arc<HandleShared>, shared: Arc<SessionShared>) -> Self {
        Self { handle, shared }
    }

    /// Opaque session token.
    pub fn token(&self) -> &str {
        &self.shared.token
    }

    /// False once the session or its handle was closed.
    pub fn is_valid(&self) -> bool {
        self.ensure_valid().is_ok()
    }

    fn describe(&self) -> String {
        format!("session {} of {}", self.shared.short_token(), self.handle.name())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.shared.invalidated.load(Ordering::SeqCst) {
            return Err(BeekeeperError::Invalidated(self.describe()));
        }
        self.handle.ensure_valid(&self.describe())
    }

    async fn call<R>(&self, method: &str, params: serde_json::Value) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        self.ensure_valid()?;
        self.handle.call(&self.describe(), method, params).await
    }

    /// Create a wallet, unlocked in this session.
    ///
    /// Without `password` the service generates one; it is returned here
    /// and cannot be retrieved later.
    pub async fn create_wallet(
        &self,
        name: &str,
        password: Option<&str>,
    ) -> Result<(WalletInfo, Option<String>)> {
        let mut params = json!({"token": self.token(), "wallet_name": name});
        if let Some(password) = password {
            params["password"] = json!(password);
        }
        let response: CreateResponse = self.call("create", params).await?;
        {
            let mut tracker = self.shared.lock_tracker();
            tracker.touch();
            tracker.set(name, WalletState::Unlocked);
        }
        tracing::info!(session = %self.shared.short_token(), wallet = name, "Wallet created");
        let generated = password.is_none().then_some(response.password);
        Ok((
            WalletInfo {
                name: name.to_string(),
                unlocked: true,
            },
            generated,
        ))
    }

    /// Open `name`: `Closed → Locked`.
    pub async fn open_wallet(&self, name: &str) -> Result<()> {
        let _: Empty = self
            .call("open", json!({"token": self.token(), "wallet_name": name}))
            .await?;
        let mut tracker = self.shared.lock_tracker();
        if tracker.state(name) == WalletState::Closed {
            tracker.set(name, WalletState::Locked);
        }
        Ok(())
    }

    /// Close `name` in this session.
    pub async fn close_wallet(&self, name: &str) -> Result<()> {
        let _: Empty = self
            .call("close", json!({"token": self.token(), "wallet_name": name}))
            .await?;
        self.shared.lock_tracker().set(name, WalletState::Closed);
        Ok(())
    }

    /// Unlock `name`: `Locked → Unlocked`.
    ///
    /// # Errors
    ///
    /// [`BeekeeperError::InvalidPassword`] on a wrong password; the wallet
    /// state is left unchanged.
    pub async fn unlock(&self, name: &str, password: &str) -> Result<()> {
        let result: Result<Empty> = self
            .call(
                "unlock",
                json!({"token": self.token(), "wallet_name": name, "password": password}),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!(session = %self.shared.short_token(), wallet = name, error = %e, "Unlock failed");
            return Err(e);
        }
        let mut tracker = self.shared.lock_tracker();
        tracker.touch();
        tracker.set(name, WalletState::Unlocked);
        Ok(())
    }

    /// Lock `name`: `Unlocked → Locked`.
    pub async fn lock(&self, name: &str) -> Result<()> {
        let _: Empty = self
            .call("lock", json!({"token": self.token(), "wallet_name": name}))
            .await?;
        self.shared.lock_tracker().set(name, WalletState::Locked);
        Ok(())
    }

    /// Lock every wallet of this session.
    pub async fn lock_all(&self) -> Result<()> {
        let _: Empty = self.call("lock_all", json!({"token": self.token()})).await?;
        self.shared.lock_tracker().lock_all();
        Ok(())
    }

    /// Change how long wallets stay unlocked without activity.
    pub async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let _: Empty = self
            .call(
                "set_timeout",
                json!({"token": self.token(), "seconds": timeout.as_secs()}),
            )
            .await?;
        self.shared.lock_tracker().set_unlock_timeout(timeout);
        Ok(())
    }

    /// Wallets open in this session, as reported by the service.
    ///
    /// The local mirror is replaced with the answer.
    pub async fn list_wallets(&self) -> Result<Vec<WalletInfo>> {
        let response: ListWalletsResponse = self
            .call("list_wallets", json!({"token": self.token()}))
            .await?;
        self.shared.lock_tracker().sync(&response.wallets);
        Ok(response.wallets)
    }

    /// Service clock and unlock deadline of this session.
    pub async fn get_info(&self) -> Result<SessionInfo> {
        self.call("get_info", json!({"token": self.token()})).await
    }

    /// Import a private key into `wallet`, returning its public key.
    pub async fn import_key(&self, wallet: &str, wif_key: &str) -> Result<String> {
        let response: PublicKeyResponse = self
            .call(
                "import_key",
                json!({"token": self.token(), "wallet_name": wallet, "wif_key": wif_key}),
            )
            .await?;
        self.shared.lock_tracker().touch();
        Ok(response.public_key)
    }

    /// Public keys of every unlocked wallet, or of `wallet` only.
    pub async fn get_public_keys(&self, wallet: Option<&str>) -> Result<Vec<String>> {
        let mut params = json!({"token": self.token()});
        if let Some(wallet) = wallet {
            params["wallet_name"] = json!(wallet);
        }
        let response: PublicKeysResponse = self.call("get_public_keys", params).await?;
        self.shared.lock_tracker().touch();
        Ok(response.keys.into_iter().map(|k| k.public_key).collect())
    }

    /// Sign `sig_digest` (hex) with the private key of `public_key`.
    pub async fn sign_digest(&self, sig_digest: &str, public_key: &str) -> Result<String> {
        let response: SignatureResponse = self
            .call(
                "sign_digest",
                json!({"token": self.token(), "sig_digest": sig_digest, "public_key": public_key}),
            )
            .await?;
        self.shared.lock_tracker().touch();
        Ok(response.signature)
    }

    /// Locally tracked state of `name`, with the unlock timeout applied.
    pub fn wallet_state(&self, name: &str) -> Result<WalletState> {
        self.ensure_valid()?;
        Ok(self.shared.lock_tracker().state(name))
    }

    /// Locally tracked state of every open wallet.
    pub fn wallet_states(&self) -> Result<BTreeMap<String, WalletState>> {
        self.ensure_valid()?;
        Ok(self.shared.lock_tracker().snapshot())
    }

    /// Invalidate the token; other sessions are unaffected.
    pub async fn close_session(&self) -> Result<()> {
        let _: Empty = self
            .call("close_session", json!({"token": self.token()}))
            .await?;
        self.shared.invalidate();
        self.shared.lock_tracker().close_all();
        self.handle.forget_session(self.token());
        tracing::info!(session = %self.shared.short_token(), "Session closed");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    password: String,
}

#[derive(Debug, Deserialize)]
struct ListWalletsResponse {
    wallets: Vec<WalletInfo>,
}

#[derive(Debug, Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct PublicKeysResponse {
    keys: Vec<PublicKeyResponse>,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    signature: String,
}
