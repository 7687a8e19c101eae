//! Wallet and session state of the service.
//!
//! Wallets live in `<wallet-dir>/<name>.wallet` as JSON holding a salted
//! password hash and the imported keys. Lock state is per session: a wallet
//! unlocked in one session stays locked in every other one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Extension of wallet files.
pub const WALLET_EXTENSION: &str = "wallet";

/// Errors returned to JSON-RPC callers.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("A session attached to token {0} not found")]
    UnknownToken(String),

    #[error("Name of wallet is incorrect: {0}")]
    InvalidWalletName(String),

    #[error("Wallet with name: '{0}' already exists")]
    WalletExists(String),

    #[error("Unable to open wallet file of: {0}")]
    WalletNotFound(String),

    #[error("Wallet not opened: {0}")]
    WalletNotOpened(String),

    #[error("Wallet is locked: {0}")]
    WalletLocked(String),

    #[error("Wallet is already unlocked: {0}")]
    AlreadyUnlocked(String),

    #[error("Invalid password for wallet: {0}")]
    InvalidPassword(String),

    #[error("You don't have any unlocked wallet")]
    NoUnlockedWallet,

    #[error("Public key {0} not found in unlocked wallets")]
    KeyNotFound(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Invalid digest, expected 64 hex characters: {0}")]
    InvalidDigest(String),

    #[error("wallet file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wallet file is corrupted: {0}")]
    Json(#[from] serde_json::Error),
}

pub type KeeperResult<T> = std::result::Result<T, KeeperError>;

/// On-disk wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalletFile {
    salt: String,
    password_hash: String,
    /// Public key to private key.
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

impl WalletFile {
    fn new(password: &str) -> Self {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let password_hash = hash(&[salt.as_str(), password]);
        Self {
            salt,
            password_hash,
            keys: BTreeMap::new(),
        }
    }

    fn accepts(&self, password: &str) -> bool {
        hash(&[self.salt.as_str(), password]) == self.password_hash
    }
}

/// Wallets of one session that were force-closed on shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    pub token: String,
    pub notifications_endpoint: Option<String>,
    pub wallets: Vec<String>,
}

#[derive(Debug)]
struct KeeperSession {
    notifications_endpoint: Option<String>,
    timeout: Duration,
    last_activity: Instant,
    /// Open wallets and whether each is unlocked.
    wallets: BTreeMap<String, bool>,
}

impl KeeperSession {
    fn expire(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_activity) >= self.timeout {
            for unlocked in self.wallets.values_mut() {
                *unlocked = false;
            }
        }
    }

    fn touch(&mut self, now: Instant) {
        self.expire(now);
        self.last_activity = now;
    }

    fn require_open(&self, name: &str) -> KeeperResult<bool> {
        self.wallets
            .get(name)
            .copied()
            .ok_or_else(|| KeeperError::WalletNotOpened(name.to_string()))
    }

    fn unlocked(&self) -> impl Iterator<Item = &str> {
        self.wallets
            .iter()
            .filter(|(_, unlocked)| **unlocked)
            .map(|(name, _)| name.as_str())
    }
}

/// Wallet listed by `list_wallets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedWallet {
    pub name: String,
    pub unlocked: bool,
}

/// State of the whole service.
#[derive(Debug)]
pub struct Keeper {
    wallet_dir: PathBuf,
    unlock_timeout: Duration,
    sessions: HashMap<String, KeeperSession>,
}

impl Keeper {
    pub fn new(wallet_dir: impl Into<PathBuf>, unlock_timeout: Duration) -> Self {
        Self {
            wallet_dir: wallet_dir.into(),
            unlock_timeout,
            sessions: HashMap::new(),
        }
    }

    pub fn wallet_dir(&self) -> &Path {
        &self.wallet_dir
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn create_session(&mut self, salt: &str, notifications_endpoint: Option<String>) -> String {
        let nonce = uuid::Uuid::new_v4().to_string();
        let token = hash(&[nonce.as_str(), salt]);
        self.sessions.insert(
            token.clone(),
            KeeperSession {
                notifications_endpoint,
                timeout: self.unlock_timeout,
                last_activity: Instant::now(),
                wallets: BTreeMap::new(),
            },
        );
        tracing::info!(token = %short(&token), "Session created");
        token
    }

    pub fn close_session(&mut self, token: &str) -> KeeperResult<()> {
        self.sessions
            .remove(token)
            .map(|_| tracing::info!(token = %short(token), "Session closed"))
            .ok_or_else(|| KeeperError::UnknownToken(short(token).to_string()))
    }

    /// Create a wallet, open and unlocked in `token`'s session.
    ///
    /// Returns the password, generated when `password` is `None`.
    pub fn create(&mut self, token: &str, name: &str, password: Option<&str>) -> KeeperResult<String> {
        validate_wallet_name(name)?;
        let path = self.wallet_path(name);
        if path.exists() {
            return Err(KeeperError::WalletExists(name.to_string()));
        }
        let session = self.session(token)?;
        let password = password.map_or_else(generate_password, str::to_string);
        write_wallet(&path, &WalletFile::new(&password))?;
        session.touch(Instant::now());
        session.wallets.insert(name.to_string(), true);
        tracing::info!(wallet = name, "Wallet created");
        Ok(password)
    }

    pub fn open(&mut self, token: &str, name: &str) -> KeeperResult<()> {
        validate_wallet_name(name)?;
        let exists = self.wallet_path(name).is_file();
        let session = self.session(token)?;
        if !exists {
            return Err(KeeperError::WalletNotFound(name.to_string()));
        }
        session.wallets.entry(name.to_string()).or_insert(false);
        Ok(())
    }

    pub fn close(&mut self, token: &str, name: &str) -> KeeperResult<()> {
        let session = self.session(token)?;
        session
            .wallets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KeeperError::WalletNotOpened(name.to_string()))
    }

    pub fn unlock(&mut self, token: &str, name: &str, password: &str) -> KeeperResult<()> {
        let file = self.read_wallet(name)?;
        let session = self.session(token)?;
        if session.require_open(name)? {
            return Err(KeeperError::AlreadyUnlocked(name.to_string()));
        }
        if !file.accepts(password) {
            tracing::debug!(wallet = name, "Wrong password");
            return Err(KeeperError::InvalidPassword(name.to_string()));
        }
        session.touch(Instant::now());
        session.wallets.insert(name.to_string(), true);
        Ok(())
    }

    pub fn lock(&mut self, token: &str, name: &str) -> KeeperResult<()> {
        let session = self.session(token)?;
        if !session.require_open(name)? {
            return Err(KeeperError::WalletLocked(name.to_string()));
        }
        session.wallets.insert(name.to_string(), false);
        Ok(())
    }

    pub fn lock_all(&mut self, token: &str) -> KeeperResult<()> {
        let session = self.session(token)?;
        for unlocked in session.wallets.values_mut() {
            *unlocked = false;
        }
        Ok(())
    }

    pub fn set_timeout(&mut self, token: &str, timeout: Duration) -> KeeperResult<()> {
        let session = self.session(token)?;
        session.timeout = timeout;
        session.touch(Instant::now());
        Ok(())
    }

    pub fn list_wallets(&mut self, token: &str) -> KeeperResult<Vec<ListedWallet>> {
        let session = self.session(token)?;
        Ok(session
            .wallets
            .iter()
            .map(|(name, unlocked)| ListedWallet {
                name: name.clone(),
                unlocked: *unlocked,
            })
            .collect())
    }

    /// Time left until the session's wallets lock.
    pub fn remaining_unlock_time(&mut self, token: &str) -> KeeperResult<Duration> {
        let session = self.session(token)?;
        Ok(session
            .timeout
            .saturating_sub(session.last_activity.elapsed()))
    }

    pub fn import_key(&mut self, token: &str, name: &str, wif_key: &str) -> KeeperResult<String> {
        if wif_key.is_empty() || !wif_key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(KeeperError::InvalidKey(wif_key.to_string()));
        }
        let path = self.wallet_path(name);
        let session = self.session(token)?;
        if !session.require_open(name)? {
            return Err(KeeperError::WalletLocked(name.to_string()));
        }
        session.touch(Instant::now());

        let mut file = read_wallet_file(&path, name)?;
        let public_key = public_key_of(wif_key);
        file.keys.insert(public_key.clone(), wif_key.to_string());
        write_wallet(&path, &file)?;
        tracing::debug!(wallet = name, public_key = %public_key, "Key imported");
        Ok(public_key)
    }

    pub fn get_public_keys(&mut self, token: &str, name: Option<&str>) -> KeeperResult<Vec<String>> {
        let wallet_dir = self.wallet_dir.clone();
        let session = self.session(token)?;
        let wallets: Vec<String> = match name {
            Some(name) => {
                if !session.require_open(name)? {
                    return Err(KeeperError::WalletLocked(name.to_string()));
                }
                vec![name.to_string()]
            }
            None => session.unlocked().map(str::to_string).collect(),
        };
        if wallets.is_empty() {
            return Err(KeeperError::NoUnlockedWallet);
        }
        session.touch(Instant::now());

        let mut keys = Vec::new();
        for wallet in &wallets {
            let file = read_wallet_file(&wallet_path_in(&wallet_dir, wallet), wallet)?;
            keys.extend(file.keys.into_keys());
        }
        Ok(keys)
    }

    pub fn sign_digest(&mut self, token: &str, sig_digest: &str, public_key: &str) -> KeeperResult<String> {
        if sig_digest.len() != 64 || hex::decode(sig_digest).is_err() {
            return Err(KeeperError::InvalidDigest(sig_digest.to_string()));
        }
        let wallet_dir = self.wallet_dir.clone();
        let session = self.session(token)?;
        let unlocked: Vec<String> = session.unlocked().map(str::to_string).collect();
        if unlocked.is_empty() {
            return Err(KeeperError::NoUnlockedWallet);
        }
        session.touch(Instant::now());

        for wallet in &unlocked {
            let file = read_wallet_file(&wallet_path_in(&wallet_dir, wallet), wallet)?;
            if let Some(private_key) = file.keys.get(public_key) {
                return Ok(hash(&[private_key.as_str(), sig_digest]));
            }
        }
        Err(KeeperError::KeyNotFound(public_key.to_string()))
    }

    /// Forget every session, reporting what each had open.
    pub fn close_all_sessions(&mut self) -> Vec<ClosedSession> {
        let mut closed: Vec<ClosedSession> = self
            .sessions
            .drain()
            .map(|(token, session)| ClosedSession {
                token,
                notifications_endpoint: session.notifications_endpoint,
                wallets: session.wallets.into_keys().collect(),
            })
            .collect();
        closed.sort_by(|a, b| a.token.cmp(&b.token));
        closed
    }

    /// Session of `token`, with its unlock timeout applied.
    fn session(&mut self, token: &str) -> KeeperResult<&mut KeeperSession> {
        let session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| KeeperError::UnknownToken(short(token).to_string()))?;
        session.expire(Instant::now());
        Ok(session)
    }

    fn wallet_path(&self, name: &str) -> PathBuf {
        wallet_path_in(&self.wallet_dir, name)
    }

    fn read_wallet(&self, name: &str) -> KeeperResult<WalletFile> {
        validate_wallet_name(name)?;
        read_wallet_file(&self.wallet_path(name), name)
    }
}

fn wallet_path_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{WALLET_EXTENSION}"))
}

fn read_wallet_file(path: &Path, name: &str) -> KeeperResult<WalletFile> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(KeeperError::WalletNotFound(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn write_wallet(path: &Path, file: &WalletFile) -> KeeperResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(file)?)?;
    Ok(())
}

fn validate_wallet_name(name: &str) -> KeeperResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(KeeperError::InvalidWalletName(name.to_string()))
    }
}

fn generate_password() -> String {
    let nonce = uuid::Uuid::new_v4().to_string();
    format!("PW{}", hash(&[nonce.as_str()]))
}

fn public_key_of(private_key: &str) -> String {
    let digest = hash(&["public", private_key]);
    format!("STM{}", &digest[..50])
}

/// Hex SHA-256 of the concatenated parts.
fn hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// First eight characters of `token`, for logs and error messages.
fn short(token: &str) -> &str {
    token
        .char_indices()
        .nth(8)
        .map_or(token, |(end, _)| &token[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper() -> (tempfile::TempDir, Keeper) {
        let dir = tempfile::tempdir().unwrap();
        let keeper = Keeper::new(dir.path(), Duration::from_secs(900));
        (dir, keeper)
    }

    #[test]
    fn test_tokens_are_distinct() {
        let (_dir, mut keeper) = keeper();
        let a = keeper.create_session("salt", None);
        let b = keeper.create_session("salt", None);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        keeper.close_session(&a).unwrap();
        assert!(keeper.list_wallets(&b).unwrap().is_empty());
        assert!(matches!(keeper.list_wallets(&a), Err(KeeperError::UnknownToken(_))));
    }

    #[test]
    fn test_unknown_multibyte_token() {
        let (_dir, mut keeper) = keeper();
        match keeper.close_session("aéééé-token") {
            Err(KeeperError::UnknownToken(shown)) => assert_eq!(shown, "aéééé-to"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            keeper.list_wallets("ééééééééé"),
            Err(KeeperError::UnknownToken(_))
        ));
    }

    #[test]
    fn test_create_generates_password_and_persists() {
        let (dir, mut keeper) = keeper();
        let token = keeper.create_session("s", None);
        let password = keeper.create(&token, "alice", None).unwrap();
        assert!(password.starts_with("PW"));
        assert!(dir.path().join("alice.wallet").is_file());
        assert!(matches!(
            keeper.create(&token, "alice", Some("x")),
            Err(KeeperError::WalletExists(_))
        ));
        assert_eq!(
            keeper.list_wallets(&token).unwrap(),
            vec![ListedWallet { name: "alice".into(), unlocked: true }]
        );
    }

    #[test]
    fn test_lock_state_is_per_session() {
        let (_dir, mut keeper) = keeper();
        let first = keeper.create_session("a", None);
        let second = keeper.create_session("b", None);
        keeper.create(&first, "w", Some("secret")).unwrap();

        keeper.open(&second, "w").unwrap();
        assert!(!keeper.list_wallets(&second).unwrap()[0].unlocked);
        assert!(matches!(
            keeper.unlock(&second, "w", "wrong"),
            Err(KeeperError::InvalidPassword(_))
        ));
        keeper.unlock(&second, "w", "secret").unwrap();
        assert!(matches!(
            keeper.unlock(&second, "w", "secret"),
            Err(KeeperError::AlreadyUnlocked(_))
        ));

        keeper.lock(&first, "w").unwrap();
        assert!(keeper.list_wallets(&second).unwrap()[0].unlocked);
    }

    #[test]
    fn test_zero_timeout_locks_on_next_call() {
        let (_dir, mut keeper) = keeper();
        let token = keeper.create_session("s", None);
        keeper.create(&token, "w", Some("pw")).unwrap();
        keeper.set_timeout(&token, Duration::ZERO).unwrap();
        assert!(!keeper.list_wallets(&token).unwrap()[0].unlocked);
    }

    #[test]
    fn test_import_and_sign() {
        let (_dir, mut keeper) = keeper();
        let token = keeper.create_session("s", None);
        keeper.create(&token, "w", Some("pw")).unwrap();
        let public_key = keeper.import_key(&token, "w", "5KQwrPbwdL6PhXujxW37FSSQZ1JiwsST4cqQzDeyXtP79zkvFD3").unwrap();
        assert!(public_key.starts_with("STM"));
        assert_eq!(keeper.get_public_keys(&token, None).unwrap(), vec![public_key.clone()]);

        let digest = "9b29ba0710af3918e81d7b935556d7ab205d8a8f5ca2e2427535980c2e8bdaff";
        let signature = keeper.sign_digest(&token, digest, &public_key).unwrap();
        assert_eq!(signature, keeper.sign_digest(&token, digest, &public_key).unwrap());
        assert!(matches!(
            keeper.sign_digest(&token, "abc", &public_key),
            Err(KeeperError::InvalidDigest(_))
        ));

        keeper.lock_all(&token).unwrap();
        assert!(matches!(
            keeper.get_public_keys(&token, None),
            Err(KeeperError::NoUnlockedWallet)
        ));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let (_dir, mut keeper) = keeper();
        let token = keeper.create_session("s", None);
        for name in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                keeper.create(&token, name, None),
                Err(KeeperError::InvalidWalletName(_))
            ));
        }
    }

    #[test]
    fn test_close_all_sessions_reports_open_wallets() {
        let (_dir, mut keeper) = keeper();
        let token = keeper.create_session("s", Some("127.0.0.1:1".into()));
        keeper.create(&token, "a", Some("pw")).unwrap();
        keeper.create(&token, "b", Some("pw")).unwrap();
        let closed = keeper.close_all_sessions();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].wallets, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(closed[0].notifications_endpoint.as_deref(), Some("127.0.0.1:1"));
        assert_eq!(keeper.session_count(), 0);
    }
}
