//! The Beekeeper handle: a launched or attached service and its sessions.
//!
//! Closing a handle stops the process it launched (if any) and invalidates
//! every session created from it. Operations on invalidated sessions fail
//! with [`BeekeeperError::Invalidated`]; calls already in flight are
//! abandoned instead of hanging.

use crate::client::RpcClient;
use crate::error::{BeekeeperError, Result};
use crate::notifications::{
    Notification, NotificationDispatcher, NotificationHandler, NotificationKind,
    NotificationServer, OpeningBeekeeperFailed, WebserverListening,
};
use crate::packed::PackedBeekeeper;
use crate::process::BeekeeperProcess;
use crate::session::{Session, SessionShared};
use crate::settings::BeekeeperSettings;
use async_trait::async_trait;
use hive_harness::{wait_for, Context, Event, FatalErrorRelay, ScopedResource, TeardownResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Interval at which startup progress is checked.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of stderr attached to startup failures.
const STDERR_TAIL_LINES: usize = 20;

/// Notifications kept by a handle; older ones are dropped first.
const RECEIVED_CAPACITY: usize = 1024;

/// What a handle owns and releases on close.
#[derive(Debug, Default)]
struct Owned {
    process: Option<BeekeeperProcess>,
    notifications: Option<NotificationServer>,
}

/// State shared by a handle, its sessions and its scope guard.
#[derive(Debug)]
pub(crate) struct HandleShared {
    name: String,
    client: RpcClient,
    settings: BeekeeperSettings,
    notification_endpoint: Option<SocketAddr>,
    closed: watch::Sender<bool>,
    sessions: Mutex<HashMap<String, Arc<SessionShared>>>,
    received: Mutex<VecDeque<Notification>>,
    owned: Mutex<Owned>,
    guard_taken: AtomicBool,
}

impl HandleShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn unlock_timeout(&self) -> Duration {
        self.settings.unlock_timeout
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fail with [`BeekeeperError::Invalidated`] naming `what` once closed.
    pub(crate) fn ensure_valid(&self, what: &str) -> Result<()> {
        if self.is_closed() {
            return Err(BeekeeperError::Invalidated(what.to_string()));
        }
        Ok(())
    }

    /// Issue an RPC that is abandoned as soon as the handle closes.
    pub(crate) async fn call<P, R>(&self, what: &str, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.ensure_valid(what)?;
        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = self.client.call(method, params) => result,
            _ = closed.wait_for(|closed| *closed) => {
                tracing::debug!(name = %self.name, method, "Call abandoned, handle closed");
                Err(BeekeeperError::Invalidated(what.to_string()))
            }
        }
    }

    pub(crate) fn forget_session(&self, token: &str) {
        self.lock_sessions().remove(token);
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionShared>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invalidate every session, then stop the owned process and listener.
    ///
    /// The listener outlives the process so the force-close notifications
    /// sent on shutdown are still received.
    fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let sessions: Vec<_> = self.lock_sessions().values().cloned().collect();
        tracing::info!(name = %self.name, sessions = sessions.len(), "Closing beekeeper handle");
        for session in &sessions {
            session.invalidate();
        }

        let mut owned = std::mem::take(&mut *self.owned.lock().unwrap_or_else(PoisonError::into_inner));
        let stopped = match owned.process.as_mut() {
            Some(process) => blocking(|| process.stop()),
            None => Ok(()),
        };
        if let Some(notifications) = owned.notifications.as_mut() {
            notifications.shutdown();
        }
        stopped
    }

    fn record(&self, notification: &Notification) {
        let mut received = self.received.lock().unwrap_or_else(PoisonError::into_inner);
        if received.len() == RECEIVED_CAPACITY {
            received.pop_front();
        }
        received.push_back(notification.clone());
    }
}

/// Run blocking `f` without stalling the other tasks of a multi-threaded
/// runtime.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Records startup notifications and wakes the launcher.
#[derive(Debug)]
struct StartupWatch {
    event: Event,
    outcome: Mutex<Option<StartupOutcome>>,
}

#[derive(Debug, Clone)]
enum StartupOutcome {
    Listening(WebserverListening),
    Failed(OpeningBeekeeperFailed),
}

impl StartupWatch {
    fn new() -> Self {
        Self {
            event: Event::new("beekeeper startup"),
            outcome: Mutex::new(None),
        }
    }

    fn outcome(&self) -> Option<StartupOutcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl NotificationHandler for StartupWatch {
    async fn handle(&self, notification: &Notification) {
        let outcome = match &notification.kind {
            NotificationKind::WebserverListening(listening) if listening.kind == "HTTP" => {
                StartupOutcome::Listening(listening.clone())
            }
            NotificationKind::OpeningBeekeeperFailed(failed) => StartupOutcome::Failed(failed.clone()),
            _ => return,
        };
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
            self.event.set();
        }
    }
}

/// Keeps the session mirrors and the notification log of a handle current.
struct HandleNotifications {
    shared: Weak<HandleShared>,
}

#[async_trait]
impl NotificationHandler for HandleNotifications {
    async fn handle(&self, notification: &Notification) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match &notification.kind {
            NotificationKind::AttemptOfClosingWallets(closing) => {
                let session = shared.lock_sessions().get(&closing.token).cloned();
                match session {
                    Some(session) => {
                        tracing::info!(
                            name = %shared.name,
                            wallets = ?closing.wallets,
                            "Wallets force-closed by beekeeper"
                        );
                        session.mark_closed(&closing.wallets);
                    }
                    None => tracing::debug!(name = %shared.name, "Force-close for unknown session"),
                }
            }
            NotificationKind::Error(error) => {
                tracing::warn!(name = %shared.name, message = %error.message, "Beekeeper reported an error");
            }
            NotificationKind::StatusChanged(status) => {
                tracing::debug!(name = %shared.name, status = %status.current_status, "Beekeeper status changed");
            }
            _ => {}
        }
        shared.record(notification);
    }
}

/// Scope registrant that closes its handle on teardown.
#[derive(Debug)]
pub struct BeekeeperGuard {
    shared: Arc<HandleShared>,
}

impl ScopedResource for BeekeeperGuard {
    fn name(&self) -> String {
        self.shared.name.clone()
    }

    fn tear_down(&mut self, _context: &mut Context) -> TeardownResult {
        self.shared.close()?;
        Ok(())
    }
}

/// A Beekeeper service this process talks to.
#[derive(Debug)]
pub struct Beekeeper {
    shared: Arc<HandleShared>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl Beekeeper {
    /// Start the executable from `settings` and wait until its webserver
    /// listens.
    ///
    /// The notification listener is bound first and its address passed to
    /// the process. Startup completes on `webserver_listening`; it fails on
    /// `opening_beekeeper_failed`, on process exit, or after
    /// `settings.startup_timeout`.
    pub async fn launch(settings: BeekeeperSettings) -> Result<Self> {
        let dispatcher = Arc::new(NotificationDispatcher::default());
        let startup = Arc::new(StartupWatch::new());
        dispatcher.register(Arc::clone(&startup) as Arc<dyn NotificationHandler>);

        let notifications =
            NotificationServer::bind(settings.notification_endpoint, Arc::clone(&dispatcher)).await?;
        let settings = BeekeeperSettings {
            notification_endpoint: notifications.address(),
            ..settings
        };
        let started = Instant::now();
        let process = BeekeeperProcess::spawn(&settings)?;

        let timeout = settings.startup_timeout;
        let watch = Arc::clone(&startup);
        let (mut process, waited) = tokio::task::spawn_blocking(move || {
            let waited = wait_for(
                "beekeeper startup",
                || watch.event.is_set() || !process.is_running(),
                Some(timeout),
                STARTUP_POLL_INTERVAL,
            );
            (process, waited)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

        let endpoint = match (startup.outcome(), waited) {
            (Some(StartupOutcome::Listening(listening)), _) => listening_address(&listening)?,
            (outcome, waited) => {
                let reason = match (outcome, waited) {
                    (Some(StartupOutcome::Failed(failed)), _) => format!(
                        "opening_beekeeper_failed on {}:{}: {}",
                        failed.address, failed.port, failed.message
                    ),
                    (_, Err(e)) => e.to_string(),
                    _ => match process.exit_status()? {
                        Some(status) => format!("process exited with {status}"),
                        None => "no webserver_listening notification".to_string(),
                    },
                };
                let stderr_tail = process.stderr_tail(STDERR_TAIL_LINES);
                if let Err(e) = blocking(|| process.stop()) {
                    tracing::warn!(name = %settings.name, error = %e, "Failed to stop beekeeper after startup failure");
                }
                tracing::error!(name = %settings.name, reason = %reason, "Beekeeper failed to start");
                return Err(BeekeeperError::StartupFailed { reason, stderr_tail });
            }
        };

        let relay = FatalErrorRelay::global();
        process.watch_exit(relay)?;
        tracing::info!(
            name = %settings.name,
            pid = process.pid(),
            %endpoint,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Beekeeper started"
        );

        let notification_endpoint = Some(notifications.address());
        let owned = Owned {
            process: Some(process),
            notifications: Some(notifications),
        };
        Self::from_parts(endpoint, settings, notification_endpoint, owned, dispatcher)
    }

    /// Talk to an already running service at `endpoint`.
    ///
    /// No process is owned and no notifications are received; closing the
    /// handle only invalidates its sessions.
    pub fn attach(endpoint: SocketAddr) -> Result<Self> {
        Self::attach_with(endpoint, BeekeeperSettings::default())
    }

    /// Like [`attach`](Self::attach) with explicit timeouts and name.
    pub fn attach_with(endpoint: SocketAddr, settings: BeekeeperSettings) -> Result<Self> {
        tracing::info!(name = %settings.name, %endpoint, "Attaching to beekeeper");
        let settings = BeekeeperSettings {
            http_endpoint: endpoint,
            ..settings
        };
        Self::from_parts(
            endpoint,
            settings,
            None,
            Owned::default(),
            Arc::new(NotificationDispatcher::default()),
        )
    }

    fn from_parts(
        endpoint: SocketAddr,
        settings: BeekeeperSettings,
        notification_endpoint: Option<SocketAddr>,
        owned: Owned,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Result<Self> {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(HandleShared {
            name: settings.name.clone(),
            client: RpcClient::new(endpoint, settings.rpc_timeout)?,
            settings: BeekeeperSettings {
                http_endpoint: endpoint,
                ..settings
            },
            notification_endpoint,
            closed,
            sessions: Mutex::new(HashMap::new()),
            received: Mutex::new(VecDeque::new()),
            owned: Mutex::new(owned),
            guard_taken: AtomicBool::new(false),
        });
        dispatcher.register(Arc::new(HandleNotifications {
            shared: Arc::downgrade(&shared),
        }));
        Ok(Self { shared, dispatcher })
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Address of the JSON-RPC webserver.
    pub fn http_endpoint(&self) -> SocketAddr {
        self.shared.client.endpoint()
    }

    /// Address of the notification listener, for launched handles.
    pub fn notification_endpoint(&self) -> Option<SocketAddr> {
        self.shared.notification_endpoint
    }

    /// Settings the handle was created with.
    pub fn settings(&self) -> &BeekeeperSettings {
        &self.shared.settings
    }

    /// Process id, for launched handles that are still open.
    pub fn pid(&self) -> Option<u32> {
        self.lock_owned().process.as_ref().map(BeekeeperProcess::pid)
    }

    /// Whether [`close`](Self::close) ran.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether the launched process wrote `pattern` to stderr.
    pub fn stderr_contains(&self, pattern: &str) -> Result<bool> {
        self.shared.ensure_valid(&self.shared.name)?;
        match self.lock_owned().process.as_ref() {
            Some(process) => process.stderr_contains(pattern),
            None => Ok(false),
        }
    }

    /// Register an additional notification handler.
    pub fn subscribe(&self, handler: Arc<dyn NotificationHandler>) {
        self.dispatcher.register(handler);
    }

    /// Notifications received so far, oldest first.
    ///
    /// Only the most recent 1024 are kept.
    pub fn notifications(&self) -> Vec<Notification> {
        self.shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Open a session with a fresh token.
    ///
    /// `salt` defaults to a random value.
    pub async fn create_session(&self, salt: Option<&str>) -> Result<Session> {
        let salt = salt.map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
        let params = serde_json::json!({
            "salt": salt,
            "notifications_endpoint": self.shared.notification_endpoint.map(|e| e.to_string()),
        });
        let response: CreateSessionResponse = self
            .shared
            .call(&self.shared.name, "create_session", params)
            .await?;

        let session = Arc::new(SessionShared::new(
            response.token.clone(),
            self.shared.unlock_timeout(),
        ));
        self.shared
            .lock_sessions()
            .insert(response.token, Arc::clone(&session));
        tracing::info!(name = %self.shared.name, session = %session.short_token(), "Session created");
        Ok(Session::new(Arc::clone(&self.shared), session))
    }

    /// Connection descriptor another process can [`unpack`](PackedBeekeeper::unpack).
    pub fn pack(&self) -> Result<PackedBeekeeper> {
        self.shared.ensure_valid(&self.shared.name)?;
        Ok(PackedBeekeeper::from_settings(&self.shared.settings))
    }

    /// The scope registrant closing this handle.
    ///
    /// # Errors
    ///
    /// [`BeekeeperError::Invalidated`] if the guard was already taken.
    pub fn scoped_guard(&self) -> Result<BeekeeperGuard> {
        if self.shared.guard_taken.swap(true, Ordering::SeqCst) {
            return Err(BeekeeperError::Invalidated(format!(
                "scope guard of {}",
                self.shared.name
            )));
        }
        Ok(BeekeeperGuard {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop the launched process and invalidate every session.
    ///
    /// Blocks until the process has exited, which takes as long as the
    /// service needs to close its wallets (SIGKILL follows after a few
    /// seconds). Dropping the handle closes it the same way.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    fn lock_owned(&self) -> std::sync::MutexGuard<'_, Owned> {
        self.shared.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Beekeeper {
    fn drop(&mut self) {
        if let Err(e) = self.shared.close() {
            tracing::error!(name = %self.shared.name, error = %e, "Failed to close beekeeper");
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct CreateSessionResponse {
    token: String,
}

fn listening_address(listening: &WebserverListening) -> Result<SocketAddr> {
    let ip: IpAddr = listening.address.parse().map_err(|_| {
        BeekeeperError::InvalidResponse(format!("bad webserver address '{}'", listening.address))
    })?;
    let ip = if ip.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ip
    };
    Ok(SocketAddr::new(ip, listening.port))
}
