//! Asynchronous push notifications sent by the Beekeeper service.
//!
//! The service POSTs notifications to the endpoint given with
//! `--notifications-endpoint`. A [`NotificationServer`] receives them, queues
//! them in arrival order and a single consumer task hands each one to every
//! registered [`NotificationHandler`].
//!
//! ```text
//!  beekeeper ──POST /──▶ axum router ──mpsc──▶ consumer task
//!                                                  │
//!                                   NotificationDispatcher::dispatch
//!                                      ├─▶ handler A (timeout)
//!                                      └─▶ handler B (timeout)
//! ```

use crate::error::{BeekeeperError, Result};
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Time a handler may spend on one notification before it is abandoned.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload of `status_changed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusChanged {
    /// Human-readable status, e.g. `beekeeper is ready`.
    pub current_status: String,
}

/// Payload of `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    /// Error description.
    pub message: String,
}

/// Payload of `attempt_of_closing_wallets`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptOfClosingWallets {
    /// Session whose wallets are about to be closed.
    pub token: String,
    /// Names of the wallets being closed.
    pub wallets: Vec<String>,
}

/// Payload of `opening_beekeeper_failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpeningBeekeeperFailed {
    /// Address the service tried to bind.
    pub address: String,
    /// Port the service tried to bind.
    pub port: u16,
    /// Reason reported by the service.
    pub message: String,
}

/// Payload of `webserver_listening`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebserverListening {
    /// Transport, `HTTP` for the JSON-RPC webserver.
    #[serde(rename = "type")]
    pub kind: String,
    /// Bound address.
    pub address: String,
    /// Bound port.
    pub port: u16,
}

/// A decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationKind {
    /// `status_changed`
    StatusChanged(StatusChanged),
    /// `error`
    Error(ErrorMessage),
    /// `attempt_of_closing_wallets`
    AttemptOfClosingWallets(AttemptOfClosingWallets),
    /// `opening_beekeeper_failed`
    OpeningBeekeeperFailed(OpeningBeekeeperFailed),
    /// `webserver_listening`
    WebserverListening(WebserverListening),
    /// Any other name, delivered as is.
    Unknown {
        /// Notification name.
        name: String,
        /// Raw payload.
        value: Value,
    },
}

impl NotificationKind {
    /// Wire name of the notification.
    pub fn name(&self) -> &str {
        match self {
            Self::StatusChanged(_) => "status_changed",
            Self::Error(_) => "error",
            Self::AttemptOfClosingWallets(_) => "attempt_of_closing_wallets",
            Self::OpeningBeekeeperFailed(_) => "opening_beekeeper_failed",
            Self::WebserverListening(_) => "webserver_listening",
            Self::Unknown { name, .. } => name,
        }
    }
}

/// A notification and the time it was received.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Decoded payload.
    pub kind: NotificationKind,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

impl Notification {
    /// Decode `{name, value}` or a JSON-RPC `{method, params: {name, value}}`
    /// envelope.
    pub fn from_json(body: &Value) -> Result<Self> {
        let message = body.get("params").filter(|p| p.is_object()).unwrap_or(body);
        let name = message
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BeekeeperError::InvalidResponse(format!("notification without name: {body}")))?;
        let value = message.get("value").cloned().unwrap_or(Value::Null);
        let payload = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value.clone()
        };

        let kind = match name {
            "status_changed" => NotificationKind::StatusChanged(serde_json::from_value(payload)?),
            "error" => NotificationKind::Error(serde_json::from_value(payload)?),
            "attempt_of_closing_wallets" => {
                NotificationKind::AttemptOfClosingWallets(serde_json::from_value(payload)?)
            }
            "opening_beekeeper_failed" => {
                NotificationKind::OpeningBeekeeperFailed(serde_json::from_value(payload)?)
            }
            "webserver_listening" => {
                NotificationKind::WebserverListening(serde_json::from_value(payload)?)
            }
            other => NotificationKind::Unknown {
                name: other.to_string(),
                value,
            },
        };
        Ok(Self {
            kind,
            received_at: Utc::now(),
        })
    }
}

/// Receives notifications from the dispatcher.
///
/// Implementations must return promptly: a handler that exceeds the
/// dispatcher's timeout is abandoned for that notification.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle one notification.
    async fn handle(&self, notification: &Notification);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> NotificationHandler for FnHandler<F>
where
    F: Fn(&Notification) + Send + Sync,
{
    async fn handle(&self, notification: &Notification) {
        (self.0)(notification)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(&Notification) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Fans notifications out to registered handlers.
pub struct NotificationDispatcher {
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
    handler_timeout: Duration,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("handlers", &self.read_handlers().len())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_TIMEOUT)
    }
}

impl NotificationDispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            handler_timeout,
        }
    }

    /// Add a handler; it receives every later notification.
    pub fn register(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Hand `notification` to every handler, in registration order.
    pub async fn dispatch(&self, notification: &Notification) {
        let handlers = self.read_handlers();
        tracing::debug!(
            notification = notification.kind.name(),
            handlers = handlers.len(),
            "Dispatching notification"
        );
        for (index, handler) in handlers.iter().enumerate() {
            if tokio::time::timeout(self.handler_timeout, handler.handle(notification))
                .await
                .is_err()
            {
                tracing::warn!(
                    notification = notification.kind.name(),
                    handler = index,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "Notification handler timed out"
                );
            }
        }
    }

    fn read_handlers(&self) -> Vec<Arc<dyn NotificationHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Build the router receiving notifications on `POST /`.
pub fn build_router(queue: mpsc::UnboundedSender<Notification>) -> Router {
    Router::new()
        .route("/", post(receive))
        .layer(TraceLayer::new_for_http())
        .with_state(queue)
}

async fn receive(
    State(queue): State<mpsc::UnboundedSender<Notification>>,
    Json(body): Json<Value>,
) -> StatusCode {
    match Notification::from_json(&body) {
        Ok(notification) => {
            tracing::trace!(notification = notification.kind.name(), "Notification received");
            if queue.send(notification).is_err() {
                tracing::debug!("Notification consumer stopped, dropping notification");
                return StatusCode::SERVICE_UNAVAILABLE;
            }
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Malformed notification");
            StatusCode::BAD_REQUEST
        }
    }
}

/// Listener for one Beekeeper's notifications.
#[derive(Debug)]
pub struct NotificationServer {
    address: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl NotificationServer {
    /// Bind `address` and start delivering notifications to `dispatcher`.
    pub async fn bind(address: SocketAddr, dispatcher: Arc<NotificationDispatcher>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        let (queue, mut pending) = mpsc::unbounded_channel::<Notification>();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let consumer = tokio::spawn(async move {
            while let Some(notification) = pending.recv().await {
                dispatcher.dispatch(&notification).await;
            }
            tracing::debug!("Notification consumer finished");
        });

        let router = build_router(queue);
        let server = tokio::spawn(async move {
            let stopped = async move {
                let _ = stopped.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stopped)
                .await
            {
                tracing::error!(error = %e, "Notification server error");
            }
        });

        tracing::info!(%address, "Notification server listening");
        Ok(Self {
            address,
            shutdown: Some(shutdown),
            tasks: Some((server, consumer)),
        })
    }

    /// Address the server is bound to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting notifications. Queued ones are still dispatched.
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            tracing::debug!(address = %self.address, "Notification server stopping");
        }
    }

    /// Stop and wait until every queued notification was dispatched.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some((server, consumer)) = self.tasks.take() {
            let _ = server.await;
            let _ = consumer.await;
        }
    }
}

impl Drop for NotificationServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[test]
    fn test_plain_notification() {
        let n = Notification::from_json(&json!({
            "name": "webserver_listening",
            "value": {"type": "HTTP", "address": "127.0.0.1", "port": 9000}
        }))
        .unwrap();
        assert_eq!(
            n.kind,
            NotificationKind::WebserverListening(WebserverListening {
                kind: "HTTP".into(),
                address: "127.0.0.1".into(),
                port: 9000,
            })
        );
    }

    #[test]
    fn test_envelope_notification() {
        let n = Notification::from_json(&json!({
            "jsonrpc": "2.0",
            "method": "notify",
            "params": {
                "name": "attempt_of_closing_wallets",
                "value": {"token": "t1", "wallets": ["alice", "bob"]}
            }
        }))
        .unwrap();
        match n.kind {
            NotificationKind::AttemptOfClosingWallets(payload) => {
                assert_eq!(payload.token, "t1");
                assert_eq!(payload.wallets, vec!["alice", "bob"]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_missing_value() {
        let n = Notification::from_json(&json!({"name": "hived_status", "value": {"x": 1}})).unwrap();
        assert_eq!(n.kind.name(), "hived_status");

        let n = Notification::from_json(&json!({"name": "status_changed"})).unwrap();
        assert_eq!(n.kind, NotificationKind::StatusChanged(StatusChanged::default()));

        assert!(Notification::from_json(&json!({"value": {}})).is_err());
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_others() {
        struct Stuck;

        #[async_trait]
        impl NotificationHandler for Stuck {
            async fn handle(&self, _: &Notification) {
                std::future::pending::<()>().await;
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(20));
        dispatcher.register(Arc::new(Stuck));
        let sink = Arc::clone(&seen);
        dispatcher.register(handler_fn(move |n| {
            sink.lock().unwrap().push(n.kind.name().to_string())
        }));

        for name in ["status_changed", "error"] {
            let n = Notification::from_json(&json!({"name": name, "value": {}})).unwrap();
            dispatcher.dispatch(&n).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["status_changed", "error"]);
    }

    #[tokio::test]
    async fn test_router_rejects_malformed_body() {
        let (queue, mut pending) = mpsc::unbounded_channel();
        let router = build_router(queue);

        let response = router
            .clone()
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"value": {}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name": "error", "value": {"message": "boom"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let n = pending.recv().await.unwrap();
        assert_eq!(
            n.kind,
            NotificationKind::Error(ErrorMessage { message: "boom".into() })
        );
    }
}
