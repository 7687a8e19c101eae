//! HTTP transport of the service.
//!
//! ## Endpoints
//!
//! - `POST /` - JSON-RPC requests (`beekeeper_api.*`)

use crate::config::StubConfig;
use crate::handler::{handle_request, AppState};
use crate::keeper::Keeper;
use crate::notify::Notifier;
use crate::protocol::{error_codes, Request, Response};
use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// File receiving request/response pairs with `--log-json-rpc`.
pub const JSON_RPC_LOG: &str = "json_rpc.log";

/// Errors starting the service.
#[derive(Debug, Error)]
pub enum StubError {
    /// The webserver endpoint could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends every exchange to `json_rpc.log`.
#[derive(Debug)]
struct RpcLog {
    file: Mutex<File>,
}

impl RpcLog {
    fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(JSON_RPC_LOG))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn record(&self, request: &str, response: &str) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{request}\n{response}") {
            tracing::warn!(error = %e, "Failed to write JSON-RPC log");
        }
    }
}

#[derive(Debug, Clone)]
struct App {
    state: Arc<AppState>,
    rpc_log: Option<Arc<RpcLog>>,
}

/// Build the JSON-RPC router.
fn build_router(app: App) -> Router {
    Router::new()
        .route("/", post(rpc_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn rpc_handler(State(app): State<App>, body: String) -> Json<Value> {
    let response = match serde_json::from_str::<Request>(&body) {
        Ok(request) => handle_request(&app.state, request).await,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse request");
            Response::error(Value::Null, error_codes::PARSE_ERROR, format!("parse error: {e}"))
        }
    };
    let response = serde_json::to_value(&response).unwrap_or_else(|e| {
        json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": {"code": error_codes::PARSE_ERROR, "message": e.to_string()},
        })
    });
    if let Some(log) = &app.rpc_log {
        log.record(&body, &response.to_string());
    }
    Json(response)
}

/// A running service.
///
/// Dropping it shuts the webserver down without waiting for the
/// shutdown notifications to be delivered; use [`stop`](Self::stop) for that.
#[derive(Debug)]
pub struct StubServer {
    address: SocketAddr,
    wallet_dir: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StubServer {
    /// Address the webserver listens on.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn wallet_dir(&self) -> &Path {
        &self.wallet_dir
    }

    /// Close every session, notifying their listeners, and stop serving.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Webserver task failed");
            }
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Bind the webserver and start serving.
///
/// A bind failure is reported with `opening_beekeeper_failed`; success with
/// `webserver_listening` followed by `status_changed`.
pub async fn spawn(config: StubConfig) -> Result<StubServer, StubError> {
    std::fs::create_dir_all(&config.wallet_dir)?;
    let notifier = Notifier::new(config.notifications_endpoint);

    let requested = config.webserver_http_endpoint;
    let listener = match TcpListener::bind(requested).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %requested, error = %e, "Unable to open webserver");
            notifier.opening_failed(requested, &e.to_string()).await;
            return Err(StubError::Bind {
                address: requested,
                source: e,
            });
        }
    };
    let address = listener.local_addr()?;

    let rpc_log = match &config.log_json_rpc {
        Some(dir) => Some(Arc::new(RpcLog::open(dir)?)),
        None => None,
    };
    let state = Arc::new(AppState::new(
        Keeper::new(&config.wallet_dir, config.unlock_timeout()),
        config.unlock_interval(),
    ));
    let router = build_router(App {
        state: Arc::clone(&state),
        rpc_log,
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let closing_notifier = notifier.clone();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
            close_sessions(&state, &closing_notifier).await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "Webserver error");
        }
    });

    tracing::info!(%address, wallet_dir = %config.wallet_dir.display(), "Webserver listening");
    notifier.webserver_listening(address).await;
    notifier.status_changed("beekeeper is ready").await;

    Ok(StubServer {
        address,
        wallet_dir: config.wallet_dir,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn close_sessions(state: &AppState, notifier: &Notifier) {
    let closed = state.keeper().close_all_sessions();
    tracing::info!(sessions = closed.len(), "Closing sessions");
    for session in closed {
        notifier
            .send_to(
                session.notifications_endpoint.as_deref(),
                "attempt_of_closing_wallets",
                json!({"token": session.token, "wallets": session.wallets}),
            )
            .await;
    }
    notifier.status_changed("beekeeper is closing").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app(dir: &Path, rpc_log: Option<Arc<RpcLog>>) -> App {
        App {
            state: Arc::new(AppState::new(
                Keeper::new(dir, std::time::Duration::from_secs(900)),
                std::time::Duration::ZERO,
            )),
            rpc_log,
        }
    }

    async fn post(router: Router, body: &str) -> Value {
        let response = router
            .oneshot(
                HttpRequest::post("/")
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let response = post(build_router(app(dir.path(), None)), "{not json").await;
        assert_eq!(response["error"]["code"], json!(error_codes::PARSE_ERROR));
    }

    #[tokio::test]
    async fn test_exchanges_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RpcLog::open(&dir.path().join("logs")).unwrap());
        let router = build_router(app(dir.path(), Some(log)));
        let response = post(
            router,
            r#"{"jsonrpc":"2.0","id":1,"method":"beekeeper_api.create_session","params":{"salt":"s"}}"#,
        )
        .await;
        assert!(response["result"]["token"].is_string());

        let logged = std::fs::read_to_string(dir.path().join("logs").join(JSON_RPC_LOG)).unwrap();
        assert!(logged.contains("beekeeper_api.create_session"));
        assert!(logged.contains("token"));
    }
}
