//! Outgoing notifications.

use crate::protocol::notification;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;

/// Time allowed for a listener to accept one notification.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// POSTs notifications to listeners; delivery failures are logged only.
#[derive(Debug, Clone)]
pub struct Notifier {
    default_endpoint: Option<String>,
    http: Client<HttpConnector>,
}

impl Notifier {
    pub fn new(default_endpoint: Option<SocketAddr>) -> Self {
        Self {
            default_endpoint: default_endpoint.map(|e| e.to_string()),
            http: Client::new(),
        }
    }

    /// Send to the endpoint given on the command line.
    pub async fn broadcast(&self, name: &str, value: Value) {
        if let Some(endpoint) = &self.default_endpoint {
            self.send(endpoint, name, value).await;
        }
    }

    /// Send to `endpoint`, falling back to the command line endpoint.
    pub async fn send_to(&self, endpoint: Option<&str>, name: &str, value: Value) {
        match endpoint.or(self.default_endpoint.as_deref()) {
            Some(endpoint) => self.send(endpoint, name, value).await,
            None => tracing::debug!(name, "No listener for notification"),
        }
    }

    pub async fn webserver_listening(&self, address: SocketAddr) {
        self.broadcast(
            "webserver_listening",
            json!({"type": "HTTP", "address": address.ip().to_string(), "port": address.port()}),
        )
        .await;
    }

    pub async fn opening_failed(&self, address: SocketAddr, message: &str) {
        self.broadcast(
            "opening_beekeeper_failed",
            json!({"address": address.ip().to_string(), "port": address.port(), "message": message}),
        )
        .await;
    }

    pub async fn status_changed(&self, status: &str) {
        self.broadcast("status_changed", json!({"current_status": status}))
            .await;
    }

    async fn send(&self, endpoint: &str, name: &str, value: Value) {
        let body = notification(name, value).to_string();
        let request = match Request::builder()
            .method(Method::POST)
            .uri(format!("http://{endpoint}/"))
            .header("Content-Type", "application/json")
            .body(Body::from(body))
        {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(endpoint, name, error = %e, "Bad notification endpoint");
                return;
            }
        };
        match tokio::time::timeout(SEND_TIMEOUT, self.http.request(request)).await {
            Ok(Ok(response)) => {
                tracing::debug!(endpoint, name, status = %response.status(), "Notification sent")
            }
            Ok(Err(e)) => tracing::warn!(endpoint, name, error = %e, "Notification not delivered"),
            Err(_) => tracing::warn!(endpoint, name, "Notification timed out"),
        }
    }
}
