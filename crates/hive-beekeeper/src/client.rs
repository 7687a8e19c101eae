//! JSON-RPC client for the Beekeeper webserver.
//!
//! Requests are plain HTTP POSTs of `{jsonrpc, id, method, params}` to `/`.

use crate::error::{BeekeeperError, Result};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Prefix of every Beekeeper API method.
pub const API_PREFIX: &str = "beekeeper_api";

/// Message fragment the service uses for a wrong password.
const INVALID_PASSWORD_MARKER: &str = "Invalid password";

/// Client for one Beekeeper webserver.
#[derive(Debug)]
pub struct RpcClient {
    endpoint: SocketAddr,
    uri: hyper::Uri,
    http: Client<HttpConnector>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RpcClient {
    /// Create a client for the webserver at `endpoint`.
    pub fn new(endpoint: SocketAddr, timeout: Duration) -> Result<Self> {
        let uri = format!("http://{endpoint}/")
            .parse()
            .map_err(|e| BeekeeperError::Connection {
                endpoint: endpoint.to_string(),
                reason: format!("invalid uri: {e}"),
            })?;
        Ok(Self {
            endpoint,
            uri,
            http: Client::new(),
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    /// Address of the webserver.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Call `beekeeper_api.{method}` and decode its result.
    ///
    /// # Errors
    ///
    /// Transport failures become [`BeekeeperError::Connection`] or
    /// [`BeekeeperError::Timeout`]; a server-reported error becomes
    /// [`BeekeeperError::InvalidPassword`] for a wrong password and
    /// [`BeekeeperError::ErrorInResponse`] otherwise.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let method = format!("{API_PREFIX}.{method}");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = serde_json::to_value(params)?;
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(method = %method, id, endpoint = %self.endpoint, "Sending RPC request");

        let response_str = match tokio::time::timeout(self.timeout, self.post(request_str.clone())).await {
            Ok(response) => response?,
            Err(_) => {
                tracing::warn!(method = %method, id, timeout_secs = self.timeout.as_secs(), "RPC response timeout");
                return Err(BeekeeperError::Timeout {
                    method,
                    timeout: self.timeout,
                });
            }
        };
        tracing::trace!(response = %response_str, "RPC response body");

        let response: Value = serde_json::from_str(&response_str)?;
        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            tracing::debug!(method = %method, id, code, message = %message, "RPC error response");
            if message.contains(INVALID_PASSWORD_MARKER) {
                let wallet = params
                    .get("wallet_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Err(BeekeeperError::InvalidPassword {
                    wallet,
                    code,
                    message,
                    request: request_str,
                    response: response_str,
                });
            }
            return Err(BeekeeperError::ErrorInResponse {
                method,
                code,
                message,
                request: request_str,
                response: response_str,
            });
        }

        let result = response.get("result").cloned().ok_or_else(|| {
            BeekeeperError::InvalidResponse(format!("{method}: missing result in {response_str}"))
        })?;
        tracing::debug!(method = %method, id, "RPC call successful");
        serde_json::from_value(result).map_err(BeekeeperError::from)
    }

    async fn post(&self, body: String) -> Result<String> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .map_err(|e| BeekeeperError::InvalidResponse(format!("failed to build request: {e}")))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| self.connection_error(e))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| self.connection_error(e))?;
        let body = String::from_utf8_lossy(&bytes).into_owned();
        if !status.is_success() && body.is_empty() {
            return Err(BeekeeperError::Connection {
                endpoint: self.endpoint.to_string(),
                reason: format!("HTTP status {status}"),
            });
        }
        Ok(body)
    }

    fn connection_error(&self, e: hyper::Error) -> BeekeeperError {
        BeekeeperError::Connection {
            endpoint: self.endpoint.to_string(),
            reason: e.to_string(),
        }
    }
}
