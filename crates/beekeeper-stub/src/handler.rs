//! Request handler for beekeeper-stub.
//!
//! Routes `beekeeper_api.*` requests to the [`Keeper`].

use crate::keeper::{Keeper, KeeperError, KeeperResult};
use crate::protocol::{error_codes, Request, Response, API_PREFIX};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// State shared by all requests.
#[derive(Debug)]
pub struct AppState {
    pub keeper: Mutex<Keeper>,
    pub unlock_interval: Duration,
}

impl AppState {
    pub fn new(keeper: Keeper, unlock_interval: Duration) -> Self {
        Self {
            keeper: Mutex::new(keeper),
            unlock_interval,
        }
    }

    pub fn keeper(&self) -> std::sync::MutexGuard<'_, Keeper> {
        self.keeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionParams {
    #[serde(default)]
    salt: String,
    #[serde(default)]
    notifications_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    token: String,
}

#[derive(Debug, Deserialize)]
struct WalletParams {
    token: String,
    wallet_name: String,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    token: String,
    wallet_name: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnlockParams {
    token: String,
    wallet_name: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct SetTimeoutParams {
    token: String,
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ImportKeyParams {
    token: String,
    wallet_name: String,
    wif_key: String,
}

#[derive(Debug, Deserialize)]
struct PublicKeysParams {
    token: String,
    #[serde(default)]
    wallet_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignDigestParams {
    token: String,
    sig_digest: String,
    public_key: String,
}

/// Failure of one call, before it is turned into a response.
enum CallError {
    Params(serde_json::Error),
    Keeper(KeeperError),
}

impl From<KeeperError> for CallError {
    fn from(e: KeeperError) -> Self {
        Self::Keeper(e)
    }
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T, CallError> {
    serde_json::from_value(value).map_err(CallError::Params)
}

/// Handle a JSON-RPC request and return a response.
///
/// A failed `unlock` is answered only after the configured unlock interval.
pub async fn handle_request(state: &AppState, req: Request) -> Response {
    debug!(method = %req.method, id = %req.id, "handling request");
    trace!(params = ?req.params, "request params");

    let Some(method) = req.method.strip_prefix(API_PREFIX) else {
        warn!(method = %req.method, "unknown method");
        return Response::error(
            req.id,
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {}", req.method),
        );
    };

    let result = match dispatch(state, method, req.params) {
        Some(result) => result,
        None => {
            warn!(method = %req.method, "unknown method");
            return Response::error(
                req.id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            );
        }
    };

    match result {
        Ok(value) => {
            debug!(id = %req.id, "request succeeded");
            Response::success(req.id, value)
        }
        Err(CallError::Params(e)) => {
            warn!(id = %req.id, method, error = %e, "invalid params");
            Response::error(req.id, error_codes::INVALID_PARAMS, format!("invalid params: {e}"))
        }
        Err(CallError::Keeper(e)) => {
            if matches!(e, KeeperError::InvalidPassword(_)) {
                tokio::time::sleep(state.unlock_interval).await;
            }
            debug!(id = %req.id, method, error = %e, "request failed");
            Response::error(req.id, error_codes::SERVER_ERROR, e.to_string())
        }
    }
}

fn dispatch(state: &AppState, method: &str, raw: Value) -> Option<Result<Value, CallError>> {
    let result = match method {
        "create_session" => call(raw, |p: CreateSessionParams| {
            let token = state.keeper().create_session(&p.salt, p.notifications_endpoint);
            Ok(json!({"token": token}))
        }),
        "close_session" => call(raw, |p: TokenParams| {
            state.keeper().close_session(&p.token)?;
            Ok(json!({}))
        }),
        "create" => call(raw, |p: CreateParams| {
            let password = state
                .keeper()
                .create(&p.token, &p.wallet_name, p.password.as_deref())?;
            Ok(json!({"password": password}))
        }),
        "open" => call(raw, |p: WalletParams| {
            state.keeper().open(&p.token, &p.wallet_name)?;
            Ok(json!({}))
        }),
        "close" => call(raw, |p: WalletParams| {
            state.keeper().close(&p.token, &p.wallet_name)?;
            Ok(json!({}))
        }),
        "unlock" => call(raw, |p: UnlockParams| {
            state.keeper().unlock(&p.token, &p.wallet_name, &p.password)?;
            Ok(json!({}))
        }),
        "lock" => call(raw, |p: WalletParams| {
            state.keeper().lock(&p.token, &p.wallet_name)?;
            Ok(json!({}))
        }),
        "lock_all" => call(raw, |p: TokenParams| {
            state.keeper().lock_all(&p.token)?;
            Ok(json!({}))
        }),
        "set_timeout" => call(raw, |p: SetTimeoutParams| {
            state
                .keeper()
                .set_timeout(&p.token, Duration::from_secs(p.seconds))?;
            Ok(json!({}))
        }),
        "list_wallets" => call(raw, |p: TokenParams| {
            let wallets = state.keeper().list_wallets(&p.token)?;
            Ok(json!({"wallets": wallets}))
        }),
        "get_info" => call(raw, |p: TokenParams| {
            let remaining = state.keeper().remaining_unlock_time(&p.token)?;
            let now = chrono::Utc::now();
            let timeout_time = now
                + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
            Ok(json!({
                "now": now.format(TIME_FORMAT).to_string(),
                "timeout_time": timeout_time.format(TIME_FORMAT).to_string(),
            }))
        }),
        "import_key" => call(raw, |p: ImportKeyParams| {
            let public_key = state
                .keeper()
                .import_key(&p.token, &p.wallet_name, &p.wif_key)?;
            Ok(json!({"public_key": public_key}))
        }),
        "get_public_keys" => call(raw, |p: PublicKeysParams| {
            let keys = state
                .keeper()
                .get_public_keys(&p.token, p.wallet_name.as_deref())?;
            let keys: Vec<Value> = keys.into_iter().map(|k| json!({"public_key": k})).collect();
            Ok(json!({"keys": keys}))
        }),
        "sign_digest" => call(raw, |p: SignDigestParams| {
            let signature = state
                .keeper()
                .sign_digest(&p.token, &p.sig_digest, &p.public_key)?;
            Ok(json!({"signature": signature}))
        }),
        _ => return None,
    };
    Some(result)
}

/// Timestamp format of `get_info`.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn call<P, F>(raw: Value, f: F) -> Result<Value, CallError>
where
    P: DeserializeOwned,
    F: FnOnce(P) -> KeeperResult<Value>,
{
    let params = params(raw)?;
    Ok(f(params)?)
}
