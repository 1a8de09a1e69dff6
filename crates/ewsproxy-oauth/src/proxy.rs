//! Reverse proxy with Basic-Auth gate and bearer substitution.
//!
//! Accepts EWS requests from a legacy mail client, optionally checks the
//! client-supplied Basic credentials, strips them, and forwards the
//! request upstream with `Authorization: Bearer <current token>`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::error::AuthError;
use crate::manager::CredentialManager;

/// Largest client request body we will buffer before forwarding.
/// EWS SOAP payloads (including attachment uploads) stay well under this.
const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// Basic-Auth credentials required from connecting clients.
#[derive(Debug, Clone)]
pub struct GateCredentials {
    pub username: String,
    pub password: String,
}

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    /// Upstream base URL, e.g. `https://outlook.office365.com`.
    pub upstream_url: String,
    /// When set, clients must present these Basic credentials.
    pub gate: Option<GateCredentials>,
}

/// Shared state for the proxy handlers.
struct ProxyState {
    manager: Arc<CredentialManager>,
    client: reqwest::Client,
    upstream_url: String,
    gate: Option<GateCredentials>,
}

/// The bearer-substituting proxy server.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, manager: Arc<CredentialManager>) -> Result<Self, AuthError> {
        // No overall timeout here: EWS sync calls can be long-polls held
        // open by the server. Redirects are relayed to the mail client,
        // never followed here, so the injected Authorization header can
        // never leak to a redirect target.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            bind_addr: config.bind_addr,
            state: Arc::new(ProxyState {
                manager,
                client,
                upstream_url: config.upstream_url.trim_end_matches('/').to_string(),
                gate: config.gate,
            }),
        })
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(handle_health))
            .fallback(handle_forward)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown future resolves.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "proxy listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Handle GET /healthz. Not subject to the Basic-Auth gate.
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ewsproxy"
    }))
}

/// Forward any request to the upstream EWS endpoint.
async fn handle_forward(
    State(state): State<Arc<ProxyState>>,
    req: Request,
) -> Result<Response, ProxyError> {
    if let Some(gate) = &state.gate {
        check_gate(req.headers(), gate)?;
    }

    let (parts, body) = req.into_parts();
    let path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream_url, path_query);

    let body_bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;

    let mut upstream_req = state.client.request(parts.method, &url);
    for (name, value) in parts.headers.iter() {
        // The client's Basic credentials never leave this process, and
        // host/length are recomputed for the upstream connection.
        if name == header::AUTHORIZATION
            || name == header::HOST
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        upstream_req = upstream_req.header(name, value);
    }

    let token = state.manager.current_access_token().await;
    upstream_req = upstream_req.header(header::AUTHORIZATION, format!("Bearer {token}"));

    let upstream = upstream_req
        .body(body_bytes)
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }

    let stream = upstream
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other));
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ProxyError::Upstream(format!("failed to build response: {e}")))
}

/// Validate the client's Basic credentials against the configured pair.
fn check_gate(headers: &HeaderMap, gate: &GateCredentials) -> Result<(), ProxyError> {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(ProxyError::Unauthorized);
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Err(ProxyError::Unauthorized);
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return Err(ProxyError::Unauthorized);
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return Err(ProxyError::Unauthorized);
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return Err(ProxyError::Unauthorized);
    };

    // Bitwise-and rather than `&&` so both comparisons always run.
    if constant_time_eq(user, &gate.username) & constant_time_eq(pass, &gate.password) {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}

/// Compare two strings in constant time.
///
/// If lengths differ a dummy comparison keeps the timing consistent.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() == b_bytes.len() {
        a_bytes.ct_eq(b_bytes).into()
    } else {
        let _ = a_bytes.ct_eq(a_bytes);
        false
    }
}

/// Error type for proxy responses.
#[derive(Debug)]
pub enum ProxyError {
    /// The client failed the Basic-Auth gate.
    Unauthorized,
    /// The client request could not be read.
    InvalidRequest(String),
    /// The upstream call failed at the transport level.
    Upstream(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, r#"Basic realm="ewsproxy""#)],
                "Unauthorized",
            )
                .into_response(),
            ProxyError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(error_body("invalid_request", &msg))).into_response()
            }
            ProxyError::Upstream(msg) => {
                tracing::warn!(err = %msg, "upstream request failed");
                (StatusCode::BAD_GATEWAY, Json(error_body("upstream_error", &msg))).into_response()
            }
        }
    }
}

fn error_body(error_type: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "type": error_type,
            "message": message
        }
    })
}
