//! Auth middleware for the control plane (component J, auth half). Verifies
//! `X-API-Key` / `X-Timestamp` / `X-Signature` via component A, then stashes
//! the raw request body as an extension so downstream `Json<T>` extractors
//! can still parse it, since reading a body to verify its signature would
//! otherwise consume it before the handler ever sees it.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use tracing::warn;

use super::signature::{timestamp_fresh, verify, DEFAULT_TOLERANCE_SECS};
use crate::error::OrchestratorError;
use crate::AppState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Bytes of the already-consumed request body, stashed by [`hmac_auth_middleware`]
/// for handlers that need it (most go through axum's `Json` extractor directly,
/// which reads from the reconstructed body — this extension exists for routes
/// that need the raw bytes, e.g. to recompute hashes).
#[derive(Clone)]
pub struct RawBody(pub Bytes);

pub async fn hmac_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, OrchestratorError> {
    if !state.config.has_credentials() {
        warn!("control plane running without HMAC credentials — unauthenticated development mode");
        return Ok(next.run(req).await);
    }

    let headers = req.headers().clone();
    let api_key = header_str(&headers, "x-api-key");
    let timestamp = header_str(&headers, "x-timestamp");
    let signature = header_str(&headers, "x-signature");

    let (Some(api_key), Some(timestamp), Some(signature)) = (api_key, timestamp, signature)
    else {
        return Err(OrchestratorError::Unauthorized {
            code: "AUTH_MISSING_HEADERS",
        });
    };

    if ct_neq(api_key.as_bytes(), state.config.api_key.as_bytes()) {
        return Err(OrchestratorError::Unauthorized {
            code: "AUTH_INVALID_KEY",
        });
    }

    let Ok(ts) = timestamp.parse::<i64>() else {
        return Err(OrchestratorError::Unauthorized {
            code: "AUTH_INVALID_TIMESTAMP",
        });
    };

    let now = chrono::Utc::now().timestamp();
    if !timestamp_fresh(ts, now, DEFAULT_TOLERANCE_SECS) {
        return Err(OrchestratorError::Unauthorized {
            code: "AUTH_TIMESTAMP_EXPIRED",
        });
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| OrchestratorError::BadRequest(format!("failed to read body: {e}")))?;

    if !verify(&method, &path, &bytes, timestamp, &state.config.api_secret, signature) {
        return Err(OrchestratorError::Unauthorized {
            code: "AUTH_INVALID_SIGNATURE",
        });
    }

    let mut rebuilt = Request::from_parts(parts, Body::from(bytes.clone()));
    rebuilt.extensions_mut().insert(RawBody(bytes));
    req = rebuilt;

    Ok(next.run(req).await)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Constant-time inequality check for the API key comparison.
fn ct_neq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return true;
    }
    !bool::from(a.ct_eq(b))
}
