//! HTTP Reverse Proxy + Injector (component H): forwards `/p/<id>/*` to the
//! owning child bundler, auto-starting it on a cold miss, and rewrites HTML
//! entry documents to carry the child's `<base>` and the visual-edit script.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use http_body_util::BodyExt;
use tracing::{error, warn};

use crate::error::OrchestratorError;
use crate::project::sanitize_project_id;
use crate::AppState;

/// Headers that are never copied onto the forwarded request — hop-by-hop
/// plus `host`/`origin`, which are always rebuilt to point at the child.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "origin",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

const INJECTED_SCRIPT_MARKER: &str = "/static/visual-edit-script.js";

/// `GET /p/:project_id` (no trailing slash) — redirect to the canonical
/// trailing-slash form the child's `base` expects.
pub async fn redirect_trailing_slash(Path(project_id): Path<String>) -> Response {
    Redirect::permanent(&format!("/p/{project_id}/")).into_response()
}

/// `/p/{project_id}/{*rest}` — the wildcard also matches a bare trailing
/// slash with an empty `rest`, so this one route covers both the entry
/// document and every sub-path. The tail itself is read back out of
/// `req.uri()` rather than the second capture, since forwarding needs the
/// raw (possibly query-bearing) path-and-query, not just the matched
/// wildcard segment.
pub async fn proxy_handler_tail(
    State(state): State<Arc<AppState>>,
    Path((project_id, _rest)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    proxy_handler(state, project_id, req).await
}

async fn proxy_handler(state: Arc<AppState>, project_id: String, req: Request<Body>) -> Response {
    let id = match sanitize_project_id(&project_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    // Legacy upgrade path: a WebSocket upgrade arriving under `/p/<id>/...`
    // rather than `/hmr/...` is routed to the raw splice with this id as the
    // target, same as an explicit `/hmr/<id>` request.
    let is_upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if is_upgrade {
        return super::hmr::raw_splice_handler(state, id, req).await;
    }

    let port = match ensure_running(&state, &id).await {
        Ok(port) => port,
        Err(resp) => return resp,
    };
    state.supervisor.mark_active(&id).await;

    let full_path = req.uri().path().to_string();
    let prefix = format!("/p/{id}");
    let tail = full_path.strip_prefix(&prefix).unwrap_or("/");
    let tail = if tail.is_empty() { "/" } else { tail };

    let forwarded_path_and_query = if tail.starts_with("/__jsx-") {
        match req.uri().query() {
            Some(q) => format!("{tail}?{q}"),
            None => tail.to_string(),
        }
    } else {
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| full_path.clone())
    };

    let backend_uri = match format!("http://localhost:{port}{forwarded_path_and_query}").parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            error!(project_id = %id, error = %e, "failed to build backend URI");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Proxy error").into_response();
        }
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = backend_uri;
    rewrite_request_headers(&mut parts.headers, port);
    let forwarded = Request::from_parts(parts, body);

    let response = match state.proxy_client.request(forwarded).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(project_id = %id, error = %e, "upstream request failed");
            return bad_gateway();
        }
    };

    let is_html_entry = matches!(tail, "/" | "/index.html");
    let (mut parts, body) = response.into_parts();
    parts.headers.remove("content-encoding");
    parts.headers.remove("content-length");

    let is_html = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));

    if is_html_entry && is_html {
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!(project_id = %id, error = %e, "failed to read upstream HTML body");
                return bad_gateway();
            }
        };
        let injected = inject_into_html(&bytes, &id);
        Response::from_parts(parts, Body::from(injected))
    } else {
        Response::from_parts(parts, Body::new(body))
    }
}

/// Attempts to read the instance; on a miss, auto-starts via the Project
/// Manager. Returns `404` if the project directory doesn't exist, `500` on
/// any other start failure.
async fn ensure_running(state: &Arc<AppState>, id: &str) -> Result<u16, Response> {
    if let Some(port) = state.supervisor.get_backend_port(id).await {
        return Ok(port);
    }

    let dir = state.project.project_dir(id);
    if tokio::fs::metadata(&dir).await.is_err() {
        return Err(OrchestratorError::NotFound(format!("project not found: {id}")).into_response());
    }

    match state.project.start_preview(id).await {
        Ok(result) => Ok(result.port),
        Err(e) => {
            warn!(project_id = id, error = %e, "auto-start failed");
            Err(e.into_response())
        }
    }
}

fn rewrite_request_headers(headers: &mut axum::http::HeaderMap, port: u16) {
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(*name);
    }
    let local = format!("localhost:{port}");
    if let Ok(value) = HeaderValue::from_str(&local) {
        headers.insert("host", value.clone());
        headers.insert("origin", value);
    }
}

fn inject_into_html(body: &[u8], project_id: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let injection = format!(
        "<base href=\"/p/{project_id}/\">\n<script type=\"module\" src=\"{INJECTED_SCRIPT_MARKER}\"></script>"
    );

    let lower = text.to_lowercase();
    let head_pos = lower.find("<head>").or_else(|| lower.find("<head "));
    match head_pos {
        Some(pos) => {
            let tag_end = text[pos..].find('>').map(|i| pos + i + 1).unwrap_or(pos);
            let mut out = String::with_capacity(text.len() + injection.len());
            out.push_str(&text[..tag_end]);
            out.push('\n');
            out.push_str(&injection);
            out.push_str(&text[tag_end..]);
            out.into_bytes()
        }
        None => text.into_owned().into_bytes(),
    }
}

fn bad_gateway() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(serde_json::json!({"success": false, "error": "Proxy error"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_into_html_inserts_after_head_tag() {
        let html = "<!doctype html><html><head><title>x</title></head><body></body></html>";
        let out = String::from_utf8(inject_into_html(html.as_bytes(), "abc12345")).unwrap();
        assert!(out.contains("<base href=\"/p/abc12345/\">"));
        assert!(out.contains(INJECTED_SCRIPT_MARKER));
        let head_idx = out.find("<head>").unwrap();
        let base_idx = out.find("<base").unwrap();
        assert!(base_idx > head_idx);
    }

    #[test]
    fn inject_into_html_case_insensitive_head() {
        let html = "<html><HEAD><title>x</title></HEAD></html>";
        let out = String::from_utf8(inject_into_html(html.as_bytes(), "abc")).unwrap();
        assert!(out.contains("<base href=\"/p/abc/\">"));
    }

    #[test]
    fn inject_into_html_no_head_returns_unchanged() {
        let html = "<div>no head here</div>";
        let out = inject_into_html(html.as_bytes(), "abc");
        assert_eq!(out, html.as_bytes());
    }
}
