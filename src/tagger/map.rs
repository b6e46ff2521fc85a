//! Per-bundler-process id↔location map (component B) plus the three
//! CORS-open query handlers mounted at `/__jsx-*`.
//!
//! A single `RwLock` over a `HashMap`, cloned cheaply via `Arc` and shared
//! through `AppState`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::AppState;

/// One entry recorded for a single tagged element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsxLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub element_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceMapManager {
    inner: Arc<RwLock<HashMap<String, JsxLocation>>>,
}

impl SourceMapManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record all entries produced by re-transforming `file`, first dropping
    /// any entries previously recorded for it. The drop-then-insert happens
    /// under a single write lock so concurrent readers never observe a torn
    /// entry — either the old set or the new one, never a mix.
    pub async fn replace_file_entries(&self, file: &str, entries: Vec<(String, JsxLocation)>) {
        let mut map = self.inner.write().await;
        map.retain(|_, loc| loc.file != file);
        for (id, loc) in entries {
            map.insert(id, loc);
        }
    }

    pub async fn get(&self, id: &str) -> Option<JsxLocation> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn by_file(&self, file: &str) -> Vec<(String, JsxLocation)> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(_, loc)| loc.file == file)
            .map(|(id, loc)| (id.clone(), loc.clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> HashMap<String, JsxLocation> {
        self.inner.read().await.clone()
    }
}

#[derive(Deserialize)]
pub struct LocateQuery {
    pub id: String,
}

#[derive(Deserialize)]
pub struct ByFileQuery {
    pub file: String,
}

/// `GET /__jsx-source-map` — the entire map as JSON.
pub async fn source_map_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.source_map.snapshot().await).into_response()
}

/// `GET /__jsx-locate?id=<id>` — one entry or 404.
pub async fn locate_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LocateQuery>,
) -> Response {
    match state.source_map.get(&q.id).await {
        Some(loc) => Json(loc).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "not found"})))
            .into_response(),
    }
}

/// `GET /__jsx-by-file?file=<path>` — all entries for a file.
pub async fn by_file_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ByFileQuery>,
) -> Response {
    let entries = state.source_map.by_file(&q.file).await;
    let map: HashMap<String, JsxLocation> = entries.into_iter().collect();
    Json(map).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(file: &str, line: u32) -> JsxLocation {
        JsxLocation {
            file: file.to_string(),
            line,
            column: 1,
            element_name: "div".to_string(),
        }
    }

    #[tokio::test]
    async fn replace_drops_only_same_file_entries() {
        let mgr = SourceMapManager::new();
        mgr.replace_file_entries(
            "/a.tsx",
            vec![("id1".into(), loc("/a.tsx", 1))],
        )
        .await;
        mgr.replace_file_entries(
            "/b.tsx",
            vec![("id2".into(), loc("/b.tsx", 1))],
        )
        .await;

        assert!(mgr.get("id1").await.is_some());
        assert!(mgr.get("id2").await.is_some());

        mgr.replace_file_entries("/a.tsx", vec![("id3".into(), loc("/a.tsx", 5))]).await;

        assert!(mgr.get("id1").await.is_none(), "stale entry for re-transformed file must be dropped");
        assert!(mgr.get("id3").await.is_some());
        assert!(mgr.get("id2").await.is_some(), "entries for other files must survive");
    }

    #[tokio::test]
    async fn by_file_filters_correctly() {
        let mgr = SourceMapManager::new();
        mgr.replace_file_entries(
            "/a.tsx",
            vec![
                ("id1".into(), loc("/a.tsx", 1)),
                ("id2".into(), loc("/a.tsx", 2)),
            ],
        )
        .await;
        mgr.replace_file_entries("/b.tsx", vec![("id3".into(), loc("/b.tsx", 1))]).await;

        let entries = mgr.by_file("/a.tsx").await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn get_missing_id_returns_none() {
        let mgr = SourceMapManager::new();
        assert!(mgr.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_a_full_copy() {
        let mgr = SourceMapManager::new();
        mgr.replace_file_entries("/a.tsx", vec![("id1".into(), loc("/a.tsx", 1))]).await;
        let snap = mgr.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(snap.contains_key("id1"));
    }
}
