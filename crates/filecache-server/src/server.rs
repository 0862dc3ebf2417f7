//! Admin HTTP surface
//!
//! Everything under `/api/v1` requires the `Authorization` header to carry
//! the configured API key. `/healthcheck` and `/metrics` are open; keep
//! `/metrics` reachable only from the scraper's network.

use crate::error::AppError;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose, Engine};
use filecache_fill::{
    BlobPointer, CacheEntry, CacheIndex, CacheKey, CacheReader, Enqueued, IndexError, Job,
    TaskQueue,
};
use futures::TryStreamExt;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DUMP_PAGE_SIZE: usize = 500;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<CacheReader>,
    pub index: Arc<dyn CacheIndex>,
    pub queue: Arc<dyn TaskQueue>,
    pub api_key: Arc<str>,
    pub registry: Registry,
}

impl AppState {
    pub fn new(
        reader: Arc<CacheReader>,
        index: Arc<dyn CacheIndex>,
        queue: Arc<dyn TaskQueue>,
        api_key: &str,
    ) -> Self {
        Self {
            reader,
            index,
            queue,
            api_key: Arc::from(api_key),
            registry: Registry::new(),
        }
    }

    /// Serve the metrics registered on `registry` at `/metrics`
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }
}

/// Body of `POST /api/v1/`
#[derive(Debug, Deserialize)]
struct CreateEntry {
    object_id: i32,
    object_type: String,
    data: BlobPointer,
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/", post(create_entry))
        .route("/api/v1/update_cache", post(update_cache))
        .route("/api/v1/dump", get(dump))
        .route("/api/v1/stats", get(stats))
        .route(
            "/api/v1/download/{object_id}/{object_type}",
            get(download),
        )
        .route(
            "/api/v1/{object_id}/{object_type}",
            get(get_entry).delete(delete_entry),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if provided != Some(&*state.api_key) {
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

async fn healthcheck() -> &'static str {
    "Ok!"
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => AppError::Internal(format!("Failed to encode metrics: {}", e)).into_response(),
    }
}

async fn get_entry(
    State(state): State<AppState>,
    Path((object_id, object_type)): Path<(i32, String)>,
) -> Result<Json<CacheEntry>, AppError> {
    let key = CacheKey::new(object_id, object_type)?;
    Ok(Json(state.reader.lookup(&key).await?))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path((object_id, object_type)): Path<(i32, String)>,
) -> Result<Json<CacheEntry>, AppError> {
    let key = CacheKey::new(object_id, object_type)?;
    let entry = state.index.delete(&key).await?.ok_or(AppError::NotFound)?;
    info!(key = %key, "Deleted cache entry");
    Ok(Json(entry))
}

async fn create_entry(
    State(state): State<AppState>,
    Json(body): Json<CreateEntry>,
) -> Result<Json<CacheEntry>, AppError> {
    let key = CacheKey::new(body.object_id, body.object_type)?;
    let entry = state.index.upsert(&key, body.data).await?;
    info!(
        key = %key,
        chat_id = entry.pointer.chat_id,
        message_id = entry.pointer.message_id,
        "Stored cache entry"
    );
    Ok(Json(entry))
}

async fn update_cache(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let status = match state.queue.enqueue(&Job::Crawl, Duration::ZERO).await? {
        Enqueued::Accepted => "accepted",
        Enqueued::Merged => "already_running",
    };
    info!(status, "Full crawl requested");
    Ok(Json(json!({ "status": status })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let cached_files = state.index.count().await?;
    let jobs = state.queue.counts().await?;
    Ok(Json(json!({
        "cached_files": cached_files,
        "jobs": jobs,
    })))
}

/// Every entry as newline-delimited JSON, paged by id
async fn dump(State(state): State<AppState>) -> Response {
    let pages = futures::stream::try_unfold(
        (state.index, Some(0i64)),
        |(index, cursor)| async move {
            let Some(after_id) = cursor else {
                return Ok(None);
            };
            let entries = index.list_after(after_id, DUMP_PAGE_SIZE).await?;
            let Some(last) = entries.last() else {
                return Ok(None);
            };
            let next = (entries.len() == DUMP_PAGE_SIZE).then_some(last.id);

            let mut chunk = Vec::new();
            for entry in &entries {
                serde_json::to_writer(&mut chunk, entry)
                    .map_err(|e| IndexError(e.to_string()))?;
                chunk.push(b'\n');
            }
            Ok::<_, IndexError>(Some((chunk, (index, next))))
        },
    )
    .inspect_err(|e| warn!(error = %e, "Dump aborted"));

    ([(CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(pages)).into_response()
}

/// Stream a cached file, refilling it first when it is missing or its
/// blob has gone away
async fn download(
    State(state): State<AppState>,
    Path((object_id, object_type)): Path<(i32, String)>,
) -> Result<Response, AppError> {
    let key = CacheKey::new(object_id, object_type)?;
    let opened = state.reader.open(&key).await?;

    let mut response = Response::builder()
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename={}", opened.name.filename_ascii),
        )
        .header(
            "x-filename-b64",
            general_purpose::STANDARD.encode(&opened.name.filename),
        )
        .header(
            "x-caption-b64",
            general_purpose::STANDARD.encode(&opened.caption),
        );
    if let Some(size) = opened.file.size {
        response = response.header(CONTENT_LENGTH, size);
    }

    response
        .body(Body::from_stream(opened.file.body))
        .map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use filecache_fill::testing::Harness;
    use filecache_fill::FillMetrics;
    use tower::ServiceExt;

    const KEY: &str = "secret";

    fn router(harness: &Harness) -> Router {
        let parts = harness.collaborators();
        let state = AppState::new(
            Arc::new(harness.reader()),
            parts.index,
            harness.queue.clone(),
            KEY,
        );
        create_router(state)
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, KEY)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck_needs_no_key() {
        let harness = Harness::new();
        let response = router(&harness)
            .oneshot(
                Request::builder()
                    .uri("/healthcheck")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"Ok!");
    }

    #[tokio::test]
    async fn test_api_rejects_wrong_key() {
        let harness = Harness::new();
        let response = router(&harness)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/stats")
                    .header(AUTHORIZATION, "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "Authentication required"
        );
    }

    #[tokio::test]
    async fn test_get_entry_fills_on_demand() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(5, &["fb2"]));

        let response = router(&harness)
            .oneshot(request("GET", "/api/v1/5/fb2").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object_id"], 5);
        assert_eq!(body["object_type"], "fb2");
        assert!(body["message_id"].is_i64());
        assert_eq!(harness.sink.uploads(), 1);
    }

    #[tokio::test]
    async fn test_get_entry_unknown_item_is_not_found() {
        let harness = Harness::new();
        let response = router(&harness)
            .oneshot(request("GET", "/api/v1/404/fb2").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_entry_transient_failure_is_unavailable() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(6, &["epub"]));
        harness.source.set_unavailable(true);

        let response = router(&harness)
            .oneshot(request("GET", "/api/v1/6/epub").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_overlong_variant_is_bad_request() {
        let harness = Harness::new();
        let response = router(&harness)
            .oneshot(
                request("GET", "/api/v1/1/muchtoolong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_then_delete_entry() {
        let harness = Harness::new();
        let app = router(&harness);
        let key = CacheKey::new(9, "pdf").unwrap();

        let create = request("POST", "/api/v1/")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"object_id": 9, "object_type": "pdf", "data": {"chat_id": -77, "message_id": 3}}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            harness.index.get_entry(&key).unwrap().pointer,
            BlobPointer {
                chat_id: -77,
                message_id: 3
            }
        );

        let response = app
            .clone()
            .oneshot(request("DELETE", "/api/v1/9/pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["chat_id"], -77);
        assert!(!harness.index.contains(&key));

        let response = app
            .oneshot(request("DELETE", "/api/v1/9/pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_cache_enqueues_crawl_once() {
        let harness = Harness::new();
        let app = router(&harness);

        for expected in ["accepted", "already_running"] {
            let response = app
                .clone()
                .oneshot(
                    request("POST", "/api/v1/update_cache")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await["status"], expected);
        }
        assert_eq!(harness.queue.pending_jobs(), vec![Job::Crawl]);
    }

    #[tokio::test]
    async fn test_dump_streams_every_entry() {
        let harness = Harness::new();
        for id in 0..(DUMP_PAGE_SIZE as i32 + 3) {
            let key = CacheKey::new(id, "fb2").unwrap();
            harness.index.seed(&key, -1, i64::from(id) + 1);
        }

        let response = router(&harness)
            .oneshot(request("GET", "/api/v1/dump").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/x-ndjson"
        );
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), DUMP_PAGE_SIZE + 3);
        assert_eq!(lines[0]["object_type"], "fb2");
    }

    #[tokio::test]
    async fn test_stats_reports_counts() {
        let harness = Harness::new();
        harness.index.seed(&CacheKey::new(1, "fb2").unwrap(), -1, 1);
        harness.queue.enqueue(&Job::Crawl, Duration::ZERO).await.unwrap();

        let response = router(&harness)
            .oneshot(request("GET", "/api/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["cached_files"], 1);
        assert_eq!(body["jobs"]["ready"], 1);
        assert_eq!(body["jobs"]["failed"], 0);
    }

    #[tokio::test]
    async fn test_download_sets_headers_and_streams() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(3, &["pdf"]));

        let response = router(&harness)
            .oneshot(
                request("GET", "/api/v1/download/3/pdf")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(
            headers[CONTENT_DISPOSITION],
            "attachment; filename=book-3.pdf"
        );
        let caption = general_purpose::STANDARD
            .decode(headers["x-caption-b64"].as_bytes())
            .unwrap();
        assert!(String::from_utf8(caption).unwrap().starts_with("📖 Book 3"));
        assert_eq!(body_bytes(response).await, b"3.pdf");
    }

    #[tokio::test]
    async fn test_download_heals_dangling_pointer() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(4, &["epub"]));
        let key = CacheKey::new(4, "epub").unwrap();
        let stale = harness.index.seed(&key, -5, 5);
        harness.sink.drop_blob(stale.pointer);

        let response = router(&harness)
            .oneshot(
                request("GET", "/api/v1/download/4/epub")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_ne!(harness.index.get_entry(&key).unwrap().pointer, stale.pointer);
        assert_eq!(body_bytes(response).await, b"4.epub");
    }

    #[tokio::test]
    async fn test_metrics_are_open_and_count_fills() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(5, &["fb2"]));
        let registry = Registry::new();
        let metrics = Arc::new(FillMetrics::register(&registry).unwrap());
        let filler = Arc::new(harness.filler().with_metrics(metrics));
        let parts = harness.collaborators();
        let reader = Arc::new(CacheReader::new(parts.clone(), filler, 1));
        let app = create_router(
            AppState::new(reader, parts.index, harness.queue.clone(), KEY).with_registry(registry),
        );

        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/5/fb2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("filecache_fill_outcomes_total{outcome=\"cached\"} 1"));
        assert!(text.contains("filecache_uploads_total 1"));
    }
}
