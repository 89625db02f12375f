pub mod allocator;
pub mod appliance;
pub mod catalog;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod guide;
pub mod live_stream;
pub mod metrics;
pub mod transcode;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::allocator::TunerAllocator;
use crate::appliance::ApplianceClient;
use crate::catalog::Catalog;
use crate::config::Settings;
use crate::discovery::DeviceRegistry;
use crate::error::{ApiError, Result};
use crate::guide::{GuidePlane, RuleRequest};
use crate::live_stream::LiveWorkers;
use crate::transcode::{BulkBackfill, BulkItem, EpisodeMeta, TranscodeEngine, TranscodeMode};

pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<DeviceRegistry>,
    pub catalog: Catalog,
    pub engine: TranscodeEngine,
    pub bulk: BulkBackfill,
    pub allocator: TunerAllocator,
    pub guide: Arc<GuidePlane>,
}

/// Wire every component together. The caller owns spawning the background
/// loops; this only builds the state.
pub async fn build_state(settings: Settings) -> anyhow::Result<Arc<AppState>> {
    let pool = db::connect(&settings.database.path).await?;
    db::recalculate_series_stats(&pool).await?;

    let client = ApplianceClient::new();
    let registry = DeviceRegistry::new(client.clone(), settings.discovery.clone());
    let catalog = Catalog::new(pool.clone(), client.clone());
    let engine = TranscodeEngine::new(settings.transcoding.clone()).await?;
    let bulk = BulkBackfill::new(engine.clone());
    let workers = LiveWorkers::new(settings.live.clone());
    let allocator = TunerAllocator::new(
        workers,
        client.clone(),
        Arc::clone(&registry),
        pool.clone(),
        settings.live.clone(),
    );
    allocator.startup_load().await?;
    let guide = GuidePlane::new(pool, Arc::clone(&registry), client, settings.guide.clone());

    Ok(Arc::new(AppState {
        settings,
        registry,
        catalog,
        engine,
        bulk,
        allocator,
        guide,
    }))
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/channels", get(channels_handler))
        .route("/api/discover", post(discover_handler))
        .route("/api/shows", get(shows_handler))
        .route("/api/shows/{id}/episodes", get(show_episodes_handler))
        .route("/api/episodes/{id}", get(episode_handler).delete(episode_delete_handler))
        .route("/api/episodes/{id}/progress", put(progress_handler))
        .route(
            "/api/transcode/backfill",
            post(backfill_start_handler).get(backfill_report_handler),
        )
        .route("/api/guide", get(guide_handler))
        .route("/api/guide/search", get(guide_search_handler))
        .route("/api/guide/now", get(guide_now_handler))
        .route(
            "/api/recording-rules",
            get(rules_list_handler).post(rules_add_handler).put(rules_change_handler),
        )
        .route("/api/recording-rules/{id}", delete(rules_delete_handler))
        .route("/stream/{episode_id}/status", get(stream_status_handler))
        .route(
            "/stream/{episode_id}/playlist.m3u8",
            get(stream_playlist_handler).head(stream_playlist_handler),
        )
        .route(
            "/stream/{episode_id}/{filename}",
            get(stream_file_handler).head(stream_file_handler),
        )
        .route("/live/watch", post(live_watch_handler))
        .route("/live/heartbeat", post(live_heartbeat_handler))
        .route("/live/stop", post(live_stop_handler))
        .route("/live/tuners", get(live_tuners_handler))
        .route("/live/{tuner_id}/status", get(live_status_handler))
        .route(
            "/live/{tuner_id}/{filename}",
            get(live_file_handler).head(live_file_handler),
        )
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: Uri) -> impl IntoResponse {
    info!("unmatched request: {} {}", method, uri.path());
    (StatusCode::NOT_FOUND, "no such endpoint\n")
}

async fn index_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "tunercast",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::gather_metrics()))
        .unwrap()
}

async fn devices_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

/// The union of every online appliance's channel lineup, deduplicated by
/// guide number.
async fn channels_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let client = ApplianceClient::new();
    let mut channels: Vec<appliance::LineupEntry> = Vec::new();
    for device in state.registry.online().await {
        match client.lineup(&device).await {
            Ok(lineup) => {
                for entry in lineup {
                    if !channels.iter().any(|c| c.guide_number == entry.guide_number) {
                        channels.push(entry);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("lineup fetch failed: device={} err={}", device.device_id, e);
            }
        }
    }
    channels.sort_by(|a, b| {
        let a_num = a.guide_number.parse::<f64>().unwrap_or(f64::MAX);
        let b_num = b.guide_number.parse::<f64>().unwrap_or(f64::MAX);
        a_num.partial_cmp(&b_num).unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(Json(channels))
}

/// Run a discovery pass, refresh the tuner pool, and sync the catalog.
async fn discover_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let appliances = state.registry.run_pass().await?;
    state.allocator.register_appliances().await?;
    let report = state.catalog.sync_all(&state.registry).await?;
    Ok(Json(serde_json::json!({
        "appliances": appliances,
        "sync": report,
    })))
}

async fn shows_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(Json(state.catalog.list_series().await?))
}

async fn show_episodes_handler(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.catalog.list_episodes(id).await?))
}

async fn episode_handler(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.catalog.get_episode(id).await?))
}

async fn progress_handler(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    body: Option<Json<serde_json::Value>>,
) -> Result<impl IntoResponse> {
    // The position must be a plain non-negative number; anything else is the
    // caller's mistake, not a serialization detail.
    let Some(Json(body)) = body else {
        return Err(ApiError::InvalidArgument("JSON body required".to_string()));
    };
    let position = body
        .get("position")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            ApiError::InvalidArgument("position must be a non-negative number".to_string())
        })?;
    let watched = body.get("watched").and_then(|v| v.as_bool()).unwrap_or(false);

    let episode = state.catalog.update_progress(id, position, watched).await?;
    Ok(Json(episode))
}

#[derive(Deserialize)]
struct DeleteParams {
    #[serde(default)]
    rerecord: Option<u8>,
}

async fn episode_delete_handler(
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    let rerecord = params.rerecord == Some(1);
    // Appliance first; only then the cache directory and the local row.
    let episode = state.catalog.delete_episode(id, rerecord).await?;
    state.engine.delete_transcode(id).await?;
    Ok(Json(serde_json::json!({
        "deleted": episode.id,
        "rerecord": rerecord,
    })))
}

#[derive(Deserialize, Default)]
struct BackfillBody {
    /// Restrict the run to one series row; the whole catalog otherwise.
    series_id: Option<i64>,
}

async fn backfill_start_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<BackfillBody>>,
) -> Result<impl IntoResponse> {
    let scope = body.map(|Json(b)| b).unwrap_or_default();
    let episodes = match scope.series_id {
        Some(series_row) => state.catalog.list_episodes(series_row).await?,
        None => state.catalog.list_all_episodes().await?,
    };
    let items: Vec<BulkItem> = episodes
        .into_iter()
        .map(|ep| BulkItem {
            episode_id: ep.id,
            source_url: ep.source_url,
            meta: EpisodeMeta {
                show_name: Some(ep.title),
                episode_name: ep.episode_title,
                air_date: ep.original_airdate,
            },
        })
        .collect();
    Ok(Json(state.bulk.start(items).await?))
}

async fn backfill_report_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bulk.report().await)
}

async fn guide_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    state.guide.ensure_fresh().await?;
    Ok(Json(state.guide.guide_window().await?))
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    channel: Option<String>,
    limit: Option<i64>,
}

async fn guide_search_handler(
    Query(params): Query<SearchParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    state.guide.ensure_fresh().await?;
    let hits = state
        .guide
        .search(
            &params.q,
            params.channel.as_deref(),
            params.limit.unwrap_or(50).clamp(1, 500),
        )
        .await?;
    Ok(Json(hits))
}

async fn guide_now_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    state.guide.ensure_fresh().await?;
    Ok(Json(state.guide.now_playing().await?))
}

async fn rules_list_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(Json(state.guide.list_rules().await?))
}

async fn rules_add_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RuleRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.guide.add_rule(&request).await?))
}

async fn rules_change_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RuleRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.guide.change_rule(&request).await?))
}

async fn rules_delete_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    state.guide.delete_rule(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Entry point of recorded playback: make sure a transcode exists for the
/// episode (idempotent) and serve the playlist from its directory.
async fn stream_playlist_handler(
    Path(episode_id): Path<i64>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let player = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    info!("playlist requested for episode {} by {}", episode_id, player);

    let episode = state.catalog.get_episode(episode_id).await?;
    state
        .engine
        .start_transcode(
            episode_id,
            &episode.source_url,
            TranscodeMode::Interactive,
            EpisodeMeta {
                show_name: Some(episode.title.clone()),
                episode_name: episode.episode_title.clone(),
                air_date: episode.original_airdate,
            },
        )
        .await?;

    let (bytes, content_type) = state.engine.serve_file(episode_id, "stream.m3u8").await?;
    Ok(media_response(bytes, content_type))
}

async fn stream_file_handler(
    Path((episode_id, filename)): Path<(i64, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let (bytes, content_type) = state.engine.serve_file(episode_id, &filename).await?;
    Ok(ranged_media_response(bytes, content_type, &headers))
}

async fn stream_status_handler(
    Path(episode_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.engine.status(episode_id).await?))
}

#[derive(Deserialize)]
struct WatchBody {
    channel: String,
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn live_watch_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WatchBody>,
) -> Result<impl IntoResponse> {
    let response = state.allocator.watch(&body.channel, &body.client_id).await?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct ClientBody {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn live_heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClientBody>,
) -> Result<impl IntoResponse> {
    if state.allocator.heartbeat(&body.client_id).await {
        Ok(Json(serde_json::json!({ "ok": true })))
    } else {
        Err(ApiError::NotFound(format!("viewer {}", body.client_id)))
    }
}

async fn live_stop_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClientBody>,
) -> Result<impl IntoResponse> {
    state.allocator.release(&body.client_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn live_tuners_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.allocator.list_tuners().await)
}

async fn live_status_handler(
    Path(tuner_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.allocator.tuner_status(&tuner_id).await?))
}

async fn live_file_handler(
    Path((tuner_id, filename)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let (bytes, content_type) = state.allocator.serve_live_file(&tuner_id, &filename).await?;
    Ok(ranged_media_response(bytes, content_type, &headers))
}

fn media_response(bytes: Vec<u8>, content_type: &'static str) -> Response {
    Response::builder()
        .header("Content-Type", content_type)
        .header("Content-Length", bytes.len().to_string())
        .header("Accept-Ranges", "bytes")
        .header("Cache-Control", "no-cache")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(bytes))
        .unwrap()
}

/// Resolve a `Range` header against a body of `total` bytes. Handles the
/// three single-range forms (`bytes=a-b`, `bytes=a-`, `bytes=-n`), clamping
/// an overlong end to the last byte. Multi-range requests and anything
/// unsatisfiable resolve to None.
fn resolve_byte_range(header: &str, total: usize) -> Option<(usize, usize)> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if total == 0 || spec.contains(',') {
        return None;
    }
    let (low, high) = spec.split_once('-')?;
    let last = total - 1;
    match (low.trim(), high.trim()) {
        ("", "") => None,
        // Suffix form: the final n bytes.
        ("", n) => {
            let n: usize = n.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some((total.saturating_sub(n), last))
        }
        // Open-ended: from an offset to the end.
        (a, "") => {
            let start: usize = a.parse().ok()?;
            if start > last {
                return None;
            }
            Some((start, last))
        }
        (a, b) => {
            let start: usize = a.parse().ok()?;
            let end: usize = b.parse().ok()?;
            if start > end || start > last {
                return None;
            }
            Some((start, end.min(last)))
        }
    }
}

/// Some HLS stacks probe segments with small byte ranges before committing
/// to playback. A resolvable range gets a 206; anything else falls back to
/// the full body.
fn ranged_media_response(bytes: Vec<u8>, content_type: &'static str, headers: &HeaderMap) -> Response {
    let total = bytes.len();
    let resolved = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| resolve_byte_range(h, total));

    let Some((start, end)) = resolved else {
        return media_response(bytes, content_type);
    };

    let body = bytes[start..=end].to_vec();
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header("Content-Type", content_type)
        .header("Content-Length", body.len().to_string())
        .header("Content-Range", format!("bytes {start}-{end}/{total}"))
        .header("Accept-Ranges", "bytes")
        .header("Cache-Control", "no-cache")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(body))
        .unwrap()
}
