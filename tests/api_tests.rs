use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use std::path::Path;
use std::sync::Arc;
use tower::util::ServiceExt;
use tunercast::appliance::{Appliance, RecordedEpisode, RecordedSeries};
use tunercast::config::Settings;
use tunercast::{build_state, create_app, AppState};

fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.database.path = dir.join("test.db");
    settings.transcoding.cache_dir = dir.join("cache");
    settings.live.cache_dir = dir.join("live");
    settings
}

fn test_appliance() -> Appliance {
    Appliance {
        device_id: "1234ABCD".into(),
        ip: "127.0.0.1".into(),
        base_url: "http://127.0.0.1:65530".into(),
        friendly_name: "Test DVR".into(),
        model_number: "HDVR-2US".into(),
        device_auth: "auth-token".into(),
        tuner_count: 2,
        lineup_url: String::new(),
        storage_url: Some("http://127.0.0.1:65530/recorded_files.json".into()),
        total_space: Some(1_000_000),
        free_space: Some(500_000),
        last_seen: 0,
        online: true,
    }
}

fn test_series() -> RecordedSeries {
    RecordedSeries {
        series_id: "SER1".into(),
        title: "Night Court".into(),
        category: Some("series".into()),
        image_url: None,
        episodes_url: "http://127.0.0.1:65530/episodes/SER1".into(),
        start_time: None,
    }
}

fn test_episode(program_id: &str, cmd_url: &str) -> RecordedEpisode {
    RecordedEpisode {
        program_id: program_id.into(),
        series_id: "SER1".into(),
        title: "Night Court".into(),
        episode_title: Some("Pilot".into()),
        episode_number: Some("S01E01".into()),
        synopsis: Some("The first one.".into()),
        channel_name: Some("KTVU".into()),
        channel_number: Some("2.1".into()),
        start_time: 1_700_000_000,
        end_time: 1_700_003_600,
        original_airdate: None,
        record_start_time: Some(1_700_000_000),
        record_end_time: Some(1_700_003_600),
        filename: Some("night-court.mpg".into()),
        play_url: "http://127.0.0.1:65530/play/EP1".into(),
        cmd_url: cmd_url.into(),
        resume: None,
        record_success: Some(1),
        image_url: None,
    }
}

/// Seed one device, one series, one episode; returns the episode row id.
async fn seed_episode(state: &Arc<AppState>, cmd_url: &str) -> i64 {
    let device_row = state.catalog.upsert_device(&test_appliance()).await.unwrap();
    let series_row = state
        .catalog
        .upsert_series(device_row, &test_series())
        .await
        .unwrap();
    state
        .catalog
        .upsert_episode(series_row, &test_episode("EP1", cmd_url))
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_index_reports_name_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "tunercast");
}

#[tokio::test]
async fn test_metrics_endpoint_is_text() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("Content-Type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_shows_and_episode_listing() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    seed_episode(&state, "").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/shows").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let shows = body_json(response).await;
    assert_eq!(shows.as_array().unwrap().len(), 1);
    assert_eq!(shows[0]["title"], "Night Court");
    assert_eq!(shows[0]["episode_count"], 1);
    let series_row = shows[0]["id"].as_i64().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/shows/{series_row}/episodes"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let episodes = body_json(response).await;
    assert_eq!(episodes.as_array().unwrap().len(), 1);
    assert_eq!(episodes[0]["episode_number"], "S01E01");
    assert_eq!(episodes[0]["season"], 1);
}

#[tokio::test]
async fn test_episode_play_url_points_at_local_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let id = seed_episode(&state, "").await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/episodes/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let episode = body_json(response).await;
    assert_eq!(
        episode["play_url"],
        format!("/stream/{id}/playlist.m3u8")
    );
    assert_eq!(episode["source_url"], "http://127.0.0.1:65530/play/EP1");
}

#[tokio::test]
async fn test_progress_write_through_survives_dead_appliance() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    // A cmd URL nothing listens on: the appliance mirror must fail quietly.
    let id = seed_episode(&state, "http://127.0.0.1:9/recorded/cmd?id=EP1").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/episodes/{id}/progress"))
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"position": 1800, "watched": false}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/episodes/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let episode = body_json(response).await;
    assert_eq!(episode["resume_position"], 1800);
    assert_eq!(episode["resume_minutes"], 30);
    assert_eq!(episode["watched"], false);
}

#[tokio::test]
async fn test_progress_rejects_non_numeric_position() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let id = seed_episode(&state, "").await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/episodes/{id}/progress"))
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"position": "half way"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_progress_beyond_duration_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let id = seed_episode(&state, "").await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/episodes/{id}/progress"))
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"position": 99999}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_episode_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    for uri in ["/api/episodes/999", "/stream/999/playlist.m3u8", "/stream/999/status"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {uri}");
    }
}

#[tokio::test]
async fn test_segment_path_validation() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let id = seed_episode(&state, "").await;
    let app = create_app(state);

    for name in ["evil..ts", "segment00000.ts", "index.m3u8"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/stream/{id}/{name}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "name {name}");
    }
}

#[tokio::test]
async fn test_delete_episode_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let id = seed_episode(&state, "").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/episodes/{id}?rerecord=0"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/episodes/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_live_watch_without_tuners_is_503() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/live/watch")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"channel": "2.1", "clientId": "A"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_live_heartbeat_and_stop_unknown_client() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    for uri in ["/live/heartbeat", "/live/stop"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"clientId": "ghost"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {uri}");
    }
}

#[tokio::test]
async fn test_live_tuners_empty_listing() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/live/tuners").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let tuners = body_json(response).await;
    assert!(tuners.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_backfill_report_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/transcode/backfill")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["total"], 0);
    assert_eq!(report["running"], false);
}

#[tokio::test]
async fn test_segment_byte_range_serving() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    // A finished transcode on disk; startup recovery registers it.
    let cache = settings.transcoding.cache_dir.join("42");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(
        cache.join("transcode.json"),
        r#"{"state":"complete","start_time":1,"source_url":"u"}"#,
    )
    .unwrap();
    std::fs::write(cache.join("stream.m3u8"), "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();
    std::fs::write(cache.join("segment0000.ts"), vec![0x47; 188]).unwrap();

    let state = build_state(settings).await.unwrap();
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/stream/42/segment0000.ts")
                .header("Range", "bytes=0-99")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("Content-Range").unwrap(),
        "bytes 0-99/188"
    );
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    assert_eq!(bytes.len(), 100);

    // An open-ended range runs to the last byte.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/stream/42/segment0000.ts")
                .header("Range", "bytes=100-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("Content-Range").unwrap(),
        "bytes 100-187/188"
    );

    // A range that cannot be satisfied falls back to the full segment.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/stream/42/segment0000.ts")
                .header("Range", "bytes=500-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "video/mp2t"
    );
}

#[tokio::test]
async fn test_fallback_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(test_settings(dir.path())).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/no/such/route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
