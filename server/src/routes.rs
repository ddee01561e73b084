use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use frame_feed_common::config::Config;
use frame_feed_pipeline::{multipart, CloseReason, Feed, FeedClosed, FeedState};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const VIEWER_PAGE: &str = include_str!("../static/viewer.html");

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub feed: Feed,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub jpeg_quality: u8,
    pub server_ip: String,
    pub port: u16,
}

impl AppState {
    pub fn new(feed: Feed, config: &Config, server_ip: String) -> Self {
        Self {
            feed,
            width: config.camera.width,
            height: config.camera.height,
            fps: config.camera.fps,
            jpeg_quality: config.encoding.jpeg_quality,
            server_ip,
            port: config.server.port,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Status {
    status: &'static str,
    resolution: String,
    jpeg_quality: u8,
    fps: u32,
    server_ip: String,
    port: u16,
    subscribers: usize,
    sequence: u64,
    frames_published: u64,
    capture_errors: u64,
    encode_errors: u64,
    measured_fps: f64,
}

fn status_label(state: &FeedState) -> &'static str {
    match state {
        FeedState::Starting => "starting",
        FeedState::Live(_) => "online",
        FeedState::Closed(CloseReason::CameraUnavailable) => "camera_unavailable",
        FeedState::Closed(CloseReason::Shutdown) => "stopped",
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /: viewer page
async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(
        VIEWER_PAGE
            .replace("{{width}}", &state.width.to_string())
            .replace("{{height}}", &state.height.to_string()),
    )
}

/// GET /video_feed: endless multipart stream of the latest frames
async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    match state.feed.subscribe() {
        Ok(session) => {
            info!(session = session.id(), "viewer connected");
            (
                [
                    (header::CONTENT_TYPE, multipart::content_type(state.feed.boundary())),
                    (header::CACHE_CONTROL, "no-cache, private".to_string()),
                ],
                Body::from_stream(session.into_body_stream()),
            )
                .into_response()
        }
        Err(FeedClosed(reason)) => {
            warn!(?reason, "rejecting viewer, feed is closed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("video feed unavailable: {reason:?}"),
            )
                .into_response()
        }
    }
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    let feed_state = state.feed.state();
    let stats = state.feed.stats();
    Json(Status {
        status: status_label(&feed_state),
        resolution: format!("{}x{}", state.width, state.height),
        jpeg_quality: state.jpeg_quality,
        fps: state.fps,
        server_ip: state.server_ip.clone(),
        port: state.port,
        subscribers: stats.subscribers,
        sequence: stats.sequence,
        frames_published: stats.frames_published,
        capture_errors: stats.capture_errors,
        encode_errors: stats.encode_errors,
        measured_fps: stats.measured_fps,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Bytes;
    use axum::http::Request;
    use frame_feed_pipeline::camera::SyntheticBackend;
    use frame_feed_pipeline::{
        BroadcastSettings, CameraSettings, CameraSource, EncodeError, FrameBroadcaster,
        FrameEncoder, RawFrame,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    /// Minimal stand-in for JPEG output.
    struct MarkerEncoder;

    impl FrameEncoder for MarkerEncoder {
        fn encode(&mut self, raw: &RawFrame) -> Result<Bytes, EncodeError> {
            let mut out = vec![0xFF, 0xD8];
            out.extend_from_slice(&raw.rgb[..3]);
            out.extend_from_slice(&[0xFF, 0xD9]);
            Ok(Bytes::from(out))
        }
    }

    fn test_config(index: u32) -> Config {
        Config::from_toml(&format!(
            "[camera]\nindex = {index}\nwidth = 32\nheight = 24\nfps = 50\n\
             [encoding]\njpeg_quality = 60\n\
             [broadcaster]\nwake_interval_ms = 20"
        ))
        .unwrap()
    }

    /// Fails every other frame.
    struct FlakyEncoder {
        calls: u32,
    }

    impl FrameEncoder for FlakyEncoder {
        fn encode(&mut self, raw: &RawFrame) -> Result<Bytes, EncodeError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(EncodeError::Jpeg("flaky".into()));
            }
            MarkerEncoder.encode(raw)
        }
    }

    fn test_state(index: u32) -> Arc<AppState> {
        state_with_encoder(index, MarkerEncoder)
    }

    fn state_with_encoder(index: u32, encoder: impl FrameEncoder + 'static) -> Arc<AppState> {
        let config = test_config(index);
        let camera = CameraSource::new(
            CameraSettings::from(&config.camera),
            SyntheticBackend::new(1),
        );
        let feed = FrameBroadcaster::spawn(
            Arc::new(camera),
            encoder,
            BroadcastSettings::from_config(&config),
        )
        .unwrap();
        Arc::new(AppState::new(feed, &config, "192.0.2.7".into()))
    }

    async fn wait_for<F: Fn(&FeedState) -> bool>(feed: &Feed, done: F) {
        for _ in 0..200 {
            if done(&feed.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("feed never reached the expected state: {:?}", feed.state());
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn status_reports_live_feed() {
        let state = test_state(0);
        wait_for(&state.feed, |s| matches!(s, FeedState::Live(_))).await;

        let json = get_json(router(Arc::clone(&state)), "/status").await;
        assert_eq!(json["status"], "online");
        assert_eq!(json["resolution"], "32x24");
        assert_eq!(json["jpeg_quality"], 60);
        assert_eq!(json["fps"], 50);
        assert_eq!(json["server_ip"], "192.0.2.7");
        assert_eq!(json["port"], 5000);
        assert!(json["sequence"].as_u64().unwrap() >= 1);
        assert_eq!(json["capture_errors"], 0);
        assert_eq!(json["encode_errors"], 0);

        state.feed.stop();
        let feed = state.feed.clone();
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }

    #[tokio::test]
    async fn status_counts_encode_errors() {
        let state = state_with_encoder(0, FlakyEncoder { calls: 0 });
        wait_for(&state.feed, |s| s.sequence() >= 3).await;

        let json = get_json(router(Arc::clone(&state)), "/status").await;
        assert!(json["encode_errors"].as_u64().unwrap() >= 2);
        assert_eq!(json["capture_errors"], 0);
        assert_eq!(json["status"], "online");

        state.feed.stop();
        let feed = state.feed.clone();
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_missing_camera() {
        let state = test_state(3);
        wait_for(&state.feed, FeedState::is_closed).await;

        let json = get_json(router(state), "/status").await;
        assert_eq!(json["status"], "camera_unavailable");
        assert_eq!(json["subscribers"], 0);
    }

    #[tokio::test]
    async fn video_feed_streams_multipart_parts() {
        let state = test_state(0);
        let response = router(Arc::clone(&state))
            .oneshot(Request::get("/video_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache, private");
        assert_eq!(state.feed.subscriber_count(), 1);

        let mut body = response.into_body();
        let mut reader = multipart::MultipartReader::new("frame");
        let mut parts = Vec::new();
        while parts.len() < 2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
                .await
                .expect("no frame within 2s")
                .expect("body ended")
                .unwrap();
            if let Ok(data) = frame.into_data() {
                parts.extend(reader.push(&data));
            }
        }
        assert!(parts.iter().all(|p| p.starts_with(&[0xFF, 0xD8])));

        drop(body);
        assert_eq!(state.feed.subscriber_count(), 0);

        state.feed.stop();
        let feed = state.feed.clone();
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }

    #[tokio::test]
    async fn video_feed_ends_on_stop() {
        let state = test_state(0);
        let response = router(Arc::clone(&state))
            .oneshot(Request::get("/video_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        state.feed.stop();

        let collected = tokio::time::timeout(Duration::from_secs(2), response.into_body().collect())
            .await
            .expect("stream did not end after stop");
        assert!(collected.is_ok());

        let feed = state.feed.clone();
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }

    #[tokio::test]
    async fn video_feed_unavailable_without_camera() {
        let state = test_state(5);
        wait_for(&state.feed, FeedState::is_closed).await;

        let response = router(state)
            .oneshot(Request::get("/video_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn index_embeds_resolution() {
        let state = test_state(0);
        let response = router(Arc::clone(&state))
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8(body.to_vec()).unwrap();
        assert!(page.contains("32x24"));
        assert!(page.contains("/video_feed"));
        assert!(!page.contains("{{"));

        state.feed.stop();
        let feed = state.feed.clone();
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }
}
