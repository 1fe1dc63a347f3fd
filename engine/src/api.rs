use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::{
    extract::{Path as PathParam, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::error::PlaybackError;
use crate::events::{Notifier, StationEvent};
use crate::history::HistoryEntry;
use crate::playback::{Snapshot, Station};
use crate::saved_playlist::{PlaylistDraft, SavedPlaylist};
use crate::store::SqliteStore;
use crate::track::Track;

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;
const LISTENER_COUNT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub station: Station,
    pub store: SqliteStore,
}

/// JSON error body: `{"message": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<PlaybackError> for ApiError {
    fn from(e: PlaybackError) -> Self {
        let status = match e {
            PlaybackError::EmptyQueue => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{e:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("request failed: {}", self.message);
        }
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct TrackIds {
    ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

pub fn build_router(state: AppState) -> Router {
    let segments = segment_service(&state.station.settings().segment_dir);

    let router = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/version", get(version))
        .route("/stream", get(stream))
        .route("/api/v1/playback", get(playback_get))
        .route("/api/v1/playback/play", post(playback_play))
        .route("/api/v1/playback/pause", post(playback_pause))
        .route(
            "/api/v1/queue",
            get(queue_get).post(queue_add).put(queue_reorder).delete(queue_remove),
        )
        .route("/api/v1/tracks", get(tracks).delete(tracks_delete))
        .route("/api/v1/playlists", get(playlists).post(playlist_add))
        .route(
            "/api/v1/playlists/:id",
            get(playlist_get).put(playlist_edit).delete(playlist_delete),
        )
        .route("/api/v1/playlists/:id/queue", post(playlist_enqueue))
        .route("/api/v1/history", get(history))
        .route("/api/v1/events", get(events))
        .with_state(state);

    let router = match segments {
        (Some(mount), service) => router.nest_service(&mount, service),
        (None, service) => router.fallback_service(service),
    };
    router.layer(TraceLayer::new_for_http())
}

// Playlist entries are `segment_dir/<file>`, resolved by players relative to
// `/stream`, so the directory is mounted under its own path.
fn segment_service(segment_dir: &Path) -> (Option<String>, ServeDir) {
    let service = ServeDir::new(segment_dir);
    let raw = segment_dir.to_string_lossy();
    let rel = raw
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if rel.is_empty() || rel == "." {
        (None, service)
    } else {
        (Some(format!("/{rel}")), service)
    }
}

/// Publishes the SSE subscriber count every few seconds.
pub fn spawn_listener_counter(notifier: Notifier) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LISTENER_COUNT_PERIOD);
        loop {
            interval.tick().await;
            let n = notifier.subscribers();
            notifier.notify(StationEvent::Listeners(n));
        }
    })
}

async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "version": state.version }))
}

async fn stream(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.station.rendered_playlist_text().await;
    (
        [
            (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
}

async fn playback_get(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.station.snapshot().await)
}

async fn playback_play(State(state): State<AppState>) -> ApiResult<Snapshot> {
    state.station.play().await?;
    Ok(Json(state.station.snapshot().await))
}

async fn playback_pause(State(state): State<AppState>) -> Json<Snapshot> {
    state.station.pause().await;
    Json(state.station.snapshot().await)
}

async fn queue_get(State(state): State<AppState>) -> ApiResult<Vec<Track>> {
    Ok(Json(state.store.queue().await?))
}

async fn queue_add(
    State(state): State<AppState>,
    Json(req): Json<TrackIds>,
) -> ApiResult<Vec<Track>> {
    state
        .store
        .add_to_queue(req.ids)
        .await
        .map_err(ApiError::bad_request)?;
    state.station.reload().await?;
    Ok(Json(state.store.queue().await?))
}

async fn queue_reorder(
    State(state): State<AppState>,
    Json(req): Json<TrackIds>,
) -> ApiResult<Vec<Track>> {
    state
        .store
        .reorder_queue(req.ids)
        .await
        .map_err(ApiError::bad_request)?;
    state.station.reload().await?;
    Ok(Json(state.store.queue().await?))
}

async fn queue_remove(
    State(state): State<AppState>,
    Json(req): Json<TrackIds>,
) -> ApiResult<Vec<Track>> {
    state.store.remove_from_queue(req.ids).await?;
    state.station.reload().await?;
    Ok(Json(state.store.queue().await?))
}

async fn tracks(State(state): State<AppState>) -> ApiResult<Vec<Track>> {
    Ok(Json(state.store.tracks().await?))
}

// Source files go too; a file that cannot be removed only costs disk space.
async fn tracks_delete(
    State(state): State<AppState>,
    Json(req): Json<TrackIds>,
) -> ApiResult<Vec<Track>> {
    let deleted = state.store.delete_tracks(req.ids).await?;
    for track in &deleted {
        if let Err(e) = tokio::fs::remove_file(&track.path).await {
            warn!("could not delete {}: {e}", track.path);
        }
    }
    if !deleted.is_empty() {
        info!("deleted {} track(s) from the library", deleted.len());
    }
    state.station.reload().await?;
    Ok(Json(state.store.tracks().await?))
}

async fn playlists(State(state): State<AppState>) -> ApiResult<Vec<SavedPlaylist>> {
    Ok(Json(state.store.playlists().await?))
}

async fn playlist_add(
    State(state): State<AppState>,
    Json(draft): Json<PlaylistDraft>,
) -> ApiResult<SavedPlaylist> {
    draft.validate().map_err(ApiError::bad_request)?;
    let playlist = state
        .store
        .add_playlist(draft)
        .await
        .map_err(ApiError::bad_request)?;
    Ok(Json(playlist))
}

async fn playlist_get(
    State(state): State<AppState>,
    PathParam(id): PathParam<String>,
) -> ApiResult<SavedPlaylist> {
    match state.store.playlist(&id).await? {
        Some(playlist) => Ok(Json(playlist)),
        None => Err(ApiError::not_found(format!("playlist {id} not found"))),
    }
}

async fn playlist_edit(
    State(state): State<AppState>,
    PathParam(id): PathParam<String>,
    Json(draft): Json<PlaylistDraft>,
) -> ApiResult<SavedPlaylist> {
    draft.validate().map_err(ApiError::bad_request)?;
    match state
        .store
        .edit_playlist(&id, draft)
        .await
        .map_err(ApiError::bad_request)?
    {
        Some(playlist) => Ok(Json(playlist)),
        None => Err(ApiError::not_found(format!("playlist {id} not found"))),
    }
}

async fn playlist_delete(
    State(state): State<AppState>,
    PathParam(id): PathParam<String>,
) -> ApiResult<serde_json::Value> {
    if !state.store.delete_playlist(&id).await? {
        return Err(ApiError::not_found(format!("playlist {id} not found")));
    }
    Ok(Json(json!({ "message": "playlist deleted" })))
}

/// Appends the playlist's tracks to the queue, skipping ones already queued.
async fn playlist_enqueue(
    State(state): State<AppState>,
    PathParam(id): PathParam<String>,
) -> ApiResult<Vec<Track>> {
    let Some(playlist) = state.store.playlist(&id).await? else {
        return Err(ApiError::not_found(format!("playlist {id} not found")));
    };
    let ids = playlist.tracks.into_iter().map(|t| t.id).collect();
    state.store.add_to_queue(ids).await?;
    state.station.reload().await?;
    Ok(Json(state.store.queue().await?))
}

async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Vec<HistoryEntry>> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.store.recent_history(limit).await?))
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Lagged receivers skip what they missed.
    let stream = BroadcastStream::new(state.station.notifier().subscribe()).filter_map(|res| {
        res.ok()
            .map(|ev| Ok::<_, Infallible>(Event::default().event(ev.name()).data(ev.data())))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::playback::StationSettings;
    use crate::transcoder::Transcoder;

    struct NoopTranscoder;

    #[async_trait]
    impl Transcoder for NoopTranscoder {
        async fn ensure_segments(&self, _: &Track, _: &Path, _: u32) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn app(dir: &tempfile::TempDir) -> (Router, SqliteStore) {
        let store = SqliteStore::open(dir.path().join("onair.db")).await.unwrap();
        let settings = StationSettings {
            segment_dir: dir.path().join("segments"),
            ..StationSettings::default()
        };
        let station = Station::new(
            settings,
            Arc::new(store.clone()),
            Arc::new(NoopTranscoder),
            Arc::new(store.clone()),
            Notifier::default(),
        );
        let state = AppState {
            version: "test".into(),
            station,
            store: store.clone(),
        };
        (build_router(state), store)
    }

    async fn add_track(store: &SqliteStore, id: &str) {
        store
            .add_track(Track {
                id: id.into(),
                name: format!("Song {id}"),
                path: format!("{id}.mp3"),
                duration: 12.0,
                bit_rate: 128,
            })
            .await
            .unwrap();
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let (status, body) = send(&app, request("GET", "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn play_on_empty_queue_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let (status, body) = send(&app, request("POST", "/api/v1/playback/play", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["message"], "playback queue is empty");
    }

    #[tokio::test]
    async fn stream_is_empty_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let resp = app.clone().oneshot(request("GET", "/stream", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], HLS_CONTENT_TYPE);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn queue_then_play_serves_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(&dir).await;
        add_track(&store, "a").await;
        add_track(&store, "b").await;

        let (status, body) = send(
            &app,
            request("POST", "/api/v1/queue", Some(json!({ "ids": ["a", "b"] }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let queued: Vec<Track> = serde_json::from_str(&body).unwrap();
        assert_eq!(queued.len(), 2);

        let (status, body) = send(&app, request("POST", "/api/v1/playback/play", None)).await;
        assert_eq!(status, StatusCode::OK);
        let snap: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(snap["isPlaying"], true);
        assert_eq!(snap["currentTrack"]["name"], "Song a");

        let (_, text) = send(&app, request("GET", "/stream", None)).await;
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("segments/a-0.ts"));

        let (_, body) = send(&app, request("GET", "/api/v1/history", None)).await;
        let history: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(history[0]["trackName"], "Song a");

        let (_, body) = send(&app, request("POST", "/api/v1/playback/pause", None)).await;
        let snap: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(snap["isPlaying"], false);
    }

    #[tokio::test]
    async fn queue_edits_validate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(&dir).await;
        add_track(&store, "a").await;

        let (status, _) = send(
            &app,
            request("POST", "/api/v1/queue", Some(json!({ "ids": ["missing"] }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        send(&app, request("POST", "/api/v1/queue", Some(json!({ "ids": ["a"] })))).await;
        let (status, _) = send(
            &app,
            request("PUT", "/api/v1/queue", Some(json!({ "ids": ["a", "a"] }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            request("DELETE", "/api/v1/queue", Some(json!({ "ids": ["a"] }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn deleting_a_playing_track_reloads_the_station() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(&dir).await;
        for id in ["a", "b", "c"] {
            add_track(&store, id).await;
        }
        send(&app, request("POST", "/api/v1/queue", Some(json!({ "ids": ["a", "b", "c"] })))).await;
        send(&app, request("POST", "/api/v1/playback/play", None)).await;

        let (status, body) = send(
            &app,
            request("DELETE", "/api/v1/tracks", Some(json!({ "ids": ["a"] }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let library: Vec<Track> = serde_json::from_str(&body).unwrap();
        let ids: Vec<&str> = library.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        // The queue lost its head, so playback restarted on the new one.
        let (_, body) = send(&app, request("GET", "/api/v1/playback", None)).await;
        let snap: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(snap["isPlaying"], true);
        assert_eq!(snap["currentTrack"]["id"], "b");
    }

    #[tokio::test]
    async fn saved_playlists_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(&dir).await;
        add_track(&store, "a").await;
        add_track(&store, "b").await;

        let (status, _) = send(
            &app,
            request("POST", "/api/v1/playlists", Some(json!({ "name": "x" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/v1/playlists",
                Some(json!({ "name": "Morning", "trackIds": ["b", "a"] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let created: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(created["trackCount"], 2);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            request("POST", &format!("/api/v1/playlists/{id}/queue"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let queued: Vec<Track> = serde_json::from_str(&body).unwrap();
        let ids: Vec<&str> = queued.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);

        let (status, _) = send(
            &app,
            request("DELETE", &format!("/api/v1/playlists/{id}"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, request("GET", &format!("/api/v1/playlists/{id}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let segments = dir.path().join("segments");
        std::fs::create_dir_all(&segments).unwrap();
        std::fs::write(segments.join("a-0.ts"), b"mpegts").unwrap();

        let uri = format!("{}/a-0.ts", segments.display());
        let (status, body) = send(&app, request("GET", &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "mpegts");
    }

    #[test]
    fn relative_segment_dir_is_mounted_under_its_path() {
        assert_eq!(segment_service(Path::new("static/tmp")).0.as_deref(), Some("/static/tmp"));
        assert_eq!(segment_service(Path::new("./static/tmp/")).0.as_deref(), Some("/static/tmp"));
        assert_eq!(segment_service(Path::new(".")).0, None);
    }
}
