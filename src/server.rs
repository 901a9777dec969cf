use crate::config::AppConfig;
use crate::downloader::coordinator::Coordinator;
use crate::downloader::ytdlp::YtDlpFetcher;
use crate::downloader::{DownloadJob, ItemStatus, QualityThresholds};
use crate::errors::{AppError, Result};
use crate::processing::FfmpegProcessor;
use crate::search::YtDlpResolver;
use crate::spotify::SpotifyClient;
use crate::utils::generate_download_id;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared handles for the HTTP surface. Download state lives in an
/// in-memory registry keyed by download id.
#[derive(Clone)]
pub struct AppState {
    spotify: Arc<SpotifyClient>,
    config: Arc<AppConfig>,
    downloads: Arc<Mutex<HashMap<String, DownloadState>>>,
}

impl AppState {
    pub fn new(spotify: SpotifyClient, config: AppConfig) -> Self {
        Self {
            spotify: Arc::new(spotify),
            config: Arc::new(config),
            downloads: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadState {
    pub status: DownloadStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Downloading,
    Complete,
    Error,
}

impl DownloadState {
    fn starting() -> Self {
        Self {
            status: DownloadStatus::Starting,
            progress: 0,
            message: "Starting".to_string(),
            file_path: None,
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadAccepted {
    pub download_id: String,
}

struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Resolve(_) => StatusCode::NOT_FOUND,
            AppError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/fetch", post(fetch_metadata))
        .route("/api/download", post(start_download))
        .route("/api/status/{id}", get(download_status))
        .route("/api/file/{id}", get(download_file))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::FatalIo(format!("Cannot bind {}: {}", addr, e)))?;

    info!("[SERVER] Listening on http://{}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| AppError::FatalIo(format!("Server error: {}", e)))
}

/// Resolves a Spotify URL to track metadata without downloading anything.
async fn fetch_metadata(
    State(state): State<AppState>,
    Json(request): Json<UrlRequest>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let tracks = fetch_tracks(&state.spotify, &request.url).await?;
    Ok(Json(serde_json::json!({
        "count": tracks.len(),
        "tracks": tracks,
    })))
}

/// Kicks off a download in the background and returns its id immediately.
async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<UrlRequest>,
) -> std::result::Result<Json<DownloadAccepted>, ApiError> {
    // Reject malformed URLs before accepting the job.
    detect_content_type(&request.url)?;

    let download_id = generate_download_id();
    state
        .downloads
        .lock()
        .await
        .insert(download_id.clone(), DownloadState::starting());

    let task_state = state.clone();
    let task_id = download_id.clone();
    tokio::spawn(async move {
        if let Err(e) = run_download(&task_state, &task_id, &request.url).await {
            error!("[SERVER] Download {} failed: {}", task_id, e);
            update_state(&task_state, &task_id, |s| {
                s.status = DownloadStatus::Error;
                s.message = "Download failed".to_string();
                s.error = Some(e.to_string());
            })
            .await;
        }
    });

    Ok(Json(DownloadAccepted { download_id }))
}

async fn download_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<DownloadState>, ApiError> {
    let downloads = state.downloads.lock().await;
    match downloads.get(&id) {
        Some(download) => Ok(Json(download.clone())),
        None => Err(AppError::InvalidInput(format!("Unknown download id: {}", id)).into()),
    }
}

/// Serves the finished file for a single-track download.
async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let download = {
        let downloads = state.downloads.lock().await;
        downloads.get(&id).cloned()
    };

    let Some(download) = download else {
        return Err(AppError::InvalidInput(format!("Unknown download id: {}", id)).into());
    };
    if download.status != DownloadStatus::Complete {
        return Ok((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "Download not complete" })),
        )
            .into_response());
    }
    let Some(path) = download.file_path else {
        return Ok((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "No single output file for this download" })),
        )
            .into_response());
    };

    let bytes = tokio::fs::read(&path).await.map_err(AppError::from)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download.mp3".to_string());

    Ok((
        [
            (header::CONTENT_TYPE, "audio/mpeg".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn run_download(state: &AppState, id: &str, url: &str) -> Result<()> {
    update_state(state, id, |s| {
        s.status = DownloadStatus::Downloading;
        s.progress = 10;
        s.message = "Fetching metadata".to_string();
    })
    .await;

    let tracks = fetch_tracks(&state.spotify, url).await?;
    if tracks.is_empty() {
        return Err(AppError::InvalidInput("No tracks found for URL".to_string()));
    }
    let total = tracks.len();

    update_state(state, id, |s| {
        s.progress = 20;
        s.message = format!("Downloading {} track(s)", total);
    })
    .await;

    let config = &state.config;
    let bitrate = config.preferred_quality.bitrate_kbps();
    let coordinator = Coordinator::new(
        Arc::new(
            YtDlpResolver::new(Duration::from_secs(config.search_timeout_secs))
                .with_ytdlp_path(config.ytdlp_path.clone()),
        ),
        Arc::new(
            YtDlpFetcher::new(bitrate, Duration::from_secs(config.fetch_timeout_secs))
                .with_ytdlp_path(config.ytdlp_path.clone()),
        ),
        Arc::new(
            FfmpegProcessor::new(bitrate, config.normalize)
                .with_ffmpeg_path(config.ffmpeg_path.clone()),
        ),
        config.max_attempts,
    )
    .with_timeouts(
        Duration::from_secs(config.search_timeout_secs * 6),
        Duration::from_secs(config.fetch_timeout_secs),
    );

    let progress = coordinator.progress();
    let job = DownloadJob::new(tracks, config.output_dir.clone())
        .with_workers(config.max_workers)
        .with_thresholds(QualityThresholds {
            min_file_size_bytes: config.min_file_size_bytes,
            min_bitrate_kbps: config.min_bitrate_kbps,
        });

    // Mirror job progress into the registry while the coordinator runs.
    let poll_state = state.clone();
    let poll_id = id.to_string();
    let poller = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let snapshot = progress.snapshot().await;
            let percent = scale_progress(snapshot.done(), snapshot.total());
            update_state(&poll_state, &poll_id, |s| {
                if s.status == DownloadStatus::Downloading {
                    s.progress = percent;
                }
            })
            .await;
        }
    });

    let result = coordinator.run(job).await;
    poller.abort();
    let result = result?;

    if result.complete_count() == 0 {
        let reason = result
            .outcomes
            .values()
            .find_map(|o| o.error.clone())
            .unwrap_or_else(|| "All downloads failed".to_string());
        return Err(AppError::Fetch(reason));
    }
    if result.failed_count() > 0 {
        warn!(
            "[SERVER] Download {}: {} of {} tracks failed",
            id,
            result.failed_count(),
            total
        );
    }

    let single_file = if total == 1 {
        result
            .outcomes
            .values()
            .find(|o| o.status == ItemStatus::Complete)
            .and_then(|o| o.path.clone())
    } else {
        None
    };

    let complete = result.complete_count();
    update_state(state, id, |s| {
        s.status = DownloadStatus::Complete;
        s.progress = 100;
        s.message = format!("Complete: {}/{} tracks", complete, total);
        s.file_path = single_file;
    })
    .await;

    Ok(())
}

async fn update_state<F: FnOnce(&mut DownloadState)>(state: &AppState, id: &str, apply: F) {
    let mut downloads = state.downloads.lock().await;
    if let Some(download) = downloads.get_mut(id) {
        apply(download);
    }
}

/// Maps item completion onto the 20-85 band; metadata fetch owns 0-20 and
/// finalization owns the rest.
fn scale_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 20;
    }
    20 + ((done as f64 / total as f64) * 65.0) as u8
}

/// Classifies a Spotify URL as track, playlist or album.
pub fn detect_content_type(url: &str) -> Result<&'static str> {
    for content_type in ["track", "playlist", "album"] {
        if url.contains(&format!("/{}/", content_type))
            || url.contains(&format!(":{}:", content_type))
        {
            return Ok(content_type);
        }
    }
    Err(AppError::InvalidInput(format!(
        "URL is not a Spotify track, playlist or album: {}",
        url
    )))
}

async fn fetch_tracks(
    spotify: &SpotifyClient,
    url: &str,
) -> Result<Vec<crate::spotify::TrackMetadata>> {
    match detect_content_type(url)? {
        "playlist" => spotify.get_playlist_tracks(url).await,
        "album" => spotify.get_album_tracks(url).await,
        _ => Ok(vec![spotify.get_track(url).await?]),
    }
}
