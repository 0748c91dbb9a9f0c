use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    app::AppState, config::non_empty, error::ApiError, extractor::ExtractOptions,
    workspace::JobWorkspace,
};

const SERVICE_NAME: &str = "yt-dlp-audio-service";
const SERVICE_VERSION: &str = "1.0";
const DOWNLOAD_NAME: &str = "audio.mp3";
const DOWNLOAD_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

pub async fn download(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let Some(url) = requested_url(&body) else {
        warn!("Rejected download request without a URL");
        return Err(ApiError::missing_url());
    };

    let request_id = Uuid::new_v4();
    async {
        info!("Downloading audio from: {url}");
        let result = fetch_audio(&state, &url, request_id).await;
        if let Err(error) = &result {
            if error.status.is_client_error() {
                error!("yt-dlp download error for {url}: {}", error.message());
            } else {
                error!("Unexpected error for {url}: {}", error.message());
            }
        }
        result
    }
    .instrument(info_span!("download", %request_id))
    .await
}

fn requested_url(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<DownloadRequest>(body)
        .ok()?
        .url
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
}

async fn fetch_audio(state: &AppState, url: &str, request_id: Uuid) -> Result<Response, ApiError> {
    let _permit = state
        .download_semaphore
        .acquire()
        .await
        .map_err(|_| ApiError::internal("Download capacity is unavailable"))?;

    let workspace = JobWorkspace::create(&state.work_dir, request_id)?;
    let options = ExtractOptions::mp3_into(workspace.path(), state.config.ffmpeg_path.clone());

    state.extractor.extract(url, &options).await?;

    let audio_path = workspace.locate_output().await?;
    info!("Download complete: {:?}", audio_path);

    let (stream, length) = workspace.into_stream(&audio_path).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(DOWNLOAD_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(DOWNLOAD_NAME))
            .map_err(|_| ApiError::internal("Could not build the download header"))?,
    );

    Ok((headers, Body::from_stream(stream)).into_response())
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
