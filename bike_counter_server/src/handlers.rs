use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use bike_counter::multipart::MultipartFramer;
use bike_counter::{StatisticsSnapshot, spawn_stream};
use bytes::Bytes;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::AppState;
use crate::page::{self, PageView, VIDEO_FIELD};

pub const NO_VIDEO: &str = "No video uploaded.";

/// `GET /`: the upload form. Never touches the session.
pub async fn index() -> Html<String> {
    Html(page::render(&PageView::default()))
}

/// `POST /`: store the uploaded video and start a new session for it.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload: Option<(String, Bytes)> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed upload");
                return e.into_response();
            }
        };
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }
        // Browsers send an unnamed, empty part when no file was picked.
        let name = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };
        match field.bytes().await {
            Ok(data) => upload = Some((name, data)),
            Err(e) => {
                warn!(error = %e, "upload body could not be read");
                return e.into_response();
            }
        }
    }

    let Some((name, data)) = upload else {
        let html = page::render(&PageView {
            error: Some("Please choose a video file to upload."),
            ..Default::default()
        });
        return (StatusCode::BAD_REQUEST, Html(html)).into_response();
    };

    let size = data.len();
    let storage = state.storage.clone();
    let saved = tokio::task::spawn_blocking(move || storage.save(&data, &name)).await;
    let path = match saved {
        Ok(Ok(path)) => path,
        Ok(Err(e)) => {
            error!(error = %e, "upload could not be stored");
            return storage_failure();
        }
        Err(e) => {
            error!(error = %e, "storage task failed");
            return storage_failure();
        }
    };

    info!(path = %path.display(), bytes = size, "upload stored");
    state.store.reset(path.clone());

    let shown = path.display().to_string();
    let html = page::render(&PageView {
        uploaded: Some(&shown),
        stats: state.store.statistics(),
        error: None,
    });
    Html(html).into_response()
}

fn storage_failure() -> Response {
    let html = page::render(&PageView {
        error: Some("The video could not be stored. Please try again."),
        ..Default::default()
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Html(html)).into_response()
}

/// `GET /video_feed/`: annotated frames of the active session as an MJPEG stream.
pub async fn video_feed(State(state): State<AppState>) -> Response {
    let Some(ticket) = state.store.current_session() else {
        return NO_VIDEO.into_response();
    };

    let mut parts = spawn_stream(
        state.opener.clone(),
        state.detector.clone(),
        state.store.clone(),
        ticket,
        state.pipeline.clone(),
    );
    // Dropping the body (client gone) drops `parts`, which stops the worker.
    let body = async_stream::stream! {
        while let Some(part) = parts.recv().await {
            yield Ok::<Bytes, Infallible>(part);
        }
    };

    (
        [
            (header::CONTENT_TYPE, MultipartFramer::default().content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    #[serde(flatten)]
    pub stats: StatisticsSnapshot,
    pub active: bool,
}

/// `GET /bike_count/`: statistics of the active session, zeros without one.
pub async fn bike_count(State(state): State<AppState>) -> Json<CountResponse> {
    let response = match state.store.statistics() {
        Some(stats) => CountResponse { stats, active: true },
        None => CountResponse {
            stats: StatisticsSnapshot::default(),
            active: false,
        },
    };
    Json(response)
}

pub async fn healthz() -> &'static str {
    "ok"
}
