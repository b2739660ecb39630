// THEORY:
// `bike_counter_server` is the HTTP surface of the bike counter. It owns nothing
// but wiring: every handler receives the injected `AppState`, which carries the
// single `SessionStore` together with the storage, decoding and detection
// backends chosen by the binary. The route table below is the whole API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use bike_counter::PipelineConfig;
use bike_counter::detector::Detector;
use bike_counter::session::SessionStore;
use bike_counter::storage::VideoStorage;
use bike_counter::video::VideoOpener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod handlers;
pub mod page;

#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub storage: Arc<dyn VideoStorage>,
    pub opener: Arc<dyn VideoOpener>,
    pub detector: Arc<dyn Detector>,
    pub pipeline: PipelineConfig,
}

impl AppState {
    pub fn new(
        store: SessionStore,
        storage: Arc<dyn VideoStorage>,
        opener: Arc<dyn VideoOpener>,
        detector: Arc<dyn Detector>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            store,
            storage,
            opener,
            detector,
            pipeline,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub media_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            media_dir: PathBuf::from("media"),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::index).post(handlers::upload))
        .route("/video_feed/", get(handlers::video_feed))
        .route("/bike_count/", get(handlers::bike_count))
        .route("/healthz", get(handlers::healthz))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `cfg.bind_addr` and serve in the background. Binding errors are
/// returned here; the handle resolves when the server stops.
pub async fn start_server(state: AppState, cfg: &ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    let local: SocketAddr = listener.local_addr().context("listener has no local address")?;
    let app = router(state, cfg.max_upload_bytes);

    info!(addr = %local, media = %cfg.media_dir.display(), "bike counter listening on http://{local}");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server stopped");
        }
    });
    Ok(server)
}
