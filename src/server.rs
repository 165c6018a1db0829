//! HTTP relay
//!
//! Accepts agent requests from browser clients, forwards them upstream and
//! streams the normalized events back as `text/event-stream`.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{
    config::{CorsSettings, RelayConfig},
    error::Result,
    services::{
        streaming::{EventEmitter, StreamController},
        HttpUpstream, UpstreamClient,
    },
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    upstream: Arc<dyn UpstreamClient>,
    controller: StreamController,
    cors: CorsSettings,
}

impl AppState {
    pub fn new(upstream: Arc<dyn UpstreamClient>, config: &RelayConfig) -> Self {
        Self {
            upstream,
            controller: StreamController::new(config.stream.clone()),
            cors: config.server.cors.clone(),
        }
    }
}

/// Build the router: `POST /run_sse`, `GET /health` and CORS handling
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run_sse", post(run_sse))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl+C
///
/// # Errors
///
/// Returns an error if the upstream client cannot be built or the address
/// cannot be bound
pub async fn serve(config: RelayConfig) -> Result<()> {
    let upstream = HttpUpstream::new(&config.upstream)?;
    let upstream_url = upstream.url().to_string();
    let state = AppState::new(Arc::new(upstream), &config);

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!(
        addr = %listener.local_addr()?,
        upstream = %upstream_url,
        "agent-relay listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("agent-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until the process is killed
        std::future::pending::<()>().await;
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn run_sse(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    serde_json::from_slice::<Value>(&body)?;

    let upstream = state.upstream.open(body).await?;
    let (emitter, mut rx) = EventEmitter::channel(state.controller.settings().channel_capacity);

    let controller = state.controller.clone();
    tokio::spawn(async move {
        let report = controller.run(upstream, emitter).await;
        debug!(
            session = %report.session_id,
            units = report.stats.units_emitted,
            "session report"
        );
    });

    let frames = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(frame);
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(allowed) = state.cors.allow_origin(origin.as_deref()) {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&allowed) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        if let Ok(value) = HeaderValue::from_str(&state.cors.allowed_headers.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
    }

    response
}
