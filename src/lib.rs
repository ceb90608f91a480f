pub mod blobs;
pub mod config;
pub mod deployments;
pub mod digest;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod registry;
mod routes;
pub mod state;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    http::{HeaderName, Request},
};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, info_span, warn};

use crate::{config::Configuration, metrics::Metrics, state::AppState};

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: Arc<AppState>) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    routes::router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    let request_id = request
                        .extensions()
                        .get::<RequestId>()
                        .and_then(|id| id.header_value().to_str().ok())
                        .unwrap_or("invalid-request-id");

                    info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id,
                    )
                }),
            )
            .layer(PropagateRequestIdLayer::new(request_id)),
    )
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Error whilst waiting for Ctrl+C: {err:?}");
        std::future::pending::<()>().await;
    }

    info!("Shutting down");
}

pub async fn start(config: Configuration) -> Result<()> {
    let mut registry = Registry::with_prefix("hotdeploy");
    let metrics = Metrics::new(&mut registry);

    let listen_addr = format!("{}:{}", config.address, config.port);
    let prometheus = config.prometheus.clone();

    let state = Arc::new(
        AppState::open(config, metrics)
            .await
            .context("Failed to open storage")?,
    );

    let mut tasks = JoinSet::<Result<()>>::new();

    metrics::start_metrics(&mut tasks, &prometheus, registry);

    let app = router(state);
    tasks.spawn(async move {
        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("Unable to listen on {listen_addr}"))?;
        info!("Listening on {listen_addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server failed")
    });

    let result = match tasks.join_next().await {
        Some(result) => result.context("Server task panicked")?,
        None => Ok(()),
    };

    tasks.shutdown().await;

    result
}
