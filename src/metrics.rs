use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::{
    encoding::{EncodeLabelSet, text::encode},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tokio::task::JoinSet;

use crate::{config::PrometheusConfig, loader::EntryPoint};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DeploymentLabels {
    outcome: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct EventLabels {
    kind: String,
    outcome: String,
}

#[derive(Clone)]
pub struct Metrics {
    deployments: Family<DeploymentLabels, Counter>,
    events: Family<EventLabels, Counter>,
}

fn outcome<T, E>(result: &Result<T, E>) -> String {
    match result {
        Ok(_) => "success".to_string(),
        Err(_) => "failure".to_string(),
    }
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let deployments = Family::<DeploymentLabels, Counter>::default();
        registry.register(
            "deployments",
            "Number of deploy requests handled",
            deployments.clone(),
        );

        let events = Family::<EventLabels, Counter>::default();
        registry.register(
            "events",
            "Number of inbound events dispatched to deployed logic",
            events.clone(),
        );

        Self {
            deployments,
            events,
        }
    }

    pub fn record_deployment<T, E>(&self, result: &Result<T, E>) {
        self.deployments
            .get_or_create(&DeploymentLabels {
                outcome: outcome(result),
            })
            .inc();
    }

    pub fn record_event<T, E>(&self, kind: EntryPoint, result: &Result<T, E>) {
        self.events
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
                outcome: outcome(result),
            })
            .inc();
    }
}

/// Axum handler that returns Prometheus metrics
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let mut buffer = String::new();

    if let Err(err) = encode(&mut buffer, &registry) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", err),
        )
            .into_response();
    }

    (
        axum::http::StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

pub(crate) fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

pub(crate) fn start_metrics(
    tasks: &mut JoinSet<Result<()>>,
    config: &PrometheusConfig,
    registry: Registry,
) {
    let app = metrics_router(Arc::new(registry));
    let listen_addr = format!("{}:{}", config.address, config.port);

    tasks.spawn(async move {
        let listener = tokio::net::TcpListener::bind(listen_addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    });
}
