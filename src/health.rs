use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Shared flag flipped by the webhook listener while it accepts connections.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct ProbeState {
    registry: Arc<Registry>,
    readiness: Readiness,
}

/// `/healthz`, `/readyz` and `/metrics` for the plain HTTP listener.
pub fn router(registry: Registry, readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness_probe))
        .route("/metrics", get(metrics))
        .with_state(ProbeState {
            registry: Arc::new(registry),
            readiness,
        })
}

/// Served on both listeners; the webhook exposes it as `/health`.
pub async fn liveness() -> &'static str {
    "ok"
}

async fn readiness_probe(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "webhook listener not ready")
    }
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{K8tzMetrics, SkipLabels};

    fn probe_state() -> (ProbeState, K8tzMetrics) {
        let mut registry = Registry::default();
        let metrics = K8tzMetrics::new(&mut registry);
        let state = ProbeState {
            registry: Arc::new(registry),
            readiness: Readiness::default(),
        };
        (state, metrics)
    }

    #[tokio::test]
    async fn test_readiness_follows_listener() {
        let (state, _) = probe_state();
        let readiness = state.readiness.clone();
        assert_eq!(readiness_probe(State(state.clone())).await.0, StatusCode::SERVICE_UNAVAILABLE);

        readiness.set(true);
        assert_eq!(readiness_probe(State(state.clone())).await, (StatusCode::OK, "ok"));

        readiness.set(false);
        assert!(!state.readiness.is_ready());
    }

    #[tokio::test]
    async fn test_metrics_are_exposed() {
        let (state, k8tz_metrics) = probe_state();
        k8tz_metrics
            .skipped_total
            .get_or_create(&SkipLabels {
                reason: "disabled_on_namespace",
            })
            .inc();

        let response = metrics(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], OPENMETRICS_CONTENT_TYPE);

        let mut body = String::new();
        encode(&mut body, &state.registry).unwrap();
        assert!(body.contains("k8tz_skipped_total{reason=\"disabled_on_namespace\"} 1"));
        assert!(body.contains("k8tz_admission_request_duration_seconds"));
    }
}
