//! API route definitions
//!
//! - /health - liveness
//! - /api/v1/status - engine configuration and counters (JSON)
//! - /api/v1/metrics - counters in Prometheus text format

use axum::{routing::get, Router};

use super::handlers::{self, ApiState};

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}

/// Health endpoint at root level
pub fn root_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EngineInfo;
    use crate::config::EngineConfig;
    use crate::metrics::EngineMetrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_state() -> ApiState {
        let metrics = Arc::new(EngineMetrics::new(3));
        metrics.record_violation();
        ApiState::new(
            metrics,
            EngineInfo::from_config(&EngineConfig::default(), "stdin", "channel", "memory"),
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_engine_and_counters() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let v = body_json(response).await;
        assert_eq!(v["data"]["engine"]["source"], "stdin");
        assert_eq!(v["data"]["engine"]["backpressure"], "block");
        assert_eq!(v["data"]["counters"]["violations"], 1);
    }

    #[tokio::test]
    async fn metrics_are_plain_text() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = root_routes(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }
}
