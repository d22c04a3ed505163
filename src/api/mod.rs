//! REST API module using Axum
//!
//! Read-only observability surface over the engine counters. The API never
//! touches lane state; it only reads [`EngineMetrics`](crate::metrics::EngineMetrics).

pub mod envelope;
pub mod handlers;
mod routes;

pub use handlers::{ApiState, EngineInfo};

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Same-origin by default; `REACTOR_SAGA_CORS_ORIGINS` (comma-separated)
/// allows extra origins for local dashboards.
fn build_cors_layer() -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);
    match std::env::var("REACTOR_SAGA_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            layer.allow_origin(allowed)
        }
        Err(_) => layer,
    }
}

/// Create the complete application router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(state.clone()))
        .merge(routes::root_routes(state))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::metrics::EngineMetrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        create_app(ApiState::new(
            Arc::new(EngineMetrics::new(1)),
            EngineInfo::from_config(&EngineConfig::default(), "stdin", "stdout", "memory"),
        ))
    }

    #[tokio::test]
    async fn nested_routes_are_reachable() {
        for uri in ["/health", "/api/v1/status", "/api/v1/metrics"] {
            let response = app()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let response = app()
            .oneshot(Request::builder().uri("/api/v2/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
