//! REST API layer: route handlers, DTOs, OpenAPI and router composition.
//!
//! All resource endpoints are mounted under `/api/v1`.

pub mod dto;
pub mod handlers;
pub mod openapi;

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;
use openapi::ApiDoc;

/// The served application: REST routes, `/ws`, request tracing, CORS and
/// a per-request timeout.
///
/// Requests running longer than `request_timeout` are answered with
/// `408 Request Timeout`. WebSocket sessions are not bounded by it once
/// upgraded.
pub fn app(state: AppState, request_timeout: Duration) -> Router {
    build_router()
        .route("/ws", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_timeout,
                )),
        )
        .with_state(state)
}

/// Builds the complete API router with all REST endpoints and the
/// OpenAPI document.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes());
    with_docs(router)
}

/// Swagger UI at `/swagger-ui`, reading the document it also serves.
#[cfg(feature = "swagger-ui")]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url(ApiDoc::openapi_json_path(), ApiDoc::openapi()),
    )
}

#[cfg(not(feature = "swagger-ui"))]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    use axum::Json;

    router.route(
        ApiDoc::openapi_json_path(),
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}
