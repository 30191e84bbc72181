use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::AppState;

pub mod health;
pub mod workflows;

pub fn router(state: AppState) -> Router {
    let api = Router::new().merge(workflows::router(&state));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
