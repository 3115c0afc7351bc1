pub mod config;
pub mod controller;
pub mod error;
pub mod geo;
pub mod geolocation;
pub mod gpx_export;
pub mod models;
pub mod routing;
pub mod runtime;
pub mod search;
pub mod store;
pub mod trip_handlers;
pub mod voice;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::store::TripStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TripStore>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/trips",
            get(trip_handlers::list_trips).put(trip_handlers::save_trip),
        )
        .route("/api/trips/:code", get(trip_handlers::get_trip))
        .route("/api/trips/:code/path", post(trip_handlers::append_path_point))
        .route("/api/trips/:code/finalize", post(trip_handlers::finalize_trip))
        .route("/api/trips/:code/gpx", get(trip_handlers::export_trip_gpx))
        .layer(cors)
        .with_state(state)
}
