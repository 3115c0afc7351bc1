// Handlers for the trip API endpoints.
// Thin layer over the trip store; every handler runs the blocking store call
// on the blocking pool and maps store errors to status codes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::gpx_export::{encode_trip_as_gpx, ExportError};
use crate::models::{ApiError, GeoPoint, Trip};
use crate::store::StoreError;
use crate::AppState;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Serialize)]
pub struct GpxExport {
    pub gpx_base64: String,
}

/// GET /api/trips - List all trips
pub async fn list_trips(State(state): State<AppState>) -> ApiResult<Json<Vec<Trip>>> {
    let store = state.store.clone();
    run_blocking(move || store.list_trips()).await.map(Json)
}

/// PUT /api/trips - Create or replace a trip record
pub async fn save_trip(
    State(state): State<AppState>,
    Json(trip): Json<Trip>,
) -> ApiResult<Json<Trip>> {
    if trip.code.trim().is_empty() {
        return Err(bad_request("trip code must not be empty"));
    }
    let store = state.store.clone();
    let saved = trip.clone();
    run_blocking(move || {
        match store.get_trip_by_code(&saved.code) {
            Ok(existing) => {
                if let Err(reason) = check_replacement(&existing, &saved) {
                    return Ok(Err(reason));
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        store.save_trip(saved).map(Ok)
    })
    .await?
    .map_err(conflict)?;
    tracing::info!("stored trip {}", trip.code);
    Ok(Json(trip))
}

/// A replacement may end a trip and extend its path, nothing else: an ended
/// trip stays ended and recorded points are never dropped or rewritten.
fn check_replacement(existing: &Trip, incoming: &Trip) -> Result<(), &'static str> {
    if existing.code != incoming.code {
        return Err("trip code already in use");
    }
    if !existing.is_active && incoming.is_active {
        return Err("trip has ended and cannot be reactivated");
    }
    if !incoming.path.starts_with(&existing.path) {
        return Err("recorded path can only be extended");
    }
    Ok(())
}

/// GET /api/trips/:code - Case-insensitive lookup
pub async fn get_trip(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Trip>> {
    let store = state.store.clone();
    run_blocking(move || store.get_trip_by_code(&code))
        .await
        .map(Json)
}

/// POST /api/trips/:code/path - Append a leader position
pub async fn append_path_point(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(point): Json<GeoPoint>,
) -> ApiResult<Json<Trip>> {
    let store = state.store.clone();
    run_blocking(move || store.append_path_point(&code, point))
        .await
        .map(Json)
}

/// POST /api/trips/:code/finalize - Mark the trip inactive
pub async fn finalize_trip(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Trip>> {
    let store = state.store.clone();
    let trip = run_blocking(move || {
        let mut trip = store.get_trip_by_code(&code)?;
        if trip.is_active {
            trip.is_active = false;
            store.save_trip(trip.clone())?;
        }
        Ok(trip)
    })
    .await?;
    tracing::info!("trip {} finalized", trip.code);
    Ok(Json(trip))
}

/// GET /api/trips/:code/gpx - Recorded path as base64 GPX
pub async fn export_trip_gpx(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<GpxExport>> {
    let store = state.store.clone();
    let trip = run_blocking(move || store.get_trip_by_code(&code)).await?;
    let gpx_base64 = encode_trip_as_gpx(&trip).map_err(export_error_to_api_error)?;
    Ok(Json(GpxExport { gpx_base64 }))
}

async fn run_blocking<T, F>(op: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| internal_error(format!("store task failed: {err}")))?
        .map_err(store_error_to_api_error)
}

/// Convert StoreError to API error response
fn store_error_to_api_error(err: StoreError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::TripEnded(_) => StatusCode::CONFLICT,
        StoreError::Io(_) | StoreError::Corrupt(_) => {
            tracing::error!("trip store failure: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ApiError {
            message: err.to_string(),
        }),
    )
}

fn export_error_to_api_error(err: ExportError) -> (StatusCode, Json<ApiError>) {
    internal_error(err.to_string())
}

fn bad_request(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            message: message.to_string(),
        }),
    )
}

fn conflict(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::CONFLICT,
        Json(ApiError {
            message: message.to_string(),
        }),
    )
}

fn internal_error(message: String) -> (StatusCode, Json<ApiError>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { message }))
}
