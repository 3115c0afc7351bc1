use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::Request,
};
use convoy::{
    create_router,
    models::{Destination, GeoPoint, Trip},
    store::TripStore,
    AppState,
};
use hyper::StatusCode;
use serde_json::{json, Value};
use tower::ServiceExt;

fn sample_trip(code: &str) -> Trip {
    Trip {
        id: "trip-1".to_string(),
        code: code.to_string(),
        name: "Convoy".to_string(),
        leader_id: "leader".to_string(),
        destination: Some(Destination {
            lat: -23.56,
            lng: -46.64,
            name: "Ibirapuera".to_string(),
            address: None,
        }),
        planned_route: None,
        path: vec![GeoPoint::new(-23.55, -46.63, 1_700_000_000_000)],
        is_active: true,
        created_at: 1_700_000_000_000,
    }
}

fn test_app() -> (axum::Router, Arc<TripStore>) {
    let store = Arc::new(TripStore::in_memory());
    let app = create_router(AppState {
        store: store.clone(),
    });
    (app, store)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn put_then_get_trip_by_code_ignores_case() {
    let (app, _store) = test_app();
    let trip = serde_json::to_value(sample_trip("AB12CD")).unwrap();

    let response = app
        .clone()
        .oneshot(json_request("PUT", "/api/trips", trip))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/api/trips/ab12cd"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], "AB12CD");
    assert_eq!(body["leaderId"], "leader");
    assert_eq!(body["isActive"], true);

    let response = app
        .oneshot(empty_request("GET", "/api/trips"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let (app, _store) = test_app();

    let response = app
        .oneshot(empty_request("GET", "/api/trips/ZZZZZZ"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("ZZZZZZ"));
}

#[tokio::test]
async fn appending_to_ended_trip_conflicts() {
    let (app, store) = test_app();
    store.save_trip(sample_trip("AB12CD")).unwrap();
    let point = json!({"lat": -23.551, "lng": -46.631, "timestamp": 1_700_000_005_000_i64});

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/trips/AB12CD/path", point.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["path"].as_array().map(Vec::len), Some(2));

    let response = app
        .clone()
        .oneshot(empty_request("POST", "/api/trips/AB12CD/finalize"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["isActive"], false);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/trips/AB12CD/path", point))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(store.get_trip_by_code("AB12CD").unwrap().path.len(), 2);

    // Finalizing again is harmless.
    let response = app
        .oneshot(empty_request("POST", "/api/trips/AB12CD/finalize"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn gpx_export_returns_base64_payload() {
    let (app, store) = test_app();
    store.save_trip(sample_trip("AB12CD")).unwrap();

    let response = app
        .oneshot(empty_request("GET", "/api/trips/AB12CD/gpx"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(!body["gpx_base64"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn empty_code_is_rejected() {
    let (app, store) = test_app();
    let trip = serde_json::to_value(sample_trip("  ")).unwrap();

    let response = app
        .oneshot(json_request("PUT", "/api/trips", trip))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.list_trips().unwrap().is_empty());
}

#[tokio::test]
async fn put_cannot_reopen_an_ended_trip() {
    let (app, store) = test_app();
    let mut ended = sample_trip("AB12CD");
    ended.is_active = false;
    store.save_trip(ended).unwrap();

    let reopened = serde_json::to_value(sample_trip("AB12CD")).unwrap();
    let response = app
        .oneshot(json_request("PUT", "/api/trips", reopened))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(!store.get_trip_by_code("AB12CD").unwrap().is_active);
}

#[tokio::test]
async fn put_cannot_rewrite_recorded_path() {
    let (app, store) = test_app();
    let mut recorded = sample_trip("AB12CD");
    recorded
        .path
        .push(GeoPoint::new(-23.551, -46.631, 1_700_000_005_000));
    store.save_trip(recorded).unwrap();

    // Stale copy holding only the first point.
    let truncated = serde_json::to_value(sample_trip("AB12CD")).unwrap();
    let response = app
        .clone()
        .oneshot(json_request("PUT", "/api/trips", truncated))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(store.get_trip_by_code("AB12CD").unwrap().path.len(), 2);

    let mut diverged = sample_trip("AB12CD");
    diverged.path.push(GeoPoint::new(-23.7, -46.7, 1_700_000_005_000));
    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/trips",
            serde_json::to_value(diverged).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let other_case = serde_json::to_value(sample_trip("ab12cd")).unwrap();
    let response = app
        .oneshot(json_request("PUT", "/api/trips", other_case))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(store.list_trips().unwrap().len(), 1);
}

#[tokio::test]
async fn put_may_extend_path_and_end_trip() {
    let (app, store) = test_app();
    store.save_trip(sample_trip("AB12CD")).unwrap();

    let mut update = sample_trip("AB12CD");
    update
        .path
        .push(GeoPoint::new(-23.551, -46.631, 1_700_000_005_000));
    update.is_active = false;
    update.name = "Sunday convoy".to_string();

    let response = app
        .oneshot(json_request(
            "PUT",
            "/api/trips",
            serde_json::to_value(update).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = store.get_trip_by_code("AB12CD").unwrap();
    assert_eq!(stored.path.len(), 2);
    assert!(!stored.is_active);
    assert_eq!(stored.name, "Sunday convoy");
}
