use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use convoy::{
    config::{NavigationSettings, RoutingSettings, VoiceSettings},
    controller::ConvoyController,
    error::Advisory,
    geolocation::{PositionEvent, WatchOptions},
    models::{Coordinate, Destination, GeoPoint, Role},
    routing::{RoadRoute, RouteProvider, RoutingError, RoutingService},
    runtime::ConvoyRuntime,
    store::TripStore,
    voice::{LogSpeech, VoiceGuide},
};
use tokio::sync::mpsc;

/// Routing backend that is down for the whole test.
struct Unreachable;

#[async_trait]
impl RoutingService for Unreachable {
    async fn route(
        &self,
        _origin: Coordinate,
        _destination: Coordinate,
    ) -> Result<RoadRoute, RoutingError> {
        Err(RoutingError::Status(503))
    }
}

fn participant(store: Arc<TripStore>) -> ConvoyRuntime {
    let controller = ConvoyController::new(
        store,
        VoiceGuide::new(Box::new(LogSpeech), VoiceSettings::default()),
        NavigationSettings::default(),
    );
    let routes = Arc::new(RouteProvider::new(
        Arc::new(Unreachable),
        &RoutingSettings::default(),
    ));
    ConvoyRuntime::new(controller, routes, WatchOptions::default())
}

fn destination() -> Destination {
    Destination {
        lat: -23.56,
        lng: -46.64,
        name: "Ibirapuera".to_string(),
        address: Some("Sao Paulo".to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn leader_and_follower_share_one_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trips.json");
    // Two handles on the same file, as two devices would have.
    let leader_store = Arc::new(TripStore::open(&path).unwrap());
    let follower_store = Arc::new(TripStore::open(&path).unwrap());

    let mut leader = participant(leader_store);
    let (fixes, mut positions) = mpsc::channel::<PositionEvent>(8);
    leader.select_destination(destination()).unwrap();
    fixes
        .send(Ok(GeoPoint::new(-23.55, -46.63, 1_700_000_000_000)))
        .await
        .unwrap();

    // Fix, then the fallback route after two retries.
    assert!(leader.step(&mut positions).await);
    assert!(leader.step(&mut positions).await);
    assert_eq!(leader.session().route.len(), 2);
    assert_eq!(leader.session().advisory, Some(Advisory::RouteFallback));

    let trip = leader.start_convoy().unwrap();
    let trips = follower_store.list_trips().unwrap();
    assert_eq!(trips.len(), 1);
    assert!(trips[0].is_active);
    assert_eq!(trips[0].path.len(), 1);

    let mut follower = participant(follower_store.clone());
    follower.join_convoy(&trip.code).unwrap();
    assert_eq!(follower.session().role, Role::Follower);
    assert_eq!(follower.session().view_destination(), Some(&destination()));
    assert!(follower.session().route.len() >= 2);

    fixes
        .send(Ok(GeoPoint::new(-23.5503, -46.6303, 1_700_000_003_000)))
        .await
        .unwrap();
    assert!(leader.step(&mut positions).await);
    follower.step_internal().await;
    assert_eq!(
        follower.session().leader_position.map(|p| p.timestamp),
        Some(1_700_000_003_000)
    );

    let finalized = leader.finalize().unwrap();
    assert!(!finalized.is_active);
    assert_eq!(leader.session().role, Role::None);
    assert!(!follower_store.get_trip_by_code(&trip.code).unwrap().is_active);

    follower.step_internal().await;
    assert_eq!(follower.session().advisory, Some(Advisory::TripEnded));

    // Nothing else is scheduled for the follower once the trip has ended.
    tokio::time::timeout(Duration::from_secs(10), follower.step_internal())
        .await
        .expect_err("follower poll should have stopped");
}
