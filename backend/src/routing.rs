use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    config::RoutingSettings,
    geo::distance_meters,
    models::{Coordinate, Destination, ManeuverStep},
};

pub const FALLBACK_INSTRUCTION: &str = "go straight to destination";

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("routing request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("routing service answered with status {0}")]
    Status(u16),
    #[error("no road route found: {0}")]
    NoRoute(String),
    #[error("route geometry has {0} vertices, at least 2 are required")]
    InvalidGeometry(usize),
    #[error("a route fetch is already in flight")]
    Busy,
}

/// Road geometry and turn-by-turn steps as returned by a routing service.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadRoute {
    pub vertices: Vec<Coordinate>,
    pub steps: Vec<ManeuverStep>,
}

/// External road-routing collaborator.
///
/// Implementations only report what the service answered; retries and the
/// straight-line fallback belong to [`RouteProvider`].
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RoadRoute, RoutingError>;
}

/// OSRM HTTP client requesting full GeoJSON geometry and steps.
pub struct OsrmClient {
    http: reqwest::Client,
    base_url: String,
    profile: String,
    language: String,
}

impl OsrmClient {
    pub fn new(settings: &RoutingSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("convoy/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            profile: settings.profile.clone(),
            language: settings.language.clone(),
        }
    }

    fn route_url(&self, origin: Coordinate, destination: Coordinate) -> String {
        // OSRM takes lng,lat pairs.
        format!(
            "{}/route/v1/{}/{},{};{},{}?overview=full&geometries=geojson&steps=true&language={}",
            self.base_url,
            self.profile,
            origin.lng,
            origin.lat,
            destination.lng,
            destination.lat,
            self.language
        )
    }
}

#[async_trait]
impl RoutingService for OsrmClient {
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RoadRoute, RoutingError> {
        let response = self
            .http
            .get(self.route_url(origin, destination))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RoutingError::Status(status.as_u16()));
        }

        let body: OsrmResponse = response.json().await?;
        body.into_road_route()
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
struct OsrmLeg {
    #[serde(default)]
    steps: Vec<OsrmStep>,
}

#[derive(Debug, Deserialize)]
struct OsrmStep {
    #[serde(default)]
    name: String,
    maneuver: OsrmManeuver,
}

#[derive(Debug, Deserialize)]
struct OsrmManeuver {
    location: [f64; 2],
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    modifier: Option<String>,
    #[serde(default)]
    instruction: Option<String>,
}

impl OsrmResponse {
    fn into_road_route(self) -> Result<RoadRoute, RoutingError> {
        if self.code != "Ok" {
            return Err(RoutingError::NoRoute(
                self.message.unwrap_or(self.code),
            ));
        }
        let route = self
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| RoutingError::NoRoute("empty route list".to_string()))?;

        let vertices = route
            .geometry
            .coordinates
            .into_iter()
            .map(|[lng, lat]| Coordinate { lat, lng })
            .collect();
        let steps = route
            .legs
            .into_iter()
            .next()
            .map(|leg| leg.steps.into_iter().map(OsrmStep::into_step).collect())
            .unwrap_or_default();

        Ok(RoadRoute { vertices, steps })
    }
}

impl OsrmStep {
    fn into_step(self) -> ManeuverStep {
        let [lng, lat] = self.maneuver.location;
        let instruction = match self.maneuver.instruction {
            Some(text) if !text.trim().is_empty() => text,
            _ => compose_instruction(
                &self.maneuver.kind,
                self.maneuver.modifier.as_deref(),
                &self.name,
            ),
        };
        ManeuverStep {
            instruction,
            location: Coordinate { lat, lng },
        }
    }
}

fn compose_instruction(kind: &str, modifier: Option<&str>, road: &str) -> String {
    let action = match kind {
        "arrive" => return "Arrive at the destination".to_string(),
        "depart" => "Head out",
        "turn" | "end of road" => "Turn",
        "fork" => "Keep",
        "merge" => "Merge",
        "on ramp" => "Take the ramp",
        "off ramp" => "Take the exit",
        "roundabout" | "rotary" => "Enter the roundabout",
        _ => "Continue",
    };
    let mut text = match modifier {
        Some(modifier) if matches!(kind, "turn" | "end of road" | "fork" | "merge") => {
            format!("{action} {modifier}")
        }
        _ => action.to_string(),
    };
    if !road.is_empty() {
        text.push_str(" onto ");
        text.push_str(road);
    }
    text
}

/// Synthetic two-point route used when the routing service keeps failing.
pub fn straight_line(origin: Coordinate, destination: Coordinate) -> RoadRoute {
    RoadRoute {
        vertices: vec![origin, destination],
        steps: vec![ManeuverStep {
            instruction: FALLBACK_INSTRUCTION.to_string(),
            location: destination,
        }],
    }
}

/// Identity of a destination for recompute decisions: its rounded coordinates.
pub fn destination_key(destination: &Destination) -> String {
    format!("{:.5},{:.5}", destination.lat, destination.lng)
}

/// A route ready for the controller, tagged with what it was fetched for.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRoute {
    pub route: RoadRoute,
    pub origin: Coordinate,
    pub destination_key: String,
    /// The service failed on every attempt and `route` is the straight line.
    pub fallback: bool,
}

/// Wraps a [`RoutingService`] with retries, the straight-line fallback and a
/// single in-flight guard.
pub struct RouteProvider {
    service: Arc<dyn RoutingService>,
    max_retries: u32,
    backoff: Duration,
    in_flight: AtomicBool,
}

impl RouteProvider {
    pub fn new(service: Arc<dyn RoutingService>, settings: &RoutingSettings) -> Self {
        Self {
            service,
            max_retries: settings.max_retries,
            backoff: settings.backoff,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetch a road route, retrying with a fixed backoff and falling back to a
    /// straight line. A call made while another is outstanding is rejected
    /// with [`RoutingError::Busy`]; retries of the running fetch are not.
    pub async fn fetch_route(
        &self,
        origin: Coordinate,
        destination: &Destination,
    ) -> Result<PlannedRoute, RoutingError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!("ignoring route request, a fetch is already in flight");
            return Err(RoutingError::Busy);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let target = destination.coordinate();
        let destination_key = destination_key(destination);
        let mut attempt = 0;
        loop {
            let result = self
                .service
                .route(origin, target)
                .await
                .and_then(validate_route);
            match result {
                Ok(route) => {
                    tracing::info!(
                        "route to {} fetched: {} vertices, {} steps",
                        destination.name,
                        route.vertices.len(),
                        route.steps.len()
                    );
                    return Ok(PlannedRoute {
                        route,
                        origin,
                        destination_key,
                        fallback: false,
                    });
                }
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "route fetch failed ({err}), retry {attempt}/{} in {:?}",
                        self.max_retries,
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => {
                    tracing::warn!(
                        "route fetch failed after {} attempts ({err}), using straight line",
                        attempt + 1
                    );
                    return Ok(PlannedRoute {
                        route: straight_line(origin, target),
                        origin,
                        destination_key,
                        fallback: true,
                    });
                }
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn validate_route(route: RoadRoute) -> Result<RoadRoute, RoutingError> {
    if route.vertices.len() < 2 {
        return Err(RoutingError::InvalidGeometry(route.vertices.len()));
    }
    Ok(route)
}

/// Where and for which destination the last route fetch was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchMark {
    pub origin: Coordinate,
    pub destination_key: String,
}

/// Decides when a held route is stale enough to fetch again.
#[derive(Debug, Clone, Copy)]
pub struct RecomputePolicy {
    pub threshold_m: f64,
}

impl RecomputePolicy {
    pub fn should_fetch(
        &self,
        last: Option<&FetchMark>,
        position: Coordinate,
        destination: &Destination,
        has_route: bool,
    ) -> bool {
        let Some(last) = last else {
            return true;
        };
        if !has_route || last.destination_key != destination_key(destination) {
            return true;
        }
        distance_meters(position, last.origin) > self.threshold_m
    }
}
