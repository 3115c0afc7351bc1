use serde::{Deserialize, Serialize};

/// A plain `(lat, lng)` vertex. Serialized as a `[lat, lng]` pair so planned
/// routes stay compact in the persisted trip record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl From<[f64; 2]> for Coordinate {
    fn from([lat, lng]: [f64; 2]) -> Self {
        Self { lat, lng }
    }
}

impl From<Coordinate> for [f64; 2] {
    fn from(coord: Coordinate) -> Self {
        [coord.lat, coord.lng]
    }
}

/// A recorded position fix. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: i64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self {
            lat,
            lng,
            timestamp,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

impl From<GeoPoint> for Coordinate {
    fn from(point: GeoPoint) -> Self {
        point.coordinate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub lat: f64,
    pub lng: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Destination {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// One turn-by-turn instruction of a planned route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManeuverStep {
    pub instruction: String,
    pub location: Coordinate,
}

/// The shared convoy session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub code: String,
    pub name: String,
    pub leader_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_route: Option<Vec<Coordinate>>,
    #[serde(default)]
    pub path: Vec<GeoPoint>,
    pub is_active: bool,
    pub created_at: i64,
}

impl Trip {
    /// Last point recorded by the leader, if any.
    pub fn last_position(&self) -> Option<GeoPoint> {
        self.path.last().copied()
    }

    pub fn has_ended(&self) -> bool {
        !self.is_active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Leader,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
}
