pub use shared::{ApiError, Coordinate, Destination, GeoPoint, ManeuverStep, Role, Trip};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
