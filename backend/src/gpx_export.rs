use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use geo_types::Point;
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};

use crate::models::{GeoPoint, Trip};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to build GPX document: {0}")]
    Gpx(#[from] gpx::errors::GpxError),
}

/// Write the leader's recorded path as a single-track GPX document.
pub fn write_trip_gpx<W: Write>(trip: &Trip, writer: W) -> Result<(), ExportError> {
    let mut gpx = Gpx {
        version: GpxVersion::Gpx11,
        creator: Some("convoy".into()),
        ..Default::default()
    };
    let mut track = Track {
        name: Some(format!("{} ({})", trip.name, trip.code)),
        ..Default::default()
    };

    let mut segment = TrackSegment::new();
    segment.points.extend(trip.path.iter().map(to_waypoint));
    track.segments.push(segment);
    gpx.tracks.push(track);

    gpx::write(&gpx, writer)?;
    Ok(())
}

pub fn encode_trip_as_gpx(trip: &Trip) -> Result<String, ExportError> {
    let mut buffer = Vec::new();
    write_trip_gpx(trip, &mut buffer)?;
    Ok(BASE64.encode(buffer))
}

fn to_waypoint(point: &GeoPoint) -> Waypoint {
    Waypoint::new(Point::new(point.lng, point.lat))
}
