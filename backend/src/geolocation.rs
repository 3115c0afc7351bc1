use std::{fs::File, io::BufReader, io::Read, path::Path, time::Duration};

use tokio::sync::mpsc;

use crate::models::{now_millis, Coordinate, GeoPoint};

/// Options of the location watch. Replayed fixes are always fresh, so only
/// the silence timeout is configurable.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Longest wait for a fix before a timeout is reported.
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    Unavailable,
    #[error("timed out waiting for a position fix")]
    Timeout,
    #[error("geolocation is not supported on this device")]
    Unsupported,
}

/// One item of a location watch: a fix or an error signal.
pub type PositionEvent = Result<GeoPoint, GeolocationError>;

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("failed to open track: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse GPX track: {0}")]
    Gpx(#[from] gpx::errors::GpxError),
    #[error("track has no points")]
    Empty,
}

/// Replays a recorded GPX track as a live location watch.
pub struct GpxReplay {
    points: Vec<Coordinate>,
    interval: Duration,
}

impl GpxReplay {
    pub fn from_path(path: impl AsRef<Path>, interval: Duration) -> Result<Self, TrackError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), interval)
    }

    pub fn from_reader<R: Read>(reader: R, interval: Duration) -> Result<Self, TrackError> {
        let gpx = gpx::read(reader)?;
        let points: Vec<Coordinate> = gpx
            .tracks
            .iter()
            .flat_map(|track| track.segments.iter())
            .flat_map(|segment| segment.points.iter())
            .chain(gpx.routes.iter().flat_map(|route| route.points.iter()))
            .map(|waypoint| {
                let point = waypoint.point();
                Coordinate::new(point.y(), point.x())
            })
            .collect();

        if points.is_empty() {
            return Err(TrackError::Empty);
        }
        Ok(Self { points, interval })
    }

    pub fn points(&self) -> &[Coordinate] {
        &self.points
    }

    /// Start emitting one fix per interval, stamped with the current time.
    /// The stream ends after the last point.
    pub fn spawn(self) -> mpsc::Receiver<PositionEvent> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            for coord in self.points {
                ticker.tick().await;
                let fix = GeoPoint::new(coord.lat, coord.lng, now_millis());
                if tx.send(Ok(fix)).await.is_err() {
                    break;
                }
            }
            tracing::debug!("track replay finished");
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="convoy-tests" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>drive</name>
    <trkseg>
      <trkpt lat="-23.55" lon="-46.63"></trkpt>
      <trkpt lat="-23.551" lon="-46.631"></trkpt>
      <trkpt lat="-23.552" lon="-46.632"></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_reads_track_points_as_lat_lng() {
        let replay = GpxReplay::from_reader(TRACK.as_bytes(), Duration::from_secs(1)).unwrap();
        assert_eq!(replay.points().len(), 3);
        assert_eq!(replay.points()[0], Coordinate::new(-23.55, -46.63));
    }

    #[test]
    fn test_empty_track_is_rejected() {
        let empty = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="convoy-tests" xmlns="http://www.topografix.com/GPX/1/1"></gpx>"#;
        assert!(matches!(
            GpxReplay::from_reader(empty.as_bytes(), Duration::from_secs(1)),
            Err(TrackError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_emits_every_point_then_ends() {
        let replay = GpxReplay::from_reader(TRACK.as_bytes(), Duration::from_secs(1)).unwrap();
        let mut rx = replay.spawn();

        let mut fixes = Vec::new();
        while let Some(event) = rx.recv().await {
            fixes.push(event.unwrap());
        }
        assert_eq!(fixes.len(), 3);
        assert_eq!(fixes[2].coordinate(), Coordinate::new(-23.552, -46.632));
    }

    #[test]
    fn test_default_watch_options() {
        assert_eq!(WatchOptions::default().timeout, Duration::from_secs(5));
    }
}
