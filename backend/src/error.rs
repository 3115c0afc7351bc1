use thiserror::Error;

use crate::geolocation::GeolocationError;
use crate::store::StoreError;

/// Rejected session commands. None of these leave the controller in an
/// unusable state; the session can always be reset.
#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("choose a destination first")]
    NoDestination,
    #[error("the route to the destination is not ready yet")]
    RouteNotReady,
    #[error("already in a convoy session, leave it first")]
    AlreadyInSession,
    #[error("only the leader of an active trip can do this")]
    NotLeader,
    #[error("enter a convoy code")]
    EmptyCode,
    #[error("convoy code {0} not found")]
    TripNotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ConvoyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(code) => ConvoyError::TripNotFound(code),
            other => ConvoyError::Store(other),
        }
    }
}

/// Soft, user-facing notices. They never block the core flow.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Advisory {
    #[error("exact path unavailable, using straight line")]
    RouteFallback,
    #[error("turn on location services to navigate ({0})")]
    LocationUnavailable(GeolocationError),
    #[error("convoy code {0} not found")]
    TripNotFound(String),
    #[error("the leader has ended this trip")]
    TripEnded,
    #[error("could not record position: {0}")]
    StoreWrite(String),
}
