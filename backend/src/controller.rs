//! Convoy session state machine.
//!
//! The controller owns the whole session context (role, trip snapshot,
//! positions, route, navigation state) and reacts to [`Event`]s. Anything
//! asynchronous is returned as a [`Command`] for the runtime to carry out;
//! its outcome comes back later as another event. Store writes and speech
//! happen inline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    config::NavigationSettings,
    error::{Advisory, ConvoyError},
    geo::{distance_meters, path_length_meters},
    geolocation::GeolocationError,
    models::{now_millis, Coordinate, Destination, GeoPoint, ManeuverStep, Role, Trip},
    routing::{destination_key, FetchMark, PlannedRoute, RecomputePolicy, RoutingError},
    store::{StoreError, TripStore},
    voice::{cue_text, Cue, Milestone, MilestoneBands, MilestoneTracker, VoiceGuide},
};

/// Maneuver locations of two route versions this close are the same turn.
const SAME_MANEUVER_M: f64 = 15.0;

#[derive(Debug)]
pub enum Event {
    PositionFix(GeoPoint),
    GeolocationFailed(GeolocationError),
    RouteFetched(Result<PlannedRoute, RoutingError>),
    /// A step-advance delay has elapsed.
    StepTimer,
    FollowerPoll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FetchRoute {
        origin: Coordinate,
        destination: Destination,
    },
    /// Deliver [`Event::StepTimer`] after the delay.
    WakeAfter(Duration),
    StartFollowerPoll(Duration),
    StopFollowerPoll,
}

/// What a participant currently sees.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub role: Role,
    pub trip: Option<Trip>,
    pub position: Option<GeoPoint>,
    /// Follower view only.
    pub leader_position: Option<GeoPoint>,
    /// Destination chosen by this participant; drives route fetching.
    pub destination: Option<Destination>,
    pub route: Vec<Coordinate>,
    pub steps: Vec<ManeuverStep>,
    pub advisory: Option<Advisory>,
}

impl Session {
    pub fn has_route(&self) -> bool {
        !self.route.is_empty()
    }

    pub fn trip_active(&self) -> bool {
        self.trip.as_ref().is_some_and(|t| t.is_active)
    }

    pub fn code(&self) -> Option<&str> {
        self.trip.as_ref().map(|t| t.code.as_str())
    }

    /// The destination to show: the chosen one, or the trip's for followers.
    pub fn view_destination(&self) -> Option<&Destination> {
        self.destination
            .as_ref()
            .or_else(|| self.trip.as_ref().and_then(|t| t.destination.as_ref()))
    }
}

struct NavigationState {
    milestones: MilestoneTracker,
    last_fetch: Option<FetchMark>,
    fetch_in_flight: bool,
    last_recorded: Option<GeoPoint>,
}

impl NavigationState {
    fn new(bands: MilestoneBands) -> Self {
        Self {
            milestones: MilestoneTracker::new(bands),
            last_fetch: None,
            fetch_in_flight: false,
            last_recorded: None,
        }
    }
}

pub struct ConvoyController {
    store: Arc<TripStore>,
    voice: VoiceGuide,
    settings: NavigationSettings,
    policy: RecomputePolicy,
    participant_id: String,
    session: Session,
    nav: NavigationState,
}

impl ConvoyController {
    pub fn new(store: Arc<TripStore>, voice: VoiceGuide, settings: NavigationSettings) -> Self {
        let policy = RecomputePolicy {
            threshold_m: settings.recompute_threshold_m,
        };
        let nav = NavigationState::new(MilestoneBands::from(&settings));
        Self {
            store,
            voice,
            settings,
            policy,
            participant_id: Uuid::new_v4().to_string(),
            session: Session::default(),
            nav,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn step_index(&self) -> usize {
        self.nav.milestones.step_index()
    }

    pub fn milestone(&self) -> Milestone {
        self.nav.milestones.milestone()
    }

    pub fn is_fetching_route(&self) -> bool {
        self.nav.fetch_in_flight
    }

    pub fn voice_enabled(&self) -> bool {
        self.voice.is_enabled()
    }

    pub fn set_voice_enabled(&mut self, enabled: bool) {
        self.voice.set_enabled(enabled);
    }

    /// Choose where the convoy is heading. Drops the held route so a fresh
    /// one is fetched for the new destination.
    pub fn select_destination(
        &mut self,
        destination: Destination,
    ) -> Result<Vec<Command>, ConvoyError> {
        if self.session.role == Role::Follower {
            return Err(ConvoyError::NotLeader);
        }
        tracing::info!(
            "destination set to {} ({}, {})",
            destination.name,
            destination.lat,
            destination.lng
        );

        if self.session.role == Role::Leader {
            if let Some(trip) = self.session.trip.as_mut().filter(|t| t.is_active) {
                trip.destination = Some(destination.clone());
                self.store.save_trip(trip.clone())?;
            }
        }

        self.session.destination = Some(destination);
        self.session.route.clear();
        self.session.steps.clear();
        self.nav.milestones.reset();
        Ok(self.maybe_fetch_route().into_iter().collect())
    }

    /// Create a trip led by this participant.
    pub fn start_convoy(&mut self) -> Result<Trip, ConvoyError> {
        if self.session.role != Role::None {
            return Err(ConvoyError::AlreadyInSession);
        }
        let destination = self
            .session
            .destination
            .clone()
            .ok_or(ConvoyError::NoDestination)?;
        if !self.session.has_route() || self.nav.fetch_in_flight {
            return Err(ConvoyError::RouteNotReady);
        }

        let code = self.store.allocate_code(&mut rand::thread_rng())?;
        let trip = Trip {
            id: Uuid::new_v4().to_string(),
            code,
            name: self.settings.trip_name.clone(),
            leader_id: self.participant_id.clone(),
            destination: Some(destination),
            planned_route: Some(self.session.route.clone()),
            path: self.session.position.into_iter().collect(),
            is_active: true,
            created_at: now_millis(),
        };
        self.store.save_trip(trip.clone())?;
        tracing::info!("convoy {} started by {}", trip.code, trip.leader_id);

        self.session.role = Role::Leader;
        self.session.trip = Some(trip.clone());
        self.nav.milestones.reset();
        self.nav.last_recorded = self.session.position;

        let prompt = self.voice.settings().trip_started.clone();
        self.voice.announce(&prompt);
        Ok(trip)
    }

    /// Follow the trip with the given join code.
    pub fn join_convoy(&mut self, code: &str) -> Result<Vec<Command>, ConvoyError> {
        if self.session.role != Role::None {
            return Err(ConvoyError::AlreadyInSession);
        }
        let code = code.trim();
        if code.is_empty() {
            return Err(ConvoyError::EmptyCode);
        }
        let trip = self.store.get_trip_by_code(code)?;
        tracing::info!("joined convoy {} as follower", trip.code);

        self.reset_session();
        self.session.role = Role::Follower;
        self.session.route = trip.planned_route.clone().unwrap_or_default();
        self.session.leader_position = trip.last_position();
        let ended = trip.has_ended();
        self.session.trip = Some(trip);

        if ended {
            self.session.advisory = Some(Advisory::TripEnded);
            return Ok(Vec::new());
        }
        Ok(vec![Command::StartFollowerPoll(
            self.settings.follower_poll_interval,
        )])
    }

    /// End the trip for everyone. The trip cannot be reactivated.
    pub fn finalize(&mut self) -> Result<Trip, ConvoyError> {
        if self.session.role != Role::Leader {
            return Err(ConvoyError::NotLeader);
        }
        let mut trip = self.session.trip.clone().ok_or(ConvoyError::NotLeader)?;
        trip.is_active = false;
        self.store.save_trip(trip.clone())?;
        let recorded: Vec<Coordinate> = trip.path.iter().map(GeoPoint::coordinate).collect();
        tracing::info!(
            "convoy {} finalized with {} recorded points over {:.0} m",
            trip.code,
            trip.path.len(),
            path_length_meters(&recorded)
        );
        self.reset_session();
        Ok(trip)
    }

    /// Drop back to no role. The persisted trip is left untouched unless
    /// `finalize_on_leave` is set and this participant leads it.
    pub fn leave(&mut self) -> Vec<Command> {
        let role = self.session.role;
        if role == Role::Leader && self.settings.finalize_on_leave && self.session.trip_active() {
            if let Err(err) = self.finalize() {
                tracing::warn!("failed to finalize trip on leave: {err}");
            }
        } else if let Some(code) = self.session.code() {
            tracing::info!("left convoy {code} as {role:?}");
        }
        self.reset_session();

        match role {
            Role::Follower => vec![Command::StopFollowerPoll],
            _ => Vec::new(),
        }
    }

    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Command> {
        match event {
            Event::PositionFix(point) => self.on_position(point, now),
            Event::GeolocationFailed(err) => {
                tracing::warn!("geolocation error: {err}");
                self.session.advisory = Some(Advisory::LocationUnavailable(err));
                Vec::new()
            }
            Event::RouteFetched(result) => self.on_route_fetched(result),
            Event::StepTimer => {
                if let Some(step) = self.nav.milestones.tick(now) {
                    tracing::debug!("advanced to maneuver step {step}");
                }
                Vec::new()
            }
            Event::FollowerPoll => self.on_follower_poll(),
        }
    }

    fn on_position(&mut self, point: GeoPoint, now: Instant) -> Vec<Command> {
        self.session.position = Some(point);
        if matches!(self.session.advisory, Some(Advisory::LocationUnavailable(_))) {
            self.session.advisory = None;
        }

        self.record_leader_point(point);

        let mut commands: Vec<Command> = self.maybe_fetch_route().into_iter().collect();
        commands.extend(self.evaluate_guidance(point, now));
        commands
    }

    fn record_leader_point(&mut self, point: GeoPoint) {
        if self.session.role != Role::Leader {
            return;
        }
        let Some(code) = self
            .session
            .trip
            .as_ref()
            .filter(|t| t.is_active)
            .map(|t| t.code.clone())
        else {
            return;
        };

        let moved = self.nav.last_recorded.map_or(f64::INFINITY, |last| {
            distance_meters(last.coordinate(), point.coordinate())
        });
        if moved <= self.settings.record_threshold_m {
            tracing::debug!("skipping fix {moved:.1} m from the last recorded point");
            return;
        }

        match self.store.append_path_point(&code, point) {
            Ok(updated) => {
                self.session.trip = Some(updated);
                self.nav.last_recorded = Some(point);
            }
            Err(StoreError::TripEnded(_)) => {
                tracing::warn!("convoy {code} was ended elsewhere");
                if let Some(trip) = self.session.trip.as_mut() {
                    trip.is_active = false;
                }
                self.session.advisory = Some(Advisory::TripEnded);
            }
            Err(err) => {
                tracing::warn!("failed to record position for {code}: {err}");
                self.session.advisory = Some(Advisory::StoreWrite(err.to_string()));
            }
        }
    }

    fn maybe_fetch_route(&mut self) -> Option<Command> {
        let destination = self.session.destination.as_ref()?;
        let origin = self.session.position?.coordinate();
        if self.nav.fetch_in_flight {
            tracing::debug!("route fetch already in flight");
            return None;
        }
        if !self.policy.should_fetch(
            self.nav.last_fetch.as_ref(),
            origin,
            destination,
            self.session.has_route(),
        ) {
            return None;
        }

        self.nav.last_fetch = Some(FetchMark {
            origin,
            destination_key: destination_key(destination),
        });
        self.nav.fetch_in_flight = true;
        Some(Command::FetchRoute {
            origin,
            destination: destination.clone(),
        })
    }

    fn on_route_fetched(&mut self, result: Result<PlannedRoute, RoutingError>) -> Vec<Command> {
        self.nav.fetch_in_flight = false;
        match result {
            Ok(planned) => self.apply_route(planned),
            Err(RoutingError::Busy) => {
                // The outstanding fetch belongs to an earlier session; retry on the next fix.
                tracing::debug!("routing provider busy, waiting for the next fix");
                return Vec::new();
            }
            Err(err) => tracing::debug!("route fetch not performed: {err}"),
        }
        self.maybe_fetch_route().into_iter().collect()
    }

    fn apply_route(&mut self, planned: PlannedRoute) {
        let current = self.session.destination.as_ref().map(destination_key);
        if current.as_deref() != Some(planned.destination_key.as_str()) {
            tracing::debug!(
                "discarding route for stale destination {}",
                planned.destination_key
            );
            return;
        }

        let current_step = self
            .session
            .steps
            .get(self.nav.milestones.step_index())
            .map(|step| step.location);
        self.session.route = planned.route.vertices;
        self.session.steps = planned.route.steps;

        // A recompute towards the same destination usually still contains the
        // maneuver being approached; keep its announcement stage.
        let same_maneuver = current_step.and_then(|location| {
            self.session
                .steps
                .iter()
                .position(|step| distance_meters(step.location, location) <= SAME_MANEUVER_M)
        });
        match same_maneuver {
            Some(index) => self.nav.milestones.relocate(index),
            None => self.nav.milestones.reset(),
        }
        if planned.fallback {
            self.session.advisory = Some(Advisory::RouteFallback);
        } else if self.session.advisory == Some(Advisory::RouteFallback) {
            self.session.advisory = None;
        }

        if self.session.role == Role::Leader {
            if let Some(trip) = self.session.trip.as_mut().filter(|t| t.is_active) {
                trip.planned_route = Some(self.session.route.clone());
                if let Err(err) = self.store.save_trip(trip.clone()) {
                    tracing::warn!("failed to store recomputed route for {}: {err}", trip.code);
                }
            }
        }
    }

    fn evaluate_guidance(&mut self, point: GeoPoint, now: Instant) -> Option<Command> {
        if !self.session.trip_active() || self.session.steps.is_empty() {
            return None;
        }
        let step = self.session.steps.get(self.nav.milestones.step_index())?;
        let distance = distance_meters(point.coordinate(), step.location);

        let cue = self
            .nav
            .milestones
            .observe(distance, self.session.steps.len(), now)?;
        if let Some(text) = cue_text(&self.voice, &cue, &self.session.steps) {
            self.voice.announce(&text);
        }
        match cue {
            Cue::Near {
                advance_after: Some(delay),
                ..
            } => Some(Command::WakeAfter(delay)),
            _ => None,
        }
    }

    fn on_follower_poll(&mut self) -> Vec<Command> {
        if self.session.role != Role::Follower {
            return Vec::new();
        }
        let Some(code) = self.session.code().map(str::to_string) else {
            return Vec::new();
        };

        match self.store.get_trip_by_code(&code) {
            Ok(trip) => {
                if let Some(last) = trip.last_position() {
                    self.session.leader_position = Some(last);
                }
                if let Some(route) = &trip.planned_route {
                    self.session.route = route.clone();
                }
                let ended = trip.has_ended();
                self.session.trip = Some(trip);
                if ended {
                    tracing::info!("convoy {code} has ended");
                    self.session.advisory = Some(Advisory::TripEnded);
                    return vec![Command::StopFollowerPoll];
                }
                if matches!(self.session.advisory, Some(Advisory::TripNotFound(_))) {
                    self.session.advisory = None;
                }
            }
            Err(StoreError::NotFound(_)) => {
                tracing::warn!("convoy {code} disappeared from the store");
                self.session.advisory = Some(Advisory::TripNotFound(code));
            }
            Err(err) => tracing::warn!("follower poll for {code} failed: {err}"),
        }
        Vec::new()
    }

    fn reset_session(&mut self) {
        self.session = Session {
            position: self.session.position,
            ..Session::default()
        };
        self.nav = NavigationState::new(MilestoneBands::from(&self.settings));
    }
}
