//! Drives a [`ConvoyController`] on tokio: carries out its commands and feeds
//! their outcomes back in as events.

use std::sync::Arc;
use std::time::Duration;

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    controller::{Command, ConvoyController, Event, Session},
    error::ConvoyError,
    geolocation::{GeolocationError, PositionEvent, WatchOptions},
    models::{Destination, Trip},
    routing::RouteProvider,
};

pub struct ConvoyRuntime {
    controller: ConvoyController,
    routes: Arc<RouteProvider>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    follower_poll: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    watch: WatchOptions,
}

impl ConvoyRuntime {
    pub fn new(controller: ConvoyController, routes: Arc<RouteProvider>, watch: WatchOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            controller,
            routes,
            events_tx,
            events_rx,
            follower_poll: None,
            tasks: Vec::new(),
            watch,
        }
    }

    pub fn controller(&self) -> &ConvoyController {
        &self.controller
    }

    pub fn session(&self) -> &Session {
        self.controller.session()
    }

    pub fn select_destination(&mut self, destination: Destination) -> Result<(), ConvoyError> {
        let commands = self.controller.select_destination(destination)?;
        self.execute(commands);
        Ok(())
    }

    pub fn start_convoy(&mut self) -> Result<Trip, ConvoyError> {
        self.controller.start_convoy()
    }

    pub fn join_convoy(&mut self, code: &str) -> Result<(), ConvoyError> {
        let commands = self.controller.join_convoy(code)?;
        self.execute(commands);
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<Trip, ConvoyError> {
        let trip = self.controller.finalize()?;
        self.abort_tasks();
        Ok(trip)
    }

    pub fn leave(&mut self) {
        let commands = self.controller.leave();
        self.abort_tasks();
        self.execute(commands);
    }

    pub fn set_voice_enabled(&mut self, enabled: bool) {
        self.controller.set_voice_enabled(enabled);
    }

    pub fn dispatch(&mut self, event: Event) {
        let commands = self.controller.handle(event, Instant::now());
        self.execute(commands);
    }

    /// Handle the next event from either the location watch or a finished
    /// task. A watch that stays silent for longer than its timeout is
    /// reported as a geolocation timeout. Returns `false` once the watch has
    /// ended.
    pub async fn step(&mut self, positions: &mut mpsc::Receiver<PositionEvent>) -> bool {
        let event = tokio::select! {
            Some(event) = self.events_rx.recv() => event,
            fix = tokio::time::timeout(self.watch.timeout, positions.recv()) => match fix {
                Ok(Some(Ok(point))) => Event::PositionFix(point),
                Ok(Some(Err(err))) => Event::GeolocationFailed(err),
                Ok(None) => return false,
                Err(_) => Event::GeolocationFailed(GeolocationError::Timeout),
            },
        };
        self.dispatch(event);
        true
    }

    /// Handle the next event produced by a spawned task (route fetch, step
    /// timer, follower poll).
    pub async fn step_internal(&mut self) {
        if let Some(event) = self.events_rx.recv().await {
            self.dispatch(event);
        }
    }

    /// Handle task events until none arrives for `quiet`.
    pub async fn settle(&mut self, quiet: Duration) {
        while let Ok(Some(event)) = tokio::time::timeout(quiet, self.events_rx.recv()).await {
            self.dispatch(event);
        }
    }

    fn execute(&mut self, commands: Vec<Command>) {
        self.tasks.retain(|task| !task.is_finished());
        for command in commands {
            match command {
                Command::FetchRoute {
                    origin,
                    destination,
                } => {
                    let routes = self.routes.clone();
                    let tx = self.events_tx.clone();
                    self.tasks.push(tokio::spawn(async move {
                        let result = routes.fetch_route(origin, &destination).await;
                        let _ = tx.send(Event::RouteFetched(result));
                    }));
                }
                Command::WakeAfter(delay) => {
                    let tx = self.events_tx.clone();
                    self.tasks.push(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Event::StepTimer);
                    }));
                }
                Command::StartFollowerPoll(interval) => {
                    self.stop_follower_poll();
                    let tx = self.events_tx.clone();
                    self.follower_poll = Some(tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(interval);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        // The first tick completes immediately; the join already loaded the trip.
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            if tx.send(Event::FollowerPoll).is_err() {
                                break;
                            }
                        }
                    }));
                }
                Command::StopFollowerPoll => self.stop_follower_poll(),
            }
        }
    }

    fn stop_follower_poll(&mut self) {
        if let Some(poll) = self.follower_poll.take() {
            poll.abort();
        }
    }

    /// Cancel route fetches and step timers of the session being torn down.
    /// A cancelled fetch releases the provider's in-flight guard.
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConvoyRuntime {
    fn drop(&mut self) {
        self.stop_follower_poll();
        self.abort_tasks();
    }
}
