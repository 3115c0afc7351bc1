//! Spoken guidance: the preemptive speech wrapper and the per-step milestone
//! tracker that decides when a maneuver is announced.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{NavigationSettings, VoiceSettings};
use crate::models::ManeuverStep;

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub language: String,
    pub rate: f32,
}

/// Speech synthesis collaborator. Fire-and-forget.
pub trait SpeechOutput: Send {
    /// Stop whatever is currently being spoken.
    fn cancel(&mut self);
    fn speak(&mut self, utterance: Utterance);
}

/// Speech output that writes prompts to the log, for headless sessions.
#[derive(Debug, Default)]
pub struct LogSpeech;

impl SpeechOutput for LogSpeech {
    fn cancel(&mut self) {}

    fn speak(&mut self, utterance: Utterance) {
        tracing::info!(target: "convoy::speech", lang = %utterance.language, "{}", utterance.text);
    }
}

pub struct VoiceGuide {
    output: Box<dyn SpeechOutput>,
    settings: VoiceSettings,
    enabled: bool,
}

impl VoiceGuide {
    pub fn new(output: Box<dyn SpeechOutput>, settings: VoiceSettings) -> Self {
        Self {
            output,
            settings,
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.settings
    }

    /// Speak `text` right away, cutting off any utterance in progress.
    pub fn announce(&mut self, text: &str) {
        if !self.enabled {
            return;
        }
        self.output.cancel();
        self.output.speak(Utterance {
            text: text.to_string(),
            language: self.settings.language.clone(),
            rate: self.settings.rate,
        });
    }

    pub fn far_prompt(&self, instruction: &str) -> String {
        format!("{}, {instruction}", self.settings.far_prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Milestone {
    #[default]
    Idle,
    FarAnnounced,
    NearAnnounced,
}

/// What the tracker wants spoken for the current step.
#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    Far { step: usize },
    /// `advance_after` is set when a following step exists.
    Near {
        step: usize,
        advance_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct MilestoneBands {
    pub far_distance_m: f64,
    pub far_floor_m: f64,
    pub near_distance_m: f64,
    pub advance_delay: Duration,
}

impl From<&NavigationSettings> for MilestoneBands {
    fn from(settings: &NavigationSettings) -> Self {
        Self {
            far_distance_m: settings.far_distance_m,
            far_floor_m: settings.far_floor_m,
            near_distance_m: settings.near_distance_m,
            advance_delay: settings.step_advance_delay,
        }
    }
}

/// Two-stage announcement state for the current maneuver step.
#[derive(Debug, Clone)]
pub struct MilestoneTracker {
    bands: MilestoneBands,
    step_index: usize,
    milestone: Milestone,
    advance_due: Option<Instant>,
}

impl MilestoneTracker {
    pub fn new(bands: MilestoneBands) -> Self {
        Self {
            bands,
            step_index: 0,
            milestone: Milestone::Idle,
            advance_due: None,
        }
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn milestone(&self) -> Milestone {
        self.milestone
    }

    /// Follow the current maneuver to `step_index` of a replacement step
    /// list. The announcement stage and any pending advance carry over.
    pub fn relocate(&mut self, step_index: usize) {
        self.step_index = step_index;
    }

    pub fn reset(&mut self) {
        self.step_index = 0;
        self.milestone = Milestone::Idle;
        self.advance_due = None;
    }

    /// Feed the distance to the current step's location.
    pub fn observe(&mut self, distance_m: f64, step_count: usize, now: Instant) -> Option<Cue> {
        if self.step_index >= step_count {
            return None;
        }

        if distance_m <= self.bands.near_distance_m {
            if self.milestone == Milestone::NearAnnounced {
                return None;
            }
            self.milestone = Milestone::NearAnnounced;
            let advance_after = (self.step_index + 1 < step_count).then_some(self.bands.advance_delay);
            self.advance_due = advance_after.map(|delay| now + delay);
            return Some(Cue::Near {
                step: self.step_index,
                advance_after,
            });
        }

        let in_far_band =
            distance_m > self.bands.far_floor_m && distance_m <= self.bands.far_distance_m;
        if in_far_band && self.milestone == Milestone::Idle {
            self.milestone = Milestone::FarAnnounced;
            return Some(Cue::Far {
                step: self.step_index,
            });
        }

        None
    }

    /// Move on to the next step once the post-near delay has elapsed.
    /// Returns the new step index when an advance happened.
    pub fn tick(&mut self, now: Instant) -> Option<usize> {
        let due = self.advance_due?;
        if now < due {
            return None;
        }
        self.advance_due = None;
        self.step_index += 1;
        self.milestone = Milestone::Idle;
        Some(self.step_index)
    }
}

/// The prompt for a cue, given the route's steps.
pub fn cue_text(guide: &VoiceGuide, cue: &Cue, steps: &[ManeuverStep]) -> Option<String> {
    match cue {
        Cue::Far { step } => steps.get(*step).map(|s| guide.far_prompt(&s.instruction)),
        Cue::Near { step, .. } => steps.get(*step).map(|s| s.instruction.clone()),
    }
}
