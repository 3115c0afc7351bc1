use std::time::Duration;

/// Thresholds and timings of the convoy controller.
#[derive(Debug, Clone)]
pub struct NavigationSettings {
    /// Minimum movement before a leader fix is appended to the trip path.
    pub record_threshold_m: f64,
    /// Movement away from the last fetch origin that triggers a new route.
    pub recompute_threshold_m: f64,
    /// Upper bound of the far-announcement band.
    pub far_distance_m: f64,
    /// Lower (exclusive) bound of the far-announcement band.
    pub far_floor_m: f64,
    pub near_distance_m: f64,
    /// Delay between a near announcement and moving on to the next step.
    pub step_advance_delay: Duration,
    pub follower_poll_interval: Duration,
    pub trip_name: String,
    /// Mark the trip inactive when its leader leaves the session.
    pub finalize_on_leave: bool,
}

impl Default for NavigationSettings {
    fn default() -> Self {
        Self {
            record_threshold_m: 5.0,
            recompute_threshold_m: 100.0,
            far_distance_m: 200.0,
            far_floor_m: 50.0,
            near_distance_m: 45.0,
            step_advance_delay: Duration::from_secs(4),
            follower_poll_interval: Duration::from_secs(3),
            trip_name: "Convoy".to_string(),
            finalize_on_leave: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    pub language: String,
    pub rate: f32,
    pub far_prefix: String,
    pub trip_started: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            rate: 1.1,
            far_prefix: "In two hundred meters".to_string(),
            trip_started: "Convoy started. Follow the blue line on the map.".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub base_url: String,
    pub profile: String,
    pub language: String,
    pub max_retries: u32,
    pub backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            base_url: "https://router.project-osrm.org".to_string(),
            profile: "driving".to_string(),
            language: "en".to_string(),
            max_retries: 2,
            backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub debounce: Duration,
    pub min_query_len: usize,
    pub max_results: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-3-flash-preview".to_string(),
            api_key: None,
            debounce: Duration::from_millis(600),
            min_query_len: 3,
            max_results: 5,
        }
    }
}
