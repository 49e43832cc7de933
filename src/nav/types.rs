//! Navigation data types: waypoints, drive commands and the state snapshot
//! returned to callers.

use std::time::Instant;

use serde::Serialize;

/// A navigation target.  Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waypoint {
    pub lat:  f64,
    pub lon:  f64,
    pub name: Option<String>,
    /// Reach radius in metres.
    pub tolerance: f64,
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64, name: Option<String>, tolerance: f64) -> Self {
        Waypoint { lat, lon, name, tolerance }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

/// Normalised drive request handed to the motor controller.
/// Both fields are clamped to [-1, 1] on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationCommand {
    /// Forward speed; negative reverses.
    pub speed: f64,
    /// Turn rate; negative left, positive right.
    pub turn_rate: f64,
    pub timestamp: Instant,
}

impl NavigationCommand {
    pub fn new(speed: f64, turn_rate: f64) -> Self {
        NavigationCommand {
            speed:     speed.max(-1.0).min(1.0),
            turn_rate: turn_rate.max(-1.0).min(1.0),
            timestamp: Instant::now(),
        }
    }

    pub fn stop() -> Self {
        NavigationCommand::new(0.0, 0.0)
    }
}

/// What the navigator is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationMode {
    Idle,
    Waypoint,
    PathFollowing,
}

/// Where the navigator currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationStatus {
    Idle,
    Navigating,
    ReachedWaypoint,
    PathComplete,
    Paused,
    Error,
}

/// Internal state-machine phase, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationPhase {
    Idle,
    Calibrating,
    Aligning,
    Driving,
    Reached,
}

/// Immutable snapshot of the navigator, taken under its lock.
#[derive(Debug, Clone, Serialize)]
pub struct NavigationState {
    pub current_position:   Option<(f64, f64)>,
    pub target_waypoint:    Option<Waypoint>,
    /// Metres to the target, when both position and target exist.
    pub distance_to_target: Option<f64>,
    /// Degrees to the target, when both position and target exist.
    pub bearing_to_target:  Option<f64>,
    pub current_heading:    Option<f64>,
    /// Ground speed in m/s.
    pub current_speed:      Option<f64>,
    pub mode:               NavigationMode,
    pub status:             NavigationStatus,
    pub phase:              NavigationPhase,
    pub waypoints_remaining: usize,
    pub error_message:      Option<String>,
}
