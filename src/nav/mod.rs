//! Waypoint navigation: geodesy, the heading PID, the waypoint queue and
//! the phase state machine that turns positions into drive commands.

pub mod geo;
pub mod navigator;
pub mod pid;
pub mod types;
pub mod waypoints;

pub use navigator::{Navigator, NavigatorConfig};
pub use types::{
    NavigationCommand, NavigationMode, NavigationPhase, NavigationState, NavigationStatus,
    Waypoint,
};
