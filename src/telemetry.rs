//! Session metrics: counters the HTTP layer exposes through `get_metrics()`.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStopRecord {
    pub reason:    String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub session_start:      DateTime<Utc>,
    pub waypoints_reached:  u64,
    pub gps_loss_events:    u64,
    pub navigation_errors:  u64,
    pub emergency_stops:    u64,
    pub last_emergency_stop: Option<EmergencyStopRecord>,
}

struct MetricsInner {
    session_start:     DateTime<Utc>,
    waypoints_reached: u64,
    gps_loss_events:   u64,
    navigation_errors: u64,
    emergency_stops:   u64,
    last_emergency:    Option<EmergencyStopRecord>,
}

/// Thread-safe counter collection, one per rover session.
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Mutex::new(MetricsInner {
                session_start:     Utc::now(),
                waypoints_reached: 0,
                gps_loss_events:   0,
                navigation_errors: 0,
                emergency_stops:   0,
                last_emergency:    None,
            }),
        }
    }

    pub fn add_waypoint_reached(&self) {
        self.inner.lock().unwrap().waypoints_reached += 1;
    }

    pub fn add_gps_loss_event(&self) {
        self.inner.lock().unwrap().gps_loss_events += 1;
    }

    pub fn add_navigation_error(&self) {
        self.inner.lock().unwrap().navigation_errors += 1;
    }

    pub fn add_emergency_stop(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.emergency_stops += 1;
        inner.last_emergency = Some(EmergencyStopRecord {
            reason:    reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn report(&self) -> MetricsReport {
        let inner = self.inner.lock().unwrap();
        MetricsReport {
            session_start:      inner.session_start,
            waypoints_reached:  inner.waypoints_reached,
            gps_loss_events:    inner.gps_loss_events,
            navigation_errors:  inner.navigation_errors,
            emergency_stops:    inner.emergency_stops,
            last_emergency_stop: inner.last_emergency.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.add_gps_loss_event();
        metrics.add_gps_loss_event();
        metrics.add_emergency_stop("gate failure");

        let report = metrics.report();
        assert_eq!(report.gps_loss_events, 2);
        assert_eq!(report.emergency_stops, 1);
        assert_eq!(report.last_emergency_stop.unwrap().reason, "gate failure");
    }
}
