//! Rover coordinator.
//!
//! Glues the three subsystems together: registers itself (as a queue-feeding
//! callback, not an owning reference) with the RTK coordinator, runs the
//! fixed-rate control loop that moves positions into the navigator and
//! navigator commands into the motors, and exposes the command surface the
//! HTTP layer calls.
//!
//! The GPS health gate sits between the two: a position that is missing,
//! sparse on satellites, imprecise, or stale stops the motors before any
//! navigation decision is made.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{Result, RoverError};
use crate::gnss::{FixQuality, Position};
use crate::motor::{DifferentialDriveCommand, MotorController, MotorStatus};
use crate::nav::{NavigationCommand, NavigationState, Navigator, Waypoint};
use crate::rtk::{RtkCoordinator, RtkStatus};
use crate::telemetry::{Metrics, MetricsReport};
use crate::util::BoundedQueue;

/// Observer → control-loop hand-off queue.  Small: only the freshest
/// positions matter.
const POSITION_QUEUE_CAPACITY: usize = 10;
/// Health-gate / loop-error failures tolerated before escalating.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// GPS health thresholds.
const MIN_SATELLITES: u32 = 4;
const MAX_HDOP: f64 = 5.0;
const MAX_POSITION_AGE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RoverConfig {
    /// Control loop period (1 Hz default; 10 Hz supported).
    pub update_interval: Duration,
}

impl Default for RoverConfig {
    fn default() -> Self {
        RoverConfig { update_interval: Duration::from_secs(1) }
    }
}

/// Latest-fix summary embedded in the status report.
#[derive(Debug, Clone, Serialize)]
pub struct GpsSummary {
    pub lat:        f64,
    pub lon:        f64,
    pub fix:        FixQuality,
    pub satellites: u32,
    pub hdop:       f64,
    pub age_secs:   f64,
}

/// Compact status object for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct RoverStatus {
    pub running:    bool,
    pub timestamp:  String,
    pub navigation: NavigationState,
    pub motor:      MotorStatus,
    pub gps:        Option<GpsSummary>,
    pub rtk:        RtkStatus,
}

pub struct RoverCoordinator {
    navigator: Arc<Navigator>,
    motors:    Arc<MotorController>,
    rtk:       Arc<RtkCoordinator>,
    metrics:   Arc<Metrics>,

    position_queue:  Arc<BoundedQueue<Position>>,
    update_interval: Duration,
    running:         AtomicBool,
    last_nav_status: Mutex<crate::nav::NavigationStatus>,
    control_task:    Mutex<Option<JoinHandle<()>>>,
}

impl RoverCoordinator {
    pub fn new(
        navigator: Arc<Navigator>,
        motors: Arc<MotorController>,
        rtk: Arc<RtkCoordinator>,
        cfg: RoverConfig,
    ) -> Self {
        RoverCoordinator {
            navigator,
            motors,
            rtk,
            metrics: Arc::new(Metrics::new()),
            position_queue:  Arc::new(BoundedQueue::new(POSITION_QUEUE_CAPACITY)),
            update_interval: cfg.update_interval,
            running:         AtomicBool::new(false),
            last_nav_status: Mutex::new(crate::nav::NavigationStatus::Idle),
            control_task:    Mutex::new(None),
        }
    }

    /// Start motors, register the position feed and launch the control loop.
    pub fn start(this: &Arc<Self>) -> Result<()> {
        if this.running.swap(true, Ordering::SeqCst) {
            warn!("rover coordinator already running");
            return Ok(());
        }

        MotorController::start(&this.motors)?;
        this.navigator.start();

        // The observer captures only the queue, so the RTK coordinator never
        // owns the rover; the GNSS reader thread stays decoupled from
        // navigation work.
        let queue = Arc::clone(&this.position_queue);
        this.rtk.register_observer(Box::new(move |position| {
            queue.push(position.clone());
        }));

        let rover = Arc::clone(this);
        let handle = tokio::spawn(async move { rover.control_loop().await });
        *this.control_task.lock().unwrap() = Some(handle);

        info!(
            "rover coordinator started, control loop at {:.1} Hz",
            1.0 / this.update_interval.as_secs_f64()
        );
        Ok(())
    }

    /// Stop the control loop and the motors; navigation state is cleared.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping rover coordinator");
        let task = self.control_task.lock().unwrap().take();
        if let Some(mut handle) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        self.navigator.stop();
        self.motors.stop().await;
        info!("rover coordinator stopped");
    }

    // ── Control loop ──────────────────────────────────────────────────────────

    async fn control_loop(self: Arc<Self>) {
        info!("control loop started");
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut gate_failures = 0u32;
        let mut loop_errors = 0u32;

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            match self.control_tick(&mut gate_failures) {
                Ok(()) => loop_errors = 0,
                Err(e) => {
                    error!("control loop error: {e}");
                    self.metrics.add_navigation_error();
                    loop_errors += 1;
                    self.motors.emergency_stop();
                    if loop_errors >= MAX_CONSECUTIVE_FAILURES {
                        error!("too many consecutive control loop errors, stopping navigation");
                        self.navigator.stop();
                        break;
                    }
                }
            }
        }

        self.motors.emergency_stop();
        info!("control loop stopped");
    }

    /// One control cycle: drain positions, gate on GPS health, run the
    /// navigator and drive the motors.
    fn control_tick(&self, gate_failures: &mut u32) -> Result<()> {
        let mut drained = 0usize;
        while let Some(position) = self.position_queue.try_pop() {
            self.navigator
                .update_position(position.lat, position.lon, position.course, position.speed);
            drained += 1;
        }
        if drained > 1 {
            debug!("processed {drained} position updates this cycle");
        }

        if let Err(reason) = self.check_gps_health() {
            warn!("health gate: {reason}");
            self.motors.emergency_stop();
            self.metrics.add_gps_loss_event();
            *gate_failures += 1;
            if *gate_failures >= MAX_CONSECUTIVE_FAILURES {
                error!("GPS unhealthy for {gate_failures} cycles, pausing navigation");
                self.navigator.pause();
                *gate_failures = 0;
            }
            return Ok(());
        }
        *gate_failures = 0;

        match self.navigator.get_navigation_command() {
            Some(command) => {
                debug!(
                    "nav command: speed={:.2} turn={:.2}",
                    command.speed, command.turn_rate
                );
                self.motors.execute_navigation_command(command)?;
            }
            None => {
                // Paused, idle or in error: let the ramp bring the wheels to
                // rest instead of slamming an emergency stop.
                self.motors
                    .execute_differential_command(DifferentialDriveCommand::stop())?;
            }
        }

        let status = self.navigator.get_state().status;
        let mut last = self.last_nav_status.lock().unwrap();
        if status == crate::nav::NavigationStatus::ReachedWaypoint && *last != status {
            self.metrics.add_waypoint_reached();
        }
        *last = status;
        Ok(())
    }

    fn check_gps_health(&self) -> Result<()> {
        let position = match self.rtk.get_current_position() {
            Some(p) => p,
            None => return Err(RoverError::GpsUnhealthy("no position available".into())),
        };
        if position.satellites < MIN_SATELLITES {
            return Err(RoverError::GpsUnhealthy(format!(
                "insufficient satellites: {}",
                position.satellites
            )));
        }
        if position.hdop > MAX_HDOP {
            return Err(RoverError::GpsUnhealthy(format!(
                "poor accuracy (HDOP {:.1})",
                position.hdop
            )));
        }
        if position.age() > MAX_POSITION_AGE {
            return Err(RoverError::StalePosition);
        }
        Ok(())
    }

    // ── Navigation commands ───────────────────────────────────────────────────

    /// Navigate to a single waypoint.
    pub fn go_to_waypoint(&self, lat: f64, lon: f64, name: Option<String>) -> Result<()> {
        validate_coordinates(lat, lon)?;
        let state = self.navigator.get_state();
        if state.mode == crate::nav::NavigationMode::PathFollowing
            && state.status == crate::nav::NavigationStatus::Navigating
        {
            warn!(
                "overwriting active path ({} waypoints remaining) with a single target",
                state.waypoints_remaining
            );
        }
        let waypoint = Waypoint::new(lat, lon, name, self.navigator.default_tolerance());
        info!("navigating to waypoint {}", waypoint.label());
        self.navigator.set_target(waypoint);
        Ok(())
    }

    /// Follow a path of (lat, lon) points, in order.
    pub fn follow_path(&self, points: Vec<(f64, f64)>) -> Result<()> {
        if points.is_empty() {
            return Err(RoverError::Navigation("empty path".into()));
        }
        let tolerance = self.navigator.default_tolerance();
        let mut waypoints = Vec::with_capacity(points.len());
        for (i, (lat, lon)) in points.into_iter().enumerate() {
            validate_coordinates(lat, lon)?;
            waypoints.push(Waypoint::new(lat, lon, Some(format!("WP{}", i + 1)), tolerance));
        }
        info!("following path with {} waypoints", waypoints.len());
        self.navigator.set_waypoint_path(waypoints, None);
        Ok(())
    }

    /// Queue a waypoint without starting navigation.
    pub fn add_waypoint(&self, lat: f64, lon: f64, name: Option<String>) -> Result<()> {
        validate_coordinates(lat, lon)?;
        let waypoint = Waypoint::new(lat, lon, name, self.navigator.default_tolerance());
        self.navigator.add_waypoint(waypoint);
        Ok(())
    }

    pub fn start_navigation(&self) -> bool {
        self.navigator.start_navigation()
    }

    pub fn clear_waypoints(&self) {
        self.navigator.clear_waypoints();
    }

    pub fn get_waypoints(&self) -> Vec<Waypoint> {
        self.navigator.get_waypoints()
    }

    /// Pause navigation; motors come to rest through the ramp.
    pub fn pause_navigation(&self) {
        self.navigator.pause();
        if let Err(e) = self
            .motors
            .execute_differential_command(DifferentialDriveCommand::stop())
        {
            warn!("gentle stop failed during pause: {e}");
        }
        info!("navigation paused");
    }

    pub fn resume_navigation(&self) {
        self.navigator.resume();
        info!("navigation resumed");
    }

    /// Cancel: clear the route and stop the motors.  Unlike emergency stop
    /// this is not resumable.
    pub fn cancel_navigation(&self) {
        self.navigator.stop();
        self.navigator.clear_waypoints();
        self.motors.emergency_stop();
        info!("navigation cancelled, system reset to idle");
    }

    /// Emergency stop: motors halt now, navigation pauses and can resume.
    pub fn emergency_stop(&self, reason: &str) {
        error!("EMERGENCY STOP: {reason}");
        self.motors.emergency_stop();
        self.navigator.pause();
        self.metrics.add_emergency_stop(reason);
    }

    // ── Manual motor control ──────────────────────────────────────────────────

    /// Direct per-side control, bypassing navigation.
    pub fn manual_drive(&self, left: f64, right: f64) -> Result<()> {
        validate_magnitude(left)?;
        validate_magnitude(right)?;
        let command = DifferentialDriveCommand::new(left, right);
        info!(
            "manual drive: L={:.2} R={:.2}",
            command.left_speed, command.right_speed
        );
        self.motors.execute_differential_command(command)
    }

    /// Manual (speed, turn) control through the navigation mapping.
    pub fn manual_move(&self, speed: f64, turn_rate: f64) -> Result<()> {
        validate_magnitude(speed)?;
        validate_magnitude(turn_rate)?;
        let command = NavigationCommand::new(speed, turn_rate);
        info!(
            "manual move: speed={:.2} turn={:.2}",
            command.speed, command.turn_rate
        );
        self.motors.execute_navigation_command(command)
    }

    /// Stop the motors without touching the navigation state.
    pub fn stop_motors(&self) {
        self.motors.emergency_stop();
        info!("motors stopped");
    }

    pub fn set_max_speed(&self, speed: f64) {
        self.motors.set_max_speed(speed);
    }

    // ── Status ────────────────────────────────────────────────────────────────

    pub fn get_rover_status(&self) -> RoverStatus {
        let gps = self.rtk.get_current_position().map(|p| GpsSummary {
            lat:        p.lat,
            lon:        p.lon,
            fix:        p.fix,
            satellites: p.satellites,
            hdop:       p.hdop,
            age_secs:   p.age().as_secs_f64(),
        });
        RoverStatus {
            running:    self.running.load(Ordering::SeqCst),
            timestamp:  Utc::now().to_rfc3339(),
            navigation: self.navigator.get_state(),
            motor:      self.motors.get_status(),
            gps,
            rtk:        self.rtk.status(),
        }
    }

    pub fn get_metrics(&self) -> MetricsReport {
        self.metrics.report()
    }
}

/// Boundary validation for externally supplied coordinates.
fn validate_coordinates(lat: f64, lon: f64) -> Result<()> {
    if !lat.is_finite() || !lon.is_finite() {
        return Err(RoverError::Navigation("coordinates must be finite".into()));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(RoverError::Navigation(format!("latitude {lat} out of range")));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(RoverError::Navigation(format!("longitude {lon} out of range")));
    }
    Ok(())
}

/// Manual-control magnitudes must at least be numbers; clamping to [-1, 1]
/// happens in the command constructors.
fn validate_magnitude(value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(RoverError::Navigation("magnitude must be finite".into()));
    }
    Ok(())
}
