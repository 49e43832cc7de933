//! Waypoint navigator.
//!
//! A small state machine turns incoming positions into (speed, turn_rate)
//! commands:
//!
//! ```text
//! IDLE → [CALIBRATING] → ALIGNING → DRIVING → REACHED
//!                            ↑          |
//!                            └──────────┘  (re-align on large error)
//! ```
//!
//! CALIBRATING only runs when no heading is known: the rover drives straight
//! so the receiver can derive course over ground, and the phase ends once
//! enough consistent heading samples arrive.  ALIGNING rotates in place
//! toward the target bearing; DRIVING holds max speed with a small
//! proportional correction and falls back to ALIGNING when the error grows
//! past the re-align threshold.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::geo;
use super::pid::Pid;
use super::types::{
    NavigationCommand, NavigationMode, NavigationPhase, NavigationState, NavigationStatus,
    Waypoint,
};
use super::waypoints::WaypointQueue;

/// Positions older than this cannot drive the rover.
const STALE_AFTER: Duration = Duration::from_secs(2);
/// Samples within this range (degrees) count as a consistent heading.
const CALIBRATION_CONSISTENCY: f64 = 15.0;
/// Consistent samples required to finish calibration early.
const CALIBRATION_SAMPLES: usize = 3;
/// Proportional drive correction never exceeds this turn rate.
const DRIVE_CORRECTION_LIMIT: f64 = 0.2;

/// Tunables, all overridable from the configuration file.
#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub max_speed:             f64,
    /// Default reach radius (m) for waypoints created without one.
    pub waypoint_tolerance:    f64,
    /// Heading error (deg) below which ALIGN hands over to DRIVE.
    pub align_tolerance:       f64,
    /// Heading error (deg) above which DRIVE falls back to ALIGN.
    pub realign_threshold:     f64,
    /// Rotation rate multiplier while aligning.
    pub align_speed:           f64,
    pub align_timeout:         Duration,
    pub drive_correction_gain: f64,
    /// Forward speed commanded while acquiring an initial heading.
    pub calibration_speed:     f64,
    pub calibration_duration:  Duration,
    /// Minimum ground speed (m/s) before a movement-derived heading is trusted.
    pub min_speed_for_heading: f64,
    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        NavigatorConfig {
            max_speed:             1.0,
            waypoint_tolerance:    2.0,
            align_tolerance:       15.0,
            realign_threshold:     30.0,
            align_speed:           0.6,
            align_timeout:         Duration::from_secs(10),
            drive_correction_gain: 0.02,
            calibration_speed:     0.5,
            calibration_duration:  Duration::from_secs(5),
            min_speed_for_heading: 0.5,
            pid_kp: 0.012,
            pid_ki: 0.0005,
            pid_kd: 0.008,
        }
    }
}

struct Calibration {
    started: Instant,
    samples: Vec<f64>,
}

struct NavInner {
    position:           Option<(f64, f64)>,
    heading:            Option<f64>,
    speed:              Option<f64>,
    last_position_time: Option<Instant>,
    target:             Option<Waypoint>,
    queue:              WaypointQueue,
    mode:               NavigationMode,
    status:             NavigationStatus,
    phase:              NavigationPhase,
    phase_start:        Option<Instant>,
    calibration:        Option<Calibration>,
    running:            bool,
    paused:             bool,
    error_message:      Option<String>,
    heading_pid:        Pid,
}

/// Thread-safe navigator; every public method takes the internal lock and
/// returns before any I/O happens elsewhere.
pub struct Navigator {
    cfg:   NavigatorConfig,
    inner: Mutex<NavInner>,
}

impl Navigator {
    pub fn new(cfg: NavigatorConfig) -> Self {
        let pid = Pid::new(cfg.pid_kp, cfg.pid_ki, cfg.pid_kd, (-0.6, 0.6));
        info!(
            "navigator ready: align tol={}° realign={}° speed={:.2} timeout={:?}, drive gain={:.3}",
            cfg.align_tolerance,
            cfg.realign_threshold,
            cfg.align_speed,
            cfg.align_timeout,
            cfg.drive_correction_gain
        );
        Navigator {
            inner: Mutex::new(NavInner {
                position:           None,
                heading:            None,
                speed:              None,
                last_position_time: None,
                target:             None,
                queue:              WaypointQueue::new(false),
                mode:               NavigationMode::Idle,
                status:             NavigationStatus::Idle,
                phase:              NavigationPhase::Idle,
                phase_start:        None,
                calibration:        None,
                running:            false,
                paused:             false,
                error_message:      None,
                heading_pid:        pid,
            }),
            cfg,
        }
    }

    /// Reach radius used for waypoints created without an explicit one.
    pub fn default_tolerance(&self) -> f64 {
        self.cfg.waypoint_tolerance
    }

    // ── Position intake ───────────────────────────────────────────────────────

    /// Feed a new fix.  Heading priority: explicit course over ground, then
    /// movement bearing when the rover is fast enough to trust it, then the
    /// previous heading.
    pub fn update_position(
        &self,
        lat: f64,
        lon: f64,
        heading: Option<f64>,
        speed: Option<f64>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.position;
        inner.position = Some((lat, lon));
        inner.last_position_time = Some(Instant::now());

        if let Some(h) = heading {
            inner.heading = Some(h);
            debug!("heading from course over ground: {h:.1}°");
        } else if let (Some((plat, plon)), Some(s)) = (previous, speed) {
            if s > self.cfg.min_speed_for_heading {
                let derived = geo::bearing(plat, plon, lat, lon);
                inner.heading = Some(derived);
                debug!("heading derived from movement: {derived:.1}°");
            }
        }

        if speed.is_some() {
            inner.speed = speed;
        }
    }

    // ── Targets ───────────────────────────────────────────────────────────────

    /// Set a single target waypoint and auto-start navigation.
    pub fn set_target(&self, waypoint: Waypoint) {
        let mut inner = self.inner.lock().unwrap();
        info!(
            "target set: {} at ({:.6}, {:.6}), tolerance {} m",
            waypoint.label(),
            waypoint.lat,
            waypoint.lon,
            waypoint.tolerance
        );
        inner.target = Some(waypoint);
        inner.mode = NavigationMode::Waypoint;
        inner.status = NavigationStatus::Navigating;
        inner.phase = NavigationPhase::Idle;
        inner.phase_start = None;
        inner.calibration = None;
        inner.error_message = None;
        if !inner.running {
            inner.running = true;
            inner.paused = false;
            info!("navigator auto-started");
        }
    }

    /// Replace the waypoint queue and start following it.
    pub fn set_waypoint_path(&self, waypoints: Vec<Waypoint>, loop_mode: Option<bool>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lm) = loop_mode {
            inner.queue.set_loop_mode(lm);
        }
        inner.queue.clear();
        let count = waypoints.len();
        for wp in waypoints {
            inner.queue.add(wp);
        }
        inner.target = inner.queue.current().cloned();
        if inner.target.is_some() {
            inner.mode = NavigationMode::PathFollowing;
            inner.status = NavigationStatus::Navigating;
            inner.phase = NavigationPhase::Idle;
            inner.phase_start = None;
            inner.calibration = None;
            inner.error_message = None;
            let style = if inner.queue.is_loop_mode() { "loop" } else { "one-shot" };
            let first = inner
                .target
                .as_ref()
                .map(|w| w.label().to_string())
                .unwrap_or_default();
            info!("path set: {count} waypoints ({style}), first is {first}");
            if !inner.running {
                inner.running = true;
                inner.paused = false;
            }
        }
    }

    /// Queue a waypoint without starting navigation.
    pub fn add_waypoint(&self, waypoint: Waypoint) {
        self.inner.lock().unwrap().queue.add(waypoint);
    }

    /// Start following previously queued waypoints.
    pub fn start_navigation(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.target.is_some() {
            return true;
        }
        match inner.queue.current().cloned() {
            Some(first) => {
                inner.target = Some(first);
                inner.mode = NavigationMode::PathFollowing;
                inner.status = NavigationStatus::Navigating;
                inner.phase = NavigationPhase::Idle;
                inner.phase_start = None;
                inner.running = true;
                inner.paused = false;
                true
            }
            None => false,
        }
    }

    pub fn get_waypoints(&self) -> Vec<Waypoint> {
        self.inner.lock().unwrap().queue.all()
    }

    pub fn clear_waypoints(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        if inner.mode == NavigationMode::PathFollowing {
            inner.target = None;
            inner.status = NavigationStatus::Idle;
            inner.phase = NavigationPhase::Idle;
        }
        info!("waypoint queue cleared");
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Idempotent start.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running {
            inner.running = true;
            inner.paused = false;
            inner.error_message = None;
            info!("navigator started");
        }
    }

    /// Full stop: target dropped, state machine reset.  The waypoint queue
    /// survives so a later `start_navigation` can reuse it.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        inner.paused = false;
        inner.target = None;
        inner.status = NavigationStatus::Idle;
        inner.phase = NavigationPhase::Idle;
        inner.phase_start = None;
        inner.calibration = None;
        inner.heading_pid.reset();
        info!("navigator stopped");
    }

    /// Pause, preserving the target and the current phase.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running && !inner.paused {
            inner.paused = true;
            inner.status = NavigationStatus::Paused;
            inner.heading_pid.reset();
            info!(
                "navigator paused (target: {}, phase: {:?})",
                inner.target.as_ref().map(|w| w.label().to_string()).unwrap_or_else(|| "none".into()),
                inner.phase
            );
        }
    }

    /// Resume from the phase the pause interrupted.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running && inner.paused {
            inner.paused = false;
            inner.status = if inner.target.is_some() {
                NavigationStatus::Navigating
            } else {
                NavigationStatus::Idle
            };
            inner.heading_pid.reset();
            if inner.phase == NavigationPhase::Idle && inner.target.is_some() {
                inner.phase = NavigationPhase::Aligning;
                inner.phase_start = Some(Instant::now());
            }
            info!("navigator resumed (phase: {:?})", inner.phase);
        }
    }

    // ── Command generation ────────────────────────────────────────────────────

    /// Compute the next drive command, or `None` when the navigator is
    /// inactive, has no position, or the position is stale.
    pub fn get_navigation_command(&self) -> Option<NavigationCommand> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.running || inner.paused {
            return None;
        }

        if inner.position.is_none() {
            inner.error_message = Some("no GPS position available".into());
            inner.status = NavigationStatus::Error;
            return None;
        }

        let stale = inner
            .last_position_time
            .map(|t| t.elapsed() > STALE_AFTER)
            .unwrap_or(true);
        if stale {
            inner.error_message = Some("GPS position stale".into());
            inner.status = NavigationStatus::Error;
            warn!("position data stale, withholding navigation command");
            return None;
        }

        if inner.target.is_none() {
            inner.status = NavigationStatus::Idle;
            inner.phase = NavigationPhase::Idle;
            return Some(NavigationCommand::stop());
        }

        // Heading acquisition runs before anything else when needed.
        if inner.heading.is_none() && inner.calibration.is_none()
            && inner.phase != NavigationPhase::Calibrating
        {
            warn!(
                "no heading available, calibrating: driving straight at {:.0}% for up to {:?}",
                self.cfg.calibration_speed * 100.0,
                self.cfg.calibration_duration
            );
            inner.calibration = Some(Calibration {
                started: Instant::now(),
                samples: Vec::new(),
            });
            inner.phase = NavigationPhase::Calibrating;
        }

        if inner.phase == NavigationPhase::Calibrating {
            if let Some(cmd) = self.handle_calibration(&mut inner) {
                return Some(cmd);
            }
            // Calibration finished; fall through into the next phase.
        }

        match inner.phase {
            NavigationPhase::Idle => {
                inner.phase = NavigationPhase::Aligning;
                inner.phase_start = Some(Instant::now());
                debug!("entering ALIGN phase");
                Some(self.handle_align(&mut inner))
            }
            NavigationPhase::Aligning => Some(self.handle_align(&mut inner)),
            NavigationPhase::Driving => Some(self.handle_drive(&mut inner)),
            NavigationPhase::Reached => Some(NavigationCommand::stop()),
            NavigationPhase::Calibrating => unreachable!("calibration handled above"),
        }
    }

    /// Returns the command to keep calibrating, or `None` once the phase is
    /// over and `inner.phase` points at the follow-up phase.
    fn handle_calibration(&self, inner: &mut NavInner) -> Option<NavigationCommand> {
        enum Outcome {
            Continue,
            Complete(f64),
            TimeoutPartial(f64),
            TimeoutEmpty,
        }

        let heading = inner.heading;
        let outcome = {
            let cal = inner.calibration.as_mut().expect("calibrating without state");
            if let Some(h) = heading {
                cal.samples.push(h);
                info!(
                    "heading sample {}/{}: {h:.1}°",
                    cal.samples.len(),
                    CALIBRATION_SAMPLES
                );
            }
            let elapsed = cal.started.elapsed();

            if cal.samples.len() >= CALIBRATION_SAMPLES {
                let max = cal.samples.iter().cloned().fold(f64::MIN, f64::max);
                let min = cal.samples.iter().cloned().fold(f64::MAX, f64::min);
                if max - min < CALIBRATION_CONSISTENCY {
                    let mean = cal.samples.iter().sum::<f64>() / cal.samples.len() as f64;
                    info!(
                        "heading calibration complete: {mean:.1}° (range {:.1}°, {elapsed:.1?})",
                        max - min
                    );
                    Outcome::Complete(mean)
                } else {
                    warn!(
                        "heading samples inconsistent (range {:.1}°), continuing",
                        max - min
                    );
                    let keep = cal.samples.split_off(cal.samples.len() - 2);
                    cal.samples = keep;
                    Outcome::Continue
                }
            } else if elapsed >= self.cfg.calibration_duration {
                if cal.samples.is_empty() {
                    warn!("heading calibration timed out with no samples, driving anyway");
                    Outcome::TimeoutEmpty
                } else {
                    let mean = cal.samples.iter().sum::<f64>() / cal.samples.len() as f64;
                    warn!(
                        "heading calibration timed out, using partial mean {mean:.1}° from {} samples",
                        cal.samples.len()
                    );
                    Outcome::TimeoutPartial(mean)
                }
            } else {
                Outcome::Continue
            }
        };

        match outcome {
            Outcome::Continue => Some(NavigationCommand::new(self.cfg.calibration_speed, 0.0)),
            Outcome::Complete(mean) | Outcome::TimeoutPartial(mean) => {
                inner.heading = Some(mean);
                inner.calibration = None;
                inner.phase = NavigationPhase::Aligning;
                inner.phase_start = Some(Instant::now());
                None
            }
            Outcome::TimeoutEmpty => {
                inner.calibration = None;
                inner.phase = NavigationPhase::Driving;
                inner.phase_start = Some(Instant::now());
                None
            }
        }
    }

    /// Rotate in place toward the target bearing.
    fn handle_align(&self, inner: &mut NavInner) -> NavigationCommand {
        let (lat, lon) = inner.position.expect("align without position");
        let target = inner.target.as_ref().expect("align without target");
        let target_bearing = geo::bearing(lat, lon, target.lat, target.lon);

        let heading = match inner.heading {
            Some(h) => h,
            None => {
                // Cannot rotate toward an unknown error; creep forward and
                // let course over ground fill in.
                warn!("no heading during ALIGN, switching to DRIVE");
                inner.phase = NavigationPhase::Driving;
                inner.phase_start = Some(Instant::now());
                return NavigationCommand::new(self.cfg.max_speed * 0.5, 0.0);
            }
        };

        let error = geo::angle_difference(heading, target_bearing);

        if error.abs() < self.cfg.align_tolerance {
            info!(
                "aligned: heading {heading:.1}°, bearing {target_bearing:.1}°, error {error:.1}°"
            );
            inner.phase = NavigationPhase::Driving;
            inner.phase_start = Some(Instant::now());
            inner.heading_pid.reset();
            return NavigationCommand::new(self.cfg.max_speed, 0.0);
        }

        let elapsed = inner
            .phase_start
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if elapsed > self.cfg.align_timeout {
            warn!("ALIGN timeout after {elapsed:.1?} (error {error:.1}°), driving anyway");
            inner.phase = NavigationPhase::Driving;
            inner.phase_start = Some(Instant::now());
            return NavigationCommand::new(self.cfg.max_speed * 0.5, 0.0);
        }

        let direction = if error > 0.0 { 1.0 } else { -1.0 };
        let intensity = (error.abs() / 90.0).min(1.0);
        debug!(
            "aligning: heading {heading:.1}° bearing {target_bearing:.1}° error {error:.1}°"
        );
        NavigationCommand::new(0.0, direction * intensity * self.cfg.align_speed)
    }

    /// Drive at max speed with a small proportional course correction.
    fn handle_drive(&self, inner: &mut NavInner) -> NavigationCommand {
        let (lat, lon) = inner.position.expect("drive without position");
        let target = inner.target.as_ref().expect("drive without target").clone();

        let distance = geo::haversine_distance(lat, lon, target.lat, target.lon);
        if distance <= target.tolerance {
            inner.phase = NavigationPhase::Reached;
            debug!("within {:.2} m of {}, reached", distance, target.label());
            return self.handle_reached(inner);
        }

        let target_bearing = geo::bearing(lat, lon, target.lat, target.lon);
        let heading = match inner.heading {
            Some(h) => h,
            None => {
                warn!("no heading during DRIVE, continuing straight");
                return NavigationCommand::new(self.cfg.max_speed * 0.5, 0.0);
            }
        };

        let error = geo::angle_difference(heading, target_bearing);

        if error.abs() > self.cfg.realign_threshold {
            info!("heading error {error:.1}° exceeds re-align threshold, rotating");
            inner.phase = NavigationPhase::Aligning;
            inner.phase_start = Some(Instant::now());
            inner.heading_pid.reset();
            return self.handle_align(inner);
        }

        // Only the proportional term; the PID integral/derivative stay
        // parked until field tuning says otherwise.
        let correction = (error * self.cfg.drive_correction_gain)
            .max(-DRIVE_CORRECTION_LIMIT)
            .min(DRIVE_CORRECTION_LIMIT);

        debug!(
            "driving: dist {distance:.1} m, heading {heading:.1}°, bearing {target_bearing:.1}°, correction {correction:.2}"
        );
        NavigationCommand::new(self.cfg.max_speed, correction)
    }

    /// Stop, advance the queue (loop-aware) and line up the next waypoint.
    fn handle_reached(&self, inner: &mut NavInner) -> NavigationCommand {
        let reached = inner.target.as_ref().expect("reached without target").clone();
        info!(
            "waypoint reached: {} at ({:.6}, {:.6})",
            reached.label(),
            reached.lat,
            reached.lon
        );
        inner.status = NavigationStatus::ReachedWaypoint;

        if inner.mode == NavigationMode::PathFollowing {
            if inner.queue.advance_to_next() {
                inner.target = inner.queue.current().cloned();
                inner.status = NavigationStatus::Navigating;
                if let Some(next) = &inner.target {
                    info!(
                        "next waypoint: {} ({} remaining)",
                        next.label(),
                        inner.queue.remaining()
                    );
                }
            } else {
                inner.target = None;
                inner.status = NavigationStatus::PathComplete;
                info!("path complete, all waypoints reached");
            }
        } else {
            inner.target = None;
            inner.status = NavigationStatus::Idle;
            info!("navigation complete");
        }

        inner.heading_pid.reset();
        inner.phase = NavigationPhase::Idle;
        inner.phase_start = None;
        NavigationCommand::stop()
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Immutable snapshot of the current navigation state.
    pub fn get_state(&self) -> NavigationState {
        let inner = self.inner.lock().unwrap();
        let (distance, bearing_to) = match (inner.position, &inner.target) {
            (Some((lat, lon)), Some(t)) => (
                Some(geo::haversine_distance(lat, lon, t.lat, t.lon)),
                Some(geo::bearing(lat, lon, t.lat, t.lon)),
            ),
            _ => (None, None),
        };
        NavigationState {
            current_position:    inner.position,
            target_waypoint:     inner.target.clone(),
            distance_to_target:  distance,
            bearing_to_target:   bearing_to,
            current_heading:     inner.heading,
            current_speed:       inner.speed,
            mode:                inner.mode,
            status:              inner.status,
            phase:               inner.phase,
            waypoints_remaining: inner.queue.remaining(),
            error_message:       inner.error_message.clone(),
        }
    }

    #[cfg(test)]
    fn backdate_position(&self, age: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_position_time = Some(Instant::now() - age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn navigator() -> Navigator {
        Navigator::new(NavigatorConfig::default())
    }

    fn wp(lat: f64, lon: f64, tol: f64) -> Waypoint {
        Waypoint::new(lat, lon, None, tol)
    }

    #[test]
    fn no_command_without_start() {
        let nav = navigator();
        nav.update_position(52.2297, 21.0122, Some(0.0), None);
        assert!(nav.get_navigation_command().is_none());
    }

    #[test]
    fn stale_position_gates_commands() {
        let nav = navigator();
        nav.set_target(wp(52.2307, 21.0122, 2.0));
        nav.update_position(52.2297, 21.0122, Some(0.0), None);
        assert!(nav.get_navigation_command().is_some());

        nav.backdate_position(Duration::from_secs(3));
        assert!(nav.get_navigation_command().is_none());
        assert_eq!(nav.get_state().status, NavigationStatus::Error);
    }

    #[test]
    fn straight_drive_north() {
        // S1: aligned north toward a target due north → DRIVE at max speed
        // with a small correction, reaching on arrival.
        let nav = navigator();
        nav.set_target(wp(52.2307, 21.0122, 2.0));
        nav.update_position(52.2297, 21.0122, Some(0.0), None);

        // Heading 0°, bearing 0°: ALIGN passes through immediately.
        let cmd = nav.get_navigation_command().expect("align → drive");
        assert_eq!(nav.get_state().phase, NavigationPhase::Driving);
        assert!((cmd.speed - 1.0).abs() < 1e-9);

        let cmd = nav.get_navigation_command().expect("driving");
        assert!((cmd.speed - 1.0).abs() < 1e-9);
        assert!(cmd.turn_rate.abs() <= 0.2);

        // Arrive.
        nav.update_position(52.2307, 21.0122, Some(0.0), None);
        let cmd = nav.get_navigation_command().expect("reached");
        assert_eq!(cmd.speed, 0.0);
        assert_eq!(cmd.turn_rate, 0.0);
        let state = nav.get_state();
        assert_eq!(state.status, NavigationStatus::Idle);
        assert!(state.target_waypoint.is_none());
    }

    #[test]
    fn spot_rotation_toward_south() {
        // S2: heading 0°, target due south → rotate in place with a
        // consistent sign until aligned.
        let nav = navigator();
        nav.set_target(wp(52.2287, 21.0122, 2.0));
        nav.update_position(52.2297, 21.0122, Some(0.0), None);

        let first = nav.get_navigation_command().expect("aligning");
        assert_eq!(first.speed, 0.0);
        assert!(first.turn_rate.abs() > 0.0);
        assert!(first.turn_rate.abs() <= 0.6);
        let sign = first.turn_rate.signum();

        for heading in [45.0, 90.0, 135.0] {
            nav.update_position(52.2297, 21.0122, Some(heading), None);
            let cmd = nav.get_navigation_command().expect("still aligning");
            assert_eq!(cmd.speed, 0.0);
            assert_eq!(cmd.turn_rate.signum(), sign);
        }

        nav.update_position(52.2297, 21.0122, Some(175.0), None);
        nav.get_navigation_command().expect("aligned now");
        assert_eq!(nav.get_state().phase, NavigationPhase::Driving);
    }

    #[test]
    fn simulated_drive_closes_distance_monotonically() {
        // S1 continued: step the rover along its commanded heading and the
        // distance to target must shrink every tick until REACHED.
        let nav = navigator();
        let target = wp(52.2307, 21.0122, 2.0);
        nav.set_target(target.clone());

        let (mut lat, mut lon) = (52.2297, 21.0122);
        nav.update_position(lat, lon, Some(0.0), None);
        let mut last_distance = geo::haversine_distance(lat, lon, target.lat, target.lon);

        let mut reached = false;
        for _ in 0..40 {
            let cmd = nav.get_navigation_command().expect("command");
            if cmd.speed == 0.0 && cmd.turn_rate == 0.0 {
                reached = true;
                break;
            }
            assert!(cmd.turn_rate.abs() <= 0.2, "drive correction out of bounds");
            // Advance 5 m along the heading per tick.
            let step = cmd.speed * 5.0;
            let (nlat, nlon) = geo::destination_point(lat, lon, 0.0, step);
            lat = nlat;
            lon = nlon;
            nav.update_position(lat, lon, Some(0.0), None);

            let distance = geo::haversine_distance(lat, lon, target.lat, target.lon);
            assert!(distance < last_distance, "distance must shrink");
            last_distance = distance;
        }
        assert!(reached, "never reached the waypoint");
        assert!(last_distance <= target.tolerance + 5.0);
    }

    #[test]
    fn drive_realigns_on_large_error() {
        let nav = navigator();
        nav.set_target(wp(52.2307, 21.0122, 2.0));
        nav.update_position(52.2297, 21.0122, Some(0.0), None);
        nav.get_navigation_command().expect("into drive");
        assert_eq!(nav.get_state().phase, NavigationPhase::Driving);

        // Swing the heading 90° off the bearing.
        nav.update_position(52.2297, 21.0122, Some(90.0), None);
        let cmd = nav.get_navigation_command().expect("re-align");
        assert_eq!(nav.get_state().phase, NavigationPhase::Aligning);
        assert_eq!(cmd.speed, 0.0);
    }

    #[test]
    fn calibration_runs_without_heading() {
        let nav = navigator();
        nav.set_target(wp(52.2307, 21.0122, 2.0));
        nav.update_position(52.2297, 21.0122, None, None);

        let cmd = nav.get_navigation_command().expect("calibrating");
        assert_eq!(nav.get_state().phase, NavigationPhase::Calibrating);
        assert!((cmd.speed - 0.5).abs() < 1e-9);
        assert_eq!(cmd.turn_rate, 0.0);

        // Three consistent course-over-ground samples complete calibration.
        for h in [10.0, 12.0, 11.0] {
            nav.update_position(52.2297, 21.0122, Some(h), None);
            nav.get_navigation_command();
        }
        let state = nav.get_state();
        assert_ne!(state.phase, NavigationPhase::Calibrating);
        assert!((state.current_heading.unwrap() - 11.0).abs() < 1.0);
    }

    #[test]
    fn pause_preserves_phase_resume_continues() {
        let nav = navigator();
        nav.set_target(wp(52.2307, 21.0122, 2.0));
        nav.update_position(52.2297, 21.0122, Some(0.0), None);
        nav.get_navigation_command().expect("into drive");
        assert_eq!(nav.get_state().phase, NavigationPhase::Driving);

        nav.pause();
        assert!(nav.get_navigation_command().is_none());
        assert_eq!(nav.get_state().status, NavigationStatus::Paused);
        assert_eq!(nav.get_state().phase, NavigationPhase::Driving);

        nav.resume();
        assert_eq!(nav.get_state().phase, NavigationPhase::Driving);
        assert!(nav.get_navigation_command().is_some());
    }

    #[test]
    fn loop_patrol_wraps_and_counts() {
        // S6: three waypoints in loop mode; reaching each wraps back and
        // remaining stays at 3 throughout.
        let nav = navigator();
        let waypoints = vec![
            wp(52.2297, 21.0122, 2.0),
            wp(52.2307, 21.0122, 2.0),
            wp(52.2307, 21.0132, 2.0),
        ];
        nav.set_waypoint_path(waypoints.clone(), Some(true));

        for (i, target) in waypoints.iter().enumerate().take(3) {
            // Teleport onto the current target.  The first command may pass
            // through ALIGN into DRIVE; the reach check emits stop within a
            // couple of ticks.
            nav.update_position(target.lat, target.lon, Some(0.0), None);
            let mut reached = false;
            for _ in 0..3 {
                let cmd = nav.get_navigation_command().expect("command");
                if cmd.speed == 0.0 && cmd.turn_rate == 0.0 {
                    reached = true;
                    break;
                }
            }
            assert!(reached, "waypoint {i} never reached");
            assert_eq!(nav.get_state().waypoints_remaining, 3);
        }

        // Wrapped: loop counter 1, first waypoint is the target again.
        let state = nav.get_state();
        assert_eq!(state.status, NavigationStatus::Navigating);
        let target = state.target_waypoint.expect("target after wrap");
        assert!((target.lat - waypoints[0].lat).abs() < 1e-9);
    }

    #[test]
    fn heading_derived_from_movement_only_when_fast() {
        let nav = navigator();
        nav.update_position(52.2297, 21.0122, None, Some(0.2));
        // Second fix due north, but too slow to trust.
        nav.update_position(52.2298, 21.0122, None, Some(0.2));
        assert!(nav.get_state().current_heading.is_none());

        nav.update_position(52.2299, 21.0122, None, Some(1.0));
        let heading = nav.get_state().current_heading.expect("derived heading");
        assert!(heading < 1.0 || heading > 359.0, "north-ish, got {heading}");
    }

    #[test]
    fn cancelled_path_is_cleared() {
        let nav = navigator();
        nav.set_waypoint_path(vec![wp(52.23, 21.01, 2.0), wp(52.24, 21.01, 2.0)], None);
        nav.stop();
        nav.clear_waypoints();
        assert!(nav.get_waypoints().is_empty());
        let state = nav.get_state();
        assert_eq!(state.status, NavigationStatus::Idle);
        assert!(state.target_waypoint.is_none());
    }
}
