//! High-level motor controller.
//!
//! Translates navigation commands into per-side H-bridge calls, ramping the
//! setpoints so the chassis never sees a step change, and watches a command
//! watchdog: if nothing arrives within the safety timeout the motors stop on
//! their own.  Emergency stop is event-driven and bypasses ramping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{DifferentialDriveCommand, MotorDirection, MotorDriver, MotorSide};
use crate::error::{Result, RoverError};
use crate::nav::NavigationCommand;

/// Watchdog wake interval; emergencies interrupt it immediately.
const SAFETY_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct MotorControllerConfig {
    /// Output scale applied after the differential mapping.
    pub max_speed:        f64,
    /// Multiplier on incoming turn rates.
    pub turn_sensitivity: f64,
    /// Stop the motors when no command arrives for this long.
    pub safety_timeout:   Duration,
    /// Maximum setpoint change per command execution, per side.
    pub ramp_rate:        f64,
}

impl Default for MotorControllerConfig {
    fn default() -> Self {
        MotorControllerConfig {
            max_speed:        1.0,
            turn_sensitivity: 1.0,
            safety_timeout:   Duration::from_secs(2),
            ramp_rate:        0.5,
        }
    }
}

/// Mutable tunables, adjustable at runtime from the command interface.
struct Tunables {
    max_speed:        f64,
    turn_sensitivity: f64,
}

/// Ramp and watchdog state.
struct DriveState {
    current_left:  f64,
    current_right: f64,
    last_command:  Option<Instant>,
    command:       Option<DifferentialDriveCommand>,
}

/// Controller status snapshot for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct MotorStatus {
    pub running:             bool,
    pub driver_initialized:  bool,
    pub command:             Option<DifferentialDriveCommand>,
    pub current_left:        f64,
    pub current_right:       f64,
    pub seconds_since_command: Option<f64>,
    pub max_speed:           f64,
    pub turn_sensitivity:    f64,
    /// Why the motors last stopped on their own, if they did.
    pub last_fault:          Option<String>,
}

pub struct MotorController {
    driver:        Arc<dyn MotorDriver>,
    safety_timeout: Duration,
    ramp_rate:     f64,
    tunables:      Mutex<Tunables>,
    state:         Mutex<DriveState>,
    running:       AtomicBool,
    estop:         Notify,
    last_fault:    Mutex<Option<String>>,
    safety_task:   Mutex<Option<JoinHandle<()>>>,
}

impl MotorController {
    pub fn new(driver: Arc<dyn MotorDriver>, cfg: MotorControllerConfig) -> Self {
        let ramp_rate = cfg.ramp_rate.max(0.01).min(1.0);
        info!(
            "motor controller: ramp={ramp_rate:.2}/cycle, watchdog={:?}",
            cfg.safety_timeout
        );
        MotorController {
            driver,
            safety_timeout: cfg.safety_timeout,
            ramp_rate,
            tunables: Mutex::new(Tunables {
                max_speed:        cfg.max_speed.max(0.0).min(1.0),
                turn_sensitivity: cfg.turn_sensitivity.max(0.1).min(2.0),
            }),
            state: Mutex::new(DriveState {
                current_left:  0.0,
                current_right: 0.0,
                last_command:  None,
                command:       None,
            }),
            running:     AtomicBool::new(false),
            estop:       Notify::new(),
            last_fault:  Mutex::new(None),
            safety_task: Mutex::new(None),
        }
    }

    /// Initialise the driver and start the watchdog task.
    pub fn start(this: &Arc<Self>) -> Result<()> {
        if this.running.swap(true, Ordering::SeqCst) {
            warn!("motor controller already running");
            return Ok(());
        }
        this.driver.initialize()?;

        let ctrl = Arc::clone(this);
        let handle = tokio::spawn(async move { ctrl.safety_monitor().await });
        *this.safety_task.lock().unwrap() = Some(handle);

        info!("motor controller started");
        Ok(())
    }

    /// Stop motors, kill the watchdog, release the driver.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping motor controller");
        self.emergency_stop();
        if let Some(handle) = self.safety_task.lock().unwrap().take() {
            handle.abort();
        }
        self.driver.cleanup();
        info!("motor controller stopped");
    }

    /// Execute a navigation-level (speed, turn) command.
    pub fn execute_navigation_command(&self, cmd: NavigationCommand) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            error!("motor controller not running, command rejected");
            return Err(RoverError::MotorDriver("controller not running".into()));
        }
        let turn_sensitivity = self.tunables.lock().unwrap().turn_sensitivity;
        let diff = navigation_to_differential(&cmd, turn_sensitivity);
        debug!(
            "nav command speed={:.2} turn={:.2} (age {:?}) → L={:.2} R={:.2}",
            cmd.speed,
            cmd.turn_rate,
            cmd.timestamp.elapsed(),
            diff.left_speed,
            diff.right_speed
        );
        self.execute_differential_command(diff)
    }

    /// Execute a differential (left, right) command with ramping.
    pub fn execute_differential_command(&self, cmd: DifferentialDriveCommand) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            error!("motor controller not running, command rejected");
            return Err(RoverError::MotorDriver("controller not running".into()));
        }

        let max_speed = self.tunables.lock().unwrap().max_speed;
        self.last_fault.lock().unwrap().take();
        let (left, right) = {
            let mut state = self.state.lock().unwrap();
            state.command = Some(cmd);
            state.last_command = Some(Instant::now());
            let target_left = cmd.left_speed * max_speed;
            let target_right = cmd.right_speed * max_speed;
            state.current_left = ramp_toward(state.current_left, target_left, self.ramp_rate);
            state.current_right = ramp_toward(state.current_right, target_right, self.ramp_rate);
            (state.current_left, state.current_right)
        };

        self.apply_side(MotorSide::Left, left)?;
        self.apply_side(MotorSide::Right, right)?;

        if left.abs() > 0.01 || right.abs() > 0.01 {
            debug!("motors: L={left:.2} R={right:.2}");
        }
        Ok(())
    }

    fn apply_side(&self, side: MotorSide, speed: f64) -> Result<()> {
        let direction = if speed > 0.0 {
            MotorDirection::Forward
        } else if speed < 0.0 {
            MotorDirection::Backward
        } else {
            MotorDirection::Stop
        };
        self.driver.set_motor(side, direction, speed.abs())
    }

    /// Immediate stop: driver halt, ramp state zeroed, watchdog disarmed.
    pub fn emergency_stop(&self) {
        warn!("EMERGENCY STOP");
        self.estop.notify_waiters();
        if let Err(e) = self.driver.stop_all() {
            error!("driver stop_all failed during emergency stop: {e}");
        }
        let mut state = self.state.lock().unwrap();
        state.command = None;
        state.last_command = None;
        state.current_left = 0.0;
        state.current_right = 0.0;
    }

    async fn safety_monitor(self: Arc<Self>) {
        info!("motor safety monitor started");
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                // Emergency stops are handled synchronously in
                // `emergency_stop`; the wakeup only restarts the wait.
                _ = self.estop.notified() => continue,
                _ = tokio::time::sleep(SAFETY_CHECK_INTERVAL) => {}
            }

            let timed_out = {
                let state = self.state.lock().unwrap();
                state
                    .last_command
                    .map(|t| t.elapsed() > self.safety_timeout)
                    .unwrap_or(false)
            };
            if timed_out {
                warn!(
                    "watchdog: no motor command for {:?}, stopping motors",
                    self.safety_timeout
                );
                *self.last_fault.lock().unwrap() =
                    Some(RoverError::WatchdogTimeout.to_string());
                if let Err(e) = self.driver.stop_all() {
                    error!("driver stop_all failed in watchdog: {e}");
                    break;
                }
                let mut state = self.state.lock().unwrap();
                state.command = None;
                state.last_command = None;
                state.current_left = 0.0;
                state.current_right = 0.0;
            }
        }
        info!("motor safety monitor stopped");
    }

    pub fn set_max_speed(&self, speed: f64) {
        let clamped = speed.max(0.0).min(1.0);
        self.tunables.lock().unwrap().max_speed = clamped;
        info!("max speed set to {clamped:.2}");
    }

    pub fn get_status(&self) -> MotorStatus {
        let tunables = self.tunables.lock().unwrap();
        let state = self.state.lock().unwrap();
        MotorStatus {
            running:            self.running.load(Ordering::SeqCst),
            driver_initialized: self.driver.is_initialized(),
            command:            state.command,
            current_left:       state.current_left,
            current_right:      state.current_right,
            seconds_since_command: state.last_command.map(|t| t.elapsed().as_secs_f64()),
            max_speed:          tunables.max_speed,
            turn_sensitivity:   tunables.turn_sensitivity,
            last_fault:         self.last_fault.lock().unwrap().clone(),
        }
    }
}

/// Move `current` toward `target` by at most `ramp_rate`.
fn ramp_toward(current: f64, target: f64, ramp_rate: f64) -> f64 {
    let delta = target - current;
    if delta.abs() > ramp_rate {
        current + ramp_rate * delta.signum()
    } else {
        target
    }
}

/// Map a navigation (speed, turn) pair onto per-side speeds.
///
/// Spot rotation when speed is zero; otherwise the classic differential mix
/// with proportional renormalisation so the turn ratio survives saturation.
fn navigation_to_differential(
    cmd: &NavigationCommand,
    turn_sensitivity: f64,
) -> DifferentialDriveCommand {
    let speed = cmd.speed;
    let turn = cmd.turn_rate * turn_sensitivity;

    if speed == 0.0 && turn != 0.0 {
        return DifferentialDriveCommand::new(-turn, turn);
    }

    let mut left = speed - turn;
    let mut right = speed + turn;
    let max_abs = left.abs().max(right.abs());
    if max_abs > 1.0 {
        let scale = 1.0 / max_abs;
        left *= scale;
        right *= scale;
        debug!("differential output scaled by {scale:.2} to preserve turn ratio");
    }
    DifferentialDriveCommand::new(left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::SimulatedDriver;
    use approx::assert_relative_eq;

    fn nav(speed: f64, turn: f64) -> NavigationCommand {
        NavigationCommand::new(speed, turn)
    }

    fn controller(cfg: MotorControllerConfig) -> (Arc<MotorController>, Arc<SimulatedDriver>) {
        let driver = Arc::new(SimulatedDriver::new());
        let ctrl = Arc::new(MotorController::new(
            Arc::clone(&driver) as Arc<dyn MotorDriver>,
            cfg,
        ));
        (ctrl, driver)
    }

    #[test]
    fn straight_drive_equal_sides() {
        let cmd = navigation_to_differential(&nav(0.8, 0.0), 1.0);
        assert_relative_eq!(cmd.left_speed, cmd.right_speed);
        assert_relative_eq!(cmd.left_speed, 0.8);
    }

    #[test]
    fn spot_rotation_opposite_sides() {
        let cmd = navigation_to_differential(&nav(0.0, 0.5), 1.0);
        assert_relative_eq!(cmd.left_speed, -0.5);
        assert_relative_eq!(cmd.right_speed, 0.5);
        assert_relative_eq!(cmd.left_speed, -cmd.right_speed);
    }

    #[test]
    fn saturated_mix_preserves_ratio() {
        let cmd = navigation_to_differential(&nav(1.0, 0.5), 1.0);
        assert!(cmd.left_speed.abs().max(cmd.right_speed.abs()) <= 1.0 + 1e-9);
        // left = 0.5, right = 1.5 before scaling → ratio 1:3 kept.
        assert_relative_eq!(cmd.right_speed, 1.0);
        assert_relative_eq!(cmd.left_speed, 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn mapping_never_exceeds_unit_range() {
        for speed in [-1.0, -0.5, 0.0, 0.5, 1.0] {
            for turn in [-1.0, -0.3, 0.0, 0.3, 1.0] {
                let cmd = navigation_to_differential(&nav(speed, turn), 1.0);
                assert!(cmd.left_speed.abs() <= 1.0 + 1e-9, "({speed}, {turn})");
                assert!(cmd.right_speed.abs() <= 1.0 + 1e-9, "({speed}, {turn})");
            }
        }
    }

    #[tokio::test]
    async fn ramping_bounds_setpoint_change() {
        let (ctrl, driver) = controller(MotorControllerConfig {
            ramp_rate: 0.3,
            ..Default::default()
        });
        MotorController::start(&ctrl).unwrap();

        // Full-speed request climbs in 0.3 steps.
        let mut previous = 0.0;
        for expected in [0.3, 0.6, 0.9, 1.0] {
            ctrl.execute_differential_command(DifferentialDriveCommand::new(1.0, 1.0))
                .unwrap();
            let status = ctrl.get_status();
            assert!((status.current_left - previous).abs() <= 0.3 + 1e-9);
            assert_relative_eq!(status.current_left, expected, epsilon = 1e-9);
            previous = status.current_left;
        }
        let last = driver.last_for(MotorSide::Left).unwrap();
        assert_eq!(last.direction, MotorDirection::Forward);
        assert_relative_eq!(last.magnitude, 1.0);
        ctrl.stop().await;
    }

    #[tokio::test]
    async fn reversal_ramps_through_zero() {
        let (ctrl, _driver) = controller(MotorControllerConfig {
            ramp_rate: 0.5,
            ..Default::default()
        });
        MotorController::start(&ctrl).unwrap();
        ctrl.execute_differential_command(DifferentialDriveCommand::new(1.0, 1.0))
            .unwrap();
        ctrl.execute_differential_command(DifferentialDriveCommand::new(1.0, 1.0))
            .unwrap();
        assert_relative_eq!(ctrl.get_status().current_left, 1.0);

        ctrl.execute_differential_command(DifferentialDriveCommand::new(-1.0, -1.0))
            .unwrap();
        assert_relative_eq!(ctrl.get_status().current_left, 0.5);
        ctrl.execute_differential_command(DifferentialDriveCommand::new(-1.0, -1.0))
            .unwrap();
        assert_relative_eq!(ctrl.get_status().current_left, 0.0);
        ctrl.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watchdog_stops_idle_motors() {
        let (ctrl, driver) = controller(MotorControllerConfig {
            safety_timeout: Duration::from_millis(150),
            ..Default::default()
        });
        MotorController::start(&ctrl).unwrap();
        ctrl.execute_differential_command(DifferentialDriveCommand::new(0.5, 0.5))
            .unwrap();
        driver.clear();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(driver.stop_all_count() >= 1, "watchdog never fired");
        let status = ctrl.get_status();
        assert_eq!(status.current_left, 0.0);
        assert_eq!(status.current_right, 0.0);
        assert!(status.command.is_none());
        assert!(status.last_fault.unwrap().contains("watchdog"));
        ctrl.stop().await;
    }

    #[tokio::test]
    async fn emergency_stop_zeroes_everything() {
        let (ctrl, driver) = controller(MotorControllerConfig::default());
        MotorController::start(&ctrl).unwrap();
        ctrl.execute_differential_command(DifferentialDriveCommand::new(0.5, -0.5))
            .unwrap();
        ctrl.emergency_stop();

        assert!(driver.stop_all_count() >= 1);
        let status = ctrl.get_status();
        assert_eq!(status.current_left, 0.0);
        assert_eq!(status.current_right, 0.0);
        assert!(status.command.is_none());
        ctrl.stop().await;
    }

    #[tokio::test]
    async fn commands_rejected_when_stopped() {
        let (ctrl, _driver) = controller(MotorControllerConfig::default());
        assert!(ctrl
            .execute_differential_command(DifferentialDriveCommand::stop())
            .is_err());
    }

    #[test]
    fn max_speed_clamped() {
        let (ctrl, _driver) = controller(MotorControllerConfig::default());
        ctrl.set_max_speed(3.0);
        assert_relative_eq!(ctrl.get_status().max_speed, 1.0);
        ctrl.set_max_speed(-1.0);
        assert_relative_eq!(ctrl.get_status().max_speed, 0.0);
    }
}
