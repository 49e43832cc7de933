//! Differential-drive motor control: the driver capability, the H-bridge
//! implementation and the ramping/watchdog controller.

pub mod controller;
pub mod hbridge;

use serde::Serialize;

use crate::error::Result;

pub use controller::{MotorController, MotorControllerConfig, MotorStatus};
pub use hbridge::{HBridgeDriver, HBridgePins, SimulatedDriver};

/// Which motor a driver call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorSide {
    Left,
    Right,
}

/// Rotation direction for one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorDirection {
    Forward,
    Backward,
    Stop,
}

/// Per-side normalised speeds, clamped to [-1, 1] on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DifferentialDriveCommand {
    pub left_speed:  f64,
    pub right_speed: f64,
}

impl DifferentialDriveCommand {
    pub fn new(left_speed: f64, right_speed: f64) -> Self {
        DifferentialDriveCommand {
            left_speed:  left_speed.max(-1.0).min(1.0),
            right_speed: right_speed.max(-1.0).min(1.0),
        }
    }

    pub fn stop() -> Self {
        DifferentialDriveCommand { left_speed: 0.0, right_speed: 0.0 }
    }
}

/// Capability implemented by anything that can spin the wheels: the real
/// H-bridge on GPIO/PWM, or the simulation used in tests.
pub trait MotorDriver: Send + Sync {
    fn initialize(&self) -> Result<()>;

    /// Drive one side.  `magnitude` is [0, 1]; direction carries the sign.
    fn set_motor(&self, side: MotorSide, direction: MotorDirection, magnitude: f64) -> Result<()>;

    /// Immediately stop both motors.
    fn stop_all(&self) -> Result<()>;

    fn cleanup(&self);

    fn is_initialized(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differential_command_clamped() {
        let cmd = DifferentialDriveCommand::new(1.4, -2.0);
        assert_eq!(cmd.left_speed, 1.0);
        assert_eq!(cmd.right_speed, -1.0);
    }
}
