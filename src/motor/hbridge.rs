//! H-bridge motor drivers.
//!
//! [`HBridgeDriver`] talks to an L298N-style dual H-bridge through the sysfs
//! GPIO and PWM interfaces: two direction lines per side plus a PWM enable
//! whose duty cycle carries the magnitude.  [`SimulatedDriver`] records every
//! call for tests and for bench-running without hardware.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};

use super::{MotorDirection, MotorDriver, MotorSide};
use crate::error::{Result, RoverError};

/// PWM period: 1 kHz, the L298N's comfortable switching range.
const PWM_PERIOD_NS: u64 = 1_000_000;

/// GPIO line numbers and PWM channel for one side of the bridge.
#[derive(Debug, Clone)]
pub struct HBridgePins {
    pub in1:      u32,
    pub in2:      u32,
    /// PWM channel index on `pwmchip0`.
    pub pwm_chan: u32,
}

/// L298N dual H-bridge on sysfs GPIO + PWM.
pub struct HBridgeDriver {
    left:        HBridgePins,
    right:       HBridgePins,
    gpio_root:   PathBuf,
    pwm_root:    PathBuf,
    initialized: AtomicBool,
}

impl HBridgeDriver {
    pub fn new(left: HBridgePins, right: HBridgePins) -> Self {
        HBridgeDriver {
            left,
            right,
            gpio_root:   PathBuf::from("/sys/class/gpio"),
            pwm_root:    PathBuf::from("/sys/class/pwm/pwmchip0"),
            initialized: AtomicBool::new(false),
        }
    }

    fn pins(&self, side: MotorSide) -> &HBridgePins {
        match side {
            MotorSide::Left => &self.left,
            MotorSide::Right => &self.right,
        }
    }

    fn export_gpio(&self, line: u32) -> Result<()> {
        let pin_dir = self.gpio_root.join(format!("gpio{line}"));
        if !pin_dir.exists() {
            write_sysfs(&self.gpio_root.join("export"), &line.to_string())?;
        }
        write_sysfs(&pin_dir.join("direction"), "out")?;
        write_sysfs(&pin_dir.join("value"), "0")?;
        Ok(())
    }

    fn set_gpio(&self, line: u32, high: bool) -> Result<()> {
        let path = self.gpio_root.join(format!("gpio{line}/value"));
        write_sysfs(&path, if high { "1" } else { "0" })
    }

    fn export_pwm(&self, chan: u32) -> Result<()> {
        let chan_dir = self.pwm_root.join(format!("pwm{chan}"));
        if !chan_dir.exists() {
            write_sysfs(&self.pwm_root.join("export"), &chan.to_string())?;
        }
        write_sysfs(&chan_dir.join("period"), &PWM_PERIOD_NS.to_string())?;
        write_sysfs(&chan_dir.join("duty_cycle"), "0")?;
        write_sysfs(&chan_dir.join("enable"), "1")?;
        Ok(())
    }

    fn set_duty(&self, chan: u32, fraction: f64) -> Result<()> {
        let duty = (PWM_PERIOD_NS as f64 * fraction.max(0.0).min(1.0)) as u64;
        let path = self.pwm_root.join(format!("pwm{chan}/duty_cycle"));
        write_sysfs(&path, &duty.to_string())
    }
}

impl MotorDriver for HBridgeDriver {
    fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        for side in [MotorSide::Left, MotorSide::Right] {
            let pins = self.pins(side);
            self.export_gpio(pins.in1)?;
            self.export_gpio(pins.in2)?;
            self.export_pwm(pins.pwm_chan)?;
            info!(
                "H-bridge {side:?} ready: in1=gpio{} in2=gpio{} pwm{}",
                pins.in1, pins.in2, pins.pwm_chan
            );
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_motor(&self, side: MotorSide, direction: MotorDirection, magnitude: f64) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(RoverError::MotorDriver("driver not initialized".into()));
        }
        let pins = self.pins(side);
        let duty = match direction {
            MotorDirection::Forward => {
                self.set_gpio(pins.in1, true)?;
                self.set_gpio(pins.in2, false)?;
                magnitude
            }
            MotorDirection::Backward => {
                self.set_gpio(pins.in1, false)?;
                self.set_gpio(pins.in2, true)?;
                magnitude
            }
            MotorDirection::Stop => {
                self.set_gpio(pins.in1, false)?;
                self.set_gpio(pins.in2, false)?;
                0.0
            }
        };
        self.set_duty(pins.pwm_chan, duty)?;
        debug!("motor {side:?}: {direction:?} at {:.0}%", duty * 100.0);
        Ok(())
    }

    fn stop_all(&self) -> Result<()> {
        for side in [MotorSide::Left, MotorSide::Right] {
            self.set_motor(side, MotorDirection::Stop, 0.0)?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        for side in [MotorSide::Left, MotorSide::Right] {
            let pins = self.pins(side);
            let _ = write_sysfs(
                &self.pwm_root.join(format!("pwm{}/duty_cycle", pins.pwm_chan)),
                "0",
            );
            let _ = write_sysfs(
                &self.pwm_root.join(format!("pwm{}/enable", pins.pwm_chan)),
                "0",
            );
            for line in [pins.in1, pins.in2] {
                let _ = write_sysfs(&self.gpio_root.join(format!("gpio{line}/value")), "0");
            }
        }
        info!("H-bridge driver cleaned up");
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

/// Record a simulated call, keeping the log bounded for long bench runs.
fn record(calls: &Mutex<Vec<SimulatedCall>>, call: SimulatedCall) {
    let mut calls = calls.lock().unwrap();
    calls.push(call);
    if calls.len() > 256 {
        let excess = calls.len() - 256;
        calls.drain(..excess);
    }
}

fn write_sysfs(path: &Path, value: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new().write(true).open(path).map_err(|e| {
        RoverError::MotorDriver(format!("open {}: {e}", path.display()))
    })?;
    f.write_all(value.as_bytes())
        .map_err(|e| RoverError::MotorDriver(format!("write {}: {e}", path.display())))?;
    Ok(())
}

// ── Simulation ────────────────────────────────────────────────────────────────

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(not(test), allow(dead_code))]
pub struct SimulatedCall {
    pub side:      MotorSide,
    pub direction: MotorDirection,
    pub magnitude: f64,
}

/// Hardware-free driver: records calls instead of toggling pins.
#[derive(Default)]
pub struct SimulatedDriver {
    initialized: AtomicBool,
    calls:       Mutex<Vec<SimulatedCall>>,
    stop_alls:   Mutex<u64>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.calls.lock().unwrap().clone()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn stop_all_count(&self) -> u64 {
        *self.stop_alls.lock().unwrap()
    }

    /// Last recorded (direction, magnitude) for a side.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn last_for(&self, side: MotorSide) -> Option<SimulatedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.side == side)
            .cloned()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
        *self.stop_alls.lock().unwrap() = 0;
    }
}

impl MotorDriver for SimulatedDriver {
    fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        debug!("simulated motor driver initialized");
        Ok(())
    }

    fn set_motor(&self, side: MotorSide, direction: MotorDirection, magnitude: f64) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            warn!("simulated driver call before initialize");
            return Err(RoverError::MotorDriver("driver not initialized".into()));
        }
        record(
            &self.calls,
            SimulatedCall {
                side,
                direction,
                magnitude: magnitude.max(0.0).min(1.0),
            },
        );
        Ok(())
    }

    fn stop_all(&self) -> Result<()> {
        *self.stop_alls.lock().unwrap() += 1;
        for side in [MotorSide::Left, MotorSide::Right] {
            record(
                &self.calls,
                SimulatedCall {
                    side,
                    direction: MotorDirection::Stop,
                    magnitude: 0.0,
                },
            );
        }
        Ok(())
    }

    fn cleanup(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_driver_records_calls() {
        let driver = SimulatedDriver::new();
        driver.initialize().unwrap();
        driver
            .set_motor(MotorSide::Left, MotorDirection::Forward, 0.7)
            .unwrap();
        driver
            .set_motor(MotorSide::Right, MotorDirection::Backward, 0.3)
            .unwrap();
        driver.stop_all().unwrap();

        let left = driver.last_for(MotorSide::Left).unwrap();
        assert_eq!(left.direction, MotorDirection::Stop);
        assert_eq!(driver.stop_all_count(), 1);
        assert_eq!(driver.calls().len(), 4);
    }

    #[test]
    fn uninitialized_driver_rejects_commands() {
        let driver = SimulatedDriver::new();
        assert!(driver
            .set_motor(MotorSide::Left, MotorDirection::Forward, 1.0)
            .is_err());
    }
}
