//! Rover configuration file parser.
//!
//! Flat `key = value` format, same shape as the rest of the fleet tooling:
//! `#` comments, unknown keys ignored, compiled-in defaults for everything
//! so a minimal file only names the serial port and caster credentials.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RoverError};
use crate::motor::MotorControllerConfig;
use crate::nav::NavigatorConfig;
use crate::ntrip::NtripConfig;

const NTRIP_PORT: u16 = 2101;

/// Full rover configuration.
#[derive(Debug, Clone)]
pub struct RoverSettings {
    // ── GNSS serial link ──────────────────────────────────────────────────────
    /// Serial device of the RTK receiver.
    pub serial_port: String,
    // ── NTRIP corrections (all empty ⇒ GPS-only mode) ─────────────────────────
    pub ntrip_host:       String,
    pub ntrip_port:       u16,
    pub ntrip_mountpoint: String,
    pub ntrip_username:   String,
    pub ntrip_password:   String,
    pub ntrip_tls:        bool,
    // ── Motors ────────────────────────────────────────────────────────────────
    pub motor_max_speed:        f64,
    pub motor_turn_sensitivity: f64,
    pub motor_safety_timeout:   f64,
    pub motor_ramp_rate:        f64,
    /// Use the sysfs H-bridge driver; false selects the simulation driver.
    pub motor_use_gpio:         bool,
    pub motor_left_in1:  u32,
    pub motor_left_in2:  u32,
    pub motor_left_pwm:  u32,
    pub motor_right_in1: u32,
    pub motor_right_in2: u32,
    pub motor_right_pwm: u32,
    // ── Navigation ────────────────────────────────────────────────────────────
    pub nav_max_speed:             f64,
    pub nav_waypoint_tolerance:    f64,
    pub nav_align_tolerance:       f64,
    pub nav_realign_threshold:     f64,
    pub nav_align_speed:           f64,
    pub nav_align_timeout:         f64,
    pub nav_drive_correction_gain: f64,
    pub nav_calibration_speed:     f64,
    pub nav_calibration_duration:  f64,
    pub nav_min_speed_for_heading: f64,
    /// Control loop period in seconds.
    pub nav_update_rate:           f64,
    // ── Heading PID ───────────────────────────────────────────────────────────
    pub pid_heading_kp: f64,
    pub pid_heading_ki: f64,
    pub pid_heading_kd: f64,
    // ── Process ───────────────────────────────────────────────────────────────
    pub log_syslog: bool,
}

impl Default for RoverSettings {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyS0".to_string(),
            ntrip_host:       String::new(),
            ntrip_port:       NTRIP_PORT,
            ntrip_mountpoint: "NEAR".to_string(),
            ntrip_username:   String::new(),
            ntrip_password:   String::new(),
            ntrip_tls:        false,
            motor_max_speed:        1.0,
            motor_turn_sensitivity: 1.0,
            motor_safety_timeout:   2.0,
            motor_ramp_rate:        0.5,
            motor_use_gpio:         true,
            motor_left_in1:  17,
            motor_left_in2:  22,
            motor_left_pwm:  0,
            motor_right_in1: 23,
            motor_right_in2: 24,
            motor_right_pwm: 1,
            nav_max_speed:             1.0,
            nav_waypoint_tolerance:    2.0,
            nav_align_tolerance:       15.0,
            nav_realign_threshold:     30.0,
            nav_align_speed:           0.6,
            nav_align_timeout:         10.0,
            nav_drive_correction_gain: 0.02,
            nav_calibration_speed:     0.5,
            nav_calibration_duration:  5.0,
            nav_min_speed_for_heading: 0.5,
            nav_update_rate:           1.0,
            pid_heading_kp: 0.012,
            pid_heading_ki: 0.0005,
            pid_heading_kd: 0.008,
            log_syslog: false,
        }
    }
}

/// Parse `path` as a rover configuration file.
pub fn load_config(path: &Path) -> Result<RoverSettings> {
    let content = fs::read_to_string(path)
        .map_err(|e| RoverError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

fn parse_config(content: &str) -> RoverSettings {
    let mut cfg = RoverSettings::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "serial_port"      => cfg.serial_port = val,
            "ntrip_host"       => cfg.ntrip_host = val,
            "ntrip_port"       => cfg.ntrip_port = val.parse().unwrap_or(NTRIP_PORT),
            "ntrip_mountpoint" => cfg.ntrip_mountpoint = val,
            "ntrip_username"   => cfg.ntrip_username = val,
            "ntrip_password"   => cfg.ntrip_password = val,
            "ntrip_tls"        => cfg.ntrip_tls = parse_bool(&val),
            "motor_max_speed"        => parse_f64(&val, &mut cfg.motor_max_speed),
            "motor_turn_sensitivity" => parse_f64(&val, &mut cfg.motor_turn_sensitivity),
            "motor_safety_timeout"   => parse_f64(&val, &mut cfg.motor_safety_timeout),
            "motor_ramp_rate"        => parse_f64(&val, &mut cfg.motor_ramp_rate),
            "motor_use_gpio"         => cfg.motor_use_gpio = parse_bool(&val),
            "motor_left_in1"  => parse_u32(&val, &mut cfg.motor_left_in1),
            "motor_left_in2"  => parse_u32(&val, &mut cfg.motor_left_in2),
            "motor_left_pwm"  => parse_u32(&val, &mut cfg.motor_left_pwm),
            "motor_right_in1" => parse_u32(&val, &mut cfg.motor_right_in1),
            "motor_right_in2" => parse_u32(&val, &mut cfg.motor_right_in2),
            "motor_right_pwm" => parse_u32(&val, &mut cfg.motor_right_pwm),
            "nav_max_speed"             => parse_f64(&val, &mut cfg.nav_max_speed),
            "nav_waypoint_tolerance"    => parse_f64(&val, &mut cfg.nav_waypoint_tolerance),
            "nav_align_tolerance"       => parse_f64(&val, &mut cfg.nav_align_tolerance),
            "nav_realign_threshold"     => parse_f64(&val, &mut cfg.nav_realign_threshold),
            "nav_align_speed"           => parse_f64(&val, &mut cfg.nav_align_speed),
            "nav_align_timeout"         => parse_f64(&val, &mut cfg.nav_align_timeout),
            "nav_drive_correction_gain" => parse_f64(&val, &mut cfg.nav_drive_correction_gain),
            "nav_calibration_speed"     => parse_f64(&val, &mut cfg.nav_calibration_speed),
            "nav_calibration_duration"  => parse_f64(&val, &mut cfg.nav_calibration_duration),
            "nav_min_speed_for_heading" => parse_f64(&val, &mut cfg.nav_min_speed_for_heading),
            "nav_update_rate"           => parse_f64(&val, &mut cfg.nav_update_rate),
            "pid_heading_kp" => parse_f64(&val, &mut cfg.pid_heading_kp),
            "pid_heading_ki" => parse_f64(&val, &mut cfg.pid_heading_ki),
            "pid_heading_kd" => parse_f64(&val, &mut cfg.pid_heading_kd),
            "log_syslog" => cfg.log_syslog = parse_bool(&val),
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

fn parse_bool(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_f64(val: &str, slot: &mut f64) {
    if let Ok(v) = val.parse() {
        *slot = v;
    }
}

fn parse_u32(val: &str, slot: &mut u32) {
    if let Ok(v) = val.parse() {
        *slot = v;
    }
}

/// Validate ranges that would otherwise fail in confusing places at runtime.
pub fn validate_config(cfg: &RoverSettings) -> Result<()> {
    if cfg.serial_port.is_empty() {
        return Err(RoverError::Config("serial_port is required".into()));
    }
    if cfg.ntrip_port == 0 {
        return Err(RoverError::Config("ntrip_port must be non-zero".into()));
    }
    if !cfg.ntrip_host.is_empty()
        && (cfg.ntrip_username.is_empty() || cfg.ntrip_password.is_empty())
    {
        return Err(RoverError::Config(
            "ntrip_host set but ntrip_username/ntrip_password missing".into(),
        ));
    }
    for (name, value) in [
        ("motor_max_speed", cfg.motor_max_speed),
        ("motor_ramp_rate", cfg.motor_ramp_rate),
        ("nav_max_speed", cfg.nav_max_speed),
        ("nav_align_speed", cfg.nav_align_speed),
        ("nav_calibration_speed", cfg.nav_calibration_speed),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(RoverError::Config(format!(
                "{name} must be within [0, 1], got {value}"
            )));
        }
    }
    if cfg.nav_update_rate <= 0.0 || cfg.nav_update_rate > 10.0 {
        return Err(RoverError::Config(format!(
            "nav_update_rate must be within (0, 10] seconds, got {}",
            cfg.nav_update_rate
        )));
    }
    if cfg.motor_safety_timeout <= 0.0 {
        return Err(RoverError::Config("motor_safety_timeout must be positive".into()));
    }
    Ok(())
}

impl RoverSettings {
    /// NTRIP configuration, or `None` when unconfigured (GPS-only mode).
    pub fn ntrip(&self) -> Option<NtripConfig> {
        if self.ntrip_host.is_empty() || self.ntrip_username.is_empty() {
            return None;
        }
        Some(NtripConfig {
            host:       self.ntrip_host.clone(),
            port:       self.ntrip_port,
            mountpoint: self.ntrip_mountpoint.clone(),
            username:   self.ntrip_username.clone(),
            password:   self.ntrip_password.clone(),
            tls:        self.ntrip_tls,
        })
    }

    pub fn motor(&self) -> MotorControllerConfig {
        MotorControllerConfig {
            max_speed:        self.motor_max_speed,
            turn_sensitivity: self.motor_turn_sensitivity,
            safety_timeout:   Duration::from_secs_f64(self.motor_safety_timeout),
            ramp_rate:        self.motor_ramp_rate,
        }
    }

    pub fn navigator(&self) -> NavigatorConfig {
        NavigatorConfig {
            max_speed:             self.nav_max_speed,
            waypoint_tolerance:    self.nav_waypoint_tolerance,
            align_tolerance:       self.nav_align_tolerance,
            realign_threshold:     self.nav_realign_threshold,
            align_speed:           self.nav_align_speed,
            align_timeout:         Duration::from_secs_f64(self.nav_align_timeout),
            drive_correction_gain: self.nav_drive_correction_gain,
            calibration_speed:     self.nav_calibration_speed,
            calibration_duration:  Duration::from_secs_f64(self.nav_calibration_duration),
            min_speed_for_heading: self.nav_min_speed_for_heading,
            pid_kp: self.pid_heading_kp,
            pid_ki: self.pid_heading_ki,
            pid_kd: self.pid_heading_kd,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.nav_update_rate)
    }
}
