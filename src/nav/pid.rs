//! PID controller for heading hold.
//!
//! The drive phase currently applies only a proportional correction with a
//! small gain; the full controller stays wired in for when field data
//! justifies the integral and derivative terms.

use std::time::Instant;

#[derive(Debug)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    output_limits: (f64, f64),

    integral:   f64,
    last_error: f64,
    last_time:  Option<Instant>,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, output_limits: (f64, f64)) -> Self {
        Pid {
            kp,
            ki,
            kd,
            output_limits,
            integral: 0.0,
            last_error: 0.0,
            last_time: None,
        }
    }

    /// Advance the controller with a new error sample.
    /// `dt` overrides the internally measured step (used by tests).
    pub fn update(&mut self, error: f64, dt: Option<f64>) -> f64 {
        let now = Instant::now();
        let dt = dt.unwrap_or_else(|| {
            self.last_time
                .map(|t| now.duration_since(t).as_secs_f64())
                .unwrap_or(0.0)
        });
        self.last_time = Some(now);

        if dt <= 0.0 {
            return 0.0;
        }

        let p_term = self.kp * error;

        self.integral += error * dt;
        let i_term = self.ki * self.integral;

        let derivative = (error - self.last_error) / dt;
        let d_term = self.kd * derivative;

        self.last_error = error;

        let (lo, hi) = self.output_limits;
        (p_term + i_term + d_term).max(lo).min(hi)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn proportional_only_response() {
        let mut pid = Pid::new(0.5, 0.0, 0.0, (-1.0, 1.0));
        assert_relative_eq!(pid.update(1.0, Some(0.1)), 0.5);
        assert_relative_eq!(pid.update(-1.0, Some(0.1)), -0.5);
    }

    #[test]
    fn output_clamped() {
        let mut pid = Pid::new(10.0, 0.0, 0.0, (-0.6, 0.6));
        assert_relative_eq!(pid.update(5.0, Some(0.1)), 0.6);
        assert_relative_eq!(pid.update(-5.0, Some(0.1)), -0.6);
    }

    #[test]
    fn integral_accumulates() {
        let mut pid = Pid::new(0.0, 1.0, 0.0, (-10.0, 10.0));
        pid.update(1.0, Some(1.0));
        let out = pid.update(1.0, Some(1.0));
        assert_relative_eq!(out, 2.0);
        pid.reset();
        assert_relative_eq!(pid.update(1.0, Some(1.0)), 1.0);
    }

    #[test]
    fn zero_dt_is_inert() {
        let mut pid = Pid::new(1.0, 1.0, 1.0, (-1.0, 1.0));
        assert_relative_eq!(pid.update(1.0, Some(0.0)), 0.0);
    }
}
