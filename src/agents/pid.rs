//! The PID controller used by local control loops.

use log::debug;

use crate::agents::control::{ControlOutput, Controller};
use crate::physics::State;

/// A time-aware PID with derivative-on-error and clamped output.
///
/// Anti-windup is conditional integration: when the unclamped output would
/// leave the `[min_output, max_output]` band, the integral stops
/// accumulating for that step. `set_setpoint` resets the integral and the
/// previous error so that setpoint moves do not bump the actuator.
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    min_output: f64,
    max_output: f64,
    integral: f64,
    previous_error: Option<f64>,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, setpoint: f64, min_output: f64, max_output: f64) -> Self {
        PidController {
            kp,
            ki,
            kd,
            setpoint,
            min_output,
            max_output,
            integral: 0.0,
            previous_error: None,
        }
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Computes one control step from the `process_variable` observation.
    pub fn compute(&mut self, observation: &State, dt: f64) -> f64 {
        let process_variable = observation.get("process_variable").copied().unwrap_or(0.0);
        let error = self.setpoint - process_variable;

        let derivative = match self.previous_error {
            Some(previous) if dt > 0.0 => (error - previous) / dt,
            _ => 0.0,
        };

        let candidate_integral = self.integral + error * dt;
        let unclamped =
            self.kp * error + self.ki * candidate_integral + self.kd * derivative;

        let output = if unclamped > self.max_output {
            self.max_output
        } else if unclamped < self.min_output {
            self.min_output
        } else {
            // Only integrate while the actuator is not saturated.
            self.integral = candidate_integral;
            unclamped
        };

        self.previous_error = Some(error);
        output
    }
}

impl Controller for PidController {
    fn compute_control_action(&mut self, observation: &State, dt: f64) -> ControlOutput {
        ControlOutput::Signal(self.compute(observation, dt))
    }

    fn set_setpoint(&mut self, new_setpoint: f64) {
        debug!("pid setpoint updated from {} to {new_setpoint}", self.setpoint);
        self.setpoint = new_setpoint;
        self.integral = 0.0;
        self.previous_error = None;
    }
}
