//! A controllable orifice gate with rate-limited opening dynamics.
//!
//! Outflow follows `Q = C * (opening * width) * sqrt(2 g dH)` against the
//! head difference supplied by the harness. The gate accepts either a
//! direct opening command or a `gate_target_outflow` command, which it
//! inverts through the orifice formula against the last observed head.
//!
//! State: `opening` (m), `outflow` (m^3/s). Parameters:
//! `discharge_coefficient`, `width`, `max_opening`, `max_rate_of_change`.

use log::{info, warn};

use crate::bus::Message;
use crate::errors::{ComponentError, IdentificationError};
use crate::numerics::{minimize, Method};
use crate::physics::{
    require_series, scalar_param, Action, IdentificationData, Parameters, ParamValue,
    PhysicalComponent, State, G,
};

pub struct Gate {
    id: String,
    discharge_coefficient: f64,
    width: f64,
    max_opening: f64,
    max_rate_of_change: f64,
    opening: f64,
    outflow: f64,
    target_opening: f64,
    physical_inflow: f64,
    // Last seen head difference, kept for inverting target-outflow commands.
    last_head_diff: f64,
}

impl Gate {
    pub fn new(id: &str, initial_state: &State, parameters: &Parameters) -> Self {
        let opening = initial_state.get("opening").copied().unwrap_or(0.0);
        Gate {
            id: id.to_string(),
            discharge_coefficient: scalar_param(parameters, "discharge_coefficient").unwrap_or(0.6),
            width: scalar_param(parameters, "width").unwrap_or(2.0),
            max_opening: scalar_param(parameters, "max_opening").unwrap_or(1.0),
            max_rate_of_change: scalar_param(parameters, "max_rate_of_change").unwrap_or(0.05),
            opening,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            target_opening: opening,
            physical_inflow: 0.0,
            last_head_diff: 1.0,
        }
    }

    fn outflow_for(&self, upstream: f64, opening: f64, downstream: f64, c: f64) -> f64 {
        let head = upstream - downstream;
        if head <= 0.0 {
            return 0.0;
        }
        let area = opening * self.width;
        c * area * (2.0 * G * head).sqrt()
    }

    /// Inverse of the orifice formula: the opening needed to pass
    /// `target_flow` under the last observed head difference.
    fn opening_for_flow(&self, target_flow: f64) -> f64 {
        if self.last_head_diff <= 0.0 {
            return 0.0;
        }
        let denominator =
            self.discharge_coefficient * self.width * (2.0 * G * self.last_head_diff).sqrt();
        if denominator == 0.0 {
            return self.max_opening;
        }
        target_flow / denominator
    }
}

impl PhysicalComponent for Gate {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, dt: f64) -> State {
        if let Some(signal) = action.control_signal {
            self.target_opening = signal;
        }

        // Move toward the target at the bounded rate, then clamp.
        let max_delta = self.max_rate_of_change * dt;
        let new_opening = if self.target_opening > self.opening {
            (self.opening + max_delta).min(self.target_opening)
        } else {
            (self.opening - max_delta).max(self.target_opening)
        };
        self.opening = new_opening.clamp(0.0, self.max_opening);

        let upstream = action.upstream_head.unwrap_or(0.0);
        let downstream = action.downstream_head.unwrap_or(0.0);
        self.last_head_diff = upstream - downstream;
        self.outflow = self.outflow_for(
            upstream,
            self.opening,
            downstream,
            self.discharge_coefficient,
        );
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("opening".to_string(), self.opening),
            ("outflow".to_string(), self.outflow),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(opening) = state.get("opening") {
            self.opening = opening.clamp(0.0, self.max_opening);
        }
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            (
                "discharge_coefficient".to_string(),
                ParamValue::Scalar(self.discharge_coefficient),
            ),
            ("width".to_string(), ParamValue::Scalar(self.width)),
            ("max_opening".to_string(), ParamValue::Scalar(self.max_opening)),
            (
                "max_rate_of_change".to_string(),
                ParamValue::Scalar(self.max_rate_of_change),
            ),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(c) = scalar_param(params, "discharge_coefficient") {
            if c <= 0.0 {
                return Err(ComponentError::InvalidParameter(
                    "discharge_coefficient must be positive".to_string(),
                ));
            }
            self.discharge_coefficient = c;
        }
        if let Some(width) = scalar_param(params, "width") {
            self.width = width;
        }
        if let Some(max_opening) = scalar_param(params, "max_opening") {
            self.max_opening = max_opening;
        }
        if let Some(rate) = scalar_param(params, "max_rate_of_change") {
            self.max_rate_of_change = rate;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    fn handle_message(&mut self, message: &Message) {
        if let Some(target) = message
            .scalar("control_signal")
            .or_else(|| message.scalar("opening"))
        {
            self.target_opening = target;
        } else if let Some(target_flow) = message.scalar("gate_target_outflow") {
            self.target_opening = self.opening_for_flow(target_flow);
        }
    }

    /// Re-estimates the discharge coefficient from observed heads,
    /// openings and flows via a simplex search over `C in [0.1, 1.0]`.
    fn identify_parameters(
        &self,
        data: &IdentificationData,
    ) -> Result<Parameters, IdentificationError> {
        let up = require_series(data, "upstream_levels")?;
        let down = require_series(data, "downstream_levels")?;
        let openings = require_series(data, "openings")?;
        let observed = require_series(data, "observed_flows")?;

        let samples = up.len().min(down.len()).min(openings.len()).min(observed.len());
        if samples == 0 {
            return Err(IdentificationError::InsufficientData { have: 0, need: 1 });
        }

        let objective = |c: &[f64]| -> f64 {
            let mut sum_sq = 0.0;
            for i in 0..samples {
                let simulated = self.outflow_for(up[i], openings[i], down[i], c[0]);
                sum_sq += (simulated - observed[i]).powi(2);
            }
            (sum_sq / samples as f64).sqrt()
        };

        let result = minimize(
            objective,
            &[self.discharge_coefficient],
            Some(&[(0.1, 1.0)]),
            Method::NelderMead,
        );

        if result.converged {
            info!(
                "gate '{}' identification succeeded, new C = {:.4}",
                self.id, result.x[0]
            );
            Ok(Parameters::from([(
                "discharge_coefficient".to_string(),
                ParamValue::Scalar(result.x[0]),
            )]))
        } else {
            warn!("gate '{}' identification failed: {}", self.id, result.message);
            Err(IdentificationError::NotConverged(result.message))
        }
    }
}
