//! A controllable valve whose effective discharge coefficient scales
//! linearly with its opening percentage.
//!
//! When an upstream component pushes inflow through the valve, an open
//! valve passes it unchanged and a closed valve blocks it. Without pushed
//! inflow the flow follows the orifice formula against the head
//! difference.

use log::info;

use crate::bus::Message;
use crate::errors::{ComponentError, IdentificationError};
use crate::physics::{
    require_series, scalar_param, Action, IdentificationData, Parameters, ParamValue,
    PhysicalComponent, State, G,
};

pub struct Valve {
    id: String,
    discharge_coefficient: f64,
    diameter: f64,
    opening: f64,
    outflow: f64,
    target_opening: f64,
    physical_inflow: f64,
}

impl Valve {
    pub fn new(id: &str, initial_state: &State, parameters: &Parameters) -> Self {
        let opening = initial_state.get("opening").copied().unwrap_or(100.0);
        Valve {
            id: id.to_string(),
            discharge_coefficient: scalar_param(parameters, "discharge_coefficient").unwrap_or(0.6),
            diameter: scalar_param(parameters, "diameter").unwrap_or(0.5),
            opening,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            target_opening: opening,
            physical_inflow: 0.0,
        }
    }

    fn area(&self) -> f64 {
        std::f64::consts::PI * (self.diameter / 2.0).powi(2)
    }

    fn orifice_flow(&self, upstream: f64, downstream: f64) -> f64 {
        let head = upstream - downstream;
        if head <= 0.0 {
            return 0.0;
        }
        let effective_cd = self.discharge_coefficient * (self.opening / 100.0);
        effective_cd * self.area() * (2.0 * G * head).sqrt()
    }
}

impl PhysicalComponent for Valve {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, _dt: f64) -> State {
        if let Some(signal) = action.control_signal {
            self.target_opening = signal.clamp(0.0, 100.0);
        }
        // The valve positions instantly; there is no actuator lag here.
        self.opening = self.target_opening;

        self.outflow = if self.physical_inflow > 0.0 {
            if self.opening > 0.0 {
                self.physical_inflow
            } else {
                0.0
            }
        } else {
            self.orifice_flow(
                action.upstream_head.unwrap_or(0.0),
                action.downstream_head.unwrap_or(0.0),
            )
        };
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
            self.opening = opening.clamp(0.0, 100.0);
            self.target_opening = self.opening;
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
            ("diameter".to_string(), ParamValue::Scalar(self.diameter)),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(c) = scalar_param(params, "discharge_coefficient") {
            self.discharge_coefficient = c;
        }
        if let Some(d) = scalar_param(params, "diameter") {
            self.diameter = d;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    fn handle_message(&mut self, message: &Message) {
        if let Some(target) = message.scalar("control_signal") {
            self.target_opening = target.clamp(0.0, 100.0);
        }
    }

    /// Direct algebraic estimate of the discharge coefficient: every
    /// sample with positive head and opening yields one coefficient, and
    /// the result is their mean.
    fn identify_parameters(
        &self,
        data: &IdentificationData,
    ) -> Result<Parameters, IdentificationError> {
        let openings = require_series(data, "openings")?;
        let up = require_series(data, "upstream_levels")?;
        let down = require_series(data, "downstream_levels")?;
        let observed = require_series(data, "observed_flows")?;

        let samples = openings.len().min(up.len()).min(down.len()).min(observed.len());
        let area = self.area();

        let mut estimates = Vec::new();
        for i in 0..samples {
            let head = up[i] - down[i];
            if head <= 0.0 || openings[i] <= 0.0 {
                continue;
            }
            let denominator = (openings[i] / 100.0) * area * (2.0 * G * head).sqrt();
            if denominator > 1e-6 {
                estimates.push(observed[i] / denominator);
            }
        }

        if estimates.is_empty() {
            return Err(IdentificationError::InsufficientData {
                have: 0,
                need: 1,
            });
        }

        let mean = estimates.iter().sum::<f64>() / estimates.len() as f64;
        info!(
            "valve '{}' identification complete, new discharge_coefficient = {:.4}",
            self.id, mean
        );
        Ok(Parameters::from([(
            "discharge_coefficient".to_string(),
            ParamValue::Scalar(mean),
        )]))
    }
}
