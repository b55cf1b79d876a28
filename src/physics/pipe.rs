//! A pressurized pipe between two points.
//!
//! Flow is computed from the head difference with either the
//! Darcy-Weisbach or the Manning formula (`calculation_method` parameter).
//! When the action carries an `outflow` instead, the pipe runs flow-driven
//! and reports the head loss consistent with that flow.

use std::f64::consts::PI;

use log::{info, warn};

use crate::errors::{ComponentError, IdentificationError};
use crate::numerics::{minimize, Method};
use crate::physics::{
    require_series, scalar_param, text_param, Action, IdentificationData, Parameters,
    ParamValue, PhysicalComponent, State, G,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrictionMethod {
    DarcyWeisbach,
    Manning,
}

pub struct Pipe {
    id: String,
    method: FrictionMethod,
    friction_factor: f64,
    manning_n: f64,
    length: f64,
    diameter: f64,
    outflow: f64,
    head_loss: f64,
    physical_inflow: f64,
}

impl Pipe {
    pub fn new(
        id: &str,
        initial_state: &State,
        parameters: &Parameters,
    ) -> Result<Self, ComponentError> {
        let method = match text_param(parameters, "calculation_method").unwrap_or("darcy_weisbach")
        {
            "darcy_weisbach" => FrictionMethod::DarcyWeisbach,
            "manning" => FrictionMethod::Manning,
            other => {
                return Err(ComponentError::InvalidParameter(format!(
                    "unknown calculation method '{other}'"
                )))
            }
        };

        Ok(Pipe {
            id: id.to_string(),
            method,
            friction_factor: scalar_param(parameters, "friction_factor").unwrap_or(0.02),
            manning_n: scalar_param(parameters, "manning_n").unwrap_or(0.013),
            length: scalar_param(parameters, "length").unwrap_or(100.0),
            diameter: scalar_param(parameters, "diameter").unwrap_or(0.5),
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            head_loss: initial_state.get("head_loss").copied().unwrap_or(0.0),
            physical_inflow: 0.0,
        })
    }

    fn area(&self) -> f64 {
        PI / 4.0 * self.diameter.powi(2)
    }

    fn flow_darcy_weisbach(&self, head_difference: f64, f: f64) -> f64 {
        if head_difference <= 0.0 || f * self.length == 0.0 {
            return 0.0;
        }
        // Q = A * sqrt(2 g h D / (f L))
        self.area() * (2.0 * G * head_difference * self.diameter / (f * self.length)).sqrt()
    }

    fn flow_manning(&self, head_difference: f64, n: f64) -> f64 {
        if head_difference <= 0.0 {
            return 0.0;
        }
        if n == 0.0 || self.length == 0.0 {
            return f64::INFINITY;
        }
        // Full circular pipe: hydraulic radius D/4, slope h/L.
        let hydraulic_radius = self.diameter / 4.0;
        let slope = head_difference / self.length;
        (1.0 / n) * self.area() * hydraulic_radius.powf(2.0 / 3.0) * slope.sqrt()
    }

    fn flow_for(&self, head_difference: f64, coefficient: f64) -> f64 {
        match self.method {
            FrictionMethod::DarcyWeisbach => self.flow_darcy_weisbach(head_difference, coefficient),
            FrictionMethod::Manning => self.flow_manning(head_difference, coefficient),
        }
    }

    fn head_loss_for_flow(&self, flow: f64) -> f64 {
        if flow <= 0.0 {
            return 0.0;
        }
        match self.method {
            FrictionMethod::DarcyWeisbach => {
                let area = self.area();
                if self.diameter == 0.0 || area == 0.0 {
                    return f64::INFINITY;
                }
                self.friction_factor * (self.length / self.diameter) * flow.powi(2)
                    / (2.0 * G * area.powi(2))
            }
            FrictionMethod::Manning => {
                // Rearranged Manning formula: h = L * (Q n / (A R^(2/3)))^2.
                let area = self.area();
                let hydraulic_radius = self.diameter / 4.0;
                if area <= 0.0 || hydraulic_radius <= 0.0 {
                    return 0.0;
                }
                self.length
                    * (flow * self.manning_n / (area * hydraulic_radius.powf(2.0 / 3.0))).powi(2)
            }
        }
    }
}

impl PhysicalComponent for Pipe {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, _dt: f64) -> State {
        if let Some(outflow) = action.outflow {
            // Flow-driven mode: report the head loss this flow would cost.
            self.head_loss = self.head_loss_for_flow(outflow);
            self.outflow = outflow;
        } else {
            let upstream = action.upstream_head.unwrap_or(0.0);
            let downstream = action.downstream_head.unwrap_or(0.0);
            let head_difference = upstream - downstream;
            let coefficient = match self.method {
                FrictionMethod::DarcyWeisbach => self.friction_factor,
                FrictionMethod::Manning => self.manning_n,
            };
            self.outflow = self.flow_for(head_difference, coefficient);
            self.head_loss = head_difference.max(0.0);
        }
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("outflow".to_string(), self.outflow),
            ("head_loss".to_string(), self.head_loss),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
        if let Some(head_loss) = state.get("head_loss") {
            self.head_loss = *head_loss;
        }
    }

    fn parameters(&self) -> Parameters {
        let method = match self.method {
            FrictionMethod::DarcyWeisbach => "darcy_weisbach",
            FrictionMethod::Manning => "manning",
        };
        Parameters::from([
            (
                "calculation_method".to_string(),
                ParamValue::Text(method.to_string()),
            ),
            (
                "friction_factor".to_string(),
                ParamValue::Scalar(self.friction_factor),
            ),
            ("manning_n".to_string(), ParamValue::Scalar(self.manning_n)),
            ("length".to_string(), ParamValue::Scalar(self.length)),
            ("diameter".to_string(), ParamValue::Scalar(self.diameter)),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(f) = scalar_param(params, "friction_factor") {
            self.friction_factor = f;
        }
        if let Some(n) = scalar_param(params, "manning_n") {
            self.manning_n = n;
        }
        if let Some(length) = scalar_param(params, "length") {
            self.length = length;
        }
        if let Some(diameter) = scalar_param(params, "diameter") {
            self.diameter = diameter;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    /// Re-estimates the friction coefficient (Darcy friction factor or
    /// Manning n, depending on the configured method) from observed heads
    /// and flows.
    fn identify_parameters(
        &self,
        data: &IdentificationData,
    ) -> Result<Parameters, IdentificationError> {
        let up = require_series(data, "upstream_levels")?;
        let down = require_series(data, "downstream_levels")?;
        let observed = require_series(data, "observed_flows")?;

        let samples = up.len().min(down.len()).min(observed.len());
        if samples == 0 {
            return Err(IdentificationError::InsufficientData { have: 0, need: 1 });
        }

        let (param_key, initial, bounds) = match self.method {
            FrictionMethod::DarcyWeisbach => {
                ("friction_factor", self.friction_factor, (0.001, 0.5))
            }
            FrictionMethod::Manning => ("manning_n", self.manning_n, (0.001, 0.1)),
        };

        let objective = |x: &[f64]| -> f64 {
            let mut sum_sq = 0.0;
            for i in 0..samples {
                let simulated = self.flow_for(up[i] - down[i], x[0]);
                sum_sq += (simulated - observed[i]).powi(2);
            }
            (sum_sq / samples as f64).sqrt()
        };

        let result = minimize(
            objective,
            &[initial],
            Some(&[bounds]),
            Method::ProjectedGradient,
        );

        if result.converged {
            info!(
                "pipe '{}' identification succeeded, new {param_key} = {:.6}",
                self.id, result.x[0]
            );
            Ok(Parameters::from([(
                param_key.to_string(),
                ParamValue::Scalar(result.x[0]),
            )]))
        } else {
            warn!("pipe '{}' identification failed: {}", self.id, result.message);
            Err(IdentificationError::NotConverged(result.message))
        }
    }
}
