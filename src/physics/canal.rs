//! A unified reduced-order canal reach.
//!
//! A `model_type` parameter selects one of four behaviors sharing the state
//! `water_level`, `inflow`, `outflow`:
//!
//! | model | dynamics |
//! |---|---|
//! | `integral` | `dL/dt = (in - out) / A`, `out = k * sqrt(max(0, L))` |
//! | `integral_delay` | FIFO-delayed inflow becomes the outflow; `dL/dt = gain * (in - out)` |
//! | `integral_delay_zero` | as above plus a derivative (zero) term on the delayed inflow |
//! | `linear_reservoir` | `out = (K * out_prev + dt * in) / (K + dt)`, level proportional to storage |
//!
//! The delay buffer is sized `ceil(delay / dt) + 2` and created lazily on
//! the first step, when `dt` is known. Water level never drops below zero.

use std::collections::VecDeque;

use crate::errors::ComponentError;
use crate::physics::{
    scalar_param, text_param, Action, Parameters, ParamValue, PhysicalComponent, State,
};

#[derive(Debug, Clone, PartialEq)]
pub enum CanalModel {
    Integral {
        surface_area: f64,
        outlet_coefficient: f64,
    },
    IntegralDelay {
        gain: f64,
        delay: f64,
    },
    IntegralDelayZero {
        gain: f64,
        delay: f64,
        zero_time_constant: f64,
    },
    LinearReservoir {
        storage_constant: f64,
        level_storage_ratio: f64,
    },
}

impl CanalModel {
    /// Reads the model selector and its parameters from a parameter map.
    /// Unknown selectors are rejected; `st_venant` is rejected explicitly
    /// since the high-fidelity solver is not part of this engine.
    pub fn from_parameters(parameters: &Parameters) -> Result<Self, ComponentError> {
        let model_type = text_param(parameters, "model_type").unwrap_or("integral_delay");
        match model_type {
            "integral" => Ok(CanalModel::Integral {
                surface_area: scalar_param(parameters, "surface_area").unwrap_or(10_000.0),
                outlet_coefficient: scalar_param(parameters, "outlet_coefficient").unwrap_or(5.0),
            }),
            "integral_delay" => Ok(CanalModel::IntegralDelay {
                gain: scalar_param(parameters, "gain").unwrap_or(0.001),
                delay: scalar_param(parameters, "delay").unwrap_or(300.0),
            }),
            "integral_delay_zero" => Ok(CanalModel::IntegralDelayZero {
                gain: scalar_param(parameters, "gain").unwrap_or(0.001),
                delay: scalar_param(parameters, "delay").unwrap_or(300.0),
                zero_time_constant: scalar_param(parameters, "zero_time_constant").unwrap_or(50.0),
            }),
            "linear_reservoir" => Ok(CanalModel::LinearReservoir {
                storage_constant: scalar_param(parameters, "storage_constant").unwrap_or(1200.0),
                level_storage_ratio: scalar_param(parameters, "level_storage_ratio")
                    .unwrap_or(0.005),
            }),
            other => Err(ComponentError::InvalidParameter(format!(
                "unknown canal model type '{other}'"
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CanalModel::Integral { .. } => "integral",
            CanalModel::IntegralDelay { .. } => "integral_delay",
            CanalModel::IntegralDelayZero { .. } => "integral_delay_zero",
            CanalModel::LinearReservoir { .. } => "linear_reservoir",
        }
    }

    fn delay(&self) -> Option<f64> {
        match self {
            CanalModel::IntegralDelay { delay, .. }
            | CanalModel::IntegralDelayZero { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}

pub struct UnifiedCanal {
    id: String,
    model: CanalModel,
    water_level: f64,
    inflow: f64,
    outflow: f64,
    physical_inflow: f64,
    // Linear-reservoir storage, derived from the initial level.
    storage: f64,
    inflow_history: Option<VecDeque<f64>>,
}

impl UnifiedCanal {
    pub fn new(
        id: &str,
        initial_state: &State,
        parameters: &Parameters,
    ) -> Result<Self, ComponentError> {
        let model = CanalModel::from_parameters(parameters)?;
        let water_level = initial_state.get("water_level").copied().unwrap_or(5.0);

        let storage = match &model {
            CanalModel::LinearReservoir {
                level_storage_ratio, ..
            } if *level_storage_ratio > 0.0 => water_level / level_storage_ratio,
            _ => 0.0,
        };

        Ok(UnifiedCanal {
            id: id.to_string(),
            model,
            water_level,
            inflow: initial_state.get("inflow").copied().unwrap_or(0.0),
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            physical_inflow: 0.0,
            storage,
            inflow_history: None,
        })
    }

    pub fn model(&self) -> &CanalModel {
        &self.model
    }

    /// The delay FIFO is created on first use, once `dt` is known.
    fn history(&mut self, dt: f64) -> &mut VecDeque<f64> {
        let delay = self.model.delay().unwrap_or(0.0);
        let initial_inflow = self.inflow;
        self.inflow_history.get_or_insert_with(|| {
            let size = if delay > 0.0 && dt > 0.0 {
                (delay / dt).ceil() as usize + 2
            } else {
                2
            };
            VecDeque::from(vec![initial_inflow; size])
        })
    }

    fn push_inflow(&mut self, inflow: f64, dt: f64) {
        let history = self.history(dt);
        history.pop_front();
        history.push_back(inflow);
    }

    fn step_integral(&mut self, dt: f64, surface_area: f64, outlet_coefficient: f64) {
        let inflow = self.physical_inflow;
        self.inflow = inflow;
        self.outflow = outlet_coefficient * self.water_level.max(0.0).sqrt();
        self.water_level += (inflow - self.outflow) / surface_area * dt;
        self.water_level = self.water_level.max(0.0);
    }

    fn step_integral_delay(&mut self, dt: f64, gain: f64) {
        let inflow = self.physical_inflow;
        // The lazy buffer seeds from the pre-step inflow; push before the
        // state inflow is overwritten.
        self.push_inflow(inflow, dt);
        self.inflow = inflow;
        let delayed = self.inflow_history.as_ref().map_or(inflow, |h| h[0]);
        self.outflow = delayed;
        self.water_level += gain * (inflow - delayed) * dt;
        self.water_level = self.water_level.max(0.0);
    }

    fn step_integral_delay_zero(&mut self, dt: f64, gain: f64, zero_time_constant: f64) {
        let inflow = self.physical_inflow;
        // Same seeding constraint as the integral_delay model.
        self.push_inflow(inflow, dt);
        self.inflow = inflow;
        let (previous, delayed) = self
            .inflow_history
            .as_ref()
            .map_or((inflow, inflow), |h| (h[0], h[1]));
        let derivative = (delayed - previous) / dt;
        self.outflow = delayed + zero_time_constant * derivative;
        self.water_level += gain * (inflow - self.outflow) * dt;
        self.water_level = self.water_level.max(0.0);
    }

    fn step_linear_reservoir(&mut self, dt: f64, storage_constant: f64, level_storage_ratio: f64) {
        let inflow = self.physical_inflow;
        self.inflow = inflow;
        let outflow = (storage_constant * self.outflow + dt * inflow) / (storage_constant + dt);
        self.outflow = outflow;
        self.storage += (inflow - outflow) * dt;
        self.water_level = (self.storage * level_storage_ratio).max(0.0);
    }
}

impl PhysicalComponent for UnifiedCanal {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, _action: &Action, dt: f64) -> State {
        if dt <= 0.0 {
            return self.state();
        }
        match self.model.clone() {
            CanalModel::Integral {
                surface_area,
                outlet_coefficient,
            } => self.step_integral(dt, surface_area, outlet_coefficient),
            CanalModel::IntegralDelay { gain, .. } => self.step_integral_delay(dt, gain),
            CanalModel::IntegralDelayZero {
                gain,
                zero_time_constant,
                ..
            } => self.step_integral_delay_zero(dt, gain, zero_time_constant),
            CanalModel::LinearReservoir {
                storage_constant,
                level_storage_ratio,
            } => self.step_linear_reservoir(dt, storage_constant, level_storage_ratio),
        }
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("water_level".to_string(), self.water_level),
            ("inflow".to_string(), self.inflow),
            ("outflow".to_string(), self.outflow),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(level) = state.get("water_level") {
            self.water_level = level.max(0.0);
            if let CanalModel::LinearReservoir {
                level_storage_ratio, ..
            } = &self.model
            {
                if *level_storage_ratio > 0.0 {
                    self.storage = self.water_level / level_storage_ratio;
                }
            }
        }
        if let Some(inflow) = state.get("inflow") {
            self.inflow = *inflow;
        }
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
    }

    fn parameters(&self) -> Parameters {
        let mut params = Parameters::from([(
            "model_type".to_string(),
            ParamValue::Text(self.model.name().to_string()),
        )]);
        match &self.model {
            CanalModel::Integral {
                surface_area,
                outlet_coefficient,
            } => {
                params.insert("surface_area".to_string(), ParamValue::Scalar(*surface_area));
                params.insert(
                    "outlet_coefficient".to_string(),
                    ParamValue::Scalar(*outlet_coefficient),
                );
            }
            CanalModel::IntegralDelay { gain, delay } => {
                params.insert("gain".to_string(), ParamValue::Scalar(*gain));
                params.insert("delay".to_string(), ParamValue::Scalar(*delay));
            }
            CanalModel::IntegralDelayZero {
                gain,
                delay,
                zero_time_constant,
            } => {
                params.insert("gain".to_string(), ParamValue::Scalar(*gain));
                params.insert("delay".to_string(), ParamValue::Scalar(*delay));
                params.insert(
                    "zero_time_constant".to_string(),
                    ParamValue::Scalar(*zero_time_constant),
                );
            }
            CanalModel::LinearReservoir {
                storage_constant,
                level_storage_ratio,
            } => {
                params.insert(
                    "storage_constant".to_string(),
                    ParamValue::Scalar(*storage_constant),
                );
                params.insert(
                    "level_storage_ratio".to_string(),
                    ParamValue::Scalar(*level_storage_ratio),
                );
            }
        }
        params
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        // A full model_type switch rebuilds the model; scalar updates merge
        // into the current one.
        if text_param(params, "model_type").is_some() {
            self.model = CanalModel::from_parameters(params)?;
            self.inflow_history = None;
            return Ok(());
        }
        match &mut self.model {
            CanalModel::Integral {
                surface_area,
                outlet_coefficient,
            } => {
                if let Some(v) = scalar_param(params, "surface_area") {
                    *surface_area = v;
                }
                if let Some(v) = scalar_param(params, "outlet_coefficient") {
                    *outlet_coefficient = v;
                }
            }
            CanalModel::IntegralDelay { gain, delay } => {
                if let Some(v) = scalar_param(params, "gain") {
                    *gain = v;
                }
                if let Some(v) = scalar_param(params, "delay") {
                    *delay = v;
                    self.inflow_history = None;
                }
            }
            CanalModel::IntegralDelayZero {
                gain,
                delay,
                zero_time_constant,
            } => {
                if let Some(v) = scalar_param(params, "gain") {
                    *gain = v;
                }
                if let Some(v) = scalar_param(params, "delay") {
                    *delay = v;
                    self.inflow_history = None;
                }
                if let Some(v) = scalar_param(params, "zero_time_constant") {
                    *zero_time_constant = v;
                }
            }
            CanalModel::LinearReservoir {
                storage_constant,
                level_storage_ratio,
            } => {
                if let Some(v) = scalar_param(params, "storage_constant") {
                    *storage_constant = v;
                }
                if let Some(v) = scalar_param(params, "level_storage_ratio") {
                    *level_storage_ratio = v;
                }
            }
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }
}
