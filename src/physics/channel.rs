//! Open-channel and catchment models: river reaches, rainfall-runoff and
//! water turbines.

use crate::bus::Message;
use crate::errors::ComponentError;
use crate::physics::{
    scalar_param, Action, Parameters, ParamValue, PhysicalComponent, State, G,
};

/// A river reach modeled as a linear reservoir: outflow proportional to
/// the stored volume (`outflow = k * volume`).
pub struct RiverChannel {
    id: String,
    storage_coefficient: f64,
    volume: f64,
    outflow: f64,
    physical_inflow: f64,
}

impl RiverChannel {
    pub fn new(id: &str, initial_state: &State, parameters: &Parameters) -> Self {
        RiverChannel {
            id: id.to_string(),
            storage_coefficient: scalar_param(parameters, "k").unwrap_or(0.0001),
            volume: initial_state.get("volume").copied().unwrap_or(0.0),
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            physical_inflow: 0.0,
        }
    }
}

impl PhysicalComponent for RiverChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, _action: &Action, dt: f64) -> State {
        let inflow = self.physical_inflow;
        self.outflow = self.storage_coefficient * self.volume;
        self.volume = (self.volume + (inflow - self.outflow) * dt).max(0.0);
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("volume".to_string(), self.volume),
            ("outflow".to_string(), self.outflow),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(volume) = state.get("volume") {
            self.volume = *volume;
        }
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([(
            "k".to_string(),
            ParamValue::Scalar(self.storage_coefficient),
        )])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(k) = scalar_param(params, "k") {
            self.storage_coefficient = k;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }
}

/// Rational-method rainfall-runoff for a catchment: `Q = C * i * A`, with
/// the rainfall intensity fed over a bus topic (`rainfall_intensity`, m/s).
/// The intensity resets after every step so that missing messages mean no
/// rain.
pub struct RainfallRunoff {
    id: String,
    catchment_area: f64,
    runoff_coefficient: f64,
    rainfall_intensity: f64,
    outflow: f64,
}

impl RainfallRunoff {
    pub fn new(id: &str, parameters: &Parameters) -> Result<Self, ComponentError> {
        let catchment_area = scalar_param(parameters, "catchment_area").ok_or_else(|| {
            ComponentError::InvalidParameter(format!(
                "rainfall-runoff '{id}' requires 'catchment_area'"
            ))
        })?;
        let runoff_coefficient =
            scalar_param(parameters, "runoff_coefficient").ok_or_else(|| {
                ComponentError::InvalidParameter(format!(
                    "rainfall-runoff '{id}' requires 'runoff_coefficient'"
                ))
            })?;
        Ok(RainfallRunoff {
            id: id.to_string(),
            catchment_area,
            runoff_coefficient,
            rainfall_intensity: 0.0,
            outflow: 0.0,
        })
    }
}

impl PhysicalComponent for RainfallRunoff {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, _action: &Action, _dt: f64) -> State {
        self.outflow = self.runoff_coefficient * self.rainfall_intensity * self.catchment_area;
        self.rainfall_intensity = 0.0;
        self.state()
    }

    fn state(&self) -> State {
        State::from([("outflow".to_string(), self.outflow)])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            (
                "catchment_area".to_string(),
                ParamValue::Scalar(self.catchment_area),
            ),
            (
                "runoff_coefficient".to_string(),
                ParamValue::Scalar(self.runoff_coefficient),
            ),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(area) = scalar_param(params, "catchment_area") {
            self.catchment_area = area;
        }
        if let Some(c) = scalar_param(params, "runoff_coefficient") {
            self.runoff_coefficient = c;
        }
        Ok(())
    }

    fn set_inflow(&mut self, _inflow: f64) {
        // A catchment has no physical upstream in the component graph.
    }

    fn handle_message(&mut self, message: &Message) {
        if let Some(intensity) = message.scalar("rainfall_intensity") {
            self.rainfall_intensity = intensity;
        }
    }
}

/// Water density, kg/m^3.
const RHO: f64 = 1000.0;

/// A hydropower turbine passing a commanded flow and generating
/// `P = eta * rho * g * Q * H` from the available head.
pub struct WaterTurbine {
    id: String,
    efficiency: f64,
    max_flow_rate: f64,
    outflow: f64,
    power_mw: f64,
    target_outflow: f64,
    physical_inflow: f64,
}

impl WaterTurbine {
    pub fn new(id: &str, initial_state: &State, parameters: &Parameters) -> Self {
        let target = initial_state.get("outflow").copied().unwrap_or(0.0);
        WaterTurbine {
            id: id.to_string(),
            efficiency: scalar_param(parameters, "efficiency").unwrap_or(0.9),
            max_flow_rate: scalar_param(parameters, "max_flow_rate").unwrap_or(100.0),
            outflow: target,
            power_mw: 0.0,
            target_outflow: target,
            physical_inflow: 0.0,
        }
    }
}

impl PhysicalComponent for WaterTurbine {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, _dt: f64) -> State {
        if let Some(signal) = action.control_signal {
            self.target_outflow = signal.max(0.0);
        }

        let upstream = action.upstream_head.unwrap_or(0.0);
        let downstream = action.downstream_head.unwrap_or(0.0);
        let head = upstream - downstream;

        if head > 0.0 {
            self.outflow = self.target_outflow.min(self.max_flow_rate);
            self.power_mw = self.efficiency * RHO * G * self.outflow * head / 1e6;
        } else {
            self.outflow = 0.0;
            self.power_mw = 0.0;
        }
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("outflow".to_string(), self.outflow),
            ("power_mw".to_string(), self.power_mw),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
            self.target_outflow = *outflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("efficiency".to_string(), ParamValue::Scalar(self.efficiency)),
            (
                "max_flow_rate".to_string(),
                ParamValue::Scalar(self.max_flow_rate),
            ),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(efficiency) = scalar_param(params, "efficiency") {
            self.efficiency = efficiency;
        }
        if let Some(rate) = scalar_param(params, "max_flow_rate") {
            self.max_flow_rate = rate;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    fn handle_message(&mut self, message: &Message) {
        if let Some(target) = message
            .scalar("control_signal")
            .or_else(|| message.scalar("outflow"))
        {
            self.target_outflow = target.max(0.0);
        }
    }
}
