//! An on/off pump with a maximum head cutoff.
//!
//! When switched on the pump delivers `max_flow_rate`, unless the required
//! lift (downstream head minus upstream head) exceeds `max_head`, in which
//! case it delivers nothing. Power draw is reported while water moves.

use crate::bus::Message;
use crate::errors::ComponentError;
use crate::physics::{
    scalar_param, Action, Parameters, ParamValue, PhysicalComponent, State,
};

pub struct Pump {
    id: String,
    max_flow_rate: f64,
    max_head: f64,
    power_consumption_kw: f64,
    status: f64,
    outflow: f64,
    power_draw_kw: f64,
    target_status: f64,
    physical_inflow: f64,
}

impl Pump {
    pub fn new(id: &str, initial_state: &State, parameters: &Parameters) -> Self {
        let status = initial_state.get("status").copied().unwrap_or(0.0);
        Pump {
            id: id.to_string(),
            max_flow_rate: scalar_param(parameters, "max_flow_rate").unwrap_or(10.0),
            max_head: scalar_param(parameters, "max_head").unwrap_or(20.0),
            power_consumption_kw: scalar_param(parameters, "power_consumption_kw").unwrap_or(50.0),
            status,
            outflow: 0.0,
            power_draw_kw: 0.0,
            target_status: status,
            physical_inflow: 0.0,
        }
    }

    fn flow_for(&self, upstream: f64, downstream: f64) -> f64 {
        if self.status != 1.0 {
            return 0.0;
        }
        let required_head = downstream - upstream;
        if required_head > self.max_head {
            return 0.0;
        }
        self.max_flow_rate
    }
}

impl PhysicalComponent for Pump {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, _dt: f64) -> State {
        if let Some(signal) = action.control_signal {
            if signal == 0.0 || signal == 1.0 {
                self.target_status = signal;
            }
        }
        // Switching is instantaneous.
        self.status = self.target_status;

        let upstream = action.upstream_head.unwrap_or(0.0);
        let downstream = action.downstream_head.unwrap_or(0.0);
        self.outflow = self.flow_for(upstream, downstream);
        self.power_draw_kw = if self.outflow > 0.0 {
            self.power_consumption_kw
        } else {
            0.0
        };
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("status".to_string(), self.status),
            ("outflow".to_string(), self.outflow),
            ("power_draw_kw".to_string(), self.power_draw_kw),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(status) = state.get("status") {
            self.status = *status;
            self.target_status = *status;
        }
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            (
                "max_flow_rate".to_string(),
                ParamValue::Scalar(self.max_flow_rate),
            ),
            ("max_head".to_string(), ParamValue::Scalar(self.max_head)),
            (
                "power_consumption_kw".to_string(),
                ParamValue::Scalar(self.power_consumption_kw),
            ),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(rate) = scalar_param(params, "max_flow_rate") {
            self.max_flow_rate = rate;
        }
        if let Some(head) = scalar_param(params, "max_head") {
            self.max_head = head;
        }
        if let Some(power) = scalar_param(params, "power_consumption_kw") {
            self.power_consumption_kw = power;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    fn handle_message(&mut self, message: &Message) {
        if let Some(signal) = message.scalar("control_signal") {
            if signal == 0.0 || signal == 1.0 {
                self.target_status = signal;
            }
        }
    }
}
