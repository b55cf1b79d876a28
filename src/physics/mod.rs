//! # Physical Components - Hydraulic Models with a Uniform Step Contract
//!
//! Every physical object in a network (reservoirs, gates, canals, pipes,
//! valves, pumps, river reaches, turbines) implements
//! [`PhysicalComponent`]: the harness pushes the aggregated upstream inflow
//! with `set_inflow`, then advances the model one tick with `step`, passing
//! the actuator command and neighbor heads in an [`Action`]. Components are
//! deterministic given their prior state and these inputs.
//!
//! States are ordered `name -> value` maps so that history rows and bus
//! messages are reproducible; parameters are maps of [`ParamValue`] so the
//! identification pipeline can ship re-estimated coefficients and storage
//! curves over the bus without a schema registry.
//!
//! ## Submodules
//!
//! - [`storage`]: validated volume/level storage curves
//! - [`reservoir`]: integrating storage (reservoirs and evaporating lakes)
//! - [`gate`]: rate-limited orifice gate
//! - [`canal`]: unified reduced-order canal reach (four model types)
//! - [`pipe`]: Darcy-Weisbach / Manning closed conduit
//! - [`valve`]: percent-opening orifice valve
//! - [`pump`]: on/off pump with a head cutoff
//! - [`channel`]: river reach, rainfall-runoff and water turbine models

pub mod canal;
pub mod channel;
pub mod gate;
pub mod pipe;
pub mod pump;
pub mod reservoir;
pub mod storage;
pub mod valve;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bus::Message;
use crate::errors::{ComponentError, IdentificationError};

/// Gravitational acceleration, m/s^2.
pub const G: f64 = 9.81;

/// Unique component identifier within a scenario.
pub type ComponentId = String;

/// Component state snapshot: state variable name -> value.
pub type State = BTreeMap<String, f64>;

/// Static model configuration: parameter name -> value.
pub type Parameters = BTreeMap<String, ParamValue>;

/// Time-series bundle handed to the offline parameter estimators.
pub type IdentificationData = BTreeMap<String, Vec<f64>>;

/// A component shared between the harness (which steps it) and bus
/// subscriptions or agents (which mutate actuator targets or read state).
pub type SharedComponent = Rc<RefCell<dyn PhysicalComponent>>;

/// A single configuration parameter. Curves are `(volume, level)` style
/// pair lists; text carries model selectors such as `model_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(f64),
    Text(String),
    Curve(Vec<(f64, f64)>),
}

/// Looks up a scalar parameter.
pub fn scalar_param(params: &Parameters, key: &str) -> Option<f64> {
    match params.get(key) {
        Some(ParamValue::Scalar(value)) => Some(*value),
        _ => None,
    }
}

/// Looks up a text parameter.
pub fn text_param<'p>(params: &'p Parameters, key: &str) -> Option<&'p str> {
    match params.get(key) {
        Some(ParamValue::Text(value)) => Some(value.as_str()),
        _ => None,
    }
}

/// Looks up a curve parameter.
pub fn curve_param<'p>(params: &'p Parameters, key: &str) -> Option<&'p [(f64, f64)]> {
    match params.get(key) {
        Some(ParamValue::Curve(points)) => Some(points.as_slice()),
        _ => None,
    }
}

/// Per-tick input assembled by the harness for one component.
///
/// `control_signal` carries the actuator command collected from the bus
/// this tick, if any. The heads are the current water levels of the first
/// upstream and downstream neighbors. `outflow` switches flow-driven
/// components (pipes, reservoir draws) into commanded-flow mode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Action {
    pub control_signal: Option<f64>,
    pub outflow: Option<f64>,
    pub upstream_head: Option<f64>,
    pub downstream_head: Option<f64>,
}

impl Action {
    pub fn with_control_signal(value: f64) -> Self {
        Action {
            control_signal: Some(value),
            ..Action::default()
        }
    }

    pub fn with_heads(upstream: f64, downstream: f64) -> Self {
        Action {
            upstream_head: Some(upstream),
            downstream_head: Some(downstream),
            ..Action::default()
        }
    }
}

/// The uniform contract every hydraulic model fulfills.
pub trait PhysicalComponent {
    /// Component id, unique within the scenario.
    fn id(&self) -> &str;

    /// Advances the model by `dt` seconds using the latest pushed inflow
    /// and the given action, returning the new state.
    fn step(&mut self, action: &Action, dt: f64) -> State;

    /// Current state snapshot.
    fn state(&self) -> State;

    /// Overwrites state variables present in `state`; unknown keys are
    /// ignored.
    fn set_state(&mut self, state: &State);

    /// Current model parameters.
    fn parameters(&self) -> Parameters;

    /// Applies a parameter update, re-validating derived structures such
    /// as storage curves.
    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError>;

    /// Harness hook: the aggregated physical inflow for the coming step.
    fn set_inflow(&mut self, inflow: f64);

    /// Bus hook for components wired to an action or data topic. The
    /// default implementation ignores the message.
    fn handle_message(&mut self, _message: &Message) {}

    /// Offline least-squares re-estimation of the model parameters from
    /// observed input/output series. Models without an estimator report
    /// [`IdentificationError::Unsupported`].
    fn identify_parameters(
        &self,
        _data: &IdentificationData,
    ) -> Result<Parameters, IdentificationError> {
        Err(IdentificationError::Unsupported)
    }
}

/// Pulls a named series out of an identification data bundle.
pub(crate) fn require_series<'d>(
    data: &'d IdentificationData,
    key: &str,
) -> Result<&'d [f64], IdentificationError> {
    data.get(key)
        .map(Vec::as_slice)
        .ok_or_else(|| IdentificationError::MissingSeries(key.to_string()))
}
