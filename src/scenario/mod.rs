//! # Scenario Loader - Declarative Network Construction
//!
//! A scenario is a directory of four YAML documents:
//!
//! - `config.yml`: `{simulation: {duration, time_step}}`
//! - `components.yml`: the physical components with class, initial state
//!   and parameters, plus optional bus topics (inflow, action, rainfall)
//! - `topology.yml`: `{connections: [{upstream, downstream}]}`
//! - `agents.yml`: the agent list (class plus class-specific config, with
//!   nested controller specs) and a shorthand `controllers` list for plain
//!   PID loops
//!
//! Construction order: bus, harness, components (wired to their topics),
//! connections, agents (component references resolved by id, nested
//! controllers instantiated), then `harness.build()`. Class names are
//! checked against the recognized tables before any typed parsing, so an
//! unknown class fails with its own error kind rather than a schema
//! mismatch.

pub mod tests;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;
use serde::Deserialize;

use crate::agents::control::{
    ControlWiring, Controller, JointPidController, LocalControlAgent, StepAgent,
};
use crate::agents::data::CsvInflowAgent;
use crate::agents::dispatch::{
    CentralDispatcherAgent, EmergencyAgent, EmergencyConfig, MpcConfig, RuleConfig,
};
use crate::agents::identification::{
    DataMapEntry, ModelUpdaterAgent, ParameterIdentificationAgent,
};
use crate::agents::monitor::{CentralAnomalyDetectionAgent, DemandForecastingAgent};
use crate::agents::perception::DigitalTwinAgent;
use crate::agents::pid::PidController;
use crate::agents::utility::{
    ActuatorSpec, ConstantValueAgent, PhysicalIoAgent, SensorSpec, SignalAggregatorAgent,
};
use crate::agents::Agent;
use crate::bus::MessageBus;
use crate::errors::ConfigError;
use crate::harness::{SimulationConfig, SimulationHarness};
use crate::physics::canal::UnifiedCanal;
use crate::physics::channel::{RainfallRunoff, RiverChannel, WaterTurbine};
use crate::physics::gate::Gate;
use crate::physics::pipe::Pipe;
use crate::physics::pump::Pump;
use crate::physics::reservoir::{Lake, Reservoir};
use crate::physics::valve::Valve;
use crate::physics::{text_param, Parameters, ParamValue, SharedComponent, State};

const COMPONENT_CLASSES: &[&str] = &[
    "Reservoir",
    "Lake",
    "Gate",
    "Valve",
    "Pump",
    "Pipe",
    "Canal",
    "IntegralDelayCanal",
    "IntegralDelayZeroCanal",
    "UnifiedCanal",
    "WaterTurbine",
    "RainfallRunoff",
    "RiverChannel",
];

const AGENT_CLASSES: &[&str] = &[
    "DigitalTwinAgent",
    "GatePerceptionAgent",
    "PumpPerceptionAgent",
    "LocalControlAgent",
    "GateControlAgent",
    "ValveControlAgent",
    "CentralDispatcherAgent",
    "CentralAnomalyDetectionAgent",
    "DemandForecastingAgent",
    "ParameterIdentificationAgent",
    "ModelUpdaterAgent",
    "CsvInflowAgent",
    "ConstantValueAgent",
    "SignalAggregatorAgent",
    "StepAgent",
    "EmergencyAgent",
    "PhysicalIoAgent",
];

const CONTROLLER_CLASSES: &[&str] = &["PidController", "JointPidController"];

#[derive(Debug, Deserialize)]
struct ConfigDoc {
    simulation: SimulationConfig,
}

#[derive(Debug, Deserialize)]
struct ComponentsDoc {
    components: Vec<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct ComponentSpec {
    id: String,
    class: String,
    #[serde(default)]
    initial_state: State,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default)]
    inflow_topic: Option<String>,
    #[serde(default)]
    action_topic: Option<String>,
    #[serde(default)]
    rainfall_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopologyDoc {
    #[serde(default)]
    connections: Vec<ConnectionSpec>,
}

#[derive(Debug, Deserialize)]
struct ConnectionSpec {
    upstream: String,
    downstream: String,
}

#[derive(Debug, Deserialize)]
struct AgentsDoc {
    #[serde(default)]
    agents: Vec<serde_yaml::Value>,
    #[serde(default)]
    controllers: Vec<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "class", content = "config")]
enum ControllerSpec {
    PidController(PidSpec),
    JointPidController(JointPidSpec),
}

fn default_min_output() -> f64 {
    -1e6
}

fn default_max_output() -> f64 {
    1e6
}

#[derive(Debug, Deserialize)]
struct PidSpec {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    #[serde(default = "default_min_output")]
    min_output: f64,
    #[serde(default = "default_max_output")]
    max_output: f64,
}

#[derive(Debug, Deserialize)]
struct JointPidSpec {
    pid: PidSpec,
    max_inflow: f64,
    max_outflow: f64,
    pump_command_topic: String,
    valve_command_topic: String,
}

#[derive(Debug, Deserialize)]
struct AgentSpec {
    id: String,
    #[serde(flatten)]
    kind: AgentKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "class", content = "config")]
enum AgentKind {
    DigitalTwinAgent(DigitalTwinSpec),
    GatePerceptionAgent(DigitalTwinSpec),
    PumpPerceptionAgent(DigitalTwinSpec),
    LocalControlAgent(LocalControlSpec),
    GateControlAgent(LocalControlSpec),
    ValveControlAgent(LocalControlSpec),
    CentralDispatcherAgent(DispatcherSpec),
    CentralAnomalyDetectionAgent(AnomalySpec),
    DemandForecastingAgent(DemandForecastSpec),
    ParameterIdentificationAgent(IdentificationSpec),
    ModelUpdaterAgent(ModelUpdaterSpec),
    CsvInflowAgent(CsvInflowSpec),
    ConstantValueAgent(ConstantValueSpec),
    SignalAggregatorAgent(SignalAggregatorSpec),
    StepAgent(StepSpec),
    EmergencyAgent(EmergencyAgentSpec),
    PhysicalIoAgent(PhysicalIoSpec),
}

#[derive(Debug, Deserialize)]
struct DigitalTwinSpec {
    simulated_object_id: String,
    state_topic: String,
    #[serde(default)]
    smoothing_config: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct LocalControlSpec {
    controller: ControllerSpec,
    observation_topic: String,
    #[serde(default)]
    observation_key: Option<String>,
    #[serde(default)]
    action_topic: Option<String>,
    #[serde(default)]
    command_topic: Option<String>,
    #[serde(default)]
    feedback_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum DispatcherSpec {
    Rule {
        subscribed_topic: String,
        observation_key: String,
        low_level: f64,
        high_level: f64,
        low_setpoint: f64,
        high_setpoint: f64,
        command_topic: String,
    },
    Emergency {
        reservoir_id: String,
        emergency_flood_level: f64,
        command_topic: String,
    },
    Mpc {
        prediction_horizon: usize,
        #[serde(default)]
        dt: Option<f64>,
        q_weight: f64,
        r_weight: f64,
        state_keys: Vec<String>,
        state_subscriptions: Vec<StateSubscriptionSpec>,
        forecast_subscription: String,
        command_topics: Vec<String>,
        normal_setpoints: Vec<f64>,
        emergency_setpoint: f64,
        flood_thresholds: Vec<f64>,
        canal_surface_areas: Vec<f64>,
        outflow_coefficient: f64,
    },
}

#[derive(Debug, Deserialize)]
struct StateSubscriptionSpec {
    key: String,
    topic: String,
}

fn default_outflow_threshold() -> f64 {
    0.01
}

#[derive(Debug, Deserialize)]
struct AnomalySpec {
    topics_to_monitor: Vec<String>,
    alert_topic: String,
    #[serde(default = "default_outflow_threshold")]
    outflow_threshold: f64,
}

fn default_forecast_interval() -> f64 {
    86_400.0
}

fn default_window_size() -> usize {
    24
}

fn default_forecast_horizon() -> usize {
    12
}

fn default_max_history() -> usize {
    1000
}

#[derive(Debug, Deserialize)]
struct DemandForecastSpec {
    historical_data_topic: String,
    forecast_topic: String,
    #[serde(default = "default_forecast_interval")]
    forecast_interval_seconds: f64,
    #[serde(default = "default_window_size")]
    window_size: usize,
    #[serde(default = "default_forecast_horizon")]
    forecast_horizon: usize,
    #[serde(default = "default_max_history")]
    max_history: usize,
}

fn default_identification_interval() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct IdentificationSpec {
    target_model_id: String,
    #[serde(default = "default_identification_interval")]
    identification_interval: usize,
    identification_data_map: Vec<DataMapEntrySpec>,
}

#[derive(Debug, Deserialize)]
struct DataMapEntrySpec {
    key: String,
    topic: String,
}

#[derive(Debug, Deserialize)]
struct ModelUpdaterSpec {
    parameter_topic: String,
    model_ids: Vec<String>,
}

fn default_time_column() -> String {
    "time".to_string()
}

#[derive(Debug, Deserialize)]
struct CsvInflowSpec {
    csv_file: String,
    #[serde(default = "default_time_column")]
    time_column: String,
    data_column: String,
    inflow_topic: String,
}

fn default_value_key() -> String {
    "value".to_string()
}

#[derive(Debug, Deserialize)]
struct ConstantValueSpec {
    topic: String,
    value: f64,
    #[serde(default = "default_value_key")]
    key: String,
}

#[derive(Debug, Deserialize)]
struct SignalAggregatorSpec {
    input_topics: Vec<String>,
    output_topic: String,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    action_topic: String,
    action_time: f64,
    action_value: f64,
}

#[derive(Debug, Deserialize)]
struct EmergencyAgentSpec {
    pressure_topics: Vec<String>,
    emergency_threshold: f64,
    action_topic: String,
}

fn default_io_seed() -> u64 {
    42
}

fn default_control_key() -> String {
    "control_signal".to_string()
}

#[derive(Debug, Deserialize)]
struct PhysicalIoSpec {
    #[serde(default = "default_io_seed")]
    seed: u64,
    #[serde(default)]
    sensors: Vec<SensorSpecDoc>,
    #[serde(default)]
    actuators: Vec<ActuatorSpecDoc>,
}

#[derive(Debug, Deserialize)]
struct SensorSpecDoc {
    component_id: String,
    state_key: String,
    topic: String,
    #[serde(default)]
    noise_std: f64,
}

fn default_bias() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct ActuatorSpecDoc {
    component_id: String,
    topic: String,
    #[serde(default = "default_control_key")]
    control_key: String,
    #[serde(default = "default_bias")]
    bias: f64,
    #[serde(default)]
    noise_std: f64,
    #[serde(default)]
    log_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControllerWiringSpec {
    id: String,
    class: String,
    controlled_id: String,
    observed_id: String,
    observation_key: String,
    config: serde_yaml::Value,
}

/// Reads a scenario directory and assembles a ready-to-run harness.
pub struct ScenarioLoader {
    scenario_path: PathBuf,
}

impl ScenarioLoader {
    pub fn new(scenario_path: &Path) -> Self {
        ScenarioLoader {
            scenario_path: scenario_path.to_path_buf(),
        }
    }

    /// Loads, instantiates and wires the full simulation, returning a
    /// built harness.
    pub fn load(&self) -> Result<SimulationHarness, ConfigError> {
        let config: ConfigDoc = self.read_doc("config.yml")?;
        let components_doc: ComponentsDoc = self.read_doc("components.yml")?;
        let topology_doc: TopologyDoc = self.read_doc("topology.yml")?;
        let agents_doc: AgentsDoc = self.read_doc("agents.yml")?;

        let bus = MessageBus::new();
        let mut harness = SimulationHarness::new(config.simulation, Rc::clone(&bus));
        let dt = harness.dt();

        // Components first: agents resolve them by id.
        let mut components: BTreeMap<String, SharedComponent> = BTreeMap::new();
        for value in components_doc.components {
            let spec = parse_component_spec(value)?;
            let component = build_component(&spec, &bus)?;
            components.insert(spec.id.clone(), Rc::clone(&component));
            harness.add_component(component)?;
            info!("loaded component '{}' ({})", spec.id, spec.class);
        }

        for connection in &topology_doc.connections {
            harness.add_connection(&connection.upstream, &connection.downstream)?;
        }

        for value in agents_doc.agents {
            let spec = parse_agent_spec(value)?;
            let agent = build_agent(&spec, &bus, &components, dt, &self.scenario_path)?;
            harness.add_agent(agent);
            info!("loaded agent '{}'", spec.id);
        }

        for value in agents_doc.controllers {
            let spec = parse_controller_wiring(value)?;
            let agent = build_wired_controller(&spec, &bus, &components, dt, &harness)?;
            harness.add_agent(agent);
            info!("loaded controller '{}'", spec.id);
        }

        harness.build()?;
        Ok(harness)
    }

    fn read_doc<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ConfigError> {
        let path = self.scenario_path.join(name);
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }
}

fn class_of(value: &serde_yaml::Value) -> Option<String> {
    value
        .get("class")
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string)
}

fn parse_component_spec(value: serde_yaml::Value) -> Result<ComponentSpec, ConfigError> {
    let class = class_of(&value)
        .ok_or_else(|| ConfigError::Schema("component entry without a 'class' field".to_string()))?;
    if !COMPONENT_CLASSES.contains(&class.as_str()) {
        return Err(ConfigError::UnknownClass(class));
    }
    serde_yaml::from_value(value)
        .map_err(|err| ConfigError::Schema(format!("component of class '{class}': {err}")))
}

fn parse_agent_spec(value: serde_yaml::Value) -> Result<AgentSpec, ConfigError> {
    let class = class_of(&value)
        .ok_or_else(|| ConfigError::Schema("agent entry without a 'class' field".to_string()))?;
    if !AGENT_CLASSES.contains(&class.as_str()) {
        return Err(ConfigError::UnknownClass(class));
    }
    serde_yaml::from_value(value)
        .map_err(|err| ConfigError::Schema(format!("agent of class '{class}': {err}")))
}

fn parse_controller_wiring(value: serde_yaml::Value) -> Result<ControllerWiringSpec, ConfigError> {
    let class = class_of(&value)
        .ok_or_else(|| ConfigError::Schema("controller entry without a 'class' field".to_string()))?;
    if !CONTROLLER_CLASSES.contains(&class.as_str()) {
        return Err(ConfigError::UnknownClass(class));
    }
    serde_yaml::from_value(value)
        .map_err(|err| ConfigError::Schema(format!("controller of class '{class}': {err}")))
}

/// Subscribes a component's message handler to a bus topic.
fn wire_topic(bus: &Rc<MessageBus>, topic: &str, component: &SharedComponent) {
    let target = Rc::clone(component);
    bus.subscribe(topic, move |message| {
        target.borrow_mut().handle_message(message);
        Ok(())
    });
}

fn build_component(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, ConfigError> {
    use std::cell::RefCell;

    if let Some(model_type) = text_param(&spec.parameters, "model_type") {
        if model_type == "st_venant" {
            return Err(ConfigError::UnsupportedModel(model_type.to_string()));
        }
    }

    let component: SharedComponent = match spec.class.as_str() {
        "Reservoir" => Rc::new(RefCell::new(Reservoir::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        )?)),
        "Lake" => Rc::new(RefCell::new(Lake::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        )?)),
        "Gate" => Rc::new(RefCell::new(Gate::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        ))),
        "Valve" => Rc::new(RefCell::new(Valve::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        ))),
        "Pump" => Rc::new(RefCell::new(Pump::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        ))),
        "Pipe" => Rc::new(RefCell::new(Pipe::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        )?)),
        "Canal" | "UnifiedCanal" => Rc::new(RefCell::new(UnifiedCanal::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        )?)),
        // Legacy canal class names select the unified model's behavior.
        "IntegralDelayCanal" => {
            let mut parameters = spec.parameters.clone();
            parameters.insert(
                "model_type".to_string(),
                ParamValue::Text("integral_delay".to_string()),
            );
            Rc::new(RefCell::new(UnifiedCanal::new(
                &spec.id,
                &spec.initial_state,
                &parameters,
            )?))
        }
        "IntegralDelayZeroCanal" => {
            let mut parameters = spec.parameters.clone();
            parameters.insert(
                "model_type".to_string(),
                ParamValue::Text("integral_delay_zero".to_string()),
            );
            Rc::new(RefCell::new(UnifiedCanal::new(
                &spec.id,
                &spec.initial_state,
                &parameters,
            )?))
        }
        "WaterTurbine" => Rc::new(RefCell::new(WaterTurbine::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        ))),
        "RainfallRunoff" => {
            let topic = spec.rainfall_topic.as_deref().ok_or_else(|| {
                ConfigError::Schema(format!(
                    "rainfall-runoff '{}' requires a 'rainfall_topic'",
                    spec.id
                ))
            })?;
            let component: SharedComponent = Rc::new(RefCell::new(RainfallRunoff::new(
                &spec.id,
                &spec.parameters,
            )?));
            wire_topic(bus, topic, &component);
            return Ok(component);
        }
        "RiverChannel" => Rc::new(RefCell::new(RiverChannel::new(
            &spec.id,
            &spec.initial_state,
            &spec.parameters,
        ))),
        other => return Err(ConfigError::UnknownClass(other.to_string())),
    };

    if let Some(topic) = &spec.inflow_topic {
        wire_topic(bus, topic, &component);
    }
    if let Some(topic) = &spec.action_topic {
        wire_topic(bus, topic, &component);
    }

    Ok(component)
}

fn lookup_component(
    components: &BTreeMap<String, SharedComponent>,
    id: &str,
) -> Result<SharedComponent, ConfigError> {
    components
        .get(id)
        .cloned()
        .ok_or_else(|| ConfigError::MissingReference(id.to_string()))
}

fn build_controller(spec: &ControllerSpec) -> Box<dyn Controller> {
    match spec {
        ControllerSpec::PidController(pid) => Box::new(PidController::new(
            pid.kp,
            pid.ki,
            pid.kd,
            pid.setpoint,
            pid.min_output,
            pid.max_output,
        )),
        ControllerSpec::JointPidController(joint) => Box::new(JointPidController::new(
            PidController::new(
                joint.pid.kp,
                joint.pid.ki,
                joint.pid.kd,
                joint.pid.setpoint,
                joint.pid.min_output,
                joint.pid.max_output,
            ),
            joint.max_inflow,
            joint.max_outflow,
            &joint.pump_command_topic,
            &joint.valve_command_topic,
        )),
    }
}

fn control_wiring(spec: &LocalControlSpec) -> ControlWiring {
    ControlWiring {
        observation_topic: spec.observation_topic.clone(),
        observation_key: spec.observation_key.clone(),
        action_topic: spec.action_topic.clone(),
        command_topic: spec.command_topic.clone(),
        feedback_topic: spec.feedback_topic.clone(),
    }
}

fn build_agent(
    spec: &AgentSpec,
    bus: &Rc<MessageBus>,
    components: &BTreeMap<String, SharedComponent>,
    dt: f64,
    scenario_path: &Path,
) -> Result<Box<dyn Agent>, ConfigError> {
    let agent: Box<dyn Agent> = match &spec.kind {
        AgentKind::DigitalTwinAgent(twin) => Box::new(DigitalTwinAgent::new(
            &spec.id,
            lookup_component(components, &twin.simulated_object_id)?,
            Rc::clone(bus),
            &twin.state_topic,
            twin.smoothing_config.clone(),
        )),
        AgentKind::GatePerceptionAgent(twin) => Box::new(DigitalTwinAgent::for_gate(
            &spec.id,
            lookup_component(components, &twin.simulated_object_id)?,
            Rc::clone(bus),
            &twin.state_topic,
            twin.smoothing_config.clone(),
        )),
        AgentKind::PumpPerceptionAgent(twin) => Box::new(DigitalTwinAgent::for_pump(
            &spec.id,
            lookup_component(components, &twin.simulated_object_id)?,
            Rc::clone(bus),
            &twin.state_topic,
            twin.smoothing_config.clone(),
        )),
        AgentKind::LocalControlAgent(control) => Box::new(LocalControlAgent::new(
            &spec.id,
            build_controller(&control.controller),
            Rc::clone(bus),
            control_wiring(control),
            dt,
        )),
        AgentKind::GateControlAgent(control) => Box::new(LocalControlAgent::for_gate(
            &spec.id,
            build_controller(&control.controller),
            Rc::clone(bus),
            control_wiring(control),
            dt,
        )),
        AgentKind::ValveControlAgent(control) => Box::new(LocalControlAgent::for_valve(
            &spec.id,
            build_controller(&control.controller),
            Rc::clone(bus),
            control_wiring(control),
            dt,
        )),
        AgentKind::CentralDispatcherAgent(dispatcher) => match dispatcher {
            DispatcherSpec::Rule {
                subscribed_topic,
                observation_key,
                low_level,
                high_level,
                low_setpoint,
                high_setpoint,
                command_topic,
            } => Box::new(CentralDispatcherAgent::new_rule(
                &spec.id,
                Rc::clone(bus),
                RuleConfig {
                    subscribed_topic: subscribed_topic.clone(),
                    observation_key: observation_key.clone(),
                    low_level: *low_level,
                    high_level: *high_level,
                    low_setpoint: *low_setpoint,
                    high_setpoint: *high_setpoint,
                    command_topic: command_topic.clone(),
                },
            )),
            DispatcherSpec::Emergency {
                reservoir_id,
                emergency_flood_level,
                command_topic,
            } => Box::new(CentralDispatcherAgent::new_emergency(
                &spec.id,
                Rc::clone(bus),
                EmergencyConfig {
                    reservoir: lookup_component(components, reservoir_id)?,
                    emergency_flood_level: *emergency_flood_level,
                    command_topic: command_topic.clone(),
                },
            )),
            DispatcherSpec::Mpc {
                prediction_horizon,
                dt: mpc_dt,
                q_weight,
                r_weight,
                state_keys,
                state_subscriptions,
                forecast_subscription,
                command_topics,
                normal_setpoints,
                emergency_setpoint,
                flood_thresholds,
                canal_surface_areas,
                outflow_coefficient,
            } => Box::new(CentralDispatcherAgent::new_mpc(
                &spec.id,
                Rc::clone(bus),
                MpcConfig {
                    prediction_horizon: *prediction_horizon,
                    dt: mpc_dt.unwrap_or(dt),
                    q_weight: *q_weight,
                    r_weight: *r_weight,
                    state_keys: state_keys.clone(),
                    state_subscriptions: state_subscriptions
                        .iter()
                        .map(|s| (s.key.clone(), s.topic.clone()))
                        .collect(),
                    forecast_subscription: forecast_subscription.clone(),
                    command_topics: command_topics.clone(),
                    normal_setpoints: normal_setpoints.clone(),
                    emergency_setpoint: *emergency_setpoint,
                    flood_thresholds: flood_thresholds.clone(),
                    canal_surface_areas: canal_surface_areas.clone(),
                    outflow_coefficient: *outflow_coefficient,
                },
            )),
        },
        AgentKind::CentralAnomalyDetectionAgent(anomaly) => {
            Box::new(CentralAnomalyDetectionAgent::new(
                &spec.id,
                Rc::clone(bus),
                &anomaly.topics_to_monitor,
                &anomaly.alert_topic,
                anomaly.outflow_threshold,
            ))
        }
        AgentKind::DemandForecastingAgent(forecast) => Box::new(DemandForecastingAgent::new(
            &spec.id,
            Rc::clone(bus),
            &forecast.historical_data_topic,
            &forecast.forecast_topic,
            forecast.forecast_interval_seconds,
            forecast.window_size,
            forecast.forecast_horizon,
            forecast.max_history,
        )),
        AgentKind::ParameterIdentificationAgent(ident) => {
            let entries: Vec<DataMapEntry> = ident
                .identification_data_map
                .iter()
                .map(|entry| DataMapEntry {
                    key: entry.key.clone(),
                    topic: entry.topic.clone(),
                })
                .collect();
            Box::new(ParameterIdentificationAgent::new(
                &spec.id,
                lookup_component(components, &ident.target_model_id)?,
                Rc::clone(bus),
                ident.identification_interval,
                &entries,
            ))
        }
        AgentKind::ModelUpdaterAgent(updater) => {
            let mut models = BTreeMap::new();
            for id in &updater.model_ids {
                models.insert(id.clone(), lookup_component(components, id)?);
            }
            Box::new(ModelUpdaterAgent::new(
                &spec.id,
                Rc::clone(bus),
                &updater.parameter_topic,
                models,
            ))
        }
        AgentKind::CsvInflowAgent(csv) => Box::new(CsvInflowAgent::new(
            &spec.id,
            Rc::clone(bus),
            &scenario_path.join(&csv.csv_file),
            &csv.time_column,
            &csv.data_column,
            &csv.inflow_topic,
        )),
        AgentKind::ConstantValueAgent(constant) => Box::new(ConstantValueAgent::new(
            &spec.id,
            Rc::clone(bus),
            &constant.topic,
            &constant.key,
            constant.value,
        )),
        AgentKind::SignalAggregatorAgent(aggregator) => Box::new(SignalAggregatorAgent::new(
            &spec.id,
            Rc::clone(bus),
            &aggregator.input_topics,
            &aggregator.output_topic,
        )),
        AgentKind::StepAgent(step) => Box::new(StepAgent::new(
            &spec.id,
            Rc::clone(bus),
            &step.action_topic,
            step.action_time,
            step.action_value,
        )),
        AgentKind::EmergencyAgent(emergency) => Box::new(EmergencyAgent::new(
            &spec.id,
            Rc::clone(bus),
            &emergency.pressure_topics,
            emergency.emergency_threshold,
            &emergency.action_topic,
        )),
        AgentKind::PhysicalIoAgent(io) => {
            let mut sensors = Vec::new();
            for sensor in &io.sensors {
                sensors.push(SensorSpec {
                    component: lookup_component(components, &sensor.component_id)?,
                    state_key: sensor.state_key.clone(),
                    topic: sensor.topic.clone(),
                    noise_std: sensor.noise_std,
                });
            }
            let mut actuators = Vec::new();
            for actuator in &io.actuators {
                actuators.push(ActuatorSpec {
                    component: lookup_component(components, &actuator.component_id)?,
                    topic: actuator.topic.clone(),
                    control_key: actuator.control_key.clone(),
                    bias: actuator.bias,
                    noise_std: actuator.noise_std,
                    log_topic: actuator.log_topic.clone(),
                });
            }
            Box::new(PhysicalIoAgent::new(
                &spec.id,
                Rc::clone(bus),
                sensors,
                actuators,
                io.seed,
            ))
        }
    };
    Ok(agent)
}

/// The shorthand `controllers` list wires a plain control loop observing
/// `state.<observed_id>` and commanding `action.<controlled_id>`, with the
/// harness itself collecting the control signal.
fn build_wired_controller(
    spec: &ControllerWiringSpec,
    bus: &Rc<MessageBus>,
    components: &BTreeMap<String, SharedComponent>,
    dt: f64,
    harness: &SimulationHarness,
) -> Result<Box<dyn Agent>, ConfigError> {
    lookup_component(components, &spec.controlled_id)?;
    lookup_component(components, &spec.observed_id)?;

    let controller_spec: ControllerSpec = serde_yaml::from_value(serde_yaml::Value::Mapping(
        serde_yaml::Mapping::from_iter([
            (
                serde_yaml::Value::from("class"),
                serde_yaml::Value::from(spec.class.clone()),
            ),
            (serde_yaml::Value::from("config"), spec.config.clone()),
        ]),
    ))
    .map_err(|err| ConfigError::Schema(format!("controller '{}': {err}", spec.id)))?;

    let action_topic = format!("action.{}", spec.controlled_id);
    harness.subscribe_to_action(&action_topic);

    Ok(Box::new(LocalControlAgent::new(
        &spec.id,
        build_controller(&controller_spec),
        Rc::clone(bus),
        ControlWiring {
            observation_topic: format!("state.{}", spec.observed_id),
            observation_key: Some(spec.observation_key.clone()),
            action_topic: Some(action_topic),
            ..ControlWiring::default()
        },
        dt,
    )))
}
