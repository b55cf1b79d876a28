//! Supervisory dispatchers: rule-based hysteresis, emergency override and
//! model-predictive setpoint generation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{error, info, warn};

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};
use crate::numerics::{minimize, Method};
use crate::physics::SharedComponent;

/// Hysteresis band configuration for rule mode.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    pub subscribed_topic: String,
    pub observation_key: String,
    pub low_level: f64,
    pub high_level: f64,
    pub low_setpoint: f64,
    pub high_setpoint: f64,
    pub command_topic: String,
}

/// Emergency override configuration. Holds a direct handle to the watched
/// reservoir rather than a bus subscription.
#[derive(Clone)]
pub struct EmergencyConfig {
    pub reservoir: SharedComponent,
    pub emergency_flood_level: f64,
    pub command_topic: String,
}

/// Model-predictive control over a chain of serial canal pools.
#[derive(Debug, Clone)]
pub struct MpcConfig {
    pub prediction_horizon: usize,
    pub dt: f64,
    pub q_weight: f64,
    pub r_weight: f64,
    /// Pool names, upstream first; each has a state subscription and a
    /// command topic in the same order.
    pub state_keys: Vec<String>,
    pub state_subscriptions: Vec<(String, String)>,
    pub forecast_subscription: String,
    pub command_topics: Vec<String>,
    pub normal_setpoints: Vec<f64>,
    pub emergency_setpoint: f64,
    pub flood_thresholds: Vec<f64>,
    pub canal_surface_areas: Vec<f64>,
    pub outflow_coefficient: f64,
}

/// Setpoint bounds for the MPC decision variables, meters.
const SETPOINT_BOUNDS: (f64, f64) = (2.0, 6.0);
/// Weight of the flood-level soft constraint.
const FLOOD_PENALTY: f64 = 1e6;

enum Mode {
    Rule {
        config: RuleConfig,
        observed: Rc<RefCell<Option<f64>>>,
    },
    Emergency {
        config: EmergencyConfig,
    },
    Mpc {
        config: MpcConfig,
        latest_states: Rc<RefCell<BTreeMap<String, f64>>>,
        latest_forecast: Rc<RefCell<Vec<f64>>>,
    },
}

/// A central dispatcher operating in one of three modes.
///
/// Rule mode watches one observation and issues a high or low setpoint
/// when the value leaves the hysteresis band. Emergency mode reads its
/// reservoir directly and forces the supply gate closed on every tick the
/// flood level is breached. MPC mode optimizes a setpoint sequence over a
/// finite horizon and publishes only the first step, re-solving each tick.
pub struct CentralDispatcherAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    mode: Mode,
}

impl CentralDispatcherAgent {
    pub fn new_rule(agent_id: &str, bus: Rc<MessageBus>, config: RuleConfig) -> Self {
        info!(
            "dispatcher '{agent_id}' in rule mode, monitoring '{}' on '{}'",
            config.observation_key, config.subscribed_topic
        );
        let observed = Rc::new(RefCell::new(None));
        {
            let cell = Rc::clone(&observed);
            let key = config.observation_key.clone();
            bus.subscribe(&config.subscribed_topic, move |message: &Message| {
                if let Some(value) = message.scalar(&key) {
                    *cell.borrow_mut() = Some(value);
                }
                Ok(())
            });
        }
        CentralDispatcherAgent {
            agent_id: agent_id.to_string(),
            bus,
            mode: Mode::Rule { config, observed },
        }
    }

    pub fn new_emergency(agent_id: &str, bus: Rc<MessageBus>, config: EmergencyConfig) -> Self {
        info!("dispatcher '{agent_id}' in emergency mode");
        CentralDispatcherAgent {
            agent_id: agent_id.to_string(),
            bus,
            mode: Mode::Emergency { config },
        }
    }

    pub fn new_mpc(agent_id: &str, bus: Rc<MessageBus>, config: MpcConfig) -> Self {
        info!(
            "dispatcher '{agent_id}' in mpc mode over {} pools, horizon {}",
            config.state_keys.len(),
            config.prediction_horizon
        );
        let latest_states = Rc::new(RefCell::new(BTreeMap::new()));
        let latest_forecast = Rc::new(RefCell::new(vec![0.0; config.prediction_horizon]));

        for (key, topic) in &config.state_subscriptions {
            let cell = Rc::clone(&latest_states);
            let name = key.clone();
            bus.subscribe(topic, move |message: &Message| {
                let level = message.scalar("water_level").unwrap_or(0.0);
                cell.borrow_mut().insert(name.clone(), level);
                Ok(())
            });
        }
        {
            let cell = Rc::clone(&latest_forecast);
            bus.subscribe(&config.forecast_subscription, move |message: &Message| {
                if let Some(series) = message.series("inflow_forecast") {
                    *cell.borrow_mut() = series.to_vec();
                }
                Ok(())
            });
        }

        CentralDispatcherAgent {
            agent_id: agent_id.to_string(),
            bus,
            mode: Mode::Mpc {
                config,
                latest_states,
                latest_forecast,
            },
        }
    }

    fn run_rule(&self, config: &RuleConfig, observed: &Rc<RefCell<Option<f64>>>) {
        let Some(value) = *observed.borrow() else {
            return;
        };

        let new_setpoint = if value < config.low_level {
            Some(config.high_setpoint)
        } else if value > config.high_level {
            Some(config.low_setpoint)
        } else {
            None
        };

        if let Some(setpoint) = new_setpoint {
            info!("dispatcher '{}' issuing new setpoint {setpoint}", self.agent_id);
            self.bus.publish(
                &config.command_topic,
                &Message::from_sender(&self.agent_id).with_scalar("new_setpoint", setpoint),
            );
        }
    }

    fn run_emergency(&self, config: &EmergencyConfig) {
        let current_level = {
            let reservoir = config.reservoir.borrow();
            reservoir.state().get("water_level").copied().unwrap_or(0.0)
        };

        if current_level > config.emergency_flood_level {
            warn!(
                "[{}] emergency override: level {current_level:.2} m breached {:.2} m, forcing supply gate closed",
                self.agent_id, config.emergency_flood_level
            );
            self.bus.publish(
                &config.command_topic,
                &Message::from_sender(&self.agent_id).with_scalar("control_signal", 0.0),
            );
        }
    }

    fn run_mpc(
        &self,
        config: &MpcConfig,
        latest_states: &Rc<RefCell<BTreeMap<String, f64>>>,
        latest_forecast: &Rc<RefCell<Vec<f64>>>,
    ) {
        let initial_levels: Vec<f64> = {
            let states = latest_states.borrow();
            if states.len() < config.state_keys.len() {
                // Not every pool has reported yet.
                return;
            }
            config
                .state_keys
                .iter()
                .map(|key| states.get(key).copied().unwrap_or(0.0))
                .collect()
        };
        let forecast = latest_forecast.borrow().clone();

        let num_canals = config.state_keys.len();
        let horizon = config.prediction_horizon;

        // Any predicted inflow switches the whole chain to the emergency
        // setpoint.
        let use_emergency = forecast.iter().any(|f| *f > 0.0);
        let targets: Vec<f64> = if use_emergency {
            vec![config.emergency_setpoint; num_canals]
        } else {
            config.normal_setpoints.clone()
        };

        let objective = |setpoints: &[f64]| -> f64 {
            mpc_cost(setpoints, &initial_levels, &forecast, &targets, config)
        };

        let initial_guess: Vec<f64> = targets
            .iter()
            .cycle()
            .take(horizon * num_canals)
            .copied()
            .collect();
        let bounds = vec![SETPOINT_BOUNDS; horizon * num_canals];

        let result = minimize(
            objective,
            &initial_guess,
            Some(&bounds),
            Method::ProjectedGradient,
        );

        if result.converged {
            // Apply only the first step of the optimal sequence.
            for (i, command_topic) in config.command_topics.iter().enumerate() {
                self.bus.publish(
                    command_topic,
                    &Message::from_sender(&self.agent_id)
                        .with_scalar("new_setpoint", result.x[i]),
                );
            }
        } else {
            error!(
                "mpc optimization failed for '{}' ({}); falling back to target setpoints",
                self.agent_id, result.message
            );
            for (i, command_topic) in config.command_topics.iter().enumerate() {
                self.bus.publish(
                    command_topic,
                    &Message::from_sender(&self.agent_id).with_scalar("new_setpoint", targets[i]),
                );
            }
        }
    }
}

/// Cost of one candidate setpoint sequence over the horizon: setpoint
/// tracking, move suppression and a quadratic flood penalty over the
/// predicted pool levels of a serial chain.
fn mpc_cost(
    setpoints: &[f64],
    initial_levels: &[f64],
    forecast: &[f64],
    targets: &[f64],
    config: &MpcConfig,
) -> f64 {
    let num_canals = config.state_keys.len();
    let horizon = config.prediction_horizon;
    let mut predicted = initial_levels.to_vec();
    let mut cost = 0.0;

    for step in 0..horizon {
        let row = &setpoints[step * num_canals..(step + 1) * num_canals];

        // Pool dynamics: the head pool takes the forecast inflow, each
        // downstream pool takes the upstream pool's outflow. Outflow is a
        // smooth proxy for gate throttling against the setpoint.
        let mut inflow = forecast.get(step).copied().unwrap_or(0.0);
        for (canal, level) in predicted.iter_mut().enumerate() {
            let outflow = config.outflow_coefficient / (row[canal] + 1e-6);
            *level += (inflow - outflow) * config.dt / config.canal_surface_areas[canal];
            inflow = outflow;
        }

        for canal in 0..num_canals {
            cost += config.q_weight * (row[canal] - targets[canal]).powi(2);
            if step > 0 {
                let previous = setpoints[(step - 1) * num_canals + canal];
                cost += config.r_weight * (row[canal] - previous).powi(2);
            }
            let flood_excess = (predicted[canal] - config.flood_thresholds[canal]).max(0.0);
            cost += FLOOD_PENALTY * flood_excess.powi(2);
        }
    }
    cost
}

impl Agent for CentralDispatcherAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        match &self.mode {
            Mode::Rule { config, observed } => self.run_rule(config, observed),
            Mode::Emergency { config } => self.run_emergency(config),
            Mode::Mpc {
                config,
                latest_states,
                latest_forecast,
            } => self.run_mpc(config, latest_states, latest_forecast),
        }
    }
}

/// A standalone emergency responder watching pressure topics.
///
/// The first reading below the threshold latches an emergency and closes
/// the intake via the action topic; afterwards the agent stays silent.
pub struct EmergencyAgent {
    agent_id: String,
    declared: Rc<RefCell<bool>>,
}

impl EmergencyAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        pressure_topics: &[String],
        emergency_threshold: f64,
        action_topic: &str,
    ) -> Self {
        let declared = Rc::new(RefCell::new(false));

        for topic in pressure_topics {
            let flag = Rc::clone(&declared);
            let bus_ref = Rc::clone(&bus);
            let id = agent_id.to_string();
            let action = action_topic.to_string();
            bus.subscribe(topic, move |message: &Message| {
                if *flag.borrow() {
                    return Ok(());
                }
                let Some(pressure) = message.scalar("pressure") else {
                    return Ok(());
                };
                if pressure < emergency_threshold {
                    warn!(
                        "[{id}] emergency declared: pressure {pressure:.2} below threshold {emergency_threshold:.2}"
                    );
                    *flag.borrow_mut() = true;
                    bus_ref.publish(
                        &action,
                        &Message::from_sender(&id).with_scalar("control_signal", 0.0),
                    );
                }
                Ok(())
            });
        }

        EmergencyAgent {
            agent_id: agent_id.to_string(),
            declared,
        }
    }

    pub fn emergency_declared(&self) -> bool {
        *self.declared.borrow()
    }
}

impl Agent for EmergencyAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        // Event-driven: reacts inside the pressure callbacks.
    }
}
