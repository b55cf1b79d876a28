//! Local control agents: event-driven loops wiring a pure controller to
//! the bus.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::info;

use crate::agents::pid::PidController;
use crate::agents::Agent;
use crate::bus::{Message, MessageBus};
use crate::errors::SubscriberError;
use crate::physics::State;

/// What a controller hands back for one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutput {
    /// A single actuator command, published on the agent's action topic.
    Signal(f64),
    /// Multi-actuator mode: each entry is published to its own topic.
    PerTopic(BTreeMap<String, f64>),
}

/// A pure control algorithm. Separating the algorithm from the agent lets
/// strategies be swapped without touching the bus wiring.
pub trait Controller {
    fn compute_control_action(&mut self, observation: &State, dt: f64) -> ControlOutput;

    fn set_setpoint(&mut self, _new_setpoint: f64) {}

    /// Interprets a high-level command message. The default picks up
    /// `new_setpoint`.
    fn update_setpoint(&mut self, message: &Message) {
        if let Some(setpoint) = message.scalar("new_setpoint") {
            self.set_setpoint(setpoint);
        }
    }
}

/// Bus wiring for a [`LocalControlAgent`].
#[derive(Debug, Clone, Default)]
pub struct ControlWiring {
    pub observation_topic: String,
    /// Key extracted from observations as the process variable; `None`
    /// forwards the whole message as the observation.
    pub observation_key: Option<String>,
    /// Topic for single-signal output; multi-actuator controllers address
    /// topics themselves.
    pub action_topic: Option<String>,
    /// Optional topic carrying setpoint updates from a dispatcher.
    pub command_topic: Option<String>,
    /// Optional topic carrying actuator state feedback.
    pub feedback_topic: Option<String>,
}

struct ControlLoop {
    agent_id: String,
    controller: Box<dyn Controller>,
    bus: Rc<MessageBus>,
    observation_key: Option<String>,
    action_topic: Option<String>,
    dt: f64,
    latest_feedback: Option<Message>,
}

impl ControlLoop {
    fn handle_observation(&mut self, message: &Message) -> Result<(), SubscriberError> {
        let observation = match &self.observation_key {
            None => message.to_state(),
            Some(key) => {
                let Some(value) = message.scalar(key) else {
                    return Err(SubscriberError(format!(
                        "[{}] key '{key}' not found in observation message",
                        self.agent_id
                    )));
                };
                State::from([("process_variable".to_string(), value)])
            }
        };

        let output = self.controller.compute_control_action(&observation, self.dt);
        self.publish_action(output);
        Ok(())
    }

    fn publish_action(&self, output: ControlOutput) {
        match output {
            ControlOutput::Signal(signal) => {
                if let Some(topic) = &self.action_topic {
                    self.bus.publish(
                        topic,
                        &Message::from_sender(&self.agent_id).with_scalar("control_signal", signal),
                    );
                }
            }
            ControlOutput::PerTopic(signals) => {
                for (topic, signal) in signals {
                    self.bus.publish(
                        &topic,
                        &Message::from_sender(&self.agent_id).with_scalar("control_signal", signal),
                    );
                }
            }
        }
    }
}

/// An event-driven local controller (one gate, one valve, one pump loop).
///
/// Subscribes to its observation topic and, on every message, computes a
/// control action and publishes it synchronously. Optional command and
/// feedback topics feed setpoint updates and actuator state into the
/// controller between observations.
pub struct LocalControlAgent {
    agent_id: String,
    inner: Rc<RefCell<ControlLoop>>,
}

impl LocalControlAgent {
    pub fn new(
        agent_id: &str,
        controller: Box<dyn Controller>,
        bus: Rc<MessageBus>,
        wiring: ControlWiring,
        dt: f64,
    ) -> Self {
        let inner = Rc::new(RefCell::new(ControlLoop {
            agent_id: agent_id.to_string(),
            controller,
            bus: Rc::clone(&bus),
            observation_key: wiring.observation_key.clone(),
            action_topic: wiring.action_topic.clone(),
            dt,
            latest_feedback: None,
        }));

        {
            let loop_ref = Rc::clone(&inner);
            bus.subscribe(&wiring.observation_topic, move |message| {
                loop_ref.borrow_mut().handle_observation(message)
            });
        }
        info!(
            "control agent '{agent_id}' subscribed to observation topic '{}'",
            wiring.observation_topic
        );

        if let Some(command_topic) = &wiring.command_topic {
            let loop_ref = Rc::clone(&inner);
            bus.subscribe(command_topic, move |message| {
                loop_ref.borrow_mut().controller.update_setpoint(message);
                Ok(())
            });
            info!("control agent '{agent_id}' subscribed to command topic '{command_topic}'");
        }

        if let Some(feedback_topic) = &wiring.feedback_topic {
            let loop_ref = Rc::clone(&inner);
            bus.subscribe(feedback_topic, move |message| {
                loop_ref.borrow_mut().latest_feedback = Some(message.clone());
                Ok(())
            });
        }

        LocalControlAgent {
            agent_id: agent_id.to_string(),
            inner,
        }
    }

    /// A loop driving a gate actuator.
    pub fn for_gate(
        agent_id: &str,
        controller: Box<dyn Controller>,
        bus: Rc<MessageBus>,
        wiring: ControlWiring,
        dt: f64,
    ) -> Self {
        info!("gate control agent '{agent_id}' initialized");
        Self::new(agent_id, controller, bus, wiring, dt)
    }

    /// A loop driving a valve actuator.
    pub fn for_valve(
        agent_id: &str,
        controller: Box<dyn Controller>,
        bus: Rc<MessageBus>,
        wiring: ControlWiring,
        dt: f64,
    ) -> Self {
        info!("valve control agent '{agent_id}' initialized");
        Self::new(agent_id, controller, bus, wiring, dt)
    }

    /// The last message seen on the feedback topic, if any.
    pub fn latest_feedback(&self) -> Option<Message> {
        self.inner.borrow().latest_feedback.clone()
    }
}

impl Agent for LocalControlAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        // Event-driven: all work happens in the bus callbacks.
    }
}

/// One PID computing a signed net-flow demand, split into a pump command
/// (positive demand) and a valve command (negative demand), each clamped
/// to its actuator limit and published on its own topic.
pub struct JointPidController {
    pid: PidController,
    max_inflow: f64,
    max_outflow: f64,
    pump_topic: String,
    valve_topic: String,
}

impl JointPidController {
    pub fn new(
        pid: PidController,
        max_inflow: f64,
        max_outflow: f64,
        pump_topic: &str,
        valve_topic: &str,
    ) -> Self {
        JointPidController {
            pid,
            max_inflow,
            max_outflow,
            pump_topic: pump_topic.to_string(),
            valve_topic: valve_topic.to_string(),
        }
    }
}

impl Controller for JointPidController {
    fn compute_control_action(&mut self, observation: &State, dt: f64) -> ControlOutput {
        let net_demand = self.pid.compute(observation, dt);

        let (pump_inflow, valve_outflow) = if net_demand > 0.0 {
            (net_demand.min(self.max_inflow), 0.0)
        } else {
            (0.0, (-net_demand).min(self.max_outflow))
        };

        ControlOutput::PerTopic(BTreeMap::from([
            (self.pump_topic.clone(), pump_inflow),
            (self.valve_topic.clone(), valve_outflow),
        ]))
    }

    fn set_setpoint(&mut self, new_setpoint: f64) {
        self.pid.set_setpoint(new_setpoint);
    }
}

/// A degenerate control agent publishing one fixed action message the
/// first time simulated time reaches `action_time`.
pub struct StepAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    action_topic: String,
    action_time: f64,
    action_value: f64,
    sent: bool,
}

impl StepAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        action_topic: &str,
        action_time: f64,
        action_value: f64,
    ) -> Self {
        StepAgent {
            agent_id: agent_id.to_string(),
            bus,
            action_topic: action_topic.to_string(),
            action_time,
            action_value,
            sent: false,
        }
    }
}

impl Agent for StepAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, current_time: f64) {
        if !self.sent && current_time >= self.action_time {
            self.bus.publish(
                &self.action_topic,
                &Message::from_sender(&self.agent_id)
                    .with_scalar("control_signal", self.action_value),
            );
            self.sent = true;
        }
    }
}
