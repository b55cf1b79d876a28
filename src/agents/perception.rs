//! Perception agents: digital twins mirroring component state onto the bus.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::info;

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};
use crate::physics::{SharedComponent, State};

/// A digital twin for one physical component.
///
/// On every tick it reads the target component's state, optionally smooths
/// configured keys with an exponential moving average, and publishes the
/// result on its state topic. Each scalar field is additionally published
/// as `{value: x}` on `<topic>/<field>`, so narrow consumers (parameter
/// identification, signal aggregation) can subscribe to a single variable.
pub struct DigitalTwinAgent {
    agent_id: String,
    model: SharedComponent,
    bus: Rc<MessageBus>,
    state_topic: String,
    // key -> alpha; the smoothed series starts at the first raw value.
    smoothing: BTreeMap<String, f64>,
    smoothed: BTreeMap<String, f64>,
}

impl DigitalTwinAgent {
    pub fn new(
        agent_id: &str,
        model: SharedComponent,
        bus: Rc<MessageBus>,
        state_topic: &str,
        smoothing: BTreeMap<String, f64>,
    ) -> Self {
        info!(
            "digital twin '{agent_id}' created for '{}', publishing on '{state_topic}'",
            model.borrow().id()
        );
        DigitalTwinAgent {
            agent_id: agent_id.to_string(),
            model,
            bus,
            state_topic: state_topic.to_string(),
            smoothing,
            smoothed: BTreeMap::new(),
        }
    }

    /// A twin watching a gate; identical wiring, clearer log line.
    pub fn for_gate(
        agent_id: &str,
        model: SharedComponent,
        bus: Rc<MessageBus>,
        state_topic: &str,
        smoothing: BTreeMap<String, f64>,
    ) -> Self {
        info!("gate perception agent '{agent_id}' initialized");
        Self::new(agent_id, model, bus, state_topic, smoothing)
    }

    /// A twin watching a pump.
    pub fn for_pump(
        agent_id: &str,
        model: SharedComponent,
        bus: Rc<MessageBus>,
        state_topic: &str,
        smoothing: BTreeMap<String, f64>,
    ) -> Self {
        info!("pump perception agent '{agent_id}' initialized");
        Self::new(agent_id, model, bus, state_topic, smoothing)
    }

    fn apply_smoothing(&mut self, state: &mut State) {
        for (key, alpha) in &self.smoothing {
            if let Some(raw) = state.get(key).copied() {
                let previous = self.smoothed.get(key).copied().unwrap_or(raw);
                let smoothed = alpha * raw + (1.0 - alpha) * previous;
                state.insert(key.clone(), smoothed);
                self.smoothed.insert(key.clone(), smoothed);
            }
        }
    }

    /// Reads, smooths and publishes the target's state.
    pub fn publish_state(&mut self) {
        let mut state = self.model.borrow().state();
        self.apply_smoothing(&mut state);

        self.bus
            .publish(&self.state_topic, &Message::from_state(&self.agent_id, &state));

        for (key, value) in &state {
            let sub_topic = format!("{}/{key}", self.state_topic);
            self.bus
                .publish(&sub_topic, &Message::from_sender(&self.agent_id).with_scalar("value", *value));
        }
    }
}

impl Agent for DigitalTwinAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        self.publish_state();
    }
}
