//! # Simulation Harness - The Deterministic Tick Loop
//!
//! The harness owns the components, the topology, the agents, the message
//! bus and the run history, and is the sole driver of simulated time.
//!
//! Each tick runs five phases in order:
//!
//! 1. Publish every component's state on `state.<id>` so event-driven
//!    agents can perceive and react (their actuator commands land on
//!    component subscriptions synchronously, before any physics moves).
//! 2. Call `run(t)` on every agent, in insertion order.
//! 3. Aggregate inflows from the previous tick's outflows, so the step
//!    order within a tick cannot bias the result.
//! 4. Step every component in topological order, passing collected control
//!    signals and the current neighbor heads.
//! 5. Append a `{time, component -> state}` snapshot to the history.
//!
//! A non-finite value appearing in any state aborts the run with the tick
//! index and the offending component id; the history retains every tick up
//! to the last good one.


use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};
use crate::errors::{HarnessError, TopologyError};
use crate::physics::{Action, ComponentId, SharedComponent, State};
use crate::topology::Topology;

/// Global timing settings for one simulation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Total simulated duration in seconds.
    pub duration: f64,
    /// Tick length in seconds.
    #[serde(alias = "dt")]
    pub time_step: f64,
}

/// One tick of recorded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: f64,
    pub states: BTreeMap<ComponentId, State>,
}

pub struct SimulationHarness {
    duration: f64,
    dt: f64,
    bus: Rc<MessageBus>,
    components: BTreeMap<ComponentId, SharedComponent>,
    topology: Topology,
    agents: Vec<Box<dyn Agent>>,
    // Control signals collected from action topics during phases 1 and 2.
    actions: Rc<RefCell<BTreeMap<ComponentId, f64>>>,
    history: Vec<Snapshot>,
    built: bool,
}

impl std::fmt::Debug for SimulationHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationHarness")
            .field("duration", &self.duration)
            .field("dt", &self.dt)
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("agents", &self.agents.len())
            .field("history_len", &self.history.len())
            .field("built", &self.built)
            .finish()
    }
}

impl SimulationHarness {
    pub fn new(config: SimulationConfig, bus: Rc<MessageBus>) -> Self {
        SimulationHarness {
            duration: config.duration,
            dt: config.time_step,
            bus,
            components: BTreeMap::new(),
            topology: Topology::new(),
            agents: Vec::new(),
            actions: Rc::new(RefCell::new(BTreeMap::new())),
            history: Vec::new(),
            built: false,
        }
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn bus(&self) -> Rc<MessageBus> {
        Rc::clone(&self.bus)
    }

    pub fn component(&self, id: &str) -> Option<SharedComponent> {
        self.components.get(id).cloned()
    }

    pub fn history(&self) -> &[Snapshot] {
        &self.history
    }

    pub fn into_history(self) -> Vec<Snapshot> {
        self.history
    }

    pub fn add_component(&mut self, component: SharedComponent) -> Result<(), TopologyError> {
        let id = component.borrow().id().to_string();
        self.topology.add_component(&id)?;
        self.components.insert(id.clone(), component);
        self.built = false;
        debug!("component '{id}' added");
        Ok(())
    }

    pub fn add_connection(&mut self, upstream: &str, downstream: &str) -> Result<(), TopologyError> {
        self.topology.add_connection(upstream, downstream)?;
        self.built = false;
        debug!("connection added: {upstream} -> {downstream}");
        Ok(())
    }

    pub fn add_agent(&mut self, agent: Box<dyn Agent>) {
        debug!("agent '{}' added", agent.id());
        self.agents.push(agent);
    }

    /// Subscribes the harness to an agent's action topic. The last segment
    /// of the topic names the target component; `control_signal` values
    /// published there are handed to that component's `step` on the same
    /// tick.
    pub fn subscribe_to_action(&self, topic: &str) {
        let component_id = topic
            .rsplit(['.', '/'])
            .next()
            .unwrap_or(topic)
            .to_string();
        let actions = Rc::clone(&self.actions);
        self.bus.subscribe(topic, move |message: &Message| {
            if let Some(signal) = message.scalar("control_signal") {
                actions.borrow_mut().insert(component_id.clone(), signal);
            }
            Ok(())
        });
    }

    /// Runs the topological sort. Must be called after wiring and before
    /// [`SimulationHarness::run`].
    pub fn build(&mut self) -> Result<(), TopologyError> {
        self.topology.build()?;
        self.built = true;
        info!(
            "harness built: {} components, {} agents",
            self.components.len(),
            self.agents.len()
        );
        Ok(())
    }

    /// Executes the full tick loop, `ceil(duration / dt)` ticks.
    pub fn run(&mut self) -> Result<(), HarnessError> {
        if !self.built {
            return Err(HarnessError::NotBuilt);
        }

        let num_steps = (self.duration / self.dt).ceil() as usize;
        info!(
            "starting simulation: duration {}s, dt {}s, {} ticks",
            self.duration, self.dt, num_steps
        );

        self.history.clear();
        for tick in 0..num_steps {
            let current_time = tick as f64 * self.dt;

            // Phase 1: perception. Each state publish triggers the whole
            // synchronous cascade of observers and controllers.
            self.publish_states();

            // Phase 2: time-driven agents.
            for agent in &mut self.agents {
                agent.run(current_time);
            }

            // Phases 3 and 4: physics.
            self.step_components(tick)?;
            self.actions.borrow_mut().clear();

            // Phase 5: record.
            self.history.push(Snapshot {
                time: current_time,
                states: self.current_states(),
            });
        }

        info!("simulation finished after {} ticks", self.history.len());
        Ok(())
    }

    fn publish_states(&self) {
        for id in self.topology.sorted() {
            let message = {
                let component = self.components[id].borrow();
                Message::from_state(id, &component.state())
            };
            // The borrow ends before publishing so subscribers may mutate
            // the component's actuator targets.
            self.bus.publish(&format!("state.{id}"), &message);
        }
    }

    fn current_states(&self) -> BTreeMap<ComponentId, State> {
        self.components
            .iter()
            .map(|(id, component)| (id.clone(), component.borrow().state()))
            .collect()
    }

    fn step_components(&mut self, tick: usize) -> Result<(), HarnessError> {
        // Inflows come from the pre-step outflows of upstream neighbors.
        let pre_step_states = self.current_states();
        let inflows = self.topology.aggregate_inflows(&pre_step_states);
        let actions = self.actions.borrow().clone();

        for id in self.topology.sorted() {
            let mut action = Action {
                control_signal: actions.get(id).copied(),
                ..Action::default()
            };

            // Heads come from the first upstream/downstream neighbor's
            // current water level.
            if let Some(up_id) = self.topology.upstream_of(id).first() {
                let level = self.components[up_id]
                    .borrow()
                    .state()
                    .get("water_level")
                    .copied()
                    .unwrap_or(0.0);
                action.upstream_head = Some(level);
            }
            if let Some(down_id) = self.topology.downstream_of(id).first() {
                let level = self.components[down_id]
                    .borrow()
                    .state()
                    .get("water_level")
                    .copied()
                    .unwrap_or(0.0);
                action.downstream_head = Some(level);
            }

            let new_state = {
                let mut component = self.components[id].borrow_mut();
                component.set_inflow(inflows.get(id).copied().unwrap_or(0.0));
                component.step(&action, self.dt)
            };

            if new_state.values().any(|value| !value.is_finite()) {
                return Err(HarnessError::NumericFailure {
                    tick,
                    component: id.clone(),
                });
            }
        }
        Ok(())
    }
}
