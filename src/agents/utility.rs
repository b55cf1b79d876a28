//! Utility agents: constant sources, signal aggregation, and a simulated
//! field I/O layer with sensor and actuator noise.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};
use crate::physics::SharedComponent;

/// Publishes one constant value under a configurable key, every tick.
pub struct ConstantValueAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    topic: String,
    key: String,
    value: f64,
}

impl ConstantValueAgent {
    pub fn new(agent_id: &str, bus: Rc<MessageBus>, topic: &str, key: &str, value: f64) -> Self {
        ConstantValueAgent {
            agent_id: agent_id.to_string(),
            bus,
            topic: topic.to_string(),
            key: key.to_string(),
            value,
        }
    }
}

impl Agent for ConstantValueAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        self.bus.publish(
            &self.topic,
            &Message::from_sender(&self.agent_id).with_scalar(&self.key, self.value),
        );
    }
}

/// Sums the latest `{value: x}` seen on each input topic and republishes
/// the total on one output topic. Useful for combining several inflow
/// sources for a component that subscribes to a single topic.
pub struct SignalAggregatorAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    output_topic: String,
    last_received: Rc<RefCell<BTreeMap<String, f64>>>,
}

impl SignalAggregatorAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        input_topics: &[String],
        output_topic: &str,
    ) -> Self {
        let last_received: Rc<RefCell<BTreeMap<String, f64>>> = Rc::new(RefCell::new(
            input_topics
                .iter()
                .map(|topic| (topic.clone(), 0.0))
                .collect(),
        ));

        for topic in input_topics {
            let cell = Rc::clone(&last_received);
            let name = topic.clone();
            bus.subscribe(topic, move |message: &Message| {
                if let Some(value) = message.scalar("value") {
                    cell.borrow_mut().insert(name.clone(), value);
                }
                Ok(())
            });
            info!("[{agent_id}] subscribed to input topic '{topic}'");
        }

        SignalAggregatorAgent {
            agent_id: agent_id.to_string(),
            bus,
            output_topic: output_topic.to_string(),
            last_received,
        }
    }
}

impl Agent for SignalAggregatorAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        let total: f64 = self.last_received.borrow().values().sum();
        self.bus.publish(
            &self.output_topic,
            &Message::from_sender(&self.agent_id).with_scalar("value", total),
        );
    }
}

/// A simulated sensor: reads one state variable from a component, adds
/// Gaussian noise and publishes the reading.
pub struct SensorSpec {
    pub component: SharedComponent,
    pub state_key: String,
    pub topic: String,
    pub noise_std: f64,
}

/// A simulated actuator: commands arriving on `topic` are corrupted with
/// a multiplicative bias and additive Gaussian noise before reaching the
/// component, optionally logging the corrupted value.
pub struct ActuatorSpec {
    pub component: SharedComponent,
    pub topic: String,
    pub control_key: String,
    pub bias: f64,
    pub noise_std: f64,
    pub log_topic: Option<String>,
}

/// Simulates the physical I/O layer between the agents and the plant.
///
/// Sensing happens on `run`; actuation is event-driven. The RNG is seeded
/// so that noisy runs reproduce exactly.
pub struct PhysicalIoAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    sensors: Vec<SensorSpec>,
    rng: Rc<RefCell<StdRng>>,
}

impl PhysicalIoAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        sensors: Vec<SensorSpec>,
        actuators: Vec<ActuatorSpec>,
        seed: u64,
    ) -> Self {
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(seed)));

        for actuator in actuators {
            let rng_ref = Rc::clone(&rng);
            let bus_ref = Rc::clone(&bus);
            let id = agent_id.to_string();
            let topic = actuator.topic.clone();
            bus.subscribe(&topic, move |message: &Message| {
                let Some(commanded) = message.scalar(&actuator.control_key) else {
                    return Ok(());
                };

                let mut actual = commanded * actuator.bias;
                if actuator.noise_std > 0.0 {
                    if let Ok(normal) = Normal::new(0.0, actuator.noise_std) {
                        actual += normal.sample(&mut *rng_ref.borrow_mut());
                    }
                }
                let actual = actual.max(0.0);

                if let Some(log_topic) = &actuator.log_topic {
                    bus_ref.publish(
                        log_topic,
                        &Message::from_sender(&id).with_scalar("value", actual),
                    );
                }

                actuator
                    .component
                    .borrow_mut()
                    .handle_message(&Message::from_sender(&id).with_scalar("control_signal", actual));
                Ok(())
            });
        }

        info!("physical io agent '{agent_id}' created with {} sensors", sensors.len());
        PhysicalIoAgent {
            agent_id: agent_id.to_string(),
            bus,
            sensors,
            rng,
        }
    }
}

impl Agent for PhysicalIoAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, current_time: f64) {
        for sensor in &self.sensors {
            let Some(true_value) = sensor
                .component
                .borrow()
                .state()
                .get(&sensor.state_key)
                .copied()
            else {
                continue;
            };

            let mut reading = true_value;
            if sensor.noise_std > 0.0 {
                if let Ok(normal) = Normal::new(0.0, sensor.noise_std) {
                    reading += normal.sample(&mut *self.rng.borrow_mut());
                }
            }

            self.bus.publish(
                &sensor.topic,
                &Message::from_sender(&self.agent_id)
                    .with_scalar(&sensor.state_key, reading)
                    .with_scalar("timestamp", current_time),
            );
        }
    }
}
