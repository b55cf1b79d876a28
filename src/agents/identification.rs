//! Parameter identification agents: collecting observed I/O series,
//! triggering re-estimation on target models and applying the results.
//!
//! The pipeline is deliberately split: a [`ParameterIdentificationAgent`]
//! decides *when* to re-estimate and publishes the outcome on
//! `identified_parameters/<model>`, while a [`ModelUpdaterAgent`] decides
//! *which* models receive updates. The two only meet on the bus.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{info, warn};

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};
use crate::errors::SubscriberError;
use crate::physics::{IdentificationData, SharedComponent};

/// One observed series feeding the estimator: the estimator-side key and
/// the bus topic delivering `{value: x}` samples for it.
#[derive(Debug, Clone)]
pub struct DataMapEntry {
    pub key: String,
    pub topic: String,
}

/// Collects per-key sample histories and, every `identification_interval`
/// new samples, truncates all series to a common length and calls
/// `identify_parameters` on the target model. Successful estimates are
/// published for a model updater to apply.
pub struct ParameterIdentificationAgent {
    agent_id: String,
    target_model: SharedComponent,
    bus: Rc<MessageBus>,
    identification_interval: usize,
    data_keys: Vec<String>,
    data_history: Rc<RefCell<BTreeMap<String, Vec<f64>>>>,
    // Counts samples of the first configured stream only, keeping the
    // trigger aligned across streams.
    new_data_count: Rc<Cell<usize>>,
}

impl ParameterIdentificationAgent {
    pub fn new(
        agent_id: &str,
        target_model: SharedComponent,
        bus: Rc<MessageBus>,
        identification_interval: usize,
        data_map: &[DataMapEntry],
    ) -> Self {
        let data_history: Rc<RefCell<BTreeMap<String, Vec<f64>>>> = Rc::new(RefCell::new(
            data_map
                .iter()
                .map(|entry| (entry.key.clone(), Vec::new()))
                .collect(),
        ));
        let new_data_count = Rc::new(Cell::new(0));

        for (index, entry) in data_map.iter().enumerate() {
            let history = Rc::clone(&data_history);
            let counter = Rc::clone(&new_data_count);
            let key = entry.key.clone();
            let is_reference_stream = index == 0;
            bus.subscribe(&entry.topic, move |message: &Message| {
                if let Some(value) = message.scalar("value") {
                    history
                        .borrow_mut()
                        .entry(key.clone())
                        .or_default()
                        .push(value);
                    if is_reference_stream {
                        counter.set(counter.get() + 1);
                    }
                }
                Ok(())
            });
            info!(
                "[{agent_id}] subscribed to '{}' for data key '{}'",
                entry.topic, entry.key
            );
        }

        ParameterIdentificationAgent {
            agent_id: agent_id.to_string(),
            target_model,
            bus,
            identification_interval,
            data_keys: data_map.iter().map(|entry| entry.key.clone()).collect(),
            data_history,
            new_data_count,
        }
    }

    fn clear_history(&self) {
        let mut history = self.data_history.borrow_mut();
        for key in &self.data_keys {
            history.insert(key.clone(), Vec::new());
        }
        self.new_data_count.set(0);
    }

    fn try_identify(&self, current_time: f64) {
        // All histories are truncated to the shortest so the estimator
        // sees aligned series.
        let data: IdentificationData = {
            let history = self.data_history.borrow();
            let min_len = history.values().map(Vec::len).min().unwrap_or(0);
            if min_len < 1 {
                warn!(
                    "[{}] not enough aligned data to identify (min_len = {min_len}), skipping",
                    self.agent_id
                );
                self.clear_history();
                return;
            }
            history
                .iter()
                .map(|(key, values)| (key.clone(), values[..min_len].to_vec()))
                .collect()
        };

        info!(
            "[{} at {current_time}s] triggering parameter identification",
            self.agent_id
        );

        // The model borrow must end before publishing: an updater agent
        // may immediately borrow the same model mutably.
        let (model_name, outcome) = {
            let model = self.target_model.borrow();
            (model.id().to_string(), model.identify_parameters(&data))
        };

        match outcome {
            Ok(parameters) => {
                let topic = format!("identified_parameters/{model_name}");
                let message = Message::from_sender(&self.agent_id)
                    .with_text("model_name", &model_name)
                    .with_params("parameters", parameters);
                self.bus.publish(&topic, &message);
                info!("[{}] published new parameters for '{model_name}'", self.agent_id);
            }
            Err(err) => {
                warn!(
                    "[{}] identification for '{model_name}' did not produce parameters: {err}",
                    self.agent_id
                );
            }
        }

        self.clear_history();
    }
}

impl Agent for ParameterIdentificationAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, current_time: f64) {
        if self.new_data_count.get() >= self.identification_interval {
            self.try_identify(current_time);
        }
    }
}

/// Applies published parameter estimates to the models it manages.
pub struct ModelUpdaterAgent {
    agent_id: String,
}

impl ModelUpdaterAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        parameter_topic: &str,
        models: BTreeMap<String, SharedComponent>,
    ) -> Self {
        {
            let id = agent_id.to_string();
            bus.subscribe(parameter_topic, move |message: &Message| {
                let Some(model_name) = message.text("model_name") else {
                    return Ok(());
                };
                let Some(parameters) = message.params("parameters") else {
                    return Ok(());
                };
                let Some(model) = models.get(model_name) else {
                    // Not one of ours; another updater may manage it.
                    return Ok(());
                };
                model
                    .borrow_mut()
                    .set_parameters(parameters)
                    .map_err(|err| {
                        SubscriberError(format!(
                            "[{id}] failed to apply parameters to '{model_name}': {err}"
                        ))
                    })?;
                info!("[{id}] applied new parameters to '{model_name}'");
                Ok(())
            });
        }
        info!("model updater '{agent_id}' listening on '{parameter_topic}'");
        ModelUpdaterAgent {
            agent_id: agent_id.to_string(),
        }
    }
}

impl Agent for ModelUpdaterAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, _current_time: f64) {
        // Event-driven: updates are applied inside the bus callback.
    }
}
