//! # Message Bus - Topic-Keyed Synchronous Pub/Sub
//!
//! The bus decouples agents from physical components inside a single
//! simulation run. Topics are opaque string keys; messages are envelopes
//! carrying an optional sender id plus a map of convention-named fields.
//!
//! Delivery is strictly synchronous: `publish` invokes every subscriber of
//! the topic, in subscription order, on the calling thread, before it
//! returns. Publishes may nest (a subscriber reacting to a state update may
//! immediately publish an actuator command); a depth cap guards against a
//! subscriber that republishes into its own topic.
//!
//! A subscriber that fails does not stop delivery. Its error is logged and
//! the remaining subscribers of the same publish still run.


use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::errors::SubscriberError;
use crate::physics::{Parameters, State};

/// Nested publishes beyond this depth are dropped with an error log.
const MAX_PUBLISH_DEPTH: usize = 32;

/// A single field of a message. Agents agree on field names by convention
/// (`control_signal`, `new_setpoint`, `inflow_rate`, `value`, ...); the bus
/// itself never inspects them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(f64),
    Text(String),
    Series(Vec<f64>),
    Params(Parameters),
}

/// An ephemeral message: an envelope with an optional sender id and a map
/// of named fields. Messages are not retained by the bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    sender: Option<String>,
    fields: BTreeMap<String, FieldValue>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty message stamped with the given sender id.
    pub fn from_sender(sender: &str) -> Self {
        Message {
            sender: Some(sender.to_string()),
            fields: BTreeMap::new(),
        }
    }

    /// Builds a message from a full component state map, one scalar field
    /// per state variable.
    pub fn from_state(sender: &str, state: &State) -> Self {
        let mut message = Message::from_sender(sender);
        for (key, value) in state {
            message.set_scalar(key, *value);
        }
        message
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn with_scalar(mut self, key: &str, value: f64) -> Self {
        self.set_scalar(key, value);
        self
    }

    pub fn with_text(mut self, key: &str, value: &str) -> Self {
        self.fields
            .insert(key.to_string(), FieldValue::Text(value.to_string()));
        self
    }

    pub fn with_series(mut self, key: &str, values: Vec<f64>) -> Self {
        self.fields.insert(key.to_string(), FieldValue::Series(values));
        self
    }

    pub fn with_params(mut self, key: &str, params: Parameters) -> Self {
        self.fields.insert(key.to_string(), FieldValue::Params(params));
        self
    }

    pub fn set_scalar(&mut self, key: &str, value: f64) {
        self.fields.insert(key.to_string(), FieldValue::Scalar(value));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn scalar(&self, key: &str) -> Option<f64> {
        match self.fields.get(key) {
            Some(FieldValue::Scalar(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn series(&self, key: &str) -> Option<&[f64]> {
        match self.fields.get(key) {
            Some(FieldValue::Series(values)) => Some(values.as_slice()),
            _ => None,
        }
    }

    pub fn params(&self, key: &str) -> Option<&Parameters> {
        match self.fields.get(key) {
            Some(FieldValue::Params(params)) => Some(params),
            _ => None,
        }
    }

    /// Iterates over all scalar fields, skipping text/series/params values.
    pub fn scalar_fields(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields.iter().filter_map(|(key, value)| match value {
            FieldValue::Scalar(v) => Some((key.as_str(), *v)),
            _ => None,
        })
    }

    /// Collapses the scalar fields into a component-style state map.
    pub fn to_state(&self) -> State {
        self.scalar_fields()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

type Subscriber = Rc<dyn Fn(&Message) -> Result<(), SubscriberError>>;

/// Handle identifying one subscription, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    callback: Subscriber,
}

/// One-to-many synchronous message dispatch within a single process.
///
/// The registry lives behind a `RefCell` so that subscribers may register
/// further callbacks while a delivery is in flight; `publish` iterates over
/// a snapshot of the subscriber list captured at entry, so registrations
/// and removals only affect future publishes.
#[derive(Default)]
pub struct MessageBus {
    topics: RefCell<HashMap<String, Vec<Registration>>>,
    next_id: Cell<u64>,
    depth: Cell<usize>,
}

impl MessageBus {
    pub fn new() -> Rc<Self> {
        Rc::new(MessageBus::default())
    }

    /// Registers a callback for a topic. Multiple callbacks per topic are
    /// permitted and fire in subscription order. The returned handle can
    /// be passed to [`MessageBus::unsubscribe`].
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) -> Result<(), SubscriberError> + 'static,
    {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.topics
            .borrow_mut()
            .entry(topic.to_string())
            .or_default()
            .push(Registration {
                id,
                callback: Rc::new(callback),
            });
        id
    }

    /// Removes a previously registered callback. Returns whether the
    /// subscription was still present.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.borrow_mut();
        let Some(registrations) = topics.get_mut(topic) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    /// Delivers `message` to every current subscriber of `topic` before
    /// returning. Publishing on a topic without subscribers is a silent
    /// no-op.
    pub fn publish(&self, topic: &str, message: &Message) {
        let depth = self.depth.get();
        if depth >= MAX_PUBLISH_DEPTH {
            error!(
                "publish depth cap ({MAX_PUBLISH_DEPTH}) reached on topic '{topic}'; message dropped"
            );
            return;
        }

        // Snapshot under a short borrow so that callbacks are free to
        // subscribe or publish while we iterate.
        let subscribers: Vec<Subscriber> = match self.topics.borrow().get(topic) {
            Some(list) => list.iter().map(|r| Rc::clone(&r.callback)).collect(),
            None => return,
        };

        self.depth.set(depth + 1);
        for subscriber in &subscribers {
            if let Err(err) = subscriber(message) {
                warn!("subscriber on topic '{topic}' failed: {err}");
            }
        }
        self.depth.set(depth);
    }

    /// Number of callbacks currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.borrow().get(topic).map_or(0, Vec::len)
    }
}
