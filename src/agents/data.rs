//! Data access agents: driving a simulation with recorded time series.

use std::path::Path;
use std::rc::Rc;

use log::{error, info};

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};

/// Replays a time/value CSV column onto the bus as `{inflow_rate: x}`.
///
/// The file needs a header row with a time column and a data column; times
/// must be monotonically increasing. Between samples the agent holds the
/// last known value (zero-order hold) and it emits nothing before the
/// first sample. A missing or malformed file is logged once and turns the
/// agent into a no-op for the rest of the run.
pub struct CsvInflowAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    inflow_topic: String,
    samples: Vec<(f64, f64)>,
}

impl CsvInflowAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        csv_path: &Path,
        time_column: &str,
        data_column: &str,
        inflow_topic: &str,
    ) -> Self {
        let samples = match read_samples(csv_path, time_column, data_column) {
            Ok(samples) => {
                info!(
                    "csv inflow agent '{agent_id}' loaded {} samples from '{}'",
                    samples.len(),
                    csv_path.display()
                );
                samples
            }
            Err(err) => {
                error!(
                    "csv inflow agent '{agent_id}' disabled: could not load '{}': {err}",
                    csv_path.display()
                );
                Vec::new()
            }
        };

        CsvInflowAgent {
            agent_id: agent_id.to_string(),
            bus,
            inflow_topic: inflow_topic.to_string(),
            samples,
        }
    }

    /// Last sample at or before `current_time`, if any.
    fn value_at(&self, current_time: f64) -> Option<f64> {
        let upper = self.samples.partition_point(|(t, _)| *t <= current_time);
        if upper == 0 {
            return None;
        }
        Some(self.samples[upper - 1].1)
    }
}

fn read_samples(
    path: &Path,
    time_column: &str,
    data_column: &str,
) -> Result<Vec<(f64, f64)>, String> {
    let mut reader = csv::Reader::from_path(path).map_err(|err| err.to_string())?;

    let headers = reader.headers().map_err(|err| err.to_string())?.clone();
    let time_index = headers
        .iter()
        .position(|h| h == time_column)
        .ok_or_else(|| format!("missing time column '{time_column}'"))?;
    let data_index = headers
        .iter()
        .position(|h| h == data_column)
        .ok_or_else(|| format!("missing data column '{data_column}'"))?;

    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| err.to_string())?;
        let time: f64 = record
            .get(time_index)
            .ok_or("short record")?
            .parse()
            .map_err(|_| "non-numeric time value".to_string())?;
        let value: f64 = record
            .get(data_index)
            .ok_or("short record")?
            .parse()
            .map_err(|_| "non-numeric data value".to_string())?;

        if let Some((last_time, _)) = samples.last() {
            if time <= *last_time {
                return Err(format!("time column is not increasing at t = {time}"));
            }
        }
        samples.push((time, value));
    }
    Ok(samples)
}

impl Agent for CsvInflowAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, current_time: f64) {
        if self.samples.is_empty() {
            return;
        }
        if let Some(value) = self.value_at(current_time) {
            self.bus.publish(
                &self.inflow_topic,
                &Message::from_sender(&self.agent_id).with_scalar("inflow_rate", value),
            );
        }
    }
}
