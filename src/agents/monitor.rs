//! Central monitoring agents: anomaly detection and demand forecasting.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info};

use crate::agents::Agent;
use crate::bus::{Message, MessageBus};

/// Watches a set of state topics and raises one-shot alerts on anomalous
/// patterns.
///
/// The built-in rule flags a pump reporting `status == 1` while its
/// `outflow` sits below the configured threshold. An alert fires once and
/// stays latched until the condition clears, after which it may fire
/// again.
pub struct CentralAnomalyDetectionAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    alert_topic: String,
    outflow_threshold: f64,
    latest_data: Rc<RefCell<BTreeMap<String, Message>>>,
    active_alerts: BTreeMap<String, ()>,
}

impl CentralAnomalyDetectionAgent {
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        topics_to_monitor: &[String],
        alert_topic: &str,
        outflow_threshold: f64,
    ) -> Self {
        let latest_data = Rc::new(RefCell::new(BTreeMap::new()));
        for topic in topics_to_monitor {
            let cell = Rc::clone(&latest_data);
            let name = topic.clone();
            bus.subscribe(topic, move |message: &Message| {
                cell.borrow_mut().insert(name.clone(), message.clone());
                Ok(())
            });
        }
        info!(
            "anomaly detection agent '{agent_id}' monitoring {} topics",
            topics_to_monitor.len()
        );
        CentralAnomalyDetectionAgent {
            agent_id: agent_id.to_string(),
            bus,
            alert_topic: alert_topic.to_string(),
            outflow_threshold,
            latest_data,
            active_alerts: BTreeMap::new(),
        }
    }

    fn detect_anomalies(&mut self, current_time: f64) {
        let snapshot = self.latest_data.borrow().clone();
        for (topic, data) in &snapshot {
            let (Some(status), Some(outflow)) = (data.scalar("status"), data.scalar("outflow"))
            else {
                continue;
            };

            let alert_key = format!("{topic}_no_flow");
            let anomalous = status == 1.0 && outflow < self.outflow_threshold;

            if anomalous {
                if !self.active_alerts.contains_key(&alert_key) {
                    let alert = Message::from_sender(&self.agent_id)
                        .with_scalar("timestamp", current_time)
                        .with_text("anomaly_type", "PUMP_NO_FLOW")
                        .with_text("source_topic", topic)
                        .with_text(
                            "details",
                            &format!(
                                "pump is active but outflow {outflow:.4} is below threshold {:.4}",
                                self.outflow_threshold
                            ),
                        );
                    self.bus.publish(&self.alert_topic, &alert);
                    self.active_alerts.insert(alert_key, ());
                    info!("[{}] new anomaly on '{topic}'", self.agent_id);
                }
            } else if self.active_alerts.remove(&alert_key).is_some() {
                info!("[{}] anomaly cleared on '{topic}'", self.agent_id);
            }
        }
    }
}

impl Agent for CentralAnomalyDetectionAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, current_time: f64) {
        self.detect_anomalies(current_time);
    }
}

/// Forecasts demand with a bounded moving-average window.
///
/// Demand samples arrive on the historical data topic. On every interval
/// boundary, once the window has filled, the agent publishes a flat
/// forecast of the window mean over the configured horizon.
pub struct DemandForecastingAgent {
    agent_id: String,
    bus: Rc<MessageBus>,
    forecast_topic: String,
    forecast_interval: f64,
    window_size: usize,
    forecast_horizon: usize,
    demand_history: Rc<RefCell<Vec<f64>>>,
}

impl DemandForecastingAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: &str,
        bus: Rc<MessageBus>,
        historical_data_topic: &str,
        forecast_topic: &str,
        forecast_interval_seconds: f64,
        window_size: usize,
        forecast_horizon: usize,
        max_history: usize,
    ) -> Self {
        let demand_history: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let history = Rc::clone(&demand_history);
            bus.subscribe(historical_data_topic, move |message: &Message| {
                if let Some(demand) = message.scalar("demand") {
                    let mut history = history.borrow_mut();
                    history.push(demand);
                    if history.len() > max_history {
                        history.remove(0);
                    }
                }
                Ok(())
            });
        }
        info!("demand forecasting agent '{agent_id}' subscribed to '{historical_data_topic}'");
        DemandForecastingAgent {
            agent_id: agent_id.to_string(),
            bus,
            forecast_topic: forecast_topic.to_string(),
            forecast_interval: forecast_interval_seconds,
            window_size,
            forecast_horizon,
            demand_history,
        }
    }

    fn generate_forecast(&self, current_time: f64) {
        let history = self.demand_history.borrow();
        if history.len() < self.window_size {
            debug!(
                "[{}] not enough data to forecast (have {}, need {})",
                self.agent_id,
                history.len(),
                self.window_size
            );
            return;
        }

        let window = &history[history.len() - self.window_size..];
        let predicted = window.iter().sum::<f64>() / window.len() as f64;

        let forecast = Message::from_sender(&self.agent_id)
            .with_scalar("start_time", current_time)
            .with_scalar("horizon_steps", self.forecast_horizon as f64)
            .with_series("demands", vec![predicted; self.forecast_horizon])
            .with_text("model_type", "MovingAverage")
            .with_text(
                "details",
                &format!("moving average over last {} samples", self.window_size),
            );
        self.bus.publish(&self.forecast_topic, &forecast);
    }
}

impl Agent for DemandForecastingAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn run(&mut self, current_time: f64) {
        let interval = self.forecast_interval.max(1.0);
        if current_time > 0.0 && (current_time as u64) % (interval as u64) == 0 {
            self.generate_forecast(current_time);
        }
    }
}
