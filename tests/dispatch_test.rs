//! Supervisory-layer scenarios: hysteresis dispatch, emergency override,
//! anomaly alerting, demand forecasting and MPC setpoint generation.

use std::cell::RefCell;
use std::rc::Rc;

use waternet_lib::agents::dispatch::{
    CentralDispatcherAgent, EmergencyConfig, MpcConfig, RuleConfig,
};
use waternet_lib::agents::monitor::{CentralAnomalyDetectionAgent, DemandForecastingAgent};
use waternet_lib::agents::Agent;
use waternet_lib::bus::{Message, MessageBus};
use waternet_lib::physics::reservoir::Reservoir;
use waternet_lib::physics::{Parameters, ParamValue, SharedComponent, State};

fn capture(bus: &MessageBus, topic: &str) -> Rc<RefCell<Vec<Message>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    bus.subscribe(topic, move |message| {
        sink.borrow_mut().push(message.clone());
        Ok(())
    });
    log
}

#[test]
fn rule_dispatcher_hysteresis_issues_setpoints_only_outside_the_band() {
    let bus = MessageBus::new();
    let commands = capture(&bus, "command.canal.setpoint");

    let mut dispatcher = CentralDispatcherAgent::new_rule(
        "dispatcher_1",
        Rc::clone(&bus),
        RuleConfig {
            subscribed_topic: "state.canal".to_string(),
            observation_key: "water_level".to_string(),
            low_level: 10.0,
            high_level: 20.0,
            low_setpoint: 12.0,
            high_setpoint: 18.0,
            command_topic: "command.canal.setpoint".to_string(),
        },
    );

    // Below the band: raise the setpoint.
    bus.publish("state.canal", &Message::new().with_scalar("water_level", 5.0));
    dispatcher.run(0.0);
    assert_eq!(commands.borrow().len(), 1);
    assert_eq!(commands.borrow()[0].scalar("new_setpoint"), Some(18.0));

    // Above the band: lower it.
    bus.publish("state.canal", &Message::new().with_scalar("water_level", 25.0));
    dispatcher.run(1.0);
    assert_eq!(commands.borrow().len(), 2);
    assert_eq!(commands.borrow()[1].scalar("new_setpoint"), Some(12.0));

    // Inside the band: stay quiet.
    bus.publish("state.canal", &Message::new().with_scalar("water_level", 15.0));
    dispatcher.run(2.0);
    assert_eq!(commands.borrow().len(), 2);
}

#[test]
fn rule_dispatcher_stays_silent_before_the_first_observation() {
    let bus = MessageBus::new();
    let commands = capture(&bus, "command.canal.setpoint");

    let mut dispatcher = CentralDispatcherAgent::new_rule(
        "dispatcher_1",
        Rc::clone(&bus),
        RuleConfig {
            subscribed_topic: "state.canal".to_string(),
            observation_key: "water_level".to_string(),
            low_level: 10.0,
            high_level: 20.0,
            low_setpoint: 12.0,
            high_setpoint: 18.0,
            command_topic: "command.canal.setpoint".to_string(),
        },
    );

    dispatcher.run(0.0);
    assert!(commands.borrow().is_empty());
}

#[test]
fn emergency_dispatcher_forces_the_gate_closed_every_tick_above_flood_level() {
    let bus = MessageBus::new();
    let overrides = capture(&bus, "action.supply_gate");

    // Linear curve up to 40 m; 36e6 m^3 puts the level at 24 m.
    let reservoir: SharedComponent = Rc::new(RefCell::new(
        Reservoir::new(
            "res_1",
            &State::from([("volume".to_string(), 36e6)]),
            &Parameters::from([(
                "storage_curve".to_string(),
                ParamValue::Curve(vec![(0.0, 0.0), (60e6, 40.0)]),
            )]),
        )
        .unwrap(),
    ));

    let mut dispatcher = CentralDispatcherAgent::new_emergency(
        "guardian",
        Rc::clone(&bus),
        EmergencyConfig {
            reservoir,
            emergency_flood_level: 20.0,
            command_topic: "action.supply_gate".to_string(),
        },
    );

    for tick in 0..3 {
        dispatcher.run(tick as f64);
    }

    // The override repeats while the condition holds.
    let overrides = overrides.borrow();
    assert_eq!(overrides.len(), 3);
    for message in overrides.iter() {
        assert_eq!(message.scalar("control_signal"), Some(0.0));
    }
}

#[test]
fn anomaly_alert_is_one_shot_until_the_condition_clears() {
    let bus = MessageBus::new();
    let alerts = capture(&bus, "alerts");

    let topics = vec!["state.pump_1".to_string()];
    let mut agent = CentralAnomalyDetectionAgent::new(
        "watchdog",
        Rc::clone(&bus),
        &topics,
        "alerts",
        0.01,
    );

    let stuck = Message::new()
        .with_scalar("status", 1.0)
        .with_scalar("outflow", 0.0);

    bus.publish("state.pump_1", &stuck);
    agent.run(0.0);
    assert_eq!(alerts.borrow().len(), 1);
    assert_eq!(alerts.borrow()[0].text("anomaly_type"), Some("PUMP_NO_FLOW"));
    assert_eq!(alerts.borrow()[0].text("source_topic"), Some("state.pump_1"));

    // Same anomalous reading again: no duplicate alert.
    bus.publish("state.pump_1", &stuck);
    agent.run(1.0);
    assert_eq!(alerts.borrow().len(), 1);

    // Healthy reading clears the latch.
    bus.publish(
        "state.pump_1",
        &Message::new()
            .with_scalar("status", 1.0)
            .with_scalar("outflow", 0.5),
    );
    agent.run(2.0);
    assert_eq!(alerts.borrow().len(), 1);

    // The next failure fires again.
    bus.publish("state.pump_1", &stuck);
    agent.run(3.0);
    assert_eq!(alerts.borrow().len(), 2);
}

#[test]
fn demand_forecast_waits_for_a_full_window_then_publishes_the_mean() {
    let bus = MessageBus::new();
    let forecasts = capture(&bus, "forecast.demand");

    let mut agent = DemandForecastingAgent::new(
        "forecaster",
        Rc::clone(&bus),
        "demand.history",
        "forecast.demand",
        100.0, // forecast every 100 s
        4,     // window
        6,     // horizon
        50,
    );

    // Two samples only: below the window size, no forecast yet.
    for value in [10.0, 20.0] {
        bus.publish("demand.history", &Message::new().with_scalar("demand", value));
    }
    agent.run(100.0);
    assert!(forecasts.borrow().is_empty());

    // Fill the window; mean of the last 4 samples is 25.
    for value in [20.0, 30.0, 30.0] {
        bus.publish("demand.history", &Message::new().with_scalar("demand", value));
    }
    agent.run(200.0);

    let forecasts = forecasts.borrow();
    assert_eq!(forecasts.len(), 1);
    let series = forecasts[0].series("demands").unwrap();
    assert_eq!(series.len(), 6);
    for value in series {
        assert!((value - 25.0).abs() < 1e-9);
    }
    assert_eq!(forecasts[0].text("model_type"), Some("MovingAverage"));
}

#[test]
fn demand_forecast_fires_only_on_interval_boundaries() {
    let bus = MessageBus::new();
    let forecasts = capture(&bus, "forecast.demand");

    let mut agent = DemandForecastingAgent::new(
        "forecaster",
        Rc::clone(&bus),
        "demand.history",
        "forecast.demand",
        100.0,
        1,
        2,
        50,
    );
    bus.publish("demand.history", &Message::new().with_scalar("demand", 5.0));

    agent.run(0.0); // t = 0 is excluded
    agent.run(50.0); // not a boundary
    agent.run(100.0); // boundary
    agent.run(150.0); // not a boundary
    assert_eq!(forecasts.borrow().len(), 1);
}

fn mpc_dispatcher(bus: &Rc<MessageBus>) -> CentralDispatcherAgent {
    CentralDispatcherAgent::new_mpc(
        "mpc_1",
        Rc::clone(bus),
        MpcConfig {
            prediction_horizon: 3,
            dt: 60.0,
            q_weight: 1.0,
            r_weight: 0.1,
            state_keys: vec!["upstream".to_string(), "downstream".to_string()],
            state_subscriptions: vec![
                ("upstream".to_string(), "state.canal_up".to_string()),
                ("downstream".to_string(), "state.canal_down".to_string()),
            ],
            forecast_subscription: "forecast.inflow".to_string(),
            command_topics: vec![
                "command.canal_up.setpoint".to_string(),
                "command.canal_down.setpoint".to_string(),
            ],
            normal_setpoints: vec![5.0, 5.0],
            emergency_setpoint: 4.0,
            flood_thresholds: vec![10.0, 10.0],
            canal_surface_areas: vec![50_000.0, 50_000.0],
            outflow_coefficient: 50.0,
        },
    )
}

#[test]
fn mpc_waits_until_every_pool_has_reported() {
    let bus = MessageBus::new();
    let up_commands = capture(&bus, "command.canal_up.setpoint");

    let mut dispatcher = mpc_dispatcher(&bus);
    bus.publish("state.canal_up", &Message::new().with_scalar("water_level", 5.0));
    dispatcher.run(0.0);
    assert!(up_commands.borrow().is_empty());
}

#[test]
fn mpc_publishes_the_first_step_of_the_optimal_sequence_within_bounds() {
    let bus = MessageBus::new();
    let up_commands = capture(&bus, "command.canal_up.setpoint");
    let down_commands = capture(&bus, "command.canal_down.setpoint");

    let mut dispatcher = mpc_dispatcher(&bus);
    bus.publish("state.canal_up", &Message::new().with_scalar("water_level", 4.9));
    bus.publish("state.canal_down", &Message::new().with_scalar("water_level", 5.1));
    dispatcher.run(0.0);

    let up = up_commands.borrow();
    let down = down_commands.borrow();
    assert_eq!(up.len(), 1);
    assert_eq!(down.len(), 1);

    for message in up.iter().chain(down.iter()) {
        let setpoint = message.scalar("new_setpoint").unwrap();
        assert!((2.0..=6.0).contains(&setpoint), "setpoint {setpoint} out of bounds");
        // No flood pressure and no forecast: the optimum tracks the
        // normal setpoints.
        assert!((setpoint - 5.0).abs() < 0.5);
    }
}

#[test]
fn mpc_switches_to_the_emergency_setpoint_when_the_forecast_predicts_inflow() {
    let bus = MessageBus::new();
    let up_commands = capture(&bus, "command.canal_up.setpoint");

    let mut dispatcher = mpc_dispatcher(&bus);
    bus.publish("state.canal_up", &Message::new().with_scalar("water_level", 5.0));
    bus.publish("state.canal_down", &Message::new().with_scalar("water_level", 5.0));
    bus.publish(
        "forecast.inflow",
        &Message::new().with_series("inflow_forecast", vec![30.0, 30.0, 30.0]),
    );
    dispatcher.run(0.0);

    let up = up_commands.borrow();
    assert_eq!(up.len(), 1);
    let setpoint = up[0].scalar("new_setpoint").unwrap();
    assert!(
        (setpoint - 4.0).abs() < 0.5,
        "expected the emergency target, got {setpoint}"
    );
}
