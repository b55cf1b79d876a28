//! End-to-end tests of the closed loop: physical network, digital twins,
//! local control and the harness tick cycle working together.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use waternet_lib::agents::control::{ControlWiring, LocalControlAgent};
use waternet_lib::agents::perception::DigitalTwinAgent;
use waternet_lib::agents::pid::PidController;
use waternet_lib::bus::MessageBus;
use waternet_lib::harness::{SimulationConfig, SimulationHarness};
use waternet_lib::physics::canal::UnifiedCanal;
use waternet_lib::physics::gate::Gate;
use waternet_lib::physics::reservoir::Reservoir;
use waternet_lib::physics::{Parameters, ParamValue, PhysicalComponent, SharedComponent, State};

/// Reservoir feeding a controlled gate which spills into a canal. The PID
/// holds the reservoir level by throttling the gate.
fn build_controlled_network() -> (SimulationHarness, Rc<RefCell<Gate>>) {
    let bus = MessageBus::new();
    let mut harness = SimulationHarness::new(
        SimulationConfig {
            duration: 600.0,
            time_step: 10.0,
        },
        Rc::clone(&bus),
    );

    let reservoir: SharedComponent = Rc::new(RefCell::new(
        Reservoir::new(
            "res_1",
            &State::from([("volume".to_string(), 21e6), ("outflow".to_string(), 0.0)]),
            &Parameters::from([(
                "storage_curve".to_string(),
                ParamValue::Curve(vec![(0.0, 0.0), (60e6, 40.0)]),
            )]),
        )
        .unwrap(),
    ));

    let gate = Rc::new(RefCell::new(Gate::new(
        "gate_1",
        &State::from([("opening".to_string(), 0.1)]),
        &Parameters::from([
            ("discharge_coefficient".to_string(), ParamValue::Scalar(0.6)),
            ("width".to_string(), ParamValue::Scalar(2.0)),
            ("max_opening".to_string(), ParamValue::Scalar(1.0)),
            ("max_rate_of_change".to_string(), ParamValue::Scalar(0.02)),
        ]),
    )));

    let canal: SharedComponent = Rc::new(RefCell::new(
        UnifiedCanal::new(
            "canal_1",
            &State::from([("water_level".to_string(), 2.0)]),
            &Parameters::from([
                ("model_type".to_string(), ParamValue::Text("integral".to_string())),
                ("surface_area".to_string(), ParamValue::Scalar(50_000.0)),
                ("outlet_coefficient".to_string(), ParamValue::Scalar(8.0)),
            ]),
        )
        .unwrap(),
    ));

    // Gate reacts to bus commands.
    {
        let target = gate.clone();
        bus.subscribe("action.gate_1", move |message| {
            target.borrow_mut().handle_message(message);
            Ok(())
        });
    }

    harness.add_component(reservoir.clone()).unwrap();
    harness.add_component(gate.clone()).unwrap();
    harness.add_component(canal).unwrap();
    harness.add_connection("res_1", "gate_1").unwrap();
    harness.add_connection("gate_1", "canal_1").unwrap();

    harness.add_agent(Box::new(DigitalTwinAgent::new(
        "twin_res",
        reservoir,
        Rc::clone(&bus),
        "perception.res_1",
        BTreeMap::new(),
    )));

    // Above-setpoint level opens the gate (negative gain).
    harness.add_agent(Box::new(LocalControlAgent::new(
        "gate_pid",
        Box::new(PidController::new(-0.5, -0.0001, 0.0, 13.0, 0.0, 1.0)),
        Rc::clone(&bus),
        ControlWiring {
            observation_topic: "perception.res_1".to_string(),
            observation_key: Some("water_level".to_string()),
            action_topic: Some("action.gate_1".to_string()),
            ..ControlWiring::default()
        },
        10.0,
    )));

    harness.build().unwrap();
    (harness, gate)
}

#[test]
fn controlled_network_preserves_physical_invariants_every_tick() {
    let (mut harness, _gate) = build_controlled_network();
    harness.run().unwrap();

    let history = harness.history();
    assert_eq!(history.len(), 60);

    let mut previous_opening: Option<f64> = None;
    for snapshot in history {
        let reservoir = &snapshot.states["res_1"];
        let gate = &snapshot.states["gate_1"];
        let canal = &snapshot.states["canal_1"];

        // Reservoir: non-negative storage, level consistent with the
        // linear storage curve.
        assert!(reservoir["volume"] >= 0.0);
        assert!((reservoir["water_level"] - reservoir["volume"] / 1.5e6).abs() < 1e-6);

        // Gate: opening inside [0, max] and rate-limited between ticks.
        assert!((0.0..=1.0).contains(&gate["opening"]));
        if let Some(previous) = previous_opening {
            assert!(
                (gate["opening"] - previous).abs() <= 0.02 * 10.0 + 1e-9,
                "gate moved faster than its rate limit"
            );
        }
        previous_opening = Some(gate["opening"]);

        // Canal: level never negative.
        assert!(canal["water_level"] >= 0.0);
    }
}

#[test]
fn inflow_matches_upstream_outflow_of_the_previous_tick() {
    let (mut harness, _gate) = build_controlled_network();
    harness.run().unwrap();

    let history = harness.history();
    for pair in history.windows(2) {
        let gate_outflow_previous = pair[0].states["gate_1"]["outflow"];
        let canal_inflow = pair[1].states["canal_1"]["inflow"];
        assert!(
            (canal_inflow - gate_outflow_previous).abs() < 1e-9,
            "canal inflow {canal_inflow} != previous gate outflow {gate_outflow_previous}"
        );
    }
}

#[test]
fn event_driven_control_moves_the_gate_during_the_run() {
    let (mut harness, gate) = build_controlled_network();
    harness.run().unwrap();

    // The reservoir starts at 14 m, above the 13 m setpoint; the loop must
    // have opened the gate beyond its initial 0.1.
    let opening = gate.borrow().state()["opening"];
    assert!(opening > 0.1, "control loop never acted: opening {opening}");
}
