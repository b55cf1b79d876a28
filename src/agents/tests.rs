#[cfg(test)]
mod units {
    use crate::agents::control::{
        ControlOutput, ControlWiring, Controller, JointPidController, LocalControlAgent, StepAgent,
    };
    use crate::agents::data::CsvInflowAgent;
    use crate::agents::identification::{
        DataMapEntry, ModelUpdaterAgent, ParameterIdentificationAgent,
    };
    use crate::agents::perception::DigitalTwinAgent;
    use crate::agents::pid::PidController;
    use crate::agents::utility::{
        ActuatorSpec, ConstantValueAgent, PhysicalIoAgent, SensorSpec, SignalAggregatorAgent,
    };
    use crate::agents::Agent;
    use crate::bus::{Message, MessageBus};
    use crate::physics::valve::Valve;
    use crate::physics::{
        scalar_param, Parameters, ParamValue, PhysicalComponent, SharedComponent, State,
    };
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::rc::Rc;

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
    fn pid_converges_on_a_first_order_plant() {
        let mut pid = PidController::new(2.0, 0.1, 0.0, 5.0, -10.0, 10.0);

        // A trivial level plant: the output directly feeds the level rate.
        let mut level = 0.0;
        let dt = 1.0;
        for _ in 0..200 {
            let observation = State::from([("process_variable".to_string(), level)]);
            let output = pid.compute(&observation, dt);
            level += 0.2 * output * dt;
        }
        assert!((level - 5.0).abs() < 0.1, "level settled at {level}");
    }

    #[test]
    fn pid_integral_freezes_while_the_output_saturates() {
        let mut pid = PidController::new(0.0, 1.0, 0.0, 100.0, -1.0, 1.0);
        let observation = State::from([("process_variable".to_string(), 0.0)]);

        // Error of 100 saturates the output immediately.
        for _ in 0..50 {
            assert_eq!(pid.compute(&observation, 1.0), 1.0);
        }

        // Were the integral accumulating, recovery from saturation would
        // take ~100 steps of negative error. With anti-windup, one large
        // reversal is enough to leave the rail.
        let reversed = State::from([("process_variable".to_string(), 200.0)]);
        let output = pid.compute(&reversed, 1.0);
        assert_eq!(output, -1.0);
        let near = State::from([("process_variable".to_string(), 100.0)]);
        let output = pid.compute(&near, 1.0);
        assert!(output.abs() < 1.0, "integral wound up: output {output}");
    }

    #[test]
    fn pid_setpoint_change_resets_the_integral_state() {
        let mut pid = PidController::new(1.0, 0.5, 0.1, 10.0, -100.0, 100.0);
        let observation = State::from([("process_variable".to_string(), 4.0)]);
        pid.compute(&observation, 1.0);
        pid.compute(&observation, 1.0);

        pid.set_setpoint(4.0);
        // Error is now zero and history was cleared: output must be zero.
        assert_eq!(pid.compute(&observation, 1.0), 0.0);
    }

    #[test]
    fn control_agent_extracts_the_observation_key_and_publishes_the_signal() {
        let bus = MessageBus::new();
        let actions = capture(&bus, "action.gate_1");

        let controller = PidController::new(1.0, 0.0, 0.0, 10.0, -100.0, 100.0);
        let _agent = LocalControlAgent::new(
            "ctrl_1",
            Box::new(controller),
            Rc::clone(&bus),
            ControlWiring {
                observation_topic: "state.res_1".to_string(),
                observation_key: Some("water_level".to_string()),
                action_topic: Some("action.gate_1".to_string()),
                ..ControlWiring::default()
            },
            1.0,
        );

        bus.publish("state.res_1", &Message::new().with_scalar("water_level", 4.0));

        let log = actions.borrow();
        assert_eq!(log.len(), 1);
        // Kp = 1, error = 10 - 4.
        assert_eq!(log[0].scalar("control_signal"), Some(6.0));
        assert_eq!(log[0].sender(), Some("ctrl_1"));
    }

    #[test]
    fn control_agent_ignores_messages_missing_the_observation_key() {
        let bus = MessageBus::new();
        let actions = capture(&bus, "action.gate_1");

        let controller = PidController::new(1.0, 0.0, 0.0, 10.0, -100.0, 100.0);
        let _agent = LocalControlAgent::new(
            "ctrl_1",
            Box::new(controller),
            Rc::clone(&bus),
            ControlWiring {
                observation_topic: "state.res_1".to_string(),
                observation_key: Some("water_level".to_string()),
                action_topic: Some("action.gate_1".to_string()),
                ..ControlWiring::default()
            },
            1.0,
        );

        bus.publish("state.res_1", &Message::new().with_scalar("volume", 4.0));
        assert!(actions.borrow().is_empty());
    }

    #[test]
    fn command_topic_updates_the_setpoint_between_observations() {
        let bus = MessageBus::new();
        let actions = capture(&bus, "action.gate_1");

        let controller = PidController::new(1.0, 0.0, 0.0, 10.0, -100.0, 100.0);
        let _agent = LocalControlAgent::new(
            "ctrl_1",
            Box::new(controller),
            Rc::clone(&bus),
            ControlWiring {
                observation_topic: "state.res_1".to_string(),
                observation_key: Some("water_level".to_string()),
                action_topic: Some("action.gate_1".to_string()),
                command_topic: Some("command.res_1.setpoint".to_string()),
                ..ControlWiring::default()
            },
            1.0,
        );

        bus.publish(
            "command.res_1.setpoint",
            &Message::new().with_scalar("new_setpoint", 2.0),
        );
        bus.publish("state.res_1", &Message::new().with_scalar("water_level", 4.0));

        // Error is now 2 - 4 = -2.
        assert_eq!(actions.borrow()[0].scalar("control_signal"), Some(-2.0));
    }

    #[test]
    fn joint_pid_splits_demand_across_pump_and_valve_topics() {
        let bus = MessageBus::new();
        let pump_log = capture(&bus, "action.pump_1");
        let valve_log = capture(&bus, "action.valve_1");

        let joint = JointPidController::new(
            PidController::new(1.0, 0.0, 0.0, 10.0, -50.0, 50.0),
            8.0,
            8.0,
            "action.pump_1",
            "action.valve_1",
        );
        let _agent = LocalControlAgent::new(
            "joint_1",
            Box::new(joint),
            Rc::clone(&bus),
            ControlWiring {
                observation_topic: "state.tank".to_string(),
                observation_key: Some("water_level".to_string()),
                action_topic: None,
                ..ControlWiring::default()
            },
            1.0,
        );

        // Below setpoint: demand positive, pump fills, valve closed.
        bus.publish("state.tank", &Message::new().with_scalar("water_level", 4.0));
        assert_eq!(pump_log.borrow()[0].scalar("control_signal"), Some(6.0));
        assert_eq!(valve_log.borrow()[0].scalar("control_signal"), Some(0.0));

        // Far above setpoint: demand negative and clamped to the limit.
        bus.publish("state.tank", &Message::new().with_scalar("water_level", 30.0));
        assert_eq!(pump_log.borrow()[1].scalar("control_signal"), Some(0.0));
        assert_eq!(valve_log.borrow()[1].scalar("control_signal"), Some(8.0));
    }

    #[test]
    fn step_agent_fires_exactly_once_when_time_is_reached() {
        let bus = MessageBus::new();
        let log = capture(&bus, "action.gate_1");

        let mut agent = StepAgent::new("step_1", Rc::clone(&bus), "action.gate_1", 10.0, 0.75);
        agent.run(0.0);
        agent.run(5.0);
        assert!(log.borrow().is_empty());

        agent.run(10.0);
        agent.run(11.0);
        agent.run(20.0);
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].scalar("control_signal"), Some(0.75));
    }

    #[test]
    fn digital_twin_publishes_full_state_and_per_field_subtopics() {
        let bus = MessageBus::new();
        let valve: SharedComponent = Rc::new(RefCell::new(Valve::new(
            "valve_1",
            &State::from([("opening".to_string(), 40.0)]),
            &Parameters::new(),
        )));

        let full = capture(&bus, "state.valve_1");
        let narrow = capture(&bus, "state.valve_1/opening");

        let mut twin = DigitalTwinAgent::new(
            "twin_1",
            valve,
            Rc::clone(&bus),
            "state.valve_1",
            BTreeMap::new(),
        );
        twin.run(0.0);

        assert_eq!(full.borrow()[0].scalar("opening"), Some(40.0));
        assert_eq!(narrow.borrow()[0].scalar("value"), Some(40.0));
    }

    #[test]
    fn digital_twin_smoothing_follows_the_ema_recurrence() {
        let bus = MessageBus::new();
        let valve_rc = Rc::new(RefCell::new(Valve::new(
            "valve_1",
            &State::from([("opening".to_string(), 10.0)]),
            &Parameters::new(),
        )));
        let shared: SharedComponent = valve_rc.clone();

        let log = capture(&bus, "state.valve_1");
        let mut twin = DigitalTwinAgent::new(
            "twin_1",
            shared,
            Rc::clone(&bus),
            "state.valve_1",
            BTreeMap::from([("opening".to_string(), 0.5)]),
        );

        // First publish initializes the EMA with the raw value.
        twin.run(0.0);
        assert_eq!(log.borrow()[0].scalar("opening"), Some(10.0));

        // Raw jumps to 20: smoothed = 0.5 * 20 + 0.5 * 10 = 15.
        valve_rc
            .borrow_mut()
            .set_state(&State::from([("opening".to_string(), 20.0)]));
        twin.run(1.0);
        assert_eq!(log.borrow()[1].scalar("opening"), Some(15.0));
    }

    #[test]
    fn identification_pipeline_runs_estimator_and_updater_end_to_end() {
        let bus = MessageBus::new();
        let valve_rc = Rc::new(RefCell::new(Valve::new(
            "valve_1",
            &State::new(),
            &Parameters::from([
                ("discharge_coefficient".to_string(), ParamValue::Scalar(0.5)),
                ("diameter".to_string(), ParamValue::Scalar(0.5)),
            ]),
        )));
        let shared: SharedComponent = valve_rc.clone();

        let data_map = vec![
            DataMapEntry {
                key: "openings".to_string(),
                topic: "obs/openings".to_string(),
            },
            DataMapEntry {
                key: "upstream_levels".to_string(),
                topic: "obs/up".to_string(),
            },
            DataMapEntry {
                key: "downstream_levels".to_string(),
                topic: "obs/down".to_string(),
            },
            DataMapEntry {
                key: "observed_flows".to_string(),
                topic: "obs/flows".to_string(),
            },
        ];
        let mut identifier =
            ParameterIdentificationAgent::new("ident_1", shared.clone(), Rc::clone(&bus), 4, &data_map);
        let _updater = ModelUpdaterAgent::new(
            "updater_1",
            Rc::clone(&bus),
            "identified_parameters/valve_1",
            BTreeMap::from([("valve_1".to_string(), shared)]),
        );

        // Feed four aligned samples generated with Cd = 0.7.
        let area = std::f64::consts::PI * 0.25 * 0.25;
        let true_cd = 0.7;
        for i in 0..4 {
            let opening = 50.0 + 10.0 * i as f64;
            let head = 2.0 + i as f64;
            let flow = true_cd * (opening / 100.0) * area * (2.0 * crate::physics::G * head).sqrt();
            bus.publish("obs/openings", &Message::new().with_scalar("value", opening));
            bus.publish("obs/up", &Message::new().with_scalar("value", head));
            bus.publish("obs/down", &Message::new().with_scalar("value", 0.0));
            bus.publish("obs/flows", &Message::new().with_scalar("value", flow));
        }

        identifier.run(100.0);

        let cd = scalar_param(&valve_rc.borrow().parameters(), "discharge_coefficient").unwrap();
        assert!((cd - true_cd).abs() < 1e-9, "updated Cd = {cd}");
    }

    #[test]
    fn identification_waits_for_the_configured_interval() {
        let bus = MessageBus::new();
        let valve_rc = Rc::new(RefCell::new(Valve::new(
            "valve_1",
            &State::new(),
            &Parameters::new(),
        )));
        let shared: SharedComponent = valve_rc.clone();
        let published = capture(&bus, "identified_parameters/valve_1");

        let data_map = vec![DataMapEntry {
            key: "openings".to_string(),
            topic: "obs/openings".to_string(),
        }];
        let mut identifier =
            ParameterIdentificationAgent::new("ident_1", shared, Rc::clone(&bus), 10, &data_map);

        for _ in 0..9 {
            bus.publish("obs/openings", &Message::new().with_scalar("value", 1.0));
        }
        identifier.run(50.0);
        assert!(published.borrow().is_empty());
    }

    #[test]
    fn constant_value_agent_publishes_under_its_configured_key() {
        let bus = MessageBus::new();
        let log = capture(&bus, "inflow/res_1");

        let mut agent =
            ConstantValueAgent::new("const_1", Rc::clone(&bus), "inflow/res_1", "inflow_rate", 12.5);
        agent.run(0.0);
        agent.run(1.0);

        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].scalar("inflow_rate"), Some(12.5));
    }

    #[test]
    fn signal_aggregator_sums_the_latest_value_of_each_input() {
        let bus = MessageBus::new();
        let log = capture(&bus, "combined");

        let inputs = vec!["a".to_string(), "b".to_string()];
        let mut agent = SignalAggregatorAgent::new("agg_1", Rc::clone(&bus), &inputs, "combined");

        bus.publish("a", &Message::new().with_scalar("value", 2.0));
        bus.publish("b", &Message::new().with_scalar("value", 3.0));
        agent.run(0.0);
        assert_eq!(log.borrow()[0].scalar("value"), Some(5.0));

        // A missing update keeps the last received value.
        bus.publish("a", &Message::new().with_scalar("value", 10.0));
        agent.run(1.0);
        assert_eq!(log.borrow()[1].scalar("value"), Some(13.0));
    }

    #[test]
    fn physical_io_actuator_applies_bias_before_the_component_sees_the_command() {
        let bus = MessageBus::new();
        let valve_rc = Rc::new(RefCell::new(Valve::new(
            "valve_1",
            &State::from([("opening".to_string(), 0.0)]),
            &Parameters::new(),
        )));
        let shared: SharedComponent = valve_rc.clone();

        let _io = PhysicalIoAgent::new(
            "io_1",
            Rc::clone(&bus),
            Vec::new(),
            vec![ActuatorSpec {
                component: shared,
                topic: "action.valve_1".to_string(),
                control_key: "control_signal".to_string(),
                bias: 0.5,
                noise_std: 0.0,
                log_topic: None,
            }],
            7,
        );

        bus.publish("action.valve_1", &Message::new().with_scalar("control_signal", 80.0));
        let state = valve_rc
            .borrow_mut()
            .step(&crate::physics::Action::default(), 1.0);
        assert_eq!(state["opening"], 40.0);
    }

    #[test]
    fn physical_io_sensor_publishes_readings_with_a_timestamp() {
        let bus = MessageBus::new();
        let valve_rc = Rc::new(RefCell::new(Valve::new(
            "valve_1",
            &State::from([("opening".to_string(), 25.0)]),
            &Parameters::new(),
        )));
        let shared: SharedComponent = valve_rc.clone();
        let log = capture(&bus, "sensor/valve_opening");

        let mut io = PhysicalIoAgent::new(
            "io_1",
            Rc::clone(&bus),
            vec![SensorSpec {
                component: shared,
                state_key: "opening".to_string(),
                topic: "sensor/valve_opening".to_string(),
                noise_std: 0.0,
            }],
            Vec::new(),
            7,
        );
        io.run(42.0);

        let log = log.borrow();
        assert_eq!(log[0].scalar("opening"), Some(25.0));
        assert_eq!(log[0].scalar("timestamp"), Some(42.0));
    }

    #[test]
    fn csv_inflow_agent_holds_the_last_sample_and_skips_times_before_data() {
        let bus = MessageBus::new();
        let log = capture(&bus, "inflow/res_1");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,inflow").unwrap();
        writeln!(file, "10,100.0").unwrap();
        writeln!(file, "20,200.0").unwrap();
        file.flush().unwrap();

        let mut agent = CsvInflowAgent::new(
            "csv_1",
            Rc::clone(&bus),
            file.path(),
            "time",
            "inflow",
            "inflow/res_1",
        );

        agent.run(0.0); // before the first sample: nothing
        agent.run(10.0); // exact hit
        agent.run(15.0); // zero-order hold
        agent.run(25.0); // past the last sample

        let log = log.borrow();
        let values: Vec<f64> = log.iter().filter_map(|m| m.scalar("inflow_rate")).collect();
        assert_eq!(values, vec![100.0, 100.0, 200.0]);
    }

    #[test]
    fn csv_inflow_agent_becomes_a_no_op_on_a_missing_file() {
        let bus = MessageBus::new();
        let log = capture(&bus, "inflow/res_1");

        let mut agent = CsvInflowAgent::new(
            "csv_1",
            Rc::clone(&bus),
            std::path::Path::new("/nonexistent/inflow.csv"),
            "time",
            "inflow",
            "inflow/res_1",
        );
        agent.run(0.0);
        agent.run(100.0);
        assert!(log.borrow().is_empty());
    }

    /// A controller stub returning a fixed multi-topic output, used to
    /// check the per-topic publishing path in isolation.
    struct FixedFanout;

    impl Controller for FixedFanout {
        fn compute_control_action(&mut self, _observation: &State, _dt: f64) -> ControlOutput {
            ControlOutput::PerTopic(BTreeMap::from([
                ("action.a".to_string(), 1.0),
                ("action.b".to_string(), 2.0),
            ]))
        }
    }

    #[test]
    fn per_topic_outputs_reach_each_topic_individually() {
        let bus = MessageBus::new();
        let log_a = capture(&bus, "action.a");
        let log_b = capture(&bus, "action.b");

        let _agent = LocalControlAgent::new(
            "fanout_1",
            Box::new(FixedFanout),
            Rc::clone(&bus),
            ControlWiring {
                observation_topic: "state.x".to_string(),
                observation_key: None,
                action_topic: None,
                ..ControlWiring::default()
            },
            1.0,
        );

        bus.publish("state.x", &Message::new().with_scalar("anything", 0.0));
        assert_eq!(log_a.borrow()[0].scalar("control_signal"), Some(1.0));
        assert_eq!(log_b.borrow()[0].scalar("control_signal"), Some(2.0));
    }
}
