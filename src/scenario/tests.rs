#[cfg(test)]
mod units {
    use crate::errors::ConfigError;
    use crate::scenario::ScenarioLoader;
    use std::fs;
    use std::path::Path;

    fn write_scenario(
        dir: &Path,
        config: &str,
        components: &str,
        topology: &str,
        agents: &str,
    ) {
        fs::write(dir.join("config.yml"), config).unwrap();
        fs::write(dir.join("components.yml"), components).unwrap();
        fs::write(dir.join("topology.yml"), topology).unwrap();
        fs::write(dir.join("agents.yml"), agents).unwrap();
    }

    const CONFIG: &str = "simulation:\n  duration: 10\n  time_step: 1\n";

    const COMPONENTS: &str = r#"
components:
  - id: res_1
    class: Reservoir
    initial_state:
      volume: 21000000
      outflow: 0
    parameters:
      storage_curve: [[0, 0], [60000000, 40]]
  - id: gate_1
    class: Gate
    action_topic: action.gate_1
    initial_state:
      opening: 0.1
    parameters:
      discharge_coefficient: 0.6
      width: 2.0
      max_opening: 1.0
      max_rate_of_change: 0.5
"#;

    const TOPOLOGY: &str = r#"
connections:
  - upstream: res_1
    downstream: gate_1
"#;

    const AGENTS: &str = r#"
agents:
  - id: twin_res
    class: DigitalTwinAgent
    config:
      simulated_object_id: res_1
      state_topic: perception.res_1
  - id: dispatcher_1
    class: CentralDispatcherAgent
    config:
      mode: rule
      subscribed_topic: perception.res_1
      observation_key: water_level
      low_level: 10
      high_level: 20
      low_setpoint: 0.1
      high_setpoint: 0.9
      command_topic: command.gate_1.setpoint
  - id: ctrl_gate
    class: LocalControlAgent
    config:
      observation_topic: perception.res_1
      observation_key: water_level
      action_topic: action.gate_1
      command_topic: command.gate_1.setpoint
      controller:
        class: PidController
        config:
          kp: 0.3
          ki: 0.01
          kd: 0.0
          setpoint: 0.5
          min_output: 0.0
          max_output: 1.0
controllers: []
"#;

    #[test]
    fn loads_and_runs_a_complete_scenario() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), CONFIG, COMPONENTS, TOPOLOGY, AGENTS);

        let mut harness = ScenarioLoader::new(dir.path()).load().unwrap();
        harness.run().unwrap();

        assert_eq!(harness.history().len(), 10);
        let last = harness.history().last().unwrap();
        assert!(last.states.contains_key("res_1"));
        assert!(last.states.contains_key("gate_1"));
        // The gate must stay inside its physical range throughout.
        for snapshot in harness.history() {
            let opening = snapshot.states["gate_1"]["opening"];
            assert!((0.0..=1.0).contains(&opening));
        }
    }

    #[test]
    fn unknown_component_class_is_its_own_error() {
        let dir = tempfile::tempdir().unwrap();
        let components = "components:\n  - id: x\n    class: FluxCapacitor\n";
        write_scenario(dir.path(), CONFIG, components, "connections: []\n", "agents: []\n");

        match ScenarioLoader::new(dir.path()).load() {
            Err(ConfigError::UnknownClass(class)) => assert_eq!(class, "FluxCapacitor"),
            other => panic!("expected UnknownClass, got {other:?}"),
        }
    }

    #[test]
    fn unknown_agent_class_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agents = "agents:\n  - id: a\n    class: TelepathyAgent\n    config: {}\n";
        write_scenario(dir.path(), CONFIG, COMPONENTS, TOPOLOGY, agents);

        assert!(matches!(
            ScenarioLoader::new(dir.path()).load(),
            Err(ConfigError::UnknownClass(_))
        ));
    }

    #[test]
    fn missing_component_reference_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let agents = r#"
agents:
  - id: twin_ghost
    class: DigitalTwinAgent
    config:
      simulated_object_id: ghost
      state_topic: perception.ghost
"#;
        write_scenario(dir.path(), CONFIG, COMPONENTS, TOPOLOGY, agents);

        match ScenarioLoader::new(dir.path()).load() {
            Err(ConfigError::MissingReference(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected MissingReference, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_topology_fails_at_build() {
        let dir = tempfile::tempdir().unwrap();
        let topology = r#"
connections:
  - upstream: res_1
    downstream: gate_1
  - upstream: gate_1
    downstream: res_1
"#;
        write_scenario(dir.path(), CONFIG, COMPONENTS, topology, "agents: []\n");

        assert!(matches!(
            ScenarioLoader::new(dir.path()).load(),
            Err(ConfigError::Topology(crate::errors::TopologyError::Cycle))
        ));
    }

    #[test]
    fn saint_venant_model_type_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let components = r#"
components:
  - id: canal_1
    class: UnifiedCanal
    parameters:
      model_type: st_venant
"#;
        write_scenario(dir.path(), CONFIG, components, "connections: []\n", "agents: []\n");

        assert!(matches!(
            ScenarioLoader::new(dir.path()).load(),
            Err(ConfigError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn missing_scenario_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), CONFIG).unwrap();

        assert!(matches!(
            ScenarioLoader::new(dir.path()).load(),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn legacy_canal_class_names_select_the_matching_model() {
        let dir = tempfile::tempdir().unwrap();
        let components = r#"
components:
  - id: canal_1
    class: IntegralDelayCanal
    initial_state:
      water_level: 4.0
    parameters:
      gain: 0.001
      delay: 300
"#;
        write_scenario(dir.path(), CONFIG, components, "connections: []\n", "agents: []\n");

        let mut harness = ScenarioLoader::new(dir.path()).load().unwrap();
        harness.run().unwrap();
        assert!(harness.history().last().unwrap().states["canal_1"]["water_level"] >= 0.0);
    }

    #[test]
    fn controller_shorthand_wires_a_pid_loop_through_the_harness() {
        let dir = tempfile::tempdir().unwrap();
        let agents = r#"
agents: []
controllers:
  - id: gate_pid
    class: PidController
    controlled_id: gate_1
    observed_id: res_1
    observation_key: water_level
    config:
      kp: -0.2
      ki: 0.0
      kd: 0.0
      setpoint: 12.0
      min_output: 0.0
      max_output: 1.0
"#;
        write_scenario(dir.path(), CONFIG, COMPONENTS, TOPOLOGY, agents);

        let mut harness = ScenarioLoader::new(dir.path()).load().unwrap();
        harness.run().unwrap();

        // The reservoir sits above the setpoint (level = 21e6 / 1.5e6 = 14),
        // so the negative-gain loop drives the gate open.
        let final_opening = harness.history().last().unwrap().states["gate_1"]["opening"];
        assert!(final_opening > 0.1, "gate did not open: {final_opening}");
    }
}
