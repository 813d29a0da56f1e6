// Integration tests for rig configuration loading

use std::fs::File;
use std::io::Write;

use stage_sync::controller::ControllerKind;
use stage_sync::{Config, ConfigError, MotionSystem, load_config};
use tempfile::tempdir;

const THREE_AXIS_RIG: &str = r#"
[system]
name = "gantry"

[dispatcher]
refresh_interval_ms = 0

[master]
slaves = ["gantry", "sync"]
buffer_safety_margin = 3

[[controllers]]
name = "gantry"
kind = "positioner"
buffer_capacity = 32

[[controllers.devices]]
name = "x"
max_speed = 300.0

[[controllers.devices]]
name = "y"

[[controllers.devices]]
name = "z"
max_speed = 20.0
max_acceleration = 100.0
native_sync_out = false

[[controllers]]
name = "sync"
kind = "sync"
buffer_capacity = 32
"#;

#[test]
fn test_default_rig_survives_a_toml_round_trip() {
    let config = Config::default();
    let text = toml::to_string(&config).unwrap();
    let parsed = Config::from_toml(&text).unwrap();
    assert_eq!(parsed.controllers.len(), config.controllers.len());
    assert_eq!(parsed.master.unwrap().slaves, vec!["stage", "shutter", "sync"]);
    assert_eq!(parsed.dispatcher.refresh_interval_ms, 250);
    assert_eq!(parsed.controllers[0].devices[1].name, 'y');
}

#[test]
fn test_omitted_fields_take_defaults() {
    let config = Config::from_toml(THREE_AXIS_RIG).unwrap();
    assert_eq!(config.system.name, "gantry");
    let master = config.master.as_ref().unwrap();
    assert_eq!(master.name, "master");
    assert_eq!(master.rethrow_margin_ms, 50);

    let gantry = config.controller("gantry").unwrap();
    assert_eq!(gantry.kind, ControllerKind::Positioner);
    let y = &gantry.devices[1];
    assert_eq!(y.max_speed, 200.0);
    assert_eq!(y.max_deceleration, 1000.0);
    assert!(y.native_sync_out);
    assert!(!gantry.devices[2].native_sync_out);
    assert_eq!(config.planner.default_time_accuracy, 0.03);
}

#[test]
fn test_load_config_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gantry.toml");
    File::create(&path).unwrap().write_all(THREE_AXIS_RIG.as_bytes()).unwrap();
    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.controllers.len(), 2);

    let missing = dir.path().join("missing.toml");
    assert!(matches!(load_config(missing.to_str().unwrap()), Err(ConfigError::Io(_))));
}

#[test]
fn test_invalid_rigs_are_rejected() {
    let unknown_slave = THREE_AXIS_RIG.replace(r#"slaves = ["gantry", "sync"]"#, r#"slaves = ["gantry", "sync", "laser"]"#);
    assert!(matches!(Config::from_toml(&unknown_slave), Err(ConfigError::Invalid(_))));

    let tiny_buffer = THREE_AXIS_RIG.replace("buffer_capacity = 32\n\n[[controllers.devices]]", "buffer_capacity = 3\n\n[[controllers.devices]]");
    assert!(matches!(Config::from_toml(&tiny_buffer), Err(ConfigError::Invalid(_))));

    let no_speed = THREE_AXIS_RIG.replace("max_speed = 20.0", "max_speed = 0.0");
    assert!(matches!(Config::from_toml(&no_speed), Err(ConfigError::Invalid(_))));

    assert!(matches!(Config::from_toml("controllers = 3"), Err(ConfigError::Toml(_))));
}

#[tokio::test(start_paused = true)]
async fn test_system_runs_a_loaded_rig() {
    let config = Config::from_toml(THREE_AXIS_RIG).unwrap();
    let system = MotionSystem::new(config).await.unwrap();
    assert!(system.shutter("shutter").is_none());
    assert_eq!(system.planner().shutter_device(), None);

    let props = system.move_properties();
    let report = system.line("xz", &[10.0, 5.0], &props).await.unwrap();
    assert_eq!(report.segments, 1);
    assert!((system.position('z').unwrap() - 5.0).abs() < 1e-9);
    // No shutter on this rig
    assert!(system.change_shutter(true).await.is_err());
    system.shutdown().await;
}
