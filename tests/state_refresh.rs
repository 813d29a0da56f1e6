// Integration tests for periodic device state refresh

use std::time::Duration;

use stage_sync::dispatch::{spawn_state_refresh, update_states};
use stage_sync::{Config, LogLevel, MotionSystem};
use tokio::sync::broadcast;

fn quiet_rig() -> Config {
    let mut config = Config::default();
    config.dispatcher.refresh_interval_ms = 0;
    config
}

#[tokio::test(start_paused = true)]
async fn test_idle_rig_refreshes_every_leaf_controller() {
    let system = MotionSystem::new(quiet_rig()).await.unwrap();
    let report = system.refresh_states().await;
    let mut refreshed = report.refreshed.clone();
    refreshed.sort();
    assert_eq!(refreshed, vec!["shutter", "stage", "sync"]);
    assert!(report.skipped_busy.is_empty());
    assert!(report.failed.is_empty());
    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_locked_controller_is_skipped() {
    let system = MotionSystem::new(quiet_rig()).await.unwrap();
    let guard = system.registry().get("stage").unwrap().try_lock().unwrap();
    let report = system.refresh_states().await;
    assert_eq!(report.skipped_busy, vec!["stage"]);
    assert!(!report.refreshed.contains(&"stage".to_string()));

    drop(guard);
    let report = system.refresh_states().await;
    assert!(report.refreshed.contains(&"stage".to_string()));
    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_device_skips_its_controller() {
    let system = MotionSystem::new(quiet_rig()).await.unwrap();
    system.arena().set_connected('x', false).unwrap();
    let report = system.refresh_states().await;
    assert_eq!(report.skipped_disconnected, vec!["stage"]);
    assert!(report.refreshed.contains(&"shutter".to_string()));
    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stuck_poll_is_abandoned_and_unlocks() {
    let system = MotionSystem::new(quiet_rig()).await.unwrap();
    system
        .positioner("stage")
        .unwrap()
        .set_update_delay(Duration::from_secs(5));

    let report = update_states(
        system.registry(),
        system.arena(),
        system.diagnostics(),
        Duration::from_millis(100),
    )
    .await;
    assert_eq!(report.failed, vec!["stage"]);
    assert!(system.diagnostics().contains(LogLevel::Warn, "timed out"));
    assert!(system.registry().get("stage").unwrap().try_lock().is_some());
    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_faulty_controller_is_reported_not_raised() {
    let system = MotionSystem::new(quiet_rig()).await.unwrap();
    system.positioner("stage").unwrap().inject_fault(Some("encoder lost"));
    let report = system.refresh_states().await;
    assert_eq!(report.failed, vec!["stage"]);
    assert!(system.diagnostics().contains(LogLevel::Warn, "encoder lost"));
    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_period_disables_the_refresh_task() {
    let system = MotionSystem::new(quiet_rig()).await.unwrap();
    let (shutdown, _) = broadcast::channel(1);
    let task = spawn_state_refresh(
        system.registry().clone(),
        system.arena().clone(),
        system.diagnostics().clone(),
        Duration::ZERO,
        Duration::from_millis(100),
        shutdown.subscribe(),
    );
    assert!(task.is_none());

    let task = spawn_state_refresh(
        system.registry().clone(),
        system.arena().clone(),
        system.diagnostics().clone(),
        Duration::from_millis(50),
        Duration::from_millis(100),
        shutdown.subscribe(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    shutdown.send(()).unwrap();
    task.await.unwrap();
    system.shutdown().await;
}
