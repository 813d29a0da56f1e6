// Integration tests for the command dispatcher

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use stage_sync::command::{Command, CommandAction, CommandLine, CommandParameters, Completion, MoveTarget, ShutterTiming};
use stage_sync::controller::{ControllerHandle, ControllerKind, ControllerRegistry, Executable};
use stage_sync::device::DeviceId;
use stage_sync::{CommandDispatcher, DiagnosticLog, LogLevel, MotionError, MotionResult};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, timeout};

/// Records the `tag` property of every command it executes.
struct RecordingController {
    name: String,
    delay: Duration,
    fail_next: AtomicBool,
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Executable for RecordingController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Positioner
    }

    fn devices(&self) -> &[DeviceId] {
        &[]
    }

    async fn execute(&self, command: &Command) -> MotionResult<Completion> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MotionError::hardware(&self.name, "injected"));
        }
        if let CommandParameters::DeviceProperty { value, .. } = &command.parameters {
            self.seen.lock().unwrap().push(value.clone());
        }
        if command.action == CommandAction::MoveAbsolute {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(MotionError::hardware(&self.name, "following error")));
            return Ok(Completion::pending(rx));
        }
        Ok(Completion::done())
    }
}

struct Harness {
    dispatcher: Arc<CommandDispatcher>,
    diagnostics: DiagnosticLog,
    seen: Arc<Mutex<Vec<Value>>>,
    a: Arc<RecordingController>,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

fn harness(delay_a: Duration) -> Harness {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = |name: &str, delay: Duration| {
        Arc::new(RecordingController {
            name: name.to_string(),
            delay,
            fail_next: AtomicBool::new(false),
            seen: seen.clone(),
        })
    };
    let a = controller("a", delay_a);
    let b = controller("b", Duration::ZERO);
    let mut registry = ControllerRegistry::new();
    registry.register(ControllerHandle::new(a.clone())).unwrap();
    registry.register(ControllerHandle::new(b)).unwrap();

    let diagnostics = DiagnosticLog::new();
    let dispatcher = CommandDispatcher::new(Arc::new(registry), diagnostics.clone());
    let (shutdown, _) = broadcast::channel(1);
    let task = dispatcher.start(shutdown.subscribe());
    Harness {
        dispatcher,
        diagnostics,
        seen,
        a,
        shutdown,
        task,
    }
}

fn tag(controller: &str, value: i64) -> Command {
    Command::update_device_property(controller, 'x', "tag", json!(value))
        .unwrap()
        .awaited(true)
}

fn line(label: &str, commands: Vec<Command>) -> CommandLine {
    CommandLine::new(label, commands)
}

fn seen(h: &Harness) -> Vec<Value> {
    h.seen.lock().unwrap().clone()
}

#[tokio::test(start_paused = true)]
async fn test_lines_run_in_order_and_controllers_in_parallel() {
    let h = harness(Duration::from_millis(50));
    let first = h.dispatcher.enqueue(line("first", vec![tag("a", 1), tag("b", 2)]));
    let second = h.dispatcher.enqueue(line("second", vec![tag("a", 3)]));
    let third = h.dispatcher.enqueue(line("third", vec![tag("b", 4)]));
    first.wait().await.unwrap();
    second.wait().await.unwrap();
    third.wait().await.unwrap();
    // b runs alongside the slow a within a line, but never overtakes a queued line
    assert_eq!(seen(&h), vec![json!(2), json!(1), json!(3), json!(4)]);
}

#[tokio::test]
async fn test_failed_command_fails_the_line_and_frees_the_controller() {
    let h = harness(Duration::ZERO);
    h.a.fail_next.store(true, Ordering::SeqCst);
    let result = h.dispatcher.execute_line(line("broken", vec![tag("a", 1)])).await;
    assert!(matches!(result, Err(MotionError::HardwareFault { .. })));
    assert!(h.diagnostics.contains(LogLevel::Error, "broken"));

    let handle = h.dispatcher.registry().get("a").unwrap();
    assert!(handle.try_lock().is_some());
    h.dispatcher.execute_line(line("next", vec![tag("a", 2)])).await.unwrap();
    assert_eq!(seen(&h), vec![json!(2)]);
}

#[tokio::test]
async fn test_clear_queue_aborts_pending_lines() {
    let h = harness(Duration::ZERO);
    h.dispatcher.stop_dequeuing();
    let first = h.dispatcher.enqueue(line("first", vec![tag("a", 1)]));
    let second = h.dispatcher.enqueue(line("second", vec![tag("b", 2)]));
    assert_eq!(h.dispatcher.pending_lines(), 2);

    assert_eq!(h.dispatcher.clear_queue(), 2);
    assert!(matches!(first.wait().await, Err(MotionError::Aborted(_))));
    assert!(matches!(second.wait().await, Err(MotionError::Aborted(_))));
    assert!(h.diagnostics.contains(LogLevel::Warn, "discarded 2"));

    h.dispatcher.resume_dequeuing();
    h.dispatcher.execute_line(line("after", vec![tag("a", 3)])).await.unwrap();
    assert_eq!(seen(&h), vec![json!(3)]);
}

#[tokio::test]
async fn test_immediate_line_bypasses_a_paused_queue() {
    let h = harness(Duration::ZERO);
    h.dispatcher.stop_dequeuing();
    assert!(!h.dispatcher.is_dequeuing());
    let queued = h.dispatcher.enqueue(line("queued", vec![tag("a", 1)]));
    h.dispatcher
        .execute_immediate(line("urgent", vec![tag("a", 2)]))
        .await
        .unwrap();
    assert_eq!(seen(&h), vec![json!(2)]);

    h.dispatcher.resume_dequeuing();
    queued.wait().await.unwrap();
    assert_eq!(seen(&h), vec![json!(2), json!(1)]);
}

#[tokio::test]
async fn test_detached_failure_is_logged_not_raised() {
    let h = harness(Duration::ZERO);
    let fire_and_forget = Command::move_absolute("b", vec!['x'], vec![MoveTarget::new(1.0, 0.1)], ShutterTiming::default())
        .unwrap()
        .awaited(false);
    h.dispatcher
        .execute_line(line("detached", vec![fire_and_forget]))
        .await
        .unwrap();
    assert_eq!(h.dispatcher.flush_detached().await, 1);
    assert!(h.diagnostics.contains(LogLevel::Error, "failed after dispatch"));
}

#[tokio::test]
async fn test_dispatcher_stops_on_shutdown() {
    let h = harness(Duration::ZERO);
    h.shutdown.send(()).unwrap();
    assert!(timeout(Duration::from_secs(1), h.task).await.is_ok());
}
