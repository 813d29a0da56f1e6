// src/dispatch/mod.rs - Command line queue and per-controller execution
pub mod state_refresh;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::command::{Command, CommandLine, Completion};
use crate::controller::ControllerRegistry;
use crate::diagnostics::DiagnosticLog;
use crate::error::{MotionError, MotionResult};

pub use state_refresh::{RefreshReport, spawn_state_refresh, update_states};

const SOURCE: &str = "dispatcher";

struct QueuedLine {
    line: CommandLine,
    done: oneshot::Sender<MotionResult<()>>,
}

/// Handle on an enqueued line.
#[derive(Debug)]
pub struct LineTicket {
    pub id: Uuid,
    receiver: oneshot::Receiver<MotionResult<()>>,
}

impl LineTicket {
    /// Wait until every command of the line has executed (and, where awaited, completed).
    pub async fn wait(self) -> MotionResult<()> {
        self.receiver
            .await
            .map_err(|_| MotionError::Aborted("dispatcher dropped the line".to_string()))?
    }
}

/// Executes command lines one at a time, serializing access to every controller.
pub struct CommandDispatcher {
    registry: Arc<ControllerRegistry>,
    diagnostics: DiagnosticLog,
    queue: Mutex<VecDeque<QueuedLine>>,
    wakeup: Notify,
    dequeuing: AtomicBool,
    detached: Mutex<JoinSet<()>>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ControllerRegistry>, diagnostics: DiagnosticLog) -> Arc<Self> {
        Arc::new(Self {
            registry,
            diagnostics,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            dequeuing: AtomicBool::new(true),
            detached: Mutex::new(JoinSet::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    /// Start the dequeue loop. It exits when `shutdown` fires or its sender is dropped.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Command dispatcher started");
            loop {
                if matches!(shutdown.try_recv(), Ok(()) | Err(TryRecvError::Closed)) {
                    break;
                }
                let next = if dispatcher.dequeuing.load(Ordering::SeqCst) {
                    dispatcher.pop()
                } else {
                    None
                };
                match next {
                    Some(queued) => {
                        let result = dispatcher.run_line(&queued.line).await;
                        match &result {
                            Err(e @ MotionError::Aborted(_)) => dispatcher
                                .diagnostics
                                .warn(SOURCE, format!("line '{}' interrupted: {}", queued.line.label, e)),
                            Err(e) => dispatcher
                                .diagnostics
                                .error(SOURCE, format!("line '{}' failed: {}", queued.line.label, e)),
                            Ok(()) => {}
                        }
                        let _ = queued.done.send(result);
                    }
                    None => {
                        tokio::select! {
                            _ = dispatcher.wakeup.notified() => {}
                            _ = shutdown.recv() => break,
                        }
                    }
                }
            }
            tracing::info!("Command dispatcher stopped");
        })
    }

    fn pop(&self) -> Option<QueuedLine> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Append a line to the queue without waiting for it.
    pub fn enqueue(&self, line: CommandLine) -> LineTicket {
        let (done, receiver) = oneshot::channel();
        let id = line.id;
        tracing::debug!("Enqueued line '{}' with {} command(s)", line.label, line.len());
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueuedLine { line, done });
        self.wakeup.notify_one();
        LineTicket { id, receiver }
    }

    /// Enqueue a line and wait for it to finish.
    pub async fn execute_line(&self, line: CommandLine) -> MotionResult<()> {
        self.enqueue(line).wait().await
    }

    /// Run a line right away, bypassing the queue. Controller locks still apply.
    pub async fn execute_immediate(&self, line: CommandLine) -> MotionResult<()> {
        tracing::info!("Executing line '{}' out of band", line.label);
        self.run_line(&line).await
    }

    /// Pause the dequeue loop after the current line.
    pub fn stop_dequeuing(&self) {
        self.dequeuing.store(false, Ordering::SeqCst);
        tracing::info!("Dispatcher dequeuing paused");
    }

    pub fn resume_dequeuing(&self) {
        self.dequeuing.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub fn is_dequeuing(&self) -> bool {
        self.dequeuing.load(Ordering::SeqCst)
    }

    /// Discard every pending line. Their waiters resolve with `Aborted`.
    pub fn clear_queue(&self) -> usize {
        let discarded: Vec<QueuedLine> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = discarded.len();
        for queued in discarded {
            let _ = queued
                .done
                .send(Err(MotionError::Aborted(format!("line '{}' discarded", queued.line.label))));
        }
        if count > 0 {
            self.diagnostics.warn(SOURCE, format!("discarded {} pending line(s)", count));
        }
        count
    }

    pub fn pending_lines(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait for every fire-and-forget completion tracked so far.
    pub async fn flush_detached(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.detached.lock().unwrap_or_else(PoisonError::into_inner));
        let mut flushed = 0;
        while tasks.join_next().await.is_some() {
            flushed += 1;
        }
        flushed
    }

    async fn run_line(&self, line: &CommandLine) -> MotionResult<()> {
        if line.is_empty() {
            return Ok(());
        }
        let groups = line.group_by_controller();
        tracing::debug!("Running line '{}' across {} controller(s)", line.label, groups.len());
        let results = join_all(
            groups
                .into_iter()
                .map(|(controller, commands)| self.run_group(controller, commands)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Commands of one controller, in order. The controller lock is held
    /// for each `execute` call only.
    async fn run_group(&self, controller: String, commands: Vec<&Command>) -> MotionResult<()> {
        let handle = self.registry.get(&controller)?;
        for command in commands {
            let completion = handle.execute(command).await?;
            if command.await_completion {
                completion.wait().await?;
            } else if completion.is_pending() {
                self.track_detached(&controller, command, completion);
            }
        }
        Ok(())
    }

    fn track_detached(&self, controller: &str, command: &Command, completion: Completion) {
        let diagnostics = self.diagnostics.clone();
        let label = format!("{} {:?}", controller, command.action);
        let mut tasks = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = completion.wait().await {
                diagnostics.error(SOURCE, format!("{} failed after dispatch: {}", label, e));
            }
        });
    }
}
