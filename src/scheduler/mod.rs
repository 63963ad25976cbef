//! Scheduler module for running tasks and shipping their events.

mod writer;

pub use writer::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::event::EventSender;
use crate::tasks::{Schedule, Task};

const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

struct RunningTask {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives every task in its own loop, keyed by the task identity.
pub struct Scheduler {
    check_interval: Duration,
    output: EventSender,
    running: Arc<RwLock<HashMap<String, RunningTask>>>,
}

impl Scheduler {
    pub fn new(check_interval: Duration, output: EventSender) -> Self {
        Self {
            check_interval,
            output,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start every task that is not running yet.
    pub async fn start(&self, tasks: Vec<Arc<dyn Task>>) {
        tracing::info!("starting scheduler with {} tasks", tasks.len());
        for task in tasks {
            self.add_task(task).await;
        }
    }

    pub async fn add_task(&self, task: Arc<dyn Task>) {
        let ident = task.ident().to_string();
        let mut running = self.running.write().await;
        if running.contains_key(&ident) {
            return;
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        tracing::info!("scheduler: adding task {} ({})", task.task_id(), ident);
        let output = self.output.clone();
        let handle = match task.schedule() {
            Schedule::Periodic => tokio::spawn(run_periodic(task, output, stop_rx)),
            Schedule::Daemon => tokio::spawn(run_daemon(task, output, self.check_interval, stop_rx)),
        };
        running.insert(ident, RunningTask { stop_tx, handle });
    }

    /// Signal a task to stop. Its current run is cancelled, not awaited.
    pub async fn remove_task(&self, ident: &str) {
        let removed = self.running.write().await.remove(ident);
        if let Some(task) = removed {
            let _ = task.stop_tx.send(());
            tracing::info!("scheduler: removed task {}", ident);
        }
    }

    /// Replace the task set: loops whose identity vanished are stopped,
    /// new identities are started and unchanged ones keep running.
    pub async fn reload(&self, tasks: Vec<Arc<dyn Task>>) {
        let wanted: HashMap<String, Arc<dyn Task>> = tasks.into_iter().map(|t| (t.ident().to_string(), t)).collect();
        let stale: Vec<String> = self
            .running
            .read()
            .await
            .keys()
            .filter(|ident| !wanted.contains_key(*ident))
            .cloned()
            .collect();
        for ident in stale {
            self.remove_task(&ident).await;
        }
        for task in wanted.into_values() {
            self.add_task(task).await;
        }
    }

    pub async fn running(&self) -> Vec<String> {
        let mut idents: Vec<String> = self.running.read().await.keys().cloned().collect();
        idents.sort();
        idents
    }

    /// Stop every loop and wait up to `timeout` for them to finish.
    pub async fn stop(&self, timeout: Duration) {
        let tasks: Vec<(String, RunningTask)> = self.running.write().await.drain().collect();
        for (_, task) in &tasks {
            let _ = task.stop_tx.send(());
        }
        let wait = async {
            for (ident, task) in tasks {
                if let Err(e) = task.handle.await {
                    tracing::error!("task loop {} failed: {}", ident, e);
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            tracing::warn!("some tasks did not stop within {:?}", timeout);
        }
    }
}

/// Run `task` once under `ctx`. A stop signal cancels the context and the
/// run is awaited so in-flight probes finish on their own deadlines.
/// Returns false when the loop should end.
async fn run_once(task: &dyn Task, ctx: Context, output: EventSender, stop_rx: &mut broadcast::Receiver<()>) -> bool {
    let run = task.run(ctx.clone(), output);
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => true,
        _ = stop_rx.recv() => {
            ctx.cancel();
            run.await;
            false
        }
    }
}

/// Run a periodic task every `period`, each run bounded by its `timeout`.
async fn run_periodic(task: Arc<dyn Task>, output: EventSender, mut stop_rx: broadcast::Receiver<()>) {
    let base = task.config().base();
    let period = if base.period.is_zero() { DEFAULT_PERIOD } else { base.period };
    let timeout = if base.timeout.is_zero() { period } else { base.timeout };
    let root = Context::background();

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                tracing::debug!("task {} run", task.task_id());
                if !run_once(task.as_ref(), root.with_timeout(timeout), output.clone(), &mut stop_rx).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("task {} loop stopped", task.task_id());
}

/// Run a long lived task until stopped, restarting it after `check_interval`
/// whenever it returns.
async fn run_daemon(
    task: Arc<dyn Task>,
    output: EventSender,
    check_interval: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let root = Context::background();
    loop {
        if !run_once(task.as_ref(), root.with_cancel(), output.clone(), &mut stop_rx).await {
            break;
        }
        tracing::warn!("daemon task {} exited, restarting in {:?}", task.task_id(), check_interval);
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(check_interval) => {}
        }
    }
    tracing::debug!("task {} loop stopped", task.task_id());
}
