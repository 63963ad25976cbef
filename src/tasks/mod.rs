//! Collection tasks.
//!
//! Supports TCP, UDP, HTTP and ping probes plus the SNMP trap listener.

pub mod http;
pub mod ping;
pub mod tcp;
pub mod trap;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{BeatConfig, RuntimeContext, TaskConfig};
use crate::context::Context;
use crate::event::{Event, EventSender};
use crate::semaphore::Semaphore;

/// Task level failures. Per-target failures are reported in events instead.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("semaphore acquire failed: {0}")]
    Semaphore(#[from] crate::semaphore::SemaphoreError),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// How the scheduler drives a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run once per period under a timeout.
    Periodic,
    /// Run until cancelled, restarted when it returns.
    Daemon,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn config(&self) -> &dyn TaskConfig;

    fn ident(&self) -> &str {
        self.config().ident()
    }

    fn task_id(&self) -> i32 {
        self.config().base().task_id
    }

    fn schedule(&self) -> Schedule {
        Schedule::Periodic
    }

    /// Run once. Events go to `tx`; the context bounds the run.
    async fn run(&self, ctx: Context, tx: EventSender);
}

/// State every task carries: its config, the runtime and its semaphore.
#[derive(Debug)]
pub struct BaseTask<C> {
    pub config: C,
    pub runtime: Arc<RuntimeContext>,
    pub semaphore: Semaphore,
}

impl<C: TaskConfig> BaseTask<C> {
    pub fn new(config: C, runtime: Arc<RuntimeContext>) -> Self {
        let semaphore = runtime.semaphore(config.task_type());
        Self { config, runtime, semaphore }
    }

    pub fn with_semaphore(mut self, semaphore: Semaphore) -> Self {
        self.semaphore = semaphore;
        self
    }
}

/// Forward an event, logging when the sink is gone.
pub(crate) async fn send_event(tx: &EventSender, event: Box<dyn Event>) {
    if tx.send(event).await.is_err() {
        tracing::warn!("event channel closed, dropping event");
    }
}

/// Deadline for one address: the task timeout from now, clipped to the
/// run context so time spent waiting on the semaphore counts against it.
pub(crate) fn address_deadline(ctx: &Context, timeout: Duration) -> tokio::time::Instant {
    let local = tokio::time::Instant::now() + timeout;
    match ctx.deadline() {
        Some(run) => run.min(local),
        None => local,
    }
}

/// Build runnable tasks from a cleaned config.
pub fn build_tasks(cfg: &BeatConfig, runtime: &Arc<RuntimeContext>) -> Vec<Arc<dyn Task>> {
    let mut tasks: Vec<Arc<dyn Task>> = Vec::new();
    for conf in cfg.tcp_task.task_configs() {
        tasks.push(Arc::new(tcp::TcpGather::new(conf.clone(), runtime.clone())));
    }
    for conf in cfg.udp_task.task_configs() {
        tasks.push(Arc::new(udp::UdpGather::new(conf.clone(), runtime.clone())));
    }
    for conf in cfg.http_task.task_configs() {
        tasks.push(Arc::new(http::HttpGather::new(conf.clone(), runtime.clone())));
    }
    for conf in cfg.ping_task.task_configs() {
        tasks.push(Arc::new(ping::PingGather::new(conf.clone(), runtime.clone())));
    }
    for conf in cfg.trap_task.task_configs() {
        tasks.push(Arc::new(trap::TrapGather::new(conf.clone(), runtime.clone())));
    }
    for conf in cfg.metricbeat_task.task_configs() {
        tracing::warn!(
            "metricbeat task {} is configured but metric scraping is not available here",
            conf.base.task_id
        );
    }
    tasks
}
