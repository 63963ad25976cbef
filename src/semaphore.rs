//! Concurrency limiter for probe fan-out.
//!
//! A task holds a [`Semaphore`] combining its own limit with the limit shared
//! by every task of the same type. Permits are released when dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

use crate::context::Context;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("semaphore acquire cancelled")]
    Cancelled,
    #[error("requested {requested} permits but limit is {limit}")]
    ExceedsLimit { requested: u32, limit: u32 },
    #[error("semaphore closed")]
    Closed,
}

/// Counting semaphore used to gate probe dispatch.
#[derive(Debug, Clone)]
pub enum Semaphore {
    /// Never blocks.
    Noop,
    /// Every member must grant the permits, acquired in order.
    Multi(Vec<Arc<WeightedHandle>>),
}

/// One weighted semaphore with a fixed capacity.
#[derive(Debug)]
pub struct WeightedHandle {
    inner: Arc<TokioSemaphore>,
    limit: u32,
}

impl WeightedHandle {
    pub fn new(limit: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(TokioSemaphore::new(limit as usize)),
            limit,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

/// Permits held for one unit of work.
#[derive(Debug)]
pub struct Permit {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl Semaphore {
    /// Semaphore with a single limit.
    pub fn weighted(limit: u32) -> Self {
        Semaphore::Multi(vec![WeightedHandle::new(limit)])
    }

    /// Acquire `n` permits, giving up when `ctx` is done.
    pub async fn acquire(&self, ctx: &Context, n: u32) -> Result<Permit, SemaphoreError> {
        let members = match self {
            Semaphore::Noop => return Ok(Permit { _permits: Vec::new() }),
            Semaphore::Multi(members) => members,
        };

        let mut permits = Vec::with_capacity(members.len());
        for member in members {
            if n > member.limit() {
                return Err(SemaphoreError::ExceedsLimit {
                    requested: n,
                    limit: member.limit(),
                });
            }
            if ctx.is_done() {
                return Err(SemaphoreError::Cancelled);
            }
            let inner = member.inner.clone();
            let permit = tokio::select! {
                biased;
                _ = ctx.done() => return Err(SemaphoreError::Cancelled),
                permit = inner.acquire_many_owned(n) => {
                    permit.map_err(|_| SemaphoreError::Closed)?
                }
            };
            permits.push(permit);
        }
        Ok(Permit { _permits: permits })
    }

    /// Acquire without waiting. Returns `None` when any member is exhausted.
    pub fn try_acquire(&self, n: u32) -> Option<Permit> {
        match self {
            Semaphore::Noop => Some(Permit { _permits: Vec::new() }),
            Semaphore::Multi(members) => {
                let mut permits = Vec::with_capacity(members.len());
                for member in members {
                    permits.push(member.inner.clone().try_acquire_many_owned(n).ok()?);
                }
                Some(Permit { _permits: permits })
            }
        }
    }
}

/// Per-instance semaphores shared between tasks, keyed by task type.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    instances: Mutex<HashMap<String, Arc<WeightedHandle>>>,
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a task semaphore: the shared `instance_key` limit plus a fresh
    /// per-task limit. A zero limit disables that member.
    pub fn get_semaphore(&self, instance_key: &str, per_instance: u32, per_task: u32) -> Semaphore {
        let mut members = Vec::with_capacity(2);
        if per_instance > 0 {
            let mut instances = match self.instances.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let shared = instances
                .entry(instance_key.to_string())
                .or_insert_with(|| WeightedHandle::new(per_instance))
                .clone();
            members.push(shared);
        }
        if per_task > 0 {
            members.push(WeightedHandle::new(per_task));
        }
        if members.is_empty() {
            Semaphore::Noop
        } else {
            Semaphore::Multi(members)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_noop_never_blocks() {
        let s = Semaphore::Noop;
        let ctx = Context::background();
        assert!(s.acquire(&ctx, 1_000_000).await.is_ok());
        assert!(s.try_acquire(5).is_some());
    }

    #[tokio::test]
    async fn test_acquire_respects_deadline() {
        let s = Semaphore::weighted(1);
        let ctx = Context::background();
        let _held = s.acquire(&ctx, 1).await.unwrap();

        let short = ctx.with_timeout(Duration::from_millis(10));
        assert_eq!(s.acquire(&short, 1).await.unwrap_err(), SemaphoreError::Cancelled);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let s = Semaphore::weighted(1);
        let ctx = Context::background();
        {
            let _p = s.acquire(&ctx, 1).await.unwrap();
            assert!(s.try_acquire(1).is_none());
        }
        assert!(s.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let s = Semaphore::weighted(1);
        let ctx = Context::background();
        let held = s.acquire(&ctx, 1).await.unwrap();

        let mut waiter = tokio_test::task::spawn(s.acquire(&ctx, 1));
        tokio_test::assert_pending!(waiter.poll());
        drop(held);
        assert!(waiter.is_woken());
        tokio_test::assert_ready_ok!(waiter.poll());
    }

    #[tokio::test]
    async fn test_exceeds_limit() {
        let s = Semaphore::weighted(2);
        let err = s.acquire(&Context::background(), 3).await.unwrap_err();
        assert_eq!(err, SemaphoreError::ExceedsLimit { requested: 3, limit: 2 });
    }

    #[tokio::test]
    async fn test_pool_shares_instance_limit() {
        let pool = SemaphorePool::new();
        let a = pool.get_semaphore("tcp", 1, 10);
        let b = pool.get_semaphore("tcp", 1, 10);
        let other = pool.get_semaphore("udp", 1, 10);

        let _held = a.acquire(&Context::background(), 1).await.unwrap();
        assert!(b.try_acquire(1).is_none());
        assert!(other.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn test_multi_releases_partial_on_cancel() {
        let pool = SemaphorePool::new();
        let s = pool.get_semaphore("http", 2, 1);
        let ctx = Context::background();
        let _held = s.acquire(&ctx, 1).await.unwrap();

        // instance member grants, task member blocks until the deadline
        let short = ctx.with_timeout(Duration::from_millis(10));
        assert!(s.acquire(&short, 1).await.is_err());

        let again = pool.get_semaphore("http", 2, 1);
        assert!(again.try_acquire(1).is_some());
    }
}
