//! Meta configuration: a task list plus the bounds every child is clamped to.

use std::time::Duration;

use serde::Deserialize;

use super::base::TaskConfig;
use super::ConfigError;

pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MIN_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10240;

fn default_max_timeout() -> Duration {
    DEFAULT_MAX_TIMEOUT
}

fn default_min_period() -> Duration {
    DEFAULT_MIN_PERIOD
}

fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}

/// Tasks of one type with the limits applied during cleaning.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct TaskMetaConfig<T> {
    #[serde(default = "default_max_timeout", with = "humantime_serde")]
    pub max_timeout: Duration,
    #[serde(default = "default_min_period", with = "humantime_serde")]
    pub min_period: Duration,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Default data id for children. Zero disables the whole list.
    #[serde(default)]
    pub data_id: i32,
    #[serde(default = "Vec::new")]
    pub tasks: Vec<T>,
}

impl<T> Default for TaskMetaConfig<T> {
    fn default() -> Self {
        Self {
            max_timeout: DEFAULT_MAX_TIMEOUT,
            min_period: DEFAULT_MIN_PERIOD,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            data_id: 0,
            tasks: Vec::new(),
        }
    }
}

impl<T: TaskConfig> TaskMetaConfig<T> {
    /// Normalize every child. Stops at the first invalid task.
    pub fn clean(&mut self) -> Result<(), ConfigError> {
        let bounds = Bounds {
            max_timeout: self.max_timeout,
            min_period: self.min_period,
            max_buffer_size: self.max_buffer_size,
            data_id: self.data_id,
        };
        for task in self.tasks.iter_mut() {
            bounds.clean_task(task)?;
        }
        Ok(())
    }

    /// Runnable children. Empty when the meta data id is unset.
    pub fn task_configs(&self) -> &[T] {
        if self.data_id == 0 {
            return &[];
        }
        &self.tasks
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    max_timeout: Duration,
    min_period: Duration,
    max_buffer_size: usize,
    data_id: i32,
}

impl Bounds {
    /// Identity is computed last so defaulted and explicit values hash alike.
    fn clean_task<T: TaskConfig>(&self, task: &mut T) -> Result<(), ConfigError> {
        task.clean()?;

        let base = task.base_mut();
        if base.timeout.is_zero() || base.timeout > self.max_timeout {
            base.timeout = self.max_timeout;
        }
        if base.period < self.min_period {
            base.period = self.min_period;
        }
        if base.timeout > base.period {
            base.timeout = base.period;
        }
        if base.data_id == 0 {
            base.data_id = self.data_id;
        }

        if let Some(size) = task.buffer_size_mut() {
            if *size == 0 || *size > self.max_buffer_size {
                *size = self.max_buffer_size;
            }
        }

        task.init_ident();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::base::Label;
    use crate::config::tcp::TcpTaskConfig;

    fn meta(tasks: Vec<TcpTaskConfig>) -> TaskMetaConfig<TcpTaskConfig> {
        TaskMetaConfig {
            max_timeout: Duration::from_secs(10),
            min_period: Duration::from_secs(30),
            max_buffer_size: 4096,
            data_id: 1009,
            tasks,
        }
    }

    fn tcp(period: u64, timeout: u64) -> TcpTaskConfig {
        let mut task = TcpTaskConfig::default();
        task.base.period = Duration::from_secs(period);
        task.base.timeout = Duration::from_secs(timeout);
        task.target_host = "127.0.0.1".to_string();
        task.target_port = 80;
        task
    }

    #[test]
    fn test_clamp_invariants() {
        let mut m = meta(vec![tcp(5, 0), tcp(60, 100), tcp(31, 20), tcp(120, 3)]);
        m.clean().unwrap();
        for task in &m.tasks {
            assert!(task.base.timeout <= m.max_timeout);
            assert!(task.base.period >= m.min_period);
            assert!(task.base.timeout <= task.base.period);
            assert!(task.buffer_size <= m.max_buffer_size);
            assert_eq!(task.base.data_id, 1009);
            assert!(!task.base.ident.is_empty());
        }
        assert_eq!(m.tasks[0].base.period, Duration::from_secs(30));
        assert_eq!(m.tasks[0].base.timeout, Duration::from_secs(10));
        assert_eq!(m.tasks[3].base.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_timeout_clamped_to_period() {
        let mut m = meta(vec![tcp(30, 10)]);
        m.min_period = Duration::from_secs(1);
        m.tasks[0].base.period = Duration::from_secs(2);
        m.clean().unwrap();
        assert_eq!(m.tasks[0].base.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_ident_stable_under_label_churn() {
        let mut a = meta(vec![tcp(60, 3)]);
        let mut b = meta(vec![tcp(60, 3)]);
        b.tasks[0].base.labels = vec![Label::from([("bk_target_service_instance_id".to_string(), "12".to_string())])];
        a.clean().unwrap();
        b.clean().unwrap();
        assert_eq!(a.tasks[0].base.ident, b.tasks[0].base.ident);

        // cleaning twice leaves the identity alone
        let first = a.tasks[0].base.ident.clone();
        a.clean().unwrap();
        assert_eq!(a.tasks[0].base.ident, first);
    }

    #[test]
    fn test_defaulted_and_explicit_hash_alike() {
        let mut a = meta(vec![tcp(60, 3)]);
        let mut b = meta(vec![tcp(60, 3)]);
        b.tasks[0].response_format = "in".to_string();
        b.tasks[0].request_format = "raw".to_string();
        a.clean().unwrap();
        b.clean().unwrap();
        assert_eq!(a.tasks[0].base.ident, b.tasks[0].base.ident);
    }

    #[test]
    fn test_zero_data_id_yields_no_tasks() {
        let mut m = meta(vec![tcp(60, 3)]);
        m.data_id = 0;
        m.clean().unwrap();
        assert!(m.task_configs().is_empty());
    }
}
