use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{BaseTaskParam, TaskConfig};
use super::ConfigError;
use crate::define::MODULE_METRICBEAT;

/// Metric scrape task. Only the configuration is modelled; its free-form
/// `module` block takes part in the identity hash.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricBeatConfig {
    #[serde(flatten)]
    pub base: BaseTaskParam,
    #[serde(default)]
    pub module: Option<Value>,
}

impl TaskConfig for MetricBeatConfig {
    fn task_type(&self) -> &'static str {
        MODULE_METRICBEAT
    }

    fn base(&self) -> &BaseTaskParam {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTaskParam {
        &mut self.base
    }

    fn clean(&mut self) -> Result<(), ConfigError> {
        match &self.module {
            Some(Value::Object(module)) if !module.is_empty() => Ok(()),
            _ => Err(ConfigError::NoTask(format!("metricbeat task {} has no module", self.base.task_id))),
        }
    }

    fn canonical(&self) -> Value {
        let module = self.module.as_ref().map(Value::to_string).unwrap_or_default();
        json!({ "module": module })
    }
}
