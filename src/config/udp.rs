use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{BaseTaskParam, NetTaskParam, TaskConfig};
use super::tcp::collect_hosts;
use super::{validate_request_format, validate_response_format, ConfigError};
use crate::define::MODULE_UDP;

/// UDP request/response probe with retries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UdpTaskConfig {
    #[serde(flatten)]
    pub base: BaseTaskParam,
    #[serde(flatten)]
    pub net: NetTaskParam,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_host_list: Vec<String>,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub request_format: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub response_format: String,
    #[serde(default)]
    pub buffer_size: usize,
    /// Attempts per address within one run.
    #[serde(default)]
    pub times: u32,
    /// Treat a silent peer as healthy when no response is expected.
    #[serde(default)]
    pub wait_empty_response: bool,
    #[serde(default)]
    pub custom_report: bool,
}

impl UdpTaskConfig {
    pub fn hosts(&self) -> Vec<String> {
        collect_hosts(&self.target_host, &self.target_host_list)
    }
}

impl TaskConfig for UdpTaskConfig {
    fn task_type(&self) -> &'static str {
        MODULE_UDP
    }

    fn base(&self) -> &BaseTaskParam {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTaskParam {
        &mut self.base
    }

    fn clean(&mut self) -> Result<(), ConfigError> {
        if self.request_format.is_empty() {
            self.request_format = crate::utils::FORMAT_RAW.to_string();
        }
        if self.response_format.is_empty() {
            self.response_format = "in".to_string();
        }
        if self.times == 0 {
            self.times = 1;
        }
        validate_request_format(&self.request_format)?;
        validate_response_format(&self.response_format)?;
        Ok(())
    }

    fn canonical(&self) -> Value {
        json!({
            "net": self.net.canonical(),
            "target_host": self.target_host,
            "target_host_list": self.target_host_list,
            "target_port": self.target_port,
            "request": self.request,
            "request_format": self.request_format,
            "response": self.response,
            "response_format": self.response_format,
            "buffer_size": self.buffer_size,
            "times": self.times,
            "wait_empty_response": self.wait_empty_response,
            "custom_report": self.custom_report,
        })
    }

    fn buffer_size_mut(&mut self) -> Option<&mut usize> {
        Some(&mut self.buffer_size)
    }

    fn net(&self) -> Option<&NetTaskParam> {
        Some(&self.net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_at_least_one() {
        let mut task = UdpTaskConfig::default();
        task.clean().unwrap();
        assert_eq!(task.times, 1);

        task.times = 3;
        task.clean().unwrap();
        assert_eq!(task.times, 3);
    }
}
