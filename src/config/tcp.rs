use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{BaseTaskParam, NetTaskParam, TaskConfig};
use super::{validate_request_format, validate_response_format, ConfigError};
use crate::define::MODULE_TCP;

/// TCP connect probe, optionally with a request/response exchange.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TcpTaskConfig {
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
    #[serde(default)]
    pub custom_report: bool,
}

impl TcpTaskConfig {
    /// Configured hosts, the single `target_host` first.
    pub fn hosts(&self) -> Vec<String> {
        collect_hosts(&self.target_host, &self.target_host_list)
    }
}

pub(crate) fn collect_hosts(single: &str, list: &[String]) -> Vec<String> {
    let mut hosts = Vec::with_capacity(list.len() + 1);
    if !single.is_empty() {
        hosts.push(single.to_string());
    }
    for host in list {
        if !host.is_empty() && !hosts.contains(host) {
            hosts.push(host.clone());
        }
    }
    hosts
}

impl TaskConfig for TcpTaskConfig {
    fn task_type(&self) -> &'static str {
        MODULE_TCP
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
    fn test_parse_and_defaults() {
        let mut task: TcpTaskConfig = toml::from_str(
            r#"
            task_id = 3
            period = "1m"
            timeout = "3s"
            target_host = "127.0.0.1"
            target_host_list = ["127.0.0.1", "localhost"]
            target_port = 9000
            dns_check_mode = "all"
            target_ip_type = "v4"
            "#,
        )
        .unwrap();
        task.clean().unwrap();
        assert_eq!(task.request_format, "raw");
        assert_eq!(task.response_format, "in");
        assert_eq!(task.hosts(), vec!["127.0.0.1", "localhost"]);
        assert_eq!(task.net.dns_check_mode, crate::define::CheckMode::All);
        assert_eq!(task.base.period, std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let mut task = TcpTaskConfig {
            response_format: "contains".to_string(),
            ..Default::default()
        };
        assert!(matches!(task.clean(), Err(ConfigError::Invalid(_))));
    }
}
