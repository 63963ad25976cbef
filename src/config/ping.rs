use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::base::{BaseTaskParam, NetTaskParam, TaskConfig};
use super::ConfigError;
use crate::define::MODULE_PING;

pub const MIN_PING_SIZE: usize = 8;
pub const DEFAULT_TOTAL_NUM: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingTarget {
    pub target: String,
    /// `ip` or `domain`.
    #[serde(default)]
    pub target_type: String,
}

/// ICMP echo probe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PingTaskConfig {
    #[serde(flatten)]
    pub base: BaseTaskParam,
    #[serde(flatten)]
    pub net: NetTaskParam,
    #[serde(default)]
    pub targets: Vec<PingTarget>,
    /// Echo requests per address.
    #[serde(default)]
    pub total_num: u32,
    /// Payload bytes per echo request.
    #[serde(default)]
    pub ping_size: usize,
    #[serde(default, with = "humantime_serde")]
    pub send_interval: Duration,
    #[serde(default)]
    pub custom_report: bool,
}

impl PingTaskConfig {
    pub fn hosts(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.target.clone()).collect()
    }
}

impl TaskConfig for PingTaskConfig {
    fn task_type(&self) -> &'static str {
        MODULE_PING
    }

    fn base(&self) -> &BaseTaskParam {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTaskParam {
        &mut self.base
    }

    fn clean(&mut self) -> Result<(), ConfigError> {
        if self.ping_size < MIN_PING_SIZE {
            self.ping_size = MIN_PING_SIZE;
        }
        if self.total_num == 0 {
            self.total_num = DEFAULT_TOTAL_NUM;
        }
        for target in self.targets.iter_mut() {
            if target.target_type.is_empty() {
                target.target_type = if target.target.parse::<std::net::IpAddr>().is_ok() {
                    "ip".to_string()
                } else {
                    "domain".to_string()
                };
            }
            match target.target_type.as_str() {
                "ip" | "domain" => {}
                other => return Err(ConfigError::WrongTargetType(other.to_string())),
            }
        }
        Ok(())
    }

    fn canonical(&self) -> Value {
        json!({
            "net": self.net.canonical(),
            "targets": self.targets,
            "total_num": self.total_num,
            "ping_size": self.ping_size,
            "send_interval": self.send_interval.as_nanos() as u64,
            "custom_report": self.custom_report,
        })
    }

    fn net(&self) -> Option<&NetTaskParam> {
        Some(&self.net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let mut task = PingTaskConfig {
            targets: vec![
                PingTarget { target: "10.0.0.1".to_string(), target_type: String::new() },
                PingTarget { target: "example.com".to_string(), target_type: String::new() },
            ],
            ping_size: 2,
            ..Default::default()
        };
        task.clean().unwrap();
        assert_eq!(task.ping_size, MIN_PING_SIZE);
        assert_eq!(task.total_num, DEFAULT_TOTAL_NUM);
        assert_eq!(task.targets[0].target_type, "ip");
        assert_eq!(task.targets[1].target_type, "domain");
    }

    #[test]
    fn test_wrong_target_type() {
        let mut task = PingTaskConfig {
            targets: vec![PingTarget { target: "x".to_string(), target_type: "url".to_string() }],
            ..Default::default()
        };
        assert!(matches!(task.clean(), Err(ConfigError::WrongTargetType(t)) if t == "url"));
    }
}
