use std::collections::BTreeMap;

use chrono::{Local, TimeZone};
use serde_json::{json, Value};

use super::oid::SYS_UPTIME_OID;
use crate::config::Label;
use crate::define::MODULE_TRAP;
use crate::event::CustomEvent;

pub const KEY_COMMUNITY: &str = "community";
pub const KEY_VERSION: &str = "version";
pub const KEY_ENTERPRISE: &str = "enterprise";
pub const KEY_GENERIC_TRAP: &str = "generic_trap";
pub const KEY_SPECIFIC_TRAP: &str = "specific_trap";
pub const KEY_TRAP_OID: &str = "snmptrapoid";
pub const KEY_DISPLAY_NAME: &str = "display_name";
pub const KEY_AGENT_ADDRESS: &str = "agent_address";
pub const KEY_AGENT_PORT: &str = "agent_port";
pub const KEY_SERVER_IP: &str = "server_ip";
pub const KEY_SERVER_PORT: &str = "server_port";
pub const KEY_TIMESTAMP: &str = "timestamp";

const EVENT_NAME: &str = "snmptrap";

/// One received trap, or several identical ones once aggregated.
#[derive(Debug, Clone, PartialEq)]
pub struct TrapEvent {
    pub data_id: i32,
    pub target: String,
    pub content: BTreeMap<String, String>,
    pub dimension: BTreeMap<String, String>,
    pub count: u32,
    /// Unix seconds of receipt.
    pub timestamp: i64,
    pub labels: Vec<Label>,
    /// Aggregation key.
    pub hash_content: String,
}

fn is_volatile(key: &str) -> bool {
    key == KEY_AGENT_PORT
        || key == KEY_TIMESTAMP
        || key.trim_matches('.') == SYS_UPTIME_OID.trim_matches('.')
        || key.ends_with(&format!("({})", SYS_UPTIME_OID))
}

impl TrapEvent {
    /// Finish an event from its variable content and dimensions. Every
    /// dimension is also copied into the content.
    pub fn new(
        data_id: i32,
        target: &str,
        labels: Vec<Label>,
        mut content: BTreeMap<String, String>,
        dimension: BTreeMap<String, String>,
        timestamp: i64,
    ) -> Self {
        for (key, value) in &dimension {
            content.insert(key.clone(), value.clone());
        }
        let formatted = Local
            .timestamp_opt(timestamp, 0)
            .single()
            .map(|t| t.format("%H:%M:%S %Y/%m/%d").to_string())
            .unwrap_or_default();
        content.insert(KEY_TIMESTAMP.to_string(), formatted);

        let mut hash_content = String::new();
        for key in content.keys().filter(|k| !is_volatile(k)) {
            let value = dimension.get(key).map(String::as_str).unwrap_or("");
            hash_content.push_str(&format!("{} {} ", key, value));
        }

        Self {
            data_id,
            target: target.to_string(),
            content,
            dimension,
            count: 1,
            timestamp,
            labels,
            hash_content,
        }
    }

    pub fn to_record(&self) -> Value {
        let content = serde_json::to_string(&self.content).unwrap_or_else(|e| {
            tracing::error!("marshal trap content failed: {}", e);
            String::new()
        });
        json!({
            "event_name": EVENT_NAME,
            "event": {
                "content": content,
                "count": self.count,
            },
            "dimension": self.dimension,
            "target": self.target,
            "timestamp": self.timestamp * 1000,
        })
    }

    pub fn into_custom_event(self) -> CustomEvent {
        let record = self.to_record();
        CustomEvent::wrap(MODULE_TRAP, self.data_id, self.timestamp, vec![record], false, self.labels)
    }
}
