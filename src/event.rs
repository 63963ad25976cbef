//! Events produced by tasks and their structured serialization.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::config::{Label, NodeInfo, TaskConfig};
use crate::define::{GatherStatus, NamedCode, MODULE_PING};

pub type MapStr = Map<String, Value>;

/// Anything a task can hand to the sink.
pub trait Event: Debug + Send + Sync {
    fn as_map_str(&self) -> MapStr;

    fn get_type(&self) -> &str;

    fn ignore_cmdb_level(&self) -> bool {
        false
    }
}

pub type EventSender = mpsc::Sender<Box<dyn Event>>;
pub type EventReceiver = mpsc::Receiver<Box<dyn Event>>;

/// Outcome fields shared by probe events.
#[derive(Debug, Clone)]
pub struct BaseEvent {
    pub data_id: i32,
    pub biz_id: i32,
    pub task_id: i32,
    pub task_type: String,
    pub available: f64,
    pub status: GatherStatus,
    pub error_code: NamedCode,
    pub start_at: DateTime<Utc>,
    /// Set once the exchange completed, whatever its outcome.
    pub end_at: Option<DateTime<Utc>>,
    pub available_duration: Duration,
    pub labels: Vec<Label>,
}

impl BaseEvent {
    pub fn new(conf: &dyn TaskConfig) -> Self {
        let base = conf.base();
        Self {
            data_id: base.data_id,
            biz_id: base.biz_id,
            task_id: base.task_id,
            task_type: conf.task_type().to_string(),
            available: 0.0,
            status: GatherStatus::Unknown,
            error_code: NamedCode::Unknown,
            start_at: Utc::now(),
            end_at: None,
            available_duration: base.available_duration,
            labels: base.labels.clone(),
        }
    }

    pub fn fail(&mut self, code: NamedCode) {
        self.status = GatherStatus::Error;
        self.error_code = code;
        self.end_at = Some(Utc::now());
        self.available = 0.0;
    }

    pub fn success(&mut self) {
        self.status = GatherStatus::Ok;
        self.error_code = NamedCode::Ok;
        self.end_at = Some(Utc::now());
        self.available = 1.0;
    }

    /// Success, unless the exchange outlasted `available_duration`.
    pub fn success_or_timeout(&mut self) {
        if self.end_at.is_none() {
            self.end_at = Some(Utc::now());
        }
        if self.available_duration > Duration::from_nanos(1) && self.task_duration() > self.available_duration {
            tracing::debug!("task {} exceeded available duration", self.task_id);
            self.fail(NamedCode::Timeout);
        } else {
            let end_at = self.end_at;
            self.success();
            self.end_at = end_at;
        }
    }

    pub fn task_duration(&self) -> Duration {
        self.end_at
            .and_then(|end| (end - self.start_at).to_std().ok())
            .unwrap_or_default()
    }

    pub fn as_map_str(&self) -> MapStr {
        let mut map = MapStr::new();
        map.insert("dataid".into(), json!(self.data_id));
        map.insert("bk_biz_id".into(), json!(self.biz_id));
        map.insert("task_id".into(), json!(self.task_id));
        map.insert("timestamp".into(), json!(self.start_at.timestamp()));
        map.insert("task_type".into(), json!(self.task_type));
        map.insert("status".into(), json!(self.status.value()));
        map.insert("error_code".into(), json!(self.error_code.code()));
        map.insert("available".into(), json!(self.available));
        map.insert("task_duration".into(), json!(self.task_duration().as_millis() as u64));
        map.insert("group_info".into(), json!(self.labels));
        map
    }
}

/// TCP and UDP probe result.
#[derive(Debug, Clone)]
pub struct SimpleEvent {
    pub base: BaseEvent,
    pub target_host: String,
    pub target_port: u16,
    /// Address actually probed.
    pub resolved_ip: String,
}

impl SimpleEvent {
    pub fn new(conf: &dyn TaskConfig) -> Self {
        Self {
            base: BaseEvent::new(conf),
            target_host: String::new(),
            target_port: 0,
            resolved_ip: String::new(),
        }
    }
}

impl Event for SimpleEvent {
    fn as_map_str(&self) -> MapStr {
        let mut map = self.base.as_map_str();
        map.insert("target_host".into(), json!(self.target_host));
        map.insert("target_port".into(), json!(self.target_port));
        map.insert("resolved_ip".into(), json!(self.resolved_ip));
        map
    }

    fn get_type(&self) -> &str {
        &self.base.task_type
    }
}

/// Result of one HTTP step against one address.
#[derive(Debug, Clone)]
pub struct HttpEvent {
    pub base: BaseEvent,
    pub step: usize,
    pub method: String,
    pub url: String,
    pub resolved_ip: String,
    pub message: String,
    pub response_code: u16,
    pub content_length: i64,
    pub media_type: String,
    pub charset: String,
}

impl HttpEvent {
    pub fn new(conf: &dyn TaskConfig) -> Self {
        Self {
            base: BaseEvent::new(conf),
            step: 0,
            method: String::new(),
            url: String::new(),
            resolved_ip: String::new(),
            message: String::new(),
            response_code: 0,
            content_length: 0,
            media_type: String::new(),
            charset: String::new(),
        }
    }

    pub fn to_step(&mut self, step: usize, method: &str, url: &str) {
        self.step = step;
        self.method = method.to_string();
        self.url = url.to_string();
    }
}

impl Event for HttpEvent {
    fn as_map_str(&self) -> MapStr {
        let mut map = self.base.as_map_str();
        map.insert("steps".into(), json!(self.step));
        map.insert("method".into(), json!(self.method));
        map.insert("url".into(), json!(self.url));
        map.insert("resolved_ip".into(), json!(self.resolved_ip));
        map.insert("message".into(), json!(self.message));
        map.insert("response_code".into(), json!(self.response_code));
        map.insert("content_length".into(), json!(self.content_length));
        map.insert("media_type".into(), json!(self.media_type));
        map.insert("charset".into(), json!(self.charset));
        map
    }

    fn get_type(&self) -> &str {
        &self.base.task_type
    }
}

/// Ping statistics of one address.
#[derive(Debug, Clone)]
pub struct PingEvent {
    pub data_id: i32,
    pub biz_id: i32,
    pub task_id: i32,
    pub status: GatherStatus,
    pub time: DateTime<Utc>,
    pub labels: Vec<Label>,
    pub metrics: MapStr,
    pub dimensions: BTreeMap<String, String>,
}

impl PingEvent {
    pub fn new(conf: &dyn TaskConfig) -> Self {
        let base = conf.base();
        Self {
            data_id: base.data_id,
            biz_id: base.biz_id,
            task_id: base.task_id,
            status: GatherStatus::Ok,
            time: Utc::now(),
            labels: base.labels.clone(),
            metrics: MapStr::new(),
            dimensions: BTreeMap::new(),
        }
    }

    fn full_dimensions(&self) -> BTreeMap<String, String> {
        let mut dimensions = self.dimensions.clone();
        dimensions.insert("bk_biz_id".into(), self.biz_id.to_string());
        dimensions.insert("task_id".into(), self.task_id.to_string());
        dimensions
    }
}

impl Event for PingEvent {
    fn as_map_str(&self) -> MapStr {
        let mut map = MapStr::new();
        map.insert("dataid".into(), json!(self.data_id));
        map.insert("status".into(), json!(self.status.value()));
        map.insert("time".into(), json!(self.time.timestamp()));
        map.insert("metrics".into(), Value::Object(self.metrics.clone()));
        map.insert("group_info".into(), json!(self.labels));
        map.insert("dimensions".into(), json!(self.full_dimensions()));
        map.insert("bk_biz_id".into(), json!(self.biz_id));
        map
    }

    fn get_type(&self) -> &str {
        MODULE_PING
    }

    fn ignore_cmdb_level(&self) -> bool {
        true
    }
}

/// Time series style record list, replicated once per label set.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub event_type: String,
    pub data: MapStr,
    pub ignore_cmdb_level: bool,
    pub labels: Vec<Label>,
}

fn node_dimensions(node: &NodeInfo) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("node_id".to_string(), node.node_id()),
        ("ip".to_string(), node.ip.clone()),
        ("bk_cloud_id".to_string(), node.cloud_id.to_string()),
        ("bk_agent_id".to_string(), node.agent_id.clone()),
    ])
}

impl CustomEvent {
    pub fn new(event_type: &str, data: MapStr, ignore_cmdb_level: bool, labels: Vec<Label>) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            ignore_cmdb_level,
            labels,
        }
    }

    pub(crate) fn wrap(event_type: &str, data_id: i32, ts: i64, records: Vec<Value>, ignore: bool, labels: Vec<Label>) -> Self {
        let mut data = MapStr::new();
        data.insert("dataid".into(), json!(data_id));
        data.insert("data".into(), Value::Array(records));
        data.insert("time".into(), json!(ts));
        data.insert("timestamp".into(), json!(ts));
        Self::new(event_type, data, ignore, labels)
    }

    pub fn from_simple(e: &SimpleEvent, node: &NodeInfo) -> Self {
        let ts = e.base.start_at.timestamp();
        let mut dimensions = node_dimensions(node);
        dimensions.extend([
            ("bk_biz_id".to_string(), e.base.biz_id.to_string()),
            ("target_host".to_string(), e.target_host.clone()),
            ("target_port".to_string(), e.target_port.to_string()),
            ("task_id".to_string(), e.base.task_id.to_string()),
            ("task_type".to_string(), e.base.task_type.clone()),
            ("status".to_string(), e.base.status.value().to_string()),
            ("resolved_ip".to_string(), e.resolved_ip.clone()),
            ("error_code".to_string(), e.base.error_code.code().to_string()),
        ]);
        let record = json!({
            "target": format!("{}:{}", e.target_host, e.target_port),
            "dimension": dimensions,
            "metrics": {
                "available": e.base.available,
                "task_duration": e.base.task_duration().as_millis() as u64,
            },
            "timestamp": ts * 1000,
        });
        Self::wrap(e.get_type(), e.base.data_id, ts, vec![record], e.ignore_cmdb_level(), e.base.labels.clone())
    }

    pub fn from_http(e: &HttpEvent, node: &NodeInfo) -> Self {
        let ts = e.base.start_at.timestamp();
        let mut dimensions = node_dimensions(node);
        dimensions.extend([
            ("bk_biz_id".to_string(), e.base.biz_id.to_string()),
            ("url".to_string(), e.url.clone()),
            ("method".to_string(), e.method.clone()),
            ("steps".to_string(), e.step.to_string()),
            ("task_id".to_string(), e.base.task_id.to_string()),
            ("task_type".to_string(), e.base.task_type.clone()),
            ("status".to_string(), e.base.status.value().to_string()),
            ("resolved_ip".to_string(), e.resolved_ip.clone()),
            ("error_code".to_string(), e.base.error_code.code().to_string()),
            ("response_code".to_string(), e.response_code.to_string()),
            ("media_type".to_string(), e.media_type.clone()),
        ]);
        let record = json!({
            "target": e.url,
            "dimension": dimensions,
            "metrics": {
                "available": e.base.available,
                "task_duration": e.base.task_duration().as_millis() as u64,
                "response_code": e.response_code,
                "content_length": e.content_length,
            },
            "timestamp": ts * 1000,
        });
        Self::wrap(e.get_type(), e.base.data_id, ts, vec![record], e.ignore_cmdb_level(), e.base.labels.clone())
    }

    /// One custom event covering every ping address of a run. `None` when empty.
    pub fn from_ping(events: &[PingEvent], node: &NodeInfo) -> Option<Self> {
        let first = events.first()?;
        let records = events
            .iter()
            .map(|e| {
                let mut dimensions = e.full_dimensions();
                dimensions.extend(node_dimensions(node));
                json!({
                    "target": dimensions.get("target").cloned().unwrap_or_default(),
                    "dimension": dimensions,
                    "metrics": e.metrics,
                    "timestamp": e.time.timestamp() * 1000,
                })
            })
            .collect();
        Some(Self::wrap(
            first.get_type(),
            first.data_id,
            first.time.timestamp(),
            records,
            first.ignore_cmdb_level(),
            first.labels.clone(),
        ))
    }
}

impl Event for CustomEvent {
    fn as_map_str(&self) -> MapStr {
        let mut data = self.data.clone();
        if self.labels.is_empty() {
            return data;
        }
        let records = match data.get("data") {
            Some(Value::Array(records)) => records.clone(),
            _ => {
                data.insert("data".into(), Value::Array(Vec::new()));
                return data;
            }
        };

        let mut replicated = Vec::with_capacity(records.len() * self.labels.len());
        for record in &records {
            for label in &self.labels {
                let mut record = record.clone();
                if let Value::Object(fields) = &mut record {
                    let dimension = fields
                        .entry("dimension")
                        .or_insert_with(|| Value::Object(MapStr::new()));
                    if !dimension.is_object() {
                        *dimension = Value::Object(MapStr::new());
                    }
                    if let Value::Object(dimension) = dimension {
                        for (k, v) in label {
                            dimension.insert(k.clone(), Value::String(v.clone()));
                        }
                    }
                }
                replicated.push(record);
            }
        }
        data.insert("data".into(), Value::Array(replicated));
        data
    }

    fn get_type(&self) -> &str {
        &self.event_type
    }

    fn ignore_cmdb_level(&self) -> bool {
        self.ignore_cmdb_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tcp::TcpTaskConfig;

    fn conf() -> TcpTaskConfig {
        let mut conf = TcpTaskConfig::default();
        conf.base.data_id = 1009;
        conf.base.task_id = 5;
        conf
    }

    #[test]
    fn test_end_at_unset_until_outcome() {
        let c = conf();
        let mut e = SimpleEvent::new(&c);
        assert!(e.base.end_at.is_none());
        e.base.fail(NamedCode::ConnRefused);
        assert!(e.base.end_at.is_some());
        assert_eq!(e.base.available, 0.0);
        assert_eq!(e.as_map_str()["error_code"], json!(3003));
    }

    #[test]
    fn test_success_or_timeout() {
        let mut c = conf();
        c.base.available_duration = Duration::from_millis(100);
        let mut e = BaseEvent::new(&c);
        e.start_at = Utc::now() - chrono::Duration::seconds(1);
        e.success_or_timeout();
        assert_eq!(e.error_code, NamedCode::Timeout);

        let mut e = BaseEvent::new(&c);
        e.success_or_timeout();
        assert_eq!(e.error_code, NamedCode::Ok);
        assert_eq!(e.status, GatherStatus::Ok);
    }

    #[test]
    fn test_custom_event_label_replication() {
        let mut c = conf();
        c.base.labels = vec![
            Label::from([("bk_target_ip".to_string(), "10.0.0.1".to_string())]),
            Label::from([("bk_target_ip".to_string(), "10.0.0.2".to_string())]),
        ];
        let mut e = SimpleEvent::new(&c);
        e.target_host = "example.com".into();
        e.target_port = 80;
        e.base.success();

        let custom = CustomEvent::from_simple(&e, &NodeInfo::default());
        let map = custom.as_map_str();
        let data = map["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["dimension"]["bk_target_ip"], "10.0.0.1");
        assert_eq!(data[1]["dimension"]["bk_target_ip"], "10.0.0.2");
        assert_eq!(data[0]["target"], "example.com:80");
    }

    #[test]
    fn test_custom_event_without_labels() {
        let c = conf();
        let e = SimpleEvent::new(&c);
        let custom = CustomEvent::from_simple(&e, &NodeInfo::default());
        assert_eq!(custom.as_map_str()["data"].as_array().unwrap().len(), 1);
    }
}
