//! Parameters shared by every task and the identity hash.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ConfigError;
use crate::define::{CheckMode, IpType};

/// One CMDB label set. Events are replicated once per label set.
pub type Label = BTreeMap<String, String>;

/// Scheduling and routing parameters common to all tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseTaskParam {
    /// Identity hash, written by `init_ident`.
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub data_id: i32,
    #[serde(default)]
    pub task_id: i32,
    #[serde(default, rename = "bk_biz_id")]
    pub biz_id: i32,
    #[serde(default, with = "humantime_serde")]
    pub period: Duration,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub available_duration: Duration,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl BaseTaskParam {
    /// Fields that affect behaviour. `ident` and `labels` are left out.
    pub fn canonical(&self) -> Value {
        json!({
            "data_id": self.data_id,
            "task_id": self.task_id,
            "bk_biz_id": self.biz_id,
            "period": self.period.as_nanos() as u64,
            "timeout": self.timeout.as_nanos() as u64,
            "available_duration": self.available_duration.as_nanos() as u64,
        })
    }
}

/// Address family and DNS fan-out settings of network tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetTaskParam {
    #[serde(default)]
    pub target_ip_type: IpType,
    #[serde(default)]
    pub dns_check_mode: CheckMode,
}

impl NetTaskParam {
    pub fn canonical(&self) -> Value {
        json!({
            "target_ip_type": self.target_ip_type.as_str(),
            "dns_check_mode": self.dns_check_mode.as_str(),
        })
    }
}

/// Behaviour shared by every task configuration variant.
pub trait TaskConfig: Debug + Send + Sync {
    /// Module name, e.g. `tcp` or `snmptrap`.
    fn task_type(&self) -> &'static str;

    fn base(&self) -> &BaseTaskParam;

    fn base_mut(&mut self) -> &mut BaseTaskParam;

    /// Variant specific defaults and validation.
    fn clean(&mut self) -> Result<(), ConfigError>;

    /// Canonical form of the variant's own fields used for the identity hash.
    fn canonical(&self) -> Value;

    /// Response buffer size for variants that read payloads.
    fn buffer_size_mut(&mut self) -> Option<&mut usize> {
        None
    }

    fn net(&self) -> Option<&NetTaskParam> {
        None
    }

    fn ident(&self) -> &str {
        &self.base().ident
    }

    fn init_ident(&mut self) {
        let ident = compute_ident(self.task_type(), self.base(), &self.canonical());
        self.base_mut().ident = ident;
    }
}

/// MD5 hex digest over `{type, base, task}` serialized with sorted keys.
pub fn compute_ident(task_type: &str, base: &BaseTaskParam, task: &Value) -> String {
    let doc = json!({
        "type": task_type,
        "base": base.canonical(),
        "task": task,
    });
    let mut hasher = Md5::new();
    hasher.update(doc.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
