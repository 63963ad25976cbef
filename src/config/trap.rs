use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::base::{BaseTaskParam, TaskConfig};
use super::ConfigError;
use crate::define::MODULE_TRAP;

/// SNMP protocol version accepted by a trap listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

impl SnmpVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "v1" | "1" => Some(SnmpVersion::V1),
            "v2" | "v2c" | "2" | "2c" => Some(SnmpVersion::V2c),
            "v3" | "3" => Some(SnmpVersion::V3),
            _ => None,
        }
    }

    /// From the `msgVersion` field on the wire.
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(SnmpVersion::V1),
            1 => Some(SnmpVersion::V2c),
            3 => Some(SnmpVersion::V3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SnmpVersion::V1 => "v1",
            SnmpVersion::V2c => "v2c",
            SnmpVersion::V3 => "v3",
        }
    }
}

/// Credentials of one SNMPv3 user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsmConfig {
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub authentication_protocol: String,
    #[serde(default)]
    pub authentication_passphrase: String,
    #[serde(default)]
    pub privacy_protocol: String,
    #[serde(default)]
    pub privacy_passphrase: String,
    /// Hex pairs, e.g. `8000000001020304`.
    #[serde(default)]
    pub authoritative_engine_id: String,
    #[serde(default)]
    pub authoritative_engine_boots: u32,
    #[serde(default)]
    pub authoritative_engine_time: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsmInfo {
    /// `noauthnopriv`, `authnopriv`, `authpriv` or `reportable`.
    #[serde(default)]
    pub msg_flags: String,
    #[serde(default)]
    pub context_name: String,
    #[serde(default)]
    pub usm_config: UsmConfig,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    162
}

fn default_encode() -> String {
    "utf-8".to_string()
}

/// SNMP trap listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TrapConfig {
    #[serde(flatten)]
    pub base: BaseTaskParam,
    #[serde(default = "default_listen_ip", rename = "listen_ip")]
    pub ip: String,
    #[serde(default = "default_port", rename = "listen_port")]
    pub port: u16,
    /// Comma separated. An empty entry accepts traps without community.
    #[serde(default)]
    pub community: String,
    #[serde(default, rename = "snmp_version")]
    pub version: String,
    #[serde(default)]
    pub usm_info: Vec<UsmInfo>,
    /// OID prefix to display name translation table.
    #[serde(default, rename = "oid_translate")]
    pub oids: BTreeMap<String, String>,
    #[serde(default)]
    pub report_oid_dimensions: Vec<String>,
    #[serde(default)]
    pub raw_byte_oids: Vec<String>,
    /// Charset of octet string values.
    #[serde(default = "default_encode")]
    pub encode: String,
    #[serde(default, rename = "aggregate")]
    pub is_aggregate: bool,
    #[serde(default)]
    pub use_display_name_oid: bool,
    #[serde(default)]
    pub hide_agent_port: bool,
    /// In-flight packet handlers. Zero means unbounded.
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default)]
    pub target: String,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            base: BaseTaskParam::default(),
            ip: default_listen_ip(),
            port: default_port(),
            community: String::new(),
            version: "v2c".to_string(),
            usm_info: Vec::new(),
            oids: BTreeMap::new(),
            report_oid_dimensions: Vec::new(),
            raw_byte_oids: Vec::new(),
            encode: default_encode(),
            is_aggregate: false,
            use_display_name_oid: false,
            hide_agent_port: false,
            concurrency: 0,
            target: String::new(),
        }
    }
}

impl TrapConfig {
    pub fn snmp_version(&self) -> Result<SnmpVersion, ConfigError> {
        SnmpVersion::parse(&self.version).ok_or_else(|| ConfigError::WrongVersion(self.version.clone()))
    }

    /// Socket address string, bracketing IPv6 literals.
    pub fn listen_addr(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.ip, self.port),
            _ => format!("{}:{}", self.ip, self.port),
        }
    }
}

impl TaskConfig for TrapConfig {
    fn task_type(&self) -> &'static str {
        MODULE_TRAP
    }

    fn base(&self) -> &BaseTaskParam {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTaskParam {
        &mut self.base
    }

    fn clean(&mut self) -> Result<(), ConfigError> {
        if self.version.is_empty() {
            self.version = "v2c".to_string();
        }
        let version = self.snmp_version()?;
        self.version = version.as_str().to_string();
        if self.encode.is_empty() {
            self.encode = default_encode();
        }
        self.encode = self.encode.to_ascii_lowercase();
        if version == SnmpVersion::V3 && self.usm_info.is_empty() {
            return Err(ConfigError::Invalid("snmp v3 trap task without usm_info".to_string()));
        }
        Ok(())
    }

    fn canonical(&self) -> Value {
        json!({
            "listen_ip": self.ip,
            "listen_port": self.port,
            "community": self.community,
            "snmp_version": self.version,
            "usm_info": self.usm_info,
            "oid_translate": self.oids,
            "report_oid_dimensions": self.report_oid_dimensions,
            "raw_byte_oids": self.raw_byte_oids,
            "encode": self.encode,
            "aggregate": self.is_aggregate,
            "use_display_name_oid": self.use_display_name_oid,
            "hide_agent_port": self.hide_agent_port,
            "concurrency": self.concurrency,
            "target": self.target,
        })
    }
}
