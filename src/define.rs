//! Shared constants, task type names and the named error code table.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MODULE_TCP: &str = "tcp";
pub const MODULE_UDP: &str = "udp";
pub const MODULE_HTTP: &str = "http";
pub const MODULE_PING: &str = "ping";
pub const MODULE_TRAP: &str = "snmptrap";
pub const MODULE_METRICBEAT: &str = "metricbeat";

/// Default in-flight probe limit shared by every task of one type.
pub const DEFAULT_CONCURRENCY_PER_INSTANCE: u32 = 100_000;
/// Default in-flight probe limit of a single task.
pub const DEFAULT_CONCURRENCY_PER_TASK: u32 = 1000;

/// Gather status carried by probe events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherStatus {
    Ok,
    Error,
    Unknown,
}

impl GatherStatus {
    pub fn value(self) -> i32 {
        match self {
            GatherStatus::Ok => 0,
            GatherStatus::Error => 1,
            GatherStatus::Unknown => -1,
        }
    }
}

/// Error codes reported in probe events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedCode {
    Ok,
    Unknown,
    Timeout,
    BadRequestParams,
    ConnFailed,
    ConnTimeout,
    ConnRefused,
    ConnProxyError,
    ConnDnsResolveError,
    InvalidIp,
    RequestFailed,
    RequestTimeout,
    RequestInitError,
    RequestDeadlineError,
    ResponseFailed,
    ResponseTimeout,
    ResponseMatchError,
    ResponseCodeError,
    ResponseEmptyError,
    ResponseNotFindIpv4,
    ResponseNotFindIpv6,
}

impl NamedCode {
    pub fn code(self) -> i32 {
        match self {
            NamedCode::Ok => 0,
            NamedCode::Unknown => 1,
            NamedCode::Timeout => 2,
            NamedCode::BadRequestParams => 3,
            NamedCode::ConnFailed => 3001,
            NamedCode::ConnTimeout => 3002,
            NamedCode::ConnRefused => 3003,
            NamedCode::ConnProxyError => 3004,
            NamedCode::ConnDnsResolveError => 3005,
            NamedCode::InvalidIp => 3006,
            NamedCode::RequestFailed => 3101,
            NamedCode::RequestTimeout => 3102,
            NamedCode::RequestInitError => 3103,
            NamedCode::RequestDeadlineError => 3104,
            NamedCode::ResponseFailed => 3201,
            NamedCode::ResponseTimeout => 3202,
            NamedCode::ResponseMatchError => 3203,
            NamedCode::ResponseCodeError => 3204,
            NamedCode::ResponseEmptyError => 3205,
            NamedCode::ResponseNotFindIpv4 => 3206,
            NamedCode::ResponseNotFindIpv6 => 3207,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NamedCode::Ok => "ok",
            NamedCode::Unknown => "unknown",
            NamedCode::Timeout => "timeout",
            NamedCode::BadRequestParams => "bad_request_params",
            NamedCode::ConnFailed => "conn_failed",
            NamedCode::ConnTimeout => "conn_timeout",
            NamedCode::ConnRefused => "conn_refused",
            NamedCode::ConnProxyError => "conn_proxy_error",
            NamedCode::ConnDnsResolveError => "conn_dns_resolve_error",
            NamedCode::InvalidIp => "invalid_ip",
            NamedCode::RequestFailed => "request_failed",
            NamedCode::RequestTimeout => "request_timeout",
            NamedCode::RequestInitError => "request_init_error",
            NamedCode::RequestDeadlineError => "request_deadline_error",
            NamedCode::ResponseFailed => "response_failed",
            NamedCode::ResponseTimeout => "response_timeout",
            NamedCode::ResponseMatchError => "response_match_error",
            NamedCode::ResponseCodeError => "response_code_error",
            NamedCode::ResponseEmptyError => "response_empty_error",
            NamedCode::ResponseNotFindIpv4 => "response_not_find_ipv4",
            NamedCode::ResponseNotFindIpv6 => "response_not_find_ipv6",
        }
    }

    /// Classify an I/O error from the connect phase.
    pub fn from_connect_error(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => NamedCode::ConnRefused,
            std::io::ErrorKind::TimedOut => NamedCode::ConnTimeout,
            _ => NamedCode::ConnFailed,
        }
    }
}

impl fmt::Display for NamedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// IP family preference for resolved targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpType {
    #[default]
    #[serde(alias = "0")]
    Auto,
    #[serde(alias = "4", alias = "ipv4")]
    V4,
    #[serde(alias = "6", alias = "ipv6")]
    V6,
}

impl IpType {
    pub fn as_str(self) -> &'static str {
        match self {
            IpType::Auto => "auto",
            IpType::V4 => "v4",
            IpType::V6 => "v6",
        }
    }
}

/// How many resolved addresses of a domain get probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    All,
    #[default]
    Single,
}

impl CheckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckMode::All => "all",
            CheckMode::Single => "single",
        }
    }
}

/// Protocol of a host list, decides how a host string is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Icmp,
}
