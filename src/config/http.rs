use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{BaseTaskParam, NetTaskParam, TaskConfig};
use super::{validate_request_format, validate_response_format, ConfigError};
use crate::define::MODULE_HTTP;
use crate::utils::decode_base64_value;

fn default_method() -> String {
    "GET".to_string()
}

/// One request of an HTTP probe sequence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpTaskStepConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub url_list: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub request_format: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub response_format: String,
    /// Accepted status codes. Empty accepts any.
    #[serde(default)]
    pub response_code: Vec<u16>,
}

impl HttpTaskStepConfig {
    pub fn urls(&self) -> Vec<String> {
        let mut urls = Vec::with_capacity(self.url_list.len() + 1);
        if !self.url.is_empty() {
            urls.push(self.url.clone());
        }
        for url in &self.url_list {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Decode `base64://` values in request, response and headers.
    pub fn decode_base64_fields(&mut self) {
        self.request = decode_base64_value(&self.request);
        self.response = decode_base64_value(&self.response);
        for value in self.headers.values_mut() {
            *value = decode_base64_value(value);
        }
    }

    fn canonical(&self) -> Value {
        json!({
            "method": self.method,
            "url": self.url,
            "url_list": self.url_list,
            "headers": self.headers,
            "request": self.request,
            "request_format": self.request_format,
            "response": self.response,
            "response_format": self.response_format,
            "response_code": self.response_code,
        })
    }
}

/// Multi-step HTTP probe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpTaskConfig {
    #[serde(flatten)]
    pub base: BaseTaskParam,
    #[serde(flatten)]
    pub net: NetTaskParam,
    /// Forward proxy URL. Empty dials the resolved address directly.
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub buffer_size: usize,
    #[serde(default)]
    pub custom_report: bool,
    #[serde(default)]
    pub steps: Vec<HttpTaskStepConfig>,
}

impl TaskConfig for HttpTaskConfig {
    fn task_type(&self) -> &'static str {
        MODULE_HTTP
    }

    fn base(&self) -> &BaseTaskParam {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTaskParam {
        &mut self.base
    }

    fn clean(&mut self) -> Result<(), ConfigError> {
        for step in self.steps.iter_mut() {
            if step.method.is_empty() {
                step.method = default_method();
            }
            step.method = step.method.to_ascii_uppercase();
            if step.request_format.is_empty() {
                step.request_format = crate::utils::FORMAT_RAW.to_string();
            }
            if step.response_format.is_empty() {
                step.response_format = "in".to_string();
            }
            validate_request_format(&step.request_format)?;
            validate_response_format(&step.response_format)?;
            if reqwest::Method::from_bytes(step.method.as_bytes()).is_err() {
                return Err(ConfigError::Invalid(format!("http method {}", step.method)));
            }
        }
        Ok(())
    }

    fn canonical(&self) -> Value {
        let steps: Vec<Value> = self.steps.iter().map(HttpTaskStepConfig::canonical).collect();
        json!({
            "net": self.net.canonical(),
            "proxy": self.proxy,
            "insecure_skip_verify": self.insecure_skip_verify,
            "buffer_size": self.buffer_size,
            "custom_report": self.custom_report,
            "steps": steps,
        })
    }

    fn buffer_size_mut(&mut self) -> Option<&mut usize> {
        Some(&mut self.buffer_size)
    }

    fn net(&self) -> Option<&NetTaskParam> {
        Some(&self.net)
    }
}
