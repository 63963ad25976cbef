//! HTTP probe: ordered steps, each sent to every resolved address of its URLs.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_CHARSET, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, Url};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use super::{send_event, BaseTask, Task};
use crate::config::http::{HttpTaskConfig, HttpTaskStepConfig};
use crate::config::{RuntimeContext, TaskConfig};
use crate::context::Context;
use crate::define::{NamedCode, Protocol};
use crate::event::{CustomEvent, Event, EventSender, HttpEvent};
use crate::resolve::get_hosts_info;
use crate::utils::{convert_string_to_bytes, decode_charset, is_match, parse_content_type};

pub struct HttpGather {
    base: BaseTask<HttpTaskConfig>,
}

impl HttpGather {
    /// `base64://` values are decoded once here; the identity keeps the raw form.
    pub fn new(mut config: HttpTaskConfig, runtime: Arc<RuntimeContext>) -> Self {
        for step in config.steps.iter_mut() {
            step.decode_base64_fields();
        }
        Self {
            base: BaseTask::new(config, runtime),
        }
    }
}

fn wrap(conf: &HttpTaskConfig, runtime: &RuntimeContext, event: HttpEvent) -> Box<dyn Event> {
    if conf.custom_report {
        Box::new(CustomEvent::from_http(&event, &runtime.node))
    } else {
        Box::new(event)
    }
}

/// Client for one address. The URL host is pinned to `ip` so Host and SNI
/// still carry the configured name. `cookies` is shared by every step of a run.
fn build_client(conf: &HttpTaskConfig, url: &Url, ip: IpAddr, cookies: &Arc<Jar>) -> Result<Client, NamedCode> {
    let mut builder = Client::builder()
        .cookie_provider(cookies.clone())
        .timeout(conf.base.timeout)
        .connect_timeout(conf.base.timeout)
        .danger_accept_invalid_certs(conf.insecure_skip_verify)
        .pool_max_idle_per_host(0)
        .gzip(true);

    if conf.proxy.is_empty() {
        if let Some(host) = url.host_str() {
            if host.parse::<IpAddr>().is_err() {
                builder = builder.resolve(host, SocketAddr::new(ip, 0));
            }
        }
    } else {
        let proxy = reqwest::Proxy::all(conf.proxy.as_str()).map_err(|err| {
            tracing::warn!("task({}) bad proxy {}: {}", conf.base.task_id, conf.proxy, err);
            NamedCode::ConnProxyError
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|err| {
        tracing::error!("task({}) build http client failed: {}", conf.base.task_id, err);
        NamedCode::RequestInitError
    })
}

fn classify_error(conf: &HttpTaskConfig, err: &reqwest::Error) -> NamedCode {
    if err.is_builder() {
        NamedCode::RequestInitError
    } else if err.is_connect() && !conf.proxy.is_empty() {
        NamedCode::ConnProxyError
    } else if err.is_connect() && err.is_timeout() {
        NamedCode::ConnTimeout
    } else if err.is_connect() {
        NamedCode::ConnFailed
    } else if err.is_timeout() {
        NamedCode::RequestTimeout
    } else {
        NamedCode::RequestFailed
    }
}

fn build_headers(step: &HttpTaskStepConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in &step.headers {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("skip invalid header {}", key),
        }
    }
    headers
        .entry(ACCEPT_CHARSET)
        .or_insert_with(|| HeaderValue::from_static("utf-8"));
    headers
}

fn update_event_by_response(event: &mut HttpEvent, response: &reqwest::Response) {
    let status = response.status();
    event.message = status.to_string();
    event.response_code = status.as_u16();
    event.content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if let Some(content_type) = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        let (media_type, charset) = parse_content_type(content_type);
        event.media_type = media_type;
        event.charset = charset;
    }
}

/// Read at most `limit` body bytes before `deadline`.
async fn read_body(response: &mut reqwest::Response, limit: usize, deadline: Instant) -> Result<Vec<u8>, NamedCode> {
    let mut body = Vec::with_capacity(limit.min(64 * 1024));
    while body.len() < limit {
        match timeout_at(deadline, response.chunk()).await {
            Err(_) => return Err(NamedCode::ResponseTimeout),
            Ok(Err(err)) if err.is_timeout() => return Err(NamedCode::ResponseTimeout),
            Ok(Err(_)) => return Err(NamedCode::ResponseFailed),
            Ok(Ok(None)) => break,
            Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
        }
    }
    body.truncate(limit);
    Ok(body)
}

async fn gather_url(
    conf: &HttpTaskConfig,
    step: &HttpTaskStepConfig,
    cookies: &Arc<Jar>,
    event: &mut HttpEvent,
    ip: IpAddr,
) {
    let deadline = Instant::now() + conf.base.timeout;
    let url = match Url::parse(&event.url) {
        Ok(url) => url,
        Err(_) => return event.base.fail(NamedCode::BadRequestParams),
    };
    let body = match convert_string_to_bytes(&step.request, &step.request_format) {
        Ok(body) => body,
        Err(_) => return event.base.fail(NamedCode::RequestInitError),
    };
    let method = match Method::from_bytes(step.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return event.base.fail(NamedCode::RequestInitError),
    };
    let client = match build_client(conf, &url, ip, cookies) {
        Ok(client) => client,
        Err(code) => return event.base.fail(code),
    };

    tracing::info!("task({}): {} {} via {}", conf.base.task_id, step.method, url, ip);
    let request = client.request(method, url.clone()).headers(build_headers(step)).body(body);
    let mut response = match timeout_at(deadline, request.send()).await {
        Err(_) => return event.base.fail(NamedCode::RequestTimeout),
        Ok(Err(err)) => {
            tracing::error!("task({}) request failed, url={}, err: {}", conf.base.task_id, url, err);
            return event.base.fail(classify_error(conf, &err));
        }
        Ok(Ok(response)) => response,
    };
    tracing::info!("task({}): {} {} response: code={}", conf.base.task_id, step.method, url, response.status());
    update_event_by_response(event, &response);

    if !step.response_code.is_empty() && !step.response_code.contains(&event.response_code) {
        return event.base.fail(NamedCode::ResponseCodeError);
    }
    if step.response.is_empty() {
        return event.base.success_or_timeout();
    }

    let body = match read_body(&mut response, conf.buffer_size.max(1), deadline).await {
        Ok(body) => body,
        Err(code) => return event.base.fail(code),
    };
    let text = decode_charset(&body, &event.charset);
    tracing::debug!("task({}): {} response: {}", conf.base.task_id, url, text);
    if is_match(&step.response_format, text.as_bytes(), &step.response) {
        event.base.success_or_timeout();
    } else {
        event.base.fail(NamedCode::ResponseMatchError);
    }
}

#[async_trait]
impl Task for HttpGather {
    fn config(&self) -> &dyn TaskConfig {
        &self.base.config
    }

    async fn run(&self, ctx: Context, tx: EventSender) {
        let conf = Arc::new(self.base.config.clone());
        let runtime = self.base.runtime.clone();
        let cookies = Arc::new(Jar::default());

        for (index, step) in conf.steps.iter().enumerate() {
            let urls = step.urls();
            if urls.is_empty() {
                continue;
            }
            let step = Arc::new(step.clone());

            let results = get_hosts_info(
                &ctx,
                runtime.lookup.as_ref(),
                &urls,
                conf.net.dns_check_mode,
                conf.net.target_ip_type,
                Protocol::Http,
            )
            .await;

            let mut targets = Vec::new();
            for result in results {
                if result.errno != NamedCode::Ok {
                    let mut event = HttpEvent::new(conf.as_ref());
                    event.to_step(index + 1, &step.method, &result.host);
                    event.base.fail(result.errno);
                    send_event(&tx, wrap(&conf, &runtime, event)).await;
                    continue;
                }
                targets.extend(result.ips.into_iter().map(|ip| (result.host.clone(), ip)));
            }

            let mut set = JoinSet::new();
            for (url, ip) in targets {
                let permit = match self.base.semaphore.acquire(&ctx, 1).await {
                    Ok(permit) => permit,
                    Err(err) => {
                        tracing::error!("task({}) semaphore acquire failed: {}", conf.base.task_id, err);
                        while set.join_next().await.is_some() {}
                        return;
                    }
                };
                let conf = conf.clone();
                let runtime = runtime.clone();
                let step = step.clone();
                let cookies = cookies.clone();
                let tx = tx.clone();
                set.spawn(async move {
                    let _permit = permit;
                    let mut event = HttpEvent::new(conf.as_ref());
                    event.to_step(index + 1, &step.method, &url);
                    event.resolved_ip = ip.to_string();
                    gather_url(&conf, &step, &cookies, &mut event, ip).await;
                    send_event(&tx, wrap(&conf, &runtime, event)).await;
                });
            }
            while set.join_next().await.is_some() {}
        }
    }
}
