//! UDP probe with retries.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use super::{address_deadline, send_event, BaseTask, Task};
use crate::config::udp::UdpTaskConfig;
use crate::config::{RuntimeContext, TaskConfig};
use crate::context::Context;
use crate::define::{NamedCode, Protocol};
use crate::event::{CustomEvent, Event, EventSender, SimpleEvent};
use crate::resolve::get_hosts_info;
use crate::utils::{convert_string_to_bytes, is_match};

pub struct UdpGather {
    base: BaseTask<UdpTaskConfig>,
}

impl UdpGather {
    pub fn new(config: UdpTaskConfig, runtime: Arc<RuntimeContext>) -> Self {
        Self {
            base: BaseTask::new(config, runtime),
        }
    }
}

/// Outcome of a single attempt.
enum Attempt {
    Done,
    Retry(NamedCode),
    Abort(NamedCode),
}

fn new_event(conf: &UdpTaskConfig, host: &str) -> SimpleEvent {
    let mut event = SimpleEvent::new(conf);
    event.target_host = host.to_string();
    event.target_port = conf.target_port;
    event
}

fn wrap(conf: &UdpTaskConfig, runtime: &RuntimeContext, event: SimpleEvent) -> Box<dyn Event> {
    if conf.custom_report {
        Box::new(CustomEvent::from_simple(&event, &runtime.node))
    } else {
        Box::new(event)
    }
}

async fn connect(addr: SocketAddr) -> io::Result<UdpSocket> {
    let bind = match addr.ip() {
        IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

fn classify_io(err: &io::Error, fallback: NamedCode) -> Attempt {
    match err.kind() {
        // ICMP port unreachable: the port is closed, retrying cannot help
        io::ErrorKind::ConnectionRefused => Attempt::Abort(NamedCode::ConnRefused),
        _ => Attempt::Retry(fallback),
    }
}

async fn attempt(conf: &UdpTaskConfig, socket: &UdpSocket, request: &[u8], deadline: Instant) -> Attempt {
    match timeout_at(deadline, socket.send(request)).await {
        Err(_) => return Attempt::Retry(NamedCode::RequestTimeout),
        Ok(Err(err)) => return classify_io(&err, NamedCode::RequestFailed),
        Ok(Ok(_)) => {}
    }

    let expect_silence = conf.response.is_empty();
    if expect_silence && !conf.wait_empty_response {
        return Attempt::Done;
    }

    let mut buf = vec![0u8; conf.buffer_size.max(1)];
    let count = match timeout_at(deadline, socket.recv(&mut buf)).await {
        Err(_) if expect_silence => return Attempt::Done,
        Err(_) => return Attempt::Retry(NamedCode::ResponseTimeout),
        Ok(Err(err)) => return classify_io(&err, NamedCode::ResponseFailed),
        Ok(Ok(n)) => n,
    };

    if expect_silence || is_match(&conf.response_format, &buf[..count], &conf.response) {
        Attempt::Done
    } else {
        Attempt::Abort(NamedCode::ResponseMatchError)
    }
}

/// Up to `times` attempts sharing the time left before `deadline` evenly.
async fn exchange(conf: &UdpTaskConfig, request: &[u8], event: &mut SimpleEvent, ip: IpAddr, deadline: Instant) {
    let addr = SocketAddr::new(ip, conf.target_port);
    let socket = match connect(addr).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::debug!("task({}) udp connect {} failed: {}", conf.base.task_id, addr, err);
            return event.base.fail(NamedCode::from_connect_error(&err));
        }
    };

    let times = conf.times.max(1);
    let mut last = NamedCode::ResponseTimeout;
    for i in 0..times {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let per_attempt = (deadline - now) / (times - i);
        match attempt(conf, &socket, request, now + per_attempt).await {
            Attempt::Done => return event.base.success_or_timeout(),
            Attempt::Abort(code) => return event.base.fail(code),
            Attempt::Retry(code) => {
                tracing::debug!("task({}) udp attempt {} to {} failed: {}", conf.base.task_id, i + 1, addr, code);
                last = code;
            }
        }
    }
    event.base.fail(last);
}

#[async_trait]
impl Task for UdpGather {
    fn config(&self) -> &dyn TaskConfig {
        &self.base.config
    }

    async fn run(&self, ctx: Context, tx: EventSender) {
        let conf = Arc::new(self.base.config.clone());
        let runtime = self.base.runtime.clone();
        let hosts = conf.hosts();
        if hosts.is_empty() {
            return;
        }

        let request = match convert_string_to_bytes(&conf.request, &conf.request_format) {
            Ok(bytes) => Arc::new(bytes),
            Err(err) => {
                tracing::error!("task({}) invalid request payload: {}", conf.base.task_id, err);
                for host in &hosts {
                    let mut event = new_event(&conf, host);
                    event.base.fail(NamedCode::RequestInitError);
                    send_event(&tx, wrap(&conf, &runtime, event)).await;
                }
                return;
            }
        };

        let results = get_hosts_info(
            &ctx,
            runtime.lookup.as_ref(),
            &hosts,
            conf.net.dns_check_mode,
            conf.net.target_ip_type,
            Protocol::Udp,
        )
        .await;

        let mut targets = Vec::new();
        for result in results {
            if result.errno != NamedCode::Ok {
                let mut event = new_event(&conf, &result.host);
                event.base.fail(result.errno);
                send_event(&tx, wrap(&conf, &runtime, event)).await;
                continue;
            }
            targets.extend(result.ips.into_iter().map(|ip| (result.host.clone(), ip)));
        }

        let mut set = JoinSet::new();
        for (host, ip) in targets {
            let permit = match self.base.semaphore.acquire(&ctx, 1).await {
                Ok(permit) => permit,
                Err(err) => {
                    tracing::error!("task({}) semaphore acquire failed: {}", conf.base.task_id, err);
                    break;
                }
            };
            let deadline = address_deadline(&ctx, conf.base.timeout);
            let conf = conf.clone();
            let runtime = runtime.clone();
            let request = request.clone();
            let tx = tx.clone();
            set.spawn(async move {
                let _permit = permit;
                let mut event = new_event(&conf, &host);
                event.resolved_ip = ip.to_string();
                exchange(&conf, &request, &mut event, ip, deadline).await;
                send_event(&tx, wrap(&conf, &runtime, event)).await;
            });
        }
        while set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn conf(port: u16) -> UdpTaskConfig {
        let mut conf = UdpTaskConfig {
            target_host: "127.0.0.1".to_string(),
            target_port: port,
            request: "ping".to_string(),
            response: "pong".to_string(),
            response_format: "eq".to_string(),
            buffer_size: 512,
            times: 3,
            ..Default::default()
        };
        conf.base.timeout = Duration::from_millis(900);
        conf.base.period = Duration::from_secs(60);
        conf.clean().unwrap();
        conf
    }

    async fn run_once(conf: UdpTaskConfig) -> Vec<serde_json::Map<String, serde_json::Value>> {
        run_within(conf, Duration::from_secs(5)).await
    }

    async fn run_within(conf: UdpTaskConfig, limit: Duration) -> Vec<serde_json::Map<String, serde_json::Value>> {
        let gather = UdpGather::new(conf, Arc::new(RuntimeContext::default()));
        let (tx, mut rx) = mpsc::channel(16);
        gather.run(Context::background().with_timeout(limit), tx).await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.as_map_str());
        }
        out
    }

    async fn pong_server() -> (u16, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                if &buf[..n] == b"ping" {
                    let _ = socket.send_to(b"pong", peer).await;
                }
            }
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_udp_match() {
        let (port, server) = pong_server().await;
        let events = run_once(conf(port)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["error_code"], 0);
        server.abort();
    }

    #[tokio::test]
    async fn test_refused_short_circuits_retries() {
        let port = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let started = std::time::Instant::now();
        let events = run_once(conf(port)).await;
        assert_eq!(events[0]["error_code"], NamedCode::ConnRefused.code());
        // one attempt is 300ms, three would be 900ms
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_silent_peer() {
        // bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let events = run_once(conf(port)).await;
        assert_eq!(events[0]["error_code"], NamedCode::ResponseTimeout.code());

        let mut c = conf(port);
        c.response = String::new();
        c.wait_empty_response = true;
        c.times = 1;
        let events = run_once(c).await;
        assert_eq!(events[0]["error_code"], 0);
        drop(silent);
    }

    #[tokio::test]
    async fn test_attempts_share_run_deadline() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let mut c = conf(port);
        c.base.timeout = Duration::from_secs(30);
        let started = std::time::Instant::now();
        let events = run_within(c, Duration::from_millis(300)).await;
        assert_eq!(events[0]["error_code"], NamedCode::ResponseTimeout.code());
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(silent);
    }
}
