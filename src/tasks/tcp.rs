//! TCP probe: connect, optionally exchange a payload and match the reply.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use super::{address_deadline, send_event, BaseTask, Task};
use crate::config::tcp::TcpTaskConfig;
use crate::config::{RuntimeContext, TaskConfig};
use crate::context::Context;
use crate::define::{NamedCode, Protocol};
use crate::event::{CustomEvent, Event, EventSender, SimpleEvent};
use crate::resolve::get_hosts_info;
use crate::utils::{convert_string_to_bytes, is_match};

/// Byte stream returned by a [`Dialer`].
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Connection seam so probes can be driven without a network.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<Box<dyn Conn>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<Box<dyn Conn>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

pub struct TcpGather {
    base: BaseTask<TcpTaskConfig>,
    dialer: Arc<dyn Dialer>,
}

impl TcpGather {
    pub fn new(config: TcpTaskConfig, runtime: Arc<RuntimeContext>) -> Self {
        Self {
            base: BaseTask::new(config, runtime),
            dialer: Arc::new(TcpDialer),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_semaphore(mut self, semaphore: crate::semaphore::Semaphore) -> Self {
        self.base = self.base.with_semaphore(semaphore);
        self
    }
}

fn new_event(conf: &TcpTaskConfig, host: &str) -> SimpleEvent {
    let mut event = SimpleEvent::new(conf);
    event.target_host = host.to_string();
    event.target_port = conf.target_port;
    event
}

fn wrap(conf: &TcpTaskConfig, runtime: &RuntimeContext, event: SimpleEvent) -> Box<dyn Event> {
    if conf.custom_report {
        Box::new(CustomEvent::from_simple(&event, &runtime.node))
    } else {
        Box::new(event)
    }
}

/// Exchange with one address. Every path ends in `fail` or `success_or_timeout`.
async fn exchange(
    conf: &TcpTaskConfig,
    dialer: &dyn Dialer,
    request: &[u8],
    event: &mut SimpleEvent,
    ip: IpAddr,
    deadline: Instant,
) {
    let addr = SocketAddr::new(ip, conf.target_port);

    let mut conn = match timeout_at(deadline, dialer.dial(addr)).await {
        Err(_) => return event.base.fail(NamedCode::ConnTimeout),
        Ok(Err(err)) => {
            tracing::debug!("task({}) dial {} failed: {}", conf.base.task_id, addr, err);
            return event.base.fail(NamedCode::from_connect_error(&err));
        }
        Ok(Ok(conn)) => conn,
    };

    if conf.response.is_empty() {
        return event.base.success_or_timeout();
    }

    if !request.is_empty() {
        match timeout_at(deadline, conn.write_all(request)).await {
            Err(_) => return event.base.fail(NamedCode::RequestTimeout),
            Ok(Err(err)) => {
                tracing::debug!("task({}) write to {} failed: {}", conf.base.task_id, addr, err);
                return event.base.fail(NamedCode::RequestFailed);
            }
            Ok(Ok(())) => {}
        }
    }

    let mut buf = vec![0u8; conf.buffer_size.max(1)];
    let count = match timeout_at(deadline, conn.read(&mut buf)).await {
        Err(_) => return event.base.fail(NamedCode::ResponseTimeout),
        Ok(Err(err)) => {
            tracing::debug!("task({}) read from {} failed: {}", conf.base.task_id, addr, err);
            return event.base.fail(NamedCode::ResponseFailed);
        }
        Ok(Ok(0)) => return event.base.fail(NamedCode::ResponseEmptyError),
        Ok(Ok(n)) => n,
    };

    if is_match(&conf.response_format, &buf[..count], &conf.response) {
        event.base.success_or_timeout();
    } else {
        tracing::debug!(
            "task({}) response from {} not matched: {:?}",
            conf.base.task_id,
            addr,
            String::from_utf8_lossy(&buf[..count])
        );
        event.base.fail(NamedCode::ResponseMatchError);
    }
}

#[async_trait]
impl Task for TcpGather {
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
            Protocol::Tcp,
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
            for ip in result.ips {
                targets.push((result.host.clone(), ip));
            }
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
            let dialer = self.dialer.clone();
            let request = request.clone();
            let tx = tx.clone();
            set.spawn(async move {
                let _permit = permit;
                let mut event = new_event(&conf, &host);
                event.resolved_ip = ip.to_string();
                exchange(&conf, dialer.as_ref(), &request, &mut event, ip, deadline).await;
                send_event(&tx, wrap(&conf, &runtime, event)).await;
            });
        }
        while set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::tests::MockLookup;
    use crate::semaphore::Semaphore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn conf(port: u16) -> TcpTaskConfig {
        let mut conf = TcpTaskConfig {
            target_host: "127.0.0.1".to_string(),
            target_port: port,
            buffer_size: 1024,
            ..Default::default()
        };
        conf.base.task_id = 1;
        conf.base.data_id = 1009;
        conf.base.timeout = Duration::from_secs(2);
        conf.base.period = Duration::from_secs(60);
        conf.clean().unwrap();
        conf
    }

    async fn run_once(gather: &TcpGather) -> Vec<serde_json::Map<String, serde_json::Value>> {
        run_within(gather, Duration::from_secs(5)).await
    }

    async fn run_within(gather: &TcpGather, limit: Duration) -> Vec<serde_json::Map<String, serde_json::Value>> {
        let (tx, mut rx) = mpsc::channel(64);
        gather.run(Context::background().with_timeout(limit), tx).await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.as_map_str());
        }
        out
    }

    async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let _ = stream.write_all(&buf[..n]).await;
                    }
                });
            }
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_connect_ok_then_refused() {
        let (port, server) = echo_server().await;
        let gather = TcpGather::new(conf(port), Arc::new(RuntimeContext::default()));

        let events = run_once(&gather).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["error_code"], 0);
        assert_eq!(events[0]["resolved_ip"], "127.0.0.1");

        server.abort();
        let _ = server.await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = run_once(&gather).await;
        assert_eq!(events.len(), 1);
        let code = events[0]["error_code"].as_i64().unwrap();
        assert!(code == NamedCode::ConnRefused.code() as i64 || code == NamedCode::ConnFailed.code() as i64);
    }

    #[tokio::test]
    async fn test_run_deadline_bounds_read() {
        // accepts and holds the connection without answering
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut c = conf(port);
        c.base.timeout = Duration::from_secs(30);
        c.request = "hello".to_string();
        c.response = "hello".to_string();
        let gather = TcpGather::new(c, Arc::new(RuntimeContext::default()));

        let started = std::time::Instant::now();
        let events = run_within(&gather, Duration::from_millis(300)).await;
        assert_eq!(events[0]["error_code"], NamedCode::ResponseTimeout.code());
        assert!(started.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn test_response_match() {
        let (port, server) = echo_server().await;
        let mut c = conf(port);
        c.request = "hello".to_string();
        c.response = "hello".to_string();
        c.response_format = "eq".to_string();
        let gather = TcpGather::new(c.clone(), Arc::new(RuntimeContext::default()));
        assert_eq!(run_once(&gather).await[0]["error_code"], 0);

        c.response = "bye".to_string();
        let gather = TcpGather::new(c, Arc::new(RuntimeContext::default()));
        assert_eq!(run_once(&gather).await[0]["error_code"], NamedCode::ResponseMatchError.code());
        server.abort();
    }

    #[derive(Default)]
    struct CountingDialer {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _addr: SocketAddr) -> io::Result<Box<dyn Conn>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound_and_completeness() {
        let mut c = conf(80);
        c.target_host = String::new();
        c.target_host_list = (1..=10).map(|i| format!("10.0.0.{}", i)).collect();
        c.target_host_list.push("bad host name".to_string());

        let dialer = Arc::new(CountingDialer::default());
        let runtime = RuntimeContext::default().with_lookup(Arc::new(MockLookup::default()));
        let gather = TcpGather::new(c, Arc::new(runtime))
            .with_dialer(dialer.clone())
            .with_semaphore(Semaphore::weighted(3));

        let events = run_once(&gather).await;
        // ten probed addresses plus the unresolvable host, reported first
        assert_eq!(events.len(), 11);
        assert_eq!(events[0]["error_code"], NamedCode::ConnDnsResolveError.code());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 10);
        assert!(dialer.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(events[1..].iter().all(|e| e["error_code"] == 0));
    }

    #[tokio::test]
    async fn test_empty_hosts_emit_nothing() {
        let mut c = conf(80);
        c.target_host = String::new();
        let gather = TcpGather::new(c, Arc::new(RuntimeContext::default()));
        assert!(run_once(&gather).await.is_empty());
    }
}
