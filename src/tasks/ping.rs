//! Ping probe with native ICMP and a `ping` command fallback.
//!
//! Echo requests run on blocking sockets inside `spawn_blocking` so round trip
//! times are not skewed by the async scheduler.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::process::Command;
use tokio::task::JoinSet;

use super::{send_event, BaseTask, ProbeError, Task};
use crate::config::ping::{PingTarget, PingTaskConfig};
use crate::config::{RuntimeContext, TaskConfig};
use crate::context::Context;
use crate::define::{GatherStatus, NamedCode, Protocol};
use crate::event::{CustomEvent, Event, EventSender, PingEvent};
use crate::resolve::resolve_host;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4)).is_ok() {
        tracing::info!("ping: using native ICMP (raw socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::ICMPV4)).is_ok() {
        tracing::info!("ping: using native ICMP (datagram socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("ping: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Aggregated result of `total` echo requests to one address.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    pub total: u32,
    pub received: u32,
    /// Milliseconds.
    pub min_rtt: f64,
    pub max_rtt: f64,
    pub avg_rtt: f64,
}

impl PingStats {
    pub fn from_rtts(total: u32, rtts: &[Duration]) -> Self {
        let ms: Vec<f64> = rtts.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let received = ms.len() as u32;
        let (min_rtt, max_rtt, avg_rtt) = if ms.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                ms.iter().cloned().fold(f64::MAX, f64::min),
                ms.iter().cloned().fold(0.0, f64::max),
                ms.iter().sum::<f64>() / ms.len() as f64,
            )
        };
        Self {
            total,
            received,
            min_rtt,
            max_rtt,
            avg_rtt,
        }
    }

    pub fn loss_percent(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        f64::from(self.total - self.received.min(self.total)) / f64::from(self.total)
    }
}

/// Send `count` echo requests of `size` payload bytes, one every `interval`.
pub async fn ping_address(ip: IpAddr, count: u32, size: usize, interval: Duration, timeout: Duration) -> Result<PingStats, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(ip, count, size, interval, timeout).await;
    }

    let result = tokio::task::spawn_blocking(move || run_blocking_pings(ip, count, size, interval, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

    match result {
        Ok(stats) => Ok(stats),
        Err(ProbeError::Network(msg)) if msg.contains("ermission") || msg.contains("not permitted") => {
            tracing::warn!("native ping to {} not permitted, falling back to command: {}", ip, msg);
            run_ping_command(ip, count, size, interval, timeout).await
        }
        Err(err) => Err(err),
    }
}

fn open_icmp_socket(ip: IpAddr) -> Result<Socket, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, SockProtocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, SockProtocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("create ICMP socket: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("connect: {}", e)))?;
    Ok(socket)
}

fn run_blocking_pings(ip: IpAddr, count: u32, size: usize, interval: Duration, timeout: Duration) -> Result<PingStats, ProbeError> {
    let socket = open_icmp_socket(ip)?;
    let per_echo = timeout / count.max(1);
    let identifier: u16 = rand::random();
    let mut rtts = Vec::with_capacity(count as usize);

    for i in 0..count {
        if i > 0 && !interval.is_zero() {
            std::thread::sleep(interval);
        }
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        if let Some(rtt) = echo_once(&socket, ip, identifier, sequence, size, per_echo)? {
            rtts.push(rtt);
        }
    }
    Ok(PingStats::from_rtts(count, &rtts))
}

/// One echo exchange. `None` when no matching reply arrives in time.
fn echo_once(socket: &Socket, ip: IpAddr, identifier: u16, sequence: u16, size: usize, timeout: Duration) -> Result<Option<Duration>, ProbeError> {
    let packet = match ip {
        IpAddr::V4(_) => build_echo_request(8, identifier, sequence, size, true),
        IpAddr::V6(_) => build_echo_request(128, identifier, sequence, size, false),
    };
    let reply_type = if ip.is_ipv4() { 0 } else { 129 };

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("send: {}", e))
        }
    })?;

    let mut buf = [0u8; 65536];
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(d) if !d.is_zero() => d,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("set timeout: {}", e)))?;
        let len = match (&*socket).read(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(ProbeError::Network(format!("recv: {}", e))),
        };
        let elapsed = start.elapsed();
        if let Some((kind, id, seq)) = parse_echo_reply(&buf[..len], ip.is_ipv4()) {
            // datagram sockets rewrite the identifier, so only the sequence is reliable there
            if kind == reply_type && seq == sequence && (id == identifier || socket_is_dgram(socket)) {
                return Ok(Some(elapsed));
            }
        }
    }
}

fn socket_is_dgram(socket: &Socket) -> bool {
    matches!(socket.r#type(), Ok(t) if t == Type::DGRAM)
}

/// Type, identifier and sequence of an ICMP message, skipping an IPv4 header if present.
fn parse_echo_reply(buf: &[u8], v4: bool) -> Option<(u8, u16, u16)> {
    let offset = if v4 && buf.first().map(|b| b >> 4) == Some(4) {
        usize::from(buf[0] & 0x0f) * 4
    } else {
        0
    };
    let icmp = buf.get(offset..offset + 8)?;
    Some((
        icmp[0],
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    ))
}

/// Echo request with `size` payload bytes. The ICMPv6 checksum is left to the kernel.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16, size: usize, checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + size];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = (i & 0xff) as u8;
    }
    if checksum {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(ip: IpAddr, count: u32, size: usize, interval: Duration, timeout: Duration) -> Result<PingStats, ProbeError> {
    let wait_secs = (timeout / count.max(1)).as_secs().max(1);
    let mut cmd = Command::new("ping");
    if ip.is_ipv6() {
        cmd.arg("-6");
    }
    cmd.args(["-n", "-c", &count.to_string(), "-s", &size.to_string(), "-W", &wait_secs.to_string()]);
    if !interval.is_zero() {
        cmd.args(["-i", &format!("{:.3}", interval.as_secs_f64().max(0.2))]);
    }
    let output = cmd
        .arg(ip.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout, count)
}

/// Parse the summary of a `ping -c` run.
fn parse_ping_output(output: &str, count: u32) -> Result<PingStats, ProbeError> {
    static RE_RECEIVED: OnceLock<Regex> = OnceLock::new();
    let re_received = RE_RECEIVED
        .get_or_init(|| Regex::new(r"(?P<sent>\d+) packets transmitted, (?P<recv>\d+) (?:packets )?received").unwrap());

    static RE_RTT: OnceLock<Regex> = OnceLock::new();
    let re_rtt = RE_RTT.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = ([0-9.]+)/([0-9.]+)/([0-9.]+)").unwrap()
    });

    let caps = re_received
        .captures(output)
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))?;
    let total = caps["sent"].parse().unwrap_or(count);
    let received = caps["recv"].parse().unwrap_or(0);

    let mut stats = PingStats {
        total,
        received,
        min_rtt: 0.0,
        max_rtt: 0.0,
        avg_rtt: 0.0,
    };
    if let Some(rtt) = re_rtt.captures(output) {
        stats.min_rtt = rtt[1].parse().unwrap_or(0.0);
        stats.avg_rtt = rtt[2].parse().unwrap_or(0.0);
        stats.max_rtt = rtt[3].parse().unwrap_or(0.0);
    }
    Ok(stats)
}

pub struct PingGather {
    base: BaseTask<PingTaskConfig>,
}

impl PingGather {
    pub fn new(config: PingTaskConfig, runtime: Arc<RuntimeContext>) -> Self {
        Self {
            base: BaseTask::new(config, runtime),
        }
    }
}

fn new_event(conf: &PingTaskConfig, target: &PingTarget, ip: &str) -> PingEvent {
    let mut event = PingEvent::new(conf);
    event.dimensions.insert("target".into(), target.target.clone());
    event.dimensions.insert("target_type".into(), target.target_type.clone());
    event.dimensions.insert("resolved_ip".into(), ip.to_string());
    event
}

fn fill_failure(event: &mut PingEvent, code: NamedCode) {
    event.status = GatherStatus::Error;
    event.dimensions.insert("error_code".into(), code.code().to_string());
    event.metrics.insert("loss_percent".into(), json!(1.0));
    event.metrics.insert("max_rtt".into(), json!(0.0));
    event.metrics.insert("min_rtt".into(), json!(0.0));
    event.metrics.insert("avg_rtt".into(), json!(0.0));
}

fn fill_stats(event: &mut PingEvent, stats: &PingStats) {
    let code = if stats.received == 0 { NamedCode::Timeout } else { NamedCode::Ok };
    event.status = if code == NamedCode::Ok { GatherStatus::Ok } else { GatherStatus::Error };
    event.dimensions.insert("error_code".into(), code.code().to_string());
    event.metrics.insert("loss_percent".into(), json!(stats.loss_percent()));
    event.metrics.insert("max_rtt".into(), json!(stats.max_rtt));
    event.metrics.insert("min_rtt".into(), json!(stats.min_rtt));
    event.metrics.insert("avg_rtt".into(), json!(stats.avg_rtt));
}

#[async_trait]
impl Task for PingGather {
    fn config(&self) -> &dyn TaskConfig {
        &self.base.config
    }

    async fn run(&self, ctx: Context, tx: EventSender) {
        let conf = Arc::new(self.base.config.clone());
        let runtime = self.base.runtime.clone();
        let mut events = Vec::new();

        let mut targets = Vec::new();
        for target in &conf.targets {
            let result = resolve_host(
                &ctx,
                runtime.lookup.as_ref(),
                &target.target,
                conf.net.dns_check_mode,
                conf.net.target_ip_type,
                Protocol::Icmp,
            )
            .await;
            if result.errno != NamedCode::Ok {
                tracing::warn!("task({}) ping target {} unresolved: {}", conf.base.task_id, target.target, result.errno);
                let mut event = new_event(&conf, target, "");
                fill_failure(&mut event, result.errno);
                events.push(event);
                continue;
            }
            targets.extend(result.ips.into_iter().map(|ip| (target.clone(), ip)));
        }

        let mut set = JoinSet::new();
        for (target, ip) in targets {
            let permit = match self.base.semaphore.acquire(&ctx, 1).await {
                Ok(permit) => permit,
                Err(err) => {
                    tracing::error!("task({}) semaphore acquire failed: {}", conf.base.task_id, err);
                    break;
                }
            };
            let conf = conf.clone();
            set.spawn(async move {
                let _permit = permit;
                let mut event = new_event(&conf, &target, &ip.to_string());
                match ping_address(ip, conf.total_num, conf.ping_size, conf.send_interval, conf.base.timeout).await {
                    Ok(stats) => fill_stats(&mut event, &stats),
                    Err(err) => {
                        tracing::error!("task({}) ping {} failed: {}", conf.base.task_id, ip, err);
                        fill_failure(&mut event, NamedCode::Unknown);
                    }
                }
                event
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(event) => events.push(event),
                Err(err) => tracing::error!("task({}) ping worker failed: {}", conf.base.task_id, err),
            }
        }

        if conf.custom_report {
            if let Some(event) = CustomEvent::from_ping(&events, &runtime.node) {
                send_event(&tx, Box::new(event)).await;
            }
            return;
        }
        for event in events {
            send_event(&tx, Box::new(event) as Box<dyn Event>).await;
        }
    }
}
