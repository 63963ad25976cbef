//! SNMP trap listener.
//!
//! Each datagram is decoded, checked against the configured communities or
//! USM users, turned into a [`TrapEvent`] and handed to the [`TrapSender`],
//! which aggregates identical traps before they reach the event sink. v1
//! and v2c informs are acknowledged with a response PDU.

pub mod event;
pub mod loss;
pub mod oid;
pub mod packet;
pub mod sender;
pub mod usm;

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_snmp::Value;
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use self::event::{
    KEY_AGENT_ADDRESS, KEY_AGENT_PORT, KEY_COMMUNITY, KEY_DISPLAY_NAME, KEY_ENTERPRISE, KEY_GENERIC_TRAP,
    KEY_SERVER_IP, KEY_SERVER_PORT, KEY_SPECIFIC_TRAP, KEY_TRAP_OID, KEY_VERSION,
};
use self::loss::UdpLossWatcher;
use self::oid::{dotted, v1_trap_oid, OidTranslator};
use self::packet::{decode_message, encode_inform_response, format_value, TrapPacket};
use self::sender::TrapSender;
use self::usm::UsmTable;
use super::{BaseTask, Schedule, Task};
use crate::config::trap::{SnmpVersion, TrapConfig};
use crate::config::{RuntimeContext, TaskConfig};
use crate::context::Context;
use crate::event::EventSender;
use crate::semaphore::Semaphore;

pub use self::event::TrapEvent;

const MAX_DATAGRAM: usize = 65535;
const INPUT_BUFFER: usize = 1024;

#[derive(Error, Debug)]
pub enum TrapError {
    #[error("wrong snmp version: {0}")]
    WrongVersion(String),
    #[error("invalid engine id {0:?}: {1}")]
    EngineId(String, String),
    #[error("usm: {0}")]
    Usm(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("unsupported message version {0}")]
    UnsupportedVersion(i64),
    #[error("unknown usm user {0}")]
    UnknownUser(String),
    #[error("authentication failed for {0}")]
    Authentication(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("community {0:?} is not allowed")]
    Community(String),
    #[error("value is not valid {0}")]
    Charset(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TrapError {
    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        TrapError::Decode(err.to_string())
    }
}

/// Decode an octet string with the configured charset.
fn decode_text(bytes: &[u8], encode: &str) -> Result<String, TrapError> {
    let encoding = match encode {
        "gbk" | "gb2312" => encoding_rs::GBK,
        "gb18030" => encoding_rs::GB18030,
        _ => return Ok(String::from_utf8_lossy(bytes).into_owned()),
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
        .ok_or_else(|| TrapError::Charset(encode.to_string()))
}

/// Per-run state derived from the task config.
#[derive(Debug)]
struct Listener {
    conf: TrapConfig,
    communities: HashSet<String>,
    allow_empty_community: bool,
    usm: UsmTable,
    translator: OidTranslator,
    raw_oids: HashSet<String>,
}

impl Listener {
    fn new(conf: TrapConfig) -> Result<Self, TrapError> {
        let version = conf.snmp_version().map_err(|_| TrapError::WrongVersion(conf.version.clone()))?;
        let usm = if version == SnmpVersion::V3 {
            UsmTable::from_config(&conf.usm_info)?
        } else {
            UsmTable::default()
        };

        let mut communities = HashSet::new();
        let mut allow_empty_community = false;
        for item in conf.community.split(',') {
            if item.is_empty() {
                allow_empty_community = true;
            } else {
                communities.insert(item.to_string());
            }
        }

        Ok(Self {
            communities,
            allow_empty_community,
            usm,
            translator: OidTranslator::new(&conf.oids),
            raw_oids: conf
                .raw_byte_oids
                .iter()
                .map(|o| o.trim_start_matches('.').to_string())
                .collect(),
            conf,
        })
    }

    fn check_community(&self, community: &str) -> bool {
        if self.conf.community.is_empty() {
            return true;
        }
        if community.is_empty() {
            return self.allow_empty_community;
        }
        self.communities.contains(community)
    }

    fn build_event(&self, packet: &TrapPacket, addr: SocketAddr) -> TrapEvent {
        let conf = &self.conf;
        let mut content = BTreeMap::new();
        let mut dimension = BTreeMap::new();

        let (mut trap_oid, mut display_name) = match &packet.trap_v1 {
            Some(trap) => {
                let (oid, name) = v1_trap_oid(trap);
                let name = if name.is_empty() { self.translator.translate(&oid) } else { name };
                (oid, name)
            }
            None => (String::new(), String::new()),
        };

        for vb in &packet.variables {
            let name = dotted(&vb.oid);
            let mut value = match &vb.value {
                Value::OctetString(bytes) => match decode_text(bytes, &conf.encode) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("skip variable {}: {}", name, e);
                        continue;
                    }
                },
                Value::ObjectIdentifier(oid) => {
                    trap_oid = dotted(oid);
                    display_name = self.translator.translate(&trap_oid);
                    continue;
                }
                other => format_value(other),
            };
            if self.raw_oids.contains(name.trim_start_matches('.')) {
                value = format_value(&vb.value);
            }

            content.insert(format!("{}({})", self.translator.translate(&name), name), value.clone());
            self.translator.update_dimension(
                &conf.report_oid_dimensions,
                conf.use_display_name_oid,
                &name,
                &value,
                &mut dimension,
            );
        }

        dimension.insert(KEY_COMMUNITY.to_string(), packet.community.clone());
        dimension.insert(KEY_VERSION.to_string(), packet.version.as_str().to_string());
        let (enterprise, generic, specific) = match &packet.trap_v1 {
            Some(trap) => (dotted(&trap.enterprise), trap.generic_trap, trap.specific_trap),
            None => (String::new(), 0, 0),
        };
        dimension.insert(KEY_ENTERPRISE.to_string(), enterprise);
        dimension.insert(KEY_GENERIC_TRAP.to_string(), generic.to_string());
        dimension.insert(KEY_SPECIFIC_TRAP.to_string(), specific.to_string());
        dimension.insert(KEY_TRAP_OID.to_string(), trap_oid);
        dimension.insert(KEY_DISPLAY_NAME.to_string(), display_name);
        dimension.insert(KEY_AGENT_ADDRESS.to_string(), addr.ip().to_string());
        if !conf.hide_agent_port {
            dimension.insert(KEY_AGENT_PORT.to_string(), addr.port().to_string());
        }
        dimension.insert(KEY_SERVER_IP.to_string(), conf.ip.clone());
        dimension.insert(KEY_SERVER_PORT.to_string(), conf.port.to_string());

        TrapEvent::new(
            conf.base.data_id,
            &conf.target,
            conf.base.labels.clone(),
            content,
            dimension,
            Utc::now().timestamp(),
        )
    }

    /// Turn one datagram into an event plus the response to send back, if any.
    fn process(&self, data: &[u8], addr: SocketAddr) -> Result<(TrapEvent, Option<Vec<u8>>), TrapError> {
        let packet = decode_message(data, &self.usm)?;
        tracing::debug!("got trap from {}: {:?}", addr, packet);
        if packet.version != SnmpVersion::V3 && !self.check_community(&packet.community) {
            return Err(TrapError::Community(packet.community));
        }
        let event = self.build_event(&packet, addr);
        Ok((event, encode_inform_response(&packet)))
    }
}

/// Receive datagrams on `socket` until `ctx` is done.
async fn serve(ctx: Context, socket: Arc<UdpSocket>, listener: Arc<Listener>, input: mpsc::Sender<TrapEvent>) {
    let semaphore = match listener.conf.concurrency {
        0 => Semaphore::Noop,
        n => Semaphore::weighted(n as u32),
    };
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, addr) = tokio::select! {
            _ = ctx.done() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("trap receive failed: {}", e);
                    continue;
                }
            },
        };
        let permit = match semaphore.acquire(&ctx, 1).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!("stop receiving traps: {}", e);
                break;
            }
        };

        let data = buf[..n].to_vec();
        let socket = socket.clone();
        let listener = listener.clone();
        let input = input.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match listener.process(&data, addr) {
                Ok((event, response)) => {
                    if let Some(response) = response {
                        if let Err(e) = socket.send_to(&response, addr).await {
                            tracing::warn!("acknowledge inform from {} failed: {}", addr, e);
                        }
                    }
                    if input.send(event).await.is_err() {
                        tracing::warn!("trap sender stopped, dropping trap from {}", addr);
                    }
                }
                Err(e) => tracing::warn!("drop trap from {}: {}", addr, e),
            }
        });
    }
}

pub struct TrapGather {
    base: BaseTask<TrapConfig>,
}

impl TrapGather {
    pub fn new(config: TrapConfig, runtime: Arc<RuntimeContext>) -> Self {
        Self {
            base: BaseTask::new(config, runtime),
        }
    }
}

#[async_trait]
impl Task for TrapGather {
    fn config(&self) -> &dyn TaskConfig {
        &self.base.config
    }

    fn schedule(&self) -> Schedule {
        Schedule::Daemon
    }

    async fn run(&self, ctx: Context, tx: EventSender) {
        let conf = self.base.config.clone();
        let task_id = conf.base.task_id;
        let listener = match Listener::new(conf.clone()) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                tracing::error!("task({}) init trap listener failed: {}", task_id, e);
                return;
            }
        };
        let socket = match UdpSocket::bind(conf.listen_addr()).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                tracing::error!("task({}) listen on {} failed: {}", task_id, conf.listen_addr(), e);
                return;
            }
        };
        tracing::info!("task({}) receiving snmp traps on {}", task_id, conf.listen_addr());

        let ctx = ctx.with_cancel();
        tokio::spawn(UdpLossWatcher::new(&self.base.runtime.proc_root).run(ctx.clone()));

        let sender = TrapSender::new(conf.base.period, conf.is_aggregate, tx);
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        // the sender outlives the receive loop so in-flight handlers can finish
        let sender = tokio::spawn(async move { sender.run(Context::background(), input_rx).await });

        serve(ctx.clone(), socket, listener, input_tx).await;
        ctx.cancel();
        if let Err(e) = sender.await {
            tracing::error!("task({}) trap sender failed: {}", task_id, e);
        }
        tracing::info!("task({}) trap listener closed", task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::oid::{SNMP_TRAP_OID, SYS_UPTIME_OID};
    use super::packet::build::*;
    use super::usm::tests::usm_info;
    use super::usm::UsmUser;
    use super::*;
    use crate::event::Event;
    use async_snmp::message::SecurityLevel;
    use async_snmp::pdu::{GenericTrap, PduType};
    use async_snmp::{Oid, VarBind};
    use bytes::Bytes;
    use std::time::Duration;

    const TEST_OID: &str = ".1.2.1234.4.5";
    const PAYLOAD: &[u8] = b"TRAPTEST1234";

    fn conf(version: &str) -> TrapConfig {
        let mut conf = TrapConfig {
            ip: "127.0.0.1".to_string(),
            port: 9162,
            community: "public".to_string(),
            version: version.to_string(),
            is_aggregate: true,
            report_oid_dimensions: vec![TEST_OID.to_string(), SYS_UPTIME_OID.to_string()],
            ..Default::default()
        };
        conf.base.data_id = 1100;
        conf.base.period = Duration::from_millis(500);
        conf
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn payload() -> Value {
        Value::OctetString(Bytes::from_static(PAYLOAD))
    }

    fn v2_vars() -> Vec<VarBind> {
        vec![
            varbind(SYS_UPTIME_OID, Value::TimeTicks(1234)),
            varbind(SNMP_TRAP_OID, Value::ObjectIdentifier(Oid::parse(".1.2.1234.0.55").unwrap())),
            varbind(TEST_OID, payload()),
        ]
    }

    #[test]
    fn test_check_community() {
        let mut c = conf("v2c");
        c.community = "public,private,".to_string();
        let listener = Listener::new(c).unwrap();
        assert!(listener.check_community("public"));
        assert!(listener.check_community("private"));
        assert!(listener.check_community(""));
        assert!(!listener.check_community("other"));

        let listener = Listener::new(conf("v2c")).unwrap();
        assert!(!listener.check_community(""));
        let bytes = v2c("other", PduType::TrapV2, 1, &v2_vars());
        assert!(matches!(listener.process(&bytes, addr()), Err(TrapError::Community(_))));

        let mut c = conf("v2c");
        c.community.clear();
        assert!(Listener::new(c).unwrap().check_community("anything"));
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(&[0xd6, 0xd0, 0xce, 0xc4], "gbk").unwrap(), "中文");
        assert!(decode_text(&[0x81], "gb18030").is_err());
        assert_eq!(decode_text(b"plain", "utf-8").unwrap(), "plain");
    }

    #[test]
    fn test_v1_event() {
        let listener = Listener::new(conf("v1")).unwrap();
        let bytes = v1_trap("public", ".1.2.1234", GenericTrap::EnterpriseSpecific, 55, &[varbind(TEST_OID, payload())]);
        let (event, response) = listener.process(&bytes, addr()).unwrap();
        assert!(response.is_none());

        let d = &event.dimension;
        assert_eq!(d["1_2_1234_4_5"], "TRAPTEST1234");
        assert_eq!(d[KEY_DISPLAY_NAME], ".1.2.1234.0.55");
        assert_eq!(d[KEY_TRAP_OID], ".1.2.1234.0.55");
        assert_eq!(d[KEY_VERSION], "v1");
        assert_eq!(d[KEY_COMMUNITY], "public");
        assert_eq!(d[KEY_ENTERPRISE], ".1.2.1234");
        assert_eq!(d[KEY_GENERIC_TRAP], "6");
        assert_eq!(d[KEY_SPECIFIC_TRAP], "55");
        assert_eq!(d[KEY_AGENT_ADDRESS], "127.0.0.1");
        assert_eq!(d[KEY_AGENT_PORT], "40000");
        assert_eq!(d[KEY_SERVER_IP], "127.0.0.1");
        assert_eq!(d[KEY_SERVER_PORT], "9162");
        assert_eq!(event.content[".1.2.1234.4.5(.1.2.1234.4.5)"], "TRAPTEST1234");
        assert_eq!(event.content[KEY_VERSION], "v1");
    }

    #[test]
    fn test_v2c_event_options() {
        let mut c = conf("v2c");
        c.hide_agent_port = true;
        c.use_display_name_oid = true;
        c.raw_byte_oids = vec![TEST_OID.to_string()];
        c.oids = BTreeMap::from([("1.2.1234".to_string(), "vendor".to_string())]);
        let listener = Listener::new(c).unwrap();

        let (event, _) = listener.process(&v2c("public", PduType::TrapV2, 1, &v2_vars()), addr()).unwrap();
        let d = &event.dimension;
        assert!(!d.contains_key(KEY_AGENT_PORT));
        assert_eq!(d[KEY_TRAP_OID], ".1.2.1234.0.55");
        assert_eq!(d[KEY_DISPLAY_NAME], "vendor.0.55");
        assert_eq!(d[KEY_ENTERPRISE], "");
        assert_eq!(d[KEY_GENERIC_TRAP], "0");
        assert_eq!(d["vendor_4_5"], "[84 82 65 80 84 69 83 84 49 50 51 52]");
        assert_eq!(d["1_3_6_1_2_1_1_3_0"], "1234");
        assert!(event.content.contains_key("vendor.4.5(.1.2.1234.4.5)"));
        assert!(!event.content.keys().any(|k| k.contains("1.3.6.1.6.3.1.1.4.1.0")));
    }

    #[test]
    fn test_v3_event() {
        let info = usm_info("test", "sha", "des", "authpriv", "8000000001020304");
        let mut c = conf("v3");
        c.usm_info = vec![info.clone()];
        let listener = Listener::new(c).unwrap();
        let user = UsmUser::from_config(&info).unwrap();

        let bytes = v3_trap(&user, SecurityLevel::AuthPriv, &v2_vars());
        let (event, response) = listener.process(&bytes, addr()).unwrap();
        assert!(response.is_none());
        assert_eq!(event.dimension[KEY_VERSION], "v3");
        assert_eq!(event.dimension[KEY_COMMUNITY], "");
        assert_eq!(event.dimension[KEY_DISPLAY_NAME], ".1.2.1234.0.55");
        assert_eq!(event.dimension["1_2_1234_4_5"], "TRAPTEST1234");
    }

    #[test]
    fn test_bad_engine_id() {
        let mut c = conf("v3");
        c.usm_info = vec![usm_info("test", "sha", "", "authnopriv", "800")];
        assert!(matches!(Listener::new(c), Err(TrapError::EngineId(_, _))));
    }

    #[test]
    fn test_process_malformed_datagram() {
        let listener = Listener::new(conf("v2c")).unwrap();
        let bytes = v2c("public", PduType::TrapV2, 1, &v2_vars());
        for cut in [1, 2, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(listener.process(&bytes[..cut], addr()), Err(TrapError::Decode(_))),
                "cut at {}",
                cut
            );
        }
        assert!(listener.process(&[0x30, 0x84, 0xff, 0xff], addr()).is_err());
        assert!(listener.process(&[], addr()).is_err());
    }

    async fn start(conf: TrapConfig) -> (SocketAddr, Context, mpsc::Receiver<Box<dyn Event>>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let listener = Arc::new(Listener::new(conf.clone()).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(16);
        let ctx = Context::background();
        tokio::spawn(async move {
            TrapSender::new(conf.base.period, conf.is_aggregate, tx)
                .run(Context::background(), input_rx)
                .await
        });
        tokio::spawn(serve(ctx.clone(), socket, listener, input_tx));
        (local, ctx, rx)
    }

    #[tokio::test]
    async fn test_v1_aggregated_end_to_end() {
        let (local, ctx, mut rx) = start(conf("v1")).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = v1_trap("public", ".1.2.1234", GenericTrap::EnterpriseSpecific, 55, &[varbind(TEST_OID, payload())]);
        for _ in 0..3 {
            client.send_to(&bytes, local).await.unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let map = event.as_map_str();
        let record = &map["data"][0];
        assert_eq!(record["dimension"]["display_name"], ".1.2.1234.0.55");
        assert_eq!(record["dimension"]["version"], "v1");
        assert_eq!(record["dimension"]["1_2_1234_4_5"], "TRAPTEST1234");
        assert_eq!(record["event"]["count"], 3);
        assert_eq!(map["dataid"], 1100);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_garbage_does_not_stop_listener() {
        let mut c = conf("v2c");
        c.is_aggregate = false;
        let (local, ctx, mut rx) = start(c).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = v2c("public", PduType::TrapV2, 1, &v2_vars());
        client.send_to(&bytes[..bytes.len() / 2], local).await.unwrap();
        client.send_to(b"\x30\x84\x00", local).await.unwrap();
        client.send_to(&bytes, local).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.as_map_str()["data"][0]["dimension"]["1_2_1234_4_5"], "TRAPTEST1234");
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_inform_acknowledged() {
        let mut c = conf("v2c");
        c.is_aggregate = false;
        let (local, ctx, mut rx) = start(c).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&v2c("public", PduType::InformRequest, 99, &v2_vars()), local)
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = decode_message(&buf[..n], &UsmTable::default()).unwrap();
        assert_eq!(response.pdu_type, PduType::Response);
        assert_eq!(response.request_id, 99);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.as_map_str()["data"][0]["event"]["count"], 1);
        ctx.cancel();
    }
}
