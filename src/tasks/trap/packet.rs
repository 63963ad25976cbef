//! SNMP message decoding for trap and inform PDUs.

use std::net::Ipv4Addr;

use async_snmp::ber::Decoder;
use async_snmp::message::{CommunityMessage, MsgGlobalData};
use async_snmp::pdu::{Pdu, PduType, TrapV1Pdu};
use async_snmp::v3::UsmSecurityParams;
use async_snmp::{Value, VarBind};
use bytes::Bytes;

use super::oid::dotted;
use super::usm::UsmTable;
use super::TrapError;
use crate::config::trap::SnmpVersion;

/// A decoded notification.
#[derive(Debug, Clone)]
pub struct TrapPacket {
    pub version: SnmpVersion,
    pub community: String,
    pub pdu_type: PduType,
    pub request_id: i32,
    /// Header of a v1 trap. Its variables are kept in `variables`.
    pub trap_v1: Option<TrapV1Pdu>,
    pub variables: Vec<VarBind>,
    pub user_name: String,
    pub context_name: String,
}

impl TrapPacket {
    fn new(version: SnmpVersion) -> Self {
        Self {
            version,
            community: String::new(),
            pdu_type: PduType::TrapV2,
            request_id: 0,
            trap_v1: None,
            variables: Vec::new(),
            user_name: String::new(),
            context_name: String::new(),
        }
    }

    pub fn is_inform(&self) -> bool {
        self.pdu_type == PduType::InformRequest
    }
}

pub fn format_bytes(bytes: &[u8]) -> String {
    let items: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
    format!("[{}]", items.join(" "))
}

/// Text form of a variable value. Octet strings come out as raw byte lists.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Integer(v) => v.to_string(),
        Value::OctetString(b) | Value::Opaque(b) => format_bytes(b),
        Value::ObjectIdentifier(oid) => dotted(oid),
        Value::IpAddress(ip) => Ipv4Addr::from(*ip).to_string(),
        Value::Counter32(v) | Value::Gauge32(v) | Value::TimeTicks(v) => v.to_string(),
        Value::Counter64(v) => v.to_string(),
        Value::Null | Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => "<nil>".to_string(),
        Value::Unknown { data, .. } => format_bytes(data),
        other => other.to_string(),
    }
}

/// Decode one datagram. v3 messages are authenticated and decrypted with
/// the matching user from `usm`.
pub fn decode_message(buf: &[u8], usm: &UsmTable) -> Result<TrapPacket, TrapError> {
    let mut outer = Decoder::new(Bytes::copy_from_slice(buf));
    let mut msg = outer.read_sequence().map_err(TrapError::decode)?;
    let raw_version = i64::from(msg.read_integer().map_err(TrapError::decode)?);
    let version = SnmpVersion::from_wire(raw_version).ok_or(TrapError::UnsupportedVersion(raw_version))?;

    let mut packet = TrapPacket::new(version);
    match version {
        SnmpVersion::V1 | SnmpVersion::V2c => {
            let community = msg.read_octet_string().map_err(TrapError::decode)?;
            packet.community = String::from_utf8_lossy(&community).into_owned();
            decode_pdu(&mut msg, &mut packet)?;
        }
        SnmpVersion::V3 => decode_v3(buf, &mut msg, usm, &mut packet)?,
    }
    Ok(packet)
}

fn decode_v3(buf: &[u8], msg: &mut Decoder, usm: &UsmTable, packet: &mut TrapPacket) -> Result<(), TrapError> {
    let global = MsgGlobalData::decode(msg).map_err(TrapError::decode)?;
    let level = global.msg_flags.security_level;
    let sec = msg
        .read_octet_string()
        .and_then(UsmSecurityParams::decode)
        .map_err(TrapError::decode)?;
    let user_name = String::from_utf8_lossy(&sec.username).into_owned();

    let user = usm
        .lookup(&user_name, &sec.engine_id)
        .ok_or_else(|| TrapError::UnknownUser(format!("{}@{}", user_name, hex::encode(&sec.engine_id))))?;
    if user.security_level.requires_auth() && !level.requires_auth() {
        return Err(TrapError::Authentication(format!("{}: unauthenticated message", user_name)));
    }
    if level.requires_auth() {
        user.verify(buf, &sec.auth_params)?;
    }
    packet.user_name = user_name;

    if level.requires_priv() {
        let ciphertext = msg.read_octet_string().map_err(TrapError::decode)?;
        let plaintext = user.decrypt(sec.engine_boots, sec.engine_time, &sec.priv_params, &ciphertext)?;
        decode_scoped_pdu(&mut Decoder::new(plaintext), packet)
    } else if user.security_level.requires_priv() {
        Err(TrapError::Decryption(format!("{}: plaintext message", packet.user_name)))
    } else {
        decode_scoped_pdu(msg, packet)
    }
}

fn decode_scoped_pdu(dec: &mut Decoder, packet: &mut TrapPacket) -> Result<(), TrapError> {
    let mut scoped = dec.read_sequence().map_err(TrapError::decode)?;
    let _context_engine_id = scoped.read_octet_string().map_err(TrapError::decode)?;
    let context_name = scoped.read_octet_string().map_err(TrapError::decode)?;
    packet.context_name = String::from_utf8_lossy(&context_name).into_owned();
    decode_pdu(&mut scoped, packet)
}

fn decode_pdu(dec: &mut Decoder, packet: &mut TrapPacket) -> Result<(), TrapError> {
    let raw = dec.peek_tag().ok_or_else(|| TrapError::Decode("missing pdu".to_string()))?;
    let pdu_type = PduType::from_tag(raw).ok_or_else(|| TrapError::Decode(format!("unknown pdu type 0x{:02x}", raw)))?;
    let mut pdu = dec.read_constructed(raw).map_err(TrapError::decode)?;
    packet.pdu_type = pdu_type;

    if pdu_type == PduType::TrapV1 {
        let enterprise = pdu.read_oid().map_err(TrapError::decode)?;
        let agent_addr = match Value::decode(&mut pdu).map_err(TrapError::decode)? {
            Value::IpAddress(ip) => ip,
            _ => [0; 4],
        };
        let generic_trap = pdu.read_integer().map_err(TrapError::decode)?;
        let specific_trap = pdu.read_integer().map_err(TrapError::decode)?;
        let time_stamp = match Value::decode(&mut pdu).map_err(TrapError::decode)? {
            Value::TimeTicks(t) => t,
            _ => 0,
        };
        packet.trap_v1 = Some(TrapV1Pdu {
            enterprise,
            agent_addr,
            generic_trap,
            specific_trap,
            time_stamp,
            varbinds: Vec::new(),
        });
    } else {
        packet.request_id = pdu.read_integer().map_err(TrapError::decode)?;
        let _error_status = pdu.read_integer().map_err(TrapError::decode)?;
        let _error_index = pdu.read_integer().map_err(TrapError::decode)?;
    }

    // One bad variable costs only itself. A broken item frame ends the list.
    let mut list = pdu.read_sequence().map_err(TrapError::decode)?;
    while !list.is_empty() {
        let mut item = match list.read_sequence() {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!("drop remaining variables after {}: {}", packet.variables.len(), e);
                break;
            }
        };
        let oid = match item.read_oid() {
            Ok(oid) => oid,
            Err(e) => {
                tracing::warn!("skip variable with bad name: {}", e);
                continue;
            }
        };
        match Value::decode(&mut item) {
            Ok(value) => packet.variables.push(VarBind::new(oid, value)),
            Err(e) => tracing::warn!("skip variable {}: {}", dotted(&oid), e),
        }
    }
    Ok(())
}

/// Response PDU acknowledging a community based inform. `None` for traps and v3.
pub fn encode_inform_response(packet: &TrapPacket) -> Option<Vec<u8>> {
    if !packet.is_inform() {
        return None;
    }
    let pdu = Pdu {
        pdu_type: PduType::Response,
        request_id: packet.request_id,
        error_status: 0,
        error_index: 0,
        varbinds: packet.variables.clone(),
    };
    let community = Bytes::from(packet.community.clone().into_bytes());
    let message = match packet.version {
        SnmpVersion::V1 => CommunityMessage::v1(community, pdu),
        SnmpVersion::V2c => CommunityMessage::v2c(community, pdu),
        SnmpVersion::V3 => return None,
    };
    Some(message.encode().to_vec())
}

/// Message builders for tests that play the agent side.
#[cfg(test)]
pub(crate) mod build {
    use super::*;
    use crate::tasks::trap::usm::UsmUser;
    use async_snmp::ber::EncodeBuf;
    use async_snmp::message::{MsgFlags, ScopedPdu, SecurityLevel, V3Message};
    use async_snmp::pdu::GenericTrap;
    use async_snmp::Oid;

    pub fn varbind(oid: &str, value: Value) -> VarBind {
        VarBind::new(Oid::parse(oid).unwrap(), value)
    }

    pub fn v1_trap(community: &str, enterprise: &str, generic: GenericTrap, specific: i32, variables: &[VarBind]) -> Vec<u8> {
        let trap = TrapV1Pdu::new(Oid::parse(enterprise).unwrap(), [127, 0, 0, 1], generic, specific, 300, variables.to_vec());
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            trap.encode(buf);
            buf.push_octet_string(community.as_bytes());
            buf.push_integer(0);
        });
        buf.finish().to_vec()
    }

    fn generic_pdu(pdu_type: PduType, request_id: i32, variables: &[VarBind]) -> Pdu {
        Pdu {
            pdu_type,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds: variables.to_vec(),
        }
    }

    pub fn v2c(community: &str, pdu_type: PduType, request_id: i32, variables: &[VarBind]) -> Vec<u8> {
        let pdu = generic_pdu(pdu_type, request_id, variables);
        CommunityMessage::v2c(community.as_bytes().to_vec(), pdu).encode().to_vec()
    }

    /// v3 trap from `user` sent at `level`.
    pub fn v3_trap(user: &UsmUser, level: SecurityLevel, variables: &[VarBind]) -> Vec<u8> {
        let (boots, time) = (3u32, 4242u32);
        let scoped = ScopedPdu::new(
            user.engine_id.clone(),
            user.context_name.clone().into_bytes(),
            generic_pdu(PduType::TrapV2, 77, variables),
        );
        let mut sec = UsmSecurityParams::new(user.engine_id.clone(), boots, time, user.user_name.clone().into_bytes());
        if level.requires_auth() {
            sec = sec.with_auth_placeholder(user.auth_key.as_ref().unwrap().mac_len());
        }
        let global = MsgGlobalData::new(1, 65507, MsgFlags::new(level, false));

        let message = if level.requires_priv() {
            let (ciphertext, salt) = user.encrypt(boots, time, &scoped.encode_to_bytes());
            V3Message::new_encrypted(global, sec.with_priv_params(salt).encode(), ciphertext)
        } else {
            V3Message::new(global, sec.encode(), scoped)
        };
        let mut bytes = message.encode().to_vec();
        if level.requires_auth() {
            user.sign(&mut bytes);
        }
        bytes
    }
}
