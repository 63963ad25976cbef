//! SNMPv3 user-based security model users (RFC 3414, RFC 3826).
//!
//! Keys are derived once per configured user when the listener starts. A
//! user is identified by its name together with the authoritative engine
//! id, so one listener can accept several users at once.

use std::collections::HashMap;

use async_snmp::message::SecurityLevel;
use async_snmp::v3::{auth, AuthProtocol, LocalizedKey, PrivKey, PrivProtocol, UsmSecurityParams};
use bytes::Bytes;

use super::TrapError;
use crate::config::trap::UsmInfo;

/// How a privacy key longer than one localized key is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    None,
    Blumenthal,
    /// Chained localization used by the `aes192c`/`aes256c` names.
    Reeder,
}

fn parse_auth(value: &str) -> Option<AuthProtocol> {
    value.parse().ok()
}

fn parse_privacy(value: &str) -> Option<(PrivProtocol, Extension)> {
    let lower = value.to_ascii_lowercase();
    let (name, reeder) = match lower.strip_suffix('c') {
        Some(name) if name.starts_with("aes") && name != "aes" => (name, true),
        _ => (lower.as_str(), false),
    };
    let protocol: PrivProtocol = name.parse().ok()?;
    let extension = match protocol {
        PrivProtocol::Des | PrivProtocol::Aes128 => Extension::None,
        _ if reeder => Extension::Reeder,
        _ => Extension::Blumenthal,
    };
    Some((protocol, extension))
}

fn derive_priv_key(auth: AuthProtocol, privacy: PrivProtocol, extension: Extension, password: &[u8], engine_id: &[u8]) -> PrivKey {
    match extension {
        Extension::None => PrivKey::from_password(auth, privacy, password, engine_id),
        // async-snmp applies Blumenthal extension for AES192/256 automatically.
        Extension::Blumenthal => PrivKey::from_password(auth, privacy, password, engine_id),
        Extension::Reeder => {
            let mut key = LocalizedKey::from_password(auth, password, engine_id).as_bytes().to_vec();
            let mut last = key.clone();
            while key.len() < privacy.key_len() {
                last = LocalizedKey::from_password(auth, &last, engine_id).as_bytes().to_vec();
                key.extend_from_slice(&last);
            }
            key.truncate(privacy.key_len());
            PrivKey::from_bytes(privacy, key)
        }
    }
}

/// Engine id from hex pairs.
pub fn parse_engine_id(value: &str) -> Result<Vec<u8>, TrapError> {
    if value.len() % 2 != 0 {
        return Err(TrapError::EngineId(value.to_string(), "wrong length of engine id".to_string()));
    }
    hex::decode(value).map_err(|e| TrapError::EngineId(value.to_string(), e.to_string()))
}

/// Security level requested by a `msg_flags` setting. `reportable` and
/// anything unknown accept unauthenticated messages.
pub fn parse_security_level(value: &str) -> SecurityLevel {
    match value.to_ascii_lowercase().as_str() {
        "authnopriv" => SecurityLevel::AuthNoPriv,
        "authpriv" => SecurityLevel::AuthPriv,
        _ => SecurityLevel::NoAuthNoPriv,
    }
}

/// A configured user with localized keys.
#[derive(Debug, Clone)]
pub struct UsmUser {
    pub user_name: String,
    pub engine_id: Bytes,
    pub context_name: String,
    pub security_level: SecurityLevel,
    pub engine_boots: u32,
    pub engine_time: u32,
    pub auth_key: Option<LocalizedKey>,
    pub priv_key: Option<PrivKey>,
}

impl UsmUser {
    pub fn from_config(info: &UsmInfo) -> Result<Self, TrapError> {
        let conf = &info.usm_config;
        let engine_id = parse_engine_id(&conf.authoritative_engine_id)?;
        let security_level = parse_security_level(&info.msg_flags);

        let auth_protocol = parse_auth(&conf.authentication_protocol);
        let auth_key = auth_protocol
            .map(|p| LocalizedKey::from_password(p, conf.authentication_passphrase.as_bytes(), &engine_id));
        let priv_key = match (parse_privacy(&conf.privacy_protocol), auth_protocol) {
            (Some((privacy, extension)), Some(auth)) => Some(derive_priv_key(
                auth,
                privacy,
                extension,
                conf.privacy_passphrase.as_bytes(),
                &engine_id,
            )),
            (Some(_), None) => {
                return Err(TrapError::Usm(format!("user {} has privacy without authentication", conf.user_name)))
            }
            (None, _) => None,
        };
        if security_level.requires_auth() && auth_key.is_none() {
            return Err(TrapError::Usm(format!("user {} requires authentication but has no protocol", conf.user_name)));
        }
        if security_level.requires_priv() && priv_key.is_none() {
            return Err(TrapError::Usm(format!("user {} requires privacy but has no protocol", conf.user_name)));
        }

        Ok(Self {
            user_name: conf.user_name.clone(),
            engine_id: Bytes::from(engine_id),
            context_name: info.context_name.clone(),
            security_level,
            engine_boots: if conf.authoritative_engine_boots == 0 { 1 } else { conf.authoritative_engine_boots },
            engine_time: if conf.authoritative_engine_time == 0 { 1 } else { conf.authoritative_engine_time },
            auth_key,
            priv_key,
        })
    }

    /// Check the digest carried in `auth_params` against the whole `message`.
    /// The message must already have decoded cleanly.
    pub fn verify(&self, message: &[u8], auth_params: &[u8]) -> Result<(), TrapError> {
        let Some(key) = &self.auth_key else {
            return Err(TrapError::Authentication(self.user_name.clone()));
        };
        if auth_params.len() != key.mac_len() {
            return Err(TrapError::Authentication(self.user_name.clone()));
        }
        match UsmSecurityParams::find_auth_params_offset(message) {
            Some((offset, len)) if len == auth_params.len() && auth::verify_message(key, message, offset, len) => Ok(()),
            _ => Err(TrapError::Authentication(self.user_name.clone())),
        }
    }

    /// Decrypt a scoped PDU. Boots and time of zero fall back to the configured values.
    pub fn decrypt(&self, boots: u32, time: u32, priv_params: &[u8], ciphertext: &[u8]) -> Result<Bytes, TrapError> {
        let Some(key) = &self.priv_key else {
            return Err(TrapError::Decryption(format!("user {} has no privacy key", self.user_name)));
        };
        let boots = if boots == 0 { self.engine_boots } else { boots };
        let time = if time == 0 { self.engine_time } else { time };
        key.decrypt(ciphertext, boots, time, priv_params)
            .map_err(|e| TrapError::Decryption(format!("{}: {}", self.user_name, e)))
    }

    /// Signs `message` in place; the digest field must hold zeros.
    #[cfg(test)]
    pub(crate) fn sign(&self, message: &mut [u8]) {
        let key = self.auth_key.as_ref().unwrap();
        let (offset, len) = UsmSecurityParams::find_auth_params_offset(message).unwrap();
        auth::authenticate_message(key, message, offset, len);
    }

    /// Returns the ciphertext and the privacy parameters.
    #[cfg(test)]
    pub(crate) fn encrypt(&self, boots: u32, time: u32, plaintext: &[u8]) -> (Bytes, Bytes) {
        let mut key = self.priv_key.clone().unwrap();
        key.encrypt(plaintext, boots, time, None).unwrap()
    }
}

/// Users keyed by (user name, engine id).
#[derive(Debug, Clone, Default)]
pub struct UsmTable {
    users: HashMap<(String, Bytes), UsmUser>,
}

impl UsmTable {
    pub fn from_config(infos: &[UsmInfo]) -> Result<Self, TrapError> {
        let mut table = UsmTable::default();
        for info in infos {
            let user = UsmUser::from_config(info)?;
            tracing::debug!(
                "registered usm user {} for engine {}",
                user.user_name,
                hex::encode(&user.engine_id)
            );
            table.users.insert((user.user_name.clone(), user.engine_id.clone()), user);
        }
        Ok(table)
    }

    pub fn lookup(&self, user_name: &str, engine_id: &[u8]) -> Option<&UsmUser> {
        self.users.get(&(user_name.to_string(), Bytes::copy_from_slice(engine_id)))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
