//! OID translation and dimension extraction.

use std::collections::{BTreeMap, HashMap};

use async_snmp::pdu::{GenericTrap, TrapV1Pdu};
use async_snmp::Oid;

pub const SYS_UPTIME_OID: &str = ".1.3.6.1.2.1.1.3.0";
pub const SNMP_TRAP_OID: &str = ".1.3.6.1.6.3.1.1.4.1.0";

const INDEX_SUFFIX: &str = ".index";

/// Longest prefix lookup into the configured OID display names.
#[derive(Debug, Clone, Default)]
pub struct OidTranslator {
    names: HashMap<String, String>,
}

impl OidTranslator {
    pub fn new(table: &BTreeMap<String, String>) -> Self {
        let names = table
            .iter()
            .map(|(oid, name)| (oid.trim_matches('.').to_string(), name.clone()))
            .collect();
        Self { names }
    }

    /// Replace the longest known prefix of `oid` with its name, keeping
    /// the remaining arcs. Unknown OIDs are returned as given.
    pub fn translate(&self, oid: &str) -> String {
        let arcs: Vec<&str> = oid.trim_matches('.').split('.').collect();
        for i in (1..=arcs.len()).rev() {
            if let Some(name) = self.names.get(&arcs[..i].join(".")) {
                if i == arcs.len() {
                    return name.clone();
                }
                return format!("{}.{}", name, arcs[i..].join("."));
            }
        }
        oid.to_string()
    }

    fn dimension_name(&self, oid: &str, use_display_name: bool) -> String {
        let name = if use_display_name { self.translate(oid) } else { oid.to_string() };
        name.trim_matches('.').replace('.', "_")
    }

    /// Copy `value` into `dimension` for every report pattern covering `name`.
    ///
    /// A pattern ending in `.index` matches variables one level below it and
    /// stores `"{last arc}::::{value}"` under the parent OID.
    pub fn update_dimension(
        &self,
        report_oids: &[String],
        use_display_name: bool,
        name: &str,
        value: &str,
        dimension: &mut BTreeMap<String, String>,
    ) {
        let oid = name.trim_start_matches('.');
        for report in report_oids {
            let (prefix, is_index) = match report.strip_suffix(INDEX_SUFFIX) {
                Some(prefix) => (prefix.trim_start_matches('.'), true),
                None => (report.trim_start_matches('.'), false),
            };
            let Some(rest) = oid.strip_prefix(prefix) else {
                continue;
            };
            if !(rest.is_empty() || rest.starts_with('.')) {
                continue;
            }

            if is_index {
                if let Some((parent, index)) = oid.rsplit_once('.') {
                    if parent == prefix {
                        let key = self.dimension_name(parent, use_display_name);
                        dimension.insert(key, format!("{}::::{}", index, value));
                        continue;
                    }
                }
                tracing::debug!("index oid {} is not a direct child of {}", name, report);
            }
            dimension.insert(self.dimension_name(name, use_display_name), value.to_string());
        }
    }
}

/// Dotted form with a leading dot, as OIDs appear in events.
pub fn dotted(oid: &Oid) -> String {
    format!(".{}", oid)
}

/// Trap OID and display name of a v1 trap (RFC 3584). Enterprise specific
/// traps have no fixed name; unknown generic codes yield nothing.
pub fn v1_trap_oid(trap: &TrapV1Pdu) -> (String, String) {
    let name = match trap.generic_trap_enum() {
        Some(GenericTrap::ColdStart) => "coldStart",
        Some(GenericTrap::WarmStart) => "warmStart",
        Some(GenericTrap::LinkDown) => "linkDown",
        Some(GenericTrap::LinkUp) => "linkUp",
        Some(GenericTrap::AuthenticationFailure) => "authenticationFailure",
        Some(GenericTrap::EgpNeighborLoss) => "egpNeighborLoss",
        Some(GenericTrap::EnterpriseSpecific) => "",
        None => return (String::new(), String::new()),
    };
    match trap.v2_trap_oid() {
        Ok(oid) => (dotted(&oid), name.to_string()),
        Err(_) => (String::new(), String::new()),
    }
}
