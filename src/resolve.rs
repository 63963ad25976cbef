//! Host list resolution under DNS check mode and address family filter.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::context::Context;
use crate::define::{CheckMode, IpType, NamedCode, Protocol};

/// Name resolution seam. Production uses the system resolver.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// All A/AAAA records of `host`, in resolver order.
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by `getaddrinfo` through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

#[async_trait]
impl DnsLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0)).await? {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// Resolution outcome of one configured host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProbeResult {
    /// Host as configured (a URL for HTTP).
    pub host: String,
    pub ips: Vec<IpAddr>,
    pub errno: NamedCode,
}

impl HostProbeResult {
    fn ok(host: &str, ips: Vec<IpAddr>) -> Self {
        Self { host: host.to_string(), ips, errno: NamedCode::Ok }
    }

    fn fail(host: &str, errno: NamedCode) -> Self {
        Self { host: host.to_string(), ips: Vec::new(), errno }
    }
}

/// Host part of a configured target.
fn extract_host(host: &str, protocol: Protocol) -> Option<String> {
    match protocol {
        Protocol::Http => {
            let url = reqwest::Url::parse(host).ok()?;
            url.host_str().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        }
        _ => {
            let trimmed = host.trim().trim_start_matches('[').trim_end_matches(']');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
    }
}

fn filter_family(ips: Vec<IpAddr>, ip_type: IpType) -> Vec<IpAddr> {
    match ip_type {
        IpType::Auto => ips,
        IpType::V4 => ips.into_iter().filter(IpAddr::is_ipv4).collect(),
        IpType::V6 => ips.into_iter().filter(IpAddr::is_ipv6).collect(),
    }
}

fn not_found_code(ip_type: IpType) -> NamedCode {
    match ip_type {
        IpType::V4 => NamedCode::ResponseNotFindIpv4,
        IpType::V6 => NamedCode::ResponseNotFindIpv6,
        IpType::Auto => NamedCode::ConnDnsResolveError,
    }
}

/// Resolve one host.
pub async fn resolve_host(
    ctx: &Context,
    lookup: &dyn DnsLookup,
    host: &str,
    check_mode: CheckMode,
    ip_type: IpType,
    protocol: Protocol,
) -> HostProbeResult {
    let Some(name) = extract_host(host, protocol) else {
        return HostProbeResult::fail(host, NamedCode::BadRequestParams);
    };

    if let Ok(ip) = name.parse::<IpAddr>() {
        return HostProbeResult::ok(host, vec![ip]);
    }

    let resolved = tokio::select! {
        _ = ctx.done() => return HostProbeResult::fail(host, NamedCode::ConnDnsResolveError),
        resolved = lookup.lookup(&name) => resolved,
    };
    let resolved = match resolved {
        Ok(ips) if !ips.is_empty() => ips,
        Ok(_) => return HostProbeResult::fail(host, NamedCode::ConnDnsResolveError),
        Err(err) => {
            tracing::debug!("resolve {} failed: {}", name, err);
            return HostProbeResult::fail(host, NamedCode::ConnDnsResolveError);
        }
    };

    let mut ips = filter_family(resolved, ip_type);
    if ips.is_empty() {
        return HostProbeResult::fail(host, not_found_code(ip_type));
    }
    if check_mode == CheckMode::Single {
        ips.truncate(1);
    }
    HostProbeResult::ok(host, ips)
}

/// Resolve every host, keeping input order.
pub async fn get_hosts_info(
    ctx: &Context,
    lookup: &dyn DnsLookup,
    hosts: &[String],
    check_mode: CheckMode,
    ip_type: IpType,
    protocol: Protocol,
) -> Vec<HostProbeResult> {
    let mut results = Vec::with_capacity(hosts.len());
    for host in hosts {
        results.push(resolve_host(ctx, lookup, host, check_mode, ip_type, protocol).await);
    }
    results
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed table resolver.
    #[derive(Default)]
    pub(crate) struct MockLookup {
        pub records: HashMap<String, Vec<IpAddr>>,
        pub calls: AtomicUsize,
    }

    impl MockLookup {
        pub fn with(records: &[(&str, &[&str])]) -> Self {
            let records = records
                .iter()
                .map(|(host, ips)| {
                    (host.to_string(), ips.iter().map(|ip| ip.parse().unwrap()).collect())
                })
                .collect();
            Self { records, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl DnsLookup for MockLookup {
        async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.records
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn lookup() -> MockLookup {
        MockLookup::with(&[
            ("dual.test", &["10.0.0.1", "10.0.0.2", "fd00::1"]),
            ("v6only.test", &["fd00::2", "fd00::3"]),
        ])
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    #[tokio::test]
    async fn test_all_mode_counts() {
        let ctx = Context::background();
        let l = lookup();
        let r = get_hosts_info(&ctx, &l, &hosts(&["dual.test"]), CheckMode::All, IpType::Auto, Protocol::Tcp).await;
        assert_eq!(r[0].ips.len(), 3);

        let r = get_hosts_info(&ctx, &l, &hosts(&["dual.test"]), CheckMode::All, IpType::V4, Protocol::Tcp).await;
        assert_eq!(r[0].ips.len(), 2);
        assert_eq!(r[0].errno, NamedCode::Ok);

        let r = get_hosts_info(&ctx, &l, &hosts(&["v6only.test"]), CheckMode::All, IpType::V4, Protocol::Tcp).await;
        assert!(r[0].ips.is_empty());
        assert_eq!(r[0].errno, NamedCode::ResponseNotFindIpv4);
    }

    #[tokio::test]
    async fn test_single_mode() {
        let ctx = Context::background();
        let l = lookup();
        let r = get_hosts_info(&ctx, &l, &hosts(&["dual.test"]), CheckMode::Single, IpType::Auto, Protocol::Udp).await;
        assert_eq!(r[0].ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);

        let r = get_hosts_info(&ctx, &l, &hosts(&["dual.test"]), CheckMode::Single, IpType::V6, Protocol::Udp).await;
        assert_eq!(r[0].ips, vec!["fd00::1".parse::<IpAddr>().unwrap()]);

        let r = get_hosts_info(&ctx, &l, &hosts(&["dual.test"]), CheckMode::Single, IpType::V4, Protocol::Udp).await;
        assert_eq!(r[0].ips.len(), 1);
    }

    #[tokio::test]
    async fn test_literal_and_failures() {
        let ctx = Context::background();
        let l = lookup();
        let r = get_hosts_info(
            &ctx,
            &l,
            &hosts(&["127.0.0.1", "[::1]", "missing.test", "v6only.test"]),
            CheckMode::All,
            IpType::V6,
            Protocol::Tcp,
        )
        .await;
        assert_eq!(r.len(), 4);
        assert_eq!(r[0].ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(r[1].ips, vec!["::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(r[2].errno, NamedCode::ConnDnsResolveError);
        assert_eq!(r[3].ips.len(), 2);
        // literals never hit the resolver
        assert_eq!(l.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_http_url_host() {
        let ctx = Context::background();
        let l = lookup();
        let r = get_hosts_info(
            &ctx,
            &l,
            &hosts(&["http://dual.test:8080/health", "not a url"]),
            CheckMode::All,
            IpType::V4,
            Protocol::Http,
        )
        .await;
        assert_eq!(r[0].host, "http://dual.test:8080/health");
        assert_eq!(r[0].ips.len(), 2);
        assert_eq!(r[1].errno, NamedCode::BadRequestParams);
    }
}
