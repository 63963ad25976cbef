//! Watches the kernel UDP receive buffer error counter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::Context;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// `Udp: RcvbufErrors` from the contents of `/proc/net/snmp`.
pub fn parse_rcvbuf_errors(text: &str) -> Option<u64> {
    let mut udp = text.lines().filter(|l| l.starts_with("Udp:"));
    let header = udp.next()?;
    let values = udp.next()?;
    let column = header.split_whitespace().position(|f| f == "RcvbufErrors")?;
    values.split_whitespace().nth(column)?.parse().ok()
}

#[derive(Debug)]
pub struct UdpLossWatcher {
    path: PathBuf,
    last: Option<u64>,
}

impl UdpLossWatcher {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            path: proc_root.join("net").join("snmp"),
            last: None,
        }
    }

    /// Errors counted since the previous check. The first check only
    /// records the baseline.
    pub async fn check(&mut self) -> Option<u64> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("read {} failed: {}", self.path.display(), e);
                return None;
            }
        };
        let current = parse_rcvbuf_errors(&text)?;
        let increase = self.last.map(|last| current.saturating_sub(last));
        self.last = Some(current);
        increase.filter(|n| *n > 0)
    }

    pub async fn run(mut self, ctx: Context) {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.done() => return,
                _ = interval.tick() => {
                    if let Some(lost) = self.check().await {
                        tracing::warn!(
                            "udp receive buffer overflowed, {} datagrams dropped in the last {:?}",
                            lost,
                            CHECK_INTERVAL
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNMP: &str = "Ip: Forwarding DefaultTTL\nIp: 1 64\n\
        Udp: InDatagrams NoPorts InErrors OutDatagrams RcvbufErrors SndbufErrors InCsumErrors IgnoredMulti\n\
        Udp: 1000 3 12 998 RCV 0 0 0\n\
        UdpLite: InDatagrams NoPorts InErrors OutDatagrams RcvbufErrors SndbufErrors InCsumErrors IgnoredMulti\n\
        UdpLite: 0 0 0 0 0 0 0 0\n";

    fn snmp(rcvbuf: u64) -> String {
        SNMP.replace("RCV", &rcvbuf.to_string())
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_rcvbuf_errors(&snmp(42)), Some(42));
        assert_eq!(parse_rcvbuf_errors("Tcp: A B\nTcp: 1 2\n"), None);
    }

    #[tokio::test]
    async fn test_check_reports_increase() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("net")).unwrap();
        let file = dir.path().join("net").join("snmp");
        std::fs::write(&file, snmp(10)).unwrap();

        let mut watcher = UdpLossWatcher::new(dir.path());
        assert_eq!(watcher.check().await, None);
        assert_eq!(watcher.check().await, None);

        std::fs::write(&file, snmp(17)).unwrap();
        assert_eq!(watcher.check().await, Some(7));
        assert_eq!(watcher.check().await, None);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = UdpLossWatcher::new(dir.path());
        assert_eq!(watcher.check().await, None);
    }
}
