use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::record::{CachedType, DnsData};
use crate::watcher::HostsWatcher;

/// Table consulted before the cache. Answers are delivered like cache hits.
pub trait LocalHosts: Send + Sync {
    /// Answers for `(qtype, name)`, or `None` when the table has nothing.
    fn lookup(&self, qtype: CachedType, name: &str) -> Option<Vec<DnsData>>;
}

/// Static `address name [aliases...]` entries, hosts file syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsTable {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsTable {
    pub fn parse(text: &str) -> Self {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else {
                continue;
            };
            let Ok(addr) = addr.parse::<IpAddr>() else {
                debug!(line, "skipping hosts line with bad address");
                continue;
            };
            for name in fields {
                let key = normalize(name);
                let addrs = entries.entry(key).or_default();
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read hosts file: {}", path.display()))?;
        Ok(Self::parse(&raw))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LocalHosts for HostsTable {
    fn lookup(&self, qtype: CachedType, name: &str) -> Option<Vec<DnsData>> {
        let addrs = self.entries.get(&normalize(name))?;
        let answers: Vec<DnsData> = addrs
            .iter()
            .filter_map(|addr| match (qtype, addr) {
                (CachedType::A, IpAddr::V4(v4)) => Some(DnsData::a(name, 0, *v4)),
                (CachedType::Aaaa, IpAddr::V6(v6)) => Some(DnsData::aaaa(name, 0, *v6)),
                _ => None,
            })
            .collect();
        if answers.is_empty() { None } else { Some(answers) }
    }
}

/// Hosts file kept current by a file watcher. The watcher stops when this
/// is dropped.
pub struct WatchedHosts {
    table: Arc<ArcSwap<HostsTable>>,
    _watcher: HostsWatcher,
}

impl WatchedHosts {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = Arc::new(ArcSwap::from_pointee(HostsTable::load(&path)?));
        info!(path = %path.display(), entries = table.load().len(), "hosts file loaded");
        let watcher = HostsWatcher::spawn(path.clone(), table.clone())
            .with_context(|| format!("watch hosts file: {}", path.display()))?;
        Ok(Self {
            table,
            _watcher: watcher,
        })
    }
}

impl LocalHosts for WatchedHosts {
    fn lookup(&self, qtype: CachedType, name: &str) -> Option<Vec<DnsData>> {
        self.table.load().lookup(qtype, name)
    }
}

fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DnsPayload;
    use std::time::Duration;

    const SAMPLE: &str = "\
# local overrides
127.0.0.1   localhost
192.0.2.10  PBX.corp.example pbx   # office pbx
2001:db8::10 pbx.corp.example
not-an-ip   broken.example
";

    #[test]
    fn parses_names_and_aliases() {
        let table = HostsTable::parse(SAMPLE);
        assert_eq!(table.len(), 3);

        let answers = table.lookup(CachedType::A, "pbx.corp.example.").unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(
            answers[0].payload,
            DnsPayload::A {
                address: "192.0.2.10".parse().unwrap()
            }
        );
        assert!(table.lookup(CachedType::A, "PBX").is_some());

        let v6 = table.lookup(CachedType::Aaaa, "pbx.corp.example").unwrap();
        assert_eq!(v6[0].data_type(), Some(CachedType::Aaaa));

        assert!(table.lookup(CachedType::Aaaa, "localhost").is_none());
        assert!(table.lookup(CachedType::Srv, "pbx").is_none());
        assert!(table.lookup(CachedType::A, "broken.example").is_none());
    }

    #[test]
    fn watched_hosts_picks_up_changes() {
        let dir = std::env::temp_dir().join(format!("rrcache-hosts-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts");
        fs::write(&path, "192.0.2.1 first.example\n").unwrap();

        let hosts = WatchedHosts::open(&path).expect("open hosts");
        assert!(hosts.lookup(CachedType::A, "first.example").is_some());
        assert!(hosts.lookup(CachedType::A, "second.example").is_none());

        std::thread::sleep(Duration::from_millis(100));
        fs::write(&path, "192.0.2.2 second.example\n").unwrap();

        let mut reloaded = false;
        for _ in 0..50 {
            if hosts.lookup(CachedType::A, "second.example").is_some() {
                reloaded = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(reloaded, "hosts file was not reloaded");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn dropping_watched_hosts_stops_the_reload_thread() {
        let dir = std::env::temp_dir().join(format!("rrcache-hosts-stop-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts");
        fs::write(&path, "192.0.2.1 first.example\n").unwrap();

        let hosts = WatchedHosts::open(&path).expect("open hosts");
        // the reload thread holds the only other reference to the table
        let table = Arc::downgrade(&hosts.table);
        assert_eq!(table.strong_count(), 2);

        drop(hosts);
        assert!(table.upgrade().is_none(), "reload thread still running");
        let _ = fs::remove_dir_all(&dir);
    }
}
