//! Blacklist lookup engine (spec §4.C8): IP prefix lists and FQDN/URL
//! trees, loaded from the formatted files an external downloader
//! maintains, with filesystem-watcher-driven hot reload.

pub mod domain;
pub mod ip;
pub mod watcher;

pub use domain::{DnsTree, UrlTree};
pub use ip::{IpListError, PrefixEntry, PrefixList};
pub use watcher::ReloadFlag;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// One immutable, atomically-swappable generation of every blacklist
/// table (spec §4.C8 "Hot reload" / §5 shared-resource policy: readers
/// hold a cheap clone of the current `Arc` while the swapper publishes a
/// new one without blocking them).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub ipv4: PrefixList,
    pub ipv6: PrefixList,
    pub dns: DnsTree,
    pub url: UrlTree,
}

#[derive(Debug, Clone)]
struct Sources {
    ipv4_path: Option<PathBuf>,
    ipv6_path: Option<PathBuf>,
    dns_path: Option<PathBuf>,
    url_path: Option<PathBuf>,
}

fn load_file(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}

impl Snapshot {
    fn build(sources: &Sources) -> std::io::Result<Snapshot> {
        let ipv4 = match &sources.ipv4_path {
            Some(p) => PrefixList::load(&load_file(p)?),
            None => PrefixList::default(),
        };
        let ipv6 = match &sources.ipv6_path {
            Some(p) => PrefixList::load(&load_file(p)?),
            None => PrefixList::default(),
        };
        let dns = match &sources.dns_path {
            Some(p) => DnsTree::load(&load_file(p)?),
            None => DnsTree::default(),
        };
        let url = match &sources.url_path {
            Some(p) => UrlTree::load(&load_file(p)?),
            None => UrlTree::default(),
        };
        Ok(Snapshot { ipv4, ipv6, dns, url })
    }
}

/// Owns the current [`Snapshot`] plus the reload flag a [`watcher::watch`]
/// sets; `poll_reload` is meant to be called once per ingest cycle (spec
/// §5's "lazy lock": the mutex behind the `RwLock` is only taken on the
/// rare iterations where a reload is actually pending).
pub struct BlacklistEngine {
    current: RwLock<Arc<Snapshot>>,
    sources: Sources,
    reload_flag: Arc<ReloadFlag>,
}

impl BlacklistEngine {
    /// Loads the initial snapshot from whichever of the four source files
    /// are provided; any that are `None` simply contribute an empty table.
    pub fn new(
        ipv4_path: Option<PathBuf>,
        ipv6_path: Option<PathBuf>,
        dns_path: Option<PathBuf>,
        url_path: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        let sources = Sources { ipv4_path, ipv6_path, dns_path, url_path };
        let snapshot = Snapshot::build(&sources)?;
        Ok(BlacklistEngine {
            current: RwLock::new(Arc::new(snapshot)),
            sources,
            reload_flag: ReloadFlag::new(),
        })
    }

    pub fn reload_flag(&self) -> Arc<ReloadFlag> {
        self.reload_flag.clone()
    }

    /// Cheap clone of the currently-published snapshot for a lookup.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    /// Checks the reload flag and, if set, rebuilds every source file and
    /// publishes the result. On rebuild failure the previous snapshot is
    /// kept and the error logged (spec §7 taxonomy (d)).
    pub fn poll_reload(&self) {
        if !self.reload_flag.take() {
            return;
        }
        match Snapshot::build(&self.sources) {
            Ok(snapshot) => {
                *self.current.write().unwrap() = Arc::new(snapshot);
            }
            Err(e) => log::error!("blacklist reload failed, keeping previous table: {e}"),
        }
    }
}

impl std::fmt::Debug for BlacklistEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistEngine")
            .field("pending_reload", &self.reload_flag.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{contents}").unwrap();
        f
    }

    #[test]
    fn loads_initial_snapshot_from_all_four_files() {
        let ipv4 = write_file("203.0.113.0/24,1\n");
        let dns = write_file("evil.example.com\\2\n");
        let engine =
            BlacklistEngine::new(Some(ipv4.path().into()), None, Some(dns.path().into()), None).unwrap();
        let snap = engine.current();
        assert_eq!(snap.ipv4.len(), 1);
        assert_eq!(snap.dns.len(), 1);
        assert_eq!(snap.ipv6.len(), 0);
    }

    #[test]
    fn poll_reload_is_a_noop_until_flag_is_set() {
        let ipv4 = write_file("203.0.113.0/24,1\n");
        let engine = BlacklistEngine::new(Some(ipv4.path().into()), None, None, None).unwrap();
        engine.poll_reload();
        assert_eq!(engine.current().ipv4.len(), 1);
    }

    #[test]
    fn reload_picks_up_rewritten_file_contents() {
        let mut ipv4 = write_file("203.0.113.0/24,1\n");
        let engine = BlacklistEngine::new(Some(ipv4.path().into()), None, None, None).unwrap();
        assert_eq!(engine.current().ipv4.len(), 1);

        use std::io::Seek;
        ipv4.as_file_mut().set_len(0).unwrap();
        ipv4.as_file_mut().seek(std::io::SeekFrom::Start(0)).unwrap();
        write!(ipv4, "203.0.113.0/24,1\n198.51.100.0/24,2\n").unwrap();
        ipv4.flush().unwrap();

        engine.reload_flag().set();
        engine.poll_reload();
        assert_eq!(engine.current().ipv4.len(), 2);
    }

    #[test]
    fn missing_source_files_are_empty_tables_not_errors() {
        let engine = BlacklistEngine::new(None, None, None, None).unwrap();
        let snap = engine.current();
        assert!(snap.ipv4.is_empty());
        assert!(snap.dns.is_empty());
        assert!(snap.url.is_empty());
    }
}
