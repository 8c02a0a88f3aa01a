//! Filesystem watcher driving blacklist hot-reload, grounded on
//! `blacklistfilter/blacklist_watcher.cpp`'s inotify `IN_CLOSE_WRITE`
//! loop: the original only flips a flag on a write-close event and lets
//! the detector's own loop perform the reload on its next iteration
//! (spec §4.C8/§5's "lazy lock" pattern). We reproduce the same split:
//! [`ReloadFlag`] is the flag, [`watch`] is the thread that sets it.

use notify::{EventKind, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag the ingest loop polls once per cycle, mirroring the
/// original's `BL_RELOAD_FLAG` global guarded by a mutex.
#[derive(Debug, Default)]
pub struct ReloadFlag(AtomicBool);

impl ReloadFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(ReloadFlag(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Reads and clears the flag in one step so a single reload cycle
    /// consumes exactly one pending notification.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Spawns a background watcher on `paths` that sets `flag` whenever any of
/// them is closed after a write. The returned [`notify::RecommendedWatcher`]
/// must be kept alive for as long as watching should continue; dropping it
/// stops the watch (this is the cancellation point described in spec §5 —
/// there is no separate stop signal, the watcher is simply dropped during
/// shutdown).
pub fn watch(paths: &[&Path], flag: Arc<ReloadFlag>) -> notify::Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
            flag.set();
        }
        Ok(_) => {}
        Err(e) => log::error!("blacklist watcher error: {e}"),
    })?;
    for path in paths {
        watcher.watch(path, RecursiveMode::NonRecursive)?;
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn flag_is_set_on_file_write_and_consumed_once() {
        let mut file = NamedTempFile::new().unwrap();
        let flag = ReloadFlag::new();
        let _watcher = watch(&[file.path()], flag.clone()).unwrap();

        assert!(!flag.take());
        writeln!(file, "update").unwrap();
        file.flush().unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if flag.take() {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(seen, "expected the watcher to observe the write");
        assert!(!flag.take(), "take() should clear the flag");
    }
}
