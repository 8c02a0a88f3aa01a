//! Event emitter (C9): writes emitted [`Event`]s to an output transport
//! sink plus a daily per-attack-type log file, grounded on
//! `hoststatsnemea/src/eventhandler.cpp`'s report path and spec §4.C9's
//! fixed semicolon-separated layout.

use chrono::{TimeZone, Utc};
use netflow::{Event, IpKey, Proto};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender};

/// A non-blocking sink an [`Emitter`] hands events to; in production this
/// is the output transport described by spec §1 as an external
/// collaborator, modeled here as a bounded channel so a saturated
/// downstream drops rather than blocks the caller (spec §7 taxonomy (e)).
pub fn output_channel(capacity: usize) -> (SyncSender<Event>, Receiver<Event>) {
    std::sync::mpsc::sync_channel(capacity)
}

/// Writes events to the output transport and to `<log_dir>/YYYYMMDD.log`.
pub struct Emitter {
    sink: SyncSender<Event>,
    log_dir: PathBuf,
}

fn day_path(log_dir: &Path, secs: u32) -> PathBuf {
    let dt = Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_else(Utc::now);
    log_dir.join(format!("{}.log", dt.format("%Y%m%d")))
}

fn join_addrs(addrs: &[IpKey]) -> String {
    addrs.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn join_protos(protos: &[Proto]) -> String {
    protos.iter().map(|p| p.0.to_string()).collect::<Vec<_>>().join(",")
}

/// Renders one event as the fixed-order semicolon-separated log line
/// (spec §4.C9/§6).
pub fn format_log_line(evt: &Event) -> String {
    format!(
        "{};{};{};{};{};{};{};{};{};{}",
        evt.time_first.to_packed(),
        evt.time_last.to_packed(),
        evt.event_type as u8,
        join_protos(&evt.protocols),
        join_addrs(&evt.src_addrs),
        join_addrs(&evt.dst_addrs),
        join_ports(&evt.src_ports),
        join_ports(&evt.dst_ports),
        evt.scale,
        evt.note,
    )
}

impl Emitter {
    pub fn new(sink: SyncSender<Event>, log_dir: impl Into<PathBuf>) -> Self {
        Emitter { sink, log_dir: log_dir.into() }
    }

    /// Sends `evt` to the output transport (dropping it if saturated) and
    /// appends it to today's log file. Errors are logged, never
    /// propagated (spec §7 taxonomy (e)).
    pub fn emit(&self, evt: Event) {
        if let Err(e) = evt.validate() {
            log::warn!("dropping invalid event before emit: {e}");
            return;
        }

        let path = day_path(&self.log_dir, evt.time_first.secs);
        let line = format_log_line(&evt);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    log::error!("failed to append to event log {}: {e}", path.display());
                }
            }
            Err(e) => log::error!("failed to open event log {}: {e}", path.display()),
        }

        if self.sink.try_send(evt).is_err() {
            log::warn!("output transport saturated, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netflow::{EventType, Timestamp};
    use tempfile::tempdir;

    fn sample_event() -> Event {
        Event::new(EventType::Dos, Timestamp::from_secs(1_700_000_000), Timestamp::from_secs(1_700_000_010))
            .with_dst_addr(IpKey::from_v4([10, 0, 0, 1]))
            .with_proto(Proto::TCP)
            .with_scale(42)
            .with_note("test dos event")
    }

    #[test]
    fn writes_one_line_per_event_to_the_daily_log() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = output_channel(8);
        let emitter = Emitter::new(tx, dir.path());
        emitter.emit(sample_event());

        let expected = day_path(dir.path(), 1_700_000_000);
        let contents = std::fs::read_to_string(expected).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("test dos event"));
    }

    #[test]
    fn log_line_field_order_is_semicolon_separated() {
        let line = format_log_line(&sample_event());
        let fields: Vec<&str> = line.split(';').collect();
        assert_eq!(fields.len(), 10);
        assert_eq!(fields[2], "11"); // Dos event type code
        assert_eq!(fields[8], "42");
        assert_eq!(fields[9], "test dos event");
    }

    #[test]
    fn saturated_transport_drops_without_panicking() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = output_channel(1);
        let emitter = Emitter::new(tx, dir.path());
        emitter.emit(sample_event());
        emitter.emit(sample_event()); // channel full, receiver never drains
    }

    #[test]
    fn invalid_event_is_dropped_before_touching_the_log() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = output_channel(8);
        let emitter = Emitter::new(tx, dir.path());
        let invalid = Event::new(EventType::Dos, Timestamp::from_secs(1), Timestamp::from_secs(1));
        emitter.emit(invalid);
        assert!(!day_path(dir.path(), 1).exists());
    }
}
