//! R7: horizontal per-source-port address scan, a separate compact
//! detector keyed on `(source IP, destination port)`, grounded on
//! `haddrscan_detector/haddrscan_detector.c`.

use netflow::{Event, EventType, FlowRecord, IpKey, Proto, TcpFlags, Timestamp};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub src_ip: IpKey,
    pub dst_port: u16,
}

struct ScanEntry {
    dst_ips: Vec<IpKey>,
    time_first: Timestamp,
    last_seen: Timestamp,
}

/// Tracks, per `(src_ip, dst_port)`, the set of distinct destination IPs
/// contacted with single-packet TCP SYN flows, firing once the configured
/// threshold is reached (spec §4.C7 R7).
pub struct HaddrscanDetector {
    numaddrs_threshold: u32,
    idle_threshold: u32,
    entries: HashMap<ScanKey, ScanEntry>,
}

impl HaddrscanDetector {
    pub fn new(numaddrs_threshold: u32, idle_threshold: u32) -> Self {
        HaddrscanDetector {
            numaddrs_threshold,
            idle_threshold,
            entries: HashMap::new(),
        }
    }

    fn is_candidate(r: &FlowRecord) -> bool {
        r.proto == Proto::TCP && r.packets == 1 && r.tcp_flags.0 == TcpFlags::SYN
    }

    /// Feeds one flow; returns a `portscan_h` event once the destination
    /// count for its key crosses the threshold. The key is reset after
    /// firing so a sustained scan is reported once per threshold crossing.
    pub fn record_flow(&mut self, r: &FlowRecord) -> Option<Event> {
        if !Self::is_candidate(r) {
            return None;
        }
        let key = ScanKey {
            src_ip: r.src_ip,
            dst_port: r.dst_port,
        };
        let entry = self.entries.entry(key).or_insert_with(|| ScanEntry {
            dst_ips: Vec::new(),
            time_first: r.time_first,
            last_seen: r.time_last,
        });
        entry.last_seen = r.time_last;
        if !entry.dst_ips.contains(&r.dst_ip) {
            entry.dst_ips.push(r.dst_ip);
        }

        if entry.dst_ips.len() as u32 >= self.numaddrs_threshold {
            let time_first = entry.time_first;
            let time_last = entry.last_seen;
            let sample: Vec<IpKey> = entry.dst_ips.iter().take(4).copied().collect();
            self.entries.remove(&key);

            let mut evt = Event::new(EventType::PortScanHorizontal, time_first, time_last)
                .with_src_addr(key.src_ip)
                .with_dst_port(key.dst_port)
                .with_proto(Proto::TCP)
                .with_scale(self.numaddrs_threshold)
                .with_note("horizontal address scan");
            for dst in sample {
                evt = evt.with_dst_addr(dst);
            }
            return Some(evt);
        }
        None
    }

    /// Drops entries untouched for `idle_threshold` seconds, called every
    /// `pruning_interval` seconds by the sweep scheduler.
    pub fn prune(&mut self, now: Timestamp) {
        self.entries
            .retain(|_, e| now.secs.saturating_sub(e.last_seen.secs) < self.idle_threshold);
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netflow::Direction;

    fn syn(src: u8, dst: u8, port: u16, t: u32) -> FlowRecord {
        FlowRecord {
            src_ip: IpKey::from_v4([10, 0, 0, src]),
            dst_ip: IpKey::from_v4([192, 168, 1, dst]),
            src_port: 50000,
            dst_port: port,
            proto: Proto::TCP,
            packets: 1,
            bytes: 60,
            tcp_flags: TcpFlags(TcpFlags::SYN),
            time_first: Timestamp::from_secs(t),
            time_last: Timestamp::from_secs(t),
            direction: Direction::Request,
            link_bit_field: 0,
        }
    }

    #[test]
    fn fires_once_threshold_addresses_are_seen() {
        let mut det = HaddrscanDetector::new(50, 300);
        let mut fired = None;
        for i in 0..50u8 {
            let flow = syn(2, i, 445, 1000 + i as u32);
            if let Some(evt) = det.record_flow(&flow) {
                fired = Some(evt);
            }
        }
        let evt = fired.expect("50th distinct destination should fire");
        assert_eq!(evt.dst_addrs.len(), 4);
        assert_eq!(evt.scale, 50);
    }

    #[test]
    fn non_syn_flows_are_ignored() {
        let mut det = HaddrscanDetector::new(5, 300);
        for i in 0..10u8 {
            let mut flow = syn(2, i, 445, 1000);
            flow.packets = 2;
            assert!(det.record_flow(&flow).is_none());
        }
        assert_eq!(det.entry_count(), 0);
    }

    #[test]
    fn prune_drops_idle_entries() {
        let mut det = HaddrscanDetector::new(50, 300);
        det.record_flow(&syn(2, 1, 445, 1000));
        assert_eq!(det.entry_count(), 1);
        det.prune(Timestamp::from_secs(2000));
        assert_eq!(det.entry_count(), 0);
    }
}
