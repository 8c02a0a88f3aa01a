//! Rolling interval accumulator (C4), the volumetric-DDoS detector's
//! state. Grounded precisely on `ddos_detector/ddos_detector.c`'s
//! `move_window` and its flow-spreading loop: interval length, window
//! size, flood open/report/close lifecycle and the adaptive per-source
//! sub-tree all mirror that file's constants and control flow.

use crate::config::Config;
use netflow::{IpKey, Timestamp};
use std::collections::HashMap;

/// Per-source accumulator inside a destination's adaptive sub-tree.
#[derive(Debug, Clone)]
struct SourceAccumulator {
    bytes_per_interval: Vec<u64>,
    total: u64,
    avg_flow: u64,
}

impl SourceAccumulator {
    fn new(n: usize) -> Self {
        SourceAccumulator {
            bytes_per_interval: vec![0; n],
            total: 0,
            avg_flow: 0,
        }
    }
}

/// An in-progress or just-closed volumetric anomaly on one destination.
#[derive(Debug, Clone)]
pub struct FloodInfo {
    pub first_reported: u32,
    pub last_reported: u32,
    pub total_bytes: u64,
    pub src_ip_cnt: usize,
}

#[derive(Debug, Clone)]
struct DestAccumulator {
    bytes_per_interval: Vec<u64>,
    total: u64,
    sources: HashMap<IpKey, SourceAccumulator>,
    flood: Option<FloodInfo>,
}

impl DestAccumulator {
    fn new(n: usize) -> Self {
        DestAccumulator {
            bytes_per_interval: vec![0; n],
            total: 0,
            sources: HashMap::new(),
            flood: None,
        }
    }
}

/// Reported when the volumetric rule (R6) opens, updates or closes a
/// flood on a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumetricReport {
    pub dst: IpKey,
    pub time_first: u32,
    pub time_last: u32,
    pub excess_bytes: u64,
    pub closed: bool,
}

/// The shared ring-buffer clock plus one [`DestAccumulator`] per tracked
/// destination (spec §4.C4/§9).
pub struct DdosAccumulator {
    interval: u32,
    n: usize,
    threshold_flow_rate: u64,
    min_flow: u64,
    current_time: u32,
    current_interval_start: u32,
    current_slot_index: usize,
    destinations: HashMap<IpKey, DestAccumulator>,
}

/// Walks the ring from the oldest tracked interval toward the current
/// one, forming an expanding baseline average, and reports whether the
/// next two intervals both spike well above that baseline — the same
/// forward scan `ddos_detector.c`'s `move_window` runs once a
/// destination's subtree already exists (two-ahead check guards against
/// a single noisy interval opening a flood).
fn detect_sustained_spike(slots: &[u64], cur_idx: usize, min_flow: u64, threshold_flow_rate: u64) -> bool {
    let n = slots.len();
    if n < 3 {
        return false;
    }
    let oldest = (cur_idx + 1) % n;
    let mut sum: u128 = 0;
    for k in 0..n - 2 {
        let idx = (oldest + k) % n;
        sum += slots[idx] as u128;
        let avg = (sum / (k + 1) as u128) as u64;
        let next1 = slots[(oldest + k + 1) % n];
        let next2 = slots[(oldest + k + 2) % n];
        if avg > min_flow
            && avg.saturating_mul(threshold_flow_rate) < next1
            && avg.saturating_mul(threshold_flow_rate) < next2
        {
            return true;
        }
    }
    false
}

fn average_excluding_current(slots: &[u64], cur_idx: usize, count: usize) -> u64 {
    let n = slots.len();
    if count == 0 {
        return 0;
    }
    let mut sum: u128 = 0;
    for i in 1..=count {
        sum += slots[(cur_idx + n - i) % n] as u128;
    }
    (sum / count as u128) as u64
}

/// Distributes `bytes` across the ring slots the flow
/// `[time_first, time_last]` overlaps, walking backward from the current
/// slot (spec §4.C4 "Flow-spread rule").
#[allow(clippy::too_many_arguments)]
fn spread_bytes(
    slots: &mut [u64],
    total: &mut u64,
    cur_idx: usize,
    cur_start: u32,
    interval: u32,
    mut bytes: u64,
    time_first: u32,
    time_last: u32,
) {
    let n = slots.len() as u32;
    let mut dur = time_last.saturating_sub(time_first) + 1;
    for i in 0..n {
        if bytes == 0 {
            break;
        }
        let int_start = cur_start.saturating_sub(i * interval);
        let int_end = int_start + interval;
        let idx = ((cur_idx as i64 - i as i64).rem_euclid(n as i64)) as usize;

        if time_last < int_start {
            continue;
        }
        if time_first >= int_start {
            slots[idx] = slots[idx].saturating_add(bytes);
            *total = total.saturating_add(bytes);
            break;
        }
        if time_last > int_end {
            let portion = (bytes as u128 * interval as u128 / dur.max(1) as u128) as u64;
            slots[idx] = slots[idx].saturating_add(portion);
            *total = total.saturating_add(portion);
            bytes = bytes.saturating_sub(portion);
            dur = dur.saturating_sub(interval);
        } else {
            let seconds_in_interval = time_last - int_start + 1;
            let portion = (bytes as u128 * seconds_in_interval as u128 / dur.max(1) as u128) as u64;
            slots[idx] = slots[idx].saturating_add(portion);
            *total = total.saturating_add(portion);
            bytes = bytes.saturating_sub(portion);
            dur = dur.saturating_sub(seconds_in_interval);
        }
    }
}

impl DdosAccumulator {
    pub fn new(cfg: &Config) -> Self {
        DdosAccumulator {
            interval: cfg.ddos_interval,
            n: cfg.ddos_n_intervals() as usize,
            threshold_flow_rate: cfg.ddos_threshold_flow_rate,
            min_flow: cfg.ddos_min_flow,
            current_time: 0,
            current_interval_start: 0,
            current_slot_index: 0,
            destinations: HashMap::new(),
        }
    }

    pub fn n_intervals(&self) -> usize {
        self.n
    }

    /// Feeds one flow into the accumulator, advancing the window clock as
    /// needed and spreading `bytes` across the intervals it overlaps.
    /// Any R6 flood open/update/close events produced by a window advance
    /// are appended to `reports`.
    pub fn record_flow(
        &mut self,
        dst: IpKey,
        src: IpKey,
        bytes: u64,
        time_first: Timestamp,
        time_last: Timestamp,
        reports: &mut Vec<VolumetricReport>,
    ) {
        let flow_end = time_last.secs;

        if self.current_interval_start == 0 && self.current_time == 0 {
            self.current_interval_start = flow_end - flow_end % self.interval;
            self.current_time = flow_end;
            self.current_slot_index = self.n - 1;
        } else if flow_end.saturating_sub(self.current_time) > self.interval * self.n as u32 {
            log::warn!(
                "ddos accumulator saw a gap of {}s (> window), reinitializing",
                flow_end.saturating_sub(self.current_time)
            );
            self.destinations.clear();
            self.current_interval_start = flow_end - flow_end % self.interval;
            self.current_time = flow_end;
            self.current_slot_index = self.n - 1;
        } else if flow_end > self.current_time {
            self.current_time = flow_end;
        }

        while self.current_time >= self.current_interval_start + self.interval {
            let mv = (self.current_time - self.current_interval_start) / self.interval;
            self.advance_window(mv, reports);
        }

        let entry = self
            .destinations
            .entry(dst)
            .or_insert_with(|| DestAccumulator::new(self.n));
        spread_bytes(
            &mut entry.bytes_per_interval,
            &mut entry.total,
            self.current_slot_index,
            self.current_interval_start,
            self.interval,
            bytes,
            time_first.secs,
            time_last.secs,
        );

        let avg = average_excluding_current(&entry.bytes_per_interval, self.current_slot_index, self.n - 1);
        if !entry.sources.is_empty() || avg > self.min_flow {
            let src_entry = entry
                .sources
                .entry(src)
                .or_insert_with(|| SourceAccumulator::new(self.n));
            spread_bytes(
                &mut src_entry.bytes_per_interval,
                &mut src_entry.total,
                self.current_slot_index,
                self.current_interval_start,
                self.interval,
                bytes,
                time_first.secs,
                time_last.secs,
            );
        }
    }

    /// `move_window`: zeroes the `move` newest slots across every tracked
    /// destination before re-indexing, running the R6 flood
    /// open/report/close checks for each (spec §4.C4, §4.C7 R6).
    fn advance_window(&mut self, mv: u32, reports: &mut Vec<VolumetricReport>) {
        let mv = mv.max(1);
        let n = self.n as u32;

        if mv >= n {
            self.destinations.clear();
        } else {
            for (&dst, acc) in self.destinations.iter_mut() {
                for step in 0..mv {
                    let advance_idx = (self.current_slot_index as u32 + 1 + step) % n;
                    acc.total = acc
                        .total
                        .saturating_sub(acc.bytes_per_interval[advance_idx as usize]);
                    acc.bytes_per_interval[advance_idx as usize] = 0;
                }

                let avg = average_excluding_current(&acc.bytes_per_interval, self.current_slot_index, self.n - 1);
                let latest = acc.bytes_per_interval[self.current_slot_index];
                let is_high = avg > self.min_flow && latest >= avg.saturating_mul(self.threshold_flow_rate);

                if acc.flood.is_none()
                    && detect_sustained_spike(
                        &acc.bytes_per_interval,
                        self.current_slot_index,
                        self.min_flow,
                        self.threshold_flow_rate,
                    )
                {
                    let excess = latest.saturating_sub(avg);
                    acc.flood = Some(FloodInfo {
                        first_reported: self.current_interval_start,
                        last_reported: self.current_interval_start,
                        total_bytes: excess,
                        src_ip_cnt: acc.sources.len().max(1),
                    });
                    reports.push(VolumetricReport {
                        dst,
                        time_first: self.current_interval_start,
                        time_last: self.current_interval_start + self.interval,
                        excess_bytes: excess,
                        closed: false,
                    });
                } else if let Some(flood) = acc.flood.as_mut() {
                    if is_high {
                        flood.total_bytes = flood.total_bytes.saturating_add(latest.saturating_sub(avg));
                    }
                    flood.last_reported = self.current_interval_start;

                    acc.sources.retain(|_, s| {
                        s.avg_flow = average_excluding_current(&s.bytes_per_interval, self.current_slot_index, self.n - 1);
                        s.bytes_per_interval[self.current_slot_index] > s.avg_flow
                    });
                    flood.src_ip_cnt = acc.sources.len();

                    let age = self.current_interval_start.saturating_sub(flood.first_reported);
                    let max_age = self.interval * (2 * n - 1);
                    let should_close = flood.src_ip_cnt == 0 || age >= max_age;
                    if should_close {
                        reports.push(VolumetricReport {
                            dst,
                            time_first: flood.first_reported,
                            time_last: self.current_interval_start,
                            excess_bytes: flood.total_bytes,
                            closed: true,
                        });
                        acc.flood = None;
                    } else if !is_high {
                        reports.push(VolumetricReport {
                            dst,
                            time_first: flood.first_reported,
                            time_last: self.current_interval_start,
                            excess_bytes: flood.total_bytes,
                            closed: false,
                        });
                    }
                }
            }
            self.destinations.retain(|_, acc| acc.total > 0 || acc.flood.is_some());
        }

        self.current_slot_index = (self.current_slot_index + mv as usize) % self.n;
        self.current_interval_start += self.interval * mv;
    }

    #[cfg(test)]
    fn destination_total(&self, dst: IpKey) -> Option<u64> {
        self.destinations.get(&dst).map(|a| a.total)
    }

    #[cfg(test)]
    fn destination_slots(&self, dst: IpKey) -> Option<Vec<u64>> {
        self.destinations.get(&dst).map(|a| a.bytes_per_interval.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    fn ts(secs: u32) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn single_instant_flow_deposits_fully_in_one_interval() {
        let mut acc = DdosAccumulator::new(&cfg());
        let dst = IpKey::from_v4([10, 1, 1, 1]);
        let src = IpKey::from_v4([10, 0, 0, 1]);
        let mut reports = vec![];
        acc.record_flow(dst, src, 1000, ts(1000), ts(1000), &mut reports);
        assert_eq!(acc.destination_total(dst), Some(1000));
        let slots = acc.destination_slots(dst).unwrap();
        assert_eq!(slots.iter().sum::<u64>(), 1000);
    }

    #[test]
    fn long_flow_splits_across_multiple_intervals() {
        let mut acc = DdosAccumulator::new(&cfg());
        let dst = IpKey::from_v4([10, 1, 1, 1]);
        let src = IpKey::from_v4([10, 0, 0, 1]);
        let mut reports = vec![];
        acc.record_flow(dst, src, 6000, ts(1000), ts(1179), &mut reports);
        let slots = acc.destination_slots(dst).unwrap();
        let nonzero = slots.iter().filter(|&&b| b > 0).count();
        assert!(nonzero >= 2, "a 180s flow over a 60s interval must span at least 2 slots");
        assert_eq!(slots.iter().sum::<u64>(), acc.destination_total(dst).unwrap());
    }

    #[test]
    fn sustained_high_traffic_opens_and_eventually_closes_a_flood() {
        let mut acc = DdosAccumulator::new(&cfg());
        let dst = IpKey::from_v4([10, 1, 1, 1]);
        let mut reports = vec![];
        let mut t = 0u32;
        for i in 0..4 {
            let src = IpKey::from_v4([10, 0, 0, i as u8 + 1]);
            acc.record_flow(dst, src, 6_000, ts(t), ts(t + 59), &mut reports);
            t += 60;
        }
        for round in 0..6 {
            for i in 0..4 {
                let src = IpKey::from_v4([10, 0, 0, i as u8 + 1]);
                acc.record_flow(dst, src, 600_000, ts(t), ts(t + 59), &mut reports);
            }
            t += 60;
            let _ = round;
        }
        assert!(reports.iter().any(|r| !r.closed), "should have opened a flood report");

        for _ in 0..10 {
            let src = IpKey::from_v4([10, 0, 0, 1]);
            acc.record_flow(dst, src, 100, ts(t), ts(t + 59), &mut reports);
            t += 60;
        }
        assert!(reports.iter().any(|r| r.closed), "flood should eventually close once traffic returns to baseline");
    }

    #[test]
    fn huge_time_gap_reinitializes_without_panicking() {
        let mut acc = DdosAccumulator::new(&cfg());
        let dst = IpKey::from_v4([10, 1, 1, 1]);
        let src = IpKey::from_v4([10, 0, 0, 1]);
        let mut reports = vec![];
        acc.record_flow(dst, src, 100, ts(1000), ts(1000), &mut reports);
        acc.record_flow(dst, src, 100, ts(10_000_000), ts(10_000_000), &mut reports);
        assert_eq!(acc.destination_total(dst), Some(100));
    }
}

