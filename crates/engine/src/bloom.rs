//! Sliding Bloom filter pair (C3): an active/learning pair rotated every
//! half active-timeout of flow time, giving an approximate sliding-window
//! distinct-peer count without storing the peers themselves. Grounded on
//! the active/learning `bloom_filter` pair in
//! `hoststatsnemea/src/stream_version/profile.h`, reimplemented here on
//! top of the `bloomfilter` crate instead of hand-rolled bit arrays.

use bloomfilter::Bloom;

/// Packed `(src_ip, dst_ip, first_seen timestamp, origin bit)` key (spec
/// §3 `BloomKey`). The origin bit lets the source side and destination
/// side of the same edge contribute independent "have I seen this peer"
/// answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BloomKey {
    pub ip_a: [u8; 16],
    pub ip_b: [u8; 16],
    pub time_low15: u16,
    pub origin: bool,
}

impl BloomKey {
    pub fn new(ip_a: [u8; 16], ip_b: [u8; 16], first_seen_secs: u32, origin: bool) -> Self {
        BloomKey {
            ip_a,
            ip_b,
            time_low15: (first_seen_secs & 0x7fff) as u16,
            origin,
        }
    }
}

const DEFAULT_FPP: f64 = 0.01;

/// Active/learning pair. `contains_and_insert` tests the active filter and
/// inserts into both; `swap()` retires the active filter, promotes
/// learning to active, and starts a fresh (cleared) learning filter.
pub struct BloomPair {
    active: Bloom<BloomKey>,
    learning: Bloom<BloomKey>,
}

impl BloomPair {
    /// Sized for `2 * table_capacity` elements at the documented FPP
    /// (spec §4.C3).
    pub fn new(table_capacity: usize) -> Self {
        let items = (table_capacity * 2).max(1);
        BloomPair {
            active: Bloom::new_for_fp_rate(items, DEFAULT_FPP),
            learning: Bloom::new_for_fp_rate(items, DEFAULT_FPP),
        }
    }

    /// Tests membership in the active filter, then inserts into both.
    /// Returns `true` if the key was already present (not a new peer).
    pub fn contains_and_insert(&mut self, key: &BloomKey) -> bool {
        let was_present = self.active.check(key);
        self.active.set(key);
        self.learning.set(key);
        was_present
    }

    /// Clears the active filter and exchanges it with learning, which has
    /// been accumulating for the previous half-window.
    pub fn swap(&mut self) {
        self.active.clear();
        std::mem::swap(&mut self.active, &mut self.learning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_a_miss_repeat_is_a_hit() {
        let mut pair = BloomPair::new(1024);
        let key = BloomKey::new([1; 16], [2; 16], 100, false);
        assert!(!pair.contains_and_insert(&key));
        assert!(pair.contains_and_insert(&key));
    }

    #[test]
    fn origin_bit_makes_src_and_dst_independent() {
        let mut pair = BloomPair::new(1024);
        let src_side = BloomKey::new([1; 16], [2; 16], 100, false);
        let dst_side = BloomKey::new([1; 16], [2; 16], 100, true);
        assert!(!pair.contains_and_insert(&src_side));
        assert!(!pair.contains_and_insert(&dst_side));
    }

    #[test]
    fn two_consecutive_swaps_with_no_inserts_restore_empty_active() {
        let mut pair = BloomPair::new(1024);
        let key = BloomKey::new([1; 16], [2; 16], 100, false);
        pair.contains_and_insert(&key);
        pair.swap();
        pair.swap();
        assert!(!pair.active.check(&key));
    }

    #[test]
    fn swap_keeps_recent_peers_visible_for_one_more_window() {
        let mut pair = BloomPair::new(1024);
        let key = BloomKey::new([1; 16], [2; 16], 100, false);
        pair.contains_and_insert(&key);
        pair.swap();
        assert!(pair.contains_and_insert(&key), "learning half should carry the peer into the new active window");
    }
}
