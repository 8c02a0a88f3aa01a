//! Concurrent bounded state table (C2): fixed-capacity, kick-on-collision
//! map from [`IpKey`] to [`HostRecord`], grounded on the two-hash
//! cuckoo-with-stash scheme sketched in `cuckoo_hash/hashes.h` and
//! generalized per spec §4.C2/§9 to return displaced entries rather than
//! drop them silently.

use crate::host::HostRecord;
use netflow::IpKey;
use std::sync::{Mutex, MutexGuard};

const STASH_SIZE: usize = 4;
const MAX_KICKS: usize = 8;
const ALT_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Default, Clone)]
pub struct Slot {
    occupied: bool,
    key: IpKey,
    record: HostRecord,
}

/// A locked reference to one table entry, held for the duration of an
/// update. Dropping the handle releases the lock.
pub enum Handle<'a> {
    Table(MutexGuard<'a, Slot>),
    Stash(MutexGuard<'a, Vec<Slot>>, usize),
}

impl<'a> Handle<'a> {
    pub fn key(&self) -> IpKey {
        match self {
            Handle::Table(g) => g.key,
            Handle::Stash(stash, i) => stash[*i].key,
        }
    }

    pub fn record(&self) -> &HostRecord {
        match self {
            Handle::Table(g) => &g.record,
            Handle::Stash(stash, i) => &stash[*i].record,
        }
    }

    pub fn record_mut(&mut self) -> &mut HostRecord {
        match self {
            Handle::Table(g) => &mut g.record,
            Handle::Stash(stash, i) => &mut stash[*i].record,
        }
    }
}

/// Fixed-capacity concurrent map shared by the ingest thread (writes via
/// [`StateTable::get_or_insert`]) and the sweep thread (reads/deletes via
/// [`StateTable::iter_sweep`]).
pub struct StateTable {
    capacity: usize,
    slots: Vec<Mutex<Slot>>,
    stash: Mutex<Vec<Slot>>,
}

impl StateTable {
    /// Rounds `requested` up to a power of two, warning if it wasn't one
    /// already (spec §4.C2).
    pub fn new(requested: u32) -> Self {
        let capacity = requested.next_power_of_two() as usize;
        if capacity as u32 != requested {
            log::warn!(
                "table-size {} is not a power of two, rounding up to {}",
                requested,
                capacity
            );
        }
        StateTable {
            capacity,
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
            stash: Mutex::new(vec![Slot::default(); STASH_SIZE]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_index(&self, key: IpKey, alt: bool) -> usize {
        let h = if alt {
            key.fnv_hash().rotate_left(32) ^ ALT_SALT
        } else {
            key.fnv_hash()
        };
        (h as usize) & (self.capacity - 1)
    }

    fn alt_of(&self, key: IpKey, known_slot: usize) -> usize {
        let h1 = self.slot_index(key, false);
        let h2 = self.slot_index(key, true);
        if h1 == known_slot {
            h2
        } else {
            h1
        }
    }

    /// Returns a locked handle for `key`, inserting a fresh zeroed record
    /// if absent. If insertion displaces an existing occupant past the
    /// stash capacity, the displaced `(key, record)` pair is returned so
    /// the caller can run detection on it before it is lost (spec §4.C2).
    pub fn get_or_insert(&self, key: IpKey) -> (Handle<'_>, Option<(IpKey, HostRecord)>) {
        let h1 = self.slot_index(key, false);
        let h2 = self.slot_index(key, true);

        if let Some(h) = self.lock_if_matches(h1, key) {
            return (h, None);
        }
        if let Some(h) = self.lock_if_matches(h2, key) {
            return (h, None);
        }
        {
            let stash = self.stash.lock().unwrap();
            if let Some(pos) = stash.iter().position(|s| s.occupied && s.key == key) {
                return (Handle::Stash(stash, pos), None);
            }
        }
        if let Some(h) = self.lock_if_empty(h1, key) {
            return (h, None);
        }
        if let Some(h) = self.lock_if_empty(h2, key) {
            return (h, None);
        }

        // Both candidate slots are occupied by other keys: cuckoo-kick,
        // placing `key` at h1 and cascading the displaced occupant.
        let evicted_first = {
            let mut guard = self.slots[h1].lock().unwrap();
            std::mem::replace(
                &mut *guard,
                Slot {
                    occupied: true,
                    key,
                    record: HostRecord::default(),
                },
            )
        };

        let mut cur = evicted_first;
        let mut cur_slot = h1;
        for _ in 0..MAX_KICKS {
            let alt = self.alt_of(cur.key, cur_slot);
            let mut guard = self.slots[alt].lock().unwrap();
            if !guard.occupied {
                *guard = cur;
                drop(guard);
                return (Handle::Table(self.slots[h1].lock().unwrap()), None);
            }
            let displaced = std::mem::replace(&mut *guard, cur);
            cur = displaced;
            cur_slot = alt;
        }

        {
            let mut stash = self.stash.lock().unwrap();
            if let Some(pos) = stash.iter().position(|s| !s.occupied) {
                stash[pos] = cur;
                return (Handle::Table(self.slots[h1].lock().unwrap()), None);
            }
        }

        (
            Handle::Table(self.slots[h1].lock().unwrap()),
            Some((cur.key, cur.record)),
        )
    }

    fn lock_if_matches(&self, idx: usize, key: IpKey) -> Option<Handle<'_>> {
        let guard = self.slots[idx].lock().unwrap();
        if guard.occupied && guard.key == key {
            Some(Handle::Table(guard))
        } else {
            None
        }
    }

    fn lock_if_empty(&self, idx: usize, key: IpKey) -> Option<Handle<'_>> {
        let mut guard = self.slots[idx].lock().unwrap();
        if !guard.occupied {
            *guard = Slot {
                occupied: true,
                key,
                record: HostRecord::default(),
            };
            Some(Handle::Table(guard))
        } else {
            None
        }
    }

    /// Read/write access to an existing entry; `None` if absent.
    pub fn get_locked(&self, key: IpKey) -> Option<Handle<'_>> {
        let h1 = self.slot_index(key, false);
        let h2 = self.slot_index(key, true);
        if let Some(h) = self.lock_if_matches(h1, key) {
            return Some(h);
        }
        if let Some(h) = self.lock_if_matches(h2, key) {
            return Some(h);
        }
        let stash = self.stash.lock().unwrap();
        stash
            .iter()
            .position(|s| s.occupied && s.key == key)
            .map(|pos| Handle::Stash(stash, pos))
    }

    /// Releases the slot held by `handle`.
    pub fn remove_locked(&self, mut handle: Handle<'_>) {
        match &mut handle {
            Handle::Table(g) => **g = Slot::default(),
            Handle::Stash(stash, i) => stash[*i] = Slot::default(),
        }
    }

    /// Walks every valid entry under its own lock. `f` returns `true` to
    /// delete the entry after it runs.
    pub fn iter_sweep<F: FnMut(IpKey, &mut HostRecord) -> bool>(&self, mut f: F) {
        for slot_lock in &self.slots {
            let mut guard = slot_lock.lock().unwrap();
            if guard.occupied {
                let key = guard.key;
                if f(key, &mut guard.record) {
                    *guard = Slot::default();
                }
            }
        }
        let mut stash = self.stash.lock().unwrap();
        for slot in stash.iter_mut() {
            if slot.occupied {
                let key = slot.key;
                if f(key, &mut slot.record) {
                    *slot = Slot::default();
                }
            }
        }
    }

    /// Runs `f` over every entry for cleanup, then resets the whole table.
    pub fn clear_all<F: FnMut(IpKey, &mut HostRecord)>(&self, mut f: F) {
        self.iter_sweep(|k, r| {
            f(k, r);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_capacity_to_power_of_two() {
        let table = StateTable::new(100);
        assert_eq!(table.capacity(), 128);
    }

    #[test]
    fn get_or_insert_then_get_locked_returns_same_slot() {
        let table = StateTable::new(16);
        let key = IpKey::from_v4([10, 0, 0, 1]);
        {
            let (mut handle, evicted) = table.get_or_insert(key);
            assert!(evicted.is_none());
            handle.record_mut().outbound.uniqueips = 42;
        }
        let handle = table.get_locked(key).expect("entry should exist");
        assert_eq!(handle.record().outbound.uniqueips, 42);
    }

    #[test]
    fn absent_key_returns_none() {
        let table = StateTable::new(16);
        assert!(table.get_locked(IpKey::from_v4([1, 2, 3, 4])).is_none());
    }

    #[test]
    fn saturating_a_tiny_table_produces_a_kicked_entry() {
        let table = StateTable::new(2);
        let mut kicked_any = false;
        for i in 0..64u8 {
            let key = IpKey::from_v4([10, 0, 0, i]);
            let (_handle, evicted) = table.get_or_insert(key);
            if evicted.is_some() {
                kicked_any = true;
            }
        }
        assert!(kicked_any, "a 2-slot table under 64 distinct keys must kick someone out");
    }

    #[test]
    fn iter_sweep_can_delete_current_entry() {
        let table = StateTable::new(16);
        for i in 0..4u8 {
            table.get_or_insert(IpKey::from_v4([10, 0, 0, i]));
        }
        let mut seen = 0;
        table.iter_sweep(|_k, _r| {
            seen += 1;
            true
        });
        assert_eq!(seen, 4);
        let mut seen_again = 0;
        table.iter_sweep(|_k, _r| {
            seen_again += 1;
            false
        });
        assert_eq!(seen_again, 0, "table should be empty after full delete sweep");
    }
}
