//! Key dependency tracking
//!
//! Records which hardware locations were derived from which key slots, so
//! that changing a slot can invalidate exactly the translations built from
//! it.
//!
//! ## Design
//!
//! The tracker is a trait so the kernel can run with other table layouts.
//! [`KeyDependTable`] is a fixed-size hash table: slots hash to a bucket and
//! a full bucket reclaims its least recently used entry. A reclaimed entry
//! is handed back to the kernel, which zaps its locations before the entry
//! is forgotten; losing track of a dependency is never allowed.
//!
//! An entry names a run of consecutive entries of one table, so a slot that
//! feeds neighbouring entries costs one record.

use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::memory::PteLoc;
use crate::objects::{KeyFlags, SlotId};
use crate::platform::Platform;

/// Hardware locations derived from one key slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependEntry {
    pub slot: SlotId,
    /// First location; for `PteLoc::Root` the run length is always 1
    pub start: PteLoc,
    pub count: usize,
}

impl DependEntry {
    /// Whether `loc` lies within this entry
    pub fn covers(&self, loc: PteLoc) -> bool {
        match (self.start, loc) {
            (PteLoc::Root(a), PteLoc::Root(b)) => a == b,
            (
                PteLoc::Entry { table: ta, index: start },
                PteLoc::Entry { table: tb, index },
            ) => ta == tb && index >= start && index < start + self.count,
            _ => false,
        }
    }
}

/// Result of recording a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependAdd {
    /// A new entry was stored
    Inserted,
    /// An existing entry already covered the location
    Present,
    /// An adjacent entry of the same slot and table was widened
    Merged,
    /// Stored by reclaiming this entry, whose locations must be zapped
    Reclaimed(DependEntry),
}

/// Slot-to-location dependency store
pub trait DependencyTracker {
    /// Record that `loc` was built from the key in `slot`
    fn add_dependency(&mut self, slot: SlotId, loc: PteLoc) -> DependAdd;

    /// Forget and return every entry recorded for `slot`
    fn invalidate(&mut self, slot: SlotId) -> Vec<DependEntry>;

    /// Number of stored entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Slot {
    entry: DependEntry,
    last_used: u64,
}

/// Bucketed dependency table with per-bucket LRU reclaim
pub struct KeyDependTable {
    buckets: Vec<Vec<Slot>>,
    bucket_size: usize,
    clock: u64,
}

impl KeyDependTable {
    pub fn new(buckets: usize, bucket_size: usize) -> Self {
        let buckets = buckets.max(1);
        let mut table = Vec::with_capacity(buckets);
        table.resize_with(buckets, Vec::new);
        Self {
            buckets: table,
            bucket_size: bucket_size.max(1),
            clock: 0,
        }
    }

    fn bucket_of(&self, slot: SlotId) -> usize {
        let h: u64 = match slot {
            SlotId::Node { node, slot } => {
                let raw = node.raw();
                (raw.index() as u64) * 37 + (raw.generation() as u64) * 7 + slot as u64
            }
            SlotId::Register { process, reg } => {
                let raw = process.raw();
                (raw.index() as u64) * 41 + (raw.generation() as u64) * 11 + reg as u64 + 1
            }
            SlotId::Invocation(i) => i as u64 + 3,
        };
        (h.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize % self.buckets.len()
    }
}

impl DependencyTracker for KeyDependTable {
    fn add_dependency(&mut self, slot: SlotId, loc: PteLoc) -> DependAdd {
        self.clock += 1;
        let now = self.clock;
        let b = self.bucket_of(slot);
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[b];

        for s in bucket.iter_mut().filter(|s| s.entry.slot == slot) {
            if s.entry.covers(loc) {
                s.last_used = now;
                return DependAdd::Present;
            }
            if let (
                PteLoc::Entry { table: ta, index: start },
                PteLoc::Entry { table: tb, index },
            ) = (s.entry.start, loc)
            {
                if ta == tb && index + 1 >= start && index <= start + s.entry.count {
                    let end = (start + s.entry.count).max(index + 1);
                    let new_start = start.min(index);
                    s.entry.start = PteLoc::Entry {
                        table: ta,
                        index: new_start,
                    };
                    s.entry.count = end - new_start;
                    s.last_used = now;
                    depend_trace!("merge {:?} -> {:?}", slot, s.entry);
                    return DependAdd::Merged;
                }
            }
        }

        let entry = DependEntry {
            slot,
            start: loc,
            count: 1,
        };
        if bucket.len() < bucket_size {
            bucket.push(Slot {
                entry,
                last_used: now,
            });
            depend_trace!("insert {:?}", entry);
            return DependAdd::Inserted;
        }

        let victim_ix = bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let victim = core::mem::replace(
            &mut bucket[victim_ix],
            Slot {
                entry,
                last_used: now,
            },
        );
        depend_trace!("reclaim {:?} for {:?}", victim.entry, entry);
        DependAdd::Reclaimed(victim.entry)
    }

    fn invalidate(&mut self, slot: SlotId) -> Vec<DependEntry> {
        let b = self.bucket_of(slot);
        let bucket = &mut self.buckets[b];
        let mut out = Vec::new();
        bucket.retain(|s| {
            if s.entry.slot == slot {
                out.push(s.entry);
                false
            } else {
                true
            }
        });
        out
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl<P: Platform> Kernel<P> {
    /// Record that `dest` is being built from the key in `slot`
    ///
    /// Marks the key write-hazarded. Does nothing without a destination.
    pub(crate) fn depend_add_key(&mut self, slot: SlotId, dest: Option<PteLoc>) {
        let Some(loc) = dest else {
            return;
        };
        self.hazard_key(slot, KeyFlags::WR_HAZARD);
        match self.depend.add_dependency(slot, loc) {
            DependAdd::Inserted => self.stats.n_depend += 1,
            DependAdd::Present => {}
            DependAdd::Merged => self.stats.n_dep_merge += 1,
            DependAdd::Reclaimed(victim) => {
                self.stats.n_depend += 1;
                self.zap_locations(victim.start, victim.count);
            }
        }
    }

    /// Zap every location built from `slot` and forget the entries
    pub(crate) fn depend_invalidate_slot(&mut self, slot: SlotId) {
        let entries = self.depend.invalidate(slot);
        if entries.is_empty() {
            return;
        }
        self.stats.n_dep_zap += 1;
        self.stats.n_dep_inval += entries.len() as u64;
        for e in entries {
            depend_trace!("zap {:?}", e);
            self.zap_locations(e.start, e.count);
        }
    }
}
