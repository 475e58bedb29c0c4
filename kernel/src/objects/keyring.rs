//! Key rings
//!
//! Every resident object (and every loaded process) keeps the set of slots
//! holding prepared keys that point at it. Rescinding, unpreparing and
//! invalidating mappings all start from this ring.
//!
//! ## Design
//!
//! Slots are named by [`SlotId`] rather than by pointer; the ring is an
//! ordered set so walks are deterministic and removal is by value.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::header::ObjRef;
use crate::process::ProcessRef;

/// Location of a key slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotId {
    /// Slot of a resident node
    Node { node: ObjRef, slot: u8 },
    /// Key register of a loaded process
    Register { process: ProcessRef, reg: u8 },
    /// Kernel invocation slot
    Invocation(u8),
}

impl SlotId {
    pub fn node(node: ObjRef, slot: usize) -> Self {
        SlotId::Node {
            node,
            slot: slot as u8,
        }
    }

    /// Node and slot index, for node slots
    pub fn as_node_slot(&self) -> Option<(ObjRef, usize)> {
        match *self {
            SlotId::Node { node, slot } => Some((node, slot as usize)),
            _ => None,
        }
    }
}

/// Holder of a key ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOwner {
    Object(ObjRef),
    Process(ProcessRef),
}

/// Set of slots holding prepared keys to one owner
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyRing {
    slots: BTreeSet<SlotId>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn link(&mut self, slot: SlotId) {
        self.slots.insert(slot);
    }

    pub(crate) fn unlink(&mut self, slot: SlotId) -> bool {
        self.slots.remove(&slot)
    }

    pub fn first(&self) -> Option<SlotId> {
        self.slots.iter().next().copied()
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.slots.contains(&slot)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotId> {
        self.slots.iter()
    }

    /// Copy of the current members
    pub(crate) fn snapshot(&self) -> Vec<SlotId> {
        self.slots.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_unlink() {
        let mut ring = KeyRing::new();
        ring.link(SlotId::Invocation(2));
        ring.link(SlotId::Invocation(0));
        ring.link(SlotId::Invocation(2));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.first(), Some(SlotId::Invocation(0)));
        assert!(ring.unlink(SlotId::Invocation(0)));
        assert!(!ring.unlink(SlotId::Invocation(0)));
        assert_eq!(ring.snapshot(), vec![SlotId::Invocation(2)]);
    }
}
