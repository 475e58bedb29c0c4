//! Object headers and the resident object cache
//!
//! Every resident node or page has an [`ObjectHeader`]: identity, generation
//! counts, the role it is prepared for, the ring of keys pointing at it, and
//! the mapping tables produced from it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::arena::{Arena, RawHandle};
use super::key::Key;
use super::keyring::KeyRing;
use crate::config::NODE_SLOTS;
use crate::memory::TableRef;
use crate::process::ProcessRef;

/// Persistent object identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub u64);

/// Generation count of an object
pub type ObCount = u32;

/// Physical frame number of a page or mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

/// Weak reference to a resident object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef(RawHandle);

impl ObjRef {
    pub(crate) fn raw(&self) -> RawHandle {
        self.0
    }
}

/// Role a resident object is currently prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObType {
    /// Node not prepared for any role
    Unprepared,
    /// Node prepared as a GPT; it may have mapping table products
    Segment,
    /// Node prepared as the root of a process
    ProcessRoot,
    /// Node holding a loaded process's key registers
    KeyRegs,
    /// Data page
    DataPage,
}

impl ObType {
    pub fn is_node(self) -> bool {
        self != ObType::DataPage
    }
}

bitflags! {
    /// Object state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObFlags: u8 {
        /// Must be written back before the copy is dropped
        const DIRTY = 0x01;
        /// Some key was prepared against `alloc_count`
        const ALLOC_COUNT_USED = 0x02;
        /// Some resume key was prepared against `call_count`
        const CALL_COUNT_USED = 0x04;
    }
}

/// Key slots of a node
pub struct NodeBody {
    pub(crate) slots: [Key; NODE_SLOTS],
    /// GPT l2v and flags, or other per-role data
    pub(crate) node_data: u16,
}

impl NodeBody {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Key::void()),
            node_data: 0,
        }
    }

    pub fn slot(&self, i: usize) -> Option<&Key> {
        self.slots.get(i)
    }

    pub fn node_data(&self) -> u16 {
        self.node_data
    }
}

impl Default for NodeBody {
    fn default() -> Self {
        Self::new()
    }
}

/// Object contents
pub enum ObjectBody {
    Node(NodeBody),
    Page { frame: FrameNumber },
}

/// Header of a resident object
pub struct ObjectHeader {
    pub(crate) oid: Oid,
    pub(crate) alloc_count: ObCount,
    pub(crate) call_count: ObCount,
    pub(crate) ob_type: ObType,
    pub(crate) flags: ObFlags,
    pub(crate) key_ring: KeyRing,
    /// Mapping tables built from this GPT
    pub(crate) products: Vec<TableRef>,
    /// Process using this node as its root or key registers
    pub(crate) context: Option<ProcessRef>,
    /// Transaction that pinned this object
    pub(crate) trans_pin: u64,
    pub(crate) body: ObjectBody,
}

impl ObjectHeader {
    pub(crate) fn new(oid: Oid, alloc_count: ObCount, call_count: ObCount, body: ObjectBody) -> Self {
        let ob_type = match body {
            ObjectBody::Node(_) => ObType::Unprepared,
            ObjectBody::Page { .. } => ObType::DataPage,
        };
        Self {
            oid,
            alloc_count,
            call_count,
            ob_type,
            flags: ObFlags::empty(),
            key_ring: KeyRing::new(),
            products: Vec::new(),
            context: None,
            trans_pin: 0,
            body,
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn alloc_count(&self) -> ObCount {
        self.alloc_count
    }

    pub fn call_count(&self) -> ObCount {
        self.call_count
    }

    pub fn ob_type(&self) -> ObType {
        self.ob_type
    }

    pub fn flags(&self) -> ObFlags {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(ObFlags::DIRTY)
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    pub fn products(&self) -> &[TableRef] {
        &self.products
    }

    pub fn context(&self) -> Option<ProcessRef> {
        self.context
    }

    pub fn node(&self) -> Option<&NodeBody> {
        match &self.body {
            ObjectBody::Node(n) => Some(n),
            ObjectBody::Page { .. } => None,
        }
    }

    pub(crate) fn node_mut(&mut self) -> Option<&mut NodeBody> {
        match &mut self.body {
            ObjectBody::Node(n) => Some(n),
            ObjectBody::Page { .. } => None,
        }
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        match self.body {
            ObjectBody::Page { frame } => Some(frame),
            ObjectBody::Node(_) => None,
        }
    }

    pub(crate) fn make_dirty(&mut self) {
        self.flags |= ObFlags::DIRTY;
    }
}

/// Resident objects, indexed by handle and by identity
#[derive(Default)]
pub struct ObjectCache {
    arena: Arena<ObjectHeader>,
    by_oid: BTreeMap<Oid, ObjRef>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, oid: Oid) -> Option<ObjRef> {
        self.by_oid.get(&oid).copied()
    }

    pub fn get(&self, obj: ObjRef) -> Option<&ObjectHeader> {
        self.arena.get(obj.0)
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut ObjectHeader> {
        self.arena.get_mut(obj.0)
    }

    pub(crate) fn insert(&mut self, header: ObjectHeader) -> ObjRef {
        let oid = header.oid;
        let obj = ObjRef(self.arena.insert(header));
        self.by_oid.insert(oid, obj);
        obj
    }

    pub(crate) fn remove(&mut self, obj: ObjRef) -> Option<ObjectHeader> {
        let header = self.arena.remove(obj.0)?;
        self.by_oid.remove(&header.oid);
        Some(header)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &ObjectHeader)> {
        self.arena.iter().map(|(h, o)| (ObjRef(h), o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_lookup_by_oid() {
        let mut cache = ObjectCache::new();
        let a = cache.insert(ObjectHeader::new(Oid(7), 1, 0, ObjectBody::Node(NodeBody::new())));
        let p = cache.insert(ObjectHeader::new(
            Oid(8),
            0,
            0,
            ObjectBody::Page {
                frame: FrameNumber(3),
            },
        ));
        assert_eq!(cache.lookup(Oid(7)), Some(a));
        assert_eq!(cache.get(a).unwrap().ob_type(), ObType::Unprepared);
        assert_eq!(cache.get(p).unwrap().ob_type(), ObType::DataPage);
        assert_eq!(cache.get(p).unwrap().frame(), Some(FrameNumber(3)));

        cache.remove(a);
        assert_eq!(cache.lookup(Oid(7)), None);
        assert!(cache.get(a).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_new_node_slots_are_void() {
        let body = NodeBody::new();
        assert!(body.slots.iter().all(|k| k.is_void()));
        assert!(body.slot(NODE_SLOTS).is_none());
    }
}
