//! Key preparation and key movement
//!
//! Preparing a key resolves its object identity to a resident object (or
//! loaded process), checks the generation count and links the slot onto the
//! target's key ring. Every operation that moves, overwrites or retires a
//! key keeps rings consistent:
//!
//! - a prepared object key is on exactly its target's ring;
//! - a hazarded key is never overwritten before its hazard is cleared;
//! - an unprepared key is never hazarded.

use super::header::{NodeBody, ObFlags, ObjRef, ObjectBody, ObjectHeader, Oid};
use super::key::{Guard, Key, KeyFlags, KeyPerms, KeyType, Payload};
use super::keyring::{KeyRing, RingOwner, SlotId};
use crate::config::NODE_SLOTS;
use crate::error::Step;
use crate::kernel::Kernel;
use crate::platform::{ObjectImage, ObjectKind, Platform};

fn ring_owner(key: &Key) -> Option<RingOwner> {
    match key.payload() {
        Payload::Object(r) => Some(RingOwner::Object(*r)),
        Payload::Gate(p) => Some(RingOwner::Process(*p)),
        _ => None,
    }
}

impl<P: Platform> Kernel<P> {
    pub fn ring(&self, owner: RingOwner) -> Option<&KeyRing> {
        match owner {
            RingOwner::Object(r) => self.objects.get(r).map(|h| &h.key_ring),
            RingOwner::Process(p) => self.procs.get(p).map(|p| &p.key_ring),
        }
    }

    fn ring_mut(&mut self, owner: RingOwner) -> Option<&mut KeyRing> {
        match owner {
            RingOwner::Object(r) => self.objects.get_mut(r).map(|h| &mut h.key_ring),
            RingOwner::Process(p) => self.procs.get_mut(p).map(|p| &mut p.key_ring),
        }
    }

    fn unchain(&mut self, slot: SlotId) {
        if let Some(owner) = self.key(slot).and_then(ring_owner) {
            if let Some(ring) = self.ring_mut(owner) {
                ring.unlink(slot);
            }
        }
    }

    fn chain(&mut self, slot: SlotId) {
        if let Some(owner) = self.key(slot).and_then(ring_owner) {
            match self.ring_mut(owner) {
                Some(ring) => ring.link(slot),
                None => fatal!("prepared key in {:?} names a dead owner", slot),
            }
        }
    }

    /// Replace the key in `slot`, which must not be hazarded
    fn store_key(&mut self, slot: SlotId, key: Key) {
        if self.key_ref(slot).is_hazarded() {
            fatal!("overwriting hazarded key in {:?}", slot);
        }
        self.unchain(slot);
        *self.key_ref_mut(slot) = key;
        self.chain(slot);
    }

    /// Copy the key in `src` into `dst`
    ///
    /// Hazard bits are not copied. A no-op when both name the same slot.
    pub fn key_set(&mut self, dst: SlotId, src: SlotId) {
        if dst == src {
            return;
        }
        let copy = self.key_ref(src).duplicate();
        self.store_key(dst, copy);
    }

    /// Exchange the keys in `a` and `b`; neither may be hazarded
    pub fn key_swap(&mut self, a: SlotId, b: SlotId) {
        if a == b {
            return;
        }
        if self.key_ref(a).is_hazarded() || self.key_ref(b).is_hazarded() {
            fatal!("swapping hazarded keys {:?} {:?}", a, b);
        }
        self.unchain(a);
        self.unchain(b);
        let ka = core::mem::take(self.key_ref_mut(a));
        let kb = core::mem::replace(self.key_ref_mut(b), ka);
        *self.key_ref_mut(a) = kb;
        self.chain(a);
        self.chain(b);
    }

    /// Copy the key in `src` into `dst` in unprepared form
    pub fn make_unprepared_copy(&mut self, dst: SlotId, src: SlotId) {
        if self.key_ref(dst).is_hazarded() {
            self.clear_key_hazard(dst);
        }
        self.key_set(dst, src);
        self.unprepare_key(dst);
    }

    /// Store a caller-built key into `slot`, clearing any hazard first
    pub fn write_key(&mut self, slot: SlotId, key: Key) {
        if self.key_ref(slot).is_hazarded() {
            self.clear_key_hazard(slot);
        }
        let mut key = key.duplicate();
        if key.is_prepared_object() {
            key = Key::void();
        }
        self.store_key(slot, key);
    }

    /// Make `slot` hold the null key
    pub fn set_void(&mut self, slot: SlotId) {
        self.write_key(slot, Key::void());
    }

    /// Store a prepared key to the resident object `obj` in `slot`
    pub(crate) fn key_set_to_object(
        &mut self,
        slot: SlotId,
        kind: KeyType,
        obj: ObjRef,
        perms: KeyPerms,
        guard: Guard,
    ) {
        if self.key_ref(slot).is_hazarded() {
            self.clear_key_hazard(slot);
        }
        self.store_key(slot, Key::prepared_object(kind, obj, perms, guard));
    }

    /// Clear whatever hazard the key in `slot` carries
    pub(crate) fn clear_key_hazard(&mut self, slot: SlotId) {
        match slot {
            SlotId::Node { node, slot } => self.clear_hazard(node, slot as usize),
            _ => fatal!("hazard on a non-node slot {:?}", slot),
        }
    }

    /// Resident object `oid` of `kind`, fetching it if needed
    ///
    /// `Ok(None)` when no such object exists or it has another kind.
    pub fn get_object(&mut self, oid: Oid, kind: ObjectKind) -> Step<Option<ObjRef>> {
        if let Some(obj) = self.objects.lookup(oid) {
            let is_node = self.header(obj).ob_type.is_node();
            return Ok(((kind == ObjectKind::Node) == is_node).then_some(obj));
        }
        let Some(image) = self.platform.resolve(oid, kind)? else {
            return Ok(None);
        };
        if image.kind() != kind {
            return Ok(None);
        }
        self.install_object(oid, image).map(Some)
    }

    /// Make an object image resident
    pub(crate) fn install_object(&mut self, oid: Oid, image: ObjectImage) -> Step<ObjRef> {
        let header = match image {
            ObjectImage::Node {
                alloc_count,
                call_count,
                node_data,
                slots,
            } => {
                let mut body = NodeBody::new();
                body.node_data = node_data;
                for (dst, src) in body.slots.iter_mut().zip(slots.iter()).take(NODE_SLOTS) {
                    let mut k = src.duplicate();
                    if k.is_prepared_object() {
                        log::warn!("object {:?}: prepared key in stored image, voided", oid);
                        k = Key::void();
                    }
                    *dst = k;
                }
                ObjectHeader::new(oid, alloc_count, call_count, ObjectBody::Node(body))
            }
            ObjectImage::Page { alloc_count } => {
                let frame = self.platform.allocate_frame()?;
                ObjectHeader::new(oid, alloc_count, 0, ObjectBody::Page { frame })
            }
        };
        let obj = self.objects.insert(header);
        log::trace!("object {:?} resident as {:?}", oid, obj);
        Ok(obj)
    }

    /// Prepare the key in `slot`
    ///
    /// Object keys whose object is missing or whose count no longer
    /// matches become Void. May restart while an object is fetched.
    pub fn prepare_key(&mut self, slot: SlotId) -> Step<()> {
        if self.prepare_without_object(slot) {
            return Ok(());
        }
        let key = self.key_ref(slot);
        let kind = key.kind();
        let Some((oid, count)) = key.unprepared_target() else {
            fatal!("unprepared key in {:?} names no object", slot);
        };
        self.stats.n_key_prep += 1;

        let want = if kind == KeyType::Page {
            ObjectKind::Page
        } else {
            ObjectKind::Node
        };
        let Some(obj) = self.get_object(oid, want)? else {
            self.key_ref_mut(slot).make_void();
            return Ok(());
        };

        let header = self.header(obj);
        let (current, used) = if kind == KeyType::Resume {
            (header.call_count, ObFlags::CALL_COUNT_USED)
        } else {
            (header.alloc_count, ObFlags::ALLOC_COUNT_USED)
        };
        if current != count {
            log::debug!("stale key to {:?} (count {} != {})", oid, count, current);
            self.key_ref_mut(slot).make_void();
            return Ok(());
        }

        if kind.is_process_type() {
            let Some(process) = self.node_get_process(obj)? else {
                self.key_ref_mut(slot).make_void();
                return Ok(());
            };
            self.header_mut(obj).flags |= used;
            self.key_ref_mut(slot).bind_process(process);
        } else {
            self.header_mut(obj).flags |= used;
            self.key_ref_mut(slot).bind_object(obj);
        }
        self.chain(slot);
        Ok(())
    }

    /// Prepare the key in `slot` when that needs no object
    ///
    /// Returns whether the key is now prepared. Never suspends.
    pub(crate) fn prepare_without_object(&mut self, slot: SlotId) -> bool {
        let key = self.key_ref_mut(slot);
        if !key.is_prepared() && key.unprepared_target().is_none() {
            key.insert_flags(KeyFlags::PREPARED);
        }
        key.is_prepared()
    }

    /// Mark the key in `slot` as a source of derived state
    ///
    /// Only prepared keys carry hazards.
    pub(crate) fn hazard_key(&mut self, slot: SlotId, flags: KeyFlags) {
        let key = self.key_ref_mut(slot);
        if !key.is_prepared() {
            fatal!("hazard {:?} on unprepared key in {:?}", flags, slot);
        }
        key.insert_flags(flags);
    }

    /// Return a prepared key to its unprepared form
    pub(crate) fn unprepare_key(&mut self, slot: SlotId) {
        let key = self.key_ref(slot);
        if !key.is_prepared_object() {
            return;
        }
        if key.is_hazarded() {
            fatal!("unpreparing hazarded key in {:?}", slot);
        }
        let kind = key.kind();
        let target = match *key.payload() {
            Payload::Object(r) => r,
            Payload::Gate(p) => match self.procs.get(p) {
                Some(process) => process.proc_root,
                None => fatal!("gate key in {:?} to unloaded process", slot),
            },
            _ => return,
        };
        let header = self.header(target);
        let (oid, count) = if kind == KeyType::Resume {
            (header.oid, header.call_count)
        } else {
            (header.oid, header.alloc_count)
        };
        self.unchain(slot);
        self.key_ref_mut(slot).unbind(oid, count);
    }

    /// Replace the key in `slot` with Void; it must not be hazarded
    pub(crate) fn rescind_key(&mut self, slot: SlotId) {
        if self.key_ref(slot).is_hazarded() {
            fatal!("rescinding hazarded key in {:?}", slot);
        }
        self.unchain(slot);
        self.key_ref_mut(slot).make_void();
        if let SlotId::Node { node, .. } = slot {
            self.header_mut(node).make_dirty();
        }
    }

    /// Void every key on the ring of `owner`
    pub(crate) fn rescind_all(&mut self, owner: RingOwner) {
        while let Some(slot) = self.ring(owner).and_then(KeyRing::first) {
            if self.key_ref(slot).is_hazarded() {
                self.clear_key_hazard(slot);
                continue;
            }
            self.rescind_key(slot);
        }
    }

    /// Unprepare every key on the ring of `owner`
    pub(crate) fn unprepare_all(&mut self, owner: RingOwner) {
        while let Some(slot) = self.ring(owner).and_then(KeyRing::first) {
            if self.key_ref(slot).is_hazarded() {
                self.clear_key_hazard(slot);
                continue;
            }
            self.unprepare_key(slot);
        }
    }

    /// Invalidate mappings built through any key to `obj`
    ///
    /// Keys stay prepared and keep their hazard bits.
    pub(crate) fn unmap_all(&mut self, obj: ObjRef) {
        let Some(header) = self.objects.get(obj) else {
            return;
        };
        for slot in header.key_ring.snapshot() {
            if self.key(slot).is_some_and(Key::is_wr_hazard) {
                self.depend_invalidate_slot(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_kernel, MemStore};

    #[test]
    fn test_prepare_links_ring() {
        let mut store = MemStore::new();
        store.add_page(Oid(10), 0);
        store.add_node(Oid(20), 0);
        let mut k = test_kernel(store);
        let slot = SlotId::Invocation(0);
        k.write_key(slot, Key::page(Oid(10), 0));
        k.prepare_key(slot).unwrap();

        let key = k.key(slot).unwrap();
        assert!(key.is_prepared());
        let obj = key.object_ref().unwrap();
        assert!(k.object(obj).unwrap().key_ring().contains(slot));
    }

    #[test]
    fn test_stale_count_prepares_void() {
        let mut store = MemStore::new();
        store.add_page(Oid(10), 3);
        let mut k = test_kernel(store);
        let slot = SlotId::Invocation(1);
        k.write_key(slot, Key::page(Oid(10), 2));
        k.prepare_key(slot).unwrap();
        assert!(k.key(slot).unwrap().is_void());
    }

    #[test]
    fn test_wrong_kind_prepares_void() {
        let mut store = MemStore::new();
        store.add_page(Oid(10), 0);
        let mut k = test_kernel(store);
        let slot = SlotId::Invocation(0);
        k.write_key(slot, Key::gpt(Oid(10), 0));
        k.prepare_key(slot).unwrap();
        assert!(k.key(slot).unwrap().is_void());
    }

    #[test]
    fn test_key_set_moves_ring_membership() {
        let mut store = MemStore::new();
        store.add_page(Oid(1), 0);
        store.add_page(Oid(2), 0);
        let mut k = test_kernel(store);
        let (a, b) = (SlotId::Invocation(0), SlotId::Invocation(1));
        k.write_key(a, Key::page(Oid(1), 0));
        k.write_key(b, Key::page(Oid(2), 0));
        k.prepare_key(a).unwrap();
        k.prepare_key(b).unwrap();
        let p1 = k.key(a).unwrap().object_ref().unwrap();
        let p2 = k.key(b).unwrap().object_ref().unwrap();

        k.key_set(b, a);
        assert!(k.object(p1).unwrap().key_ring().contains(b));
        assert!(!k.object(p2).unwrap().key_ring().contains(b));
        assert_eq!(k.object(p1).unwrap().key_ring().len(), 2);

        k.unprepare_key(a);
        assert_eq!(k.key(a).unwrap().unprepared_target(), Some((Oid(1), 0)));
        assert_eq!(k.object(p1).unwrap().key_ring().len(), 1);

        k.rescind_all(RingOwner::Object(p1));
        assert!(k.key(b).unwrap().is_void());
        assert!(k.object(p1).unwrap().key_ring().is_empty());
    }

    #[test]
    fn test_prepare_restarts_during_fetch() {
        let mut store = MemStore::new();
        store.add_page(Oid(5), 0);
        store.delay_fetches(1);
        let mut k = test_kernel(store);
        let slot = SlotId::Invocation(0);
        k.write_key(slot, Key::page(Oid(5), 0));
        assert!(k.prepare_key(slot).is_err());
        assert!(!k.key(slot).unwrap().is_prepared());
        k.prepare_key(slot).unwrap();
        assert!(k.key(slot).unwrap().is_prepared());
    }
}
