//! Node operations
//!
//! Slot updates, role changes and hazard clearing for nodes. A node slot
//! is hazarded when the kernel holds derived state built from it: a mapping
//! entry (write hazard) or a cached copy in a loaded process (read and write
//! hazard). Such a slot is only changed after `clear_hazard`.

use super::header::{ObType, ObjRef};
use super::key::{KeyFlags, KeyPerms, KeyType};
use super::keyring::{RingOwner, SlotId};
use crate::config::{NODE_SLOTS, PROC_ADDR_SPACE, PROC_GEN_KEYS};
use crate::error::{RequestError, Step};
use crate::kernel::Kernel;
use crate::platform::Platform;

impl<P: Platform> Kernel<P> {
    /// Drop the derived state built from slot `slot` of `node`
    ///
    /// Afterwards the slot carries no hazard.
    pub(crate) fn clear_hazard(&mut self, node: ObjRef, slot: usize) {
        let sid = SlotId::node(node, slot);
        let key = self.key_ref(sid);
        if !key.is_hazarded() {
            return;
        }
        let rd = key.is_rd_hazard();
        let header = self.header(node);
        let (ob_type, context) = (header.ob_type, header.context);

        match ob_type {
            ObType::Unprepared | ObType::DataPage => {
                fatal!("hazard in slot {} of unprepared {:?}", slot, node)
            }
            ObType::Segment => {
                if rd {
                    fatal!("read hazard in GPT {:?} slot {}", node, slot);
                }
                self.depend_invalidate_slot(sid);
                self.key_ref_mut(sid).remove_flags(KeyFlags::WR_HAZARD);
            }
            ObType::KeyRegs => match context {
                Some(p) => self.flush_key_regs(p),
                None => fatal!("key registers {:?} without a process", node),
            },
            ObType::ProcessRoot => {
                let Some(p) = context else {
                    fatal!("process root {:?} without a process", node)
                };
                match slot {
                    PROC_ADDR_SPACE => {
                        self.depend_invalidate_slot(sid);
                        self.key_ref_mut(sid).remove_flags(KeyFlags::WR_HAZARD);
                    }
                    PROC_GEN_KEYS => self.unload_process(p),
                    _ => self.flush_process_slot(p, slot),
                }
            }
        }

        if self.key_ref(sid).is_hazarded() {
            fatal!("slot {} of {:?} still hazarded", slot, node);
        }
    }

    pub(crate) fn clear_all_hazards(&mut self, node: ObjRef) {
        for slot in 0..NODE_SLOTS {
            self.clear_hazard(node, slot);
        }
    }

    /// Release whatever role `node` is prepared for
    pub(crate) fn node_unprepare(&mut self, node: ObjRef) {
        let header = self.header(node);
        let (ob_type, context) = (header.ob_type, header.context);
        match ob_type {
            ObType::Unprepared | ObType::DataPage => return,
            ObType::Segment => {
                self.release_products(node);
                self.clear_all_hazards(node);
            }
            ObType::ProcessRoot | ObType::KeyRegs => match context {
                Some(p) => self.unload_process(p),
                None => fatal!("prepared process node {:?} without a process", node),
            },
        }
        let header = self.header_mut(node);
        header.ob_type = ObType::Unprepared;
        header.context = None;
    }

    /// Prepare `node` as a GPT
    ///
    /// `false` when the node is prepared for a role that excludes it.
    pub(crate) fn prep_as_segment(&mut self, node: ObjRef) -> bool {
        let header = self.header_mut(node);
        match header.ob_type {
            ObType::Segment => true,
            ObType::Unprepared => {
                header.ob_type = ObType::Segment;
                header.products.clear();
                true
            }
            ObType::ProcessRoot | ObType::KeyRegs | ObType::DataPage => false,
        }
    }

    /// Overwrite slot `slot` of `node` with the key in `src`
    pub fn node_set_slot(&mut self, node: ObjRef, slot: usize, src: SlotId) -> Result<(), RequestError> {
        if slot >= NODE_SLOTS {
            return Err(RequestError::SlotOutOfRange { slot });
        }
        self.header_mut(node).make_dirty();
        self.clear_hazard(node, slot);
        self.key_set(SlotId::node(node, slot), src);
        Ok(())
    }

    /// Copy slot `slot` of `node` into `dst`
    ///
    /// With `weak`, the copy is desensitized: memory keys gain
    /// restrictions and keys conveying other authority become Void.
    pub fn node_get_slot(
        &mut self,
        node: ObjRef,
        slot: usize,
        dst: SlotId,
        weak: bool,
    ) -> Result<(), RequestError> {
        if slot >= NODE_SLOTS {
            return Err(RequestError::SlotOutOfRange { slot });
        }
        let src = SlotId::node(node, slot);
        if self.key_ref(src).is_rd_hazard() {
            self.clear_hazard(node, slot);
        }
        self.key_set(dst, src);
        if weak {
            self.desensitize(dst);
        }
        Ok(())
    }

    /// Weaken the key in `slot` as if fetched through a weak key
    pub(crate) fn desensitize(&mut self, slot: SlotId) {
        match self.key_ref(slot).desensitized_perms() {
            Some(perms) => self.key_ref_mut(slot).set_perms(perms),
            None => self.set_void(slot),
        }
    }

    /// Replace the contents of `dst` with those of the node named by the
    /// key in `src`
    ///
    /// Keys copied from a weak source are desensitized.
    pub fn node_clone(&mut self, dst: ObjRef, src: SlotId) -> Step<Result<(), RequestError>> {
        self.prepare_key(src)?;
        let src_key = self.key_ref(src);
        let kind = src_key.kind();
        let weak = src_key.perms().contains(KeyPerms::WEAK);
        let Some(from) = src_key.object_ref().filter(|_| kind.is_node_type()) else {
            return Ok(Err(RequestError::WrongKeyType {
                expected: KeyType::Node,
                found: kind,
            }));
        };

        self.header_mut(dst).make_dirty();
        self.clear_all_hazards(dst);
        for slot in 0..NODE_SLOTS {
            if self.key_ref(SlotId::node(from, slot)).is_rd_hazard() {
                self.clear_hazard(from, slot);
            }
        }
        if from != dst {
            for slot in 0..NODE_SLOTS {
                let d = SlotId::node(dst, slot);
                self.key_set(d, SlotId::node(from, slot));
                if weak {
                    self.desensitize(d);
                }
            }
            let data = self.node_data(from);
            self.set_node_data(dst, data);
        }
        Ok(Ok(()))
    }

    /// Void every slot of `node`
    pub(crate) fn node_clear(&mut self, node: ObjRef) {
        self.header_mut(node).make_dirty();
        for slot in 0..NODE_SLOTS {
            self.set_void(SlotId::node(node, slot));
        }
        self.set_node_data(node, 0);
    }

    pub fn node_data(&self, node: ObjRef) -> u16 {
        self.header(node).node().map_or(0, |n| n.node_data)
    }

    pub(crate) fn set_node_data(&mut self, node: ObjRef, data: u16) {
        let header = self.header_mut(node);
        header.make_dirty();
        if let Some(n) = header.node_mut() {
            n.node_data = data;
        }
    }

    /// Unprepare every key held in `node`'s own slots
    pub(crate) fn node_unprepare_slots(&mut self, node: ObjRef) {
        for slot in 0..NODE_SLOTS {
            let sid = SlotId::node(node, slot);
            if self.key_ref(sid).is_hazarded() {
                self.clear_hazard(node, slot);
            }
            self.unprepare_key(sid);
        }
    }

    /// Unprepare all keys to `node` and release its role
    ///
    /// Also used for pages, which have no role to release.
    pub(crate) fn node_deprepare(&mut self, node: ObjRef) {
        self.unprepare_all(RingOwner::Object(node));
        self.node_unprepare(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Key, Oid};
    use crate::testing::{test_kernel, MemStore};

    #[test]
    fn test_set_slot_and_weak_get() {
        let mut store = MemStore::new();
        store.add_node(Oid(1), 0);
        store.add_page(Oid(2), 0);
        let mut k = test_kernel(store);
        let node = k.get_object(Oid(1), crate::platform::ObjectKind::Node).unwrap().unwrap();

        k.write_key(SlotId::Invocation(0), Key::page(Oid(2), 0));
        k.node_set_slot(node, 4, SlotId::Invocation(0)).unwrap();
        assert_eq!(
            k.node_set_slot(node, NODE_SLOTS, SlotId::Invocation(0)),
            Err(RequestError::SlotOutOfRange { slot: NODE_SLOTS })
        );

        k.node_get_slot(node, 4, SlotId::Invocation(1), true).unwrap();
        let got = k.key(SlotId::Invocation(1)).unwrap();
        assert_eq!(got.kind(), KeyType::Page);
        assert!(got.perms().contains(KeyPerms::READ_ONLY));
        assert!(k.object(node).unwrap().is_dirty());
    }

    #[test]
    fn test_weak_get_voids_gate_keys() {
        let mut store = MemStore::new();
        store.add_node(Oid(1), 0);
        let mut k = test_kernel(store);
        let node = k.get_object(Oid(1), crate::platform::ObjectKind::Node).unwrap().unwrap();
        k.write_key(SlotId::node(node, 0), Key::start(Oid(77), 0));
        k.node_get_slot(node, 0, SlotId::Invocation(0), true).unwrap();
        assert!(k.key(SlotId::Invocation(0)).unwrap().is_void());
    }

    #[test]
    fn test_prep_as_segment_rejects_other_roles() {
        let mut store = MemStore::new();
        store.add_node(Oid(1), 0);
        let mut k = test_kernel(store);
        let node = k.get_object(Oid(1), crate::platform::ObjectKind::Node).unwrap().unwrap();
        assert!(k.prep_as_segment(node));
        assert_eq!(k.object(node).unwrap().ob_type(), ObType::Segment);
        k.node_unprepare(node);
        assert_eq!(k.object(node).unwrap().ob_type(), ObType::Unprepared);
        k.header_mut(node).ob_type = ObType::KeyRegs;
        assert!(!k.prep_as_segment(node));
    }
}
