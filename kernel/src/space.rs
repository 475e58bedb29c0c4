//! Address-space maintenance
//!
//! Helpers used by keepers and invocation handlers: telling a space that is
//! too small from one that is merely unpopulated, growing a space upward,
//! populating a page lazily and probing an offset without building any
//! hardware translation.

use crate::config::{GPT_LG_SLOTS, GPT_SLOTS, MAX_L2V, PAGE_L2V};
use crate::error::{FaultCode, RequestError, Step};
use crate::kernel::Kernel;
use crate::objects::gpt::GptFields;
use crate::objects::{Guard, KeyPerms, KeyType, ObType, ObjRef, Oid, SlotId};
use crate::platform::{ObjectKind, Platform};
use crate::segwalk::{SegWalk, WalkFailure};

/// Why a walk from the root found no mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// The address lies beyond what the root can reach; grow upward
    SpaceTooSmall,
    /// The address is in range but nothing is mapped there yet
    Unpopulated,
}

/// Result of a successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub page: ObjRef,
    /// Offset within the page
    pub offset: u64,
    /// Restrictions on the path to the page
    pub restrictions: KeyPerms,
}

/// Classify a walk from the root that failed with `InvalidAddress`
///
/// `None` for any other outcome.
pub fn classify_invalid_address(wi: &SegWalk) -> Option<AddressClass> {
    if wi.fault != Some(FaultCode::InvalidAddress) {
        return None;
    }
    Some(match wi.failure() {
        Some((0, WalkFailure::GuardMismatch)) | Some((1, WalkFailure::SlotOutOfRange)) => {
            AddressClass::SpaceTooSmall
        }
        _ => AddressClass::Unpopulated,
    })
}

impl<P: Platform> Kernel<P> {
    /// Put a taller GPT `new_gpt` above the space rooted at `root`
    ///
    /// The old root key moves to slot 0 of the new GPT, which becomes the
    /// root. Returns the new root's l2v.
    pub fn grow_space(&mut self, root: SlotId, new_gpt: Oid) -> Step<Result<u32, RequestError>> {
        self.prepare_key(root)?;
        let key = self.key_ref(root);
        let (kind, perms, guard, old) = (key.kind(), key.perms(), key.guard(), key.object_ref());

        let reach = match (kind, old) {
            (KeyType::Gpt, Some(g)) => self.gpt_fields(g).l2v() + GPT_LG_SLOTS,
            (KeyType::Page, Some(_)) => PAGE_L2V,
            _ => {
                return Ok(Err(RequestError::WrongKeyType {
                    expected: KeyType::Gpt,
                    found: kind,
                }))
            }
        };
        if guard.offset() != 0 {
            return Ok(Err(RequestError::UnrepresentableGuard {
                offset: guard.offset(),
            }));
        }
        let l2v = reach.min(guard.l2g());
        if !(PAGE_L2V..=MAX_L2V).contains(&l2v) {
            return Ok(Err(RequestError::InvalidL2v { l2v }));
        }

        let node = match self.get_object(new_gpt, ObjectKind::Node)? {
            Some(n) if Some(n) != old && self.prep_as_segment(n) => n,
            _ => {
                return Ok(Err(RequestError::WrongKeyType {
                    expected: KeyType::Gpt,
                    found: KeyType::Void,
                }))
            }
        };

        self.node_clear(node);
        if let Err(e) = self.node_set_slot(node, 0, root) {
            return Ok(Err(e));
        }
        self.set_gpt_fields(node, GptFields::new(l2v));
        self.key_set_to_object(root, KeyType::Gpt, node, perms, Guard::NONE);
        log::debug!("space grown: new root {:?} with l2v {}", new_gpt, l2v);
        Ok(Ok(l2v))
    }

    /// Install a key to page `page_oid` in empty slot `slot` of `gpt`
    pub fn populate_page(&mut self, gpt: ObjRef, slot: usize, page_oid: Oid) -> Step<Result<(), RequestError>> {
        if slot >= GPT_SLOTS {
            return Ok(Err(RequestError::SlotOutOfRange { slot }));
        }
        let sid = SlotId::node(gpt, slot);
        if !self.key_ref(sid).is_void() {
            return Ok(Err(RequestError::SlotOccupied { slot }));
        }
        let Some(page) = self.get_object(page_oid, ObjectKind::Page)? else {
            return Ok(Err(RequestError::WrongKeyType {
                expected: KeyType::Page,
                found: KeyType::Void,
            }));
        };
        self.header_mut(gpt).make_dirty();
        self.key_set_to_object(sid, KeyType::Page, page, KeyPerms::empty(), Guard::PAGE);
        log::trace!("populated slot {} of {:?} with {:?}", slot, gpt, page_oid);
        Ok(Ok(()))
    }

    /// Translate `offset` through the space named by `root`
    ///
    /// Builds no hardware entries and records no dependencies.
    pub fn probe(&mut self, root: SlotId, offset: u64, write: bool) -> Step<Result<Probe, FaultCode>> {
        let mut wi = SegWalk::new(offset, write);
        if let Err(code) = self.segwalk_init(&mut wi, root, offset, write, None)? {
            return Ok(Err(code));
        }
        if let Err(code) = self.walk_seg(&mut wi, PAGE_L2V, None)? {
            return Ok(Err(code));
        }
        match wi.mem_obj {
            Some(page) if self.header(page).ob_type == ObType::DataPage => Ok(Ok(Probe {
                page,
                offset: wi.offset,
                restrictions: wi.restrictions,
            })),
            _ => Ok(Err(FaultCode::MalformedSpace)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::Key;
    use crate::testing::SpaceBuilder;

    #[test]
    fn test_classify_too_small_and_unpopulated() {
        let mut b = SpaceBuilder::new();
        let root = b.gpt(12);
        let mut k = b.kernel();
        let slot = SlotId::Invocation(0);
        k.write_key(slot, Key::gpt(root, 0));

        let mut wi = SegWalk::new(0, false);
        k.segwalk_init(&mut wi, slot, 1 << 20, false, None).unwrap().unwrap();
        let _ = k.walk_seg(&mut wi, PAGE_L2V, None).unwrap();
        assert_eq!(classify_invalid_address(&wi), Some(AddressClass::SpaceTooSmall));

        k.segwalk_init(&mut wi, slot, 0x3000, false, None).unwrap().unwrap();
        let _ = k.walk_seg(&mut wi, PAGE_L2V, None).unwrap();
        assert_eq!(classify_invalid_address(&wi), Some(AddressClass::Unpopulated));
    }

    #[test]
    fn test_grow_then_populate_then_probe() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let root = b.gpt(12);
        let spare = b.gpt(0);
        b.set(root, 0, Key::page(page, 0));
        let extra = b.page();
        let mut k = b.kernel();
        let slot = SlotId::Invocation(0);
        k.write_key(slot, Key::gpt(root, 0));

        assert_eq!(k.grow_space(slot, spare), Ok(Ok(16)));
        let new_root = k.key(slot).unwrap().object_ref().unwrap();
        assert_eq!(k.lookup(spare), Some(new_root));

        // The old space is still at offset 0
        let found = k.probe(slot, 0x10, true).unwrap().unwrap();
        assert_eq!(Some(found.page), k.lookup(page));
        assert_eq!(found.offset, 0x10);

        // Slot 1 of the new root is empty until populated
        assert_eq!(k.probe(slot, 1 << 16, false), Ok(Err(FaultCode::InvalidAddress)));
        assert_eq!(k.populate_page(new_root, 1, extra), Ok(Ok(())));
        assert_eq!(
            k.populate_page(new_root, 1, extra),
            Ok(Err(RequestError::SlotOccupied { slot: 1 }))
        );
        // A page key only covers the first page of its slot
        let found = k.probe(slot, (1 << 16) | 0x20, false).unwrap().unwrap();
        assert_eq!(Some(found.page), k.lookup(extra));
        assert_eq!(k.probe(slot, (1 << 16) | 0x1000, false), Ok(Err(FaultCode::InvalidAddress)));
    }
}
