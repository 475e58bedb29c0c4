//! Segment walk
//!
//! Translates an offset through a tree of GPTs, one level per step, until
//! the current object is a page or a GPT whose slots are narrower than the
//! caller's stopping width. Along the way the walk accumulates permission
//! restrictions, remembers the nearest callable keeper and background GPT,
//! and records a dependency for every slot it reads.
//!
//! ## Design
//!
//! A walk is restartable: [`SegWalk`] lives only for one attempt, and any
//! step that must block (an object fetch) returns `Err(Restart)` with no
//! partial effects besides preparation and dependencies, both of which are
//! idempotent.
//!
//! A write through a read-only path does not stop the walk. The violation
//! is latched and the walk keeps descending, without recording
//! dependencies, so that a keeper below the narrowing point can still be
//! found; the walk then reports `AccessViolation` whatever happens later.

use crate::config::{GPT_BACKGROUND_SLOT, GPT_KEEPER_SLOT, GPT_SLOTS, PAGE_L2V};
use crate::error::{FaultCode, Step};
use crate::kernel::Kernel;
use crate::memory::PteLoc;
use crate::objects::{KeyPerms, KeyType, ObType, ObjRef, SlotId, WindowTarget};
use crate::platform::Platform;

/// Keeper that may be asked to repair a failed walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keeper {
    /// The walk started below the root; ancestors were not examined
    Unknown,
    /// No callable keeper on the path
    None,
    /// Keeper of `node`; `offset` is the fault offset relative to it
    Gpt { node: ObjRef, offset: u64 },
}

/// Why a walk failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFailure {
    SlotOutOfRange,
    VoidKey,
    GuardMismatch,
    WrongKeyType,
    MisalignedWindow,
    BadWindowTarget,
    NoBackground,
    OffsetOverflow,
    PastPageEnd,
    DepthExceeded,
    ReadOnly,
}

/// State of one walk attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegWalk {
    /// Offset remaining below `mem_obj`
    pub offset: u64,
    /// Restrictions accumulated so far
    pub restrictions: KeyPerms,
    /// Current GPT or page
    pub mem_obj: Option<ObjRef>,
    /// Steps taken, including window redirections
    pub traverse_count: u32,
    pub keeper: Keeper,
    /// Nearest background-declaring GPT
    pub background: Option<ObjRef>,
    pub fault: Option<FaultCode>,
    pub need_write: bool,
    /// A read-only restriction met a write request
    pub violation: bool,
    failure: Option<(u32, WalkFailure)>,
}

impl SegWalk {
    pub fn new(offset: u64, need_write: bool) -> Self {
        Self {
            offset,
            restrictions: KeyPerms::empty(),
            mem_obj: None,
            traverse_count: 0,
            keeper: Keeper::None,
            background: None,
            fault: None,
            need_write,
            violation: false,
            failure: None,
        }
    }

    /// First failure seen and the step it happened at
    pub fn failure(&self) -> Option<(u32, WalkFailure)> {
        self.failure
    }

    pub(crate) fn note_restrictions(&mut self, perms: KeyPerms) {
        self.restrictions |= perms;
        if self.need_write && self.restrictions.contains(KeyPerms::READ_ONLY) && !self.violation {
            self.violation = true;
            if self.failure.is_none() {
                self.failure = Some((self.traverse_count, WalkFailure::ReadOnly));
            }
        }
    }
}

fn low_mask(l2: u32) -> u64 {
    if l2 >= 64 {
        u64::MAX
    } else {
        (1u64 << l2) - 1
    }
}

impl<P: Platform> Kernel<P> {
    fn walk_fault(&mut self, wi: &mut SegWalk, code: FaultCode, why: WalkFailure) -> Result<(), FaultCode> {
        let code = if wi.violation {
            FaultCode::AccessViolation
        } else {
            code
        };
        if wi.failure.is_none() {
            wi.failure = Some((wi.traverse_count, why));
        }
        wi.fault = Some(code);
        segwalk_trace!("walk fault {:?} ({:?}) at step {}", code, why, wi.traverse_count);
        Err(code)
    }

    /// Start a walk at the key in `root`
    ///
    /// Records a dependency of `dest` on the root slot.
    pub fn segwalk_init(
        &mut self,
        wi: &mut SegWalk,
        root: SlotId,
        offset: u64,
        need_write: bool,
        dest: Option<PteLoc>,
    ) -> Step<Result<(), FaultCode>> {
        *wi = SegWalk::new(offset, need_write);
        if let Err(code) = self.process_key(wi, root)? {
            return Ok(Err(code));
        }
        if !wi.violation {
            self.depend_add_key(root, dest);
        }
        Ok(Ok(()))
    }

    /// Enter the object named by the key in `slot`
    fn process_key(&mut self, wi: &mut SegWalk, slot: SlotId) -> Step<Result<(), FaultCode>> {
        self.prepare_key(slot)?;
        let key = self.key_ref(slot);
        let (kind, perms, guard, obj) = (key.kind(), key.perms(), key.guard(), key.object_ref());

        let obj = match (kind, obj) {
            (KeyType::Gpt, Some(gpt)) => {
                if !self.prep_as_segment(gpt) {
                    return Ok(self.walk_fault(wi, FaultCode::MalformedSpace, WalkFailure::WrongKeyType));
                }
                gpt
            }
            (KeyType::Page, Some(page)) => page,
            (KeyType::Void, _) => {
                return Ok(self.walk_fault(wi, FaultCode::InvalidAddress, WalkFailure::VoidKey))
            }
            _ => {
                return Ok(self.walk_fault(wi, FaultCode::MalformedSpace, WalkFailure::WrongKeyType))
            }
        };

        let Some(offset) = guard.check(wi.offset) else {
            return Ok(self.walk_fault(wi, FaultCode::InvalidAddress, WalkFailure::GuardMismatch));
        };
        wi.offset = offset;
        wi.mem_obj = Some(obj);
        self.pin(obj);
        wi.note_restrictions(perms);
        segwalk_trace!("enter {:?} {:?} offset {:#x}", kind, obj, offset);
        Ok(Ok(()))
    }

    /// Descend until the current object is a page or a GPT with
    /// `l2v < stop_l2v`
    ///
    /// Every slot read is recorded as a dependency of `dest`.
    pub fn walk_seg(&mut self, wi: &mut SegWalk, stop_l2v: u32, dest: Option<PteLoc>) -> Step<Result<(), FaultCode>> {
        self.stats.n_walk_seg += 1;
        let max_depth = self.config.max_seg_depth;

        loop {
            let Some(obj) = wi.mem_obj else {
                fatal!("walk_seg without a starting object");
            };
            if self.header(obj).ob_type != ObType::Segment {
                break;
            }
            let fields = self.gpt_fields(obj);
            let l2v = fields.l2v();
            if l2v < stop_l2v {
                break;
            }
            self.stats.n_walk_loop += 1;
            wi.traverse_count += 1;
            if wi.traverse_count >= max_depth {
                return Ok(self.walk_fault(wi, FaultCode::TraverseLimit, WalkFailure::DepthExceeded));
            }

            let mut max_slot = GPT_SLOTS - 1;
            if fields.has_keeper() {
                max_slot = GPT_KEEPER_SLOT - 1;
                if wi.keeper != Keeper::Unknown && !wi.restrictions.contains(KeyPerms::NO_CALL) {
                    wi.keeper = Keeper::Gpt {
                        node: obj,
                        offset: wi.offset,
                    };
                }
            }
            if fields.has_background() {
                wi.background = Some(obj);
                max_slot = GPT_BACKGROUND_SLOT - 1;
            }

            let ndx = wi.offset.checked_shr(l2v).unwrap_or(0);
            if ndx > max_slot as u64 {
                return Ok(self.walk_fault(wi, FaultCode::InvalidAddress, WalkFailure::SlotOutOfRange));
            }
            wi.offset &= low_mask(l2v);

            // Follow window keys to the slot that really holds the subtree
            let mut node = obj;
            let mut slot = ndx as usize;
            let mut node_l2v = l2v;
            loop {
                let sid = SlotId::node(node, slot);
                let Some(window) = self.key_ref(sid).as_window() else {
                    break;
                };
                self.stats.n_window += 1;
                wi.traverse_count += 1;
                if wi.traverse_count >= max_depth {
                    return Ok(self.walk_fault(wi, FaultCode::TraverseLimit, WalkFailure::DepthExceeded));
                }
                if window.offset & low_mask(node_l2v) != 0 {
                    return Ok(self.walk_fault(wi, FaultCode::MalformedSpace, WalkFailure::MisalignedWindow));
                }
                let Some(offset) = wi.offset.checked_add(window.offset) else {
                    return Ok(self.walk_fault(wi, FaultCode::MalformedSpace, WalkFailure::OffsetOverflow));
                };
                wi.offset = offset;
                wi.note_restrictions(window.restrictions);
                if !wi.violation {
                    self.prepare_key(sid)?;
                    self.depend_add_key(sid, dest);
                }
                match window.target() {
                    Some(WindowTarget::Local(s)) => slot = s,
                    Some(WindowTarget::Background) => {
                        let Some(bg) = wi.background else {
                            return Ok(self.walk_fault(wi, FaultCode::MalformedSpace, WalkFailure::NoBackground));
                        };
                        node = bg;
                        slot = GPT_BACKGROUND_SLOT;
                        node_l2v = self.gpt_fields(bg).l2v();
                    }
                    None => {
                        return Ok(self.walk_fault(wi, FaultCode::MalformedSpace, WalkFailure::BadWindowTarget))
                    }
                }
                segwalk_trace!("window -> {:?} slot {} offset {:#x}", node, slot, wi.offset);
            }

            let sid = SlotId::node(node, slot);
            if let Err(code) = self.process_key(wi, sid)? {
                return Ok(Err(code));
            }
            if !wi.violation {
                self.depend_add_key(sid, dest);
            }
        }

        if let Some(obj) = wi.mem_obj {
            if self.header(obj).ob_type == ObType::DataPage && wi.offset >> PAGE_L2V != 0 {
                return Ok(self.walk_fault(wi, FaultCode::InvalidAddress, WalkFailure::PastPageEnd));
            }
        }
        if wi.violation {
            return Ok(self.walk_fault(wi, FaultCode::AccessViolation, WalkFailure::ReadOnly));
        }
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::Key;
    use crate::testing::SpaceBuilder;

    #[test]
    fn test_walk_to_page() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let leaf = b.gpt(12);
        let root = b.gpt(16);
        b.set(leaf, 3, Key::page(page, 0));
        b.set(root, 2, Key::gpt(leaf, 0));
        let mut k = b.kernel();
        k.write_key(SlotId::Invocation(0), Key::gpt(root, 0));

        let mut wi = SegWalk::new(0, false);
        let va = (2 << 16) | (3 << 12) | 0x10;
        k.segwalk_init(&mut wi, SlotId::Invocation(0), va, false, None).unwrap().unwrap();
        k.walk_seg(&mut wi, PAGE_L2V, None).unwrap().unwrap();
        assert_eq!(wi.mem_obj, k.lookup(page));
        assert_eq!(wi.offset, 0x10);
        assert_eq!(wi.traverse_count, 2);
        assert_eq!(wi.keeper, Keeper::None);
    }

    #[test]
    fn test_walk_stops_at_wide_gpt() {
        let mut b = SpaceBuilder::new();
        let root = b.gpt(12);
        let mut k = b.kernel();
        k.write_key(SlotId::Invocation(0), Key::gpt(root, 0));
        let mut wi = SegWalk::new(0, false);
        k.segwalk_init(&mut wi, SlotId::Invocation(0), 0x5000, false, None).unwrap().unwrap();
        k.walk_seg(&mut wi, 22, None).unwrap().unwrap();
        assert_eq!(wi.mem_obj, k.lookup(root));
        assert_eq!(wi.offset, 0x5000);
        assert_eq!(wi.traverse_count, 0);
    }

    #[test]
    fn test_void_slot_is_invalid_address() {
        let mut b = SpaceBuilder::new();
        let root = b.gpt(12);
        let mut k = b.kernel();
        k.write_key(SlotId::Invocation(0), Key::gpt(root, 0));
        let mut wi = SegWalk::new(0, false);
        k.segwalk_init(&mut wi, SlotId::Invocation(0), 0x1000, false, None).unwrap().unwrap();
        assert_eq!(k.walk_seg(&mut wi, PAGE_L2V, None), Ok(Err(FaultCode::InvalidAddress)));
        assert_eq!(wi.failure(), Some((1, WalkFailure::VoidKey)));
    }

    #[test]
    fn test_number_key_in_tree_is_malformed() {
        let mut b = SpaceBuilder::new();
        let root = b.gpt(12);
        b.set(root, 0, Key::misc(KeyType::Discrim, [0; 3]));
        let mut k = b.kernel();
        k.write_key(SlotId::Invocation(0), Key::gpt(root, 0));
        let mut wi = SegWalk::new(0, false);
        k.segwalk_init(&mut wi, SlotId::Invocation(0), 0, false, None).unwrap().unwrap();
        assert_eq!(k.walk_seg(&mut wi, PAGE_L2V, None), Ok(Err(FaultCode::MalformedSpace)));
    }

    #[test]
    fn test_keeper_slot_is_out_of_range() {
        let mut b = SpaceBuilder::new();
        let root = b.gpt(12);
        let keeper = b.keeper_process();
        b.set_keeper(root, keeper, false);
        let mut k = b.kernel();
        k.write_key(SlotId::Invocation(0), Key::gpt(root, 0));
        let mut wi = SegWalk::new(0, false);
        k.segwalk_init(&mut wi, SlotId::Invocation(0), 15 << 12, false, None).unwrap().unwrap();
        assert_eq!(k.walk_seg(&mut wi, PAGE_L2V, None), Ok(Err(FaultCode::InvalidAddress)));
        let root_ref = k.lookup(root).unwrap();
        assert_eq!(
            wi.keeper,
            Keeper::Gpt {
                node: root_ref,
                offset: 15 << 12
            }
        );
        assert_eq!(wi.failure(), Some((1, WalkFailure::SlotOutOfRange)));
    }

    #[test]
    fn test_mapped_window_key_is_prepared() {
        use crate::fault::{FaultTrap, TrapOutcome};

        let mut b = SpaceBuilder::new();
        let page = b.page();
        let root = b.gpt(16);
        b.set(root, 0, Key::window(WindowTarget::Local(1), 0, KeyPerms::empty()));
        b.set(root, 1, Key::page(page, 0));
        let p = b.process(Key::gpt(root, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x10)), TrapOutcome::Resumed);
        let root_ref = k.lookup(root).unwrap();
        for slot in [0, 1] {
            let key = k.key(SlotId::node(root_ref, slot)).unwrap();
            assert!(key.is_wr_hazard(), "slot {}", slot);
            assert!(key.is_prepared(), "slot {}", slot);
        }
    }

    #[test]
    fn test_page_guard_limits_offset() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let mut k = b.kernel();
        k.write_key(SlotId::Invocation(0), Key::page(page, 0));
        let mut wi = SegWalk::new(0, false);
        assert_eq!(
            k.segwalk_init(&mut wi, SlotId::Invocation(0), 0x1000, false, None),
            Ok(Err(FaultCode::InvalidAddress))
        );
    }
}
