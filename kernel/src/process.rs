//! Processes
//!
//! A process is the loaded form of a process root node. Loading caches
//! some root slots and the key registers; the cached slots are hazarded so
//! that changing them first flushes the cache.
//!
//! ## Process lifecycle
//!
//! ```text
//! Running --fault, segment keeper--> AwaitingKeeper --reply--> Running
//!    |                                     |
//!    +--fault, no keeper--> Faulted <--declined
//! ```

use bitflags::bitflags;

use crate::config::{KEY_REGS, NODE_SLOTS, PROC_GEN_KEYS, PROC_KEEPER, PROC_SCHED};
use crate::error::{FaultCode, Step};
use crate::kernel::Kernel;
use crate::memory::MapRoot;
use crate::objects::arena::{Arena, RawHandle};
use crate::objects::{Key, KeyFlags, KeyRing, KeyType, ObType, ObjRef, Oid, RingOwner, SlotId};
use crate::platform::{ObjectKind, Platform, StallQueue};

/// Weak reference to a loaded process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessRef(RawHandle);

impl ProcessRef {
    pub(crate) fn raw(&self) -> RawHandle {
        self.0
    }
}

/// Scheduling state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Blocked until a segment keeper replies
    AwaitingKeeper,
    /// Stopped with a fault for its process keeper
    Faulted,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcFlags: u8 {
        /// The recorded fault has not been delivered
        const PENDING_FAULT = 0x01;
    }
}

/// Root slots cached while a process is loaded
const CACHED_ROOT_SLOTS: [usize; 3] = [PROC_SCHED, PROC_KEEPER, PROC_GEN_KEYS];

/// Loaded process
pub struct Process {
    pub(crate) proc_root: ObjRef,
    pub(crate) key_regs_node: Option<ObjRef>,
    pub(crate) key_regs: [Key; KEY_REGS],
    pub(crate) regs_loaded: bool,
    pub(crate) fault_code: Option<FaultCode>,
    pub(crate) fault_info: u64,
    pub(crate) flags: ProcFlags,
    pub(crate) run_state: RunState,
    pub(crate) map_root: MapRoot,
    /// Gate keys to this process
    pub(crate) key_ring: KeyRing,
    pub(crate) pf_count: u64,
    /// Bitmask of root slots whose contents are cached here
    pub(crate) cached_root_slots: u32,
}

impl Process {
    fn new(proc_root: ObjRef) -> Self {
        Self {
            proc_root,
            key_regs_node: None,
            key_regs: core::array::from_fn(|_| Key::void()),
            regs_loaded: false,
            fault_code: None,
            fault_info: 0,
            flags: ProcFlags::empty(),
            run_state: RunState::Running,
            map_root: MapRoot::None,
            key_ring: KeyRing::new(),
            pf_count: 0,
            cached_root_slots: 0,
        }
    }

    pub fn proc_root(&self) -> ObjRef {
        self.proc_root
    }

    pub fn fault_code(&self) -> Option<FaultCode> {
        self.fault_code
    }

    pub fn fault_info(&self) -> u64 {
        self.fault_info
    }

    pub fn has_pending_fault(&self) -> bool {
        self.flags.contains(ProcFlags::PENDING_FAULT)
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_runnable(&self) -> bool {
        self.run_state == RunState::Running && !self.has_pending_fault()
    }

    pub fn map_root(&self) -> MapRoot {
        self.map_root
    }

    pub fn pf_count(&self) -> u64 {
        self.pf_count
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    pub fn key_reg(&self, reg: usize) -> Option<&Key> {
        self.key_regs.get(reg)
    }
}

/// All loaded processes
#[derive(Default)]
pub struct ProcessTable {
    arena: Arena<Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, p: ProcessRef) -> Option<&Process> {
        self.arena.get(p.0)
    }

    pub(crate) fn get_mut(&mut self, p: ProcessRef) -> Option<&mut Process> {
        self.arena.get_mut(p.0)
    }

    fn insert(&mut self, p: Process) -> ProcessRef {
        ProcessRef(self.arena.insert(p))
    }

    fn remove(&mut self, p: ProcessRef) -> Option<Process> {
        self.arena.remove(p.0)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl<P: Platform> Kernel<P> {
    pub(crate) fn proc(&self, p: ProcessRef) -> &Process {
        match self.procs.get(p) {
            Some(process) => process,
            None => fatal!("stale process reference {:?}", p),
        }
    }

    pub(crate) fn proc_mut(&mut self, p: ProcessRef) -> &mut Process {
        match self.procs.get_mut(p) {
            Some(process) => process,
            None => fatal!("stale process reference {:?}", p),
        }
    }

    /// Load the process rooted at node `root_oid`, with its key registers
    pub fn load_process(&mut self, root_oid: Oid) -> Step<Option<ProcessRef>> {
        let Some(root) = self.get_object(root_oid, ObjectKind::Node)? else {
            return Ok(None);
        };
        let Some(p) = self.node_get_process(root)? else {
            return Ok(None);
        };
        self.load_key_regs(p)?;
        Ok(Some(p))
    }

    /// Process rooted at `node`, loading it if necessary
    ///
    /// A node prepared for another role is unprepared first.
    pub(crate) fn node_get_process(&mut self, node: ObjRef) -> Step<Option<ProcessRef>> {
        let header = self.header(node);
        if header.ob_type == ObType::ProcessRoot {
            return Ok(header.context);
        }
        if !header.ob_type.is_node() {
            return Ok(None);
        }

        // Resolve the key register node before changing anything
        let regs_slot = SlotId::node(node, PROC_GEN_KEYS);
        self.prepare_key(regs_slot)?;
        let regs_node = {
            let key = self.key_ref(regs_slot);
            if key.kind() == KeyType::Node {
                key.object_ref().filter(|&r| r != node)
            } else {
                None
            }
        };

        self.node_unprepare(node);
        if let Some(r) = regs_node {
            self.node_unprepare(r);
        }

        let p = self.procs.insert(Process::new(node));
        let header = self.header_mut(node);
        header.ob_type = ObType::ProcessRoot;
        header.context = Some(p);
        header.make_dirty();
        if let Some(r) = regs_node {
            let regs = self.header_mut(r);
            regs.ob_type = ObType::KeyRegs;
            regs.context = Some(p);
            regs.make_dirty();
        }
        self.proc_mut(p).key_regs_node = regs_node;

        // Object keys in the schedule and keeper slots are left unhazarded
        // until prepared; preparing them here could recurse into this load.
        let mut cached = 0u32;
        for slot in CACHED_ROOT_SLOTS {
            let sid = SlotId::node(node, slot);
            if self.prepare_without_object(sid) {
                self.hazard_key(sid, KeyFlags::WR_HAZARD);
                cached |= 1 << slot;
            }
        }
        self.proc_mut(p).cached_root_slots = cached;
        log::debug!("process {:?} loaded from {:?}", p, self.header(node).oid);
        Ok(Some(p))
    }

    /// Copy the key register node into the process
    ///
    /// The node's slots are hazarded while the copies are live.
    pub(crate) fn load_key_regs(&mut self, p: ProcessRef) -> Step<()> {
        let process = self.proc(p);
        if process.regs_loaded {
            return Ok(());
        }
        let Some(regs) = process.key_regs_node else {
            return Ok(());
        };
        for reg in 0..NODE_SLOTS.min(KEY_REGS) {
            self.prepare_key(SlotId::node(regs, reg))?;
        }
        for reg in 0..NODE_SLOTS.min(KEY_REGS) {
            let from = SlotId::node(regs, reg);
            let to = SlotId::Register {
                process: p,
                reg: reg as u8,
            };
            self.key_set(to, from);
            self.hazard_key(from, KeyFlags::HAZARD);
        }
        self.proc_mut(p).regs_loaded = true;
        Ok(())
    }

    /// Write key registers back to their node and drop the copies
    pub(crate) fn flush_key_regs(&mut self, p: ProcessRef) {
        let process = self.proc(p);
        if !process.regs_loaded {
            return;
        }
        let Some(regs) = process.key_regs_node else {
            return;
        };
        for reg in 0..NODE_SLOTS.min(KEY_REGS) {
            let to = SlotId::node(regs, reg);
            let from = SlotId::Register {
                process: p,
                reg: reg as u8,
            };
            self.key_ref_mut(to).remove_flags(KeyFlags::HAZARD);
            self.key_set(to, from);
            self.set_void(from);
        }
        self.header_mut(regs).make_dirty();
        self.proc_mut(p).regs_loaded = false;
    }

    /// Forget the cached copy of root slot `slot`
    pub(crate) fn flush_process_slot(&mut self, p: ProcessRef, slot: usize) {
        let root = self.proc(p).proc_root;
        self.proc_mut(p).cached_root_slots &= !(1 << slot);
        self.key_ref_mut(SlotId::node(root, slot))
            .remove_flags(KeyFlags::HAZARD);
    }

    /// Tear down a loaded process
    ///
    /// Gate keys to it are unprepared, its translation root is dropped and
    /// its nodes return to the unprepared state.
    pub(crate) fn unload_process(&mut self, p: ProcessRef) {
        let Some(process) = self.procs.get(p) else {
            return;
        };
        let root = process.proc_root;
        let regs = process.key_regs_node;
        log::debug!("unloading process {:?}", p);

        self.flush_key_regs(p);
        for slot in 0..NODE_SLOTS {
            if self.proc(p).cached_root_slots & (1 << slot) != 0 {
                self.flush_process_slot(p, slot);
            }
        }
        let addr = SlotId::node(root, crate::config::PROC_ADDR_SPACE);
        if self.key_ref(addr).is_wr_hazard() {
            self.depend_invalidate_slot(addr);
            self.key_ref_mut(addr).remove_flags(KeyFlags::WR_HAZARD);
        }
        self.unprepare_all(RingOwner::Process(p));
        self.procs.remove(p);

        let header = self.header_mut(root);
        header.ob_type = ObType::Unprepared;
        header.context = None;
        if let Some(r) = regs {
            if let Some(h) = self.objects.get_mut(r) {
                h.ob_type = ObType::Unprepared;
                h.context = None;
            }
        }
    }

    /// Record a fault for the process keeper and stop the process
    pub fn set_fault(&mut self, p: ProcessRef, code: FaultCode, info: u64) {
        let process = self.proc_mut(p);
        process.fault_code = Some(code);
        process.fault_info = info;
        process.flags |= ProcFlags::PENDING_FAULT;
        process.run_state = RunState::Faulted;
        self.stats.n_process_faults += 1;
        log::info!("process {:?} faulted: {} at {:#x}", p, code, info);
    }

    /// A segment keeper resolved the fault; the process retries
    pub fn keeper_reply(&mut self, p: ProcessRef) {
        let process = self.proc_mut(p);
        process.fault_code = None;
        process.fault_info = 0;
        process.flags -= ProcFlags::PENDING_FAULT;
        process.run_state = RunState::Running;
        self.platform.wake(StallQueue::Process(p));
    }

    /// A segment keeper declined the fault; it goes to the process keeper
    pub fn keeper_declined(&mut self, p: ProcessRef) {
        let process = self.proc(p);
        let code = process.fault_code.unwrap_or(FaultCode::InvalidAddress);
        let info = process.fault_info;
        self.set_fault(p, code, info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PROC_ADDR_SPACE;
    use crate::testing::{test_kernel, MemStore};

    fn process_store() -> MemStore {
        let mut store = MemStore::new();
        store.add_node(Oid(100), 0);
        store.add_node(Oid(101), 0);
        store.add_page(Oid(5), 0);
        store.set_slot(Oid(100), PROC_GEN_KEYS, Key::node(Oid(101), 0));
        store.set_slot(Oid(101), 3, Key::page(Oid(5), 0));
        store
    }

    #[test]
    fn test_load_hazards_key_regs() {
        let mut k = test_kernel(process_store());
        let p = k.load_process(Oid(100)).unwrap().unwrap();
        let regs = k.lookup(Oid(101)).unwrap();
        assert_eq!(k.object(regs).unwrap().ob_type(), ObType::KeyRegs);
        assert!(k.key(SlotId::node(regs, 3)).unwrap().is_rd_hazard());
        assert_eq!(k.process(p).unwrap().key_reg(3).unwrap().kind(), KeyType::Page);
    }

    #[test]
    fn test_writing_key_regs_node_flushes() {
        let mut k = test_kernel(process_store());
        let p = k.load_process(Oid(100)).unwrap().unwrap();
        let regs = k.lookup(Oid(101)).unwrap();

        k.write_key(SlotId::node(regs, 7), Key::number([1, 2, 3]));
        assert!(!k.process(p).unwrap().regs_loaded);
        assert!(!k.key(SlotId::node(regs, 3)).unwrap().is_hazarded());
        assert_eq!(
            k.key(SlotId::node(regs, 3)).unwrap().kind(),
            KeyType::Page
        );
    }

    #[test]
    fn test_gen_keys_change_unloads() {
        let mut k = test_kernel(process_store());
        let p = k.load_process(Oid(100)).unwrap().unwrap();
        let root = k.lookup(Oid(100)).unwrap();
        assert!(k.key(SlotId::node(root, PROC_GEN_KEYS)).unwrap().is_hazarded());
        assert!(!k.key(SlotId::node(root, PROC_ADDR_SPACE)).unwrap().is_hazarded());

        k.set_void(SlotId::node(root, PROC_GEN_KEYS));
        assert!(k.process(p).is_none());
        assert_eq!(k.object(root).unwrap().ob_type(), ObType::Unprepared);
    }

    #[test]
    fn test_load_hazards_only_prepared_keys() {
        let mut store = process_store();
        store.add_node(Oid(102), 0);
        store.set_slot(Oid(100), PROC_SCHED, Key::number([7, 0, 0]));
        store.set_slot(Oid(100), PROC_KEEPER, Key::start(Oid(102), 0));
        let mut k = test_kernel(store);
        let p = k.load_process(Oid(100)).unwrap().unwrap();
        let root = k.lookup(Oid(100)).unwrap();
        let regs = k.lookup(Oid(101)).unwrap();

        for node in [root, regs] {
            for slot in 0..NODE_SLOTS {
                let key = k.key(SlotId::node(node, slot)).unwrap();
                assert!(!key.is_hazarded() || key.is_prepared(), "slot {} of {:?}", slot, node);
            }
        }
        assert!(k.key(SlotId::node(root, PROC_SCHED)).unwrap().is_wr_hazard());
        assert!(!k.key(SlotId::node(root, PROC_KEEPER)).unwrap().is_hazarded());
        assert!(k.key(SlotId::node(regs, 0)).unwrap().is_rd_hazard());
        assert_eq!(k.process(p).unwrap().key_reg(3).unwrap().kind(), KeyType::Page);

        // Writing the unhazarded keeper slot leaves the process loaded
        k.write_key(SlotId::node(root, PROC_KEEPER), Key::number([1, 0, 0]));
        assert!(k.process(p).is_some());
    }

    #[test]
    fn test_fault_and_reply() {
        let mut k = test_kernel(process_store());
        let p = k.load_process(Oid(100)).unwrap().unwrap();
        k.set_fault(p, FaultCode::AccessViolation, 0x4000);
        let process = k.process(p).unwrap();
        assert!(!process.is_runnable());
        assert_eq!(process.fault_code(), Some(FaultCode::AccessViolation));
        k.keeper_reply(p);
        assert!(k.process(p).unwrap().is_runnable());
    }
}
