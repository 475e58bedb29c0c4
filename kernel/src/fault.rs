//! Page-fault handling
//!
//! Builds the hardware translation for one faulting address, top-down:
//! the process's top-level table, then one entry per level until the leaf
//! maps a page. Existing valid entries are reused; a missing or
//! insufficient one is rebuilt by resuming the segment walk from the
//! producer of the table that holds it.
//!
//! ## Design
//!
//! An invalid entry under construction is marked `InProgress` before its
//! walk starts; a valid entry being upgraded keeps its old value. Any
//! dependency that fires during the walk turns it into `Zapped`, and the
//! handler restarts the fault instead of installing a translation built
//! from stale keys. A write through a read-only directory entry is an
//! access violation and leaves the entry alone.

use crate::config::PAGE_L2V;
use crate::error::{FaultCode, Restart, RestartReason, Step};
use crate::kernel::Kernel;
use crate::memory::{MapRoot, Pte, PteLoc, TableRef};
use crate::objects::{KeyPerms, ObType, SlotId};
use crate::platform::Platform;
use crate::process::ProcessRef;
use crate::segwalk::{Keeper, SegWalk};

/// Restarts caused by concurrent invalidation tolerated in one trap
const MAX_ZAP_RETRIES: u32 = 8;

/// Hardware description of a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultTrap {
    /// Faulting virtual address
    pub address: u64,
    /// The access was a write
    pub write: bool,
    /// The access came from user mode
    pub user: bool,
    /// Instruction fetch
    pub prefetch: bool,
}

impl FaultTrap {
    pub fn read(address: u64) -> Self {
        Self {
            address,
            write: false,
            user: true,
            prefetch: false,
        }
    }

    pub fn write(address: u64) -> Self {
        Self {
            write: true,
            ..Self::read(address)
        }
    }
}

/// What the trap handler tells the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The translation is in place; resume the process
    Resumed,
    /// The process must wait; it runs again from the faulting instruction
    Suspended(RestartReason),
}

impl<P: Platform> Kernel<P> {
    /// Trap entry point
    ///
    /// Retries a bounded number of times when a translation was zapped
    /// while being built.
    pub fn handle_page_fault(&mut self, p: ProcessRef, trap: FaultTrap) -> TrapOutcome {
        let mut zapped = 0;
        loop {
            match self.page_fault(p, trap) {
                Ok(()) => return TrapOutcome::Resumed,
                Err(r) if r.reason == RestartReason::TranslationZapped && zapped < MAX_ZAP_RETRIES => {
                    zapped += 1;
                    log::trace!("fault at {:#x} zapped, retry {}", trap.address, zapped);
                }
                Err(r) => return TrapOutcome::Suspended(r.reason),
            }
        }
    }

    /// One attempt at handling a user page fault
    pub fn page_fault(&mut self, p: ProcessRef, trap: FaultTrap) -> Step<()> {
        if !trap.user {
            fatal!("kernel-mode page fault at {:#x}", trap.address);
        }
        self.stats.n_pf_traps += 1;
        if trap.write {
            self.stats.n_pf_access += 1;
        }
        self.begin_transaction();
        self.proc_mut(p).pf_count += 1;
        log::trace!(
            "page fault {:?} at {:#x} write {} prefetch {}",
            p,
            trap.address,
            trap.write,
            trap.prefetch
        );

        if let Err(code) = self.do_page_fault(p, trap.address, trap.write, false)? {
            self.set_fault(p, code, trap.address);
            return Err(Restart::new(RestartReason::ProcessFault));
        }
        Ok(())
    }

    /// Build the translation for `va` in the space of `p`
    ///
    /// With `prompt` set a failed translation is returned to the caller;
    /// otherwise it is escalated to the responsible keeper.
    pub fn do_page_fault(
        &mut self,
        p: ProcessRef,
        va: u64,
        is_write: bool,
        prompt: bool,
    ) -> Step<Result<(), FaultCode>> {
        let geom = self.config.paging;
        let mut wi = SegWalk::new(va, is_write);

        if va >= geom.user_limit {
            wi.fault = Some(FaultCode::InvalidAddress);
            return self.fault_exit(p, &wi, va, prompt);
        }

        // Top-level table
        let mut table = match self.proc(p).map_root {
            MapRoot::Table(t) if self.maps.get(t).is_some() => {
                self.init_from_table(&mut wi, t, va, is_write);
                if wi.violation {
                    wi.fault = Some(FaultCode::AccessViolation);
                    return self.fault_exit(p, &wi, va, prompt);
                }
                t
            }
            _ => {
                let root_slot = SlotId::node(self.proc(p).proc_root, crate::config::PROC_ADDR_SPACE);
                let dest = Some(PteLoc::Root(p));
                self.proc_mut(p).map_root = MapRoot::InProgress;
                if self.segwalk_init(&mut wi, root_slot, va, is_write, dest)?.is_err()
                    || self.walk_seg(&mut wi, geom.top_l2, dest)?.is_err()
                {
                    return self.fault_exit(p, &wi, va, prompt);
                }
                if self.proc(p).map_root != MapRoot::InProgress {
                    return Err(Restart::new(RestartReason::TranslationZapped));
                }
                let t = self.product_for(&wi, 0, geom.top_l2, true)?;
                self.proc_mut(p).map_root = MapRoot::Table(t);
                t
            }
        };

        let levels = geom.levels();
        for level in 0..levels {
            let idx = geom.index(level, va);
            let span = geom.entry_span_l2(level);
            let loc = PteLoc::Entry { table, index: idx };

            if level + 1 < levels {
                if let Some((next, writable)) = self.live_table_entry(table, idx) {
                    // A read-only entry stands for a read-only key above it
                    if is_write && !writable {
                        wi.fault = Some(FaultCode::AccessViolation);
                        return self.fault_exit(p, &wi, va, prompt);
                    }
                    self.init_from_table(&mut wi, next, va, is_write);
                    table = next;
                    continue;
                }
                self.set_pte(table, idx, Pte::InProgress);
                if self.walk_seg(&mut wi, span, Some(loc))?.is_err() {
                    return self.fault_exit(p, &wi, va, prompt);
                }
                if self.pte(table, idx) != Some(Pte::InProgress) {
                    return Err(Restart::new(RestartReason::TranslationZapped));
                }
                let read_only = wi.restrictions.contains(KeyPerms::READ_ONLY);
                let next = self.product_for(&wi, level + 1, span, false)?;
                self.set_pte(
                    table,
                    idx,
                    Pte::Table {
                        table: next,
                        writable: !read_only,
                    },
                );
                // The entry above enforces it from here down
                wi.restrictions -= KeyPerms::READ_ONLY;
                table = next;
                continue;
            }

            // Leaf
            let old = self.pte(table, idx).unwrap_or_default();
            if let Pte::Page { writable, .. } = old {
                if !is_write || writable {
                    return Ok(Ok(()));
                }
            }
            // A valid entry stays usable until its replacement is ready
            let pending = if old.is_valid() { old } else { Pte::InProgress };
            self.set_pte(table, idx, pending);
            if self.walk_seg(&mut wi, PAGE_L2V, Some(loc))?.is_err() {
                return self.fault_exit(p, &wi, va, prompt);
            }
            if self.pte(table, idx) != Some(pending) {
                return Err(Restart::new(RestartReason::TranslationZapped));
            }
            let page = match wi.mem_obj {
                Some(obj) if self.header(obj).ob_type == ObType::DataPage => obj,
                _ => {
                    if old.is_valid() {
                        self.platform.flush_entry(table, idx);
                    }
                    self.set_pte(table, idx, Pte::Invalid);
                    wi.fault = Some(FaultCode::MalformedSpace);
                    return self.fault_exit(p, &wi, va, prompt);
                }
            };
            let Some(frame) = self.header(page).frame() else {
                fatal!("data page {:?} without a frame", page);
            };
            if is_write {
                self.header_mut(page).make_dirty();
            }
            if old.is_valid() {
                self.platform.flush_entry(table, idx);
            }
            self.set_pte(
                table,
                idx,
                Pte::Page {
                    frame,
                    writable: is_write,
                },
            );
            if old.is_valid() {
                self.platform.flush_entry(table, idx);
            }
            log::trace!("mapped {:#x} -> {:?} (write {})", va, frame, is_write);
            return Ok(Ok(()));
        }
        fatal!("paging geometry without a leaf level");
    }

    /// Resume a walk at the producer of `table`
    ///
    /// Ancestors of the producer are not examined again, so the keeper is
    /// unknown.
    pub(crate) fn init_from_table(&mut self, wi: &mut SegWalk, table: TableRef, va: u64, need_write: bool) {
        let Some(m) = self.maps.get(table) else {
            fatal!("walk resumed at a dead table {:?}", table);
        };
        let (producer, index, read_only, background, level) =
            (m.producer, m.index, m.read_only, m.background, m.level);
        let l2 = self.config.paging.table_l2(level);
        let low = if l2 >= 64 { va } else { va & ((1u64 << l2) - 1) };
        let base = index.checked_shl(l2).unwrap_or(0);

        *wi = SegWalk::new(base | low, need_write);
        wi.mem_obj = Some(producer);
        wi.keeper = Keeper::Unknown;
        wi.background = background;
        self.pin(producer);
        if read_only {
            wi.note_restrictions(KeyPerms::READ_ONLY);
        }
        segwalk_trace!("resume at {:?} level {} offset {:#x}", producer, level, wi.offset);
    }

    /// Find or make the table a walk that stopped at `span` produces
    fn product_for(&mut self, wi: &SegWalk, level: usize, span: u32, top: bool) -> Step<TableRef> {
        let Some(producer) = wi.mem_obj else {
            fatal!("translation without a producer");
        };
        let index = wi.offset.checked_shr(span).unwrap_or(0);
        let read_only = top && wi.restrictions.contains(KeyPerms::READ_ONLY);
        match self.find_product(producer, level, index, read_only, wi.background) {
            Some(t) => Ok(t),
            None => self.make_new_table(producer, level, index, read_only, wi.background),
        }
    }

    fn fault_exit(&mut self, p: ProcessRef, wi: &SegWalk, va: u64, prompt: bool) -> Step<Result<(), FaultCode>> {
        let code = wi.fault.unwrap_or(FaultCode::InvalidAddress);
        log::debug!("translation of {:#x} for {:?} failed: {}", va, p, code);
        if prompt {
            return Ok(Err(code));
        }
        self.invoke_segment_keeper(p, wi, true, va)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::Key;
    use crate::testing::SpaceBuilder;

    #[test]
    fn test_fault_maps_page() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let leaf = b.gpt(12);
        let top = b.gpt(22);
        b.set(leaf, 1, Key::page(page, 0));
        b.set(top, 0, Key::gpt(leaf, 0));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x1234)), TrapOutcome::Resumed);
        let MapRoot::Table(root) = k.process(p).unwrap().map_root() else {
            panic!("no top-level table");
        };
        let Some(Pte::Table { table, writable }) = k.pte(root, 0) else {
            panic!("no directory entry");
        };
        assert!(writable);
        let frame = k.object(k.lookup(page).unwrap()).unwrap().frame().unwrap();
        assert_eq!(
            k.pte(table, 1),
            Some(Pte::Page {
                frame,
                writable: false
            })
        );
        assert_eq!(k.process(p).unwrap().pf_count(), 1);
    }

    #[test]
    fn test_write_upgrades_read_mapping() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let top = b.gpt(12);
        b.set(top, 0, Key::page(page, 0));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x10)), TrapOutcome::Resumed);
        let MapRoot::Table(root) = k.process(p).unwrap().map_root() else {
            panic!("no top-level table");
        };
        let Some(Pte::Table { table, .. }) = k.pte(root, 0) else {
            panic!("no directory entry");
        };
        k.platform_mut().entry_flushes.clear();

        assert_eq!(k.handle_page_fault(p, FaultTrap::write(0x10)), TrapOutcome::Resumed);
        let page_ref = k.lookup(page).unwrap();
        assert!(k.object(page_ref).unwrap().is_dirty());
        assert_eq!(k.stats().n_pf_access, 1);

        // The replaced read-only translation is shot down
        let frame = k.object(page_ref).unwrap().frame().unwrap();
        assert_eq!(k.pte(table, 0), Some(Pte::Page { frame, writable: true }));
        assert_eq!(k.platform().entry_flushes, vec![(table, 0), (table, 0)]);
    }

    #[test]
    fn test_write_through_read_only_directory_keeps_mapping() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let leaf = b.gpt(12);
        let top = b.gpt(22);
        b.set(leaf, 1, Key::page(page, 0));
        b.set(top, 0, Key::gpt(leaf, 0).with_perms(KeyPerms::READ_ONLY));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x1000)), TrapOutcome::Resumed);
        let MapRoot::Table(root) = k.process(p).unwrap().map_root() else {
            panic!("no top-level table");
        };
        let Some(Pte::Table { table, writable }) = k.pte(root, 0) else {
            panic!("no directory entry");
        };
        assert!(!writable);
        let frame = k.object(k.lookup(page).unwrap()).unwrap().frame().unwrap();
        let mapped = Pte::Page {
            frame,
            writable: false,
        };
        assert_eq!(k.pte(table, 1), Some(mapped));
        k.platform_mut().entry_flushes.clear();

        assert_eq!(
            k.handle_page_fault(p, FaultTrap::write(0x1000)),
            TrapOutcome::Suspended(RestartReason::ProcessFault)
        );
        assert_eq!(k.process(p).unwrap().fault_code(), Some(FaultCode::AccessViolation));
        assert_eq!(
            k.pte(root, 0),
            Some(Pte::Table {
                table,
                writable: false
            })
        );
        assert_eq!(k.pte(table, 1), Some(mapped));
        assert!(k.platform().entry_flushes.is_empty());
    }

    #[test]
    fn test_failed_leaf_upgrade_keeps_read_mapping() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let top = b.gpt(12);
        b.set(top, 0, Key::page(page, 0).with_perms(KeyPerms::READ_ONLY));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x10)), TrapOutcome::Resumed);
        let MapRoot::Table(root) = k.process(p).unwrap().map_root() else {
            panic!("no top-level table");
        };
        let Some(Pte::Table { table, .. }) = k.pte(root, 0) else {
            panic!("no directory entry");
        };
        let before = k.pte(table, 0);
        assert!(matches!(before, Some(Pte::Page { writable: false, .. })));

        assert_eq!(
            k.do_page_fault(p, 0x10, true, true),
            Ok(Err(FaultCode::AccessViolation))
        );
        assert_eq!(k.pte(table, 0), before);
    }

    #[test]
    fn test_prompt_returns_fault() {
        let mut b = SpaceBuilder::new();
        let top = b.gpt(12);
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();
        assert_eq!(
            k.do_page_fault(p, 0x3000, false, true),
            Ok(Err(FaultCode::InvalidAddress))
        );
        assert!(k.process(p).unwrap().is_runnable());
    }

    #[test]
    fn test_address_above_user_limit() {
        let mut b = SpaceBuilder::new();
        let top = b.gpt(12);
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();
        assert_eq!(
            k.handle_page_fault(p, FaultTrap::read(0xC000_0000)),
            TrapOutcome::Suspended(RestartReason::ProcessFault)
        );
        assert_eq!(k.process(p).unwrap().fault_code(), Some(FaultCode::InvalidAddress));
    }
}
