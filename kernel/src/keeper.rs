//! Keeper escalation
//!
//! A translation that cannot be completed is reported to the nearest
//! callable segment keeper on the walk path. Without one, the process is
//! left faulted for its process keeper.

use crate::config::{GPT_KEEPER_SLOT, PAGE_L2V, PROC_ADDR_SPACE};
use crate::error::{FaultCode, Restart, RestartReason, Step};
use crate::kernel::Kernel;
use crate::objects::gpt::RED_NODE_SLOT;
use crate::objects::{Guard, KeyPerms, KeyType, ObjRef, SlotId};
use crate::platform::{KeeperCall, Platform, StallQueue};
use crate::process::{ProcessRef, RunState};
use crate::segwalk::{Keeper, SegWalk};

/// Order code of a segment fault upcall
pub const OC_SEGFAULT: u32 = 0;

impl<P: Platform> Kernel<P> {
    /// Report the failed walk `wi` for process `p`
    ///
    /// Returns `Err(Restart)` once a keeper has been called or the process
    /// has been faulted. When no keeper is callable and `fallback` is
    /// clear the fault code is handed back instead.
    pub fn invoke_segment_keeper(
        &mut self,
        p: ProcessRef,
        wi: &SegWalk,
        fallback: bool,
        va: u64,
    ) -> Step<Result<(), FaultCode>> {
        let code = wi.fault.unwrap_or(FaultCode::InvalidAddress);
        let keeper = match wi.keeper {
            Keeper::Unknown => self.find_keeper(p, va, wi.need_write)?,
            k => k,
        };

        if let Keeper::Gpt { node, offset } = keeper {
            if let Some(keeper_proc) = self.keeper_process(node)? {
                return Err(self.call_segment_keeper(p, node, keeper_proc, code, offset, va));
            }
            log::debug!("keeper slot of {:?} holds no gate key", node);
        }

        if !fallback {
            return Ok(Err(code));
        }
        self.set_fault(p, code, va);
        self.platform.yield_now();
        Err(Restart::new(RestartReason::ProcessFault))
    }

    /// Walk the whole space again to learn the keeper
    ///
    /// The walk records no dependencies.
    fn find_keeper(&mut self, p: ProcessRef, va: u64, need_write: bool) -> Step<Keeper> {
        let root = SlotId::node(self.proc(p).proc_root, PROC_ADDR_SPACE);
        let mut wi = SegWalk::new(va, need_write);
        if self.segwalk_init(&mut wi, root, va, need_write, None)?.is_ok() {
            if let Err(code) = self.walk_seg(&mut wi, PAGE_L2V, None)? {
                log::trace!("rewalk of {:#x} stopped: {}", va, code);
            }
        }
        segwalk_trace!("rewalk for keeper of {:#x}: {:?}", va, wi.keeper);
        Ok(wi.keeper)
    }

    /// Process behind the gate key in the keeper slot of `gpt`
    pub(crate) fn keeper_process(&mut self, gpt: ObjRef) -> Step<Option<ProcessRef>> {
        let slot = SlotId::node(gpt, GPT_KEEPER_SLOT);
        self.prepare_key(slot)?;
        let key = self.key_ref(slot);
        Ok(if key.kind().is_gate() {
            key.process_ref()
        } else {
            None
        })
    }

    fn call_segment_keeper(
        &mut self,
        p: ProcessRef,
        gpt: ObjRef,
        keeper: ProcessRef,
        code: FaultCode,
        offset: u64,
        va: u64,
    ) -> Restart {
        let sends_segment = self.gpt_fields(gpt).sends_node();
        let red = SlotId::Invocation(RED_NODE_SLOT);
        if sends_segment {
            self.key_set_to_object(red, KeyType::Gpt, gpt, KeyPerms::empty(), Guard::NONE);
        } else {
            self.set_void(red);
        }

        {
            let process = self.proc_mut(p);
            process.fault_code = Some(code);
            process.fault_info = va;
            process.run_state = RunState::AwaitingKeeper;
        }
        let call = KeeperCall {
            process: p,
            keeper,
            opcode: OC_SEGFAULT,
            fault_code: code,
            offset,
            sends_segment,
        };
        self.stats.n_keeper_calls += 1;
        log::debug!("segment keeper {:?} called for {:?}: {} at {:#x}", keeper, p, code, offset);
        self.platform.invoke(&call);
        self.platform.sleep_on(StallQueue::Process(p));
        Restart::new(RestartReason::KeeperCall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultTrap, TrapOutcome};
    use crate::objects::Key;
    use crate::testing::SpaceBuilder;

    #[test]
    fn test_keeper_gets_offset_relative_to_its_gpt() {
        let mut b = SpaceBuilder::new();
        let inner = b.gpt(12);
        let top = b.gpt(16);
        let keeper = b.keeper_process();
        b.set_keeper(inner, keeper, true);
        b.set(top, 1, Key::gpt(inner, 0));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        let va = (1 << 16) | (4 << 12) | 8;
        assert_eq!(
            k.handle_page_fault(p, FaultTrap::read(va)),
            TrapOutcome::Suspended(RestartReason::KeeperCall)
        );
        let calls = k.platform().keeper_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].offset, (4 << 12) | 8);
        assert_eq!(calls[0].fault_code, FaultCode::InvalidAddress);
        assert!(calls[0].sends_segment);
        let red = k.key(SlotId::Invocation(RED_NODE_SLOT)).unwrap();
        assert_eq!(red.kind(), KeyType::Gpt);
        assert_eq!(red.object_ref(), k.lookup(inner));
        assert_eq!(k.process(p).unwrap().run_state(), RunState::AwaitingKeeper);
    }

    #[test]
    fn test_failed_rewalk_still_finds_keeper() {
        let mut b = SpaceBuilder::new();
        let page = b.page();
        let leaf = b.gpt(12);
        let top = b.gpt(22);
        let keeper = b.keeper_process();
        b.set_keeper(top, keeper, false);
        b.set(leaf, 1, Key::page(page, 0));
        b.set(top, 0, Key::gpt(leaf, 0).with_perms(KeyPerms::READ_ONLY));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x1000)), TrapOutcome::Resumed);
        // The walk resumes below the top, so the keeper comes from a rewalk
        assert_eq!(
            k.handle_page_fault(p, FaultTrap::write(0x1000)),
            TrapOutcome::Suspended(RestartReason::KeeperCall)
        );
        let calls = k.platform().keeper_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].fault_code, FaultCode::AccessViolation);
        assert_eq!(calls[0].offset, 0x1000);
    }

    #[test]
    fn test_no_call_hides_keeper() {
        let mut b = SpaceBuilder::new();
        let inner = b.gpt(12);
        let top = b.gpt(16);
        let keeper = b.keeper_process();
        b.set_keeper(inner, keeper, false);
        b.set(top, 0, Key::gpt(inner, 0).with_perms(KeyPerms::NO_CALL));
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();

        assert_eq!(
            k.handle_page_fault(p, FaultTrap::read(0x2000)),
            TrapOutcome::Suspended(RestartReason::ProcessFault)
        );
        assert!(k.platform().keeper_calls().is_empty());
        assert!(k.process(p).unwrap().has_pending_fault());
    }

    #[test]
    fn test_prompt_without_fallback_returns_code() {
        let mut b = SpaceBuilder::new();
        let top = b.gpt(12);
        let p = b.process(Key::gpt(top, 0));
        let mut k = b.kernel();
        let p = k.load_process(p).unwrap().unwrap();
        let mut wi = SegWalk::new(0x1000, false);
        wi.fault = Some(FaultCode::InvalidAddress);
        assert_eq!(
            k.invoke_segment_keeper(p, &wi, false, 0x1000),
            Ok(Err(FaultCode::InvalidAddress))
        );
        assert!(!k.process(p).unwrap().has_pending_fault());
    }
}
