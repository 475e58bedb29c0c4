//! End-to-end translation scenarios
//!
//! Each test builds a small address space, walks it directly and then
//! drives the same space through the page-fault path:
//! - a plain two-level tree
//! - a read-only root key with a keeper below it
//! - a keeper on the root with an empty slot
//! - the same keeper hidden by a no-call key

use kaal_keyspace::keeper::OC_SEGFAULT;
use kaal_keyspace::testing::{MockPlatform, SpaceBuilder};
use kaal_keyspace::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Walk the space named by `root` down to a page
fn walk(
    k: &mut Kernel<MockPlatform>,
    root: SlotId,
    va: u64,
    write: bool,
) -> (SegWalk, Result<(), FaultCode>) {
    let mut wi = SegWalk::new(va, write);
    let init = k
        .segwalk_init(&mut wi, root, va, write, None)
        .expect("walk suspended");
    if let Err(code) = init {
        return (wi, Err(code));
    }
    let result = k.walk_seg(&mut wi, 12, None).expect("walk suspended");
    (wi, result)
}

struct Tree {
    builder: SpaceBuilder,
    root: Oid,
    second: Oid,
    page: Oid,
}

/// Root GPT of width 24 whose slot 0 holds a width-12 GPT whose slot 3
/// holds a read-write page
fn scenario_tree() -> Tree {
    let mut builder = SpaceBuilder::new();
    let page = builder.page();
    let second = builder.gpt(12);
    let root = builder.gpt(24);
    builder.set(second, 3, Key::page(page, 0));
    builder.set(root, 0, Key::gpt(second, 0));
    Tree {
        builder,
        root,
        second,
        page,
    }
}

const VA: u64 = (3 << 12) + 0x10;

/// Scenario 1: the walk reaches the page with the in-page offset left
#[test]
fn test_scenario_plain_walk() {
    init_logging();
    let t = scenario_tree();
    let mut k = t.builder.kernel();
    let slot = SlotId::Invocation(0);
    k.write_key(slot, Key::gpt(t.root, 0));

    let (wi, result) = walk(&mut k, slot, VA, false);
    assert_eq!(result, Ok(()));
    assert_eq!(wi.mem_obj, k.lookup(t.page));
    assert_eq!(wi.offset, 0x10);
    assert!(wi.restrictions.is_empty());
    assert_eq!(wi.keeper, Keeper::None);
}

/// Scenario 1 through the fault path: a write maps the page writable
#[test]
fn test_scenario_plain_fault() {
    init_logging();
    let mut t = scenario_tree();
    let root = t.root;
    let proc_oid = t.builder.process(Key::gpt(root, 0));
    let mut k = t.builder.kernel();
    let p = k
        .load_process(proc_oid)
        .expect("load suspended")
        .expect("no process");

    assert_eq!(k.handle_page_fault(p, FaultTrap::write(VA)), TrapOutcome::Resumed);
    let page = k.lookup(t.page).expect("page not resident");
    let frame = k.object(page).and_then(|h| h.frame()).expect("page frame");
    let MapRoot::Table(top) = k.process(p).expect("process").map_root() else {
        panic!("no top-level table");
    };
    let Some(Pte::Table { table, writable }) = k.pte(top, 0) else {
        panic!("no directory entry");
    };
    assert!(writable);
    assert_eq!(k.pte(table, 3), Some(Pte::Page { frame, writable: true }));
    assert!(k.object(page).expect("page").is_dirty());
}

/// Scenario 2: a write through a read-only root fails, but the walk still
/// descends far enough to find the keeper below the root
#[test]
fn test_scenario_read_only_root() {
    init_logging();
    let mut t = scenario_tree();
    let keeper = t.builder.keeper_process();
    t.builder.set_keeper(t.second, keeper, false);
    let mut k = t.builder.kernel();
    let slot = SlotId::Invocation(0);
    k.write_key(slot, Key::gpt(t.root, 0).with_perms(KeyPerms::READ_ONLY));

    let (wi, result) = walk(&mut k, slot, VA, true);
    assert_eq!(result, Err(FaultCode::AccessViolation));
    assert!(wi.restrictions.contains(KeyPerms::READ_ONLY));
    assert_eq!(wi.mem_obj, k.lookup(t.page));
    let second = k.lookup(t.second).expect("second level not resident");
    assert_eq!(wi.keeper, Keeper::Gpt { node: second, offset: VA });

    // A read through the same key is fine
    let (_, result) = walk(&mut k, slot, VA, false);
    assert_eq!(result, Ok(()));
}

/// Scenario 2 through the fault path: the keeper hears about the violation
#[test]
fn test_scenario_read_only_root_fault() {
    init_logging();
    let mut t = scenario_tree();
    let keeper = t.builder.keeper_process();
    t.builder.set_keeper(t.second, keeper, false);
    let root = t.root;
    let proc_oid = t
        .builder
        .process(Key::gpt(root, 0).with_perms(KeyPerms::READ_ONLY));
    let mut k = t.builder.kernel();
    let p = k
        .load_process(proc_oid)
        .expect("load suspended")
        .expect("no process");

    assert_eq!(k.handle_page_fault(p, FaultTrap::read(VA)), TrapOutcome::Resumed);
    assert_eq!(
        k.handle_page_fault(p, FaultTrap::write(VA)),
        TrapOutcome::Suspended(RestartReason::KeeperCall)
    );
    let calls = k.platform().keeper_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].fault_code, FaultCode::AccessViolation);
    assert_eq!(calls[0].opcode, OC_SEGFAULT);
    assert_eq!(calls[0].offset, VA);
    assert!(!calls[0].sends_segment);
    assert_eq!(k.process(p).expect("process").run_state(), RunState::AwaitingKeeper);
}

/// Scenario 3: an empty slot under a root keeper reports the root keeper
#[test]
fn test_scenario_keeper_on_root() {
    init_logging();
    let mut b = SpaceBuilder::new();
    let root = b.gpt(24);
    let keeper = b.keeper_process();
    b.set_keeper(root, keeper, true);
    let proc_oid = b.process(Key::gpt(root, 0));
    let mut k = b.kernel();
    let slot = SlotId::Invocation(0);
    k.write_key(slot, Key::gpt(root, 0));

    let (wi, result) = walk(&mut k, slot, 0, false);
    assert_eq!(result, Err(FaultCode::InvalidAddress));
    let root_ref = k.lookup(root).expect("root not resident");
    assert_eq!(wi.keeper, Keeper::Gpt { node: root_ref, offset: 0 });

    let p = k
        .load_process(proc_oid)
        .expect("load suspended")
        .expect("no process");
    assert_eq!(
        k.handle_page_fault(p, FaultTrap::read(0)),
        TrapOutcome::Suspended(RestartReason::KeeperCall)
    );
    let call = &k.platform().keeper_calls()[0];
    assert_eq!(call.fault_code, FaultCode::InvalidAddress);
    assert_eq!(call.offset, 0);
    assert!(call.sends_segment);
    assert_eq!(k.process(p).expect("process").fault_info(), 0);
}

/// Scenario 4: a no-call key above the keeper hides it; the fault goes to
/// the process keeper
#[test]
fn test_scenario_no_call_hides_root_keeper() {
    init_logging();
    let mut b = SpaceBuilder::new();
    let root = b.gpt(24);
    let keeper = b.keeper_process();
    b.set_keeper(root, keeper, false);
    let proc_oid = b.process(Key::gpt(root, 0).with_perms(KeyPerms::NO_CALL));
    let mut k = b.kernel();
    let slot = SlotId::Invocation(0);
    k.write_key(slot, Key::gpt(root, 0).with_perms(KeyPerms::NO_CALL));

    let (wi, result) = walk(&mut k, slot, 0, false);
    assert_eq!(result, Err(FaultCode::InvalidAddress));
    assert_eq!(wi.keeper, Keeper::None);

    let p = k
        .load_process(proc_oid)
        .expect("load suspended")
        .expect("no process");
    assert_eq!(
        k.handle_page_fault(p, FaultTrap::read(0)),
        TrapOutcome::Suspended(RestartReason::ProcessFault)
    );
    assert!(k.platform().keeper_calls().is_empty());
    let process = k.process(p).expect("process");
    assert!(process.has_pending_fault());
    assert_eq!(process.fault_code(), Some(FaultCode::InvalidAddress));
    assert_eq!(k.stats().n_process_faults, 1);
}

/// After a keeper fills the hole and replies, the fault completes
#[test]
fn test_keeper_repairs_and_replies() {
    init_logging();
    let mut b = SpaceBuilder::new();
    let root = b.gpt(12);
    let keeper = b.keeper_process();
    b.set_keeper(root, keeper, true);
    let page = b.page();
    let proc_oid = b.process(Key::gpt(root, 0));
    let mut k = b.kernel();
    let p = k
        .load_process(proc_oid)
        .expect("load suspended")
        .expect("no process");

    assert_eq!(
        k.handle_page_fault(p, FaultTrap::read(0x2000)),
        TrapOutcome::Suspended(RestartReason::KeeperCall)
    );
    let root_ref = k.lookup(root).expect("root not resident");
    k.populate_page(root_ref, 2, page)
        .expect("populate suspended")
        .expect("populate rejected");
    k.keeper_reply(p);
    assert!(k.platform().wakes.contains(&StallQueue::Process(p)));

    assert_eq!(k.handle_page_fault(p, FaultTrap::read(0x2000)), TrapOutcome::Resumed);
    assert!(k.process(p).expect("process").is_runnable());
}
