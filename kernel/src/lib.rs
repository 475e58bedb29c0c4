//! KaaL Keyspace
//!
//! Address-space translation for a persistent capability microkernel.
//!
//! # Architecture
//!
//! Authority over memory is expressed as keys (capabilities) held in
//! fixed-size nodes. An address space is a tree of guarded page tables
//! (GPTs): every GPT asserts an addressing width and its slots hold keys to
//! deeper GPTs or pages. The kernel is organized into the following modules:
//! - `objects`: keys, key rings, nodes, the object cache and GPT operations
//! - `process`: process records, key registers and fault state
//! - `depend`: which hardware entries were built from which key slots
//! - `memory`: the architecture-neutral hardware mapping tables
//! - `segwalk`: the segment tree walk
//! - `fault`: the page-fault handler
//! - `keeper`: escalation of failed translations to user-level keepers
//! - `space`: address-space maintenance helpers and offset probing
//! - `platform`: collaborator interfaces (object store, frames, scheduler,
//!   keeper transport, TLB)
//!
//! # Execution model
//!
//! Control is cooperative. Any operation that would block returns
//! [`Restart`] and the whole operation is redone from its entry point on the
//! next run; no walk state survives a suspension.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

#[macro_use]
pub mod debug;

pub mod config;
pub mod depend;
pub mod error;
pub mod fault;
pub mod keeper;
pub mod kernel;
pub mod memory;
pub mod objects;
pub mod platform;
pub mod process;
pub mod segwalk;
pub mod space;
pub mod stats;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{KernelConfig, PagingGeometry};
pub use depend::{DependEntry, DependencyTracker, KeyDependTable};
pub use error::{FaultCode, RequestError, Restart, RestartReason, Step};
pub use fault::{FaultTrap, TrapOutcome};
pub use kernel::Kernel;
pub use memory::{MapRoot, MapTable, PteLoc, Pte, TableRef};
pub use objects::{
    FrameNumber, GptReply, GptRequest, Guard, Key, KeyFlags, KeyPerms, KeyType, ObCount, ObjRef,
    ObType, Oid, SlotId, Window, WindowTarget,
};
pub use platform::{KeeperCall, ObjectImage, ObjectKind, Platform, StallQueue};
pub use process::{ProcessRef, RunState};
pub use segwalk::{Keeper, SegWalk};
pub use stats::KernStats;
