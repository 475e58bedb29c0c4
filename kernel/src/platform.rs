//! Collaborator interfaces
//!
//! The translation engine does not own disks, frames, run queues, IPC or the
//! MMU. It reaches them through the traits below; [`Platform`] bundles them
//! for [`Kernel`](crate::Kernel).
//!
//! Operations that may block return [`Step`]: `Err(Restart)` means the
//! caller unwinds to its entry point and the whole operation is retried once
//! the activity runs again.

use alloc::vec::Vec;

use crate::error::{FaultCode, Step};
use crate::memory::TableRef;
use crate::objects::{FrameNumber, Key, ObCount, Oid};
use crate::process::ProcessRef;

/// Kind of object requested from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Node,
    Page,
}

/// Persistent image of an object
///
/// Node slots hold unprepared keys only.
#[derive(Debug)]
pub enum ObjectImage {
    Node {
        alloc_count: ObCount,
        call_count: ObCount,
        node_data: u16,
        slots: Vec<Key>,
    },
    Page {
        alloc_count: ObCount,
    },
}

impl ObjectImage {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectImage::Node { .. } => ObjectKind::Node,
            ObjectImage::Page { .. } => ObjectKind::Page,
        }
    }

    pub fn alloc_count(&self) -> ObCount {
        match self {
            ObjectImage::Node { alloc_count, .. } | ObjectImage::Page { alloc_count } => {
                *alloc_count
            }
        }
    }
}

/// Wait queue an activity may sleep on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallQueue {
    /// Waiting for an object to arrive or be released
    Object(Oid),
    /// Waiting for a keeper to reply on behalf of a process
    Process(ProcessRef),
}

/// Segment-keeper upcall, delivered by the IPC layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperCall {
    /// Faulting process
    pub process: ProcessRef,
    /// Keeper process (target of the start key in the keeper slot)
    pub keeper: ProcessRef,
    pub opcode: u32,
    pub fault_code: FaultCode,
    /// Offset of the fault relative to the keeper's GPT
    pub offset: u64,
    /// Whether a key to the keeper's GPT is passed in the invocation slot
    pub sends_segment: bool,
}

/// Source of persistent objects
pub trait ObjectStore {
    /// Fetch the current image of `oid`
    ///
    /// `Ok(None)` when the object does not exist or is not of `kind`.
    /// `Err(Restart)` when the caller must wait for I/O.
    fn resolve(&mut self, oid: Oid, kind: ObjectKind) -> Step<Option<ObjectImage>>;

    /// Persist a dirty object being dropped from the cache
    fn write_back(&mut self, oid: Oid, image: ObjectImage);
}

/// Physical frames for pages and mapping tables
pub trait FrameAllocator {
    fn allocate_frame(&mut self) -> Step<FrameNumber>;
    fn release_frame(&mut self, frame: FrameNumber);
}

/// Cooperative scheduling hooks
pub trait Scheduler {
    /// Give up the processor; the current operation restarts afterwards
    fn yield_now(&mut self);

    /// Sleep on `queue`; the current operation restarts when woken
    fn sleep_on(&mut self, queue: StallQueue);

    fn wake(&mut self, queue: StallQueue);
}

/// Delivery of keeper upcalls
pub trait KeeperTransport {
    fn invoke(&mut self, call: &KeeperCall);
}

/// Translation lookaside buffer maintenance
pub trait Tlb {
    /// Drop any cached translation built from one table entry
    fn flush_entry(&mut self, table: TableRef, index: usize);

    fn flush_all(&mut self);
}

/// Everything the kernel needs from its environment
pub trait Platform: ObjectStore + FrameAllocator + Scheduler + KeeperTransport + Tlb {}

impl<T> Platform for T where T: ObjectStore + FrameAllocator + Scheduler + KeeperTransport + Tlb {}
