//! Error and suspension types
//!
//! ## Design
//!
//! Three distinct outcomes leave a kernel operation:
//! - a translation fault ([`FaultCode`]), recorded in the walk and handed to
//!   the entry point, which may escalate it to a keeper;
//! - a suspension ([`Restart`]): the activity must block and the operation
//!   is redone from its entry point when it next runs;
//! - a rejected key invocation ([`RequestError`]).
//!
//! Internal corruption is none of these; it goes through `fatal!`.

use thiserror::Error;

use crate::objects::{KeyType, Oid};

/// Translation fault codes, with the values processes observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum FaultCode {
    /// Out-of-range slot, Void key, guard mismatch or unmapped leaf
    #[error("invalid address")]
    InvalidAddress = 1,

    /// Write through a read-only-narrowed path
    #[error("access violation")]
    AccessViolation = 2,

    /// Walk exceeded the depth bound
    #[error("segment traversal limit exceeded")]
    TraverseLimit = 16,

    /// Wrong key type in the tree or misaligned window offset
    #[error("malformed address space")]
    MalformedSpace = 17,
}

impl FaultCode {
    /// Numeric fault code
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Why an operation has to be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The object store is bringing an object in
    ObjectFetch(Oid),
    /// Waiting on an object's stall queue
    HazardStall(Oid),
    /// No free frame right now
    FrameAllocation,
    /// A keeper was invoked; the caller waits for its reply
    KeeperCall,
    /// A dependency fired while the translation was being built
    TranslationZapped,
    /// The process was left faulted for its process keeper
    ProcessFault,
    /// Voluntary yield
    Yield,
}

/// The current activity must suspend; redo the operation from its entry
/// point when it runs again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation must restart from its entry point ({reason:?})")]
pub struct Restart {
    pub reason: RestartReason,
}

impl Restart {
    pub const fn new(reason: RestartReason) -> Self {
        Self { reason }
    }
}

/// `Ok(value)` when the step completed, `Err(Restart)` when it suspended
pub type Step<T> = core::result::Result<T, Restart>;

/// Key invocation rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("slot {slot} out of range")]
    SlotOutOfRange { slot: usize },

    #[error("slot {slot} already holds a key")]
    SlotOccupied { slot: usize },

    #[error("l2v {l2v} out of range")]
    InvalidL2v { l2v: u32 },

    #[error("restriction bits {bits:#x} not allowed here")]
    InvalidRestrictions { bits: u8 },

    #[error("window offset {offset:#x} is not a multiple of the slot span")]
    MisalignedWindow { offset: u64 },

    #[error("guard {offset:#x} is not representable")]
    UnrepresentableGuard { offset: u64 },

    #[error("operation not permitted through an opaque key")]
    Opaque,

    #[error("operation not permitted through a read-only key")]
    NoAccess,

    #[error("expected a {expected:?} key, found {found:?}")]
    WrongKeyType { expected: KeyType, found: KeyType },
}
