//! Kernel Object Model
//!
//! Persistent objects are nodes (32 key slots) and pages. Authority to use
//! an object is a [`Key`] held in some slot. A node takes on a role when it
//! is *prepared*: as a GPT (a level of an address-space tree), as a process
//! root, or as the key registers of a process.
//!
//! ## Modules
//!
//! - `key`: key representation, guards and window keys
//! - `keyring`: slot identities and per-object rings of prepared keys
//! - `header`: object headers and the resident object cache
//! - `prep`: key preparation, copying, rescinding and hazard clearing
//! - `node`: node slot operations and role changes
//! - `gpt`: GPT fields and the GPT / memory key invocations
//! - `lifecycle`: transactions, eviction and object rescind

pub mod arena;
pub mod gpt;
pub mod header;
pub mod key;
pub mod keyring;
pub mod lifecycle;
pub mod node;
pub mod prep;

pub use gpt::{GptReply, GptRequest};
pub use header::{
    FrameNumber, NodeBody, ObCount, ObFlags, ObType, ObjRef, ObjectBody, ObjectCache, ObjectHeader,
    Oid,
};
pub use key::{Guard, Key, KeyFlags, KeyPerms, KeyType, Window, WindowTarget};
pub use keyring::{KeyRing, RingOwner, SlotId};
