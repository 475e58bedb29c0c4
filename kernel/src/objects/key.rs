//! Keys
//!
//! A key is one capability slot: a type, permission restrictions, state
//! flags, a guard, and a payload. Object-referencing keys are either
//! *unprepared* (object identity plus the generation count they expect) or
//! *prepared* (a weak handle to the resident object, with the holding slot
//! registered on that object's key ring).
//!
//! ## Design
//!
//! Keys never move between slots by plain assignment; `Kernel::key_set` is
//! the only copy path because it keeps key rings consistent. The raw
//! duplicate used internally is crate-private.
//!
//! ## Key state machine
//!
//! ```text
//!   Void  <-- rescind ---------------------------+
//!    ^                                           |
//!    | absent / count mismatch                   |
//!  Unprepared --prepare--> Prepared --unprepare--+--> Unprepared
//!                            |
//!                      hazard bits (only while prepared)
//! ```

use bitflags::bitflags;
use core::fmt;

use super::header::{ObCount, ObjRef, Oid};
use crate::config::{GPT_SLOTS, PAGE_L2V, WINDOW_BACKGROUND};
use crate::process::ProcessRef;

bitflags! {
    /// Permission restrictions carried by a key
    ///
    /// Restrictions only ever accumulate along a path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyPerms: u8 {
        /// Weak: keys fetched through it are desensitized
        const WEAK = 0x01;
        /// Keepers below this point may not be called
        const NO_CALL = 0x02;
        /// No write access
        const READ_ONLY = 0x04;
        /// Structure is hidden from the holder
        const OPAQUE = 0x08;
    }
}

bitflags! {
    /// Key state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyFlags: u8 {
        const PREPARED = 0x01;
        /// Some cached copy of this slot is being read
        const RD_HAZARD = 0x02;
        /// Some hardware structure was built from this slot
        const WR_HAZARD = 0x04;
        const HAZARD = Self::RD_HAZARD.bits() | Self::WR_HAZARD.bits();
    }
}

/// Key types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Start gate to a process
    Start = 0,
    /// Resume gate to a process waiting for a reply
    Resume = 1,
    /// Process control key
    Process = 2,
    /// Data page
    Page = 3,
    /// Node
    Node = 4,
    /// Node used as an address-space tree level
    Gpt = 5,
    /// Forwarder node
    Forwarder = 6,
    /// Data key of three words; doubles as a window key inside a GPT
    Number = 7,
    /// Discrimination key (data only)
    Discrim = 8,
    /// Range of object identities
    Range = 9,
    /// Scheduling key
    Sched = 10,
    /// Null key
    Void = 11,
}

impl KeyType {
    /// Gate keys link into a process rather than a bare object
    pub const fn is_gate(self) -> bool {
        matches!(self, KeyType::Start | KeyType::Resume)
    }

    pub const fn is_process_type(self) -> bool {
        matches!(self, KeyType::Start | KeyType::Resume | KeyType::Process)
    }

    /// Keys that name a persistent object by identity
    pub const fn is_object_type(self) -> bool {
        matches!(
            self,
            KeyType::Start
                | KeyType::Resume
                | KeyType::Process
                | KeyType::Page
                | KeyType::Node
                | KeyType::Gpt
                | KeyType::Forwarder
        )
    }

    /// Keys that designate a node
    pub const fn is_node_type(self) -> bool {
        matches!(self, KeyType::Node | KeyType::Gpt | KeyType::Forwarder)
    }

    /// Keys that may appear in an address-space tree
    pub const fn is_memory_type(self) -> bool {
        matches!(self, KeyType::Page | KeyType::Gpt)
    }

    /// Keys that carry no authority beyond their own bits
    pub const fn is_data_type(self) -> bool {
        matches!(self, KeyType::Number | KeyType::Discrim)
    }
}

/// Guard of a memory key
///
/// An address passes the guard when its bits at and above `l2g` equal
/// `value`; those bits are then stripped. `l2g == 64` disables the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    l2g: u8,
    value: u64,
}

impl Guard {
    /// Guard that accepts every address unchanged
    pub const NONE: Guard = Guard { l2g: 64, value: 0 };

    /// Guard of a plain page key: offsets must lie within the page
    pub const PAGE: Guard = Guard {
        l2g: PAGE_L2V as u8,
        value: 0,
    };

    /// Build a guard; `None` when `value` does not fit above `l2g`
    pub fn new(l2g: u32, value: u64) -> Option<Guard> {
        if l2g > 64 {
            return None;
        }
        let spare = value.checked_shr(64 - l2g).unwrap_or(0);
        if spare != 0 || (l2g == 64 && value != 0) {
            return None;
        }
        Some(Guard {
            l2g: l2g as u8,
            value,
        })
    }

    /// Guard matching exactly the addresses `offset .. offset + 2^tz`,
    /// where `tz` is the number of trailing zero bits of `offset`
    ///
    /// `min_l2g` is the narrowest width the key may have.
    pub fn from_offset(offset: u64, min_l2g: u32) -> Option<Guard> {
        if offset == 0 {
            return Guard::new(64, 0);
        }
        let l2g = offset.trailing_zeros();
        if l2g < min_l2g {
            return None;
        }
        Guard::new(l2g, offset >> l2g)
    }

    pub fn l2g(&self) -> u32 {
        self.l2g as u32
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// The address this guard selects
    pub fn offset(&self) -> u64 {
        self.value.checked_shl(self.l2g as u32).unwrap_or(0)
    }

    /// Check `va`, returning the address with the guard bits stripped
    pub fn check(&self, va: u64) -> Option<u64> {
        let l2g = self.l2g as u32;
        let high = va.checked_shr(l2g).unwrap_or(0);
        if high != self.value {
            return None;
        }
        if l2g >= 64 {
            Some(va)
        } else {
            Some(va & ((1u64 << l2g) - 1))
        }
    }
}

impl Default for Guard {
    fn default() -> Self {
        Guard::NONE
    }
}

/// Where a window key redirects translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTarget {
    /// Another slot of the same GPT
    Local(usize),
    /// Background slot of the nearest background-declaring ancestor
    Background,
}

/// Decoded window key
///
/// Layout of the three number words: `[0]` low offset, `[1]` high offset,
/// `[2]` control word with the target slot in bits 0..8 and restrictions in
/// bits 8..16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    pub restrictions: KeyPerms,
    control_slot: u8,
}

impl Window {
    /// Target slot, or `None` when the control word names no valid slot
    pub fn target(&self) -> Option<WindowTarget> {
        match self.control_slot {
            WINDOW_BACKGROUND => Some(WindowTarget::Background),
            s if (s as usize) < GPT_SLOTS => Some(WindowTarget::Local(s as usize)),
            _ => None,
        }
    }

    /// Raw control-word slot value
    pub fn control_slot(&self) -> u8 {
        self.control_slot
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Payload {
    None,
    Number([u32; 3]),
    Unprepared { oid: Oid, count: ObCount },
    Object(ObjRef),
    Gate(ProcessRef),
}

/// One capability slot
#[derive(PartialEq, Eq)]
pub struct Key {
    kind: KeyType,
    perms: KeyPerms,
    flags: KeyFlags,
    guard: Guard,
    payload: Payload,
}

impl Key {
    /// The null key
    pub const fn void() -> Self {
        Key {
            kind: KeyType::Void,
            perms: KeyPerms::empty(),
            flags: KeyFlags::empty(),
            guard: Guard::NONE,
            payload: Payload::None,
        }
    }

    /// Number key holding three words
    pub const fn number(value: [u32; 3]) -> Self {
        Key {
            kind: KeyType::Number,
            perms: KeyPerms::empty(),
            flags: KeyFlags::empty(),
            guard: Guard::NONE,
            payload: Payload::Number(value),
        }
    }

    /// Window key for a GPT slot
    ///
    /// `offset` must be a multiple of the slot span of the GPT it is placed
    /// in; the walk rejects it otherwise.
    pub fn window(target: WindowTarget, offset: u64, restrictions: KeyPerms) -> Self {
        let slot = match target {
            WindowTarget::Local(s) => s as u32,
            WindowTarget::Background => WINDOW_BACKGROUND as u32,
        };
        Key::number([
            offset as u32,
            (offset >> 32) as u32,
            ((restrictions.bits() as u32) << 8) | slot,
        ])
    }

    /// Data-only key of a non-object type (discrim, range, sched)
    pub fn misc(kind: KeyType, value: [u32; 3]) -> Self {
        debug_assert!(!kind.is_object_type());
        Key {
            kind,
            ..Key::number(value)
        }
    }

    /// Unprepared key naming object `oid` at generation `count`
    pub fn object(kind: KeyType, oid: Oid, count: ObCount) -> Self {
        debug_assert!(kind.is_object_type());
        let guard = if kind == KeyType::Page {
            Guard::PAGE
        } else {
            Guard::NONE
        };
        Key {
            kind,
            perms: KeyPerms::empty(),
            flags: KeyFlags::empty(),
            guard,
            payload: Payload::Unprepared { oid, count },
        }
    }

    pub fn page(oid: Oid, count: ObCount) -> Self {
        Key::object(KeyType::Page, oid, count)
    }

    pub fn gpt(oid: Oid, count: ObCount) -> Self {
        Key::object(KeyType::Gpt, oid, count)
    }

    pub fn node(oid: Oid, count: ObCount) -> Self {
        Key::object(KeyType::Node, oid, count)
    }

    pub fn start(oid: Oid, count: ObCount) -> Self {
        Key::object(KeyType::Start, oid, count)
    }

    /// Add restrictions
    pub fn with_perms(mut self, perms: KeyPerms) -> Self {
        self.perms |= perms;
        self
    }

    /// Replace the guard
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn kind(&self) -> KeyType {
        self.kind
    }

    pub fn perms(&self) -> KeyPerms {
        self.perms
    }

    pub fn flags(&self) -> KeyFlags {
        self.flags
    }

    pub fn guard(&self) -> Guard {
        self.guard
    }

    pub fn is_void(&self) -> bool {
        self.kind == KeyType::Void
    }

    pub fn is_prepared(&self) -> bool {
        self.flags.contains(KeyFlags::PREPARED)
    }

    pub fn is_hazarded(&self) -> bool {
        self.flags.intersects(KeyFlags::HAZARD)
    }

    pub fn is_rd_hazard(&self) -> bool {
        self.flags.contains(KeyFlags::RD_HAZARD)
    }

    pub fn is_wr_hazard(&self) -> bool {
        self.flags.contains(KeyFlags::WR_HAZARD)
    }

    /// Prepared key whose slot sits on a key ring
    pub fn is_prepared_object(&self) -> bool {
        matches!(self.payload, Payload::Object(_) | Payload::Gate(_))
    }

    /// Identity and expected count of an unprepared object key
    pub fn unprepared_target(&self) -> Option<(Oid, ObCount)> {
        match self.payload {
            Payload::Unprepared { oid, count } => Some((oid, count)),
            _ => None,
        }
    }

    /// Resident object of a prepared non-gate key
    pub fn object_ref(&self) -> Option<ObjRef> {
        match self.payload {
            Payload::Object(r) => Some(r),
            _ => None,
        }
    }

    /// Process of a prepared process-type key
    pub fn process_ref(&self) -> Option<ProcessRef> {
        match self.payload {
            Payload::Gate(p) => Some(p),
            _ => None,
        }
    }

    /// Words of a number-like key
    pub fn words(&self) -> Option<[u32; 3]> {
        match self.payload {
            Payload::Number(w) => Some(w),
            _ => None,
        }
    }

    /// Decode as a window key
    pub fn as_window(&self) -> Option<Window> {
        if self.kind != KeyType::Number {
            return None;
        }
        let [lo, hi, control] = self.words()?;
        Some(Window {
            offset: ((hi as u64) << 32) | lo as u64,
            restrictions: KeyPerms::from_bits_truncate(((control >> 8) & 0xff) as u8),
            control_slot: (control & 0xff) as u8,
        })
    }

    /// Restrictions a weak fetch imposes on a copy of this key, or `None`
    /// when the copy must become Void
    pub fn desensitized_perms(&self) -> Option<KeyPerms> {
        match self.kind {
            KeyType::Node | KeyType::Gpt | KeyType::Forwarder => {
                Some(self.perms | KeyPerms::READ_ONLY | KeyPerms::NO_CALL | KeyPerms::WEAK)
            }
            KeyType::Page => Some(self.perms | KeyPerms::READ_ONLY),
            KeyType::Number | KeyType::Discrim | KeyType::Void => Some(self.perms),
            _ => None,
        }
    }

    /// Field copy without hazard bits; ring linkage is the caller's job
    pub(crate) fn duplicate(&self) -> Key {
        let payload = match self.payload {
            Payload::None => Payload::None,
            Payload::Number(w) => Payload::Number(w),
            Payload::Unprepared { oid, count } => Payload::Unprepared { oid, count },
            Payload::Object(r) => Payload::Object(r),
            Payload::Gate(p) => Payload::Gate(p),
        };
        Key {
            kind: self.kind,
            perms: self.perms,
            flags: self.flags - KeyFlags::HAZARD,
            guard: self.guard,
            payload,
        }
    }

    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn set_perms(&mut self, perms: KeyPerms) {
        self.perms = perms;
    }

    pub(crate) fn set_guard(&mut self, guard: Guard) {
        self.guard = guard;
    }

    pub(crate) fn insert_flags(&mut self, flags: KeyFlags) {
        self.flags |= flags;
    }

    pub(crate) fn remove_flags(&mut self, flags: KeyFlags) {
        self.flags -= flags;
    }

    /// Become prepared, pointing at a resident object
    pub(crate) fn bind_object(&mut self, obj: ObjRef) {
        self.payload = Payload::Object(obj);
        self.flags |= KeyFlags::PREPARED;
    }

    /// Become prepared, pointing at a process
    pub(crate) fn bind_process(&mut self, process: ProcessRef) {
        self.payload = Payload::Gate(process);
        self.flags |= KeyFlags::PREPARED;
    }

    /// Become unprepared, recording identity and count
    pub(crate) fn unbind(&mut self, oid: Oid, count: ObCount) {
        self.payload = Payload::Unprepared { oid, count };
        self.flags -= KeyFlags::PREPARED;
    }

    /// Overwrite with a prepared Void key
    pub(crate) fn make_void(&mut self) {
        *self = Key::void();
        self.flags = KeyFlags::PREPARED;
    }

    /// Prepared key to `obj`, built by the kernel rather than copied
    pub(crate) fn prepared_object(kind: KeyType, obj: ObjRef, perms: KeyPerms, guard: Guard) -> Key {
        Key {
            kind,
            perms,
            flags: KeyFlags::PREPARED,
            guard,
            payload: Payload::Object(obj),
        }
    }
}

impl Default for Key {
    fn default() -> Self {
        Key::void()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("Key");
        d.field("kind", &self.kind);
        if !self.perms.is_empty() {
            d.field("perms", &self.perms);
        }
        if !self.flags.is_empty() {
            d.field("flags", &self.flags);
        }
        if self.guard != Guard::NONE {
            d.field("guard", &self.guard);
        }
        match &self.payload {
            Payload::None => {}
            Payload::Number(w) => {
                d.field("words", w);
            }
            Payload::Unprepared { oid, count } => {
                d.field("oid", oid).field("count", count);
            }
            Payload::Object(r) => {
                d.field("object", r);
            }
            Payload::Gate(p) => {
                d.field("process", p);
            }
        }
        d.finish()
    }
}
