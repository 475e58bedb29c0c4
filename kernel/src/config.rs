//! Kernel configuration
//!
//! Compile-time constants describing node and GPT geometry, plus the
//! runtime [`KernelConfig`] chosen when a [`Kernel`](crate::Kernel) is built.

use static_assertions::const_assert;
use thiserror::Error;

/// Number of key slots in every node
pub const NODE_SLOTS: usize = 32;

/// Number of addressable slots in a node used as a GPT
pub const GPT_SLOTS: usize = 16;

/// log2 of [`GPT_SLOTS`]
pub const GPT_LG_SLOTS: u32 = 4;

/// Slot holding the keeper key of a GPT that declares one
pub const GPT_KEEPER_SLOT: usize = 15;

/// Slot holding the background key of a GPT that declares one
pub const GPT_BACKGROUND_SLOT: usize = 14;

/// Window control-word slot value naming the background slot of the nearest
/// background-declaring ancestor
pub const WINDOW_BACKGROUND: u8 = 0xff;

/// log2 of the page size
pub const PAGE_L2V: u32 = 12;

/// Page size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_L2V;

/// Largest valid GPT l2v
pub const MAX_L2V: u32 = 63;

/// Default bound on segment walk steps
pub const MAX_SEG_DEPTH: u32 = 20;

/// Process root slot holding the schedule key
pub const PROC_SCHED: usize = 0;

/// Process root slot holding the process keeper
pub const PROC_KEEPER: usize = 1;

/// Process root slot holding the address space key
pub const PROC_ADDR_SPACE: usize = 2;

/// Process root slot holding the node of key registers
pub const PROC_GEN_KEYS: usize = 3;

/// Number of key registers of a process
pub const KEY_REGS: usize = NODE_SLOTS;

/// Kernel-owned key slots used while building invocations
pub const INVOCATION_SLOTS: usize = 4;

// Compile-time geometry checks
const_assert!(GPT_BACKGROUND_SLOT < GPT_KEEPER_SLOT);
const_assert!(GPT_KEEPER_SLOT < GPT_SLOTS);
const_assert!(GPT_SLOTS <= NODE_SLOTS);
const_assert!(1 << GPT_LG_SLOTS == GPT_SLOTS);
const_assert!((WINDOW_BACKGROUND as usize) >= GPT_SLOTS);
const_assert!(PROC_GEN_KEYS < NODE_SLOTS);

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("paging geometry has no levels")]
    NoLevels,

    #[error("entry span {span} at level {level} does not shrink")]
    SpanNotDecreasing { level: usize, span: u32 },

    #[error("last level must map pages (span {span}, expected 12)")]
    LeafNotPage { span: u32 },

    #[error("top-level span {span} exceeds 64 bits")]
    TopTooWide { span: u32 },

    #[error("segment depth bound must be positive")]
    ZeroDepth,

    #[error("dependency table must have at least one bucket and one entry per bucket")]
    EmptyDependTable,
}

/// Shape of the hardware translation tree
///
/// Level 0 is the top-level table the process points at. Every entry at
/// level `i` spans `1 << entry_l2[i]` bytes; the table at level 0 spans
/// `1 << top_l2` bytes and the table at level `i > 0` spans the entry span
/// of its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingGeometry {
    /// log2 of the bytes covered by the top-level table
    pub top_l2: u32,
    /// log2 of the bytes covered by one entry, per level
    pub entry_l2: &'static [u32],
    /// First user address that is never translated
    pub user_limit: u64,
}

impl PagingGeometry {
    /// Two-level tree with 4 MiB directory entries (classic 32-bit layout)
    pub const TWO_LEVEL_32: Self = Self {
        top_l2: 32,
        entry_l2: &[22, 12],
        user_limit: 0xC000_0000,
    };

    /// Four-level tree with 512-entry tables (48-bit layout)
    pub const FOUR_LEVEL_48: Self = Self {
        top_l2: 48,
        entry_l2: &[39, 30, 21, 12],
        user_limit: 1 << 47,
    };

    /// Number of table levels
    pub fn levels(&self) -> usize {
        self.entry_l2.len()
    }

    /// log2 of the bytes covered by a table at `level`
    pub fn table_l2(&self, level: usize) -> u32 {
        if level == 0 {
            self.top_l2
        } else {
            self.entry_l2[level - 1]
        }
    }

    /// log2 of the bytes covered by one entry of a table at `level`
    pub fn entry_span_l2(&self, level: usize) -> u32 {
        self.entry_l2[level]
    }

    /// Number of entries in a table at `level`
    pub fn entries(&self, level: usize) -> usize {
        1usize << (self.table_l2(level) - self.entry_l2[level])
    }

    /// Index of `va` in a table at `level`
    pub fn index(&self, level: usize, va: u64) -> usize {
        let shifted = va >> self.entry_l2[level];
        (shifted as usize) & (self.entries(level) - 1)
    }

    /// Check the geometry is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(&leaf) = self.entry_l2.last() else {
            return Err(ConfigError::NoLevels);
        };
        if self.top_l2 > 64 {
            return Err(ConfigError::TopTooWide { span: self.top_l2 });
        }
        let mut above = self.top_l2;
        for (level, &span) in self.entry_l2.iter().enumerate() {
            if span >= above {
                return Err(ConfigError::SpanNotDecreasing { level, span });
            }
            above = span;
        }
        if leaf != PAGE_L2V {
            return Err(ConfigError::LeafNotPage { span: leaf });
        }
        Ok(())
    }
}

impl Default for PagingGeometry {
    fn default() -> Self {
        Self::TWO_LEVEL_32
    }
}

/// Runtime kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Bound on walk steps before `TraverseLimit`
    pub max_seg_depth: u32,
    /// Hardware translation tree shape
    pub paging: PagingGeometry,
    /// Number of dependency table buckets
    pub depend_buckets: usize,
    /// Entries per dependency table bucket
    pub depend_bucket_size: usize,
}

impl KernelConfig {
    /// Check every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_seg_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.depend_buckets == 0 || self.depend_bucket_size == 0 {
            return Err(ConfigError::EmptyDependTable);
        }
        self.paging.validate()
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_seg_depth: MAX_SEG_DEPTH,
            paging: PagingGeometry::default(),
            depend_buckets: 256,
            depend_bucket_size: 33,
        }
    }
}
