//! Hardware mapping tables
//!
//! Architecture-neutral model of the page-table tree the fault handler
//! builds. Each [`MapTable`] is the *product* of the GPT it was derived from
//! and is shared by every process whose space reaches that GPT with the same
//! parameters.
//!
//! ## Design
//!
//! Tables live in an arena. Entries and process map roots refer to tables by
//! [`TableRef`]; a reference to a destroyed table no longer resolves and is
//! read as an invalid entry.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Step;
use crate::kernel::Kernel;
use crate::objects::arena::{Arena, RawHandle};
use crate::objects::{FrameNumber, ObjRef};
use crate::platform::Platform;
use crate::process::ProcessRef;

/// Weak reference to a mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef(RawHandle);

impl TableRef {
    pub(crate) fn raw(&self) -> RawHandle {
        self.0
    }
}

/// One hardware table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pte {
    #[default]
    Invalid,
    /// Being built by a fault in progress
    InProgress,
    /// Invalidated while a fault was building it
    Zapped,
    /// Next-level table
    Table { table: TableRef, writable: bool },
    /// Leaf mapping
    Page { frame: FrameNumber, writable: bool },
}

impl Pte {
    pub fn is_valid(&self) -> bool {
        matches!(self, Pte::Table { .. } | Pte::Page { .. })
    }
}

/// Hardware location a dependency entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PteLoc {
    /// The process's top-level table pointer
    Root(ProcessRef),
    /// Entry `index` of a mapping table
    Entry { table: TableRef, index: usize },
}

/// Top-level translation state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapRoot {
    #[default]
    None,
    InProgress,
    Zapped,
    Table(TableRef),
}

/// A mapping table and the parameters it was produced under
#[derive(Debug)]
pub struct MapTable {
    /// Level in the paging geometry (0 is the top)
    pub level: usize,
    /// GPT this table translates
    pub producer: ObjRef,
    /// Which span-sized block of the producer this table covers
    pub index: u64,
    /// Built under read-only restrictions
    pub read_only: bool,
    /// Background GPT in effect when the table was built
    pub background: Option<ObjRef>,
    pub frame: FrameNumber,
    pub(crate) entries: Vec<Pte>,
}

impl MapTable {
    pub fn entry(&self, index: usize) -> Option<Pte> {
        self.entries.get(index).copied()
    }

    pub fn entries(&self) -> &[Pte] {
        &self.entries
    }
}

/// All live mapping tables
#[derive(Default)]
pub struct MapTables {
    arena: Arena<MapTable>,
}

impl MapTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: TableRef) -> Option<&MapTable> {
        self.arena.get(table.0)
    }

    pub(crate) fn get_mut(&mut self, table: TableRef) -> Option<&mut MapTable> {
        self.arena.get_mut(table.0)
    }

    pub(crate) fn insert(&mut self, table: MapTable) -> TableRef {
        TableRef(self.arena.insert(table))
    }

    pub(crate) fn remove(&mut self, table: TableRef) -> Option<MapTable> {
        self.arena.remove(table.0)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl<P: Platform> Kernel<P> {
    /// Existing product of `producer` with matching parameters
    pub(crate) fn find_product(
        &self,
        producer: ObjRef,
        level: usize,
        index: u64,
        read_only: bool,
        background: Option<ObjRef>,
    ) -> Option<TableRef> {
        let header = self.objects.get(producer)?;
        header.products.iter().copied().find(|&t| {
            self.maps.get(t).is_some_and(|m| {
                m.level == level
                    && m.index == index
                    && m.read_only == read_only
                    && m.background == background
            })
        })
    }

    /// Allocate an empty table at `level` and record it as a product
    pub(crate) fn make_new_table(
        &mut self,
        producer: ObjRef,
        level: usize,
        index: u64,
        read_only: bool,
        background: Option<ObjRef>,
    ) -> Step<TableRef> {
        let frame = self.platform.allocate_frame()?;
        let entries = vec![Pte::Invalid; self.config.paging.entries(level)];
        let table = self.maps.insert(MapTable {
            level,
            producer,
            index,
            read_only,
            background,
            frame,
            entries,
        });
        match self.objects.get_mut(producer) {
            Some(header) => header.products.push(table),
            None => fatal!("product for a non-resident producer"),
        }
        self.stats.n_products += 1;
        log::debug!(
            "new level {} table {:?} for {:?} (index {:#x}, ro {})",
            level,
            table,
            producer,
            index,
            read_only
        );
        Ok(table)
    }

    /// Current value of a table entry; entries of destroyed tables read as
    /// `None`
    pub fn pte(&self, table: TableRef, index: usize) -> Option<Pte> {
        self.maps.get(table)?.entry(index)
    }

    pub(crate) fn set_pte(&mut self, table: TableRef, index: usize, pte: Pte) {
        if let Some(m) = self.maps.get_mut(table) {
            if let Some(e) = m.entries.get_mut(index) {
                *e = pte;
            }
        }
    }

    /// Entry that still points at a live table
    pub(crate) fn live_table_entry(&self, table: TableRef, index: usize) -> Option<(TableRef, bool)> {
        match self.pte(table, index)? {
            Pte::Table { table: next, writable } if self.maps.get(next).is_some() => {
                Some((next, writable))
            }
            _ => None,
        }
    }

    /// Invalidate `count` locations starting at `loc`
    ///
    /// Entries become `Zapped`, so a fault building them notices; the TLB
    /// forgets them. Locations whose table or process is gone are skipped.
    pub(crate) fn zap_locations(&mut self, loc: PteLoc, count: usize) {
        match loc {
            PteLoc::Root(process) => {
                if let Some(p) = self.procs.get_mut(process) {
                    if matches!(p.map_root, MapRoot::Table(_) | MapRoot::InProgress) {
                        p.map_root = MapRoot::Zapped;
                    }
                }
                self.platform.flush_all();
            }
            PteLoc::Entry { table, index } => {
                let Some(m) = self.maps.get_mut(table) else {
                    return;
                };
                let end = (index + count).min(m.entries.len());
                for i in index..end {
                    m.entries[i] = Pte::Zapped;
                }
                for i in index..end {
                    self.platform.flush_entry(table, i);
                }
            }
        }
    }

    /// Destroy every table produced by `node`
    ///
    /// References to the destroyed tables stop resolving; the TLB is flushed
    /// once.
    pub(crate) fn release_products(&mut self, node: ObjRef) {
        self.unmap_all(node);
        let products = match self.objects.get_mut(node) {
            Some(h) => core::mem::take(&mut h.products),
            None => return,
        };
        if products.is_empty() {
            return;
        }
        for t in products {
            if let Some(m) = self.maps.remove(t) {
                self.platform.release_frame(m.frame);
            }
        }
        self.platform.flush_all();
    }
}
