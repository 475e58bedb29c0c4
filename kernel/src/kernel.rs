//! Kernel context
//!
//! [`Kernel`] owns all translation state: the resident object cache, loaded
//! processes, mapping tables, the dependency tracker and the kernel
//! invocation slots. Operations are grouped by concern in `impl Kernel`
//! blocks across the crate (`objects::prep`, `segwalk`, `fault`, ...).
//!
//! The kernel is single-threaded and cooperative: no operation holds state
//! across a [`Restart`](crate::Restart).

use alloc::boxed::Box;

use crate::config::{ConfigError, KernelConfig, INVOCATION_SLOTS};
use crate::depend::{DependencyTracker, KeyDependTable};
use crate::memory::MapTables;
use crate::objects::{Key, ObjRef, ObjectCache, ObjectHeader, Oid, SlotId};
use crate::platform::Platform;
use crate::process::{Process, ProcessRef, ProcessTable};
use crate::stats::KernStats;

/// Address-space translation engine
pub struct Kernel<P: Platform> {
    pub(crate) objects: ObjectCache,
    pub(crate) procs: ProcessTable,
    pub(crate) maps: MapTables,
    /// Kernel-owned key slots used while building invocations
    pub(crate) inv: [Key; INVOCATION_SLOTS],
    pub(crate) depend: Box<dyn DependencyTracker>,
    pub(crate) platform: P,
    pub(crate) config: KernelConfig,
    pub(crate) stats: KernStats,
    /// Current transaction; objects pinned with this value stay resident
    pub(crate) transaction: u64,
}

impl<P: Platform> Kernel<P> {
    /// Build a kernel with the bucketed dependency table sized by `config`
    pub fn new(config: KernelConfig, platform: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let depend = KeyDependTable::new(config.depend_buckets, config.depend_bucket_size);
        Self::with_tracker(config, platform, Box::new(depend))
    }

    /// Build a kernel with a caller-supplied dependency tracker
    pub fn with_tracker(
        config: KernelConfig,
        platform: P,
        depend: Box<dyn DependencyTracker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        log::info!(
            "keyspace: {} paging levels, depth bound {}",
            config.paging.levels(),
            config.max_seg_depth
        );
        Ok(Self {
            objects: ObjectCache::new(),
            procs: ProcessTable::new(),
            maps: MapTables::new(),
            inv: core::array::from_fn(|_| Key::void()),
            depend,
            platform,
            config,
            stats: KernStats::default(),
            transaction: 1,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn stats(&self) -> &KernStats {
        &self.stats
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn objects(&self) -> &ObjectCache {
        &self.objects
    }

    pub fn maps(&self) -> &MapTables {
        &self.maps
    }

    pub fn depend(&self) -> &dyn DependencyTracker {
        self.depend.as_ref()
    }

    /// Resident object with identity `oid`
    pub fn lookup(&self, oid: Oid) -> Option<ObjRef> {
        self.objects.lookup(oid)
    }

    pub fn object(&self, obj: ObjRef) -> Option<&ObjectHeader> {
        self.objects.get(obj)
    }

    pub fn process(&self, process: ProcessRef) -> Option<&Process> {
        self.procs.get(process)
    }

    /// Key held in `slot`, if the slot exists
    pub fn key(&self, slot: SlotId) -> Option<&Key> {
        match slot {
            SlotId::Node { node, slot } => self.objects.get(node)?.node()?.slot(slot as usize),
            SlotId::Register { process, reg } => self.procs.get(process)?.key_regs.get(reg as usize),
            SlotId::Invocation(i) => self.inv.get(i as usize),
        }
    }

    pub(crate) fn key_mut(&mut self, slot: SlotId) -> Option<&mut Key> {
        match slot {
            SlotId::Node { node, slot } => self
                .objects
                .get_mut(node)?
                .node_mut()?
                .slots
                .get_mut(slot as usize),
            SlotId::Register { process, reg } => {
                self.procs.get_mut(process)?.key_regs.get_mut(reg as usize)
            }
            SlotId::Invocation(i) => self.inv.get_mut(i as usize),
        }
    }

    /// Key in `slot`, which must exist
    pub(crate) fn key_ref(&self, slot: SlotId) -> &Key {
        match self.key(slot) {
            Some(k) => k,
            None => fatal!("no key slot {:?}", slot),
        }
    }

    pub(crate) fn key_ref_mut(&mut self, slot: SlotId) -> &mut Key {
        match self.key_mut(slot) {
            Some(k) => k,
            None => fatal!("no key slot {:?}", slot),
        }
    }

    pub(crate) fn header(&self, obj: ObjRef) -> &ObjectHeader {
        match self.objects.get(obj) {
            Some(h) => h,
            None => fatal!("stale object reference {:?}", obj),
        }
    }

    pub(crate) fn header_mut(&mut self, obj: ObjRef) -> &mut ObjectHeader {
        match self.objects.get_mut(obj) {
            Some(h) => h,
            None => fatal!("stale object reference {:?}", obj),
        }
    }
}
