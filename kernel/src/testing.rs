//! In-memory collaborators for tests and benchmarks
//!
//! [`MemStore`] holds object images, [`MockPlatform`] records every call the
//! kernel makes to its environment, and [`SpaceBuilder`] assembles GPT trees
//! and processes without spelling out slot layouts by hand.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config::{
    KernelConfig, GPT_BACKGROUND_SLOT, GPT_KEEPER_SLOT, NODE_SLOTS, PROC_ADDR_SPACE,
};
use crate::error::{Restart, RestartReason, Step};
use crate::kernel::Kernel;
use crate::memory::TableRef;
use crate::objects::gpt::{GPT_BACKGROUND, GPT_KEEPER, GPT_SEND_NODE};
use crate::objects::{FrameNumber, Key, ObCount, Oid};
use crate::platform::{
    FrameAllocator, KeeperCall, KeeperTransport, ObjectImage, ObjectKind, ObjectStore, Scheduler,
    StallQueue, Tlb,
};

fn copy_image(image: &ObjectImage) -> ObjectImage {
    match image {
        ObjectImage::Node {
            alloc_count,
            call_count,
            node_data,
            slots,
        } => ObjectImage::Node {
            alloc_count: *alloc_count,
            call_count: *call_count,
            node_data: *node_data,
            slots: slots.iter().map(|k| k.duplicate()).collect(),
        },
        ObjectImage::Page { alloc_count } => ObjectImage::Page {
            alloc_count: *alloc_count,
        },
    }
}

/// Object store backed by a map of images
#[derive(Default)]
pub struct MemStore {
    objects: BTreeMap<Oid, ObjectImage>,
    /// Fetches still to be answered with a restart
    delayed: usize,
    fetches: usize,
    written: Vec<Oid>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, oid: Oid, alloc_count: ObCount) {
        self.objects.insert(oid, ObjectImage::Page { alloc_count });
    }

    pub fn add_node(&mut self, oid: Oid, alloc_count: ObCount) {
        let slots = (0..NODE_SLOTS).map(|_| Key::void()).collect();
        self.objects.insert(
            oid,
            ObjectImage::Node {
                alloc_count,
                call_count: 0,
                node_data: 0,
                slots,
            },
        );
    }

    /// Store `key` in slot `slot` of node `oid`
    ///
    /// Panics if `oid` is not a node.
    pub fn set_slot(&mut self, oid: Oid, slot: usize, key: Key) {
        match self.objects.get_mut(&oid) {
            Some(ObjectImage::Node { slots, .. }) => slots[slot] = key,
            _ => panic!("{:?} is not a stored node", oid),
        }
    }

    pub fn set_node_data(&mut self, oid: Oid, data: u16) {
        match self.objects.get_mut(&oid) {
            Some(ObjectImage::Node { node_data, .. }) => *node_data = data,
            _ => panic!("{:?} is not a stored node", oid),
        }
    }

    pub fn node_data(&self, oid: Oid) -> Option<u16> {
        match self.objects.get(&oid)? {
            ObjectImage::Node { node_data, .. } => Some(*node_data),
            ObjectImage::Page { .. } => None,
        }
    }

    pub fn remove(&mut self, oid: Oid) {
        self.objects.remove(&oid);
    }

    /// Answer the next `n` fetches with a restart, as if waiting for I/O
    pub fn delay_fetches(&mut self, n: usize) {
        self.delayed = n;
    }

    /// Number of fetches answered with an image
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    /// Objects written back, in order
    pub fn written_back(&self) -> &[Oid] {
        &self.written
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.contains_key(&oid)
    }
}

impl ObjectStore for MemStore {
    fn resolve(&mut self, oid: Oid, kind: ObjectKind) -> Step<Option<ObjectImage>> {
        if self.delayed > 0 {
            self.delayed -= 1;
            return Err(Restart::new(RestartReason::ObjectFetch(oid)));
        }
        let Some(image) = self.objects.get(&oid) else {
            return Ok(None);
        };
        if image.kind() != kind {
            return Ok(None);
        }
        self.fetches += 1;
        Ok(Some(copy_image(image)))
    }

    fn write_back(&mut self, oid: Oid, image: ObjectImage) {
        self.written.push(oid);
        self.objects.insert(oid, image);
    }
}

/// Recording platform around a [`MemStore`]
#[derive(Default)]
pub struct MockPlatform {
    pub store: MemStore,
    next_frame: u64,
    free_frames: Vec<FrameNumber>,
    in_use: usize,
    frame_limit: Option<usize>,
    pub keeper_calls: Vec<KeeperCall>,
    pub sleeps: Vec<StallQueue>,
    pub wakes: Vec<StallQueue>,
    pub yields: usize,
    pub entry_flushes: Vec<(TableRef, usize)>,
    pub full_flushes: usize,
}

impl MockPlatform {
    pub fn new(store: MemStore) -> Self {
        Self {
            store,
            next_frame: 0x100,
            ..Self::default()
        }
    }

    pub fn frames_in_use(&self) -> usize {
        self.in_use
    }

    /// Refuse allocations beyond `limit` frames in use
    pub fn set_frame_limit(&mut self, limit: Option<usize>) {
        self.frame_limit = limit;
    }

    pub fn keeper_calls(&self) -> &[KeeperCall] {
        &self.keeper_calls
    }
}

impl ObjectStore for MockPlatform {
    fn resolve(&mut self, oid: Oid, kind: ObjectKind) -> Step<Option<ObjectImage>> {
        self.store.resolve(oid, kind)
    }

    fn write_back(&mut self, oid: Oid, image: ObjectImage) {
        self.store.write_back(oid, image)
    }
}

impl FrameAllocator for MockPlatform {
    fn allocate_frame(&mut self) -> Step<FrameNumber> {
        if self.frame_limit.is_some_and(|l| self.in_use >= l) {
            return Err(Restart::new(RestartReason::FrameAllocation));
        }
        let frame = match self.free_frames.pop() {
            Some(f) => f,
            None => {
                self.next_frame += 1;
                FrameNumber(self.next_frame)
            }
        };
        self.in_use += 1;
        Ok(frame)
    }

    fn release_frame(&mut self, frame: FrameNumber) {
        self.in_use -= 1;
        self.free_frames.push(frame);
    }
}

impl Scheduler for MockPlatform {
    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn sleep_on(&mut self, queue: StallQueue) {
        self.sleeps.push(queue);
    }

    fn wake(&mut self, queue: StallQueue) {
        self.wakes.push(queue);
    }
}

impl KeeperTransport for MockPlatform {
    fn invoke(&mut self, call: &KeeperCall) {
        self.keeper_calls.push(call.clone());
    }
}

impl Tlb for MockPlatform {
    fn flush_entry(&mut self, table: TableRef, index: usize) {
        self.entry_flushes.push((table, index));
    }

    fn flush_all(&mut self) {
        self.full_flushes += 1;
    }
}

/// Kernel with the default configuration over `store`
pub fn test_kernel(store: MemStore) -> Kernel<MockPlatform> {
    test_kernel_with(KernelConfig::default(), store)
}

pub fn test_kernel_with(config: KernelConfig, store: MemStore) -> Kernel<MockPlatform> {
    match Kernel::new(config, MockPlatform::new(store)) {
        Ok(k) => k,
        Err(e) => panic!("test configuration rejected: {}", e),
    }
}

/// Assembles address spaces in a [`MemStore`]
pub struct SpaceBuilder {
    store: MemStore,
    next_oid: u64,
}

impl Default for SpaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceBuilder {
    pub fn new() -> Self {
        Self {
            store: MemStore::new(),
            next_oid: 0x1000,
        }
    }

    fn next(&mut self) -> Oid {
        self.next_oid += 1;
        Oid(self.next_oid)
    }

    pub fn page(&mut self) -> Oid {
        let oid = self.next();
        self.store.add_page(oid, 0);
        oid
    }

    pub fn node(&mut self) -> Oid {
        let oid = self.next();
        self.store.add_node(oid, 0);
        oid
    }

    /// Empty GPT whose slots each span `1 << l2v` bytes
    pub fn gpt(&mut self, l2v: u32) -> Oid {
        let oid = self.node();
        self.store.set_node_data(oid, l2v as u16);
        oid
    }

    pub fn set(&mut self, node: Oid, slot: usize, key: Key) {
        self.store.set_slot(node, slot, key);
    }

    /// Give `gpt` a keeper: a start key to the process rooted at `keeper`
    pub fn set_keeper(&mut self, gpt: Oid, keeper: Oid, send_node: bool) {
        self.store.set_slot(gpt, GPT_KEEPER_SLOT, Key::start(keeper, 0));
        let mut data = self.store.node_data(gpt).unwrap_or(0) | GPT_KEEPER;
        if send_node {
            data |= GPT_SEND_NODE;
        }
        self.store.set_node_data(gpt, data);
    }

    pub fn set_background(&mut self, gpt: Oid, key: Key) {
        self.store.set_slot(gpt, GPT_BACKGROUND_SLOT, key);
        let data = self.store.node_data(gpt).unwrap_or(0) | GPT_BACKGROUND;
        self.store.set_node_data(gpt, data);
    }

    /// Process root for a keeper; returns its OID
    pub fn keeper_process(&mut self) -> Oid {
        self.node()
    }

    /// Process root whose address space is `space`
    pub fn process(&mut self, space: Key) -> Oid {
        let root = self.node();
        self.store.set_slot(root, PROC_ADDR_SPACE, space);
        root
    }

    pub fn store(&mut self) -> &mut MemStore {
        &mut self.store
    }

    pub fn kernel(self) -> Kernel<MockPlatform> {
        test_kernel(self.store)
    }

    pub fn kernel_with(self, config: KernelConfig) -> Kernel<MockPlatform> {
        test_kernel_with(config, self.store)
    }
}
