//! Object lifecycle: transactions, eviction and rescind

use alloc::vec::Vec;

use super::header::{ObjRef, ObjectBody, Oid};
use super::keyring::RingOwner;
use crate::platform::{ObjectImage, Platform};
use crate::kernel::Kernel;

impl<P: Platform> Kernel<P> {
    /// Start a new kernel transaction; earlier pins lapse
    pub fn begin_transaction(&mut self) -> u64 {
        self.transaction += 1;
        self.transaction
    }

    /// Keep `obj` resident until the current transaction ends
    pub(crate) fn pin(&mut self, obj: ObjRef) {
        let t = self.transaction;
        self.header_mut(obj).trans_pin = t;
    }

    pub fn is_pinned(&self, obj: ObjRef) -> bool {
        self.objects
            .get(obj)
            .is_some_and(|h| h.trans_pin == self.transaction)
    }

    /// Drop `oid` from the cache, writing it back if dirty
    ///
    /// Returns `false` when the object is pinned by the current transaction.
    pub fn evict(&mut self, oid: Oid) -> bool {
        let Some(obj) = self.objects.lookup(oid) else {
            return true;
        };
        if self.is_pinned(obj) {
            log::debug!("evict {:?}: pinned", oid);
            return false;
        }

        self.node_deprepare(obj);
        if self.header(obj).node().is_some() {
            self.node_unprepare_slots(obj);
        }
        self.release_products(obj);

        let Some(header) = self.objects.remove(obj) else {
            return true;
        };
        let dirty = header.is_dirty();
        let image = match header.body {
            ObjectBody::Node(body) => ObjectImage::Node {
                alloc_count: header.alloc_count,
                call_count: header.call_count,
                node_data: body.node_data,
                slots: body.slots.iter().map(|k| k.duplicate()).collect::<Vec<_>>(),
            },
            ObjectBody::Page { frame } => {
                self.platform.release_frame(frame);
                ObjectImage::Page {
                    alloc_count: header.alloc_count,
                }
            }
        };
        if dirty {
            self.platform.write_back(oid, image);
        }
        log::trace!("evicted {:?}", oid);
        true
    }

    /// Invalidate every existing key to `oid`
    ///
    /// The allocation count moves on so stored keys become stale, keys
    /// currently prepared become Void, and node contents are cleared.
    pub fn rescind_object(&mut self, oid: Oid) -> bool {
        let Some(obj) = self.objects.lookup(oid) else {
            return false;
        };
        {
            let header = self.header_mut(obj);
            header.alloc_count = header.alloc_count.wrapping_add(1);
            header.make_dirty();
        }
        self.rescind_all(RingOwner::Object(obj));
        if let Some(p) = self.header(obj).context {
            self.rescind_all(RingOwner::Process(p));
        }
        self.node_unprepare(obj);
        if self.header(obj).node().is_some() {
            self.node_clear(obj);
        }
        log::debug!("rescinded {:?}", oid);
        true
    }
}
