// SPDX-License-Identifier: MPL-2.0

//! Per-command trackers and the per-queue tracker pool.
//!
//! Each in-flight command borrows one [`Tracker`]: a 4 KiB record in
//! physically contiguous DMA memory whose tail holds the PRP list or
//! SGL segment the device fetches through the command's data pointer.
//! The record is exactly one page and page-aligned, so the descriptor
//! area can never straddle a page boundary.

use alloc::{boxed::Box, sync::Arc};
use core::mem::{offset_of, size_of};

use crate::{
    error::Result,
    nvme_cmd::SglDescriptor,
    platform::{DmaChunk, PAGE_SIZE, Platform},
    request::NvmeRequest,
    MAX_PRP_LIST_ENTRIES, MAX_SGL_DESCRIPTORS,
};

/// End-of-list sentinel for the intrusive index links.
pub(crate) const NIL: u16 = u16::MAX;

/// The descriptor area embedded in a tracker.
///
/// The same 4048 bytes back either a PRP list or an SGL segment; the
/// typed view is chosen per request. The area is qword-aligned by
/// construction.
#[repr(C)]
pub(crate) struct DescriptorArea {
    prp: [u64; MAX_PRP_LIST_ENTRIES],
}

impl DescriptorArea {
    #[cfg(test)]
    pub(crate) fn prp(&self) -> &[u64; MAX_PRP_LIST_ENTRIES] {
        &self.prp
    }

    pub(crate) fn prp_mut(&mut self) -> &mut [u64; MAX_PRP_LIST_ENTRIES] {
        &mut self.prp
    }

    #[cfg(test)]
    pub(crate) fn sgl(&self) -> &[SglDescriptor; MAX_SGL_DESCRIPTORS] {
        // SAFETY: both views cover the same 4048-byte, 8-byte-aligned
        // area, and `SglDescriptor` is plain old data for which any bit
        // pattern is valid.
        unsafe { &*self.prp.as_ptr().cast() }
    }

    pub(crate) fn sgl_mut(&mut self) -> &mut [SglDescriptor; MAX_SGL_DESCRIPTORS] {
        // SAFETY: as in `sgl`; the mutable borrow of `self` guarantees
        // exclusive access to the area.
        unsafe { &mut *self.prp.as_mut_ptr().cast() }
    }
}

/// Host-side record of one in-flight command.
#[repr(C, align(4096))]
pub(crate) struct Tracker {
    /// The owning request while the command is in flight.
    pub(crate) request: Option<Box<NvmeRequest>>,
    /// Intrusive free/outstanding list links.
    next: u16,
    prev: u16,
    /// Command identifier; equal to this tracker's index in the pool.
    pub(crate) cid: u16,
    /// Set while the command sits in the hardware queue.
    pub(crate) active: bool,
    /// Bus address of `descs`, placed in PRP2 or SGL1 when the
    /// transfer needs the embedded list.
    pub(crate) prp_sgl_bus_addr: u64,
    pub(crate) descs: DescriptorArea,
}

// The tracker must stay exactly one page so that the descriptor area
// never crosses a page boundary and pool indexing stays shift-free.
const _: () = assert!(size_of::<Tracker>() == PAGE_SIZE);
const _: () = assert!(offset_of!(Tracker, descs) % 8 == 0);
const _: () = assert!(offset_of!(Tracker, descs) + size_of::<DescriptorArea>() <= PAGE_SIZE);
const _: () = assert!(size_of::<DescriptorArea>() == MAX_SGL_DESCRIPTORS * 16);

impl Tracker {
    /// Splits the tracker into the pieces a PRP/SGL builder needs:
    /// the owning request, the descriptor area, and its bus address.
    pub(crate) fn split_for_build(
        &mut self,
    ) -> Option<(&mut NvmeRequest, &mut DescriptorArea, u64)> {
        let Tracker {
            request,
            descs,
            prp_sgl_bus_addr,
            ..
        } = self;
        Some((request.as_deref_mut()?, descs, *prp_sgl_bus_addr))
    }
}

/// Fixed-size pool of trackers backed by one physically contiguous DMA
/// block of `count * 4096` bytes.
///
/// Every tracker is on exactly one of two intrusive lists: the free
/// list, or the outstanding list while its command is in flight.
/// Acquire and release are O(1).
pub(crate) struct TrackerPool {
    platform: Arc<dyn Platform>,
    chunk: DmaChunk,
    count: u16,
    free_head: u16,
    outstanding_head: u16,
}

impl TrackerPool {
    pub(crate) fn new(platform: Arc<dyn Platform>, count: u16) -> Result<Self> {
        let chunk = platform.dma_alloc(count as usize * size_of::<Tracker>(), PAGE_SIZE)?;

        let mut pool = Self {
            platform,
            chunk,
            count,
            free_head: NIL,
            outstanding_head: NIL,
        };

        // Initialize back to front so the free list pops cid 0 first.
        for i in (0..count).rev() {
            let bus_addr = chunk.phys + i as u64 * size_of::<Tracker>() as u64
                + offset_of!(Tracker, descs) as u64;
            let tracker = Tracker {
                request: None,
                next: NIL,
                prev: NIL,
                cid: i,
                active: false,
                prp_sgl_bus_addr: bus_addr,
                descs: DescriptorArea {
                    prp: [0; MAX_PRP_LIST_ENTRIES],
                },
            };
            // SAFETY: slot `i` lies within the freshly allocated chunk,
            // is page-aligned, and is written exactly once before any
            // read.
            unsafe { pool.tracker_ptr(i).write(tracker) };
            pool.push_free(i);
        }

        Ok(pool)
    }

    fn tracker_ptr(&self, cid: u16) -> *mut Tracker {
        assert!(cid < self.count);
        let base = self.chunk.virt as *mut Tracker;
        // SAFETY: `cid` is in bounds, so the offset stays inside the
        // allocation.
        unsafe { base.add(cid as usize) }
    }

    pub(crate) fn get(&self, cid: u16) -> &Tracker {
        // SAFETY: all slots were initialized in `new` and the shared
        // borrow of the pool covers the returned reference.
        unsafe { &*self.tracker_ptr(cid) }
    }

    pub(crate) fn get_mut(&mut self, cid: u16) -> &mut Tracker {
        // SAFETY: as in `get`; the unique borrow of the pool makes the
        // returned reference exclusive.
        unsafe { &mut *self.tracker_ptr(cid) }
    }

    pub(crate) fn count(&self) -> u16 {
        self.count
    }

    /// Bus address of the descriptor area of tracker `cid`.
    #[cfg(test)]
    pub(crate) fn descriptor_bus_addr(&self, cid: u16) -> u64 {
        self.get(cid).prp_sgl_bus_addr
    }

    fn push_free(&mut self, cid: u16) {
        let old_head = self.free_head;
        let tracker = self.get_mut(cid);
        tracker.next = old_head;
        tracker.prev = NIL;
        self.free_head = cid;
    }

    /// Moves the head of the free list onto the outstanding list.
    pub(crate) fn acquire(&mut self) -> Option<u16> {
        let cid = self.free_head;
        if cid == NIL {
            return None;
        }
        self.free_head = self.get(cid).next;

        let old_head = self.outstanding_head;
        {
            let tracker = self.get_mut(cid);
            tracker.next = old_head;
            tracker.prev = NIL;
        }
        if old_head != NIL {
            self.get_mut(old_head).prev = cid;
        }
        self.outstanding_head = cid;
        Some(cid)
    }

    /// Detaches `cid` from the outstanding list and returns it to the
    /// free list, clearing its in-flight state.
    pub(crate) fn release(&mut self, cid: u16) {
        let (next, prev) = {
            let tracker = self.get_mut(cid);
            tracker.active = false;
            tracker.request = None;
            (tracker.next, tracker.prev)
        };
        if prev != NIL {
            self.get_mut(prev).next = next;
        } else {
            self.outstanding_head = next;
        }
        if next != NIL {
            self.get_mut(next).prev = prev;
        }
        self.push_free(cid);
    }

    pub(crate) fn outstanding_head(&self) -> Option<u16> {
        (self.outstanding_head != NIL).then_some(self.outstanding_head)
    }

    pub(crate) fn next_outstanding(&self, cid: u16) -> Option<u16> {
        let next = self.get(cid).next;
        (next != NIL).then_some(next)
    }

    pub(crate) fn has_free(&self) -> bool {
        self.free_head != NIL
    }

    pub(crate) fn outstanding_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.outstanding_head;
        while cur != NIL {
            n += 1;
            cur = self.get(cur).next;
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while cur != NIL {
            n += 1;
            cur = self.get(cur).next;
        }
        n
    }
}

impl Drop for TrackerPool {
    fn drop(&mut self) {
        for i in 0..self.count {
            // SAFETY: every slot was initialized in `new` and is
            // dropped exactly once here; this releases any request
            // still attached to a tracker.
            unsafe { core::ptr::drop_in_place(self.tracker_ptr(i)) };
        }
        self.platform.dma_free(self.chunk);
    }
}
