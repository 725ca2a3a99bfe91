// SPDX-License-Identifier: MPL-2.0

//! NVMe queue pairs and the submit/poll engine.
//!
//! A queue pair owns one submission ring, one completion ring, their
//! doorbells, and a pool of command trackers. It is single-owner state:
//! submit and poll never take a lock, and the caller is responsible for
//! confining each queue pair to one thread at a time.
//!
//! Refer to NVM Express Base Specification Revision 2.0, Section 3.3
//! (Queue Mechanism).

use alloc::{boxed::Box, collections::VecDeque, sync::Arc};
use core::{
    mem::size_of,
    ptr,
    sync::atomic::{Ordering, fence},
};

use log::error;
use ostd_pod::FromZeros;

use crate::{
    cmb::CmbRegion,
    ctrlr::{ControllerShared, QueuePriority},
    error::Result,
    nvme_cmd::{
        AdminOpcode, NvmeCommand, NvmeCompletion, StatusCodeType, completion_is_retry,
        generic_status,
    },
    platform::{DmaChunk, PAGE_SIZE},
    prp,
    request::{NvmeRequest, RequestPayload},
    tracker::TrackerPool,
};

pub(crate) const ADMIN_QUEUE_ENTRIES: u16 = 128;
const ADMIN_QUEUE_TRACKERS: u16 = 16;

/// Ring size of an I/O queue pair, subject to the controller's MQES.
///
/// Trackers bound how many commands are actually outstanding; a ring
/// larger than the tracker pool only buys a longer history when dumping
/// queue memory.
pub(crate) const IO_QUEUE_ENTRIES: u16 = 256;
const IO_QUEUE_TRACKERS: u16 = 128;

/// Which builder a payload needs.
enum BuildKind {
    Contig,
    HwSgl,
    ScatteredPrps,
}

/// An admin or I/O submission/completion queue pair.
pub struct NvmeQueuePair {
    id: u16,
    num_entries: u16,
    qprio: QueuePriority,
    shared: Arc<ControllerShared>,

    sq_virt: usize,
    sq_bus: u64,
    /// Host DMA backing of the SQ; `None` when the ring lives in the
    /// controller memory buffer.
    sq_chunk: Option<DmaChunk>,
    cq_chunk: DmaChunk,

    sq_tdbl: usize,
    cq_hdbl: usize,

    sq_tail: u16,
    cq_head: u16,
    phase: u8,
    is_enabled: bool,

    trackers: TrackerPool,
    queued: VecDeque<Box<NvmeRequest>>,
}

impl NvmeQueuePair {
    pub(crate) fn new(
        shared: Arc<ControllerShared>,
        cmb: Option<&mut CmbRegion>,
        id: u16,
        num_entries: u16,
        qprio: QueuePriority,
    ) -> Result<Self> {
        assert!(num_entries >= 2);

        // A queue of depth N completes at most N-1 commands at a time,
        // so there is no point in tracking more than that.
        let num_trackers = if id == 0 {
            ADMIN_QUEUE_TRACKERS
        } else {
            IO_QUEUE_TRACKERS.min(num_entries - 1)
        };

        let platform = shared.platform_arc();
        let sq_bytes = num_entries as usize * size_of::<NvmeCommand>();
        let cq_bytes = num_entries as usize * size_of::<NvmeCompletion>();

        let cmb_sq = match cmb {
            Some(cmb) if shared.use_cmb_sqs() && cmb.allows_sq_placement() => cmb
                .alloc(sq_bytes as u64, PAGE_SIZE as u64)
                .ok()
                .map(|offset| (cmb.virt_at(offset), cmb.phys_at(offset))),
            _ => None,
        };
        let (sq_virt, sq_bus, sq_chunk) = match cmb_sq {
            Some((virt, bus)) => (virt, bus, None),
            None => {
                let chunk = platform.dma_alloc(sq_bytes, PAGE_SIZE)?;
                (chunk.virt, chunk.phys, Some(chunk))
            }
        };

        // The completion ring always stays in host memory.
        let cq_chunk = match platform.dma_alloc(cq_bytes, PAGE_SIZE) {
            Ok(chunk) => chunk,
            Err(err) => {
                if let Some(chunk) = sq_chunk {
                    platform.dma_free(chunk);
                }
                return Err(err);
            }
        };

        let trackers = match TrackerPool::new(platform.clone(), num_trackers) {
            Ok(pool) => pool,
            Err(err) => {
                if let Some(chunk) = sq_chunk {
                    platform.dma_free(chunk);
                }
                platform.dma_free(cq_chunk);
                return Err(err);
            }
        };

        let mut qpair = Self {
            id,
            num_entries,
            qprio,
            sq_tdbl: shared.sq_doorbell(id),
            cq_hdbl: shared.cq_doorbell(id),
            shared,
            sq_virt,
            sq_bus,
            sq_chunk,
            cq_chunk,
            sq_tail: 0,
            cq_head: 0,
            phase: 1,
            is_enabled: false,
            trackers,
            queued: VecDeque::new(),
        };
        qpair.reset();
        Ok(qpair)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn num_entries(&self) -> u16 {
        self.num_entries
    }

    pub(crate) fn qprio(&self) -> QueuePriority {
        self.qprio
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    /// Bus address of the submission ring.
    pub fn sq_bus_addr(&self) -> u64 {
        self.sq_bus
    }

    /// Bus address of the completion ring.
    pub fn cq_bus_addr(&self) -> u64 {
        self.cq_chunk.phys
    }

    /// Whether the submission ring lives in the controller memory
    /// buffer.
    pub fn sq_in_cmb(&self) -> bool {
        self.sq_chunk.is_none()
    }

    fn is_admin_queue(&self) -> bool {
        self.id == 0
    }

    /// Zeroes both rings and rewinds head, tail and the expected phase.
    ///
    /// The hardware writes its first pass of completions with the phase
    /// bit set, so the expected phase starts at 1 and toggles on every
    /// completion-ring wrap.
    pub fn reset(&mut self) {
        self.sq_tail = 0;
        self.cq_head = 0;
        self.phase = 1;

        let sq_bytes = self.num_entries as usize * size_of::<NvmeCommand>();
        // SAFETY: both rings were allocated with exactly these sizes
        // and stay alive for the lifetime of the queue pair.
        unsafe {
            ptr::write_bytes(self.sq_virt as *mut u8, 0, sq_bytes);
            ptr::write_bytes(self.cq_chunk.virt as *mut u8, 0, self.cq_chunk.size);
        }
    }

    /// Marks the queue usable and flushes commands left over from
    /// before a reset.
    ///
    /// Leftover admin commands were issued against a context that no
    /// longer exists and are failed outright; leftover I/O is aborted
    /// retryable so it reenters the fresh ring.
    pub fn enable(&mut self) {
        self.is_enabled = true;
        if self.is_admin_queue() {
            self.abort_trackers(true);
        } else {
            self.abort_trackers(false);
        }
    }

    pub fn disable(&mut self) {
        self.is_enabled = false;
        if self.is_admin_queue() {
            self.abort_aers();
        }
    }

    /// Fails every outstanding command without retry.
    pub fn fail(&mut self) {
        self.abort_trackers(true);
    }

    fn check_enabled(&mut self) -> bool {
        if !self.is_enabled && !self.shared.is_resetting() {
            self.enable();
        }
        self.is_enabled
    }

    /// Submits a request, or parks it until a tracker frees up.
    ///
    /// A payload the transport cannot translate completes in-band with
    /// `INVALID_FIELD` before this returns `BadAddress`.
    pub fn submit(&mut self, mut req: Box<NvmeRequest>) -> Result<()> {
        self.check_enabled();

        if !self.trackers.has_free() || !self.is_enabled {
            // Processed when a tracker frees up via a completion or
            // when a controller-level reset finishes.
            self.queued.push_back(req);
            return Ok(());
        }
        let Some(cid) = self.trackers.acquire() else {
            self.queued.push_back(req);
            return Ok(());
        };

        req.cmd.cid = cid;
        let build = match &req.payload {
            _ if req.payload_size == 0 => None,
            RequestPayload::None => None,
            RequestPayload::Contig { .. } => Some(BuildKind::Contig),
            RequestPayload::Scatter(_) => Some(if self.shared.sgl_supported() {
                BuildKind::HwSgl
            } else {
                BuildKind::ScatteredPrps
            }),
        };
        self.trackers.get_mut(cid).request = Some(req);

        if let Some(kind) = build {
            // On failure the tracker has already been completed with
            // INVALID_FIELD; hand the error up untouched.
            self.build_request(cid, kind)?;
        }

        self.submit_tracker(cid);
        Ok(())
    }

    fn build_request(&mut self, cid: u16, kind: BuildKind) -> Result<()> {
        let shared = self.shared.clone();
        let result = {
            let tracker = self.trackers.get_mut(cid);
            match tracker.split_for_build() {
                None => Err(crate::TransportError::BadAddress),
                Some((req, descs, bus_addr)) => match kind {
                    BuildKind::Contig => {
                        prp::build_contig_request(shared.platform(), req, descs.prp_mut(), bus_addr)
                    }
                    BuildKind::HwSgl => {
                        prp::build_hw_sgl_request(shared.platform(), req, descs.sgl_mut(), bus_addr)
                    }
                    BuildKind::ScatteredPrps => prp::build_scattered_prps_request(
                        shared.platform(),
                        req,
                        descs.prp_mut(),
                        bus_addr,
                    ),
                },
            }
        };
        if result.is_err() {
            self.manual_complete_tracker(
                cid,
                StatusCodeType::Generic as u8,
                generic_status::INVALID_FIELD,
                true,
                true,
            );
        }
        result
    }

    /// Copies the tracker's command into the submission ring and rings
    /// the tail doorbell.
    fn submit_tracker(&mut self, cid: u16) {
        let cmd = {
            let tracker = self.trackers.get_mut(cid);
            tracker.active = true;
            match tracker.request.as_ref() {
                Some(req) => req.cmd,
                None => {
                    debug_assert!(false, "submitting a tracker without a request");
                    return;
                }
            }
        };

        // SAFETY: `sq_tail` is always a valid ring index, and ring
        // entries are 64-byte aligned within a page-aligned ring.
        unsafe {
            ptr::write_volatile((self.sq_virt as *mut NvmeCommand).add(self.sq_tail as usize), cmd);
        }

        self.sq_tail += 1;
        if self.sq_tail == self.num_entries {
            self.sq_tail = 0;
        }

        // The command bytes must be visible before the tail is
        // published to the device.
        self.shared.platform().wmb();
        self.shared
            .platform()
            .mmio_write32(self.sq_tdbl, self.sq_tail as u32);
    }

    /// Reaps up to `max_completions` entries from the completion ring.
    ///
    /// `0` means as many as safe: one queue depth, so the head doorbell
    /// cannot lap the tail within a single call.
    pub fn poll(&mut self, max_completions: u32) -> u32 {
        if !self.check_enabled() {
            // Likely mid-reset; whatever raised completions here will
            // be retried once the reset finishes.
            return 0;
        }

        let limit = (self.num_entries - 1) as u32;
        let max_completions = if max_completions == 0 || max_completions > limit {
            limit
        } else {
            max_completions
        };

        let mut completed = 0;
        loop {
            // SAFETY: `cq_head` is always a valid ring index.
            let cpl = unsafe {
                ptr::read_volatile(
                    (self.cq_chunk.virt as *const NvmeCompletion).add(self.cq_head as usize),
                )
            };
            if cpl.phase() != self.phase {
                break;
            }
            // The entry is valid; its fields must not be consumed ahead
            // of the phase check.
            fence(Ordering::Acquire);

            let cid = cpl.cid;
            if cid < self.trackers.count() && self.trackers.get(cid).active {
                self.complete_tracker(cid, cpl, true);
            } else {
                error!(
                    "[NVMe]: completion does not map to an outstanding command: cid {} status {:#x}",
                    cid, cpl.status
                );
                debug_assert!(false, "completion for an inactive tracker");
            }

            self.cq_head += 1;
            if self.cq_head == self.num_entries {
                self.cq_head = 0;
                self.phase ^= 1;
            }

            completed += 1;
            if completed == max_completions {
                break;
            }
        }

        if completed > 0 {
            self.shared
                .platform()
                .mmio_write32(self.cq_hdbl, self.cq_head as u32);
        }

        // Completions owned by other processes were parked during the
        // loop above; pick up whatever other pollers parked for us.
        if self.is_admin_queue() {
            self.shared.drain_pending_admin_requests();
        }

        completed
    }

    fn complete_tracker(&mut self, cid: u16, cpl: NvmeCompletion, print_on_error: bool) {
        let Some(mut req) = self.trackers.get_mut(cid).request.take() else {
            debug_assert!(false, "completing a tracker without a request");
            return;
        };

        let failed = cpl.is_error();
        let retry =
            failed && completion_is_retry(&cpl) && req.retries < self.shared.retry_count();

        if failed && print_on_error {
            error!(
                "[NVMe]: command failed: opc {:#x} cid {} sct {:#x} sc {:#x} dnr {}",
                req.cmd.opcode,
                cpl.cid,
                cpl.sct(),
                cpl.sc(),
                cpl.dnr() as u8
            );
        }

        self.trackers.get_mut(cid).active = false;

        if retry {
            req.retries += 1;
            self.trackers.get_mut(cid).request = Some(req);
            self.submit_tracker(cid);
            return;
        }

        self.trackers.release(cid);

        if self.is_admin_queue() && req.pid != self.shared.platform().process_id() {
            self.shared.park_pending_admin_request(req, &cpl);
        } else if let Some(callback) = req.callback.take() {
            callback(&cpl);
        }

        // The freed tracker can immediately host the oldest parked
        // request. During a controller reset the reset logic owns the
        // parked queue instead. A failure here completes in-band and
        // must not stall later completions.
        if !self.shared.is_resetting() {
            if let Some(next) = self.queued.pop_front() {
                let _ = self.submit(next);
            }
        }
    }

    /// Completes a tracker with a fabricated status, as if the device
    /// had returned it.
    fn manual_complete_tracker(&mut self, cid: u16, sct: u8, sc: u8, dnr: bool, print_on_error: bool) {
        let mut cpl = NvmeCompletion::new_zeroed();
        cpl.sq_id = self.id;
        cpl.cid = cid;
        cpl.set_status(sct, sc, dnr);
        self.complete_tracker(cid, cpl, print_on_error);
    }

    fn abort_trackers(&mut self, dnr: bool) {
        let mut cur = self.trackers.outstanding_head();
        while let Some(cid) = cur {
            let next = self.trackers.next_outstanding(cid);
            error!("[NVMe]: aborting outstanding command");
            self.manual_complete_tracker(
                cid,
                StatusCodeType::Generic as u8,
                generic_status::ABORTED_BY_REQUEST,
                dnr,
                true,
            );
            cur = next;
        }
    }

    /// Completes every outstanding Asynchronous Event Request with
    /// "aborted, queue deleted".
    ///
    /// Completion rewires the outstanding list, so the walk restarts
    /// from the head after each abort.
    fn abort_aers(&mut self) {
        let mut cur = self.trackers.outstanding_head();
        while let Some(cid) = cur {
            let is_aer = self
                .trackers
                .get(cid)
                .request
                .as_ref()
                .is_some_and(|req| req.cmd.opcode == AdminOpcode::AsyncEventRequest as u8);
            if is_aer {
                self.manual_complete_tracker(
                    cid,
                    StatusCodeType::Generic as u8,
                    generic_status::ABORTED_SQ_DELETION,
                    false,
                    false,
                );
                cur = self.trackers.outstanding_head();
            } else {
                cur = self.trackers.next_outstanding(cid);
            }
        }
    }

    /// Number of commands currently outstanding in hardware.
    pub fn outstanding_count(&self) -> usize {
        self.trackers.outstanding_count()
    }

    /// Number of requests parked for lack of a tracker.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.trackers.free_count()
    }

    #[cfg(test)]
    pub(crate) fn sq_tail(&self) -> u16 {
        self.sq_tail
    }

    #[cfg(test)]
    pub(crate) fn cq_head(&self) -> u16 {
        self.cq_head
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> u8 {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn sq_virt(&self) -> usize {
        self.sq_virt
    }

    #[cfg(test)]
    pub(crate) fn cq_virt(&self) -> usize {
        self.cq_chunk.virt
    }

    #[cfg(test)]
    pub(crate) fn descriptor_bus_addr(&self, cid: u16) -> u64 {
        self.trackers.descriptor_bus_addr(cid)
    }

    #[cfg(test)]
    pub(crate) fn prp_entry(&self, cid: u16, index: usize) -> u64 {
        self.trackers.get(cid).descs.prp()[index]
    }

    #[cfg(test)]
    pub(crate) fn sgl_entry(&self, cid: u16, index: usize) -> crate::SglDescriptor {
        self.trackers.get(cid).descs.sgl()[index]
    }

    #[cfg(test)]
    pub(crate) fn sq_entry(&self, index: u16) -> NvmeCommand {
        // SAFETY: test-only read of an in-bounds ring slot.
        unsafe { ptr::read_volatile((self.sq_virt as *const NvmeCommand).add(index as usize)) }
    }
}

impl Drop for NvmeQueuePair {
    fn drop(&mut self) {
        if self.is_admin_queue() {
            self.abort_aers();
        }
        // A ring placed in the controller memory buffer belongs to the
        // CMB's bump allocator and is never freed individually.
        if let Some(chunk) = self.sq_chunk.take() {
            self.shared.platform().dma_free(chunk);
        }
        self.shared.platform().dma_free(self.cq_chunk);
    }
}
