// SPDX-License-Identifier: MPL-2.0

//! Request objects handed to the transport.
//!
//! A request carries a fully formed submission queue entry (minus the
//! command identifier, which the transport assigns from its tracker
//! pool), a payload descriptor, and the completion callback.

use alloc::boxed::Box;

use ostd_pod::FromZeros;

use crate::{
    error::{Result, TransportError},
    nvme_cmd::{NvmeCommand, NvmeCompletion},
};

/// Completion callback invoked exactly once per request.
pub type CompletionCallback = Box<dyn FnOnce(&NvmeCompletion) + Send>;

/// A scattered payload, walked segment by segment during PRP/SGL
/// construction.
pub trait ScatterGatherPayload: Send {
    /// Repositions the walk at `offset` bytes into the payload.
    fn reset(&mut self, offset: u32);

    /// Returns the next segment as `(virtual address, length)`.
    fn next_segment(&mut self) -> Result<(usize, u32)>;
}

/// How a request's data is laid out in host memory.
pub enum RequestPayload {
    /// No data transfer; the data pointer stays zeroed.
    None,
    /// One virtually contiguous buffer, with an optional metadata
    /// buffer.
    Contig { virt: usize, md: Option<usize> },
    /// A scattered buffer described by a segment walker.
    Scatter(Box<dyn ScatterGatherPayload>),
}

/// A command in flight through the transport.
pub struct NvmeRequest {
    /// The submission queue entry to send.
    pub cmd: NvmeCommand,
    pub(crate) payload: RequestPayload,
    pub(crate) payload_size: u32,
    pub(crate) payload_offset: u32,
    pub(crate) md_offset: u32,
    pub(crate) retries: u8,
    pub(crate) pid: u32,
    pub(crate) callback: Option<CompletionCallback>,
    /// Parking slot for the completion when it must be routed to
    /// another process.
    pub(crate) cpl: NvmeCompletion,
}

impl NvmeRequest {
    /// Creates a request with no data transfer.
    pub fn without_payload(
        cmd: NvmeCommand,
        pid: u32,
        callback: impl FnOnce(&NvmeCompletion) + Send + 'static,
    ) -> Self {
        Self {
            cmd,
            payload: RequestPayload::None,
            payload_size: 0,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid,
            callback: Some(Box::new(callback)),
            cpl: NvmeCompletion::new_zeroed(),
        }
    }

    /// Creates a request over a virtually contiguous buffer.
    pub fn contig(
        cmd: NvmeCommand,
        virt: usize,
        payload_size: u32,
        pid: u32,
        callback: impl FnOnce(&NvmeCompletion) + Send + 'static,
    ) -> Self {
        Self {
            cmd,
            payload: RequestPayload::Contig { virt, md: None },
            payload_size,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid,
            callback: Some(Box::new(callback)),
            cpl: NvmeCompletion::new_zeroed(),
        }
    }

    /// Creates a request over a scattered buffer.
    pub fn scattered(
        cmd: NvmeCommand,
        payload: Box<dyn ScatterGatherPayload>,
        payload_size: u32,
        pid: u32,
        callback: impl FnOnce(&NvmeCompletion) + Send + 'static,
    ) -> Self {
        Self {
            cmd,
            payload: RequestPayload::Scatter(payload),
            payload_size,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid,
            callback: Some(Box::new(callback)),
            cpl: NvmeCompletion::new_zeroed(),
        }
    }

    /// Starts the transfer `offset` bytes into the payload.
    pub fn with_payload_offset(mut self, offset: u32) -> Self {
        self.payload_offset = offset;
        self
    }

    /// Attaches a metadata buffer to a contiguous payload.
    pub fn with_metadata(mut self, md_virt: usize, md_offset: u32) -> Self {
        if let RequestPayload::Contig { md, .. } = &mut self.payload {
            *md = Some(md_virt);
        }
        self.md_offset = md_offset;
        self
    }
}

/// A scatter walker over a fixed list of `(virtual address, length)`
/// segments.
///
/// Offsets land on segment boundaries in practice; a reset into the
/// middle of a segment yields the segment's tail.
pub struct SegmentList {
    segments: alloc::vec::Vec<(usize, u32)>,
    index: usize,
    first_offset: u32,
}

impl SegmentList {
    pub fn new(segments: alloc::vec::Vec<(usize, u32)>) -> Self {
        Self {
            segments,
            index: 0,
            first_offset: 0,
        }
    }
}

impl ScatterGatherPayload for SegmentList {
    fn reset(&mut self, offset: u32) {
        let mut remaining = offset;
        self.index = 0;
        self.first_offset = 0;
        for (i, &(_, len)) in self.segments.iter().enumerate() {
            if remaining < len {
                self.index = i;
                self.first_offset = remaining;
                return;
            }
            remaining -= len;
        }
        self.index = self.segments.len();
    }

    fn next_segment(&mut self) -> Result<(usize, u32)> {
        let &(virt, len) = self
            .segments
            .get(self.index)
            .ok_or(TransportError::BadAddress)?;
        let first_offset = core::mem::take(&mut self.first_offset);
        self.index += 1;
        Ok((virt + first_offset as usize, len - first_offset))
    }
}
