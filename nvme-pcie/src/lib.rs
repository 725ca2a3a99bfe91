// SPDX-License-Identifier: MPL-2.0

//! User-space NVMe-over-PCIe transport core.
//!
//! This crate owns an NVMe controller's register window, admin and I/O
//! queue pairs, DMA-resident command trackers, and the PRP/SGL
//! construction that turns request payloads into on-the-wire data
//! pointers. Platform services (BAR mapping, PCI config space,
//! physically contiguous DMA memory, address translation, MMIO) are
//! consumed through the [`Platform`] trait; the upper controller state
//! machine drives the transport through [`PcieController`] and
//! [`NvmeQueuePair`].
//!
//! The transport is poll-based: each queue pair is owned by a single
//! thread at a time and its hot path takes no locks. The only mutex is
//! the per-controller process registry used to route admin completions
//! back to the process that issued them.
//!
//! Refer to NVM Express Base Specification Revision 2.0, Sections 3.1
//! (Register Definition) and 3.3 (Queue Mechanism).

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate ostd_pod;

mod cmb;
mod ctrlr;
mod nvme_cmd;
mod nvme_queue;
mod nvme_regs;
mod prp;
mod tracker;

pub mod error;
pub mod platform;
pub mod request;

#[cfg(test)]
mod test_util;

pub use cmb::CmbRegion;
pub use ctrlr::{ControllerFlags, ControllerOptions, PcieController, QueuePriority};
pub use error::{Result, TransportError};
pub use nvme_cmd::{NvmeCommand, NvmeCompletion, SglDescriptor, StatusCodeType, async_event_request};
pub use nvme_queue::NvmeQueuePair;
pub use nvme_regs::{
    CapRegister, CmblocRegister, CmbszRegister, NvmeRegs32, NvmeRegs64, RegisterWindow,
};
pub use platform::{BarMapping, DmaChunk, PAGE_SIZE, Platform};
pub use request::{NvmeRequest, RequestPayload, ScatterGatherPayload};

/// Maximum number of PRP entries in the list embedded in a tracker.
pub const MAX_PRP_LIST_ENTRIES: usize = 506;

/// Maximum number of SGL descriptors in the one segment embedded in a
/// tracker.
pub const MAX_SGL_DESCRIPTORS: usize = 253;

/// Largest single-command transfer the transport can describe.
///
/// One PRP entry is embedded in the command itself and the rest live in
/// the tracker's list, so a command covers at most 506 pages.
pub const MAX_XFER_SIZE: u32 = (MAX_PRP_LIST_ENTRIES * PAGE_SIZE) as u32;
