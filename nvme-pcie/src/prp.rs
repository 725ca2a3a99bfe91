// SPDX-License-Identifier: MPL-2.0

//! PRP and SGL construction.
//!
//! Three paths, chosen by the request's payload and the controller's
//! capabilities:
//!
//! - a contiguous buffer becomes PRP1/PRP2 plus, past two pages, the
//!   PRP list embedded in the tracker;
//! - a scattered buffer on an SGL-capable controller becomes Data
//!   Block descriptors in the tracker, or a single inlined descriptor;
//! - a scattered buffer without SGL support is packed into PRPs, which
//!   requires every non-final segment to end on a page boundary.
//!
//! On any failure the caller completes the tracker in-band with
//! `INVALID_FIELD`; these functions only report it.

use crate::{
    MAX_PRP_LIST_ENTRIES, MAX_SGL_DESCRIPTORS,
    error::{Result, TransportError},
    nvme_cmd::{Psdt, SglDescriptor},
    platform::{PAGE_SIZE, Platform},
    request::{NvmeRequest, RequestPayload},
};

/// Number of pages a transfer of `size` bytes touches when its first
/// byte sits `unaligned` bytes into a page.
fn page_span(size: usize, unaligned: usize) -> usize {
    let mut nseg = size / PAGE_SIZE;
    let modulo = size % PAGE_SIZE;
    if modulo != 0 || unaligned != 0 {
        nseg += 1 + (modulo + unaligned - 1) / PAGE_SIZE;
    }
    nseg
}

/// Builds the PRP entries for a physically contiguous payload.
pub(crate) fn build_contig_request(
    platform: &dyn Platform,
    req: &mut NvmeRequest,
    prp_list: &mut [u64; MAX_PRP_LIST_ENTRIES],
    prp_list_bus: u64,
) -> Result<()> {
    let &RequestPayload::Contig { virt, md } = &req.payload else {
        return Err(TransportError::BadAddress);
    };
    let payload = virt + req.payload_offset as usize;

    let phys = platform
        .virt_to_phys(payload)
        .ok_or(TransportError::BadAddress)?;
    let unaligned = phys as usize % PAGE_SIZE;
    let nseg = page_span(req.payload_size as usize, unaligned);

    if let Some(md_virt) = md {
        let md_payload = md_virt + req.md_offset as usize;
        req.cmd.mptr = platform
            .virt_to_phys(md_payload)
            .ok_or(TransportError::BadAddress)?;
    }

    req.cmd.set_psdt(Psdt::Prp);
    req.cmd.set_prp1(phys);
    match nseg {
        0 | 1 => {}
        2 => {
            let seg_addr = payload + PAGE_SIZE - unaligned;
            let seg_phys = platform
                .virt_to_phys(seg_addr)
                .ok_or(TransportError::BadAddress)?;
            req.cmd.set_prp2(seg_phys);
        }
        _ => {
            if nseg - 1 > MAX_PRP_LIST_ENTRIES {
                return Err(TransportError::BadAddress);
            }
            req.cmd.set_prp2(prp_list_bus);
            for cur_nseg in 1..nseg {
                let seg_addr = payload + cur_nseg * PAGE_SIZE - unaligned;
                prp_list[cur_nseg - 1] = platform
                    .virt_to_phys(seg_addr)
                    .ok_or(TransportError::BadAddress)?;
            }
        }
    }

    Ok(())
}

/// Builds the SGL segment for a scattered payload on an SGL-capable
/// controller.
pub(crate) fn build_hw_sgl_request(
    platform: &dyn Platform,
    req: &mut NvmeRequest,
    sgl_list: &mut [SglDescriptor; MAX_SGL_DESCRIPTORS],
    sgl_list_bus: u64,
) -> Result<()> {
    let NvmeRequest {
        cmd,
        payload,
        payload_size,
        payload_offset,
        ..
    } = req;
    let RequestPayload::Scatter(sg) = payload else {
        return Err(TransportError::BadAddress);
    };
    sg.reset(*payload_offset);

    cmd.set_psdt(Psdt::SglMptrSgl);

    let mut remaining = *payload_size;
    let mut nseg = 0usize;
    while remaining > 0 {
        if nseg >= MAX_SGL_DESCRIPTORS {
            return Err(TransportError::BadAddress);
        }

        let (virt, len) = sg.next_segment().map_err(|_| TransportError::BadAddress)?;
        let phys = platform
            .virt_to_phys(virt)
            .ok_or(TransportError::BadAddress)?;

        let length = len.min(remaining);
        remaining -= length;

        sgl_list[nseg] = SglDescriptor::data_block(phys, length);
        nseg += 1;
    }

    if nseg == 1 {
        // A single Data Block descriptor fits in the command itself, so
        // the segment in the tracker is not referenced at all.
        cmd.set_sgl1(sgl_list[0]);
    } else {
        cmd.set_sgl1(SglDescriptor::last_segment(
            sgl_list_bus,
            (nseg * core::mem::size_of::<SglDescriptor>()) as u32,
        ));
    }

    Ok(())
}

/// Packs a scattered payload into PRP entries for controllers without
/// SGL support.
///
/// Every segment must start 4-byte aligned, and every segment except
/// the final one must end exactly on a page boundary; anything else is
/// not expressible as PRPs.
pub(crate) fn build_scattered_prps_request(
    platform: &dyn Platform,
    req: &mut NvmeRequest,
    prp_list: &mut [u64; MAX_PRP_LIST_ENTRIES],
    prp_list_bus: u64,
) -> Result<()> {
    let NvmeRequest {
        cmd,
        payload,
        payload_size,
        payload_offset,
        ..
    } = req;
    let RequestPayload::Scatter(sg) = payload else {
        return Err(TransportError::BadAddress);
    };
    sg.reset(*payload_offset);

    let mut remaining = *payload_size;
    let mut total_nseg = 0usize;
    let mut last_nseg = 0usize;
    let mut sge_count = 0usize;
    let mut saved_prp2 = 0u64;

    while remaining > 0 {
        let (virt, len) = sg.next_segment().map_err(|_| TransportError::BadAddress)?;
        if len == 0 {
            return Err(TransportError::BadAddress);
        }
        let phys = platform
            .virt_to_phys(virt)
            .ok_or(TransportError::BadAddress)?;

        // The element must be PRP compatible.
        if phys & 0x3 != 0
            || (len < remaining && (phys + len as u64) % PAGE_SIZE as u64 != 0)
        {
            return Err(TransportError::BadAddress);
        }

        let xfer = len.min(remaining);
        let unaligned = phys as usize % PAGE_SIZE;
        let nseg = page_span(xfer as usize, unaligned);

        let mut seg_base = phys;
        if total_nseg == 0 {
            cmd.set_psdt(Psdt::Prp);
            cmd.set_prp1(phys);
            seg_base = phys - unaligned as u64;
        }

        total_nseg += nseg;
        sge_count += 1;
        remaining -= xfer;

        if total_nseg == 2 {
            let prp2 = if sge_count == 1 {
                seg_base + PAGE_SIZE as u64
            } else {
                seg_base
            };
            cmd.set_prp2(prp2);
            saved_prp2 = prp2;
        } else if total_nseg > 2 {
            // The first page of the first element stays in PRP1; all
            // later pages go through the embedded list. When the
            // transfer grew past two pages, the address already parked
            // in PRP2 moves to the head of the list.
            let mut cur_nseg = if sge_count == 1 { 1 } else { 0 };
            cmd.set_prp2(prp_list_bus);
            while cur_nseg < nseg {
                let entry = seg_base + (cur_nseg * PAGE_SIZE) as u64;
                let index = if saved_prp2 != 0 {
                    prp_list[0] = saved_prp2;
                    last_nseg + 1
                } else {
                    last_nseg
                };
                if index >= MAX_PRP_LIST_ENTRIES {
                    return Err(TransportError::BadAddress);
                }
                prp_list[index] = entry;
                last_nseg += 1;
                cur_nseg += 1;
            }
        }
    }

    Ok(())
}
