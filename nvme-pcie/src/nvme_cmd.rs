// SPDX-License-Identifier: MPL-2.0

//! NVMe Command and Completion structures.
//!
//! Refer to NVM Express Base Specification Revision 2.0:
//! - Section 3.3.1: Completion Queue Entry
//! - Section 5: Admin Command Set

use bit_field::BitField;
use int_to_c_enum::TryFromInt;

/// Bit position of the PSDT (PRP or SGL for Data Transfer) field within
/// the command flags byte.
const PSDT_BITS: usize = 6;

/// Phase Tag bit mask.
///
/// Used to identify the phase of the completion queue entry.
pub(crate) const STATUS_PHASE_TAG_MASK: u16 = 0x0001;

/// Admin Command Set opcodes.
///
/// See NVMe Spec 2.0, Section 5 (Admin Command Set).
#[repr(u8)]
pub(crate) enum AdminOpcode {
    /// Delete I/O Submission Queue command. See Section 5.7.
    DeleteIoSq = 0x00,
    /// Create I/O Submission Queue command. See Section 5.5.
    CreateIoSq = 0x01,
    /// Delete I/O Completion Queue command. See Section 5.6.
    DeleteIoCq = 0x04,
    /// Create I/O Completion Queue command. See Section 5.4.
    CreateIoCq = 0x05,
    /// Asynchronous Event Request command. See Section 5.2.
    AsyncEventRequest = 0x0C,
}

/// Status Code Type values of the completion status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
pub enum StatusCodeType {
    /// Generic Command Status.
    Generic = 0,
    /// Command Specific Status.
    CommandSpecific = 1,
    /// Media and Data Integrity Errors.
    MediaError = 2,
    /// Path Related Status.
    Path = 3,
    /// Vendor Specific.
    VendorSpecific = 7,
}

/// Generic status codes used by the transport itself.
pub(crate) mod generic_status {
    pub(crate) const INVALID_FIELD: u8 = 0x02;
    pub(crate) const ABORTED_BY_REQUEST: u8 = 0x07;
    pub(crate) const ABORTED_SQ_DELETION: u8 = 0x08;
    pub(crate) const NAMESPACE_NOT_READY: u8 = 0x82;
}

/// PSDT field values: how the command's data pointer is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Psdt {
    /// Data pointer holds PRP1/PRP2.
    Prp = 0,
    /// Data pointer holds one SGL descriptor, metadata pointer is a
    /// contiguous buffer.
    #[expect(dead_code)]
    SglMptrContig = 1,
    /// Data pointer holds one SGL descriptor, metadata pointer is an
    /// SGL segment pointer.
    SglMptrSgl = 2,
}

/// SGL descriptor type values (upper nibble of the last byte).
const SGL_TYPE_DATA_BLOCK: u8 = 0x0;
const SGL_TYPE_LAST_SEGMENT: u8 = 0x3;

/// Completion Queue Entry (CQE).
///
/// The Completion Queue Entry is 16 bytes and consists of 4 Dwords.
/// Status Field format (16 bits):
/// - Bit 0: Phase Tag (P)
/// - Bits 1-8: Status Code (SC)
/// - Bits 9-11: Status Code Type (SCT)
/// - Bit 15: Do Not Retry (DNR)
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod)]
pub struct NvmeCompletion {
    /// Dword 0: Command Specific (32 bits).
    pub dword0: u32,

    /// Dword 1: Reserved.
    pub dword1: u32,

    /// Dword 2, bits 0-15: SQ Head Pointer (16 bits).
    pub sq_head: u16,

    /// Dword 2, bits 16-31: SQ Identifier (16 bits).
    pub sq_id: u16,

    /// Dword 3, bits 0-15: Command Identifier (16 bits).
    pub cid: u16,

    /// Dword 3, bits 16-31: Status Field (16 bits).
    pub status: u16,
}

impl NvmeCompletion {
    /// The Phase Tag of this entry.
    pub fn phase(&self) -> u8 {
        (self.status & STATUS_PHASE_TAG_MASK) as u8
    }

    /// The Status Code.
    pub fn sc(&self) -> u8 {
        self.status.get_bits(1..9) as u8
    }

    /// The Status Code Type.
    pub fn sct(&self) -> u8 {
        self.status.get_bits(9..12) as u8
    }

    /// The Do Not Retry bit.
    pub fn dnr(&self) -> bool {
        self.status.get_bit(15)
    }

    /// Checks whether the completion indicates a failed command.
    pub fn is_error(&self) -> bool {
        self.sct() != 0 || self.sc() != 0
    }

    pub(crate) fn set_status(&mut self, sct: u8, sc: u8, dnr: bool) {
        let mut status = 0u16;
        status.set_bits(1..9, sc as u16);
        status.set_bits(9..12, sct as u16);
        status.set_bit(15, dnr);
        self.status = status;
    }
}

/// Classifies a failed completion as transient.
///
/// Only generic aborts and not-ready conditions without the DNR bit are
/// worth resubmitting; everything else is terminal.
pub(crate) fn completion_is_retry(cpl: &NvmeCompletion) -> bool {
    match StatusCodeType::try_from(cpl.sct()) {
        Ok(StatusCodeType::Generic) => match cpl.sc() {
            generic_status::ABORTED_BY_REQUEST | generic_status::NAMESPACE_NOT_READY => !cpl.dnr(),
            _ => false,
        },
        _ => false,
    }
}

/// Submission Queue Entry.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod)]
pub struct NvmeCommand {
    /// Opcode.
    pub opcode: u8,
    /// Flags: FUSE (bits 0-1) and PSDT (bits 6-7).
    pub flags: u8,
    /// Command ID.
    pub cid: u16,
    /// Namespace identifier.
    pub nsid: u32,
    /// Reserved.
    pub _rsvd: u64,
    /// Metadata pointer.
    pub mptr: u64,
    /// Data pointer.
    pub dptr: [u64; 2],
    /// Command dword 10.
    pub cdw10: u32,
    /// Command dword 11.
    pub cdw11: u32,
    /// Command dword 12.
    pub cdw12: u32,
    /// Command dword 13.
    pub cdw13: u32,
    /// Command dword 14.
    pub cdw14: u32,
    /// Command dword 15.
    pub cdw15: u32,
}

impl NvmeCommand {
    pub(crate) fn set_psdt(&mut self, psdt: Psdt) {
        self.flags.set_bits(PSDT_BITS..PSDT_BITS + 2, psdt as u8);
    }

    /// The PSDT field of the command flags.
    pub fn psdt(&self) -> u8 {
        self.flags.get_bits(PSDT_BITS..PSDT_BITS + 2)
    }

    pub(crate) fn set_prp1(&mut self, addr: u64) {
        self.dptr[0] = addr;
    }

    pub(crate) fn set_prp2(&mut self, addr: u64) {
        self.dptr[1] = addr;
    }

    /// The second PRP entry of the data pointer.
    pub fn prp2(&self) -> u64 {
        self.dptr[1]
    }

    /// Places one SGL descriptor in the command's data pointer.
    pub(crate) fn set_sgl1(&mut self, desc: SglDescriptor) {
        self.dptr[0] = desc.address;
        self.dptr[1] = (desc.length as u64) | ((desc.type_specific as u64) << 56);
    }

    /// Reads the data pointer back as an SGL descriptor.
    pub fn sgl1(&self) -> SglDescriptor {
        SglDescriptor {
            address: self.dptr[0],
            length: self.dptr[1] as u32,
            _rsvd: [0; 3],
            type_specific: (self.dptr[1] >> 56) as u8,
        }
    }
}

/// SGL descriptor (16 bytes).
///
/// The last byte encodes the descriptor type in its upper nibble and
/// the subtype in its lower nibble.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod)]
pub struct SglDescriptor {
    /// Bus address of the data block or segment.
    pub address: u64,
    /// Length in bytes.
    pub length: u32,
    _rsvd: [u8; 3],
    /// Descriptor type (bits 4-7) and subtype (bits 0-3).
    pub type_specific: u8,
}

impl SglDescriptor {
    pub(crate) fn data_block(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            _rsvd: [0; 3],
            type_specific: SGL_TYPE_DATA_BLOCK << 4,
        }
    }

    pub(crate) fn last_segment(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            _rsvd: [0; 3],
            type_specific: SGL_TYPE_LAST_SEGMENT << 4,
        }
    }

    /// The descriptor type (upper nibble).
    pub fn descriptor_type(&self) -> u8 {
        self.type_specific >> 4
    }

    /// Whether this descriptor is a Data Block.
    pub fn is_data_block(&self) -> bool {
        self.descriptor_type() == SGL_TYPE_DATA_BLOCK
    }

    /// Whether this descriptor is a Last Segment pointer.
    pub fn is_last_segment(&self) -> bool {
        self.descriptor_type() == SGL_TYPE_LAST_SEGMENT
    }
}

pub(crate) fn create_io_completion_queue(qid: u16, num_entries: u16, cq_bus: u64) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::CreateIoCq as u8,
        flags: 0,
        cid: 0,
        nsid: 0,
        _rsvd: 0,
        mptr: 0,
        // 0x1 = physically contiguous, interrupts disabled.
        dptr: [cq_bus, 0],
        cdw10: (((num_entries - 1) as u32) << 16) | qid as u32,
        cdw11: 0x1,
        cdw12: 0,
        cdw13: 0,
        cdw14: 0,
        cdw15: 0,
    }
}

pub(crate) fn create_io_submission_queue(
    qid: u16,
    num_entries: u16,
    cqid: u16,
    qprio: u8,
    sq_bus: u64,
) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::CreateIoSq as u8,
        flags: 0,
        cid: 0,
        nsid: 0,
        _rsvd: 0,
        mptr: 0,
        dptr: [sq_bus, 0],
        cdw10: (((num_entries - 1) as u32) << 16) | qid as u32,
        // 0x1 = physically contiguous.
        cdw11: ((cqid as u32) << 16) | ((qprio as u32) << 1) | 0x1,
        cdw12: 0,
        cdw13: 0,
        cdw14: 0,
        cdw15: 0,
    }
}

pub(crate) fn delete_io_submission_queue(qid: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::DeleteIoSq as u8,
        flags: 0,
        cid: 0,
        nsid: 0,
        _rsvd: 0,
        mptr: 0,
        dptr: [0, 0],
        cdw10: qid as u32,
        cdw11: 0,
        cdw12: 0,
        cdw13: 0,
        cdw14: 0,
        cdw15: 0,
    }
}

pub(crate) fn delete_io_completion_queue(qid: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::DeleteIoCq as u8,
        flags: 0,
        cid: 0,
        nsid: 0,
        _rsvd: 0,
        mptr: 0,
        dptr: [0, 0],
        cdw10: qid as u32,
        cdw11: 0,
        cdw12: 0,
        cdw13: 0,
        cdw14: 0,
        cdw15: 0,
    }
}

/// Builds an Asynchronous Event Request.
///
/// AERs are long-lived admin commands; the transport aborts them when
/// the admin queue is disabled or destroyed.
pub fn async_event_request() -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::AsyncEventRequest as u8,
        flags: 0,
        cid: 0,
        nsid: 0,
        _rsvd: 0,
        mptr: 0,
        dptr: [0, 0],
        cdw10: 0,
        cdw11: 0,
        cdw12: 0,
        cdw13: 0,
        cdw14: 0,
        cdw15: 0,
    }
}
