// SPDX-License-Identifier: MPL-2.0

//! NVMe controller register definitions and the BAR0 register window.
//!
//! Refer to NVM Express Base Specification Revision 2.0, Section 3.1.

use alloc::sync::Arc;

use bit_field::BitField;
use log::error;

use crate::{
    error::{Result, TransportError},
    platform::{BarMapping, Platform},
};

/// 32-bit Controller Registers.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub enum NvmeRegs32 {
    /// Version (VS): Indicates the NVMe specification version.
    Vs = 0x8,
    /// Interrupt Mask Set (INTMS): Used to set interrupt mask bits.
    Intms = 0xC,
    /// Interrupt Mask Clear (INTMC): Used to clear interrupt mask bits.
    Intmc = 0x10,
    /// Controller Configuration (CC): Used to configure the controller.
    Cc = 0x14,
    /// Controller Status (CSTS): Reports status of the controller.
    Csts = 0x1C,
    /// NVM Subsystem Reset (NSSR): Used to reset the NVM subsystem.
    Nssr = 0x20,
    /// Admin Queue Attributes (AQA): Defines the size of Admin Queues.
    Aqa = 0x24,
    /// Controller Memory Buffer Location (CMBLOC): Indicates the location of the Controller Memory Buffer.
    Cmbloc = 0x38,
    /// Controller Memory Buffer Size (CMBSZ): Indicates the size of the Controller Memory Buffer.
    Cmbsz = 0x3C,
}

/// 64-bit Controller Registers.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub enum NvmeRegs64 {
    /// Controller Capabilities (CAP): Identifies basic capabilities.
    Cap = 0x0,
    /// Admin Submission Queue Base Address (ASQ): Base address of the Admin Submission Queue.
    Asq = 0x28,
    /// Admin Completion Queue Base Address (ACQ): Base address of the Admin Completion Queue.
    Acq = 0x30,
}

/// Doorbell Registers.
///
/// Doorbell registers are used to notify the controller of updates to submission
/// and completion queues. Each queue pair has two doorbell registers:
/// - Submission Queue y Tail Doorbell (SQyTDBL): offset 0x1000 + (2y * (4 << DSTRD))
/// - Completion Queue y Head Doorbell (CQyHDBL): offset 0x1000 + ((2y+1) * (4 << DSTRD))
///
/// Where 'y' is the queue identifier (queue ID).
#[derive(Copy, Clone, Debug)]
pub(crate) enum NvmeDoorBellRegs {
    /// Submission Queue y Tail Doorbell (SQyTDBL).
    Sqtdb,
    /// Completion Queue y Head Doorbell (CQyHDBL).
    Cqhdb,
}

impl NvmeDoorBellRegs {
    /// Calculates the offset for this doorbell register.
    ///
    /// `stride_u32` is the doorbell stride in dword units, i.e.
    /// `1 << CAP.DSTRD`.
    pub(crate) fn offset(&self, qid: u16, stride_u32: u32) -> u32 {
        const DOORBELL_BASE: u32 = 0x1000;
        let stride = stride_u32 * 4;

        match self {
            NvmeDoorBellRegs::Sqtdb => DOORBELL_BASE + (2 * qid as u32) * stride,
            NvmeDoorBellRegs::Cqhdb => DOORBELL_BASE + ((2 * qid as u32) + 1) * stride,
        }
    }
}

/// Controller Capabilities (CAP) fields.
#[derive(Debug, Copy, Clone, Default)]
pub struct CapRegister(pub u64);

impl CapRegister {
    /// Maximum Queue Entries Supported, 0-based.
    pub fn mqes(&self) -> u16 {
        self.0.get_bits(0..16) as u16
    }

    /// Contiguous Queues Required.
    pub fn cqr(&self) -> bool {
        self.0.get_bit(16)
    }

    /// Timeout, in 500 ms units.
    pub fn to(&self) -> u8 {
        self.0.get_bits(24..32) as u8
    }

    /// Doorbell Stride: the stride is `4 << DSTRD` bytes.
    pub fn dstrd(&self) -> u32 {
        self.0.get_bits(32..36) as u32
    }

    /// Command Sets Supported.
    pub fn css(&self) -> u8 {
        self.0.get_bits(37..45) as u8
    }

    /// Memory Page Size Minimum, as `2^(12 + MPSMIN)` bytes.
    pub fn mpsmin(&self) -> u8 {
        self.0.get_bits(48..52) as u8
    }

    /// Memory Page Size Maximum, as `2^(12 + MPSMAX)` bytes.
    pub fn mpsmax(&self) -> u8 {
        self.0.get_bits(52..56) as u8
    }
}

/// Controller Memory Buffer Size (CMBSZ) fields.
#[derive(Debug, Copy, Clone)]
pub struct CmbszRegister(pub u32);

impl CmbszRegister {
    /// Submission Queues Supported in the CMB.
    pub fn sqs(&self) -> bool {
        self.0.get_bit(0)
    }

    /// Size Units: the CMB unit is `1 << (12 + 4 * SZU)` bytes.
    pub fn szu(&self) -> u32 {
        self.0.get_bits(8..12)
    }

    /// Size of the CMB, in size units.
    pub fn sz(&self) -> u32 {
        self.0.get_bits(12..32)
    }
}

/// Controller Memory Buffer Location (CMBLOC) fields.
#[derive(Debug, Copy, Clone)]
pub struct CmblocRegister(pub u32);

impl CmblocRegister {
    /// Base Indicator Register: which BAR holds the CMB.
    pub fn bir(&self) -> u32 {
        self.0.get_bits(0..3)
    }

    /// Offset of the CMB within the BAR, in size units.
    pub fn ofst(&self) -> u32 {
        self.0.get_bits(12..32)
    }
}

/// Encodes the Admin Queue Attributes (AQA) register.
///
/// Both queue sizes are 0-based.
pub(crate) fn aqa_register(asqs: u16, acqs: u16) -> u32 {
    let mut raw = 0u32;
    raw.set_bits(0..12, asqs as u32);
    raw.set_bits(16..28, acqs as u32);
    raw
}

/// Typed MMIO view over BAR0.
///
/// All register accesses of the transport go through this window, which
/// bounds-checks offsets against the mapping before touching the bus.
pub struct RegisterWindow {
    platform: Arc<dyn Platform>,
    bar: BarMapping,
}

impl RegisterWindow {
    /// Maps BAR0 of the device.
    pub(crate) fn map(platform: Arc<dyn Platform>) -> Result<Self> {
        let bar = platform.map_bar(0)?;
        Ok(Self { platform, bar })
    }

    fn checked_addr(&self, offset: u32, width: usize) -> Result<usize> {
        if offset as usize + width > self.bar.size {
            return Err(TransportError::IoError);
        }
        Ok(self.bar.virt + offset as usize)
    }

    /// Reads a 32-bit register at `offset`.
    pub fn get_reg32(&self, offset: u32) -> Result<u32> {
        let addr = self.checked_addr(offset, 4)?;
        Ok(self.platform.mmio_read32(addr))
    }

    /// Reads a 64-bit register at `offset`.
    pub fn get_reg64(&self, offset: u32) -> Result<u64> {
        let addr = self.checked_addr(offset, 8)?;
        Ok(self.platform.mmio_read64(addr))
    }

    /// Writes a 32-bit register at `offset`.
    pub fn set_reg32(&self, offset: u32, value: u32) -> Result<()> {
        let addr = self.checked_addr(offset, 4)?;
        self.platform.mmio_write32(addr, value);
        Ok(())
    }

    /// Writes a 64-bit register at `offset`.
    pub fn set_reg64(&self, offset: u32, value: u64) -> Result<()> {
        let addr = self.checked_addr(offset, 8)?;
        self.platform.mmio_write64(addr, value);
        Ok(())
    }

    pub(crate) fn bar(&self) -> &BarMapping {
        &self.bar
    }
}

impl Drop for RegisterWindow {
    fn drop(&mut self) {
        if self.platform.unmap_bar(self.bar).is_err() {
            error!("[NVMe]: failed to unmap register BAR {}", self.bar.bar_index);
        }
    }
}
