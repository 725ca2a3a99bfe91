// SPDX-License-Identifier: MPL-2.0

//! Controller Memory Buffer mapping and allocation.
//!
//! Some controllers expose a region of their own memory through a BAR
//! and allow submission queues to live there, saving one PCIe round
//! trip per doorbell ring. The region is carved out with a simple bump
//! allocator; nothing placed in it is ever freed individually.

use alloc::sync::Arc;

use log::debug;

use crate::{
    error::{Result, TransportError},
    nvme_regs::{CmblocRegister, CmbszRegister, NvmeRegs32, RegisterWindow},
    platform::{BarMapping, Platform},
};

/// A mapped Controller Memory Buffer.
pub struct CmbRegion {
    platform: Arc<dyn Platform>,
    bar: BarMapping,
    /// End of the CMB region, as an offset from the BAR base.
    end: u64,
    /// Bump pointer, as an offset from the BAR base.
    current_offset: u64,
    /// Whether CMBSZ advertises submission-queue placement.
    sq_allowed: bool,
}

impl CmbRegion {
    /// Maps the CMB if the controller exposes a usable one.
    ///
    /// Returns `None` when CMBSZ reports a zero size, when CMBLOC names
    /// an invalid BAR (only 0 and 2-5 are usable), or when the
    /// advertised region does not fit inside the BAR.
    pub(crate) fn try_map(platform: &Arc<dyn Platform>, regs: &RegisterWindow) -> Option<Self> {
        let cmbsz = CmbszRegister(regs.get_reg32(NvmeRegs32::Cmbsz as u32).ok()?);
        let cmbloc = CmblocRegister(regs.get_reg32(NvmeRegs32::Cmbloc as u32).ok()?);

        if cmbsz.sz() == 0 {
            return None;
        }

        let bir = cmbloc.bir();
        if bir == 1 || bir > 5 {
            debug!("[NVMe]: CMB reports unusable BAR {}", bir);
            return None;
        }

        // Unit size of 4KB/64KB/1MB/16MB/256MB/4GB/64GB.
        let unit_size = 1u64 << (12 + 4 * cmbsz.szu());
        let size = unit_size * cmbsz.sz() as u64;
        let offset = unit_size * cmbloc.ofst() as u64;

        let bar = platform.map_bar(bir as u8).ok()?;

        if offset > bar.size as u64 || size > bar.size as u64 - offset {
            let _ = platform.unmap_bar(bar);
            return None;
        }

        debug!(
            "[NVMe]: CMB mapped: BAR {}, {} bytes at offset {:#x}",
            bir, size, offset
        );

        Some(Self {
            platform: platform.clone(),
            bar,
            end: offset + size,
            current_offset: offset,
            sq_allowed: cmbsz.sqs(),
        })
    }

    /// Whether submission queues may be placed in this region.
    pub fn allows_sq_placement(&self) -> bool {
        self.sq_allowed
    }

    /// Reserves `length` bytes at a power-of-two `align`, returning the
    /// offset of the reservation from the BAR base.
    pub(crate) fn alloc(&mut self, length: u64, align: u64) -> Result<u64> {
        let round_offset = (self.current_offset + (align - 1)) & !(align - 1);

        if round_offset + length > self.end {
            return Err(TransportError::OutOfMemory);
        }

        self.current_offset = round_offset + length;
        Ok(round_offset)
    }

    /// Virtual address of an allocation returned by [`Self::alloc`].
    pub(crate) fn virt_at(&self, offset: u64) -> usize {
        self.bar.virt + offset as usize
    }

    /// Bus address of an allocation returned by [`Self::alloc`].
    pub(crate) fn phys_at(&self, offset: u64) -> u64 {
        self.bar.phys + offset
    }
}

impl Drop for CmbRegion {
    fn drop(&mut self) {
        if self.platform.unmap_bar(self.bar).is_err() {
            log::error!("[NVMe]: failed to unmap CMB BAR {}", self.bar.bar_index);
        }
    }
}

#[cfg(test)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        platform::Platform,
        test_util::{MockPlatform, cmbloc_raw, cmbsz_raw},
    };

    fn mapped_region(platform: &Arc<MockPlatform>, cmbsz: u32, cmbloc: u32) -> Option<CmbRegion> {
        let dyn_platform: Arc<dyn Platform> = platform.clone();
        let regs = RegisterWindow::map(dyn_platform.clone()).unwrap();
        regs.set_reg32(NvmeRegs32::Cmbsz as u32, cmbsz).unwrap();
        regs.set_reg32(NvmeRegs32::Cmbloc as u32, cmbloc).unwrap();
        CmbRegion::try_map(&dyn_platform, &regs)
    }

    #[test]
    fn zero_size_disables_cmb() {
        let platform = Arc::new(MockPlatform::new());
        assert!(mapped_region(&platform, 0, cmbloc_raw(2, 0)).is_none());
    }

    #[test]
    fn invalid_bar_disables_cmb() {
        let platform = Arc::new(MockPlatform::new());
        platform.add_bar(1, 0x10000);
        platform.add_bar(6, 0x10000);
        assert!(mapped_region(&platform, cmbsz_raw(2, 0, true), cmbloc_raw(1, 0)).is_none());
        assert!(mapped_region(&platform, cmbsz_raw(2, 0, true), cmbloc_raw(6, 0)).is_none());
    }

    #[test]
    fn oversized_region_disables_cmb() {
        let platform = Arc::new(MockPlatform::new());
        platform.add_bar(2, 0x1000);
        // 8 KiB advertised inside a 4 KiB BAR.
        assert!(mapped_region(&platform, cmbsz_raw(2, 0, true), cmbloc_raw(2, 0)).is_none());
    }

    #[test]
    fn bump_allocation_and_exhaustion() {
        let platform = Arc::new(MockPlatform::new());
        platform.add_bar(2, 0x4000);
        // 16 KiB region, SQ placement allowed.
        let mut cmb = mapped_region(&platform, cmbsz_raw(4, 0, true), cmbloc_raw(2, 0)).unwrap();
        assert!(cmb.allows_sq_placement());

        let first = cmb.alloc(0x800, 0x1000).unwrap();
        assert_eq!(first, 0);
        // The bump pointer sits at 0x800; a 4 KiB-aligned request skips
        // to the next page.
        let second = cmb.alloc(0x1000, 0x1000).unwrap();
        assert_eq!(second, 0x1000);
        // Exact fit of the remainder succeeds, one more byte does not.
        let third = cmb.alloc(0x2000, 0x1000).unwrap();
        assert_eq!(third, 0x2000);
        assert_eq!(cmb.alloc(1, 1), Err(TransportError::OutOfMemory));
    }

    #[test]
    fn bump_allocation_with_nonzero_offset() {
        let platform = Arc::new(MockPlatform::new());
        platform.add_bar(2, 0x4000);
        // 8 KiB region starting one unit (4 KiB) into the BAR.
        let mut cmb = mapped_region(&platform, cmbsz_raw(2, 0, true), cmbloc_raw(2, 1)).unwrap();

        // The full region is usable even though it sits past `size`
        // in BAR coordinates.
        let first = cmb.alloc(0x2000, 0x1000).unwrap();
        assert_eq!(first, 0x1000);
        let bar = platform.map_bar(2).unwrap();
        assert_eq!(cmb.phys_at(first), bar.phys + 0x1000);
        assert_eq!(cmb.alloc(1, 1), Err(TransportError::OutOfMemory));
    }

    #[test]
    fn sqs_clear_forbids_sq_placement() {
        let platform = Arc::new(MockPlatform::new());
        platform.add_bar(3, 0x2000);
        let cmb = mapped_region(&platform, cmbsz_raw(2, 0, false), cmbloc_raw(3, 0)).unwrap();
        assert!(!cmb.allows_sq_placement());
    }
}
