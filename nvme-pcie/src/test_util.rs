// SPDX-License-Identifier: MPL-2.0

//! Test doubles: a memory-backed platform with identity address
//! translation and a minimal admin-queue device model.

use alloc::{collections::BTreeMap, vec::Vec};
use core::{
    alloc::Layout,
    ptr,
    sync::atomic::{Ordering, fence},
};

use ostd_pod::FromZeros;
use spin::Mutex;

use crate::{
    error::{Result, TransportError},
    nvme_cmd::{NvmeCommand, NvmeCompletion},
    platform::{BarMapping, DmaChunk, PAGE_SIZE, Platform},
};

const DOORBELL_BASE: usize = 0x1000;

struct Allocation {
    ptr: *mut u8,
    layout: Layout,
}

struct MockBar {
    mapping: BarMapping,
    backing: Allocation,
}

#[derive(Default)]
struct AdminDevice {
    sq_head: u16,
    cq_tail: u16,
    phase: u16,
    /// Forced status per opcode: `(sct, sc)`.
    failures: BTreeMap<u8, (u8, u8)>,
    /// Every SQE the device consumed.
    seen: Vec<NvmeCommand>,
}

struct MockInner {
    bars: BTreeMap<u8, MockBar>,
    dma: Vec<Allocation>,
    cfg: [u32; 32],
    poisoned: Vec<usize>,
    doorbells: Vec<(usize, u32)>,
    pid: u32,
    admin: Option<AdminDevice>,
}

/// A `Platform` whose BARs and DMA buffers are plain host memory and
/// whose virt-to-phys translation is the identity.
pub(crate) struct MockPlatform {
    inner: Mutex<MockInner>,
}

// SAFETY: the raw pointers inside only reference memory owned by this
// platform, and all access goes through the mutex.
unsafe impl Send for MockPlatform {}
unsafe impl Sync for MockPlatform {}

fn alloc_backing(size: usize, align: usize) -> Allocation {
    let layout = Layout::from_size_align(size.max(1), align.max(1)).unwrap();
    // SAFETY: the layout has a non-zero size.
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    Allocation { ptr, layout }
}

impl MockPlatform {
    /// Creates a platform with an 8 KiB BAR0 (register file plus
    /// doorbell array).
    pub(crate) fn new() -> Self {
        let platform = Self {
            inner: Mutex::new(MockInner {
                bars: BTreeMap::new(),
                dma: Vec::new(),
                cfg: [0; 32],
                poisoned: Vec::new(),
                doorbells: Vec::new(),
                pid: 1,
                admin: None,
            }),
        };
        platform.add_bar(0, 0x2000);
        platform
    }

    /// Adds a memory-backed BAR.
    pub(crate) fn add_bar(&self, index: u8, size: usize) {
        let backing = alloc_backing(size, PAGE_SIZE);
        let mapping = BarMapping {
            bar_index: index,
            virt: backing.ptr as usize,
            phys: backing.ptr as u64,
            size,
        };
        self.inner.lock().bars.insert(index, MockBar { mapping, backing });
    }

    pub(crate) fn bar_size(&self, index: u8) -> usize {
        self.inner.lock().bars[&index].mapping.size
    }

    /// Makes `virt_to_phys` fail for `virt`.
    pub(crate) fn poison_address(&self, virt: usize) {
        self.inner.lock().poisoned.push(virt);
    }

    /// All doorbell writes so far, as `(offset into BAR0, value)`.
    pub(crate) fn doorbell_writes(&self) -> Vec<(usize, u32)> {
        self.inner.lock().doorbells.clone()
    }

    pub(crate) fn clear_doorbell_writes(&self) {
        self.inner.lock().doorbells.clear();
    }

    pub(crate) fn set_process_id(&self, pid: u32) {
        self.inner.lock().pid = pid;
    }

    /// Turns on the admin device model: admin SQ doorbell writes
    /// consume SQEs and post phase-correct CQEs.
    pub(crate) fn enable_admin_device(&self) {
        self.inner.lock().admin = Some(AdminDevice {
            phase: 1,
            ..AdminDevice::default()
        });
    }

    /// Forces every admin command with `opcode` to fail with the given
    /// status.
    pub(crate) fn fail_admin_opcode(&self, opcode: u8, sct: u8, sc: u8) {
        if let Some(admin) = self.inner.lock().admin.as_mut() {
            admin.failures.insert(opcode, (sct, sc));
        }
    }

    /// Admin SQEs the device model has consumed, in order.
    pub(crate) fn admin_commands_seen(&self) -> Vec<NvmeCommand> {
        self.inner
            .lock()
            .admin
            .as_ref()
            .map(|a| a.seen.clone())
            .unwrap_or_default()
    }

    pub(crate) fn cfg_command_register(&self) -> u32 {
        self.inner.lock().cfg[1]
    }

    fn handle_admin_doorbell(inner: &mut MockInner, new_tail: u16) {
        let Some(bar0) = inner.bars.get(&0) else {
            return;
        };
        let base = bar0.mapping.virt;
        // SAFETY: the register file is backed host memory.
        let (asq, acq, aqa) = unsafe {
            (
                ptr::read_volatile((base + 0x28) as *const u64),
                ptr::read_volatile((base + 0x30) as *const u64),
                ptr::read_volatile((base + 0x24) as *const u32),
            )
        };
        if asq == 0 || acq == 0 {
            return;
        }
        let sq_entries = (aqa & 0xFFF) as u16 + 1;
        let cq_entries = ((aqa >> 16) & 0xFFF) as u16 + 1;

        let Some(admin) = inner.admin.as_mut() else {
            return;
        };
        while admin.sq_head != new_tail {
            // SAFETY: the rings live in identity-mapped mock DMA memory.
            let cmd = unsafe {
                ptr::read_volatile(
                    (asq as usize + admin.sq_head as usize * 64) as *const NvmeCommand,
                )
            };
            admin.sq_head = (admin.sq_head + 1) % sq_entries;

            let mut cpl = NvmeCompletion::new_zeroed();
            cpl.sq_head = admin.sq_head;
            cpl.sq_id = 0;
            cpl.cid = cmd.cid;
            if let Some(&(sct, sc)) = admin.failures.get(&cmd.opcode) {
                cpl.set_status(sct, sc, false);
            }
            cpl.status |= admin.phase;

            // SAFETY: as above; the CQE slot is within the admin CQ.
            unsafe {
                ptr::write_volatile(
                    (acq as usize + admin.cq_tail as usize * 16) as *mut NvmeCompletion,
                    cpl,
                );
            }
            admin.cq_tail = (admin.cq_tail + 1) % cq_entries;
            if admin.cq_tail == 0 {
                admin.phase ^= 1;
            }
            admin.seen.push(cmd);
        }
    }
}

impl Platform for MockPlatform {
    fn map_bar(&self, bar_index: u8) -> Result<BarMapping> {
        self.inner
            .lock()
            .bars
            .get(&bar_index)
            .map(|bar| bar.mapping)
            .ok_or(TransportError::IoError)
    }

    fn unmap_bar(&self, _mapping: BarMapping) -> Result<()> {
        Ok(())
    }

    fn cfg_read32(&self, offset: u16) -> Result<u32> {
        Ok(self.inner.lock().cfg[offset as usize / 4])
    }

    fn cfg_write32(&self, offset: u16, value: u32) -> Result<()> {
        self.inner.lock().cfg[offset as usize / 4] = value;
        Ok(())
    }

    fn dma_alloc(&self, size: usize, align: usize) -> Result<DmaChunk> {
        let backing = alloc_backing(size, align);
        let chunk = DmaChunk {
            virt: backing.ptr as usize,
            phys: backing.ptr as u64,
            size,
        };
        self.inner.lock().dma.push(backing);
        Ok(chunk)
    }

    fn dma_free(&self, chunk: DmaChunk) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner
            .dma
            .iter()
            .position(|a| a.ptr as usize == chunk.virt)
        {
            let allocation = inner.dma.swap_remove(pos);
            // SAFETY: the allocation was produced by `alloc_backing`
            // and is freed exactly once.
            unsafe { std::alloc::dealloc(allocation.ptr, allocation.layout) };
        }
    }

    fn virt_to_phys(&self, virt: usize) -> Option<u64> {
        let inner = self.inner.lock();
        (!inner.poisoned.contains(&virt)).then_some(virt as u64)
    }

    fn mmio_read32(&self, addr: usize) -> u32 {
        // SAFETY: mock MMIO windows are backed host memory.
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn mmio_write32(&self, addr: usize, value: u32) {
        let mut inner = self.inner.lock();
        let bar0 = inner.bars.get(&0).map(|bar| bar.mapping);
        if let Some(bar0) = bar0 {
            if addr >= bar0.virt + DOORBELL_BASE && addr < bar0.virt + bar0.size {
                let offset = addr - bar0.virt;
                inner.doorbells.push((offset, value));
                if offset == DOORBELL_BASE {
                    Self::handle_admin_doorbell(&mut inner, value as u16);
                }
                return;
            }
        }
        // SAFETY: as in `mmio_read32`.
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    fn mmio_read64(&self, addr: usize) -> u64 {
        // SAFETY: as in `mmio_read32`.
        unsafe { ptr::read_volatile(addr as *const u64) }
    }

    fn mmio_write64(&self, addr: usize, value: u64) {
        // SAFETY: as in `mmio_read32`.
        unsafe { ptr::write_volatile(addr as *mut u64, value) }
    }

    fn wmb(&self) {
        fence(Ordering::SeqCst);
    }

    fn process_id(&self) -> u32 {
        self.inner.lock().pid
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for bar in inner.bars.values() {
            // SAFETY: each backing allocation is freed exactly once.
            unsafe { std::alloc::dealloc(bar.backing.ptr, bar.backing.layout) };
        }
        for allocation in &inner.dma {
            // SAFETY: as above; anything already freed through
            // `dma_free` was removed from the list.
            unsafe { std::alloc::dealloc(allocation.ptr, allocation.layout) };
        }
    }
}

/// Writes a CAP value into the mock register file.
pub(crate) fn set_cap(platform: &MockPlatform, mqes: u16, dstrd: u32) {
    let bar = platform.map_bar(0).unwrap();
    platform.mmio_write64(bar.virt, (mqes as u64) | ((dstrd as u64) << 32));
}

/// Encodes a CMBSZ value from its fields.
pub(crate) fn cmbsz_raw(sz: u32, szu: u32, sqs: bool) -> u32 {
    (sz << 12) | (szu << 8) | sqs as u32
}

/// Encodes a CMBLOC value from its fields.
pub(crate) fn cmbloc_raw(bir: u32, ofst: u32) -> u32 {
    (ofst << 12) | bir
}

/// Writes a CQE into a completion ring slot, device-style.
pub(crate) fn push_cqe(cq_virt: usize, index: u16, cpl: NvmeCompletion) {
    // SAFETY: callers pass a CQ ring allocated through the mock
    // platform, and `index` is within it.
    unsafe {
        ptr::write_volatile((cq_virt + index as usize * 16) as *mut NvmeCompletion, cpl);
    }
}

/// Builds a success CQE with the given phase and command id.
pub(crate) fn success_cqe(cid: u16, phase: u16) -> NvmeCompletion {
    let mut cpl = NvmeCompletion::new_zeroed();
    cpl.cid = cid;
    cpl.status = phase & 1;
    cpl
}
