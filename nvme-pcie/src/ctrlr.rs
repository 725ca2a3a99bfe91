// SPDX-License-Identifier: MPL-2.0

//! Controller-level glue of the PCIe transport.
//!
//! [`PcieController`] owns the register window, the optional controller
//! memory buffer, and the admin queue pair, and turns queue lifecycle
//! requests from the upper controller layer into admin commands. It
//! also keeps the per-process registry that routes admin completions
//! back to the process that issued them when a controller is shared
//! over shared memory.

use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use int_to_c_enum::TryFromInt;
use log::error;
use spin::Mutex;

use crate::{
    MAX_XFER_SIZE,
    cmb::CmbRegion,
    error::{Result, TransportError},
    nvme_cmd::{self, NvmeCommand, NvmeCompletion},
    nvme_queue::{ADMIN_QUEUE_ENTRIES, IO_QUEUE_ENTRIES, NvmeQueuePair},
    nvme_regs::{CapRegister, NvmeDoorBellRegs, NvmeRegs32, NvmeRegs64, RegisterWindow, aqa_register},
    platform::Platform,
    request::NvmeRequest,
};

/// PCI command register offset in configuration space.
const PCI_COMMAND: u16 = 0x04;
/// Bus Master Enable plus Interrupt Disable.
const PCI_COMMAND_BUSMASTER_INTX_DISABLE: u32 = 0x404;

bitflags! {
    /// Capabilities the upper controller layer has established, fed
    /// back into the transport's payload handling.
    pub struct ControllerFlags: u32 {
        /// The controller accepts SGL-described data transfers.
        const SGL_SUPPORTED = 1 << 0;
    }
}

/// NVMe submission queue priority classes, encoded into the Create I/O
/// SQ command when weighted-round-robin arbitration is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
pub enum QueuePriority {
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

/// Tunables fixed at controller construction.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Place submission queues in the controller memory buffer when the
    /// device allows it.
    pub use_cmb_sqs: bool,
    /// How many times a transiently failed command is resubmitted
    /// before its failure is delivered.
    pub retry_count: u8,
    /// Initial capability flags; usually updated after identify via
    /// [`PcieController::set_flags`].
    pub flags: ControllerFlags,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            use_cmb_sqs: false,
            retry_count: 4,
            flags: ControllerFlags::empty(),
        }
    }
}

struct ProcessState {
    pending: VecDeque<Box<NvmeRequest>>,
}

/// Controller state shared with every queue pair.
pub(crate) struct ControllerShared {
    platform: Arc<dyn Platform>,
    opts: ControllerOptions,
    flags: AtomicU32,
    is_resetting: AtomicBool,
    doorbell_base: usize,
    doorbell_stride_u32: u32,
    processes: Mutex<BTreeMap<u32, ProcessState>>,
}

impl ControllerShared {
    pub(crate) fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    pub(crate) fn platform_arc(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub(crate) fn use_cmb_sqs(&self) -> bool {
        self.opts.use_cmb_sqs
    }

    pub(crate) fn retry_count(&self) -> u8 {
        self.opts.retry_count
    }

    pub(crate) fn sgl_supported(&self) -> bool {
        ControllerFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
            .contains(ControllerFlags::SGL_SUPPORTED)
    }

    pub(crate) fn set_flags(&self, flags: ControllerFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn is_resetting(&self) -> bool {
        self.is_resetting.load(Ordering::Relaxed)
    }

    pub(crate) fn set_resetting(&self, resetting: bool) {
        self.is_resetting.store(resetting, Ordering::Relaxed);
    }

    pub(crate) fn sq_doorbell(&self, qid: u16) -> usize {
        self.doorbell_base
            + NvmeDoorBellRegs::Sqtdb.offset(qid, self.doorbell_stride_u32) as usize
    }

    pub(crate) fn cq_doorbell(&self, qid: u16) -> usize {
        self.doorbell_base
            + NvmeDoorBellRegs::Cqhdb.offset(qid, self.doorbell_stride_u32) as usize
    }

    pub(crate) fn register_process(&self, pid: u32) {
        self.processes.lock().entry(pid).or_insert(ProcessState {
            pending: VecDeque::new(),
        });
    }

    pub(crate) fn unregister_process(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }

    /// Parks an admin completion for the process that issued the
    /// request; it is delivered at the tail of that process's poll.
    pub(crate) fn park_pending_admin_request(
        &self,
        mut req: Box<NvmeRequest>,
        cpl: &NvmeCompletion,
    ) {
        req.cpl = *cpl;
        let pid = req.pid;
        let mut processes = self.processes.lock();
        match processes.get_mut(&pid) {
            Some(process) => process.pending.push_back(req),
            None => {
                error!("[NVMe]: owning process {} not found, dropping its admin completion", pid);
            }
        }
    }

    /// Delivers completions other pollers parked for the current
    /// process.
    ///
    /// The pending list is detached under the lock and the callbacks
    /// run after it is released, so a callback may reenter the
    /// transport.
    pub(crate) fn drain_pending_admin_requests(&self) {
        let pid = self.platform.process_id();
        let drained = {
            let mut processes = self.processes.lock();
            processes
                .get_mut(&pid)
                .map(|process| core::mem::take(&mut process.pending))
        };
        let Some(drained) = drained else {
            error!("[NVMe]: polling process {} is not registered", pid);
            return;
        };
        for mut req in drained {
            let cpl = req.cpl;
            if let Some(callback) = req.callback.take() {
                callback(&cpl);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(
        platform: Arc<dyn Platform>,
        opts: ControllerOptions,
    ) -> Arc<Self> {
        let bar0 = platform.map_bar(0).unwrap();
        let shared = Arc::new(Self {
            flags: AtomicU32::new(opts.flags.bits()),
            is_resetting: AtomicBool::new(false),
            doorbell_base: bar0.virt,
            doorbell_stride_u32: 1,
            processes: Mutex::new(BTreeMap::new()),
            opts,
            platform: platform.clone(),
        });
        shared.register_process(platform.process_id());
        shared
    }
}

/// The NVMe-over-PCIe transport of one controller.
///
/// Field order matters for teardown: the admin queue goes first (it
/// aborts leftover AERs and returns its rings), then the CMB mapping,
/// then the register BAR.
pub struct PcieController {
    adminq: NvmeQueuePair,
    cmb: Option<CmbRegion>,
    regs: RegisterWindow,
    shared: Arc<ControllerShared>,
    cap: CapRegister,
}

impl PcieController {
    /// Brings up the transport for a device: maps BAR0, enables bus
    /// mastering with INTx masked, maps the CMB if present, and builds
    /// the admin queue pair.
    pub fn construct(platform: Arc<dyn Platform>, mut opts: ControllerOptions) -> Result<Self> {
        let regs = RegisterWindow::map(platform.clone())?;

        let mut cmd_reg = platform.cfg_read32(PCI_COMMAND)?;
        cmd_reg |= PCI_COMMAND_BUSMASTER_INTX_DISABLE;
        platform.cfg_write32(PCI_COMMAND, cmd_reg)?;

        let cap = CapRegister(regs.get_reg64(NvmeRegs64::Cap as u32)?);
        // The stride is 2^(2 + DSTRD) bytes; keep it in dword units.
        let doorbell_stride_u32 = 1u32 << cap.dstrd();

        let mut cmb = CmbRegion::try_map(&platform, &regs);
        if !cmb.as_ref().is_some_and(|cmb| cmb.allows_sq_placement()) {
            opts.use_cmb_sqs = false;
        }

        let shared = Arc::new(ControllerShared {
            flags: AtomicU32::new(opts.flags.bits()),
            is_resetting: AtomicBool::new(false),
            doorbell_base: regs.bar().virt,
            doorbell_stride_u32,
            processes: Mutex::new(BTreeMap::new()),
            opts,
            platform: platform.clone(),
        });
        shared.register_process(platform.process_id());

        let adminq = NvmeQueuePair::new(
            shared.clone(),
            cmb.as_mut(),
            0,
            ADMIN_QUEUE_ENTRIES,
            QueuePriority::Urgent,
        )?;

        Ok(Self {
            adminq,
            cmb,
            regs,
            shared,
            cap,
        })
    }

    /// Programs the admin queue into the controller registers.
    ///
    /// The caller still owns the CC.EN dance; this only publishes ASQ,
    /// ACQ and AQA.
    pub fn enable(&mut self) -> Result<()> {
        self.regs
            .set_reg64(NvmeRegs64::Asq as u32, self.adminq.sq_bus_addr())?;
        self.regs
            .set_reg64(NvmeRegs64::Acq as u32, self.adminq.cq_bus_addr())?;

        // Both sizes are 0-based.
        let entries = self.adminq.num_entries() - 1;
        self.regs
            .set_reg32(NvmeRegs32::Aqa as u32, aqa_register(entries, entries))?;
        Ok(())
    }

    /// The controller's capability register, read at construction.
    pub fn cap(&self) -> CapRegister {
        self.cap
    }

    /// Largest transfer a single command can carry.
    pub fn max_transfer_size() -> u32 {
        MAX_XFER_SIZE
    }

    pub fn get_reg32(&self, offset: u32) -> Result<u32> {
        self.regs.get_reg32(offset)
    }

    pub fn get_reg64(&self, offset: u32) -> Result<u64> {
        self.regs.get_reg64(offset)
    }

    pub fn set_reg32(&self, offset: u32, value: u32) -> Result<()> {
        self.regs.set_reg32(offset, value)
    }

    pub fn set_reg64(&self, offset: u32, value: u64) -> Result<()> {
        self.regs.set_reg64(offset, value)
    }

    /// The admin queue pair.
    pub fn adminq_mut(&mut self) -> &mut NvmeQueuePair {
        &mut self.adminq
    }

    /// Marks a controller-level reset in progress; while set, queue
    /// pairs park new submissions instead of enabling themselves.
    pub fn set_resetting(&self, resetting: bool) {
        self.shared.set_resetting(resetting);
    }

    /// Publishes capability flags established by the upper layer.
    pub fn set_flags(&self, flags: ControllerFlags) {
        self.shared.set_flags(flags);
    }

    /// Registers a process sharing this controller, so its admin
    /// completions can be parked for it.
    pub fn register_process(&self, pid: u32) {
        self.shared.register_process(pid);
    }

    pub fn unregister_process(&self, pid: u32) {
        self.shared.unregister_process(pid);
    }

    /// Creates an I/O queue pair: host (or CMB) resources first, then
    /// the Create I/O CQ / Create I/O SQ admin commands.
    pub fn create_io_qpair(&mut self, qid: u16, qprio: QueuePriority) -> Result<NvmeQueuePair> {
        // The ring must not exceed what the controller supports.
        let num_entries = u32::min(IO_QUEUE_ENTRIES as u32, self.cap.mqes() as u32 + 1) as u16;

        let mut qpair = NvmeQueuePair::new(
            self.shared.clone(),
            self.cmb.as_mut(),
            qid,
            num_entries,
            qprio,
        )?;
        self.setup_io_qpair(&mut qpair)?;
        Ok(qpair)
    }

    /// Re-registers an existing I/O queue pair with the controller,
    /// e.g. after a controller reset.
    pub fn reinit_io_qpair(&mut self, qpair: &mut NvmeQueuePair) -> Result<()> {
        self.setup_io_qpair(qpair)
    }

    fn setup_io_qpair(&mut self, qpair: &mut NvmeQueuePair) -> Result<()> {
        let cq_cmd = nvme_cmd::create_io_completion_queue(
            qpair.id(),
            qpair.num_entries(),
            qpair.cq_bus_addr(),
        );
        self.submit_admin_sync(cq_cmd)?;

        let sq_cmd = nvme_cmd::create_io_submission_queue(
            qpair.id(),
            qpair.num_entries(),
            qpair.id(),
            qpair.qprio() as u8,
            qpair.sq_bus_addr(),
        );
        if let Err(err) = self.submit_admin_sync(sq_cmd) {
            // Take the half-created pair back down before reporting.
            let _ = self.submit_admin_sync(nvme_cmd::delete_io_completion_queue(qpair.id()));
            return Err(err);
        }

        qpair.reset();
        Ok(())
    }

    /// Deletes an I/O queue pair: the submission queue first, then its
    /// completion queue, then the host resources.
    ///
    /// The queue pair is consumed either way; if a delete command
    /// fails, the error is reported after the host resources are
    /// already gone.
    pub fn delete_io_qpair(&mut self, qpair: NvmeQueuePair) -> Result<()> {
        let qid = qpair.id();
        self.submit_admin_sync(nvme_cmd::delete_io_submission_queue(qid))?;
        self.submit_admin_sync(nvme_cmd::delete_io_completion_queue(qid))?;
        drop(qpair);
        Ok(())
    }

    /// Issues one admin command and polls the admin queue until its
    /// completion arrives.
    fn submit_admin_sync(&mut self, cmd: NvmeCommand) -> Result<NvmeCompletion> {
        let status: Arc<Mutex<Option<NvmeCompletion>>> = Arc::new(Mutex::new(None));

        let slot = status.clone();
        let req = NvmeRequest::without_payload(cmd, self.shared.platform.process_id(), move |cpl| {
            *slot.lock() = Some(*cpl);
        });
        self.adminq.submit(Box::new(req))?;

        loop {
            self.adminq.poll(0);
            if let Some(cpl) = status.lock().take() {
                if cpl.is_error() {
                    error!(
                        "[NVMe]: admin command {:#x} failed: sct {:#x} sc {:#x}",
                        cmd.opcode,
                        cpl.sct(),
                        cpl.sc()
                    );
                    return Err(TransportError::ControllerError);
                }
                return Ok(cpl);
            }
        }
    }
}
