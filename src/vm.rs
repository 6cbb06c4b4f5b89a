//! Virtual Machine Management
//!
//! A `Vm` starts as a configuration record. Its resources (stage-2 tables,
//! guest memory, vGIC, devices and vCPUs) are allocated the first time it
//! runs and released when it is deleted.

use alloc::vec::Vec;

use log::{error, info, warn};

use crate::arch::traits::{HostKernel, Platform};
use crate::config::{OsImage, OsType, VmName};
use crate::devices::gic::{VgicGeometry, Vgic};
use crate::devices::vconsole::VirtualConsole;
use crate::devices::{DeviceManager, VirtualDevice};
use crate::error::HypError;
use crate::mm::MmContext;
use crate::platform::{MEM_BLOCK_SIZE, VTIMER_INTID};
use crate::sync::SpinLock;
use crate::vcpu::{Vcpu, VcpuStatus};

/// VM Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    NeverRun,
    Online,
    Suspended,
    Offline,
    Unknown,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::NeverRun => "never",
            VmStatus::Online => "online",
            VmStatus::Suspended => "suspend",
            VmStatus::Offline => "offline",
            VmStatus::Unknown => "unknown",
        }
    }
}

/// Everything a VM owns once it has run
pub struct VmResources {
    /// Stage-2 tables and memory accounting, behind the VM-scoped lock
    pub mm: SpinLock<MmContext>,
    pub vgic: Vgic,
    pub devices: DeviceManager,
    pub vcpus: Vec<Vcpu>,
    /// VTTBR_EL2 value: root table tagged with the VMID
    pub vttbr: u64,
    pub vtcr: u64,
    /// Host counter value at VM creation; guest time is `now - cnt_offset`
    pub cnt_offset: u64,
    /// Host physical base of guest RAM
    mem_pa: u64,
    /// Guest RAM came from the host allocator rather than a fixed window
    owns_mem: bool,
}

pub struct Vm {
    /// Slot index, also the VMID
    id: usize,
    name: VmName,
    config: OsImage,
    status: VmStatus,
    res: Option<VmResources>,
}

impl Vm {
    pub fn new(id: usize, name: &str, config: OsImage) -> Self {
        Self {
            id,
            name: VmName::new(name),
            config,
            status: VmStatus::NeverRun,
            res: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &VmName {
        &self.name
    }

    pub fn config(&self) -> &OsImage {
        &self.config
    }

    pub fn os_type(&self) -> OsType {
        self.config.os_type
    }

    pub fn nr_vcpus(&self) -> usize {
        self.config.nr_vcpus
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    pub fn resources(&self) -> Option<&VmResources> {
        self.res.as_ref()
    }

    pub fn resources_mut(&mut self) -> Option<&mut VmResources> {
        self.res.as_mut()
    }

    pub fn vcpu(&self, idx: usize) -> Option<&Vcpu> {
        self.res.as_ref()?.vcpus.get(idx)
    }

    pub fn vcpu_mut(&mut self, idx: usize) -> Option<&mut Vcpu> {
        self.res.as_mut()?.vcpus.get_mut(idx)
    }

    /// Host physical base of guest RAM, once allocated.
    pub fn mem_base(&self) -> Option<u64> {
        self.res.as_ref().map(|r| r.mem_pa)
    }

    // ── One-time initialization ─────────────────────────────────────

    fn init<P: Platform + ?Sized>(&mut self, p: &mut P, geo: VgicGeometry) -> Result<(), HypError> {
        let cfg = self.config;
        let (mem_pa, owns_mem) = match cfg.phymem {
            Some(pa) => (pa, false),
            None => {
                let pa = p
                    .alloc_guest_memory(cfg.mem_size, MEM_BLOCK_SIZE)
                    .ok_or(HypError::AllocFailure)?;
                (pa, true)
            }
        };

        match self.build(p, geo, mem_pa, owns_mem) {
            Ok(res) => {
                self.res = Some(res);
                info!("vm {}: initialized, {} MiB at {:#x}", self.id, cfg.mem_size >> 20, mem_pa);
                Ok(())
            }
            Err(e) => {
                error!("vm {}: init failed: {}", self.id, e);
                if owns_mem {
                    p.free_guest_memory(mem_pa, cfg.mem_size);
                }
                Err(e)
            }
        }
    }

    fn build<P: Platform + ?Sized>(
        &self,
        p: &mut P,
        geo: VgicGeometry,
        mem_pa: u64,
        owns_mem: bool,
    ) -> Result<VmResources, HypError> {
        let cfg = &self.config;

        let mut mm = MmContext::new(self.id as u16, cfg.mem_size)?;
        mm.map_memory(cfg.mem_ipa, mem_pa, cfg.mem_size)?;
        for dev in cfg.passthrough() {
            mm.map_device(dev.ipa, dev.pa, dev.size)?;
        }
        load_image(&mm, cfg, p)?;

        let mut vgic = Vgic::new(
            cfg.nr_vcpus,
            cfg.vgic.virq_num,
            cfg.vgic.gicd_base,
            cfg.vgic.gicr_base,
            geo,
        )?;
        vgic.bind_hw(VTIMER_INTID, VTIMER_INTID);
        for intid in cfg.passthrough().filter_map(|d| d.intid) {
            if !vgic.bind_hw(intid, intid) {
                warn!("vm {}: device interrupt {} outside virq range", self.id, intid);
            }
        }

        let mut devices = DeviceManager::new();
        if let Some(c) = cfg.console {
            devices.register_device(VirtualDevice::Console(VirtualConsole::new(c.base, c.size, c.intid)));
        }

        let mut vcpus = Vec::new();
        vcpus
            .try_reserve_exact(cfg.nr_vcpus)
            .map_err(|_| HypError::AllocFailure)?;
        for i in 0..cfg.nr_vcpus {
            vcpus.push(Vcpu::new(self.id, i, cfg.entry, cfg.affinity[i]));
        }

        Ok(VmResources {
            vttbr: mm.stage2().vttbr(),
            vtcr: mm.stage2().vtcr(),
            mm: SpinLock::new(mm),
            vgic,
            devices,
            vcpus,
            cnt_offset: p.now(),
            mem_pa,
            owns_mem,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// `NeverRun | Suspended | Offline -> Online`
    pub fn run<P: Platform + ?Sized>(&mut self, p: &mut P, geo: VgicGeometry) -> Result<(), HypError> {
        let from = self.status;
        match from {
            VmStatus::Online => {
                warn!("vm {}: already online", self.id);
                return Ok(());
            }
            VmStatus::Unknown => return Err(HypError::InvalidState),
            VmStatus::NeverRun => self.init(p, geo)?,
            // Halted before it ever ran
            VmStatus::Offline if self.res.is_none() => self.init(p, geo)?,
            VmStatus::Offline | VmStatus::Suspended => {}
        }

        let id = self.id;
        let res = self.res.as_mut().ok_or(HypError::InvalidState)?;
        let mut failed = None;
        for vcpu in res.vcpus.iter_mut() {
            let wanted = match from {
                // Faulted vCPUs stay down across a resume.
                VmStatus::Suspended => vcpu.status() == VcpuStatus::Suspended,
                _ => vcpu.status() != VcpuStatus::Online,
            };
            if !wanted {
                continue;
            }
            if from != VmStatus::Suspended {
                res.vgic.reset_vcpu(vcpu.id());
            }
            if let Err(e) = vcpu.go(p) {
                failed = Some(e);
                break;
            }
        }

        if let Some(e) = failed {
            error!("vm {}: failed to start vcpus: {}", id, e);
            match from {
                VmStatus::Suspended => self.status = VmStatus::Unknown,
                _ => {
                    for vcpu in res.vcpus.iter_mut() {
                        if vcpu.status() == VcpuStatus::Online {
                            let _ = vcpu.shutdown(p);
                        }
                    }
                    if from == VmStatus::NeverRun {
                        self.release(p);
                    }
                }
            }
            return Err(e);
        }

        info!("vm {}: {} -> online", id, from.as_str());
        self.status = VmStatus::Online;
        Ok(())
    }

    /// `Online -> Suspended`
    pub fn pause<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> Result<(), HypError> {
        if self.status != VmStatus::Online {
            return Err(HypError::InvalidState);
        }
        let res = self.res.as_mut().ok_or(HypError::InvalidState)?;
        for vcpu in res.vcpus.iter_mut() {
            let ret = match vcpu.status() {
                VcpuStatus::Online => vcpu.suspend(kernel),
                VcpuStatus::Suspended => {
                    vcpu.hold();
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = ret {
                error!("vm {}: pause failed at vcpu {}", self.id, vcpu.id());
                self.status = VmStatus::Unknown;
                return Err(e);
            }
        }
        info!("vm {}: online -> suspend", self.id);
        self.status = VmStatus::Suspended;
        Ok(())
    }

    /// `NeverRun | Online | Suspended | Unknown -> Offline`
    pub fn halt<K: HostKernel + ?Sized>(&mut self, kernel: &mut K) -> Result<(), HypError> {
        if self.status == VmStatus::Offline {
            return Err(HypError::InvalidState);
        }
        let id = self.id;
        if let Some(res) = self.res.as_mut() {
            for vcpu in res.vcpus.iter_mut() {
                if vcpu.status() == VcpuStatus::Offline {
                    continue;
                }
                // An unexpected state takes the fault path and still ends
                // up offline.
                let _ = vcpu.shutdown(kernel);
                res.vgic.reset_vcpu(vcpu.id());
            }
        }
        info!("vm {}: {} -> offline", id, self.status.as_str());
        self.status = VmStatus::Offline;
        Ok(())
    }

    /// Release every owned resource; only legal once `Offline`.
    pub fn teardown<P: Platform + ?Sized>(&mut self, p: &mut P) -> Result<(), HypError> {
        if self.status != VmStatus::Offline {
            return Err(HypError::InvalidState);
        }
        self.release(p);
        Ok(())
    }

    fn release<P: Platform + ?Sized>(&mut self, p: &mut P) {
        let Some(mut res) = self.res.take() else {
            return;
        };
        for vcpu in res.vcpus.iter_mut() {
            vcpu.timer.reset(p);
        }
        // Drop the mapping and the VMID's TLB entries before the memory is
        // handed back; the VMID is reused by the next VM in this slot.
        let (ipa, size) = (self.config.mem_ipa, self.config.mem_size);
        if let Err(e) = res.mm.lock().unmap(ipa, size, p) {
            warn!("vm {}: unmap on teardown failed: {}", self.id, e);
        }
        if res.owns_mem {
            p.free_guest_memory(res.mem_pa, size);
        }
    }
}

/// Copy the guest image to its entry address, one 2MB block at a time.
fn load_image<K: HostKernel + ?Sized>(mm: &MmContext, cfg: &OsImage, kernel: &mut K) -> Result<(), HypError> {
    let mut offset = 0;
    while offset < cfg.image_size {
        let len = (cfg.image_size - offset).min(MEM_BLOCK_SIZE);
        let dst = mm.translate(cfg.entry + offset).map_err(|e| {
            error!("load image: {:#x}: {}", cfg.entry + offset, e);
            HypError::from(e)
        })?;
        kernel.copy_phys(dst, cfg.image_addr + offset, len);
        offset += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::{SimPlatform, SIM_RAM_BASE};
    use crate::arch::traits::{SysReg, SysRegAccess};
    use crate::config::builtin_images;
    use crate::scheduler::RunState;

    fn setup() -> (SimPlatform, VgicGeometry, Vm) {
        let p = SimPlatform::default();
        let geo = VgicGeometry::probe(&p);
        let vm = Vm::new(1, "test", builtin_images()[0]);
        (p, geo, vm)
    }

    #[test]
    fn test_first_run_allocates_and_loads() {
        let (mut p, geo, mut vm) = setup();
        vm.run(&mut p, geo).unwrap();
        assert_eq!(vm.status(), VmStatus::Online);

        let res = vm.resources().unwrap();
        assert_eq!(res.mm.lock().mem_used(), 8 << 20);
        assert_eq!(vm.mem_base(), Some(SIM_RAM_BASE));
        // Entry 0x4000_8000 sits 0x8000 into guest RAM.
        assert_eq!(p.kernel.copies, [(SIM_RAM_BASE + 0x8000, 0x4500_0000, 0x2_9CD0)]);
        assert_eq!(res.vgic.virq(0, VTIMER_INTID).unwrap().pintid, Some(27));
        assert!(res.devices.console().is_some());

        let t = vm.vcpu(0).unwrap().thread().unwrap();
        assert_eq!(p.kernel.thread_state(t), RunState::Ready);
    }

    #[test]
    fn test_image_larger_than_a_block_is_chunked() {
        let (mut p, geo, _) = setup();
        let cfg = crate::config::OsImage {
            image_size: MEM_BLOCK_SIZE + 0x100,
            ..builtin_images()[0]
        };
        let mut vm = Vm::new(2, "big", cfg);
        vm.run(&mut p, geo).unwrap();
        assert_eq!(p.kernel.copies.len(), 2);
        assert_eq!(p.kernel.copies[1].2, 0x100);
        assert_eq!(p.kernel.copies[1].1, 0x4500_0000 + MEM_BLOCK_SIZE);
    }

    #[test]
    fn test_alloc_failure_keeps_never_run() {
        let (mut p, geo, mut vm) = setup();
        p.kernel.fail_alloc = 1;
        assert_eq!(vm.run(&mut p, geo), Err(HypError::AllocFailure));
        assert_eq!(vm.status(), VmStatus::NeverRun);
        assert!(vm.resources().is_none());
        // Nothing leaked: the retry gets the same memory.
        vm.run(&mut p, geo).unwrap();
        assert_eq!(vm.mem_base(), Some(SIM_RAM_BASE));
    }

    #[test]
    fn test_thread_failure_releases_memory() {
        let (mut p, geo, mut vm) = setup();
        p.kernel.thread_limit = 0;
        assert_eq!(vm.run(&mut p, geo), Err(HypError::AllocFailure));
        assert_eq!(vm.status(), VmStatus::NeverRun);
        assert!(vm.resources().is_none());
    }

    #[test]
    fn test_pause_resume_halt_delete() {
        let (mut p, geo, mut vm) = setup();
        vm.run(&mut p, geo).unwrap();
        let t = vm.vcpu(0).unwrap().thread().unwrap();

        vm.pause(&mut p).unwrap();
        assert_eq!(p.kernel.thread_state(t), RunState::Blocked);
        assert_eq!(vm.pause(&mut p), Err(HypError::InvalidState));

        vm.run(&mut p, geo).unwrap();
        assert_eq!(p.kernel.thread_state(t), RunState::Ready);

        assert_eq!(vm.teardown(&mut p), Err(HypError::InvalidState));
        vm.halt(&mut p).unwrap();
        assert_eq!(vm.vcpu(0).unwrap().status(), VcpuStatus::Offline);
        assert_eq!(p.kernel.thread_state(t), RunState::None);
        assert_eq!(vm.halt(&mut p), Err(HypError::InvalidState));

        vm.teardown(&mut p).unwrap();
        assert!(vm.resources().is_none());
        // Guest RAM unmapped with the VMID's TLB entries flushed.
        assert_eq!(p.regs.tlb_flushes().len(), 1);
        assert_eq!(p.regs.tlb_flushes()[0] >> 48, 1);
        assert_eq!(p.read(SysReg::Vttbr), 0);
    }

    #[test]
    fn test_restart_from_offline_reuses_memory() {
        let (mut p, geo, mut vm) = setup();
        vm.run(&mut p, geo).unwrap();
        vm.halt(&mut p).unwrap();
        vm.run(&mut p, geo).unwrap();
        assert_eq!(vm.status(), VmStatus::Online);
        assert_eq!(p.kernel.copies.len(), 1);
        assert_eq!(vm.vcpu(0).unwrap().status(), VcpuStatus::Online);
    }

    #[test]
    fn test_halt_never_run() {
        let (mut p, geo, mut vm) = setup();
        vm.halt(&mut p).unwrap();
        assert_eq!(vm.status(), VmStatus::Offline);
        vm.teardown(&mut p).unwrap();
        // Still runnable from a clean slate.
        vm.run(&mut p, geo).unwrap();
        assert!(vm.resources().is_some());
    }

    #[test]
    fn test_run_online_is_noop() {
        let (mut p, geo, mut vm) = setup();
        vm.run(&mut p, geo).unwrap();
        let t = vm.vcpu(0).unwrap().thread();
        vm.run(&mut p, geo).unwrap();
        assert_eq!(vm.vcpu(0).unwrap().thread(), t);
        assert_eq!(p.kernel.sched.len(), 1);
    }
}
