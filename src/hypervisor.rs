//! Hypervisor
//!
//! One `Hypervisor` owns the platform, the OS image table and every VM slot.
//! It is the only entry point for the command surface (create, pick, run,
//! pause, halt, delete, console, listings), for guest traps, for physical
//! interrupts and timer callbacks, and for the scheduler's switch hook.
//!
//! The host wraps it in a single lock; every method takes `&mut self`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use log::{debug, error, info, trace, warn};

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::hypervisor::{MmioAccess, SysRegAccessInfo, TrapClass, TrapFrame, TrapOutcome};
use crate::arch::traits::{Platform, SysReg};
use crate::config::{self, OsImage};
use crate::devices::gic::VgicGeometry;
use crate::error::{ConfigError, HypError};
use crate::mm::Bitmap64;
use crate::platform::{GIC_MAINTENANCE_INTID, MAX_VM_NUM, PTIMER_INTID, UART_INTID, VM_NAME_SIZE, VTIMER_INTID};
use crate::switch::{self, classify, ExecContext, SwitchHook, SwitchKind};
use crate::vm::{Vm, VmResources, VmStatus};
use crate::vtimer::TimerReg;

pub struct Hypervisor<P: Platform> {
    platform: P,
    images: Vec<OsImage>,
    vms: Vec<Option<Vm>>,
    used: Bitmap64,
    /// VM the command surface acts on when no index is given
    current: usize,
    /// VM holding the physical UART
    console_owner: Option<usize>,
    /// What the CPU is executing, as last reported by the switch hook
    running: ExecContext,
    geo: VgicGeometry,
}

impl<P: Platform> Hypervisor<P> {
    pub fn new(platform: P, images: Vec<OsImage>) -> Self {
        let geo = VgicGeometry::probe(&platform);
        info!(
            "hypervisor: {} OS images, {} list registers, {} priority bits",
            images.len(),
            geo.nr_lr,
            geo.nr_pr
        );
        let mut vms = Vec::with_capacity(MAX_VM_NUM);
        vms.resize_with(MAX_VM_NUM, || None);
        Self {
            platform,
            images,
            vms,
            used: Bitmap64::new(MAX_VM_NUM),
            current: 0,
            console_owner: None,
            running: ExecContext::Host,
            geo,
        }
    }

    /// Build from the built-in board profiles.
    pub fn with_builtin_images(platform: P) -> Self {
        Self::new(platform, config::builtin_images())
    }

    /// Build from a device tree blob describing the OS images.
    pub fn from_fdt(platform: P, blob: &[u8]) -> Result<Self, ConfigError> {
        let images = config::parse_images(blob)?;
        for img in &images {
            img.validate()?;
        }
        Ok(Self::new(platform, images))
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn images(&self) -> &[OsImage] {
        &self.images
    }

    pub fn geometry(&self) -> VgicGeometry {
        self.geo
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn console_owner(&self) -> Option<usize> {
        self.console_owner
    }

    pub fn running(&self) -> ExecContext {
        self.running
    }

    pub fn vm_count(&self) -> usize {
        self.used.count()
    }

    pub fn vm(&self, idx: usize) -> Option<&Vm> {
        self.vms.get(idx)?.as_ref()
    }

    pub fn vm_mut(&mut self, idx: usize) -> Option<&mut Vm> {
        self.vms.get_mut(idx)?.as_mut()
    }

    /// Status of VM `idx`, if the slot is in use.
    pub fn vm_status(&self, idx: usize) -> Option<VmStatus> {
        self.vm(idx).map(|vm| vm.status())
    }

    /// Counter value the guests of VM `idx` see.
    pub fn guest_counter(&self, idx: usize) -> Option<u64> {
        let res = self.vm(idx)?.resources()?;
        Some(self.platform.now().wrapping_sub(res.cnt_offset))
    }

    fn resolve(&self, idx: Option<usize>) -> Result<usize, HypError> {
        let idx = idx.unwrap_or(self.current);
        if idx >= MAX_VM_NUM || !self.used.is_set(idx) {
            return Err(HypError::IndexOutOfRange);
        }
        Ok(idx)
    }

    // ── Command surface ─────────────────────────────────────────────

    /// Allocate a slot for a VM of OS image `os_idx` and select it.
    pub fn create_vm(&mut self, name: &str, os_idx: usize) -> Result<usize, HypError> {
        let image = *self.images.get(os_idx).ok_or(HypError::IndexOutOfRange)?;
        let idx = self.used.alloc().ok_or(HypError::NoFreeSlot)?;
        let vm = Vm::new(idx, name, image);
        info!("vm {}: created '{}' ({})", idx, vm.name(), image.os_type.as_str());
        self.vms[idx] = Some(vm);
        self.current = idx;
        Ok(idx)
    }

    /// Select the VM later commands act on.
    pub fn pick_vm(&mut self, idx: usize) -> Result<(), HypError> {
        if idx >= MAX_VM_NUM {
            return Err(HypError::IndexOutOfRange);
        }
        self.current = idx;
        Ok(())
    }

    pub fn run_vm(&mut self, idx: Option<usize>) -> Result<(), HypError> {
        let idx = self.resolve(idx)?;
        let geo = self.geo;
        let vm = self.vms[idx].as_mut().ok_or(HypError::IndexOutOfRange)?;
        vm.run(&mut self.platform, geo)?;
        if self.console_owner == Some(idx) {
            self.connect_console(idx);
        }
        Ok(())
    }

    pub fn pause_vm(&mut self, idx: Option<usize>) -> Result<(), HypError> {
        let idx = self.resolve(idx)?;
        let vm = self.vms[idx].as_mut().ok_or(HypError::IndexOutOfRange)?;
        vm.pause(&mut self.platform)
    }

    pub fn halt_vm(&mut self, idx: Option<usize>) -> Result<(), HypError> {
        let idx = self.resolve(idx)?;
        let vm = self.vms[idx].as_mut().ok_or(HypError::IndexOutOfRange)?;
        vm.halt(&mut self.platform)
    }

    /// Release an `Offline` VM and free its slot.
    pub fn delete_vm(&mut self, idx: Option<usize>) -> Result<(), HypError> {
        let idx = self.resolve(idx)?;
        let vm = self.vms[idx].as_mut().ok_or(HypError::IndexOutOfRange)?;
        vm.teardown(&mut self.platform)?;
        if self.console_owner == Some(idx) {
            self.console_owner = None;
        }
        self.vms[idx] = None;
        self.used.free(idx);
        info!("vm {}: deleted", idx);
        Ok(())
    }

    /// Give VM `idx` the physical UART. The previous owner, if any, loses it.
    pub fn attach_console(&mut self, idx: usize) -> Result<(), HypError> {
        let idx = self.resolve(Some(idx))?;
        if self.console_owner == Some(idx) {
            return Ok(());
        }
        self.detach_console();
        self.console_owner = Some(idx);
        self.connect_console(idx);
        info!("console: attached to vm {}", idx);
        Ok(())
    }

    /// Return the UART to the host. Yields the VM that held it.
    pub fn detach_console(&mut self) -> Option<usize> {
        let owner = self.console_owner.take()?;
        if let Some(res) = self.vms[owner].as_mut().and_then(|vm| vm.resources_mut()) {
            if let Some(con) = res.devices.console_mut() {
                con.detach();
                res.vgic.unbind_hw(con.intid());
            }
        }
        info!("console: detached from vm {}", owner);
        Some(owner)
    }

    /// Route the UART into an initialized VM's console. A VM that has not
    /// run yet is connected on its first `run`.
    fn connect_console(&mut self, idx: usize) {
        let Some(res) = self.vms[idx].as_mut().and_then(|vm| vm.resources_mut()) else {
            return;
        };
        if let Some(con) = res.devices.console_mut() {
            con.attach();
            if !res.vgic.bind_hw(con.intid(), UART_INTID) {
                warn!("console: vm {} virq {} out of range", idx, con.intid());
            }
        }
    }

    /// VM table in the shell's `list_vm` format.
    pub fn list_vms(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:<w$}  vm id status   OS type    vcpu mem(M)", "vm name", w = VM_NAME_SIZE);
        let _ = writeln!(out, "{:-<w$} ------ -------- ---------- ---- ------", "", w = VM_NAME_SIZE);
        for idx in self.used.iter() {
            let Some(vm) = self.vm(idx) else {
                continue;
            };
            let selected = idx == self.current;
            if selected {
                out.push_str("\x1b[34m");
            }
            let _ = write!(
                out,
                "{:<w$.w$}    {:03} {:<8} {:<10} {:>4} {:>6}",
                vm.name(),
                vm.id(),
                vm.status().as_str(),
                vm.os_type().as_str(),
                vm.nr_vcpus(),
                vm.config().mem_size >> 20,
                w = VM_NAME_SIZE
            );
            if selected {
                out.push_str("\x1b[0m");
            }
            out.push('\n');
        }
        out
    }

    /// Supported OS images, with the index `create_vm` expects.
    pub fn list_os_images(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "idx name             OS type    vcpu mem(M) entry");
        for (i, img) in self.images.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:>3} {:<16} {:<10} {:>4} {:>6} 0x{:x}",
                i,
                img.name,
                img.os_type.as_str(),
                img.nr_vcpus,
                img.mem_size >> 20,
                img.entry
            );
        }
        out
    }

    pub fn dump_vcpu(&self, vm: usize, vcpu: usize) -> Result<String, HypError> {
        let v = self
            .vm(vm)
            .and_then(|vm| vm.vcpu(vcpu))
            .ok_or(HypError::IndexOutOfRange)?;
        let mut out = String::new();
        let _ = write!(out, "{}", v.dump());
        Ok(out)
    }

    // ── Interrupts and timers ───────────────────────────────────────

    /// Inject virq `id` into a vCPU and wake it if it sleeps in WFI.
    pub fn inject(&mut self, vm: usize, vcpu: usize, id: u32) -> Result<(), HypError> {
        let res = self
            .vms
            .get_mut(vm)
            .and_then(|v| v.as_mut())
            .and_then(|v| v.resources_mut())
            .ok_or(HypError::IndexOutOfRange)?;
        deliver(&mut self.platform, res, vcpu, id)
    }

    /// Host timer callback for the emulated physical timer of a vCPU.
    pub fn timer_expired(&mut self, vm: usize, vcpu: usize) {
        let Some(res) = self.vms.get_mut(vm).and_then(|v| v.as_mut()).and_then(|v| v.resources_mut()) else {
            return;
        };
        let Some(v) = res.vcpus.get_mut(vcpu) else {
            return;
        };
        if v.timer.expire() {
            trace!("vtimer: vm {} vcpu {} fired", vm, vcpu);
            let _ = deliver(&mut self.platform, res, vcpu, PTIMER_INTID);
        }
    }

    /// Physical interrupt taken while a vCPU was running or for a
    /// hardware-bound SPI. Returns whether anything consumed it.
    pub fn host_irq(&mut self, intid: u32) -> bool {
        match intid {
            GIC_MAINTENANCE_INTID | VTIMER_INTID => {
                let ExecContext::Vcpu { vm, vcpu } = self.running else {
                    return false;
                };
                let Some(res) = self.vms.get_mut(vm).and_then(|v| v.as_mut()).and_then(|v| v.resources_mut()) else {
                    return false;
                };
                if intid == GIC_MAINTENANCE_INTID {
                    res.vgic.handle_maintenance(&mut self.platform, vcpu);
                } else {
                    let _ = deliver(&mut self.platform, res, vcpu, VTIMER_INTID);
                }
                true
            }
            _ => {
                for slot in self.vms.iter_mut() {
                    let Some(res) = slot.as_mut().and_then(|v| v.resources_mut()) else {
                        continue;
                    };
                    let Some(id) = res.vgic.find_hw_spi(intid) else {
                        continue;
                    };
                    let target = res.vgic.virq(0, id).map_or(0, |v| v.vcpu);
                    let _ = deliver(&mut self.platform, res, target, id);
                    return true;
                }
                debug!("irq {}: no owner", intid);
                false
            }
        }
    }

    // ── Traps ───────────────────────────────────────────────────────

    /// Handle a synchronous exception using the fault state in the EL2
    /// registers.
    pub fn handle_trap(&mut self) -> TrapOutcome {
        let frame = TrapFrame::capture(&self.platform);
        let class = frame.classify();
        if let TrapClass::Host { ec } = class {
            error!("hypervisor: fatal exception in host context, EC=0x{:x} ESR=0x{:x}", ec, frame.esr);
            return TrapOutcome::HostFatal;
        }
        let ExecContext::Vcpu { vm, vcpu } = self.running else {
            error!("hypervisor: guest trap with no vcpu loaded, ESR=0x{:x}", frame.esr);
            return TrapOutcome::HostFatal;
        };
        let Some(res) = self.vms.get_mut(vm).and_then(|v| v.as_mut()).and_then(|v| v.resources_mut()) else {
            error!("hypervisor: trap from vm {} which has no resources", vm);
            return TrapOutcome::HostFatal;
        };
        trace!("trap: vm {} vcpu {}: {}", vm, vcpu, class);
        dispatch(&mut self.platform, res, vcpu, class)
    }
}

/// Pend `id` on `vcpu` and wake the target from WFI if the virq became
/// pending.
fn deliver<P: Platform>(p: &mut P, res: &mut VmResources, vcpu: usize, id: u32) -> Result<(), HypError> {
    if vcpu >= res.vcpus.len() {
        return Err(HypError::IndexOutOfRange);
    }
    let Some(target) = res.vgic.inject(p, vcpu, id) else {
        return Ok(());
    };
    if let Some(v) = res.vcpus.get_mut(target) {
        if v.wake(p) {
            debug!("vcpu {}.{}: woken by virq {}", v.vm(), target, id);
        }
    }
    Ok(())
}

fn timer_reg(id: u64) -> Option<TimerReg> {
    match id {
        SYSREG_CNTPCT_EL0 => Some(TimerReg::Count),
        SYSREG_CNTP_CTL_EL0 => Some(TimerReg::Ctl),
        SYSREG_CNTP_CVAL_EL0 => Some(TimerReg::Cval),
        SYSREG_CNTP_TVAL_EL0 => Some(TimerReg::Tval),
        _ => None,
    }
}

fn dispatch<P: Platform>(p: &mut P, res: &mut VmResources, vcpu: usize, class: TrapClass) -> TrapOutcome {
    let Some(v) = res.vcpus.get_mut(vcpu) else {
        return TrapOutcome::HostFatal;
    };
    v.context.pc = p.read(SysReg::ElrEl2);

    match class {
        TrapClass::Host { .. } => return TrapOutcome::HostFatal,
        TrapClass::Unknown | TrapClass::Unsupported { .. } | TrapClass::InstructionAbort { .. } => {
            v.fault(p, format_args!("{}", class));
            return TrapOutcome::Fault;
        }
        TrapClass::WaitForInterrupt => {
            v.context.advance_pc(class.pc_advance());
            p.write(SysReg::ElrEl2, v.context.pc);
            if res.vgic.loaded() == Some(vcpu) {
                res.vgic.sync_from_hw(p, vcpu);
            }
            if res.vgic.has_pending(vcpu) {
                return TrapOutcome::Resume;
            }
            return match res.vcpus[vcpu].wait(p) {
                Ok(()) => TrapOutcome::Suspend,
                Err(_) => TrapOutcome::Fault,
            };
        }
        TrapClass::Hypercall { imm } => {
            debug!("vcpu {}.{}: hvc #{:#x} x0={:#x}", v.vm(), vcpu, imm, v.context.get_gpr(0));
            v.context.set_gpr(0, HVC_NOT_SUPPORTED);
        }
        TrapClass::SysReg(info) => emulate_sysreg(p, res, vcpu, info),
        TrapClass::DataAbort { ipa, access } => {
            let acc = match access {
                Ok(acc) => acc,
                Err(e) => {
                    v.fault(p, format_args!("data abort at IPA 0x{:x}: {:?}", ipa, e));
                    return TrapOutcome::Fault;
                }
            };
            emulate_mmio(p, res, vcpu, ipa, acc);
        }
    }

    let v = &mut res.vcpus[vcpu];
    v.context.advance_pc(class.pc_advance());
    p.write(SysReg::ElrEl2, v.context.pc);
    TrapOutcome::Resume
}

fn emulate_sysreg<P: Platform>(p: &mut P, res: &mut VmResources, vcpu: usize, info: SysRegAccessInfo) {
    let cnt_offset = res.cnt_offset;
    let v = &mut res.vcpus[vcpu];
    let Some(reg) = timer_reg(info.id) else {
        warn!(
            "vcpu {}.{}: unsupported sysreg 0x{:06x} ({}), RAZ/WI",
            v.vm(),
            vcpu,
            info.id,
            if info.read { "read" } else { "write" }
        );
        if info.read {
            v.context.set_gpr(info.reg, 0);
        }
        return;
    };
    if info.read {
        let guest_now = p.now().wrapping_sub(cnt_offset);
        v.context.set_gpr(info.reg, v.timer.read(reg, guest_now));
    } else {
        let value = v.context.get_gpr(info.reg);
        v.timer.write(p, reg, value, cnt_offset);
    }
}

fn emulate_mmio<P: Platform>(p: &mut P, res: &mut VmResources, vcpu: usize, ipa: u64, acc: MmioAccess) {
    let size = acc.size();
    let vm = res.vcpus[vcpu].vm();
    let in_vgic = res.vgic.in_gicd(ipa) || res.vgic.in_gicr(ipa);

    if acc.is_store() {
        let value = acc.store_value(res.vcpus[vcpu].context.get_gpr(acc.reg()));
        let handled = if in_vgic {
            res.vgic.mmio_write(p, ipa, value, size)
        } else {
            res.devices.handle_mmio(ipa, value, size, true, p).is_some()
        };
        if !handled {
            warn!("vm {}: write to unmapped IPA 0x{:x} dropped", vm, ipa);
        }
    } else {
        let raw = if in_vgic {
            res.vgic.mmio_read(p, ipa, size)
        } else {
            res.devices.handle_mmio(ipa, 0, size, false, p)
        };
        let raw = raw.unwrap_or_else(|| {
            warn!("vm {}: read of unmapped IPA 0x{:x} returns 0", vm, ipa);
            0
        });
        res.vcpus[vcpu].context.set_gpr(acc.reg(), acc.load_value(raw));
    }
}

// ── World switch ────────────────────────────────────────────────────

impl<P: Platform> Hypervisor<P> {
    fn switch_in(&mut self, vm: usize, vcpu: usize, enter: bool) {
        let Some(res) = self.vms.get_mut(vm).and_then(|v| v.as_mut()).and_then(|v| v.resources_mut()) else {
            warn!("switch: vm {} has no resources", vm);
            return;
        };
        if enter {
            let Some(hcr) = res.vcpus.get(vcpu).map(|v| v.hcr) else {
                return;
            };
            switch::enter_vm(&mut self.platform, res, hcr);
        }
        switch::load_vcpu(&mut self.platform, res, vcpu);
    }

    fn switch_out(&mut self, vm: usize, vcpu: usize, leave: bool) {
        if let Some(res) = self.vms.get_mut(vm).and_then(|v| v.as_mut()).and_then(|v| v.resources_mut()) {
            switch::save_vcpu(&mut self.platform, res, vcpu);
        }
        if leave {
            switch::leave_vm(&mut self.platform);
        }
    }
}

impl<P: Platform> SwitchHook for Hypervisor<P> {
    fn on_switch(&mut self, from: ExecContext, to: ExecContext) -> SwitchKind {
        let kind = classify(from, to);
        trace!("switch: {:?} -> {:?} ({:?})", from, to, kind);
        match (from, to) {
            (ExecContext::Host, ExecContext::Vcpu { vm, vcpu }) => self.switch_in(vm, vcpu, true),
            (ExecContext::Vcpu { vm, vcpu }, ExecContext::Host) => self.switch_out(vm, vcpu, true),
            (ExecContext::Vcpu { vm: a, vcpu: i }, ExecContext::Vcpu { vm: b, vcpu: j }) => {
                let cross = kind == SwitchKind::CrossVm;
                self.switch_out(a, i, cross);
                self.switch_in(b, j, cross);
            }
            (ExecContext::Host, ExecContext::Host) => {}
        }
        self.running = to;
        kind
    }
}
