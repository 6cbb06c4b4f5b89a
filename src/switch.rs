//! World switch
//!
//! The host scheduler calls a `SwitchHook` on every context switch. The hook
//! compares the outgoing and incoming execution contexts and does only the
//! save/restore work that the kind of switch needs:
//!
//! | kind          | work                                                     |
//! |---------------|----------------------------------------------------------|
//! | host -> host  | none                                                     |
//! | host -> guest | enter the VM (traps, stage-2, CNTVOFF), load the vCPU    |
//! | guest -> host | save the vCPU, leave the VM                              |
//! | same VM       | save one vCPU, load the other; VM-wide state stays       |
//! | cross VM      | save, leave the old VM, enter the new one, load          |
//!
//! Nothing here allocates or blocks: all buffers live in the vCPU and vGIC
//! state created with the VM.

use log::trace;

use crate::arch::aarch64::defs::HCR_HOST_FLAGS;
use crate::arch::traits::{Platform, SysReg};
use crate::vm::VmResources;

/// What a host thread is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// A plain host thread
    Host,
    /// The thread backing one vCPU
    Vcpu { vm: usize, vcpu: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    HostToHost,
    HostToGuest,
    GuestToHost,
    /// Two vCPUs of the same VM
    SameVm,
    /// vCPUs of different VMs
    CrossVm,
}

/// Classify a scheduler switch from `from` to `to`.
pub fn classify(from: ExecContext, to: ExecContext) -> SwitchKind {
    match (from, to) {
        (ExecContext::Host, ExecContext::Host) => SwitchKind::HostToHost,
        (ExecContext::Host, ExecContext::Vcpu { .. }) => SwitchKind::HostToGuest,
        (ExecContext::Vcpu { .. }, ExecContext::Host) => SwitchKind::GuestToHost,
        (ExecContext::Vcpu { vm: a, .. }, ExecContext::Vcpu { vm: b, .. }) if a == b => SwitchKind::SameVm,
        (ExecContext::Vcpu { .. }, ExecContext::Vcpu { .. }) => SwitchKind::CrossVm,
    }
}

/// Called synchronously from the host scheduler's switch path.
///
/// Implementations must not block or allocate.
pub trait SwitchHook {
    fn on_switch(&mut self, from: ExecContext, to: ExecContext) -> SwitchKind;
}

/// Activate a VM's trap configuration and stage-2 context.
pub fn enter_vm<P: Platform + ?Sized>(p: &mut P, res: &VmResources, hcr: u64) {
    p.write(SysReg::Hcr, hcr);
    p.write(SysReg::Vtcr, res.vtcr);
    p.write(SysReg::Vttbr, res.vttbr);
    p.isb();
    p.tlbi_vmalls12e1is();
    p.write(SysReg::Cntvoff, res.cnt_offset);
    trace!("switch: enter vttbr {:#x}", res.vttbr);
}

/// Restore the host trap configuration and drop the stage-2 context.
pub fn leave_vm<P: Platform + ?Sized>(p: &mut P) {
    p.write(SysReg::Hcr, HCR_HOST_FLAGS);
    p.write(SysReg::Vttbr, 0);
    p.isb();
}

/// Load one vCPU's register state. The VM must already be entered.
pub fn load_vcpu<P: Platform + ?Sized>(p: &mut P, res: &mut VmResources, vcpu: usize) {
    let now = p.now();
    let Some(v) = res.vcpus.get_mut(vcpu) else {
        return;
    };
    v.context.sys_regs.restore(p);
    p.write(SysReg::ElrEl2, v.context.pc);
    p.write(SysReg::SpsrEl2, v.context.spsr_el2);
    v.timer.restore(p, now);
    res.vgic.restore(p, vcpu);
    p.isb();
}

/// Save one vCPU's register state back into its context.
pub fn save_vcpu<P: Platform + ?Sized>(p: &mut P, res: &mut VmResources, vcpu: usize) {
    let now = p.now();
    let Some(v) = res.vcpus.get_mut(vcpu) else {
        return;
    };
    v.context.sys_regs.save(p);
    v.context.pc = p.read(SysReg::ElrEl2);
    v.context.spsr_el2 = p.read(SysReg::SpsrEl2);
    v.timer.save(p, now);
    res.vgic.save(p, vcpu);
}
