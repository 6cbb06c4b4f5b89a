//! VM life cycle through the command surface

mod common;

use common::{hypervisor, running_vm};
use rthyp::arch::soft::SIM_RAM_BASE;
use rthyp::error::result_code;
use rthyp::platform::MAX_VM_NUM;
use rthyp::scheduler::RunState;
use rthyp::vcpu::VcpuStatus;
use rthyp::vm::VmStatus;
use rthyp::HypError;

#[test]
fn test_full_life_cycle() {
    let mut hyp = hypervisor();
    let idx = hyp.create_vm("guest", 0).unwrap();
    assert_eq!(hyp.current(), idx);
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::NeverRun));
    assert!(hyp.vm(idx).unwrap().resources().is_none());

    hyp.run_vm(None).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Online));
    let thread = hyp.vm(idx).unwrap().vcpu(0).unwrap().thread().unwrap();
    assert_eq!(hyp.platform().kernel.thread_state(thread), RunState::Ready);

    hyp.pause_vm(None).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Suspended));
    assert_eq!(hyp.platform().kernel.thread_state(thread), RunState::Blocked);

    // Resuming keeps the same thread.
    hyp.run_vm(None).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Online));
    assert_eq!(hyp.vm(idx).unwrap().vcpu(0).unwrap().thread(), Some(thread));
    assert_eq!(hyp.platform().kernel.thread_state(thread), RunState::Ready);

    hyp.halt_vm(None).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Offline));
    assert_eq!(hyp.vm(idx).unwrap().vcpu(0).unwrap().status(), VcpuStatus::Offline);
    assert_eq!(hyp.platform().kernel.thread_state(thread), RunState::None);

    hyp.delete_vm(None).unwrap();
    assert_eq!(hyp.vm_status(idx), None);
    assert_eq!(hyp.vm_count(), 0);
}

#[test]
fn test_first_run_loads_image_into_guest_ram() {
    let mut hyp = hypervisor();
    let idx = running_vm(&mut hyp, "guest");
    let vm = hyp.vm(idx).unwrap();
    let cfg = *vm.config();
    let base = vm.mem_base().unwrap();
    assert_eq!(base, SIM_RAM_BASE);

    let dst = base + (cfg.entry - cfg.mem_ipa);
    assert_eq!(hyp.platform().kernel.copies, [(dst, cfg.image_addr, cfg.image_size)]);

    let res = vm.resources().unwrap();
    assert_eq!(res.mm.lock().translate(cfg.entry), Ok(dst));
    assert_eq!(res.vttbr >> 48, idx as u64);
}

#[test]
fn test_restart_after_halt_keeps_memory() {
    let mut hyp = hypervisor();
    let idx = running_vm(&mut hyp, "guest");
    let base = hyp.vm(idx).unwrap().mem_base();
    hyp.halt_vm(Some(idx)).unwrap();

    hyp.run_vm(Some(idx)).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Online));
    assert_eq!(hyp.vm(idx).unwrap().mem_base(), base);
    // Offline -> Online reloads nothing but starts a fresh thread.
    assert_eq!(hyp.platform().kernel.copies.len(), 1);
    assert_eq!(hyp.vm(idx).unwrap().vcpu(0).unwrap().status(), VcpuStatus::Online);
}

#[test]
fn test_illegal_transitions() {
    let mut hyp = hypervisor();
    let idx = hyp.create_vm("guest", 0).unwrap();

    assert_eq!(hyp.pause_vm(Some(idx)), Err(HypError::InvalidState));
    let res = hyp.delete_vm(Some(idx));
    assert_eq!(res, Err(HypError::InvalidState));
    assert_eq!(result_code(&res), 4);

    hyp.run_vm(Some(idx)).unwrap();
    assert_eq!(hyp.delete_vm(Some(idx)), Err(HypError::InvalidState));
    // Running twice is harmless.
    assert_eq!(hyp.run_vm(Some(idx)), Ok(()));

    hyp.halt_vm(Some(idx)).unwrap();
    assert_eq!(hyp.halt_vm(Some(idx)), Err(HypError::InvalidState));
    assert_eq!(hyp.pause_vm(Some(idx)), Err(HypError::InvalidState));
}

#[test]
fn test_halt_before_first_run() {
    let mut hyp = hypervisor();
    let idx = hyp.create_vm("guest", 0).unwrap();
    hyp.halt_vm(Some(idx)).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Offline));
    hyp.delete_vm(Some(idx)).unwrap();
    assert!(hyp.platform().kernel.copies.is_empty());
}

#[test]
fn test_slot_reuse_after_delete() {
    let mut hyp = hypervisor();
    let a = running_vm(&mut hyp, "a");
    let b = running_vm(&mut hyp, "b");
    assert_ne!(a, b);

    hyp.halt_vm(Some(a)).unwrap();
    hyp.delete_vm(Some(a)).unwrap();
    let c = hyp.create_vm("c", 1).unwrap();
    assert_eq!(c, a);
    assert_eq!(hyp.vm(c).unwrap().name().as_str(), "c");
    assert_eq!(hyp.vm_status(b), Some(VmStatus::Online));
}

#[test]
fn test_slot_exhaustion() {
    let mut hyp = hypervisor();
    for i in 0..MAX_VM_NUM {
        assert_eq!(hyp.create_vm("vm", 0), Ok(i));
    }
    let res = hyp.create_vm("one-too-many", 0);
    assert_eq!(res, Err(HypError::NoFreeSlot));
    assert_eq!(result_code(&res), 2);
}

#[test]
fn test_bad_indices() {
    let mut hyp = hypervisor();
    assert_eq!(hyp.create_vm("guest", 7), Err(HypError::IndexOutOfRange));
    assert_eq!(hyp.run_vm(Some(MAX_VM_NUM)), Err(HypError::IndexOutOfRange));
    assert_eq!(hyp.run_vm(Some(3)), Err(HypError::IndexOutOfRange));
    assert_eq!(hyp.pick_vm(MAX_VM_NUM), Err(HypError::IndexOutOfRange));

    // Picking an empty slot is allowed; acting on it is not.
    hyp.pick_vm(5).unwrap();
    assert_eq!(hyp.halt_vm(None), Err(HypError::IndexOutOfRange));
    assert_eq!(result_code(&hyp.halt_vm(None)), 1);
}

#[test]
fn test_allocation_failures_leave_vm_never_run() {
    let mut hyp = hypervisor();
    let idx = hyp.create_vm("guest", 0).unwrap();

    hyp.platform_mut().kernel.fail_alloc = 1;
    assert_eq!(hyp.run_vm(Some(idx)), Err(HypError::AllocFailure));
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::NeverRun));

    hyp.platform_mut().kernel.thread_limit = 0;
    assert_eq!(hyp.run_vm(Some(idx)), Err(HypError::AllocFailure));
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::NeverRun));
    assert!(hyp.vm(idx).unwrap().resources().is_none());

    hyp.platform_mut().kernel.thread_limit = usize::MAX;
    hyp.run_vm(Some(idx)).unwrap();
    assert_eq!(hyp.vm_status(idx), Some(VmStatus::Online));
}

#[test]
fn test_listings() {
    let mut hyp = hypervisor();
    let a = running_vm(&mut hyp, "alpha");
    hyp.create_vm("beta", 1).unwrap();

    let vms = hyp.list_vms();
    assert!(vms.contains("alpha"));
    assert!(vms.contains("online"));
    assert!(vms.contains("never"));
    // The selected VM is highlighted.
    assert!(vms.contains("\x1b[34mbeta"));

    let images = hyp.list_os_images();
    assert!(images.contains("qemu-rtthread"));
    assert!(images.contains("rk3568-rtthread"));

    let dump = hyp.dump_vcpu(a, 0).unwrap();
    assert!(!dump.is_empty());
    assert_eq!(hyp.dump_vcpu(a, 3), Err(HypError::IndexOutOfRange));
}
