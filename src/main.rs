#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod board {
    use core::panic::PanicInfo;

    use log::{error, info, LevelFilter};
    use rthyp::arch::aarch64::board::BoardPlatform;
    use rthyp::arch::aarch64::peripherals::{timer, GIC_SPURIOUS_INTID};
    use rthyp::mm::heap::HostHeap;
    use rthyp::platform::{HEAP_BASE, HEAP_SIZE};
    use rthyp::{println, uart, Hypervisor};

    #[global_allocator]
    static HEAP: HostHeap = HostHeap::new();

    const FDT_MAGIC: u32 = 0xd00d_feed;

    /// The firmware-supplied device tree, if `dtb` points at one.
    unsafe fn device_tree(dtb: u64) -> Option<&'static [u8]> {
        if dtb == 0 {
            return None;
        }
        let header = dtb as *const u32;
        if u32::from_be(core::ptr::read_volatile(header)) != FDT_MAGIC {
            return None;
        }
        let size = u32::from_be(core::ptr::read_volatile(header.add(1))) as usize;
        Some(core::slice::from_raw_parts(dtb as *const u8, size))
    }

    /// Rust entry point called from boot.S
    #[no_mangle]
    pub extern "C" fn rust_main(dtb: u64) -> ! {
        HEAP.init(HEAP_BASE, HEAP_SIZE);
        let _ = uart::init(LevelFilter::Info);

        println!("========================================");
        println!("  rthyp - ARMv8 EL2 hypervisor");
        println!("========================================");

        let mut platform = BoardPlatform::new();
        platform.init();

        let mut hyp = match unsafe { device_tree(dtb) } {
            Some(blob) => match Hypervisor::from_fdt(platform, blob) {
                Ok(hyp) => hyp,
                Err(e) => {
                    error!("config: {}, no VMs available", e);
                    park();
                }
            },
            None => Hypervisor::with_builtin_images(platform),
        };
        println!("{}", hyp.list_os_images());

        if let Err(e) = hyp.create_vm("vm0", 0).and_then(|idx| hyp.run_vm(Some(idx))) {
            error!("vm0: {}", e);
        }
        println!("{}", hyp.list_vms());

        info!("entering interrupt loop");
        loop {
            let intid = hyp.platform_mut().gic.acknowledge();
            if intid == GIC_SPURIOUS_INTID {
                unsafe { core::arch::asm!("wfi") };
                continue;
            }
            if intid == timer::HYP_TIMER_INTID {
                while let Some(key) = hyp.platform_mut().kernel.next_expired() {
                    hyp.timer_expired(key.vm, key.vcpu);
                }
            } else {
                hyp.host_irq(intid);
            }
            hyp.platform_mut().gic.end_of_interrupt(intid);
        }
    }

    fn park() -> ! {
        loop {
            unsafe { core::arch::asm!("wfe") };
        }
    }

    /// Panic handler - required for no_std
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("\n!!! PANIC !!!");
        println!("{}", info);
        park()
    }
}

#[cfg(not(target_os = "none"))]
fn demo(hyp: &mut rthyp::Hypervisor<rthyp::arch::soft::SimPlatform>) -> Result<(), rthyp::HypError> {
    use rthyp::switch::{ExecContext, SwitchHook};

    let a = hyp.create_vm("rtthread-a", 0)?;
    let b = hyp.create_vm("rtthread-b", 0)?;
    hyp.run_vm(Some(a))?;
    hyp.run_vm(Some(b))?;
    hyp.attach_console(a)?;

    // One scheduling round: host -> a -> b -> host.
    let va = ExecContext::Vcpu { vm: a, vcpu: 0 };
    let vb = ExecContext::Vcpu { vm: b, vcpu: 0 };
    for (from, to) in [(ExecContext::Host, va), (va, vb), (vb, ExecContext::Host)] {
        let kind = hyp.on_switch(from, to);
        println!("switch {:?} -> {:?}: {:?}", from, to, kind);
    }

    hyp.pause_vm(Some(b))?;
    hyp.pick_vm(a)
}

/// Host build: exercise the command surface on the simulated machine.
#[cfg(not(target_os = "none"))]
fn main() {
    use rthyp::arch::soft::SimPlatform;
    use rthyp::Hypervisor;

    let mut hyp = Hypervisor::with_builtin_images(SimPlatform::default());
    print!("{}", hyp.list_os_images());
    println!();

    if let Err(e) = demo(&mut hyp) {
        eprintln!("demo failed: {} (code {})", e, e.code());
        std::process::exit(1);
    }
    println!();
    print!("{}", hyp.list_vms());
}
