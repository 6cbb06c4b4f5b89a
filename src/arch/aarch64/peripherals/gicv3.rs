/// Physical GICv3 driver
///
/// The host keeps the distributor and the boot CPU's redistributor. SPIs are
/// configured through GICD, SGIs and PPIs through the redistributor's SGI
/// frame. Acknowledge and EOI go through the ICC system registers.
use core::arch::asm;
use core::ptr::{read_volatile, write_volatile};

use crate::arch::traits::PhysicalGic;
use crate::platform::{VGIC_GICR_STRIDE, VIRQ_PRIV_NUM};

const GICD_CTLR: u64 = 0x0000;
const GICD_ISENABLER: u64 = 0x0100;
const GICD_ICENABLER: u64 = 0x0180;
const GICD_ISPENDR: u64 = 0x0200;
const GICD_ICPENDR: u64 = 0x0280;
const GICD_IPRIORITYR: u64 = 0x0400;
const GICD_ICFGR: u64 = 0x0C00;

/// EnableGrp1NS | ARE_NS
const GICD_CTLR_ENABLE: u32 = (1 << 1) | (1 << 4);

const GICR_WAKER: u64 = 0x0014;
const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;
const GICR_SGI_OFFSET: u64 = 0x1_0000;

/// Spurious INTID returned by ICC_IAR1_EL1
pub const GIC_SPURIOUS_INTID: u32 = 1023;

pub struct GicV3 {
    gicd: u64,
    gicr: u64,
}

impl GicV3 {
    /// `gicr_base` is the redistributor region; CPU `cpu` uses its own frame.
    pub const fn new(gicd_base: u64, gicr_base: u64, cpu: usize) -> Self {
        Self {
            gicd: gicd_base,
            gicr: gicr_base + cpu as u64 * VGIC_GICR_STRIDE,
        }
    }

    fn read(&self, addr: u64) -> u32 {
        unsafe { read_volatile(addr as *const u32) }
    }

    fn write(&self, addr: u64, value: u32) {
        unsafe { write_volatile(addr as *mut u32, value) }
    }

    /// Base of the register bank that configures `intid`
    fn bank(&self, intid: u32) -> u64 {
        if (intid as usize) < VIRQ_PRIV_NUM {
            self.gicr + GICR_SGI_OFFSET
        } else {
            self.gicd
        }
    }

    fn write_bit(&self, reg: u64, intid: u32) {
        let addr = self.bank(intid) + reg + (intid / 32) as u64 * 4;
        self.write(addr, 1 << (intid % 32));
    }

    /// Wake the redistributor and enable group 1 at the distributor and CPU
    /// interface.
    pub fn init(&mut self) {
        let waker = self.read(self.gicr + GICR_WAKER);
        self.write(self.gicr + GICR_WAKER, waker & !GICR_WAKER_PROCESSOR_SLEEP);
        while self.read(self.gicr + GICR_WAKER) & GICR_WAKER_CHILDREN_ASLEEP != 0 {
            core::hint::spin_loop();
        }

        self.write(self.gicd + GICD_CTLR, GICD_CTLR_ENABLE);

        unsafe {
            // SRE | DFB | DIB, then unmask every priority and enable group 1.
            asm!("msr icc_sre_el2, {v}", v = in(reg) 0xFu64, options(nostack, nomem));
            asm!("isb", options(nostack, nomem));
            asm!("msr icc_pmr_el1, {v}", v = in(reg) 0xFFu64, options(nostack, nomem));
            asm!("msr icc_igrpen1_el1, {v}", v = in(reg) 1u64, options(nostack, nomem));
            asm!("isb", options(nostack, nomem));
        }
    }

    /// Acknowledge the highest-priority pending interrupt.
    pub fn acknowledge(&mut self) -> u32 {
        let iar: u64;
        unsafe {
            asm!("mrs {v}, icc_iar1_el1", v = out(reg) iar, options(nostack, nomem));
        }
        (iar & 0xFF_FFFF) as u32
    }

    /// Priority drop and deactivate.
    pub fn end_of_interrupt(&mut self, intid: u32) {
        unsafe {
            asm!("msr icc_eoir1_el1, {v}", v = in(reg) intid as u64, options(nostack, nomem));
        }
    }
}

impl PhysicalGic for GicV3 {
    fn mask(&mut self, intid: u32) {
        self.write_bit(GICD_ICENABLER, intid);
    }

    fn unmask(&mut self, intid: u32) {
        self.write_bit(GICD_ISENABLER, intid);
    }

    fn set_pending(&mut self, intid: u32) {
        self.write_bit(GICD_ISPENDR, intid);
    }

    fn clear_pending(&mut self, intid: u32) {
        self.write_bit(GICD_ICPENDR, intid);
    }

    fn set_priority(&mut self, intid: u32, priority: u8) {
        let addr = self.bank(intid) + GICD_IPRIORITYR + intid as u64;
        unsafe { write_volatile(addr as *mut u8, priority) }
    }

    fn set_config(&mut self, intid: u32, config: u8) {
        // ICFGR0 is read-only (SGIs are always edge).
        if intid < 16 {
            return;
        }
        let addr = self.bank(intid) + GICD_ICFGR + (intid / 16) as u64 * 4;
        let shift = (intid % 16) * 2;
        let old = self.read(addr);
        let new = (old & !(0b11 << shift)) | (((config & 0b11) as u32) << shift);
        self.write(addr, new);
    }
}
