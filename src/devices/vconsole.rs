//! Virtual console
//!
//! Every VM gets a console window at its configured address. Only one VM at
//! a time owns the physical UART; its console accesses are forwarded to the
//! real registers. Everybody else reads zeros and has writes dropped.

use log::trace;

use super::MmioDevice;
use crate::arch::traits::HostKernel;

pub struct VirtualConsole {
    base: u64,
    size: u64,
    /// SPI the guest expects the UART on
    intid: u32,
    attached: bool,
}

impl VirtualConsole {
    pub fn new(base: u64, size: u64, intid: u32) -> Self {
        Self {
            base,
            size,
            intid,
            attached: false,
        }
    }

    pub fn intid(&self) -> u32 {
        self.intid
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Hand the physical UART to this console.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    pub fn detach(&mut self) {
        self.attached = false;
    }
}

fn width_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

impl MmioDevice for VirtualConsole {
    fn read(&mut self, offset: u64, size: u8, host: &mut dyn HostKernel) -> Option<u64> {
        if !self.attached {
            return Some(0);
        }
        // UART registers are 32 bits wide; narrower reads see the low bytes.
        let aligned = offset & !0x3;
        let shift = (offset & 0x3) * 8;
        let value = host.console_read(aligned) as u64;
        Some((value >> shift) & width_mask(size))
    }

    fn write(&mut self, offset: u64, value: u64, size: u8, host: &mut dyn HostKernel) -> bool {
        if !self.attached {
            trace!("vconsole: dropped write at {:#x}", offset);
            return true;
        }
        host.console_write(offset & !0x3, (value & width_mask(size)) as u32);
        true
    }

    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn irq(&self) -> Option<u32> {
        Some(self.intid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::SimKernel;

    #[test]
    fn test_detached_console_is_inert() {
        let mut k = SimKernel::new();
        k.set_console_reg(0x18, 0x90);
        let mut con = VirtualConsole::new(0x0900_0000, 0x1000, 33);
        assert_eq!(con.read(0x18, 4, &mut k), Some(0));
        assert!(con.write(0x0, b'x' as u64, 1, &mut k));
        assert!(k.console_writes.is_empty());
    }

    #[test]
    fn test_attached_console_forwards() {
        let mut k = SimKernel::new();
        k.set_console_reg(0x18, 0x90);
        let mut con = VirtualConsole::new(0x0900_0000, 0x1000, 33);
        con.attach();
        assert_eq!(con.read(0x18, 4, &mut k), Some(0x90));
        assert_eq!(con.read(0x18, 1, &mut k), Some(0x90));
        con.write(0x0, 0x1_0041, 1, &mut k);
        assert_eq!(k.console_writes, [(0x0, 0x41)]);
        con.detach();
        assert_eq!(con.read(0x18, 4, &mut k), Some(0));
    }
}
