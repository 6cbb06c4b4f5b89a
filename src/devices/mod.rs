//! Device Emulation Framework
//!
//! Routes trapped MMIO accesses to emulated devices via enum dispatch.
//! The vGIC is handled separately by the trap dispatcher; this module
//! covers the remaining per-VM virtual devices. Pass-through devices are
//! mapped at stage 2 and never trap.

pub mod gic;
pub mod vconsole;

use crate::arch::traits::HostKernel;

/// Trait for MMIO-accessible devices
///
/// - `read()`/`write()` receive offsets relative to `base_address()`
/// - `size` parameter indicates access width (1, 2, 4, or 8 bytes)
/// - `host` gives access to the physical device behind the emulation
/// - Return `None`/`false` for invalid offsets
pub trait MmioDevice {
    fn read(&mut self, offset: u64, size: u8, host: &mut dyn HostKernel) -> Option<u64>;
    fn write(&mut self, offset: u64, value: u64, size: u8, host: &mut dyn HostKernel) -> bool;
    fn base_address(&self) -> u64;
    fn size(&self) -> u64;

    fn contains(&self, addr: u64) -> bool {
        let base = self.base_address();
        addr >= base && addr - base < self.size()
    }

    /// SPI the device raises, if it has one.
    fn irq(&self) -> Option<u32> {
        None
    }
}

// ── Enum dispatch ──────────────────────────────────────────────────

/// Device variant enum, one variant per emulated device type.
pub enum VirtualDevice {
    Console(vconsole::VirtualConsole),
}

impl MmioDevice for VirtualDevice {
    fn read(&mut self, offset: u64, size: u8, host: &mut dyn HostKernel) -> Option<u64> {
        match self {
            VirtualDevice::Console(d) => d.read(offset, size, host),
        }
    }

    fn write(&mut self, offset: u64, value: u64, size: u8, host: &mut dyn HostKernel) -> bool {
        match self {
            VirtualDevice::Console(d) => d.write(offset, value, size, host),
        }
    }

    fn base_address(&self) -> u64 {
        match self {
            VirtualDevice::Console(d) => d.base_address(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            VirtualDevice::Console(d) => d.size(),
        }
    }

    fn irq(&self) -> Option<u32> {
        match self {
            VirtualDevice::Console(d) => d.irq(),
        }
    }
}

// ── Device Manager ─────────────────────────────────────────────────

const MAX_DEVICES: usize = 8;

/// Per-VM MMIO device table, routes accesses to registered devices by address.
pub struct DeviceManager {
    devices: [Option<VirtualDevice>; MAX_DEVICES],
    count: usize,
}

impl DeviceManager {
    pub const fn new() -> Self {
        Self {
            devices: [const { None }; MAX_DEVICES],
            count: 0,
        }
    }

    /// Remove all registered devices.
    pub fn reset(&mut self) {
        for slot in self.devices.iter_mut() {
            *slot = None;
        }
        self.count = 0;
    }

    /// Register a device. Returns slot index on success.
    pub fn register_device(&mut self, dev: VirtualDevice) -> Option<usize> {
        if self.count >= MAX_DEVICES {
            return None;
        }
        let idx = self.count;
        self.devices[idx] = Some(dev);
        self.count += 1;
        Some(idx)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether any registered device decodes `addr`.
    pub fn claims(&self, addr: u64) -> bool {
        self.devices.iter().flatten().any(|d| d.contains(addr))
    }

    /// Handle an MMIO access by scanning registered devices.
    ///
    /// Returns `None` when no device decodes `addr`.
    pub fn handle_mmio(
        &mut self,
        addr: u64,
        value: u64,
        size: u8,
        is_write: bool,
        host: &mut dyn HostKernel,
    ) -> Option<u64> {
        let dev = self.devices.iter_mut().flatten().find(|d| d.contains(addr))?;
        let offset = addr - dev.base_address();
        if is_write {
            dev.write(offset, value, size, host);
            Some(0)
        } else {
            Some(dev.read(offset, size, host).unwrap_or(0))
        }
    }

    /// The VM's console, if it has one.
    pub fn console(&self) -> Option<&vconsole::VirtualConsole> {
        self.devices.iter().flatten().map(|d| match d {
            VirtualDevice::Console(c) => c,
        }).next()
    }

    pub fn console_mut(&mut self) -> Option<&mut vconsole::VirtualConsole> {
        self.devices.iter_mut().flatten().map(|d| match d {
            VirtualDevice::Console(c) => c,
        }).next()
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::SimKernel;
    use vconsole::VirtualConsole;

    #[test]
    fn test_routing_by_address() {
        let mut k = SimKernel::new();
        let mut mgr = DeviceManager::new();
        let mut con = VirtualConsole::new(0x0900_0000, 0x1000, 33);
        con.attach();
        mgr.register_device(VirtualDevice::Console(con));
        assert!(mgr.claims(0x0900_0018));
        assert!(!mgr.claims(0x0900_1000));

        assert_eq!(mgr.handle_mmio(0x0900_0000, 0x41, 4, true, &mut k), Some(0));
        assert_eq!(k.console_writes, [(0, 0x41)]);
        assert_eq!(mgr.handle_mmio(0x0a00_0000, 0, 4, false, &mut k), None);
    }

    #[test]
    fn test_table_full() {
        let mut mgr = DeviceManager::new();
        for i in 0..MAX_DEVICES as u64 {
            let con = VirtualConsole::new(i * 0x1000, 0x1000, 33);
            assert!(mgr.register_device(VirtualDevice::Console(con)).is_some());
        }
        let con = VirtualConsole::new(0x10_0000, 0x1000, 33);
        assert!(mgr.register_device(VirtualDevice::Console(con)).is_none());
        mgr.reset();
        assert!(mgr.is_empty());
    }
}
