//! Shared helpers for the scenario tests
//!
//! Every test drives the hypervisor on the simulated platform. `FdtBuilder`
//! assembles small flattened device trees for the configuration tests.

#![allow(dead_code)]

use rthyp::arch::soft::SimPlatform;
use rthyp::arch::traits::{SysReg, SysRegAccess};
use rthyp::Hypervisor;

pub const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

const HEADER_SIZE: usize = 40;
const RSVMAP_SIZE: usize = 16;

/// Simulated machine with four list registers
pub fn platform() -> SimPlatform {
    SimPlatform::new(4)
}

/// Hypervisor over the built-in QEMU and RK3568 images
pub fn hypervisor() -> Hypervisor<SimPlatform> {
    Hypervisor::with_builtin_images(platform())
}

/// Create and run one QEMU RT-Thread VM. Returns its index.
pub fn running_vm(hyp: &mut Hypervisor<SimPlatform>, name: &str) -> usize {
    let idx = hyp.create_vm(name, 0).expect("create");
    hyp.run_vm(Some(idx)).expect("run");
    idx
}

/// Fault state of a synchronous exception taken from a guest.
pub fn raise_trap(hyp: &mut Hypervisor<SimPlatform>, esr: u64, far: u64, hpfar: u64, elr: u64) {
    let p = hyp.platform_mut();
    p.write(SysReg::EsrEl2, esr);
    p.write(SysReg::FarEl2, far);
    p.write(SysReg::Hpfar, hpfar);
    p.write(SysReg::ElrEl2, elr);
}

/// Minimal flattened device tree writer (version 17, no reservations)
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self {
            structure: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn token(&mut self, t: u32) {
        self.structure.extend_from_slice(&t.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut at = 0;
        for s in self.strings.split(|&b| b == 0) {
            if s == name.as_bytes() {
                return at as u32;
            }
            at += s.len() + 1;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off
    }

    pub fn begin_node(mut self, name: &str) -> Self {
        self.token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self
    }

    pub fn end_node(mut self) -> Self {
        self.token(FDT_END_NODE);
        self
    }

    pub fn prop(mut self, name: &str, value: &[u8]) -> Self {
        let nameoff = self.string_offset(name);
        self.token(FDT_PROP);
        self.structure.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.structure.extend_from_slice(&nameoff.to_be_bytes());
        self.structure.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_cells(self, name: &str, cells: &[u32]) -> Self {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &value)
    }

    pub fn prop_str(self, name: &str, value: &str) -> Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.token(FDT_END);

        let off_struct = HEADER_SIZE + RSVMAP_SIZE;
        let off_strings = off_struct + self.structure.len();
        let total = off_strings + self.strings.len();

        let header = [
            FDT_MAGIC,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            HEADER_SIZE as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structure.len() as u32,
        ];
        let mut blob: Vec<u8> = header.iter().flat_map(|w| w.to_be_bytes()).collect();
        blob.extend_from_slice(&[0; RSVMAP_SIZE]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// A `/vm` tree holding one QEMU-style RT-Thread image named `name`.
pub fn vm_tree(name: &str, vcpus: u32) -> Vec<u8> {
    FdtBuilder::new()
        .begin_node("")
        .prop_cells("#address-cells", &[2])
        .prop_cells("#size-cells", &[2])
        .begin_node("vm")
        .begin_node(name)
        .prop_cells("type", &[1])
        .prop_cells("vcpus", &[vcpus])
        .prop_cells("vcpu_affinity", &[0, 1, 2, 3])
        .prop_cells("image_address", &[0x4500_0000])
        .prop_cells("image_size", &[0x3_0000])
        .prop_cells("entry", &[0x4000_8000])
        .prop_cells("memory", &[0, 0x4000_0000, 0, 0x100_0000])
        .begin_node("gic")
        .prop_str("compatible", "arm,gicv3")
        .prop_cells("reg", &[0x0800_0000, 0, 0x080A_0000, 0])
        .prop_cells("maintenance_interrupts", &[25])
        .prop_cells("virq_num", &[96])
        .end_node()
        .begin_node("console")
        .prop_str("compatible", "rt_thread,vm_console")
        .prop_cells("reg", &[0x0900_0000, 0x1000])
        .prop_cells("interrupts", &[33])
        .end_node()
        .end_node()
        .end_node()
        .end_node()
        .finish()
}
