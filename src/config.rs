//! Static VM configuration
//!
//! OS images come from a flattened device tree (or the built-in table when
//! none is supplied). The tree has a `/vm` node with one child per image:
//!
//! ```text
//! vm {
//!     rtthread {
//!         type = <1>;
//!         vcpus = <1>;
//!         vcpu_affinity = <0>;
//!         image_address = <0x45000000>;
//!         entry = <0x40008000>;
//!         memory = <0 0x40000000 0 0x800000>;
//!         gic { compatible = "arm,gicv3"; reg = <0x08000000 0 0x080a0000 0>;
//!               maintenance_interrupts = <25>; virq_num = <128>; };
//!         console { compatible = "rt_thread,vm_console";
//!                   reg = <0x09000000 0x1000>; interrupts = <33>; };
//!     };
//! };
//! ```
//!
//! Records are fixed-size so a VM can take a copy without allocating.

use alloc::vec::Vec;
use core::fmt;

use fdt::node::FdtNode;
use fdt::Fdt;
use log::{debug, warn};

use crate::error::ConfigError;
use crate::platform::*;

/// Pass-through device windows per image
pub const MAX_PASSTHROUGH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Linux,
    RtThread,
    Zephyr,
    Other,
}

impl OsType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(OsType::Linux),
            1 => Some(OsType::RtThread),
            2 => Some(OsType::Zephyr),
            3 => Some(OsType::Other),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OsType::Linux => "Linux",
            OsType::RtThread => "RT-Thread",
            OsType::Zephyr => "Zephyr",
            OsType::Other => "Other",
        }
    }
}

/// Inline, length-limited name
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VmName {
    buf: [u8; VM_NAME_SIZE],
    len: u8,
}

impl VmName {
    /// Truncates to `VM_NAME_SIZE` bytes on a character boundary.
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(VM_NAME_SIZE);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0; VM_NAME_SIZE];
        buf[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self { buf, len: end as u8 }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgicConfig {
    pub gicd_base: u64,
    pub gicr_base: u64,
    pub maintenance_intid: u32,
    pub virq_num: usize,
}

/// Emulated console window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub base: u64,
    pub size: u64,
    pub intid: u32,
}

/// Device window mapped straight through at stage 2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassthroughConfig {
    pub ipa: u64,
    pub pa: u64,
    pub size: u64,
    /// SPI bound to the same physical INTID
    pub intid: Option<u32>,
}

/// Everything needed to build a VM of one OS type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsImage {
    pub name: VmName,
    pub os_type: OsType,
    pub nr_vcpus: usize,
    pub affinity: [u32; MAX_VCPU_NUM],
    /// Host physical address of the image
    pub image_addr: u64,
    pub image_size: u64,
    /// Guest PC at reset; the image is loaded here
    pub entry: u64,
    pub mem_ipa: u64,
    pub mem_size: u64,
    /// Fixed host memory to back the guest instead of allocating
    pub phymem: Option<u64>,
    pub vgic: VgicConfig,
    pub console: Option<ConsoleConfig>,
    pub passthrough: [Option<PassthroughConfig>; MAX_PASSTHROUGH],
}

impl OsImage {
    /// Check the invariants the lifecycle code relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_vcpus == 0 || self.nr_vcpus > MAX_VCPU_NUM {
            return Err(ConfigError::InvalidValue("vcpus"));
        }
        if self.mem_size == 0
            || self.mem_size % MEM_BLOCK_SIZE != 0
            || self.mem_ipa % MEM_BLOCK_SIZE != 0
        {
            return Err(ConfigError::InvalidValue("memory"));
        }
        if let Some(pa) = self.phymem {
            if pa % MEM_BLOCK_SIZE != 0 {
                return Err(ConfigError::InvalidValue("phymem"));
            }
        }
        let mem_end = self.mem_ipa + self.mem_size;
        let image_end = self.entry.checked_add(self.image_size);
        if self.entry < self.mem_ipa || image_end.map_or(true, |end| end > mem_end) {
            return Err(ConfigError::InvalidValue("entry"));
        }
        if self.vgic.virq_num < VIRQ_PRIV_NUM || self.vgic.virq_num > VIRQ_MAX_NUM {
            return Err(ConfigError::InvalidValue("virq_num"));
        }
        Ok(())
    }

    pub fn passthrough(&self) -> impl Iterator<Item = &PassthroughConfig> {
        self.passthrough.iter().flatten()
    }
}

// ── Device tree parsing ──────────────────────────────────────────────

fn cells(value: &[u8]) -> impl Iterator<Item = u32> + '_ {
    value
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
}

fn prop<'a>(node: FdtNode<'_, 'a>, name: &'static str) -> Result<&'a [u8], ConfigError> {
    node.property(name)
        .map(|p| p.value)
        .ok_or(ConfigError::MissingProperty(name))
}

/// One or two cells read as a single number.
fn number(node: FdtNode<'_, '_>, name: &'static str) -> Result<u64, ConfigError> {
    let value = prop(node, name)?;
    match value.len() {
        4 | 8 => Ok(cells(value).fold(0, |acc, c| (acc << 32) | c as u64)),
        _ => Err(ConfigError::InvalidValue(name)),
    }
}

/// `<hi lo hi lo>` as (address, size)
fn addr_size_pair(node: FdtNode<'_, '_>, name: &'static str) -> Result<(u64, u64), ConfigError> {
    let c: Vec<u32> = cells(prop(node, name)?).collect();
    if c.len() != 4 {
        return Err(ConfigError::InvalidValue(name));
    }
    let join = |hi: u32, lo: u32| ((hi as u64) << 32) | lo as u64;
    Ok((join(c[0], c[1]), join(c[2], c[3])))
}

fn parse_gic(node: FdtNode<'_, '_>) -> Result<VgicConfig, ConfigError> {
    let reg: Vec<u32> = cells(prop(node, "reg")?).collect();
    if reg.len() < 3 {
        return Err(ConfigError::InvalidValue("reg"));
    }
    let maintenance_intid = match node.property("maintenance_interrupts") {
        Some(_) => number(node, "maintenance_interrupts")? as u32,
        None => GIC_MAINTENANCE_INTID,
    };
    let virq_num = match node.property("virq_num") {
        Some(_) => number(node, "virq_num")? as usize,
        None => DEFAULT_VIRQ_NUM,
    };
    Ok(VgicConfig {
        gicd_base: reg[0] as u64,
        gicr_base: reg[2] as u64,
        maintenance_intid,
        virq_num,
    })
}

fn parse_console(node: FdtNode<'_, '_>) -> Result<ConsoleConfig, ConfigError> {
    let reg: Vec<u32> = cells(prop(node, "reg")?).collect();
    if reg.len() != 2 {
        return Err(ConfigError::InvalidValue("reg"));
    }
    Ok(ConsoleConfig {
        base: reg[0] as u64,
        size: reg[1] as u64,
        intid: number(node, "interrupts")? as u32,
    })
}

fn parse_passthrough(node: FdtNode<'_, '_>) -> Result<PassthroughConfig, ConfigError> {
    let reg: Vec<u32> = cells(prop(node, "reg")?).collect();
    if reg.len() != 2 {
        return Err(ConfigError::InvalidValue("reg"));
    }
    let ipa = reg[0] as u64;
    let pa = match node.property("phys") {
        Some(_) => number(node, "phys")?,
        None => ipa,
    };
    let intid = match node.property("interrupts") {
        Some(_) => Some(number(node, "interrupts")? as u32),
        None => None,
    };
    Ok(PassthroughConfig { ipa, pa, size: reg[1] as u64, intid })
}

fn parse_image(node: FdtNode<'_, '_>) -> Result<OsImage, ConfigError> {
    let os_type = OsType::from_u32(number(node, "type")? as u32)
        .ok_or(ConfigError::InvalidValue("type"))?;
    let nr_vcpus = number(node, "vcpus")? as usize;

    let mut affinity = [0; MAX_VCPU_NUM];
    if let Some(p) = node.property("vcpu_affinity") {
        for (slot, cpu) in affinity.iter_mut().zip(cells(p.value)) {
            *slot = cpu;
        }
    }

    let image_size = match node.property("image_size") {
        Some(_) => number(node, "image_size")?,
        None => DEFAULT_IMAGE_SIZE,
    };
    let (mem_ipa, mem_size) = addr_size_pair(node, "memory")?;
    let phymem = match node.property("phymem") {
        Some(_) => Some(addr_size_pair(node, "phymem")?.0),
        None => None,
    };

    let mut vgic = None;
    let mut console = None;
    let mut passthrough = [None; MAX_PASSTHROUGH];
    let mut nr_passthrough = 0;
    for child in node.children() {
        let compatible = child.compatible().map(|c| c.first());
        match compatible {
            Some("arm,gicv3") => vgic = Some(parse_gic(child)?),
            Some("rt_thread,vm_console") => console = Some(parse_console(child)?),
            Some("rthyp,passthrough") => {
                let slot = passthrough
                    .get_mut(nr_passthrough)
                    .ok_or(ConfigError::InvalidValue("passthrough"))?;
                *slot = Some(parse_passthrough(child)?);
                nr_passthrough += 1;
            }
            other => warn!("config: {}: ignoring device {:?}", node.name, other),
        }
    }

    let name = node.name.split('@').next().unwrap_or(node.name);
    let image = OsImage {
        name: VmName::new(name),
        os_type,
        nr_vcpus,
        affinity,
        image_addr: number(node, "image_address")?,
        image_size,
        entry: number(node, "entry")?,
        mem_ipa,
        mem_size,
        phymem,
        vgic: vgic.ok_or(ConfigError::MissingProperty("gic"))?,
        console,
        passthrough,
    };
    image.validate()?;
    debug!("config: image {} ({})", image.name, image.os_type.as_str());
    Ok(image)
}

/// Parse every OS image under `/vm`.
pub fn parse_images(blob: &[u8]) -> Result<Vec<OsImage>, ConfigError> {
    let fdt = Fdt::new(blob).map_err(|_| ConfigError::BadBlob)?;
    let vm = fdt.find_node("/vm").ok_or(ConfigError::NoVmNode)?;
    let mut images = Vec::new();
    for child in vm.children() {
        let image = parse_image(child)?;
        images.try_reserve(1).map_err(|_| ConfigError::BadBlob)?;
        images.push(image);
    }
    Ok(images)
}

// ── Built-in profiles ────────────────────────────────────────────────

/// QEMU virt and RK3568 RT-Thread guests.
pub fn builtin_images() -> Vec<OsImage> {
    let qemu = OsImage {
        name: VmName::new("qemu-rtthread"),
        os_type: OsType::RtThread,
        nr_vcpus: 1,
        affinity: [0; MAX_VCPU_NUM],
        image_addr: 0x4500_0000,
        image_size: 0x2_9CD0,
        entry: 0x4000_8000,
        mem_ipa: 0x4000_0000,
        mem_size: 8 << 20,
        phymem: None,
        vgic: VgicConfig {
            gicd_base: 0x0800_0000,
            gicr_base: 0x080A_0000,
            maintenance_intid: GIC_MAINTENANCE_INTID,
            virq_num: DEFAULT_VIRQ_NUM,
        },
        console: Some(ConsoleConfig {
            base: 0x0900_0000,
            size: 0x1000,
            intid: 33,
        }),
        passthrough: [None; MAX_PASSTHROUGH],
    };
    let rk3568 = OsImage {
        name: VmName::new("rk3568-rtthread"),
        image_addr: 0x0020_8000,
        image_size: 0x1_DC80,
        entry: 0x0020_8000,
        mem_ipa: 0x0020_0000,
        vgic: VgicConfig {
            gicd_base: 0xFD40_0000,
            gicr_base: 0xFD46_0000,
            ..qemu.vgic
        },
        console: Some(ConsoleConfig {
            base: 0xFE66_0000,
            size: 0x1000,
            intid: 32 + 116 + 2,
        }),
        ..qemu
    };
    let mut images = Vec::new();
    images.extend_from_slice(&[qemu, rk3568]);
    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_images_are_valid() {
        let images = builtin_images();
        assert_eq!(images.len(), 2);
        for image in &images {
            image.validate().unwrap();
        }
        assert_eq!(images[0].console.unwrap().intid, 33);
    }

    #[test]
    fn test_name_truncation() {
        let n = VmName::new("a-very-long-vm-name-indeed");
        assert_eq!(n.as_str().len(), VM_NAME_SIZE);
        assert_eq!(VmName::new("linux").as_str(), "linux");
        // Never splits a multi-byte character.
        let n = VmName::new("ééééééééé");
        assert_eq!(n.as_str(), "éééééééé");
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let good = builtin_images()[0];
        let bad_mem = OsImage { mem_size: 0x10_0000, ..good };
        assert_eq!(bad_mem.validate(), Err(ConfigError::InvalidValue("memory")));
        let bad_entry = OsImage { entry: 0x3000_0000, ..good };
        assert_eq!(bad_entry.validate(), Err(ConfigError::InvalidValue("entry")));
        let bad_vcpus = OsImage { nr_vcpus: MAX_VCPU_NUM + 1, ..good };
        assert_eq!(bad_vcpus.validate(), Err(ConfigError::InvalidValue("vcpus")));
    }

    #[test]
    fn test_os_type_names() {
        assert_eq!(OsType::from_u32(0), Some(OsType::Linux));
        assert_eq!(OsType::from_u32(4), None);
        assert_eq!(OsType::Zephyr.as_str(), "Zephyr");
    }
}
