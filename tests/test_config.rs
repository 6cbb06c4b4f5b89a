//! Device tree configuration tests

mod common;

use common::{platform, vm_tree, FdtBuilder};
use rthyp::config::{parse_images, OsType};
use rthyp::platform::DEFAULT_IMAGE_SIZE;
use rthyp::{ConfigError, Hypervisor};

#[test]
fn test_parse_single_image() {
    let blob = vm_tree("rtthread", 2);
    let images = parse_images(&blob).unwrap();
    assert_eq!(images.len(), 1);

    let img = &images[0];
    assert_eq!(img.name.as_str(), "rtthread");
    assert_eq!(img.os_type, OsType::RtThread);
    assert_eq!(img.nr_vcpus, 2);
    assert_eq!(img.affinity, [0, 1, 2, 3]);
    assert_eq!(img.image_addr, 0x4500_0000);
    assert_eq!(img.image_size, 0x3_0000);
    assert_eq!(img.entry, 0x4000_8000);
    assert_eq!(img.mem_ipa, 0x4000_0000);
    assert_eq!(img.mem_size, 0x100_0000);
    assert_eq!(img.phymem, None);
    assert_eq!(img.vgic.gicd_base, 0x0800_0000);
    assert_eq!(img.vgic.gicr_base, 0x080A_0000);
    assert_eq!(img.vgic.virq_num, 96);

    let con = img.console.unwrap();
    assert_eq!((con.base, con.size, con.intid), (0x0900_0000, 0x1000, 33));
}

#[test]
fn test_image_size_defaults() {
    let blob = FdtBuilder::new()
        .begin_node("")
        .begin_node("vm")
        .begin_node("zephyr@0")
        .prop_cells("type", &[2])
        .prop_cells("vcpus", &[1])
        .prop_cells("image_address", &[0x4600_0000])
        .prop_cells("entry", &[0x4000_0000])
        .prop_cells("memory", &[0, 0x4000_0000, 0, 0x20_0000])
        .begin_node("gic")
        .prop_str("compatible", "arm,gicv3")
        .prop_cells("reg", &[0x0800_0000, 0, 0x080A_0000, 0])
        .end_node()
        .end_node()
        .end_node()
        .end_node()
        .finish();

    let images = parse_images(&blob).unwrap();
    let img = &images[0];
    // Unit address dropped from the name
    assert_eq!(img.name.as_str(), "zephyr");
    assert_eq!(img.os_type, OsType::Zephyr);
    assert_eq!(img.image_size, DEFAULT_IMAGE_SIZE);
    assert!(img.console.is_none());
}

#[test]
fn test_missing_property_is_reported() {
    let blob = FdtBuilder::new()
        .begin_node("")
        .begin_node("vm")
        .begin_node("linux")
        .prop_cells("type", &[0])
        .prop_cells("vcpus", &[1])
        .end_node()
        .end_node()
        .end_node()
        .finish();
    assert_eq!(
        parse_images(&blob).unwrap_err(),
        ConfigError::MissingProperty("memory")
    );
}

#[test]
fn test_bad_blobs() {
    assert_eq!(parse_images(&[0u8; 8]).unwrap_err(), ConfigError::BadBlob);

    let no_vm = FdtBuilder::new().begin_node("").end_node().finish();
    assert_eq!(parse_images(&no_vm).unwrap_err(), ConfigError::NoVmNode);
}

#[test]
fn test_too_many_vcpus_rejected() {
    let blob = vm_tree("big", 5);
    assert_eq!(
        parse_images(&blob).unwrap_err(),
        ConfigError::InvalidValue("vcpus")
    );
}

#[test]
fn test_hypervisor_from_fdt() {
    let blob = vm_tree("rtthread", 1);
    let mut hyp = Hypervisor::from_fdt(platform(), &blob).unwrap();
    assert_eq!(hyp.images().len(), 1);

    let idx = hyp.create_vm("guest", 0).unwrap();
    hyp.run_vm(Some(idx)).unwrap();
    let vm = hyp.vm(idx).unwrap();
    assert_eq!(vm.resources().unwrap().vgic.virq_num(), 96);
    assert!(hyp.list_os_images().contains("rtthread"));
}
