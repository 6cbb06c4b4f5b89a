//! Stage-2 translation laws

mod common;

use proptest::prelude::*;
use rthyp::arch::aarch64::defs::{BLOCK_SIZE_1GB, BLOCK_SIZE_2MB};
use rthyp::arch::aarch64::mm::{MapFlags, Stage2Table, IPA_LIMIT};
use rthyp::Stage2Error;

const MB2: u64 = BLOCK_SIZE_2MB;

/// (ipa, pa, size) with everything 2MB aligned and inside the IPA space
fn region() -> impl Strategy<Value = (u64, u64, u64)> {
    let max_block = IPA_LIMIT / MB2;
    (0..max_block - 16, 0u64..(1 << 19), 1u64..=16)
        .prop_map(|(ipa, pa, blocks)| (ipa * MB2, pa * MB2, blocks * MB2))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn map_then_translate_is_linear((ipa, pa, size) in region(), sample in any::<u64>()) {
        let mut s2 = Stage2Table::new(1).unwrap();
        s2.map(ipa, pa, size, MapFlags::NORMAL_RWX).unwrap();

        let offset = sample % size;
        prop_assert_eq!(s2.translate(ipa + offset), Ok(pa + offset));
        prop_assert_eq!(s2.translate(ipa), Ok(pa));
        prop_assert_eq!(s2.translate(ipa + size - 1), Ok(pa + size - 1));
    }

    #[test]
    fn unmap_same_range_leaves_nothing((ipa, pa, size) in region(), sample in any::<u64>()) {
        let mut s2 = Stage2Table::new(1).unwrap();
        s2.map(ipa, pa, size, MapFlags::NORMAL_RWX).unwrap();
        prop_assert_eq!(s2.unmap(ipa, size), Ok(true));

        let offset = sample % size;
        prop_assert_eq!(s2.translate(ipa + offset), Err(Stage2Error::NotMapped));
        prop_assert_eq!(s2.tables_in_use(), 0);
    }

    #[test]
    fn misaligned_map_installs_nothing(
        (ipa, pa, size) in region(),
        skew in 1u64..MB2,
        which in 0usize..3,
    ) {
        let mut s2 = Stage2Table::new(1).unwrap();
        let (ipa_x, pa_x, size_x) = match which {
            0 => (ipa + skew, pa, size),
            1 => (ipa, pa + skew, size),
            _ => (ipa, pa, size + skew),
        };
        prop_assert_eq!(
            s2.map(ipa_x, pa_x, size_x, MapFlags::NORMAL_RWX),
            Err(Stage2Error::Unaligned)
        );
        prop_assert_eq!(s2.tables_in_use(), 0);
        prop_assert_eq!(s2.translate(ipa), Err(Stage2Error::NotMapped));
    }
}

#[test]
fn test_zero_length_map_rejected() {
    let mut s2 = Stage2Table::new(0).unwrap();
    assert_eq!(s2.map(0, 0, 0, MapFlags::NORMAL_RWX), Err(Stage2Error::Unaligned));
    assert_eq!(s2.unmap(0, 0), Err(Stage2Error::Unaligned));
}

#[test]
fn test_gigabyte_mapping_survives_partial_unmap() {
    let mut s2 = Stage2Table::new(0).unwrap();
    s2.map(BLOCK_SIZE_1GB, 0, BLOCK_SIZE_1GB, MapFlags::NORMAL_RWX).unwrap();
    s2.unmap(BLOCK_SIZE_1GB + 10 * MB2, 2 * MB2).unwrap();
    assert_eq!(s2.translate(BLOCK_SIZE_1GB + 9 * MB2), Ok(9 * MB2));
    assert_eq!(s2.translate(BLOCK_SIZE_1GB + 11 * MB2), Err(Stage2Error::NotMapped));
    assert_eq!(s2.translate(BLOCK_SIZE_1GB + 12 * MB2 + 4), Ok(12 * MB2 + 4));
}
