//! The additive ones'-complement checksum shared by the VHD footer and dynamic header.
//!
//! The checksum is the complement of the byte-sum of the structure with its own checksum
//! field treated as zero. Rather than copying the structure to zero that field, the sum is
//! seeded with the negated sum of the field's current bytes so that they cancel out.

use std::ops::Range;

use crate::util::{be_u32, put_be_u32};

/// Adds every byte of `bytes` (as `u32`, wrapping) to `seed`.
pub fn checksum_accumulate(seed: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(seed, |acc, b| acc.wrapping_add(u32::from(*b)))
}

/// Computes the VHD checksum of `raw`, where `field` is the location of the checksum itself.
pub fn vhd_checksum(raw: &[u8], field: Range<usize>) -> u32 {
    let field_sum = checksum_accumulate(0, &raw[field]);
    !checksum_accumulate(field_sum.wrapping_neg(), raw)
}

pub(crate) fn stored_checksum(raw: &[u8], field: Range<usize>) -> u32 {
    be_u32(&raw[field])
}

/// Recomputes the checksum of `raw` and stores it big-endian in `field`.
pub(crate) fn stamp_checksum(raw: &mut [u8], field: Range<usize>) -> u32 {
    let checksum = vhd_checksum(raw, field.clone());
    put_be_u32(raw, field.start, checksum);
    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_checksum(raw: &[u8], field: Range<usize>) -> u32 {
        let mut sum: u32 = 0;
        for (i, b) in raw.iter().enumerate() {
            if field.contains(&i) {
                continue;
            }
            sum = sum.wrapping_add(*b as u32);
        }
        !sum
    }

    #[test]
    fn seeded_checksum_ignores_current_field_contents() {
        let mut raw = [0u8; 512];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7);
        }
        let expected = naive_checksum(&raw, 64..68);
        assert_eq!(vhd_checksum(&raw, 64..68), expected);

        raw[64..68].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(vhd_checksum(&raw, 64..68), expected);
    }

    #[test]
    fn stamped_checksum_is_stable_under_restamp() {
        let mut raw = [0x5Au8; 1024];
        let first = stamp_checksum(&mut raw, 36..40);
        assert_eq!(stored_checksum(&raw, 36..40), first);
        assert_eq!(vhd_checksum(&raw, 36..40), first);
        let second = stamp_checksum(&mut raw, 36..40);
        assert_eq!(first, second);
    }

    #[test]
    fn all_zero_structure_checksums_to_all_ones() {
        let raw = [0u8; 512];
        assert_eq!(vhd_checksum(&raw, 64..68), u32::MAX);
    }
}
