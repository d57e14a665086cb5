//! Raw views of on-flash structures.
//!
//! Persisted records are `repr(C, packed)` structs of little-endian
//! integers, read and written through byte views.  The views expose the
//! struct's memory directly, so the bytes that reach flash carry the
//! host's byte order; the build is restricted to little-endian targets
//! below instead of swapping every field on every access.  `as_mut_raw`
//! is only sound for structs whose every field is valid for all bit
//! patterns, which holds for everything stored on flash here.

use core::{mem, slice};

use crate::config::ERASED_VALUE;

// The persisted layout is bit-exact little-endian; a big-endian host
// would silently write foreign headers.
#[cfg(target_endian = "big")]
compile_error!("on-flash records are little-endian; build for a little-endian target");

pub trait AsRaw: Sized {
    fn as_raw(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const _ as *const u8, mem::size_of::<Self>()) }
    }
}

/// Mutable byte view of a structure.  Unsafe to implement: the type must
/// accept arbitrary bytes in every field.
pub unsafe trait AsMutRaw: Sized {
    fn as_mut_raw(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self as *mut _ as *mut u8, mem::size_of::<Self>()) }
    }
}

/// True if every byte still carries the erased value, meaning the slot has
/// never been programmed.
pub fn is_buffer_erased(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == ERASED_VALUE)
}

/// Fill a structure with the erased pattern.
pub fn erase_struct<T: AsMutRaw>(value: &mut T) {
    value.as_mut_raw().fill(ERASED_VALUE);
}

/// Checksum over on-flash records.
pub type Checksum = u32;

/// Value of a checksum field that was never programmed.
pub const CHECKSUM_ERASED: Checksum = Checksum::MAX;

/// Byte-wise wrapping sum.  Cannot collide with [`CHECKSUM_ERASED`] for
/// the record sizes used here.
pub fn calc_checksum(bytes: &[u8]) -> Checksum {
    bytes.iter().fold(0, |acc, &b| acc.wrapping_add(b as Checksum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Eq, PartialEq, Clone, Copy)]
    #[repr(C, packed)]
    struct Record {
        a: u32,
        b: u8,
        c: u16,
    }

    impl AsRaw for Record {}
    unsafe impl AsMutRaw for Record {}

    #[test]
    fn raw_round_trip() {
        // Little-endian is guaranteed by the compile-time gate above.
        let mut rec = Record::default();
        rec.as_mut_raw()
            .copy_from_slice(&[0x78, 0x56, 0x34, 0x12, 0x54, 0xcd, 0xab]);
        assert_eq!(
            rec,
            Record {
                a: 0x12345678,
                b: 0x54,
                c: 0xabcd,
            }
        );
        assert_eq!(rec.as_raw(), &[0x78, 0x56, 0x34, 0x12, 0x54, 0xcd, 0xab][..]);
    }

    #[test]
    fn erased_detection() {
        let mut rec = Record::default();
        assert!(!is_buffer_erased(rec.as_raw()));
        erase_struct(&mut rec);
        assert!(is_buffer_erased(rec.as_raw()));
    }

    #[test]
    fn checksum_sums_bytes() {
        assert_eq!(calc_checksum(&[]), 0);
        assert_eq!(calc_checksum(&[1, 2, 3]), 6);
        assert_ne!(calc_checksum(&[0xff; 8]), CHECKSUM_ERASED);
    }
}
