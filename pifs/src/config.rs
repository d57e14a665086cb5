//! Compile-time configuration.
//!
//! Geometry of the target part and the filesystem parameters derived from
//! it.  The profile below is the M25P80 serial NOR: 16 blocks of 256 pages
//! of 256 bytes.

/// Number of erase blocks on the device.
pub const BLOCK_NUM_ALL: u16 = 16;
/// Blocks at the start of the device the filesystem must not touch.
pub const BLOCK_RESERVED_NUM: u16 = 0;
/// Physical program pages per erase block.
pub const FLASH_PAGE_PER_BLOCK: usize = 256;
/// Physical page size in bytes.
pub const FLASH_PAGE_SIZE: usize = 256;
/// Value of a byte that has never been programmed since erase.
pub const ERASED_VALUE: u8 = 0xff;
/// Bitwise complement of [`ERASED_VALUE`]; marks deleted slots.
pub const PROGRAMMED_VALUE: u8 = 0x00;

/// Allocation unit of the filesystem.  Must be a power-of-two multiple of
/// the physical page size.
pub const LOGICAL_PAGE_SIZE: usize = 256;

/// Maximum number of simultaneously open files.
pub const OPEN_FILE_NUM_MAX: usize = 4;
/// Maximum number of simultaneously open directories.
pub const OPEN_DIR_NUM_MAX: usize = 2;
/// Maximum length of a file name in bytes.
pub const FILENAME_LEN_MAX: usize = 32;
/// Maximum number of files.
pub const ENTRY_NUM_MAX: usize = 254;
/// Blocks per management area.  The filesystem reserves twice this many:
/// the active area plus the pre-allocated target of the next merge.
pub const MANAGEMENT_BLOCK_NUM: u16 = 1;
/// Entries in the header's cache of least worn blocks.
pub const LEAST_WEARED_BLOCK_NUM: usize = 6;
/// Entries in the header's cache of most worn blocks.
pub const MOST_WEARED_BLOCK_NUM: usize = 6;
/// Logical pages reserved for the delta map.
pub const DELTA_MAP_PAGE_NUM: usize = 2;

/// A cold block is emptied when it trails the most worn block by at least
/// this many erases.
pub const STATIC_WEAR_LEVEL_LIMIT: u32 = 20;
/// Blocks processed per static wear leveling round.
pub const STATIC_WEAR_LEVEL_BLOCKS: usize = 2;
/// File close operations between automatic static wear leveling rounds.
pub const AUTO_STATIC_WEAR_PERIOD: u32 = 100;

/// Store an attribute byte in every entry.
pub const ENABLE_ATTRIBUTES: bool = true;
/// Store an application-defined data blob in every entry.
pub const ENABLE_USER_DATA: bool = true;
/// Allow seeking past the end of a file; the gap is filled on the next
/// write.
pub const ENABLE_FSEEK_BEYOND_FILE: bool = true;
/// Fill seek gaps with the erased value instead of zeros, so the gap
/// bytes need no programming.
pub const ENABLE_FSEEK_ERASED_VALUE: bool = false;
/// Byte used to fill a seek gap.
pub const FSEEK_FILL_VALUE: u8 = if ENABLE_FSEEK_ERASED_VALUE {
    ERASED_VALUE
} else {
    PROGRAMMED_VALUE
};
/// Count to-be-released pages as free space.
pub const CALC_TBR_IN_FREE_SPACE: bool = false;

/// Bytes of the attribute field in each entry.
pub const ATTRIBUTE_SIZE: usize = if ENABLE_ATTRIBUTES { 1 } else { 0 };
/// Bytes of per-file user data stored in each entry.
pub const USER_DATA_SIZE: usize = if ENABLE_USER_DATA { 8 } else { 0 };
// The packed entry layout carries both optional fields; disabling either
// flag means dropping the matching field from the entry struct as well.
const _: () = assert!(ENABLE_ATTRIBUTES && ENABLE_USER_DATA);

// Derived sizes.  Everything below follows from the constants above; the
// compile-time asserts at the bottom catch configurations that cannot fit.

/// Physical pages composing one logical page.
pub const FLASH_PAGE_PER_LOGICAL_PAGE: usize = LOGICAL_PAGE_SIZE / FLASH_PAGE_SIZE;
/// Logical pages per erase block.
pub const LOGICAL_PAGE_PER_BLOCK: usize = FLASH_PAGE_PER_BLOCK * FLASH_PAGE_SIZE / LOGICAL_PAGE_SIZE;
/// Blocks available to the filesystem.
pub const BLOCK_NUM_FS: u16 = BLOCK_NUM_ALL - BLOCK_RESERVED_NUM;
/// Logical pages available to the filesystem.
pub const LOGICAL_PAGE_NUM_FS: usize = BLOCK_NUM_FS as usize * LOGICAL_PAGE_PER_BLOCK;

/// Logical pages occupied by the header.
pub const HEADER_SIZE_PAGE: usize = 1;
/// Bytes per directory entry: name, attributes, size, first map address,
/// user data.
pub const ENTRY_SIZE_BYTE: usize = FILENAME_LEN_MAX + ATTRIBUTE_SIZE + 4 + 4 + USER_DATA_SIZE;
/// Entries per logical page.
pub const ENTRY_PER_PAGE: usize = LOGICAL_PAGE_SIZE / ENTRY_SIZE_BYTE;
/// Logical pages occupied by the entry list.
pub const ENTRY_LIST_SIZE_PAGE: usize = ENTRY_NUM_MAX.div_ceil(ENTRY_PER_PAGE);

/// Bytes of free-space bitmap: two bits per logical page.
pub const FREE_SPACE_BITMAP_SIZE_BYTE: usize = (LOGICAL_PAGE_NUM_FS * 2).div_ceil(8);
/// Logical pages occupied by the free-space bitmap.
pub const FREE_SPACE_BITMAP_SIZE_PAGE: usize = FREE_SPACE_BITMAP_SIZE_BYTE.div_ceil(LOGICAL_PAGE_SIZE);

/// Bytes per delta map entry: original address, delta address, checksum.
pub const DELTA_ENTRY_SIZE_BYTE: usize = 4 + 4 + 4;
/// Delta entries per logical page.
pub const DELTA_ENTRY_PER_PAGE: usize = LOGICAL_PAGE_SIZE / DELTA_ENTRY_SIZE_BYTE;
/// Total delta entries before the map forces a merge.
pub const DELTA_ENTRY_NUM: usize = DELTA_ENTRY_PER_PAGE * DELTA_MAP_PAGE_NUM;

/// Bytes per wear level entry: erase counter plus the increment latch.
pub const WEAR_LEVEL_ENTRY_SIZE_BYTE: usize = 4 + 1;
/// Wear level entries per logical page.
pub const WEAR_LEVEL_ENTRY_PER_PAGE: usize = LOGICAL_PAGE_SIZE / WEAR_LEVEL_ENTRY_SIZE_BYTE;
/// Logical pages occupied by the wear level list.
pub const WEAR_LEVEL_LIST_SIZE_PAGE: usize =
    (BLOCK_NUM_FS as usize).div_ceil(WEAR_LEVEL_ENTRY_PER_PAGE);

/// Bytes of map page header: previous address, next address, checksum.
pub const MAP_HEADER_SIZE_BYTE: usize = 4 + 4 + 4;
/// Bytes per map extent record: address plus page count.
pub const MAP_ENTRY_SIZE_BYTE: usize = 4 + 1;
/// Extent records per map page.
pub const MAP_ENTRY_PER_PAGE: usize = (LOGICAL_PAGE_SIZE - MAP_HEADER_SIZE_BYTE) / MAP_ENTRY_SIZE_BYTE;
/// Largest page count one extent can carry; the erased value marks an
/// unused slot.
pub const MAP_ENTRY_PAGE_COUNT_MAX: usize = ERASED_VALUE as usize - 1;

/// Management pages that must fit in the management area.
pub const MANAGEMENT_PAGE_NUM_MIN: usize = HEADER_SIZE_PAGE
    + ENTRY_LIST_SIZE_PAGE
    + FREE_SPACE_BITMAP_SIZE_PAGE
    + DELTA_MAP_PAGE_NUM
    + WEAR_LEVEL_LIST_SIZE_PAGE;

/// One bit per logical page, used by the filesystem check.
pub const FREE_PAGE_BUF_SIZE: usize = LOGICAL_PAGE_NUM_FS.div_ceil(8);

const _: () = assert!(LOGICAL_PAGE_SIZE >= FLASH_PAGE_SIZE);
const _: () = assert!(LOGICAL_PAGE_SIZE % FLASH_PAGE_SIZE == 0);
const _: () = assert!(LOGICAL_PAGE_SIZE.is_power_of_two());
const _: () = assert!(ENTRY_SIZE_BYTE <= LOGICAL_PAGE_SIZE);
const _: () = assert!(MANAGEMENT_PAGE_NUM_MIN <= MANAGEMENT_BLOCK_NUM as usize * LOGICAL_PAGE_PER_BLOCK);
const _: () = assert!(BLOCK_RESERVED_NUM + 2 * MANAGEMENT_BLOCK_NUM < BLOCK_NUM_ALL);
const _: () = assert!(LOGICAL_PAGE_PER_BLOCK <= u16::MAX as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sizes() {
        assert_eq!(ENTRY_SIZE_BYTE, 49);
        assert_eq!(ENTRY_PER_PAGE, 5);
        assert_eq!(ENTRY_LIST_SIZE_PAGE, 51);
        assert_eq!(FREE_SPACE_BITMAP_SIZE_PAGE, 4);
        assert_eq!(DELTA_ENTRY_PER_PAGE, 21);
        assert_eq!(WEAR_LEVEL_LIST_SIZE_PAGE, 1);
        assert_eq!(MAP_ENTRY_PER_PAGE, 48);
        assert!(MANAGEMENT_PAGE_NUM_MIN < LOGICAL_PAGE_PER_BLOCK);
    }
}
