//! File system header.
//!
//! One logical page at the start of each management area.  The header with
//! the largest valid counter and a matching checksum is authoritative;
//! everything else in the filesystem is reached through its addresses.

use log::{debug, info};
use storage::Flash;

use crate::addr::Address;
use crate::config::*;
use crate::onflash::{calc_checksum, AsMutRaw, AsRaw, Checksum, CHECKSUM_ERASED};
use crate::{Error, Pifs, Result};

pub(crate) const MAGIC: u32 = 0x5346_4950; // "PIFS"
pub(crate) const MAJOR_VERSION: u8 = 1;
pub(crate) const MINOR_VERSION: u8 = 0;

/// Wear level counter: total erases of a block.
pub(crate) type WearCntr = u32;
pub(crate) const WEAR_LEVEL_CNTR_MAX: WearCntr = WearCntr::MAX;

/// Role of a block, derived from the header's management area addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Not used by the filesystem.
    Reserved,
    /// The active management area.
    PrimaryManagement,
    /// Pre-allocated target of the next merge.
    SecondaryManagement,
    /// Everything else: file data.
    Data,
}

/// Cached (block, wear counter) pair in the header's worn-block tables.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct WearCacheEntry {
    pub block_address: u16,
    pub wear_level_cntr: WearCntr,
}

#[derive(Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct Header {
    pub magic: u32,
    pub major_version: u8,
    pub minor_version: u8,
    /// Incremented at every merge; the highest valid counter wins at init.
    pub counter: u32,
    // Configuration echo, checked at init so a device formatted with a
    // different build is rejected instead of misread.
    pub block_num_all: u16,
    pub block_reserved_num: u16,
    pub logical_page_per_block: u16,
    pub logical_page_size: u16,
    pub filename_len_max: u8,
    pub entry_num_max: u16,
    pub user_data_size: u8,
    pub management_block_num: u8,
    pub least_weared_block_num: u8,
    pub most_weared_block_num: u8,
    pub delta_map_page_num: u8,
    pub map_page_count_size: u8,
    pub root_entry_list_address: Address,
    pub free_space_bitmap_address: Address,
    pub delta_map_address: Address,
    pub wear_level_list_address: Address,
    pub management_block_address: u16,
    pub next_management_block_address: u16,
    pub least_weared_blocks: [WearCacheEntry; LEAST_WEARED_BLOCK_NUM],
    pub most_weared_blocks: [WearCacheEntry; MOST_WEARED_BLOCK_NUM],
    pub wear_level_cntr_max: WearCntr,
    pub checksum: Checksum,
}

impl AsRaw for Header {}
unsafe impl AsMutRaw for Header {}

const _: () = assert!(core::mem::size_of::<Header>() <= LOGICAL_PAGE_SIZE);

impl Header {
    /// All-erased header, the state of a management page that was never
    /// written.
    pub(crate) fn erased() -> Header {
        let mut header = Header::default();
        crate::onflash::erase_struct(&mut header);
        header
    }

    /// Lay out a fresh header for the management area starting at
    /// `management_block`.  The worn-block caches start erased; they are
    /// filled by the wear leveler.
    pub(crate) fn layout(
        management_block: u16,
        next_management_block: u16,
        counter: u32,
    ) -> Result<Header> {
        let mut address = Address::new(management_block, 0);
        address.add_pages(HEADER_SIZE_PAGE)?;
        let root_entry_list_address = address;
        address.add_pages(ENTRY_LIST_SIZE_PAGE)?;
        let free_space_bitmap_address = address;
        address.add_pages(FREE_SPACE_BITMAP_SIZE_PAGE)?;
        let delta_map_address = address;
        address.add_pages(DELTA_MAP_PAGE_NUM)?;
        let wear_level_list_address = address;
        address.add_pages(WEAR_LEVEL_LIST_SIZE_PAGE)?;
        if address.block >= management_block + MANAGEMENT_BLOCK_NUM {
            // Management structures do not fit into the management area.
            return Err(Error::Configuration);
        }

        Ok(Header {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            counter,
            block_num_all: BLOCK_NUM_ALL,
            block_reserved_num: BLOCK_RESERVED_NUM,
            logical_page_per_block: LOGICAL_PAGE_PER_BLOCK as u16,
            logical_page_size: LOGICAL_PAGE_SIZE as u16,
            filename_len_max: FILENAME_LEN_MAX as u8,
            entry_num_max: ENTRY_NUM_MAX as u16,
            user_data_size: USER_DATA_SIZE as u8,
            management_block_num: MANAGEMENT_BLOCK_NUM as u8,
            least_weared_block_num: LEAST_WEARED_BLOCK_NUM as u8,
            most_weared_block_num: MOST_WEARED_BLOCK_NUM as u8,
            delta_map_page_num: DELTA_MAP_PAGE_NUM as u8,
            map_page_count_size: 1,
            root_entry_list_address,
            free_space_bitmap_address,
            delta_map_address,
            wear_level_list_address,
            management_block_address: management_block,
            next_management_block_address: next_management_block,
            least_weared_blocks: [WearCacheEntry {
                block_address: 0xffff,
                wear_level_cntr: WEAR_LEVEL_CNTR_MAX,
            }; LEAST_WEARED_BLOCK_NUM],
            most_weared_blocks: [WearCacheEntry {
                block_address: 0xffff,
                wear_level_cntr: WEAR_LEVEL_CNTR_MAX,
            }; MOST_WEARED_BLOCK_NUM],
            wear_level_cntr_max: 0,
            checksum: CHECKSUM_ERASED,
        })
    }

    pub(crate) fn calc_checksum(&self) -> Checksum {
        let raw = self.as_raw();
        calc_checksum(&raw[..raw.len() - core::mem::size_of::<Checksum>()])
    }

    pub(crate) fn seal(&mut self) {
        self.checksum = self.calc_checksum();
    }

    pub(crate) fn is_valid(&self) -> bool {
        let checksum = self.checksum;
        self.magic == MAGIC
            && self.major_version == MAJOR_VERSION
            && self.minor_version == MINOR_VERSION
            && checksum != CHECKSUM_ERASED
            && checksum == self.calc_checksum()
    }

    /// True if the on-flash configuration echo matches this build.
    pub(crate) fn config_matches(&self) -> bool {
        self.block_num_all == BLOCK_NUM_ALL
            && self.block_reserved_num == BLOCK_RESERVED_NUM
            && self.logical_page_per_block == LOGICAL_PAGE_PER_BLOCK as u16
            && self.logical_page_size == LOGICAL_PAGE_SIZE as u16
            && self.filename_len_max == FILENAME_LEN_MAX as u8
            && self.entry_num_max == ENTRY_NUM_MAX as u16
            && self.user_data_size == USER_DATA_SIZE as u8
            && self.management_block_num == MANAGEMENT_BLOCK_NUM as u8
            && self.delta_map_page_num == DELTA_MAP_PAGE_NUM as u8
            && self.map_page_count_size == 1
    }

    pub(crate) fn block_type(&self, block: u16) -> BlockType {
        if block < BLOCK_RESERVED_NUM {
            return BlockType::Reserved;
        }
        let primary = self.management_block_address;
        if block >= primary && block < primary + MANAGEMENT_BLOCK_NUM {
            return BlockType::PrimaryManagement;
        }
        let secondary = self.next_management_block_address;
        if block >= secondary && block < secondary.saturating_add(MANAGEMENT_BLOCK_NUM) {
            return BlockType::SecondaryManagement;
        }
        BlockType::Data
    }

    pub(crate) fn is_block_type(&self, block: u16, kind: BlockType) -> bool {
        self.block_type(block) == kind
    }

    /// First management page past the fixed structures; merge places the
    /// rebuilt map pages from here on.
    pub(crate) fn management_free_start(&self) -> Result<Address> {
        self.wear_level_list_address
            .plus_pages(WEAR_LEVEL_LIST_SIZE_PAGE)
    }
}

impl<F: Flash> Pifs<F> {
    /// Write a header page and, for a fresh filesystem, seed the wear level
    /// list and mark the management structures used in the bitmap.
    ///
    /// The bitmap pages mark themselves: they are part of the management
    /// area recorded here, which keeps the self-referential layout from
    /// ever allocating over its own metadata.
    pub(crate) fn header_write(&mut self, header: &Header, mark_pages: bool) -> Result<()> {
        let addr = Address::new(header.management_block_address, 0);
        let bytes = *header;
        self.cache.write(&mut self.flash, addr, 0, bytes.as_raw())?;
        self.header = *header;
        self.header_address = addr;

        if header.counter == 0 {
            // Very first header of a formatted device.
            self.wear_level_list_init()?;
        }
        if mark_pages {
            let entry_list = header.root_entry_list_address;
            let bitmap = header.free_space_bitmap_address;
            let delta = header.delta_map_address;
            let wear = header.wear_level_list_address;
            self.mark_page(addr, HEADER_SIZE_PAGE, true, false)?;
            debug!("marking entry list {}, {} pages", entry_list, ENTRY_LIST_SIZE_PAGE);
            self.mark_page(entry_list, ENTRY_LIST_SIZE_PAGE, true, false)?;
            self.mark_page(bitmap, FREE_SPACE_BITMAP_SIZE_PAGE, true, false)?;
            self.mark_page(delta, DELTA_MAP_PAGE_NUM, true, false)?;
            self.mark_page(wear, WEAR_LEVEL_LIST_SIZE_PAGE, true, false)?;
        }
        self.cache.flush(&mut self.flash)?;

        let counter = header.counter;
        info!("header written, counter {}", counter);
        Ok(())
    }

    /// Read the header candidate stored at page 0 of a block.
    pub(crate) fn read_header_at(&mut self, block: u16) -> Result<Header> {
        let mut header = Header::erased();
        self.cache
            .read(&mut self.flash, Address::new(block, 0), 0, header.as_mut_raw())?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_addresses_are_consecutive() {
        let h = Header::layout(0, 1, 0).unwrap();
        let entry_list = h.root_entry_list_address;
        let bitmap = h.free_space_bitmap_address;
        let wear = h.wear_level_list_address;
        assert_eq!(entry_list, Address::new(0, 1));
        assert_eq!(bitmap, Address::new(0, (1 + ENTRY_LIST_SIZE_PAGE) as u16));
        assert_eq!(
            wear.page as usize,
            1 + ENTRY_LIST_SIZE_PAGE + FREE_SPACE_BITMAP_SIZE_PAGE + DELTA_MAP_PAGE_NUM
        );
        assert!(h.management_free_start().unwrap().page as usize == wear.page as usize + 1);
    }

    #[test]
    fn checksum_gates_validity() {
        let mut h = Header::layout(0, 1, 3).unwrap();
        assert!(!h.is_valid());
        h.seal();
        assert!(h.is_valid());
        h.counter = 4;
        assert!(!h.is_valid());
    }

    #[test]
    fn block_roles() {
        let h = Header::layout(0, 1, 0).unwrap();
        assert_eq!(h.block_type(0), BlockType::PrimaryManagement);
        assert_eq!(h.block_type(1), BlockType::SecondaryManagement);
        assert_eq!(h.block_type(2), BlockType::Data);
        assert_eq!(h.block_type(15), BlockType::Data);
    }
}
