//! Free-space bitmap.
//!
//! Two bits per logical page: F ("free") and R ("not to be released"),
//! both erased on a fresh page.  Allocation programs F, releasing programs
//! R, so the legal states are (1,1) free, (0,1) live and (0,0) garbage
//! awaiting erase.  Programming is the only transition; restoring bits is
//! the merge engine's job.

use log::trace;
use storage::Flash;

use crate::addr::Address;
use crate::alloc::WearPolicy;
use crate::config::*;
use crate::fs::SpaceInfo;
use crate::header::{BlockType, Header};
use crate::{Error, Pifs, Result};

/// Where one page's bit pair lives: bitmap page, byte offset, F bit mask,
/// R bit mask.
fn bitmap_location(header: &Header, addr: Address) -> Result<(Address, usize, u8, u8)> {
    let index = addr.fs_page_index();
    let byte_index = index / 4;
    let pair = (index % 4) as u8;
    let page = header
        .free_space_bitmap_address
        .plus_pages(byte_index / LOGICAL_PAGE_SIZE)?;
    Ok((
        page,
        byte_index % LOGICAL_PAGE_SIZE,
        1 << (pair * 2),
        1 << (pair * 2 + 1),
    ))
}

impl<F: Flash> Pifs<F> {
    /// Program FSBM bits for `count` pages starting at `addr`.
    ///
    /// `set_used` clears the F bit (free -> allocated), `set_tbr` clears
    /// the R bit (live -> to be released).  A transition that disagrees
    /// with the current state fails.
    pub(crate) fn mark_page(
        &mut self,
        addr: Address,
        count: usize,
        set_used: bool,
        set_tbr: bool,
    ) -> Result<()> {
        let header = self.header;
        self.mark_page_in(&header, addr, count, set_used, set_tbr)
    }

    /// Same as [`Self::mark_page`] against an explicit header; the merge
    /// engine builds the next area's bitmap this way.
    pub(crate) fn mark_page_in(
        &mut self,
        header: &Header,
        addr: Address,
        count: usize,
        set_used: bool,
        set_tbr: bool,
    ) -> Result<()> {
        trace!("mark {} x{} used:{} tbr:{}", addr, count, set_used, set_tbr);
        let mut addr = addr;
        for i in 0..count {
            let (page, offset, f_mask, r_mask) = bitmap_location(header, addr)?;
            let mut byte = [0u8];
            self.cache.read(&mut self.flash, page, offset, &mut byte)?;
            if set_used {
                if byte[0] & f_mask == 0 {
                    return Err(Error::General);
                }
                byte[0] &= !f_mask;
            }
            if set_tbr {
                if byte[0] & r_mask == 0 {
                    return Err(Error::General);
                }
                byte[0] &= !r_mask;
            }
            self.cache.write(&mut self.flash, page, offset, &byte)?;
            if i + 1 < count {
                addr.inc_page()?;
            }
        }
        Ok(())
    }

    pub(crate) fn is_page_free(&mut self, addr: Address) -> Result<bool> {
        let header = self.header;
        self.is_page_free_in(&header, addr)
    }

    pub(crate) fn is_page_free_in(&mut self, header: &Header, addr: Address) -> Result<bool> {
        let (page, offset, f_mask, _) = bitmap_location(header, addr)?;
        let mut byte = [0u8];
        self.cache.read(&mut self.flash, page, offset, &mut byte)?;
        Ok(byte[0] & f_mask != 0)
    }

    pub(crate) fn is_page_to_be_released(&mut self, addr: Address) -> Result<bool> {
        let header = self.header;
        let (page, offset, _, r_mask) = bitmap_location(&header, addr)?;
        let mut byte = [0u8];
        self.cache.read(&mut self.flash, page, offset, &mut byte)?;
        Ok(byte[0] & r_mask == 0)
    }

    /// Longest run of free pages inside one block, capped at `max_count`.
    fn scan_block(
        &mut self,
        header: &Header,
        block: u16,
        max_count: usize,
    ) -> Result<(Address, usize)> {
        let mut best_start = 0u16;
        let mut best_len = 0usize;
        let mut run_start = 0u16;
        let mut run_len = 0usize;
        for pa in 0..LOGICAL_PAGE_PER_BLOCK as u16 {
            if self.is_page_free_in(header, Address::new(block, pa))? {
                if run_len == 0 {
                    run_start = pa;
                }
                run_len += 1;
                if run_len > best_len {
                    best_start = run_start;
                    best_len = run_len;
                    if best_len >= max_count {
                        break;
                    }
                }
            } else {
                run_len = 0;
            }
        }
        Ok((Address::new(block, best_start), best_len.min(max_count)))
    }

    /// Locate a run of at least `min_count` consecutive free logical pages
    /// in a block of the requested type, preferring least worn data blocks
    /// when the policy asks for it.
    pub(crate) fn find_free_page_wl(
        &mut self,
        min_count: usize,
        max_count: usize,
        block_type: BlockType,
        policy: WearPolicy,
    ) -> Result<(Address, usize)> {
        let header = self.header;

        if policy == WearPolicy::LeastWeared && block_type == BlockType::Data {
            let least = header.least_weared_blocks;
            for slot in least.iter() {
                let ba = slot.block_address;
                if ba == 0xffff || !header.is_block_type(ba, BlockType::Data) {
                    continue;
                }
                let (addr, len) = self.scan_block(&header, ba, max_count)?;
                if len >= min_count {
                    return Ok((addr, len));
                }
            }
        }

        // Linear fallback over every block of the requested type.
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            if !header.is_block_type(ba, block_type) {
                continue;
            }
            let (addr, len) = self.scan_block(&header, ba, max_count)?;
            if len >= min_count {
                return Ok((addr, len));
            }
        }
        Err(Error::NoMoreSpace)
    }

    /// Free and to-be-released page counts of a single block.
    pub(crate) fn get_pages_of_block(&mut self, block: u16) -> Result<(usize, usize)> {
        let header = self.header;
        let mut free = 0;
        let mut tbr = 0;
        for pa in 0..LOGICAL_PAGE_PER_BLOCK as u16 {
            let addr = Address::new(block, pa);
            let (page, offset, f_mask, r_mask) = bitmap_location(&header, addr)?;
            let mut byte = [0u8];
            self.cache.read(&mut self.flash, page, offset, &mut byte)?;
            if byte[0] & f_mask != 0 {
                free += 1;
            } else if byte[0] & r_mask == 0 {
                tbr += 1;
            }
        }
        Ok((free, tbr))
    }

    fn space_scan(&mut self, count_tbr: bool) -> Result<SpaceInfo> {
        let header = self.header;
        let mut info = SpaceInfo::default();
        for index in 0..LOGICAL_PAGE_NUM_FS {
            let addr = Address::from_fs_page_index(index);
            let kind = header.block_type(addr.block);
            if kind != BlockType::Data && kind != BlockType::PrimaryManagement {
                continue;
            }
            let (page, offset, f_mask, r_mask) = bitmap_location(&header, addr)?;
            let mut byte = [0u8];
            self.cache.read(&mut self.flash, page, offset, &mut byte)?;
            let counted = if count_tbr {
                byte[0] & f_mask == 0 && byte[0] & r_mask == 0
            } else {
                let mut free = byte[0] & f_mask != 0;
                if CALC_TBR_IN_FREE_SPACE {
                    free = free || (byte[0] & r_mask == 0);
                }
                free
            };
            if counted {
                if kind == BlockType::Data {
                    info.data_pages += 1;
                } else {
                    info.management_pages += 1;
                }
            }
        }
        info.data_bytes = info.data_pages * LOGICAL_PAGE_SIZE;
        info.management_bytes = info.management_pages * LOGICAL_PAGE_SIZE;
        Ok(info)
    }

    /// Free space, split into the data and management areas.
    pub fn get_free_space(&mut self) -> Result<SpaceInfo> {
        self.space_scan(false)
    }

    /// Space occupied by garbage pages that the next merge can reclaim.
    pub fn get_to_be_released_space(&mut self) -> Result<SpaceInfo> {
        self.space_scan(true)
    }
}
