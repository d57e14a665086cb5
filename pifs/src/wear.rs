//! Wear leveling.
//!
//! One entry per filesystem block: an erase counter plus a one-byte
//! increment latch.  Reprogramming the counter in place would need an
//! erase, so each erase instead programs the lowest still-erased bit of
//! the latch; the merge engine folds the latched bits into the counter
//! when it rewrites the list into the new management area.
//!
//! Dynamic leveling happens in the allocator, which consults the header's
//! least-worn cache.  Static leveling runs here: cold blocks pinned full
//! of unchanging data are emptied by copying their files through the
//! normal write paths (onto warmer blocks) and renaming back, so the cold
//! block's pages turn into garbage and its erase counter can catch up at
//! the next merge.

use log::{debug, info, warn};
use storage::Flash;

use crate::addr::Address;
use crate::config::*;
use crate::entry::ATTRIB_DIR;
use crate::header::{BlockType, Header, WearCacheEntry, WearCntr};
use crate::map::{FileWalker, WalkPage};
use crate::onflash::{AsMutRaw, AsRaw};
use crate::{Error, Pifs, Result};

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct WearLevelEntry {
    pub wear_level_cntr: WearCntr,
    pub wear_level_bits: u8,
}

impl AsRaw for WearLevelEntry {}
unsafe impl AsMutRaw for WearLevelEntry {}

const _: () = assert!(core::mem::size_of::<WearLevelEntry>() == WEAR_LEVEL_ENTRY_SIZE_BYTE);

/// Flash position of a block's wear entry in the given header's list.
fn wear_entry_location(header: &Header, block: u16) -> Result<(Address, usize)> {
    let index = (block - BLOCK_RESERVED_NUM) as usize;
    let page = header
        .wear_level_list_address
        .plus_pages(index / WEAR_LEVEL_ENTRY_PER_PAGE)?;
    Ok((page, (index % WEAR_LEVEL_ENTRY_PER_PAGE) * WEAR_LEVEL_ENTRY_SIZE_BYTE))
}

impl<F: Flash> Pifs<F> {
    /// Write the initial wear level list: zero counters, erased latches.
    /// The least-worn cache starts as the first data blocks.
    pub(crate) fn wear_level_list_init(&mut self) -> Result<()> {
        let header = self.header;
        let entry = WearLevelEntry {
            wear_level_cntr: 0,
            wear_level_bits: ERASED_VALUE,
        };
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            self.write_wear_level(ba, &header, &entry)?;
        }

        let mut least = self.header.least_weared_blocks;
        let mut slot = 0;
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            if slot == LEAST_WEARED_BLOCK_NUM {
                break;
            }
            if header.is_block_type(ba, BlockType::Data) {
                least[slot] = WearCacheEntry {
                    block_address: ba,
                    wear_level_cntr: 0,
                };
                slot += 1;
            }
        }
        self.header.least_weared_blocks = least;
        Ok(())
    }

    fn read_wear_entry(&mut self, block: u16, header: &Header) -> Result<WearLevelEntry> {
        let (page, offset) = wear_entry_location(header, block)?;
        let mut entry = WearLevelEntry::default();
        self.cache.read(&mut self.flash, page, offset, entry.as_mut_raw())?;
        Ok(entry)
    }

    pub(crate) fn write_wear_level(
        &mut self,
        block: u16,
        header: &Header,
        entry: &WearLevelEntry,
    ) -> Result<()> {
        let (page, offset) = wear_entry_location(header, block)?;
        self.cache.write(&mut self.flash, page, offset, entry.as_raw())
    }

    /// Total erases of a block: the stored counter plus the latched bits.
    pub(crate) fn get_wear_level(&mut self, block: u16, header: &Header) -> Result<WearCntr> {
        let entry = self.read_wear_entry(block, header)?;
        let cntr = entry.wear_level_cntr;
        Ok(cntr + entry.wear_level_bits.count_zeros())
    }

    /// Record one erase by programming the lowest still-erased latch bit.
    pub(crate) fn inc_wear_level(&mut self, block: u16, header: &Header) -> Result<()> {
        let mut entry = self.read_wear_entry(block, header)?;
        let bits = entry.wear_level_bits;
        let mut programmed = false;
        for i in 0..8 {
            if bits & (1 << i) != 0 {
                entry.wear_level_bits = bits ^ (1 << i);
                programmed = true;
                break;
            }
        }
        if !programmed {
            // The latch is saturated; only a merge can fold it.
            return Err(Error::NoMoreSpace);
        }
        self.write_wear_level(block, header, &entry)
    }

    /// Erase a block and account for it in the given header's wear list.
    pub(crate) fn erase_block(&mut self, block: u16, header: &Header) -> Result<()> {
        debug!("erasing block {}", block);
        self.cache.erase(&mut self.flash, block)?;
        self.inc_wear_level(block, header)
    }

    /// Rewrite the wear list into the new management area, folding each
    /// block's latch into its counter and resetting the latch.
    pub(crate) fn copy_wear_level_list(
        &mut self,
        old_header: &Header,
        new_header: &Header,
    ) -> Result<()> {
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            let folded = self.get_wear_level(ba, old_header)?;
            let entry = WearLevelEntry {
                wear_level_cntr: folded,
                wear_level_bits: ERASED_VALUE,
            };
            self.write_wear_level(ba, new_header, &entry)?;
        }
        Ok(())
    }

    /// Regenerate the header's least/most worn caches and counter maximum
    /// by a full scan of its wear level list.
    pub(crate) fn generate_wear_caches(&mut self, header: &mut Header) -> Result<()> {
        let mut blocks: heapless::Vec<(WearCntr, u16), { BLOCK_NUM_ALL as usize }> =
            heapless::Vec::new();
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            if header.is_block_type(ba, BlockType::Data) {
                let cntr = self.get_wear_level(ba, header)?;
                let _ = blocks.push((cntr, ba));
            }
        }
        blocks.sort_unstable();

        let mut least = [WearCacheEntry {
            block_address: 0xffff,
            wear_level_cntr: WearCntr::MAX,
        }; LEAST_WEARED_BLOCK_NUM];
        for (slot, &(cntr, ba)) in blocks.iter().take(LEAST_WEARED_BLOCK_NUM).enumerate() {
            least[slot] = WearCacheEntry {
                block_address: ba,
                wear_level_cntr: cntr,
            };
        }
        let mut most = [WearCacheEntry {
            block_address: 0xffff,
            wear_level_cntr: WearCntr::MAX,
        }; MOST_WEARED_BLOCK_NUM];
        for (slot, &(cntr, ba)) in blocks.iter().rev().take(MOST_WEARED_BLOCK_NUM).enumerate() {
            most[slot] = WearCacheEntry {
                block_address: ba,
                wear_level_cntr: cntr,
            };
        }
        header.least_weared_blocks = least;
        header.most_weared_blocks = most;
        header.wear_level_cntr_max = blocks.iter().map(|&(c, _)| c).max().unwrap_or(0);
        Ok(())
    }

    /// Erase count of a block under the authoritative header.
    pub fn wear_level(&mut self, block: u16) -> Result<WearCntr> {
        self.require_init()?;
        let header = self.header;
        self.get_wear_level(block, &header)
    }

    /// True if any data page of the named file lies in the given block.
    fn file_uses_block(&mut self, name: &str, block: u16) -> Result<bool> {
        let (entry, _) = self.find_entry(name)?;
        let mut walker = FileWalker::new(entry.first_map_address);
        while let Some(page) = walker.next(self)? {
            if let WalkPage::Data { resolved, .. } = page {
                if resolved.block == block {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Move every file with data in the block onto other blocks by copying
    /// to a temporary name and renaming back.  The block's pages become
    /// garbage that the next merge erases.
    fn empty_block(&mut self, block: u16) -> Result<bool> {
        let mut emptied = false;
        let list = self.header.root_entry_list_address;
        let mut index = 0;
        while index < ENTRY_NUM_MAX {
            let entry = self.read_entry_slot(list, index)?;
            index += 1;
            if entry.is_slot_free() {
                break;
            }
            if entry.is_deleted() || entry.attrib & ATTRIB_DIR != 0 {
                continue;
            }
            let name = entry.name_str();
            if !self.file_uses_block(name.as_str(), block)? {
                continue;
            }
            let tmp = self.tmpnam()?;
            info!("moving '{}' off block {} via '{}'", name, block, tmp);
            self.copy(name.as_str(), tmp.as_str())?;
            self.rename(tmp.as_str(), name.as_str())?;
            emptied = true;
        }
        Ok(emptied)
    }

    /// Relocate files off cold blocks so their erase counters can catch
    /// up.  Processes at most `max_blocks` blocks from the least-worn
    /// cache, round robin across calls.
    pub fn static_wear_leveling(&mut self, max_blocks: usize) -> Result<()> {
        self.require_init()?;
        if self.is_merging {
            return Err(Error::General);
        }
        if self.is_wear_leveling {
            return Ok(());
        }
        self.is_wear_leveling = true;
        let result = self.static_wear_leveling_inner(max_blocks);
        self.is_wear_leveling = false;
        result
    }

    fn static_wear_leveling_inner(&mut self, max_blocks: usize) -> Result<()> {
        debug!(
            "static wear leveling, counter max {}",
            { self.header.wear_level_cntr_max }
        );
        let mut remaining = max_blocks;
        for _ in 0..LEAST_WEARED_BLOCK_NUM {
            if remaining == 0 {
                break;
            }
            let least = self.header.least_weared_blocks;
            let slot = least[self.last_static_wear_block_idx];
            self.last_static_wear_block_idx =
                (self.last_static_wear_block_idx + 1) % LEAST_WEARED_BLOCK_NUM;

            let ba = slot.block_address;
            if ba == 0xffff || !self.header.is_block_type(ba, BlockType::Data) {
                continue;
            }
            let cached_cntr = slot.wear_level_cntr;
            let diff = self.header.wear_level_cntr_max.saturating_sub(cached_cntr);
            let (free_pages, _) = self.get_pages_of_block(ba)?;
            if free_pages == 0 && diff >= STATIC_WEAR_LEVEL_LIMIT {
                info!("emptying cold block {} (behind by {})", ba, diff);
                if self.empty_block(ba)? {
                    remaining -= 1;
                } else {
                    warn!("cold block {} was not emptied", ba);
                }
            }
        }
        Ok(())
    }

    /// Countdown hook; runs a static wear leveling round every
    /// [`AUTO_STATIC_WEAR_PERIOD`] invocations.
    pub fn auto_static_wear_leveling(&mut self) -> Result<()> {
        if self.is_merging || self.is_wear_leveling {
            return Ok(());
        }
        if self.auto_static_wear_cntr == 0 {
            self.auto_static_wear_cntr = AUTO_STATIC_WEAR_PERIOD;
            self.static_wear_leveling(STATIC_WEAR_LEVEL_BLOCKS)
        } else {
            self.auto_static_wear_cntr -= 1;
            Ok(())
        }
    }
}

