//! Merge engine.
//!
//! Append-only structures eventually fill: the delta map runs out of
//! entries, the entry list fills with deleted slots, the management area
//! runs out of map pages, garbage pages accumulate.  The merge rebuilds
//! everything in the pre-allocated secondary management area: live entries
//! are copied (compacting deletions away), every file's map chain is
//! rewritten with delta redirections collapsed into direct extents, the
//! free-space bitmap is regenerated, the wear list is folded, and data
//! blocks holding nothing but garbage are erased.  The new header is
//! written only after all of that, so a crash at any earlier point leaves
//! the old area authoritative; a crash between sealing the new header and
//! erasing the old area is detected at init by the two-valid-headers rule.

use log::{debug, info};
use storage::Flash;

use crate::addr::Address;
use crate::config::*;
use crate::fs::FILE_SLOTS;
use crate::header::{BlockType, Header};
use crate::map::{FileWalker, MapEntry, MapHeader, WalkPage};
use crate::onflash::{AsRaw, CHECKSUM_ERASED};
use crate::{Error, Pifs, Result};

/// Builds a file's new map chain in the target area, one page at a time.
/// Completed pages are written exactly once, with their `next` pointer and
/// checksum already final; only the tail is written with an open header.
struct MapBuilder {
    first: Address,
    map_addr: Address,
    prev: Address,
    buf: [u8; LOGICAL_PAGE_SIZE],
    slot: usize,
}

impl MapBuilder {
    fn new(first: Address) -> MapBuilder {
        MapBuilder {
            first,
            map_addr: first,
            prev: Address::ERASED,
            buf: [ERASED_VALUE; LOGICAL_PAGE_SIZE],
            slot: 0,
        }
    }

    fn push_entry<F: Flash>(
        &mut self,
        fs: &mut Pifs<F>,
        new_header: &Header,
        bump: &mut Address,
        start: Address,
        count: usize,
    ) -> Result<()> {
        if self.slot == MAP_ENTRY_PER_PAGE {
            // Page full: the next page's address is known before this one
            // is written, so the header goes out sealed.
            let next = take_map_page(fs, new_header, bump)?;
            let mut header = MapHeader {
                prev: self.prev,
                next,
                checksum: 0,
            };
            header.checksum = header.calc_checksum();
            self.buf[..MAP_HEADER_SIZE_BYTE].copy_from_slice(header.as_raw());
            fs.cache.write(&mut fs.flash, self.map_addr, 0, &self.buf)?;

            self.prev = self.map_addr;
            self.map_addr = next;
            self.buf = [ERASED_VALUE; LOGICAL_PAGE_SIZE];
            self.slot = 0;
        }
        let entry = MapEntry {
            address: start,
            page_count: count as u8,
        };
        let offset = MAP_HEADER_SIZE_BYTE + self.slot * MAP_ENTRY_SIZE_BYTE;
        self.buf[offset..offset + MAP_ENTRY_SIZE_BYTE].copy_from_slice(entry.as_raw());
        self.slot += 1;
        Ok(())
    }

    /// Write the tail page.  Its `next` and checksum stay erased so the
    /// chain can keep growing later.
    fn finish<F: Flash>(self, fs: &mut Pifs<F>) -> Result<Address> {
        let header = MapHeader {
            prev: self.prev,
            next: Address::ERASED,
            checksum: CHECKSUM_ERASED,
        };
        let mut buf = self.buf;
        buf[..MAP_HEADER_SIZE_BYTE].copy_from_slice(header.as_raw());
        fs.cache.write(&mut fs.flash, self.map_addr, 0, &buf)?;
        Ok(self.first)
    }
}

/// Claim the next management page of the target area for a map page.
fn take_map_page<F: Flash>(
    fs: &mut Pifs<F>,
    new_header: &Header,
    bump: &mut Address,
) -> Result<Address> {
    let addr = *bump;
    if addr.block >= new_header.management_block_address + MANAGEMENT_BLOCK_NUM {
        return Err(Error::NoMoreSpace);
    }
    fs.mark_page_in(new_header, addr, 1, true, false)?;
    bump.add_pages(1)?;
    Ok(addr)
}

impl<F: Flash> Pifs<F> {
    /// Swap the management area: rebuild all metadata in the secondary
    /// blocks, seal the new header, then erase the old area.
    pub(crate) fn merge(&mut self) -> Result<()> {
        self.require_init()?;
        if self.is_merging {
            return Err(Error::General);
        }
        info!("merge started");
        self.is_merging = true;
        let target = self.header.next_management_block_address;
        let result = self.merge_inner();
        if result.is_err() && self.header.next_management_block_address == target {
            // The half-built target must go back to the erased state the
            // next merge attempt expects.
            for i in 0..MANAGEMENT_BLOCK_NUM {
                let current = self.header;
                let _ = self.erase_block(target + i, &current);
            }
        }
        self.is_merging = false;
        if result.is_ok() {
            info!("merge done, counter {}", self.header_counter());
        }
        result
    }

    fn merge_inner(&mut self) -> Result<()> {
        self.flush_all_write_extents()?;
        self.cache.flush(&mut self.flash)?;

        let old = self.header;
        let target = old.next_management_block_address;
        // The area being vacated becomes the next merge's target.
        let mut new = Header::layout(
            target,
            old.management_block_address,
            old.counter.wrapping_add(1),
        )?;

        // The wear list is copied first so the erases below are latched in
        // the new list.
        self.copy_wear_level_list(&old, &new)?;

        // The new area's fixed structures mark themselves used before
        // anything else is placed.
        let new_entry_list = new.root_entry_list_address;
        self.mark_page_in(&new, Address::new(target, 0), HEADER_SIZE_PAGE, true, false)?;
        self.mark_page_in(&new, new_entry_list, ENTRY_LIST_SIZE_PAGE, true, false)?;
        self.mark_page_in(
            &new,
            new.free_space_bitmap_address,
            FREE_SPACE_BITMAP_SIZE_PAGE,
            true,
            false,
        )?;
        self.mark_page_in(&new, new.delta_map_address, DELTA_MAP_PAGE_NUM, true, false)?;
        self.mark_page_in(
            &new,
            new.wear_level_list_address,
            WEAR_LEVEL_LIST_SIZE_PAGE,
            true,
            false,
        )?;

        // Copy live entries, rebuilding each file's map chain with delta
        // redirections collapsed.
        let mut bump = new.management_free_start()?;
        let old_list = old.root_entry_list_address;
        for index in 0..ENTRY_NUM_MAX {
            let entry = self.read_entry_slot(old_list, index)?;
            if entry.is_slot_free() {
                break;
            }
            if entry.is_deleted() {
                continue;
            }
            debug!("merging file '{}'", entry.name_str());
            let first_map = self.rebuild_file_map(&new, entry.first_map_address, &mut bump)?;
            let mut copied = entry;
            copied.first_map_address = first_map;
            self.append_entry_at(new_entry_list, &copied)?;
        }

        self.reclaim_data_blocks(&old, &new)?;

        // Worn-block caches reflect the state after reclamation erases.
        self.generate_wear_caches(&mut new)?;

        // Seal and write the new header; until this completes the old
        // header stays authoritative.
        new.seal();
        self.cache
            .write(&mut self.flash, Address::new(target, 0), 0, new.as_raw())?;
        self.cache.flush(&mut self.flash)?;

        self.header = new;
        self.header_address = Address::new(target, 0);
        self.delta_invalidate();

        // Erase the old management area; its wear is latched in the new
        // list.
        for i in 0..MANAGEMENT_BLOCK_NUM {
            let current = self.header;
            self.erase_block(old.management_block_address + i, &current)?;
        }
        self.cache.flush(&mut self.flash)?;

        self.rebind_handles()?;
        Ok(())
    }

    /// Rewrite one file's map chain into the target area.  Extents point
    /// at the delta-resolved page locations, coalesced where consecutive.
    fn rebuild_file_map(
        &mut self,
        new_header: &Header,
        old_first_map: Address,
        bump: &mut Address,
    ) -> Result<Address> {
        let first = take_map_page(self, new_header, bump)?;
        let mut builder = MapBuilder::new(first);
        let mut open: Option<(Address, usize)> = None;

        let mut walker = FileWalker::new(old_first_map);
        while let Some(page) = walker.next(self)? {
            let resolved = match page {
                WalkPage::Map(_) => continue,
                WalkPage::Data { resolved, .. } => resolved,
            };
            // Every live data page stays in place and is carried into the
            // new bitmap.
            self.mark_page_in(new_header, resolved, 1, true, false)?;
            open = match open {
                Some((start, count))
                    if count < MAP_ENTRY_PAGE_COUNT_MAX
                        && start.plus_pages(count).map(|a| a == resolved).unwrap_or(false)
                        && start.block == resolved.block =>
                {
                    Some((start, count + 1))
                }
                Some((start, count)) => {
                    builder.push_entry(self, new_header, bump, start, count)?;
                    Some((resolved, 1))
                }
                None => Some((resolved, 1)),
            };
        }
        if let Some((start, count)) = open {
            builder.push_entry(self, new_header, bump, start, count)?;
        }
        builder.finish(self)
    }

    /// Erase data blocks that hold nothing live anymore; carry remaining
    /// garbage pages over as to-be-released in the new bitmap.
    fn reclaim_data_blocks(&mut self, old: &Header, new: &Header) -> Result<()> {
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            if !new.is_block_type(ba, BlockType::Data) || !old.is_block_type(ba, BlockType::Data) {
                continue;
            }
            let mut live = false;
            for pa in 0..LOGICAL_PAGE_PER_BLOCK as u16 {
                if !self.is_page_free_in(new, Address::new(ba, pa))? {
                    live = true;
                    break;
                }
            }
            if !live {
                let mut dirty = false;
                for pa in 0..LOGICAL_PAGE_PER_BLOCK as u16 {
                    if !self.is_page_free_in(old, Address::new(ba, pa))? {
                        dirty = true;
                        break;
                    }
                }
                if dirty {
                    debug!("reclaiming dead block {}", ba);
                    self.erase_block(ba, new)?;
                }
                continue;
            }
            for pa in 0..LOGICAL_PAGE_PER_BLOCK as u16 {
                let addr = Address::new(ba, pa);
                if self.is_page_free_in(new, addr)? && !self.is_page_free_in(old, addr)? {
                    // Garbage in a block that still holds live pages; it
                    // stays unusable until the whole block dies.
                    self.mark_page_in(new, addr, 1, true, true)?;
                }
            }
        }
        Ok(())
    }

    /// Every open handle's entry and map chain moved; re-resolve them
    /// against the rebuilt structures.
    fn rebind_handles(&mut self) -> Result<()> {
        for fi in 0..FILE_SLOTS {
            let mut fh = self.files[fi];
            if !fh.is_used {
                continue;
            }
            let name = fh.entry.name_str();
            let (entry, _) = self.find_entry(name.as_str())?;
            fh.entry.first_map_address = entry.first_map_address;
            fh.cur_valid = false;
            fh.tail_valid = false;
            self.files[fi] = fh;
        }
        Ok(())
    }
}
