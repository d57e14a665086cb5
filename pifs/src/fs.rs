//! Filesystem context and lifecycle.
//!
//! All state lives in one [`Pifs`] value threaded through every operation:
//! the authoritative header, the single page cache, the delta map mirror
//! and the open file and directory tables.  Nothing is global.

use log::{info, warn};
use storage::Flash;

use crate::addr::Address;
use crate::cache::PageCache;
use crate::config::*;
use crate::delta::DeltaCache;
use crate::dir::DirHandle;
use crate::entry::Entry;
use crate::file::FileHandle;
use crate::header::Header;
use crate::map::{FileWalker, WalkPage};
use crate::{Error, Result};

/// Handle slots: the public table plus two internal handles used by copy,
/// check and static wear leveling.
pub(crate) const FILE_SLOTS: usize = OPEN_FILE_NUM_MAX + 2;
pub(crate) const INTERNAL_SRC: usize = OPEN_FILE_NUM_MAX;
pub(crate) const INTERNAL_DST: usize = OPEN_FILE_NUM_MAX + 1;

/// Aggregate page counts returned by the space scans.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub management_bytes: usize,
    pub data_bytes: usize,
    pub management_pages: usize,
    pub data_pages: usize,
}

/// The filesystem.  Generic over the flash collaborator; tests plug in the
/// simulator.
pub struct Pifs<F: Flash> {
    pub(crate) flash: F,
    pub(crate) initialized: bool,
    pub(crate) header: Header,
    pub(crate) header_address: Address,
    pub(crate) is_merging: bool,
    pub(crate) is_wear_leveling: bool,
    pub(crate) cache: PageCache,
    pub(crate) delta: DeltaCache,
    pub(crate) files: [FileHandle; FILE_SLOTS],
    pub(crate) dirs: [DirHandle; OPEN_DIR_NUM_MAX],
    pub(crate) last_static_wear_block_idx: usize,
    pub(crate) auto_static_wear_cntr: u32,
    pub(crate) error_cntr: usize,
    pub(crate) tmpname_cntr: u32,
}

impl<F: Flash> Pifs<F> {
    pub fn new(flash: F) -> Pifs<F> {
        Pifs {
            flash,
            initialized: false,
            header: Header::erased(),
            header_address: Address::ERASED,
            is_merging: false,
            is_wear_leveling: false,
            cache: PageCache::new(),
            delta: DeltaCache::new(),
            files: [FileHandle::FREE; FILE_SLOTS],
            dirs: [DirHandle::FREE; OPEN_DIR_NUM_MAX],
            last_static_wear_block_idx: 0,
            auto_static_wear_cntr: AUTO_STATIC_WEAR_PERIOD,
            error_cntr: 0,
            tmpname_cntr: 0,
        }
    }

    /// The flash device, for inspection.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub(crate) fn require_init(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::General)
        }
    }

    fn reset_state(&mut self) {
        self.cache.invalidate();
        self.delta_invalidate();
        self.files = [FileHandle::FREE; FILE_SLOTS];
        self.dirs = [DirHandle::FREE; OPEN_DIR_NUM_MAX];
        self.is_merging = false;
        self.is_wear_leveling = false;
        self.error_cntr = 0;
        self.last_static_wear_block_idx = 0;
    }

    /// Bring the filesystem up: find the authoritative header, finish an
    /// interrupted merge, or create a fresh filesystem when the device
    /// carries none.
    pub fn init(&mut self) -> Result<()> {
        self.flash.init().map_err(|_| Error::FlashInit)?;
        self.reset_state();
        self.initialized = false;

        let mut best: Option<Header> = None;
        let mut stale: heapless::Vec<u16, 8> = heapless::Vec::new();
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            let candidate = self.read_header_at(ba)?;
            if !candidate.is_valid() {
                continue;
            }
            if !candidate.config_matches() {
                warn!("header at block {} has foreign configuration", ba);
                return Err(Error::Configuration);
            }
            match best {
                None => best = Some(candidate),
                Some(prev) => {
                    // Two valid headers: a merge was interrupted after its
                    // new header was sealed but before the old area was
                    // erased.  The larger counter wins.
                    let (winner, loser) = if candidate.counter > prev.counter {
                        (candidate, prev)
                    } else {
                        (prev, candidate)
                    };
                    warn!(
                        "stale management area at block {} (counter {} < {})",
                        { loser.management_block_address },
                        { loser.counter },
                        { winner.counter }
                    );
                    let _ = stale.push(loser.management_block_address);
                    best = Some(winner);
                }
            }
        }

        match best {
            Some(header) => {
                self.header = header;
                self.header_address = Address::new(header.management_block_address, 0);
                for base in stale {
                    for i in 0..MANAGEMENT_BLOCK_NUM {
                        let current = self.header;
                        self.erase_block(base + i, &current)?;
                    }
                }
            }
            None => {
                warn!("no file system header found, creating");
                self.format_internal()?;
            }
        }

        self.initialized = true;
        info!(
            "mounted, counter {}, management block {}",
            { self.header.counter },
            { self.header.management_block_address }
        );
        Ok(())
    }

    /// Shut the filesystem down: flush the cache and release the driver.
    pub fn delete(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::General);
        }
        self.cache.flush(&mut self.flash)?;
        self.flash.close().map_err(|_| Error::General)?;
        self.initialized = false;
        Ok(())
    }

    /// Erase the device and create an empty filesystem.
    pub fn format(&mut self) -> Result<()> {
        self.format_internal()?;
        self.initialized = true;
        Ok(())
    }

    fn format_internal(&mut self) -> Result<()> {
        for ba in BLOCK_RESERVED_NUM..BLOCK_NUM_ALL {
            // Driver-level erase: formatting does not count as wear, the
            // wear level list is rewritten from zero below.
            self.flash.erase(ba as u32).map_err(|_| Error::FlashErase)?;
        }
        self.reset_state();
        let header = Header::layout(
            BLOCK_RESERVED_NUM,
            BLOCK_RESERVED_NUM + MANAGEMENT_BLOCK_NUM,
            0,
        )
        .map(|mut h| {
            h.seal();
            h
        })?;
        self.header_write(&header, true)?;
        Ok(())
    }

    /// Merge counter of the authoritative header.
    pub fn header_counter(&self) -> u32 {
        self.header.counter
    }

    /// Verify filesystem consistency and reclaim lost pages.
    ///
    /// Walks every live file checking each page against the free-space
    /// bitmap, then sweeps for pages the bitmap calls used that no file or
    /// management structure references; those are marked to-be-released so
    /// the next merge reclaims them.
    pub fn check(&mut self) -> Result<()> {
        self.require_init()?;
        self.flush_all_write_extents()?;
        self.error_cntr = 0;

        // One bit per page; erased means "not referenced by anything".
        let mut referenced = [ERASED_VALUE; FREE_PAGE_BUF_SIZE];

        let list = self.header.root_entry_list_address;
        for index in 0..ENTRY_NUM_MAX {
            let entry = self.read_entry_slot(list, index)?;
            if entry.is_slot_free() {
                break;
            }
            if entry.is_deleted() {
                continue;
            }
            self.check_file(&entry, &mut referenced)?;
        }

        // Management structures are referenced by the header.
        let header = self.header;
        let fixed = [
            (self.header_address, HEADER_SIZE_PAGE),
            (header.root_entry_list_address, ENTRY_LIST_SIZE_PAGE),
            (header.free_space_bitmap_address, FREE_SPACE_BITMAP_SIZE_PAGE),
            (header.delta_map_address, DELTA_MAP_PAGE_NUM),
            (header.wear_level_list_address, WEAR_LEVEL_LIST_SIZE_PAGE),
        ];
        for (addr, pages) in fixed {
            for i in 0..pages {
                mark_referenced(&mut referenced, addr.plus_pages(i)?);
            }
        }

        // Anything the bitmap calls live that nothing references is lost;
        // reclaim it.
        for index in 0..LOGICAL_PAGE_NUM_FS {
            let addr = Address::from_fs_page_index(index);
            let unreferenced = referenced[index / 8] & (1 << (index % 8)) != 0;
            if !unreferenced {
                continue;
            }
            if !self.is_page_free(addr)? && !self.is_page_to_be_released(addr)? {
                warn!("lost page {} marked to be released", addr);
                self.mark_page(addr, 1, false, true)?;
            }
        }

        if self.error_cntr > 0 {
            warn!("{} integrity error(s) found", self.error_cntr);
            return Err(Error::Integrity);
        }
        Ok(())
    }

    fn check_file(
        &mut self,
        entry: &Entry,
        referenced: &mut [u8; FREE_PAGE_BUF_SIZE],
    ) -> Result<()> {
        let mut walker = FileWalker::new(entry.first_map_address);
        while let Some(page) = walker.next(self)? {
            match page {
                WalkPage::Map(addr) => {
                    if self.is_page_free(addr)? || self.is_page_to_be_released(addr)? {
                        warn!("file '{}': map page {} in bad bitmap state", entry.name_str(), addr);
                        self.error_cntr += 1;
                    }
                    if mark_referenced(referenced, addr) {
                        self.error_cntr += 1;
                    }
                }
                WalkPage::Data { orig, resolved } => {
                    if orig != resolved {
                        // Redirected: the original must be garbage, the
                        // delta page live.
                        if self.is_page_free(orig)? || !self.is_page_to_be_released(orig)? {
                            warn!("file '{}': stale page {} in bad state", entry.name_str(), orig);
                            self.error_cntr += 1;
                        }
                        mark_referenced(referenced, orig);
                        if self.is_page_free(resolved)? || self.is_page_to_be_released(resolved)? {
                            warn!(
                                "file '{}': delta page {} in bad state",
                                entry.name_str(),
                                resolved
                            );
                            self.error_cntr += 1;
                        }
                        if mark_referenced(referenced, resolved) {
                            self.error_cntr += 1;
                        }
                    } else {
                        if self.is_page_free(orig)? || self.is_page_to_be_released(orig)? {
                            warn!("file '{}': data page {} in bad state", entry.name_str(), orig);
                            self.error_cntr += 1;
                        }
                        if mark_referenced(referenced, orig) {
                            self.error_cntr += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Clear the page's bit in the reference bitmap.  Returns true if it was
/// already referenced, meaning two structures claim the same page.
fn mark_referenced(buf: &mut [u8; FREE_PAGE_BUF_SIZE], addr: Address) -> bool {
    let index = addr.fs_page_index();
    let mask = 1u8 << (index % 8);
    let seen = buf[index / 8] & mask == 0;
    buf[index / 8] &= !mask;
    seen
}
