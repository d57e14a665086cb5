//! Delta map.
//!
//! NOR flash cannot rewrite a programmed page in place, so "rewriting"
//! redirects: the new contents go to a fresh page and an entry
//! `(original, delta, checksum)` is appended to the delta map.  Lookups
//! return the most recent entry for an address; an address with no entry
//! resolves to itself.  The map lives in a fixed number of management
//! pages; when the last slot fills, the caller merges, which collapses all
//! redirections into the rebuilt file maps and empties the map.
//!
//! Lookups are hot (every data page access goes through one), so the map
//! pages are mirrored in RAM, rebuilt lazily after init and after merge.

use log::trace;
use storage::Flash;

use crate::addr::Address;
use crate::alloc::WearPolicy;
use crate::config::*;
use crate::header::BlockType;
use crate::onflash::{calc_checksum, is_buffer_erased, AsMutRaw, AsRaw, Checksum};
use crate::{Error, Pifs, Result};

const DELTA_BUF_SIZE: usize = DELTA_MAP_PAGE_NUM * LOGICAL_PAGE_SIZE;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
struct DeltaEntry {
    orig: Address,
    delta: Address,
    checksum: Checksum,
}

impl AsRaw for DeltaEntry {}
unsafe impl AsMutRaw for DeltaEntry {}

impl DeltaEntry {
    fn calc_checksum(&self) -> Checksum {
        calc_checksum(&self.as_raw()[..8])
    }

    fn is_valid(&self) -> bool {
        let checksum = self.checksum;
        checksum == self.calc_checksum()
    }
}

/// In-RAM mirror of the delta map pages.
pub(crate) struct DeltaCache {
    buf: [u8; DELTA_BUF_SIZE],
    is_read: bool,
}

impl DeltaCache {
    pub(crate) fn new() -> DeltaCache {
        DeltaCache {
            buf: [ERASED_VALUE; DELTA_BUF_SIZE],
            is_read: false,
        }
    }

    fn slot(&self, index: usize) -> &[u8] {
        let offset = Self::slot_offset(index);
        &self.buf[offset..offset + DELTA_ENTRY_SIZE_BYTE]
    }

    fn slot_offset(index: usize) -> usize {
        (index / DELTA_ENTRY_PER_PAGE) * LOGICAL_PAGE_SIZE
            + (index % DELTA_ENTRY_PER_PAGE) * DELTA_ENTRY_SIZE_BYTE
    }
}

impl<F: Flash> Pifs<F> {
    pub(crate) fn delta_invalidate(&mut self) {
        self.delta.is_read = false;
    }

    fn delta_load(&mut self) -> Result<()> {
        if self.delta.is_read {
            return Ok(());
        }
        let base = self.header.delta_map_address;
        for page in 0..DELTA_MAP_PAGE_NUM {
            let addr = base.plus_pages(page)?;
            let mut tmp = [0u8; LOGICAL_PAGE_SIZE];
            self.cache.read(&mut self.flash, addr, 0, &mut tmp)?;
            let offset = page * LOGICAL_PAGE_SIZE;
            self.delta.buf[offset..offset + LOGICAL_PAGE_SIZE].copy_from_slice(&tmp);
        }
        self.delta.is_read = true;
        Ok(())
    }

    fn delta_entry(&self, index: usize) -> DeltaEntry {
        let mut entry = DeltaEntry::default();
        entry.as_mut_raw().copy_from_slice(self.delta.slot(index));
        entry
    }

    /// Resolve an address through the delta map; the most recent matching
    /// entry wins, no entry means the address maps to itself.
    pub(crate) fn find_delta_page(&mut self, addr: Address) -> Result<Address> {
        self.delta_load()?;
        let mut resolved = addr;
        for index in 0..DELTA_ENTRY_NUM {
            if is_buffer_erased(self.delta.slot(index)) {
                // Entries are appended in order; the first erased slot ends
                // the list.
                break;
            }
            let entry = self.delta_entry(index);
            if !entry.is_valid() {
                continue;
            }
            let orig = entry.orig;
            if orig == addr {
                resolved = entry.delta;
            }
        }
        Ok(resolved)
    }

    fn find_free_delta_slot(&mut self) -> Result<usize> {
        self.delta_load()?;
        for index in 0..DELTA_ENTRY_NUM {
            if is_buffer_erased(self.delta.slot(index)) {
                return Ok(index);
            }
        }
        Err(Error::NoMoreDeltaEntry)
    }

    /// Number of programmed delta entries.
    pub fn delta_entry_count(&mut self) -> Result<usize> {
        Ok(self.find_free_delta_slot().unwrap_or(DELTA_ENTRY_NUM))
    }

    fn append_delta_entry(&mut self, orig: Address, delta: Address) -> Result<()> {
        let index = self.find_free_delta_slot()?;
        let mut entry = DeltaEntry {
            orig,
            delta,
            checksum: 0,
        };
        entry.checksum = entry.calc_checksum();

        let page = self
            .header
            .delta_map_address
            .plus_pages(index / DELTA_ENTRY_PER_PAGE)?;
        let offset = (index % DELTA_ENTRY_PER_PAGE) * DELTA_ENTRY_SIZE_BYTE;
        self.cache.write(&mut self.flash, page, offset, entry.as_raw())?;

        let buf_offset = DeltaCache::slot_offset(index);
        self.delta.buf[buf_offset..buf_offset + DELTA_ENTRY_SIZE_BYTE]
            .copy_from_slice(entry.as_raw());
        Ok(())
    }

    /// Read through the delta map.
    pub(crate) fn read_delta(
        &mut self,
        addr: Address,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let resolved = self.find_delta_page(addr)?;
        self.cache.read(&mut self.flash, resolved, offset, buf)
    }

    /// Rewrite part of a page by redirecting it to a fresh one.
    ///
    /// Fails with `NoMoreDeltaEntry` when the map is full and with
    /// `NoMoreSpace` when no fresh page exists; the caller reacts to both
    /// by merging and retrying.
    pub(crate) fn write_delta(&mut self, addr: Address, offset: usize, data: &[u8]) -> Result<()> {
        // Reserve the map slot before allocating the page so a full map
        // does not leak a freshly marked page.
        let _ = self.find_free_delta_slot()?;
        let current = self.find_delta_page(addr)?;
        let (fresh, _) = self.find_free_page_wl(1, 1, BlockType::Data, WearPolicy::LeastWeared)?;
        self.mark_page(fresh, 1, true, false)?;
        trace!("delta {} -> {} (was {})", addr, fresh, current);

        let mut page_buf = [ERASED_VALUE; LOGICAL_PAGE_SIZE];
        if !(offset == 0 && data.len() == LOGICAL_PAGE_SIZE) {
            self.cache.read(&mut self.flash, current, 0, &mut page_buf)?;
        }
        page_buf[offset..offset + data.len()].copy_from_slice(data);
        self.cache.write(&mut self.flash, fresh, 0, &page_buf)?;

        self.append_delta_entry(addr, fresh)?;
        // Whichever page held the previous contents is garbage now.
        self.mark_page(current, 1, false, true)?;
        Ok(())
    }
}
