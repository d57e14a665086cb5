//! Map pages.
//!
//! Each file is described by a chain of map pages.  A map page carries a
//! header (previous address, next address, checksum) followed by extent
//! records `(address, page_count)`; the file's bytes are the concatenation
//! of all extents in chain order.  Extent slots are programmed once; a
//! growing file appends new slots and, when a page fills, chains a fresh
//! map page by programming the old page's `next` field together with its
//! checksum.  A tail page therefore has an erased checksum; once `next` is
//! programmed the checksum covers both addresses and a mismatch is fatal
//! for the file.

use storage::Flash;

use crate::addr::Address;
use crate::alloc::WearPolicy;
use crate::config::*;
use crate::header::BlockType;
use crate::onflash::{calc_checksum, AsMutRaw, AsRaw, Checksum, CHECKSUM_ERASED};
use crate::{Error, Pifs, Result};

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct MapHeader {
    pub prev: Address,
    pub next: Address,
    pub checksum: Checksum,
}

impl AsRaw for MapHeader {}
unsafe impl AsMutRaw for MapHeader {}

const _: () = assert!(core::mem::size_of::<MapHeader>() == MAP_HEADER_SIZE_BYTE);

impl MapHeader {
    pub(crate) fn calc_checksum(&self) -> Checksum {
        calc_checksum(&self.as_raw()[..8])
    }

    /// A tail page (erased checksum) must not point anywhere; a chained
    /// page must match its checksum.
    pub(crate) fn validate(&self) -> Result<()> {
        let checksum = self.checksum;
        let next = self.next;
        if checksum == CHECKSUM_ERASED {
            if next.is_erased() {
                Ok(())
            } else {
                Err(Error::Integrity)
            }
        } else if checksum == self.calc_checksum() {
            Ok(())
        } else {
            Err(Error::Integrity)
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct MapEntry {
    pub address: Address,
    pub page_count: u8,
}

impl AsRaw for MapEntry {}
unsafe impl AsMutRaw for MapEntry {}

const _: () = assert!(core::mem::size_of::<MapEntry>() == MAP_ENTRY_SIZE_BYTE);

impl MapEntry {
    pub(crate) const ERASED: MapEntry = MapEntry {
        address: Address::ERASED,
        page_count: ERASED_VALUE,
    };

    pub(crate) fn is_slot_free(&self) -> bool {
        self.page_count == ERASED_VALUE
    }
}

fn entry_offset(index: usize) -> usize {
    MAP_HEADER_SIZE_BYTE + index * MAP_ENTRY_SIZE_BYTE
}

impl<F: Flash> Pifs<F> {
    pub(crate) fn read_map_header(&mut self, map: Address) -> Result<MapHeader> {
        let mut header = MapHeader::default();
        self.cache.read(&mut self.flash, map, 0, header.as_mut_raw())?;
        header.validate()?;
        Ok(header)
    }

    pub(crate) fn read_map_entry(&mut self, map: Address, index: usize) -> Result<MapEntry> {
        let mut entry = MapEntry::ERASED;
        self.cache
            .read(&mut self.flash, map, entry_offset(index), entry.as_mut_raw())?;
        Ok(entry)
    }

    pub(crate) fn write_map_entry(
        &mut self,
        map: Address,
        index: usize,
        entry: &MapEntry,
    ) -> Result<()> {
        self.cache
            .write(&mut self.flash, map, entry_offset(index), entry.as_raw())
    }

    /// Allocate a fresh map page in the management area.  Only `prev`
    /// needs programming: an erased header is already a valid tail.
    pub(crate) fn create_map_page(&mut self, prev: Address) -> Result<Address> {
        let (addr, _) = self.alloc_pages(1, 1, BlockType::PrimaryManagement, WearPolicy::Any)?;
        if !prev.is_erased() {
            let header = MapHeader {
                prev,
                next: Address::ERASED,
                checksum: CHECKSUM_ERASED,
            };
            self.cache.write(&mut self.flash, addr, 0, header.as_raw())?;
        }
        Ok(addr)
    }

    /// Chain `from` to `to` by programming `next` and sealing the header
    /// checksum in the same write.
    pub(crate) fn chain_map_page(&mut self, from: Address, to: Address) -> Result<()> {
        let mut header = self.read_map_header(from)?;
        if !header.next.is_erased() {
            return Err(Error::Integrity);
        }
        header.next = to;
        header.checksum = header.calc_checksum();
        self.cache.write(&mut self.flash, from, 0, header.as_raw())
    }
}

/// One page yielded by a file walk.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WalkPage {
    /// A map page of the chain.
    Map(Address),
    /// A data page, before and after delta redirection.
    Data { orig: Address, resolved: Address },
}

/// Iterates every map and data page of a file, in file order, resolving
/// each data page through the delta map.  Carries no borrow of the
/// filesystem so the caller can act on each page as it comes.
pub(crate) struct FileWalker {
    map: Address,
    entry_idx: usize,
    page_in_extent: usize,
    entered: bool,
}

impl FileWalker {
    pub(crate) fn new(first_map: Address) -> FileWalker {
        FileWalker {
            map: first_map,
            entry_idx: 0,
            page_in_extent: 0,
            entered: false,
        }
    }

    pub(crate) fn next<F: Flash>(&mut self, fs: &mut Pifs<F>) -> Result<Option<WalkPage>> {
        loop {
            if self.map.is_erased() {
                return Ok(None);
            }
            if !self.entered {
                self.entered = true;
                self.entry_idx = 0;
                self.page_in_extent = 0;
                return Ok(Some(WalkPage::Map(self.map)));
            }
            if self.entry_idx >= MAP_ENTRY_PER_PAGE {
                let header = fs.read_map_header(self.map)?;
                self.map = header.next;
                self.entered = false;
                continue;
            }
            let entry = fs.read_map_entry(self.map, self.entry_idx)?;
            if entry.is_slot_free() {
                let header = fs.read_map_header(self.map)?;
                self.map = header.next;
                self.entered = false;
                continue;
            }
            if self.page_in_extent < entry.page_count as usize {
                let base = entry.address;
                let orig = base.plus_pages(self.page_in_extent)?;
                self.page_in_extent += 1;
                let resolved = fs.find_delta_page(orig)?;
                return Ok(Some(WalkPage::Data { orig, resolved }));
            }
            self.entry_idx += 1;
            self.page_in_extent = 0;
        }
    }
}
