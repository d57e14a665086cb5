//! Entry list.
//!
//! An array of directory entries in the management area.  Slots are
//! append-only: the first byte of the name distinguishes a never-used slot
//! (erased), a deleted entry (programmed sentinel) and a live name.
//! Renames and size updates are therefore delete-and-append, never an
//! in-place rewrite; the merge engine compacts the deleted slots away.

use log::trace;
use storage::Flash;

use crate::addr::Address;
use crate::config::*;
use crate::onflash::{AsMutRaw, AsRaw};
use crate::{Error, Pifs, Result};

pub const ATTRIB_ARCHIVE: u8 = 0x01;
pub const ATTRIB_READ_ONLY: u8 = 0x02;
pub const ATTRIB_HIDDEN: u8 = 0x04;
pub const ATTRIB_SYSTEM: u8 = 0x08;
pub const ATTRIB_DIR: u8 = 0x10;

/// Application-defined blob stored with every entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct UserData {
    pub ctime: u32,
    pub cdate: u32,
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct Entry {
    pub name: [u8; FILENAME_LEN_MAX],
    pub attrib: u8,
    pub file_size: u32,
    pub first_map_address: Address,
    pub user_data: UserData,
}

impl AsRaw for Entry {}
unsafe impl AsMutRaw for Entry {}

const _: () = assert!(core::mem::size_of::<Entry>() == ENTRY_SIZE_BYTE);

impl Entry {
    pub(crate) const ERASED: Entry = Entry {
        name: [ERASED_VALUE; FILENAME_LEN_MAX],
        attrib: ERASED_VALUE,
        file_size: 0xffff_ffff,
        first_map_address: Address::ERASED,
        user_data: UserData {
            ctime: 0xffff_ffff,
            cdate: 0xffff_ffff,
        },
    };

    /// Fresh entry for a new file.
    pub(crate) fn new_file(name: &str, first_map_address: Address) -> Entry {
        let mut entry = Entry::ERASED;
        entry.set_name(name);
        entry.attrib = ATTRIB_ARCHIVE;
        entry.file_size = 0;
        entry.first_map_address = first_map_address;
        entry.user_data = UserData::default();
        entry
    }

    /// Slot was never programmed; the list may end here.
    pub(crate) fn is_slot_free(&self) -> bool {
        self.name[0] == ERASED_VALUE
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.name[0] == PROGRAMMED_VALUE
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = [PROGRAMMED_VALUE; FILENAME_LEN_MAX];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }

    pub(crate) fn name_matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        if bytes.len() > FILENAME_LEN_MAX {
            return false;
        }
        let mut field = [PROGRAMMED_VALUE; FILENAME_LEN_MAX];
        field[..bytes.len()].copy_from_slice(bytes);
        self.name == field
    }

    pub(crate) fn name_str(&self) -> heapless::String<FILENAME_LEN_MAX> {
        let mut out = heapless::String::new();
        for &b in self.name.iter() {
            if b == PROGRAMMED_VALUE || b == ERASED_VALUE {
                break;
            }
            let _ = out.push(b as char);
        }
        out
    }
}

/// A file name must fit the fixed field and stay clear of the two sentinel
/// byte values.
pub(crate) fn check_filename(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > FILENAME_LEN_MAX {
        return Err(Error::General);
    }
    if bytes
        .iter()
        .any(|&b| b == ERASED_VALUE || b == PROGRAMMED_VALUE || b == b'/')
    {
        return Err(Error::General);
    }
    Ok(())
}

/// Flash position of an entry slot.
fn slot_location(list: Address, index: usize) -> Result<(Address, usize)> {
    let page = list.plus_pages(index / ENTRY_PER_PAGE)?;
    Ok((page, (index % ENTRY_PER_PAGE) * ENTRY_SIZE_BYTE))
}

impl<F: Flash> Pifs<F> {
    pub(crate) fn read_entry_slot(&mut self, list: Address, index: usize) -> Result<Entry> {
        let (page, offset) = slot_location(list, index)?;
        let mut entry = Entry::ERASED;
        self.cache.read(&mut self.flash, page, offset, entry.as_mut_raw())?;
        Ok(entry)
    }

    /// Find a live entry by name.  Returns the entry and its slot index.
    pub(crate) fn find_entry(&mut self, name: &str) -> Result<(Entry, usize)> {
        let list = self.header.root_entry_list_address;
        for index in 0..ENTRY_NUM_MAX {
            let entry = self.read_entry_slot(list, index)?;
            if entry.is_slot_free() {
                break;
            }
            if !entry.is_deleted() && entry.name_matches(name) {
                return Ok((entry, index));
            }
        }
        Err(Error::FileNotFound)
    }

    /// Append an entry into the first never-used slot of a list.
    pub(crate) fn append_entry_at(&mut self, list: Address, entry: &Entry) -> Result<()> {
        for index in 0..ENTRY_NUM_MAX {
            let slot = self.read_entry_slot(list, index)?;
            if slot.is_slot_free() {
                let (page, offset) = slot_location(list, index)?;
                self.cache.write(&mut self.flash, page, offset, entry.as_raw())?;
                trace!("entry '{}' appended at slot {}", entry.name_str(), index);
                return Ok(());
            }
        }
        Err(Error::NoMoreEntry)
    }

    pub(crate) fn append_entry(&mut self, entry: &Entry) -> Result<()> {
        let list = self.header.root_entry_list_address;
        self.append_entry_at(list, entry)
    }

    /// Logically delete a live entry: program the name sentinel and all
    /// attribute bits in place.
    pub(crate) fn delete_entry(&mut self, name: &str) -> Result<Entry> {
        let (entry, index) = self.find_entry(name)?;
        let list = self.header.root_entry_list_address;
        let (page, offset) = slot_location(list, index)?;
        let mark = [PROGRAMMED_VALUE];
        self.cache.write(&mut self.flash, page, offset, &mark)?;
        self.cache
            .write(&mut self.flash, page, offset + FILENAME_LEN_MAX, &mark)?;
        trace!("entry '{}' deleted at slot {}", name, index);
        Ok(entry)
    }

    /// Replace a live entry: delete the old slot, append the new contents.
    /// The caller handles `NoMoreEntry` by merging, which compacts the
    /// deleted slots away.
    pub(crate) fn update_entry(&mut self, name: &str, entry: &Entry) -> Result<()> {
        self.delete_entry(name)?;
        self.append_entry(entry)
    }

    /// Count never-used and deleted slots.
    pub fn count_entries(&mut self) -> Result<(usize, usize)> {
        let list = self.header.root_entry_list_address;
        let mut free = 0;
        let mut deleted = 0;
        for index in 0..ENTRY_NUM_MAX {
            let entry = self.read_entry_slot(list, index)?;
            if entry.is_slot_free() {
                free = ENTRY_NUM_MAX - index;
                break;
            }
            if entry.is_deleted() {
                deleted += 1;
            }
        }
        Ok((free, deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_states() {
        let mut e = Entry::ERASED;
        assert!(e.is_slot_free());
        assert!(!e.is_deleted());

        e.set_name("data.log");
        assert!(!e.is_slot_free());
        assert!(e.name_matches("data.log"));
        assert!(!e.name_matches("data.lo"));
        assert_eq!(e.name_str().as_str(), "data.log");

        e.name[0] = PROGRAMMED_VALUE;
        assert!(e.is_deleted());
    }

    #[test]
    fn filename_rules() {
        assert!(check_filename("a").is_ok());
        assert!(check_filename(&"x".repeat(FILENAME_LEN_MAX)).is_ok());
        assert!(check_filename("").is_err());
        assert!(check_filename(&"x".repeat(FILENAME_LEN_MAX + 1)).is_err());
        assert!(check_filename("a/b").is_err());
    }
}
