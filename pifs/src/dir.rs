//! Directory listing.
//!
//! This build carries a single-level namespace: every file lives in the
//! root entry list, and a directory handle is a position in that list.
//! `opendir` accepts the spellings that name the root.

use storage::Flash;

use crate::addr::Address;
use crate::config::*;
use crate::entry::UserData;
use crate::{Error, Pifs, Result};

/// Opaque handle returned by [`Pifs::opendir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirId(pub(crate) usize);

/// One entry yielded by [`Pifs::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: heapless::String<FILENAME_LEN_MAX>,
    pub file_size: u32,
    pub attrib: u8,
    pub first_map_address: Address,
    pub user_data: UserData,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DirHandle {
    pub(crate) is_used: bool,
    entry_index: usize,
}

impl DirHandle {
    pub(crate) const FREE: DirHandle = DirHandle {
        is_used: false,
        entry_index: 0,
    };
}

impl<F: Flash> Pifs<F> {
    /// Open the root directory for listing.  The first free handle slot
    /// is used.
    pub fn opendir(&mut self, path: &str) -> Result<DirId> {
        self.require_init()?;
        match path {
            "/" | "." | "" => {}
            other => {
                return if self.find_entry(other).is_ok() {
                    Err(Error::IsNotDirectory)
                } else {
                    Err(Error::FileNotFound)
                };
            }
        }
        let slot = (0..OPEN_DIR_NUM_MAX)
            .find(|&i| !self.dirs[i].is_used)
            .ok_or(Error::NoMoreResource)?;
        self.dirs[slot] = DirHandle {
            is_used: true,
            entry_index: 0,
        };
        Ok(DirId(slot))
    }

    /// Next live entry, or `None` when the listing is exhausted.
    pub fn readdir(&mut self, id: DirId) -> Result<Option<DirEntry>> {
        self.require_init()?;
        if id.0 >= OPEN_DIR_NUM_MAX || !self.dirs[id.0].is_used {
            return Err(Error::General);
        }
        let list = self.header.root_entry_list_address;
        loop {
            let index = self.dirs[id.0].entry_index;
            if index >= ENTRY_NUM_MAX {
                return Ok(None);
            }
            let entry = self.read_entry_slot(list, index)?;
            if entry.is_slot_free() {
                return Ok(None);
            }
            self.dirs[id.0].entry_index = index + 1;
            if entry.is_deleted() {
                continue;
            }
            let file_size = entry.file_size;
            let attrib = entry.attrib;
            let first_map_address = entry.first_map_address;
            let user_data = entry.user_data;
            return Ok(Some(DirEntry {
                name: entry.name_str(),
                file_size,
                attrib,
                first_map_address,
                user_data,
            }));
        }
    }

    pub fn closedir(&mut self, id: DirId) -> Result<()> {
        if id.0 >= OPEN_DIR_NUM_MAX || !self.dirs[id.0].is_used {
            return Err(Error::General);
        }
        self.dirs[id.0] = DirHandle::FREE;
        Ok(())
    }
}
