//! File I/O engine.
//!
//! Open modes follow the C `fopen` strings.  Reads walk the map chain
//! through a per-handle cursor, resolving every page through the delta
//! map.  Writes are delta-first: overwriting programmed bytes redirects
//! the page, while appends program fresh pages allocated from the least
//! worn blocks.  Sequential appends accumulate into an open extent held
//! in the handle and are committed to the map page in one slot program,
//! so a growing file does not burn one extent record per page.
//!
//! Any operation that may trigger a merge synchronizes the handle copy
//! back into the table first, because the merge engine flushes and
//! re-binds every open handle.

use log::warn;
use storage::Flash;

use crate::addr::Address;
use crate::alloc::WearPolicy;
use crate::config::*;
use crate::entry::{check_filename, Entry};
use crate::fs::{FILE_SLOTS, INTERNAL_DST, INTERNAL_SRC};
use crate::header::BlockType;
use crate::map::{FileWalker, MapEntry, WalkPage};
use crate::{Error, Pifs, Result};

/// Opaque handle returned by [`Pifs::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub(crate) usize);

/// Target of a [`Pifs::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenFlags {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    must_exist: bool,
}

/// Parse a C-style mode string: `r`, `w`, `a`, with `+` upgrading to
/// read-write and `b` accepted as a no-op.
fn parse_open_mode(modes: &str) -> Result<OpenFlags> {
    let mut flags = OpenFlags {
        read: false,
        write: false,
        append: false,
        create: false,
        must_exist: false,
    };
    for c in modes.chars() {
        match c {
            'r' => {
                flags.read = true;
                flags.must_exist = true;
            }
            'w' => {
                flags.write = true;
                flags.create = true;
            }
            'a' => {
                flags.append = true;
            }
            '+' => {
                if flags.write {
                    flags.read = true;
                } else if flags.read {
                    flags.write = true;
                } else if flags.append {
                    flags.read = true;
                } else {
                    return Err(Error::InvalidOpenMode);
                }
            }
            'b' => {}
            _ => return Err(Error::InvalidOpenMode),
        }
    }
    if !flags.read && !flags.write && !flags.append {
        return Err(Error::InvalidOpenMode);
    }
    Ok(flags)
}

/// State of one open file.  Copied out of the handle table while an
/// operation runs and copied back when it finishes.
#[derive(Clone, Copy)]
pub(crate) struct FileHandle {
    pub(crate) is_used: bool,
    pub(crate) entry: Entry,
    mode_read: bool,
    mode_write: bool,
    mode_append: bool,
    /// First error other than `EndOfFile`; poisons the handle until close.
    status: Option<Error>,
    rw_pos: u32,
    size_changed: bool,
    // Read cursor: which file page it points at and where that page lives
    // in the map chain.
    pub(crate) cur_valid: bool,
    cur_page: u32,
    cur_map: Address,
    cur_entry_idx: usize,
    cur_page_in_extent: usize,
    // Where the next extent record goes.
    pub(crate) tail_valid: bool,
    tail_map: Address,
    tail_idx: usize,
    // Open extent: allocated and data-filled, but not yet in the map.
    wx_valid: bool,
    wx_addr: Address,
    wx_count: usize,
}

impl FileHandle {
    pub(crate) const FREE: FileHandle = FileHandle {
        is_used: false,
        entry: Entry::ERASED,
        mode_read: false,
        mode_write: false,
        mode_append: false,
        status: None,
        rw_pos: 0,
        size_changed: false,
        cur_valid: false,
        cur_page: 0,
        cur_map: Address::ERASED,
        cur_entry_idx: 0,
        cur_page_in_extent: 0,
        tail_valid: false,
        tail_map: Address::ERASED,
        tail_idx: 0,
        wx_valid: false,
        wx_addr: Address::ERASED,
        wx_count: 0,
    };

    fn writable(&self) -> bool {
        self.mode_write || self.mode_append
    }
}

impl<F: Flash> Pifs<F> {
    /// Run a filesystem operation that may merge, keeping the handle table
    /// in sync with the local handle copy across it.
    fn synced<T>(
        &mut self,
        fi: usize,
        fh: &mut FileHandle,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.files[fi] = *fh;
        let result = op(self);
        *fh = self.files[fi];
        result
    }

    /// Open a file.  Modes are the C `fopen` strings: `r`, `r+`, `w`,
    /// `w+`, `a`, `a+`, with `b` tolerated.
    pub fn open(&mut self, name: &str, modes: &str) -> Result<FileId> {
        self.require_init()?;
        check_filename(name)?;
        let flags = parse_open_mode(modes)?;
        for fh in self.files.iter() {
            if fh.is_used && fh.entry.name_matches(name) {
                // Two handles on one file would fight over size and map
                // tail state.
                return Err(Error::NoMoreResource);
            }
        }
        let slot = (0..OPEN_FILE_NUM_MAX)
            .find(|&i| !self.files[i].is_used)
            .ok_or(Error::NoMoreResource)?;
        self.open_into(slot, name, &flags)?;
        Ok(FileId(slot))
    }

    fn open_into(&mut self, slot: usize, name: &str, flags: &OpenFlags) -> Result<()> {
        let entry = match self.find_entry(name) {
            Ok((entry, _)) => {
                if flags.create {
                    // "w" on an existing file: drop the old contents.
                    self.release_file_pages(&entry)?;
                    self.delete_entry(name)?;
                    self.create_file_entry(name)?
                } else {
                    entry
                }
            }
            Err(Error::FileNotFound) if flags.create || flags.append => {
                self.create_file_entry(name)?
            }
            Err(e) => return Err(e),
        };
        let mut fh = FileHandle::FREE;
        fh.is_used = true;
        fh.entry = entry;
        fh.mode_read = flags.read;
        fh.mode_write = flags.write;
        fh.mode_append = flags.append;
        self.files[slot] = fh;
        Ok(())
    }

    /// Create a file: one fresh map page (an erased page is already a
    /// valid empty chain) plus an entry referencing it.
    fn create_file_entry(&mut self, name: &str) -> Result<Entry> {
        match self.try_create_entry(name) {
            Err(Error::NoMoreEntry) if !self.is_merging => {
                // The list is full of deleted slots; merging compacts it.
                // The map page allocated by the failed attempt is
                // unreferenced, so the merge reclaims it too.
                self.merge()?;
                self.try_create_entry(name)
            }
            other => other,
        }
    }

    fn try_create_entry(&mut self, name: &str) -> Result<Entry> {
        let map = self.create_map_page(Address::ERASED)?;
        let entry = Entry::new_file(name, map);
        self.append_entry(&entry)?;
        Ok(entry)
    }

    /// Mark every page of a file to-be-released: map pages, data pages and
    /// delta pages alike.
    pub(crate) fn release_file_pages(&mut self, entry: &Entry) -> Result<()> {
        let mut walker = FileWalker::new(entry.first_map_address);
        while let Some(page) = walker.next(self)? {
            match page {
                WalkPage::Map(addr) => self.mark_page(addr, 1, false, true)?,
                // A redirected original is already garbage; only the live
                // location needs marking.
                WalkPage::Data { resolved, .. } => self.mark_page(resolved, 1, false, true)?,
            }
        }
        Ok(())
    }

    // Cursor -------------------------------------------------------------

    fn cursor_rewind(fh: &mut FileHandle) {
        fh.cur_map = fh.entry.first_map_address;
        fh.cur_entry_idx = 0;
        fh.cur_page_in_extent = 0;
        fh.cur_page = 0;
        fh.cur_valid = true;
    }

    /// Address of the file page the cursor points at, walking forward over
    /// extent and map page boundaries as needed.
    fn cursor_data_addr(&mut self, fh: &mut FileHandle) -> Result<Address> {
        loop {
            if fh.cur_map.is_erased() {
                return Err(Error::EndOfFile);
            }
            if fh.cur_entry_idx >= MAP_ENTRY_PER_PAGE {
                let header = self.read_map_header(fh.cur_map)?;
                fh.cur_map = header.next;
                fh.cur_entry_idx = 0;
                fh.cur_page_in_extent = 0;
                continue;
            }
            let entry = self.read_map_entry(fh.cur_map, fh.cur_entry_idx)?;
            if entry.is_slot_free() {
                let header = self.read_map_header(fh.cur_map)?;
                fh.cur_map = header.next;
                fh.cur_entry_idx = 0;
                fh.cur_page_in_extent = 0;
                continue;
            }
            if fh.cur_page_in_extent < entry.page_count as usize {
                let base = entry.address;
                return base.plus_pages(fh.cur_page_in_extent);
            }
            fh.cur_entry_idx += 1;
            fh.cur_page_in_extent = 0;
        }
    }

    /// Move the cursor to the given file page index.
    fn cursor_seek(&mut self, fh: &mut FileHandle, page: u32) -> Result<()> {
        if !fh.cur_valid || page < fh.cur_page {
            Self::cursor_rewind(fh);
        }
        while fh.cur_page < page {
            let _ = self.cursor_data_addr(fh)?;
            fh.cur_page_in_extent += 1;
            fh.cur_page += 1;
        }
        Ok(())
    }

    // Map tail -----------------------------------------------------------

    /// Locate where the next extent record goes: the tail map page and its
    /// first free slot.
    fn ensure_tail(&mut self, fh: &mut FileHandle) -> Result<()> {
        if fh.tail_valid {
            return Ok(());
        }
        let mut map = fh.entry.first_map_address;
        loop {
            let header = self.read_map_header(map)?;
            let next = header.next;
            if next.is_erased() {
                break;
            }
            map = next;
        }
        let mut idx = 0;
        while idx < MAP_ENTRY_PER_PAGE {
            if self.read_map_entry(map, idx)?.is_slot_free() {
                break;
            }
            idx += 1;
        }
        fh.tail_map = map;
        fh.tail_idx = idx;
        fh.tail_valid = true;
        Ok(())
    }

    /// Commit the open extent into the map chain.
    fn flush_write_extent(&mut self, fi: usize, fh: &mut FileHandle) -> Result<()> {
        if !fh.wx_valid {
            return Ok(());
        }
        loop {
            self.ensure_tail(fh)?;
            if fh.tail_idx < MAP_ENTRY_PER_PAGE {
                break;
            }
            // Tail page is full: chain a fresh map page.
            let prev = fh.tail_map;
            let next = self.synced(fi, fh, |fs| fs.create_map_page(prev))?;
            if !fh.tail_valid {
                // A merge rebuilt the chain under us; the page we just
                // allocated is unreferenced and will be reclaimed.  Try
                // again against the fresh chain.
                continue;
            }
            self.chain_map_page(prev, next)?;
            fh.tail_map = next;
            fh.tail_idx = 0;
        }
        let record = MapEntry {
            address: fh.wx_addr,
            page_count: fh.wx_count as u8,
        };
        self.write_map_entry(fh.tail_map, fh.tail_idx, &record)?;
        fh.tail_idx += 1;
        fh.wx_valid = false;
        Ok(())
    }

    /// Flush the open extent of every handle.  The merge engine calls this
    /// before rebuilding so each map chain on flash is complete.
    pub(crate) fn flush_all_write_extents(&mut self) -> Result<()> {
        for fi in 0..FILE_SLOTS {
            let mut fh = self.files[fi];
            if fh.is_used && fh.wx_valid {
                self.flush_write_extent(fi, &mut fh)?;
                self.files[fi] = fh;
            }
        }
        Ok(())
    }

    /// Fold a fresh allocation into the open extent where contiguous,
    /// otherwise commit the old extent and open a new one.
    fn append_extent(
        &mut self,
        fi: usize,
        fh: &mut FileHandle,
        addr: Address,
        count: usize,
    ) -> Result<()> {
        if fh.wx_valid
            && fh.wx_addr.block == addr.block
            && fh.wx_addr.page as usize + fh.wx_count == addr.page as usize
            && fh.wx_count + count <= MAP_ENTRY_PAGE_COUNT_MAX
        {
            fh.wx_count += count;
            return Ok(());
        }
        self.flush_write_extent(fi, fh)?;
        fh.wx_addr = addr;
        fh.wx_count = count;
        fh.wx_valid = true;
        Ok(())
    }

    // Read ---------------------------------------------------------------

    /// Read up to `buf.len()` bytes from the current position.  Returns
    /// the number of bytes read; 0 at end of file.
    pub fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        self.require_init()?;
        let fi = self.public_slot(id)?;
        let mut fh = self.files[fi];
        let result = self.read_slot(fi, &mut fh, buf);
        if let Err(e) = result {
            if e != Error::EndOfFile {
                fh.status = Some(e);
            }
        }
        self.files[fi] = fh;
        result
    }

    fn read_slot(&mut self, fi: usize, fh: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if let Some(e) = fh.status {
            return Err(e);
        }
        if !fh.mode_read {
            return Err(Error::General);
        }
        // The cursor walks the on-flash map, so the open extent must be
        // committed first.
        self.flush_write_extent(fi, fh)?;

        let size = fh.entry.file_size;
        let mut done = 0;
        while done < buf.len() && fh.rw_pos < size {
            let page_idx = fh.rw_pos / LOGICAL_PAGE_SIZE as u32;
            let offset = (fh.rw_pos % LOGICAL_PAGE_SIZE as u32) as usize;
            self.cursor_seek(fh, page_idx)?;
            let addr = self.cursor_data_addr(fh)?;
            let chunk = (buf.len() - done)
                .min(LOGICAL_PAGE_SIZE - offset)
                .min((size - fh.rw_pos) as usize);
            self.read_delta(addr, offset, &mut buf[done..done + chunk])?;
            done += chunk;
            fh.rw_pos += chunk as u32;
        }
        Ok(done)
    }

    // Write --------------------------------------------------------------

    /// Write `buf` at the current position.  Returns the number of bytes
    /// written, which is shorter than `buf` only when space ran out; the
    /// error is then latched on the handle.
    pub fn write(&mut self, id: FileId, buf: &[u8]) -> Result<usize> {
        self.require_init()?;
        let fi = self.public_slot(id)?;
        let mut fh = self.files[fi];
        let result = self.write_slot(fi, &mut fh, buf);
        if let Err(e) = result {
            if e != Error::EndOfFile {
                fh.status = Some(e);
            }
        }
        self.files[fi] = fh;
        result
    }

    fn write_slot(&mut self, fi: usize, fh: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if let Some(e) = fh.status {
            return Err(e);
        }
        if !fh.writable() {
            return Err(Error::General);
        }
        if fh.mode_append {
            fh.rw_pos = fh.entry.file_size;
        }
        if fh.rw_pos > fh.entry.file_size {
            if !ENABLE_FSEEK_BEYOND_FILE {
                return Err(Error::EndOfFile);
            }
            self.fill_gap(fi, fh)?;
        }

        let mut done = 0;
        let mut merged = false;
        while done < buf.len() {
            match self.write_chunk(fi, fh, &buf[done..]) {
                Ok(n) => {
                    done += n;
                    merged = false;
                }
                Err(Error::NoMoreDeltaEntry) | Err(Error::NoMoreSpace)
                    if !merged && !self.is_merging =>
                {
                    // Delta map exhausted or no page for the redirection;
                    // a merge collapses the map and reclaims garbage, then
                    // the chunk is retried once from scratch.
                    merged = true;
                    self.synced(fi, fh, |fs| fs.merge())?;
                }
                Err(e) => {
                    if done > 0 {
                        fh.status = Some(e);
                        return Ok(done);
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    /// Write as much of `data` as fits the page under the current
    /// position.
    fn write_chunk(&mut self, fi: usize, fh: &mut FileHandle, data: &[u8]) -> Result<usize> {
        let size = fh.entry.file_size;
        let page_idx = fh.rw_pos / LOGICAL_PAGE_SIZE as u32;
        let offset = (fh.rw_pos % LOGICAL_PAGE_SIZE as u32) as usize;
        let file_pages = size.div_ceil(LOGICAL_PAGE_SIZE as u32);

        let written = if page_idx < file_pages {
            // The page already belongs to the file.
            self.flush_write_extent(fi, fh)?;
            self.cursor_seek(fh, page_idx)?;
            let addr = self.cursor_data_addr(fh)?;
            let page_filled = ((size - page_idx * LOGICAL_PAGE_SIZE as u32) as usize)
                .min(LOGICAL_PAGE_SIZE);
            let chunk = data.len().min(LOGICAL_PAGE_SIZE - offset);
            if offset >= page_filled {
                // Appending into the still-erased tail of the last page
                // programs directly, no delta needed.
                let resolved = self.find_delta_page(addr)?;
                self.cache
                    .write(&mut self.flash, resolved, offset, &data[..chunk])?;
            } else {
                self.write_delta(addr, offset, &data[..chunk])?;
            }
            chunk
        } else {
            // Fresh pages past the end of the file.
            let pages_needed = data
                .len()
                .div_ceil(LOGICAL_PAGE_SIZE)
                .min(MAP_ENTRY_PAGE_COUNT_MAX);
            let (addr, count) = self.synced(fi, fh, |fs| {
                fs.alloc_pages(1, pages_needed, BlockType::Data, WearPolicy::LeastWeared)
            })?;
            self.append_extent(fi, fh, addr, count)?;
            let mut written = 0;
            for i in 0..count {
                let chunk = (data.len() - written).min(LOGICAL_PAGE_SIZE);
                if chunk == 0 {
                    break;
                }
                let page = addr.plus_pages(i)?;
                self.cache
                    .write(&mut self.flash, page, 0, &data[written..written + chunk])?;
                written += chunk;
            }
            written
        };

        fh.rw_pos += written as u32;
        if fh.rw_pos > fh.entry.file_size {
            fh.entry.file_size = fh.rw_pos;
            fh.size_changed = true;
        }
        Ok(written)
    }

    /// Fill the span between the file size and the seek position with the
    /// configured fill byte, through the normal append path.
    fn fill_gap(&mut self, fi: usize, fh: &mut FileHandle) -> Result<()> {
        let target = fh.rw_pos;
        let fill = [FSEEK_FILL_VALUE; LOGICAL_PAGE_SIZE];
        while fh.entry.file_size < target {
            fh.rw_pos = fh.entry.file_size;
            let gap = (target - fh.entry.file_size) as usize;
            let written = self.write_chunk(fi, fh, &fill[..gap.min(LOGICAL_PAGE_SIZE)])?;
            if written == 0 {
                return Err(Error::General);
            }
        }
        fh.rw_pos = target;
        Ok(())
    }

    // Position -----------------------------------------------------------

    pub fn seek(&mut self, id: FileId, from: SeekFrom) -> Result<()> {
        self.require_init()?;
        let fi = self.public_slot(id)?;
        let mut fh = self.files[fi];
        let result = self.seek_slot(&mut fh, from);
        if let Err(e) = result {
            if e != Error::EndOfFile {
                fh.status = Some(e);
            }
        }
        self.files[fi] = fh;
        result
    }

    fn seek_slot(&mut self, fh: &mut FileHandle, from: SeekFrom) -> Result<()> {
        if let Some(e) = fh.status {
            return Err(e);
        }
        let size = fh.entry.file_size as i64;
        let target = match from {
            SeekFrom::Start(pos) => pos as i64,
            SeekFrom::Current(delta) => fh.rw_pos as i64 + delta as i64,
            SeekFrom::End(delta) => size + delta as i64,
        };
        if target < 0 {
            return Err(Error::General);
        }
        if target > size && !(ENABLE_FSEEK_BEYOND_FILE && fh.writable()) {
            return Err(Error::EndOfFile);
        }
        fh.rw_pos = target as u32;
        Ok(())
    }

    /// Current position, as `ftell`.
    pub fn tell(&self, id: FileId) -> Result<u32> {
        let fi = self.public_slot(id)?;
        Ok(self.files[fi].rw_pos)
    }

    /// True once the position reached the end of the file.
    pub fn eof(&self, id: FileId) -> Result<bool> {
        let fi = self.public_slot(id)?;
        let fh = &self.files[fi];
        let size = fh.entry.file_size;
        Ok(fh.rw_pos >= size)
    }

    /// Size of the open file in bytes.
    pub fn file_size(&self, id: FileId) -> Result<u32> {
        let fi = self.public_slot(id)?;
        let fh = &self.files[fi];
        let size = fh.entry.file_size;
        Ok(size)
    }

    /// Error latched on the handle, if any.
    pub fn last_error(&self, id: FileId) -> Option<Error> {
        self.public_slot(id).ok().and_then(|fi| self.files[fi].status)
    }

    // Flush / close ------------------------------------------------------

    /// Commit the open extent, record the current size in the entry and
    /// flush the page cache.
    pub fn flush(&mut self, id: FileId) -> Result<()> {
        self.require_init()?;
        let fi = self.public_slot(id)?;
        let mut fh = self.files[fi];
        let result = self.flush_slot(fi, &mut fh);
        self.files[fi] = fh;
        result
    }

    fn flush_slot(&mut self, fi: usize, fh: &mut FileHandle) -> Result<()> {
        self.flush_write_extent(fi, fh)?;
        if fh.size_changed {
            // Size updates are delete-and-append; make room before the
            // delete so a full list cannot lose the entry.
            let (free, _) = self.count_entries()?;
            if free == 0 {
                if self.is_merging {
                    return Err(Error::NoMoreEntry);
                }
                self.synced(fi, fh, |fs| fs.merge())?;
                let (free, _) = self.count_entries()?;
                if free == 0 {
                    return Err(Error::NoMoreEntry);
                }
            }
            let name = fh.entry.name_str();
            let entry = fh.entry;
            self.update_entry(name.as_str(), &entry)?;
            fh.size_changed = false;
        }
        self.cache.flush(&mut self.flash)
    }

    /// Close the handle: flush, free the slot, and give the periodic
    /// static wear leveling hook a tick.
    pub fn close(&mut self, id: FileId) -> Result<()> {
        self.require_init()?;
        let fi = self.public_slot(id)?;
        self.close_slot(fi)?;
        if let Err(e) = self.auto_static_wear_leveling() {
            warn!("automatic static wear leveling failed: {:?}", e);
        }
        Ok(())
    }

    fn close_slot(&mut self, fi: usize) -> Result<()> {
        let mut fh = self.files[fi];
        let result = self.flush_slot(fi, &mut fh);
        fh = FileHandle::FREE;
        self.files[fi] = fh;
        result
    }

    fn public_slot(&self, id: FileId) -> Result<usize> {
        if id.0 < OPEN_FILE_NUM_MAX && self.files[id.0].is_used {
            Ok(id.0)
        } else {
            Err(Error::General)
        }
    }

    // Whole-file operations ----------------------------------------------

    /// True if a live entry with the name exists.
    pub fn is_file_exist(&mut self, name: &str) -> bool {
        self.initialized && self.find_entry(name).is_ok()
    }

    /// Delete a file: release all of its pages and the entry.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.require_init()?;
        self.check_not_open(name)?;
        let (entry, _) = self.find_entry(name)?;
        self.release_file_pages(&entry)?;
        self.delete_entry(name)?;
        self.cache.flush(&mut self.flash)
    }

    /// Rename a file; an existing file of the new name is replaced.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        self.require_init()?;
        check_filename(new_name)?;
        self.check_not_open(old_name)?;
        if old_name == new_name {
            return self.find_entry(old_name).map(|_| ());
        }
        if self.find_entry(new_name).is_ok() {
            self.remove(new_name)?;
        }
        let (mut entry, _) = self.find_entry(old_name)?;
        let (free, _) = self.count_entries()?;
        if free == 0 {
            if self.is_merging {
                return Err(Error::NoMoreEntry);
            }
            self.merge()?;
        }
        self.delete_entry(old_name)?;
        entry.set_name(new_name);
        self.append_entry(&entry)?;
        self.cache.flush(&mut self.flash)
    }

    /// Copy a file through the internal handles, one page at a time.
    pub fn copy(&mut self, src: &str, dst: &str) -> Result<()> {
        self.require_init()?;
        self.internal_open(INTERNAL_SRC, src, "r")?;
        if let Err(e) = self.internal_open(INTERNAL_DST, dst, "w") {
            let _ = self.internal_close(INTERNAL_SRC);
            return Err(e);
        }
        let result = self.copy_loop();
        let close_dst = self.internal_close(INTERNAL_DST);
        let close_src = self.internal_close(INTERNAL_SRC);
        result.and(close_dst).and(close_src)
    }

    fn copy_loop(&mut self) -> Result<()> {
        let mut buf = [0u8; LOGICAL_PAGE_SIZE];
        loop {
            let mut src = self.files[INTERNAL_SRC];
            let n = self.read_slot(INTERNAL_SRC, &mut src, &mut buf)?;
            self.files[INTERNAL_SRC] = src;
            if n == 0 {
                return Ok(());
            }
            let mut dst = self.files[INTERNAL_DST];
            let written = self.write_slot(INTERNAL_DST, &mut dst, &buf[..n])?;
            self.files[INTERNAL_DST] = dst;
            if written < n {
                return Err(self.files[INTERNAL_DST].status.unwrap_or(Error::NoMoreSpace));
            }
        }
    }

    fn internal_open(&mut self, slot: usize, name: &str, modes: &str) -> Result<()> {
        if self.files[slot].is_used {
            return Err(Error::NoMoreResource);
        }
        check_filename(name)?;
        let flags = parse_open_mode(modes)?;
        self.open_into(slot, name, &flags)
    }

    fn internal_close(&mut self, slot: usize) -> Result<()> {
        if !self.files[slot].is_used {
            return Ok(());
        }
        self.close_slot(slot)
    }

    fn check_not_open(&self, name: &str) -> Result<()> {
        for fh in self.files.iter() {
            if fh.is_used && fh.entry.name_matches(name) {
                return Err(Error::General);
            }
        }
        Ok(())
    }

    /// Generate an unused temporary file name.
    pub(crate) fn tmpnam(&mut self) -> Result<heapless::String<FILENAME_LEN_MAX>> {
        use core::fmt::Write;
        loop {
            self.tmpname_cntr = self.tmpname_cntr.wrapping_add(1);
            let mut name = heapless::String::new();
            let _ = write!(name, ".tmp{:08x}", self.tmpname_cntr);
            match self.find_entry(name.as_str()) {
                Err(Error::FileNotFound) => return Ok(name),
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        let r = parse_open_mode("r").unwrap();
        assert!(r.read && !r.write && r.must_exist && !r.create);

        let rp = parse_open_mode("r+").unwrap();
        assert!(rp.read && rp.write && rp.must_exist);

        let w = parse_open_mode("w").unwrap();
        assert!(w.write && w.create && !w.read);

        let wp = parse_open_mode("w+b").unwrap();
        assert!(wp.write && wp.read && wp.create);

        let a = parse_open_mode("a").unwrap();
        assert!(a.append && !a.read);

        let ap = parse_open_mode("a+").unwrap();
        assert!(ap.append && ap.read);

        assert_eq!(parse_open_mode("x"), Err(Error::InvalidOpenMode));
        assert_eq!(parse_open_mode("+"), Err(Error::InvalidOpenMode));
        assert_eq!(parse_open_mode(""), Err(Error::InvalidOpenMode));
    }
}
