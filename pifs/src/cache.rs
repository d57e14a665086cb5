//! Page cache.
//!
//! One logical-page write-back buffer in front of the flash driver.  All
//! metadata and data traffic goes through it, so sequential bit-marking
//! (free-space bitmap, wear latches) coalesces into whole-page programs.

use storage::Flash;

use crate::addr::Address;
use crate::config::{FLASH_PAGE_PER_LOGICAL_PAGE, FLASH_PAGE_SIZE, LOGICAL_PAGE_SIZE};
use crate::{Error, Result};

pub(crate) struct PageCache {
    buf: [u8; LOGICAL_PAGE_SIZE],
    address: Option<Address>,
    dirty: bool,
}

impl PageCache {
    pub(crate) fn new() -> PageCache {
        PageCache {
            buf: [0; LOGICAL_PAGE_SIZE],
            address: None,
            dirty: false,
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.address = None;
        self.dirty = false;
    }

    /// Write the cached page back if it is dirty.
    pub(crate) fn flush<F: Flash>(&mut self, flash: &mut F) -> Result<()> {
        if self.dirty {
            let addr = self.address.ok_or(Error::General)?;
            for i in 0..FLASH_PAGE_PER_LOGICAL_PAGE {
                let fp = addr.page as usize * FLASH_PAGE_PER_LOGICAL_PAGE + i;
                flash
                    .write(
                        addr.block as u32,
                        fp as u32,
                        0,
                        &self.buf[i * FLASH_PAGE_SIZE..(i + 1) * FLASH_PAGE_SIZE],
                    )
                    .map_err(|_| Error::FlashWrite)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn fetch<F: Flash>(&mut self, flash: &mut F, addr: Address) -> Result<()> {
        for i in 0..FLASH_PAGE_PER_LOGICAL_PAGE {
            let fp = addr.page as usize * FLASH_PAGE_PER_LOGICAL_PAGE + i;
            flash
                .read(
                    addr.block as u32,
                    fp as u32,
                    0,
                    &mut self.buf[i * FLASH_PAGE_SIZE..(i + 1) * FLASH_PAGE_SIZE],
                )
                .map_err(|_| Error::FlashRead)?;
        }
        self.address = Some(addr);
        Ok(())
    }

    /// Cached read of part of one logical page.
    pub(crate) fn read<F: Flash>(
        &mut self,
        flash: &mut F,
        addr: Address,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        debug_assert!(offset + buf.len() <= LOGICAL_PAGE_SIZE);
        if self.address != Some(addr) {
            self.flush(flash)?;
            self.fetch(flash, addr)?;
        }
        buf.copy_from_slice(&self.buf[offset..offset + buf.len()]);
        Ok(())
    }

    /// Cached write of part of one logical page.
    pub(crate) fn write<F: Flash>(
        &mut self,
        flash: &mut F,
        addr: Address,
        offset: usize,
        buf: &[u8],
    ) -> Result<()> {
        debug_assert!(offset + buf.len() <= LOGICAL_PAGE_SIZE);
        if self.address != Some(addr) {
            self.flush(flash)?;
            if offset != 0 || buf.len() != LOGICAL_PAGE_SIZE {
                // Partial write; the rest of the page must be preserved.
                self.fetch(flash, addr)?;
            } else {
                self.address = Some(addr);
            }
        }
        self.buf[offset..offset + buf.len()].copy_from_slice(buf);
        self.dirty = true;
        Ok(())
    }

    /// Erase a block.  A cached page inside it is forgotten, not flushed.
    pub(crate) fn erase<F: Flash>(&mut self, flash: &mut F, block: u16) -> Result<()> {
        flash.erase(block as u32).map_err(|_| Error::FlashErase)?;
        if let Some(addr) = self.address {
            if addr.block == block {
                self.invalidate();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflash::SimFlash;

    fn flash() -> SimFlash {
        SimFlash::new(4, 16, 256).unwrap()
    }

    #[test]
    fn write_read_hit() {
        let mut flash = flash();
        let mut cache = PageCache::new();
        let addr = Address::new(1, 2);
        cache.write(&mut flash, addr, 3, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 3];
        cache.read(&mut flash, addr, 3, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        // Nothing was flushed yet.
        assert_eq!(flash.page(1, 2)[3], 0xff);
    }

    #[test]
    fn miss_flushes_dirty_page() {
        let mut flash = flash();
        let mut cache = PageCache::new();
        cache.write(&mut flash, Address::new(1, 2), 0, &[7; 4]).unwrap();
        // Touching another page forces the dirty one out.
        let mut buf = [0u8; 1];
        cache.read(&mut flash, Address::new(0, 0), 0, &mut buf).unwrap();
        assert_eq!(&flash.page(1, 2)[..4], &[7; 4]);
    }

    #[test]
    fn erase_invalidates_cached_block() {
        let mut flash = flash();
        let mut cache = PageCache::new();
        let addr = Address::new(2, 5);
        cache.write(&mut flash, addr, 0, &[0xaa]).unwrap();
        cache.erase(&mut flash, 2).unwrap();

        let mut buf = [0u8; 1];
        cache.read(&mut flash, addr, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0xff);
    }
}
