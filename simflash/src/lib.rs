//! Simulated flash
//!
//! The NOR-type flashes used with small filesystems share one defining
//! property: programming a byte can only clear bits (erased 0xFF toward
//! 0x00), and the only way to set bits back is to erase an entire block.
//! This simulator models exactly that, so code that would corrupt a real
//! part by re-programming a page shows up as wrong data in tests instead
//! of silently working against a forgiving `Vec<u8>`.
//!
//! Besides the bit semantics the simulator keeps the statistics a
//! wear-leveling filesystem cares about: how many times each block has been
//! erased, and how much read/write/erase traffic the code under test
//! generated.  The `styles` module carries geometry presets for the serial
//! NOR parts the filesystem is configured for, and `gen` produces
//! deterministic test data.

pub mod gen;
pub mod styles;

use anyhow::bail;
use storage::{check_erase, check_page, Error, Flash, ReadFlash};

/// Byte value of erased flash cells.
pub const ERASED: u8 = 0xff;

/// Traffic counters, updated on every operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub reads: usize,
    pub read_bytes: usize,
    pub writes: usize,
    pub write_bytes: usize,
    pub erases: usize,
    /// Writes that tried to set a cleared bit back to 1.  The data is ANDed
    /// in regardless, as a real NOR part would behave, but the count lets a
    /// test assert the filesystem never relied on it.
    pub reprogram_conflicts: usize,
}

/// An in-memory NOR flash device.
pub struct SimFlash {
    block_count: usize,
    pages_per_block: usize,
    page_size: usize,
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    stats: Stats,
}

impl SimFlash {
    /// Build a device of the given geometry, fully erased.
    pub fn new(block_count: usize, pages_per_block: usize, page_size: usize) -> anyhow::Result<SimFlash> {
        if block_count == 0 || pages_per_block == 0 || page_size == 0 {
            bail!("degenerate flash geometry");
        }
        if !page_size.is_power_of_two() {
            bail!("page size {} is not a power of two", page_size);
        }
        let total = block_count * pages_per_block * page_size;
        Ok(SimFlash {
            block_count,
            pages_per_block,
            page_size,
            data: vec![ERASED; total],
            erase_counts: vec![0; block_count],
            stats: Stats::default(),
        })
    }

    fn byte_offset(&self, block: u32, page: u32, offset: usize) -> usize {
        (block as usize * self.pages_per_block + page as usize) * self.page_size + offset
    }

    /// How many times the given block has been erased.
    pub fn erase_count(&self, block: usize) -> u32 {
        self.erase_counts[block]
    }

    /// Erase counters for all blocks.
    pub fn erase_counts(&self) -> &[u32] {
        &self.erase_counts
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Raw view of one page, for test assertions.
    pub fn page(&self, block: u32, page: u32) -> &[u8] {
        let start = self.byte_offset(block, page, 0);
        &self.data[start..start + self.page_size]
    }
}

impl ReadFlash for SimFlash {
    fn block_count(&self) -> usize {
        self.block_count
    }

    fn pages_per_block(&self) -> usize {
        self.pages_per_block
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&mut self, block: u32, page: u32, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        check_page(self, block, page, offset, bytes.len())?;
        let start = self.byte_offset(block, page, offset);
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        self.stats.reads += 1;
        self.stats.read_bytes += bytes.len();
        Ok(())
    }
}

impl Flash for SimFlash {
    fn erased_value(&self) -> u8 {
        ERASED
    }

    fn write(&mut self, block: u32, page: u32, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        check_page(self, block, page, offset, bytes.len())?;
        let start = self.byte_offset(block, page, offset);
        for (cell, b) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            if *b & !*cell != 0 {
                self.stats.reprogram_conflicts += 1;
            }
            // Programming clears bits; it never sets them.
            *cell &= *b;
        }
        self.stats.writes += 1;
        self.stats.write_bytes += bytes.len();
        Ok(())
    }

    fn erase(&mut self, block: u32) -> storage::Result<()> {
        check_erase(self, block)?;
        let start = self.byte_offset(block, 0, 0);
        let len = self.pages_per_block * self.page_size;
        self.data[start..start + len].fill(ERASED);
        self.erase_counts[block as usize] = self.erase_counts[block as usize]
            .checked_add(1)
            .ok_or(Error::Io)?;
        self.stats.erases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_only_clears_bits() {
        let mut flash = SimFlash::new(2, 4, 64).unwrap();
        flash.write(0, 0, 0, &[0xf0]).unwrap();
        flash.write(0, 0, 0, &[0x0f]).unwrap();

        let mut byte = [0u8; 1];
        flash.read(0, 0, 0, &mut byte).unwrap();
        assert_eq!(byte[0], 0x00);
        assert!(flash.stats().reprogram_conflicts > 0);
    }

    #[test]
    fn rewriting_same_value_is_clean() {
        let mut flash = SimFlash::new(2, 4, 64).unwrap();
        flash.write(0, 1, 0, &[0x5a, 0xa5]).unwrap();
        flash.write(0, 1, 0, &[0x5a, 0xa5]).unwrap();
        assert_eq!(flash.stats().reprogram_conflicts, 0);
    }

    #[test]
    fn erase_restores_and_counts() {
        let mut flash = SimFlash::new(2, 4, 64).unwrap();
        flash.write(1, 3, 10, &[0x00; 8]).unwrap();
        flash.erase(1).unwrap();

        let mut buf = [0u8; 8];
        flash.read(1, 3, 10, &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 8]);
        assert_eq!(flash.erase_count(1), 1);
        assert_eq!(flash.erase_count(0), 0);
    }

    #[test]
    fn bounds_are_enforced() {
        let mut flash = SimFlash::new(2, 4, 64).unwrap();
        assert_eq!(flash.write(2, 0, 0, &[0]), Err(Error::OutOfBounds));
        assert_eq!(flash.write(0, 4, 0, &[0]), Err(Error::OutOfBounds));
        assert_eq!(flash.write(0, 0, 64, &[0]), Err(Error::OutOfBounds));
        let mut buf = [0u8; 65];
        assert_eq!(flash.read(0, 0, 0, &mut buf), Err(Error::OutOfBounds));
    }
}
