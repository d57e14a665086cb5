//! Flash styles
//!
//! Geometry presets for the serial NOR parts the filesystem is typically
//! deployed on.  Each preset builds a fully erased simulated device.

use crate::SimFlash;

/// The geometry of a single flash device.
pub struct DeviceLayout {
    pub block_count: usize,
    pub pages_per_block: usize,
    pub page_size: usize,
}

impl DeviceLayout {
    pub fn build(&self) -> anyhow::Result<SimFlash> {
        SimFlash::new(self.block_count, self.pages_per_block, self.page_size)
    }

    pub fn capacity(&self) -> usize {
        self.block_count * self.pages_per_block * self.page_size
    }
}

/// M25P40: 512 KiB in 8 sectors of 256 pages.
pub static M25P40: DeviceLayout = DeviceLayout {
    block_count: 8,
    pages_per_block: 256,
    page_size: 256,
};

/// M25P80: 1 MiB in 16 sectors of 256 pages.  This is the geometry the
/// filesystem's compile-time configuration targets.
pub static M25P80: DeviceLayout = DeviceLayout {
    block_count: 16,
    pages_per_block: 256,
    page_size: 256,
};

/// N25Q128A: 16 MiB in 4096 small subsectors of 16 pages.  Stresses the
/// opposite extreme: many tiny erase units.
pub static N25Q128A: DeviceLayout = DeviceLayout {
    block_count: 4096,
    pages_per_block: 16,
    page_size: 256,
};

/// All of the device presets.
pub static ALL_DEVICES: [&DeviceLayout; 3] = [&M25P40, &M25P80, &N25Q128A];

/// An iterator that builds each preset device on each iteration.
pub fn all_devices() -> impl Iterator<Item = anyhow::Result<SimFlash>> {
    ALL_DEVICES.iter().map(|layout| layout.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::ReadFlash;

    #[test]
    fn presets_build() {
        for dev in all_devices() {
            let dev = dev.unwrap();
            assert!(dev.capacity() > 0);
        }
        assert_eq!(M25P80.capacity(), 1024 * 1024);
    }
}
