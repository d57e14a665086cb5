//! Allocator.
//!
//! Thin driver over the free-space bitmap search: place new data on the
//! least worn blocks, and when nothing fits, fall back to a merge of the
//! management area (which reclaims garbage) and retry once.

use log::debug;
use storage::Flash;

use crate::addr::Address;
use crate::header::BlockType;
use crate::{Error, Pifs, Result};

/// Placement preference for a new allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WearPolicy {
    /// Walk the header's least worn block cache first.
    LeastWeared,
    /// First fit in block order.
    Any,
}

impl<F: Flash> Pifs<F> {
    /// Allocate between `min_count` and `max_count` consecutive logical
    /// pages and mark them used.  Fails with `NoMoreSpace` only after a
    /// merge could not free enough room either.
    pub(crate) fn alloc_pages(
        &mut self,
        min_count: usize,
        max_count: usize,
        block_type: BlockType,
        policy: WearPolicy,
    ) -> Result<(Address, usize)> {
        let found = match self.find_free_page_wl(min_count, max_count, block_type, policy) {
            Err(Error::NoMoreSpace) if !self.is_merging => {
                debug!("allocation of {} page(s) failed, merging", min_count);
                self.merge()?;
                self.find_free_page_wl(min_count, max_count, block_type, policy)?
            }
            other => other?,
        };
        self.mark_page(found.0, found.1, true, false)?;
        Ok(found)
    }
}
