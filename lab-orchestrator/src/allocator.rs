//! VLAN tag allocation.
//!
//! Tags are handed out lowest-first from an inclusive range. Allocation state
//! is process-local; after a restart the daemon reseeds it with
//! [`TagAllocator::reserve`] from the tags recorded on live labs.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Highest tag usable on an 802.1Q trunk.
pub const MAX_VLAN_TAG: u16 = 4094;

#[derive(Debug)]
pub struct TagAllocator {
    low: u16,
    high: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl TagAllocator {
    pub fn new(low: u16, high: u16) -> Result<Self> {
        if low == 0 || high > MAX_VLAN_TAG || low > high {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid VLAN range {low}-{high}"
            )));
        }
        Ok(Self {
            low,
            high,
            allocated: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.high - self.low) + 1
    }

    /// Lowest free tag.
    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let tag = (self.low..=self.high)
            .find(|tag| !allocated.contains(tag))
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!(
                    "no free VLAN tags in {}-{}",
                    self.low, self.high
                ))
            })?;
        allocated.insert(tag);
        debug!("Allocated VLAN tag {}", tag);
        Ok(tag)
    }

    /// Returns false if the tag was not allocated.
    pub fn release(&self, tag: u16) -> bool {
        let released = self
            .allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
        if released {
            debug!("Released VLAN tag {}", tag);
        }
        released
    }

    /// Mark a specific tag as taken. Returns false if it is out of range or
    /// already allocated.
    pub fn reserve(&self, tag: u16) -> bool {
        if tag < self.low || tag > self.high {
            return false;
        }
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag)
    }

    pub fn is_allocated(&self, tag: u16) -> bool {
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&tag)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
