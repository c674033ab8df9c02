//! Handle table for live flows.
//!
//! Handles are `epoch << 16 | slot + 1`. The low half is never zero, so `0`
//! is never issued; the epoch is bumped every time a slot is freed, so a
//! handle held past `free` stops matching even after first-fit reuse hands the
//! same slot to a new flow.

use log::{trace, warn};

use crate::{Error, Result};

pub type Handle = u32;

pub const DEFAULT_MAX_FLOWS: usize = 1024;
/// Slot numbers must fit the low half of a handle.
pub const MAX_SLOTS: usize = SLOT_MASK as usize;

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

struct Entry<T> {
    /// Handle currently issued for this slot; 0 while empty.
    index: Handle,
    epoch: u16,
    value: Option<T>,
}

pub struct ConnectionTable<T> {
    entries: Box<[Entry<T>]>,
    live: usize,
}

impl<T> ConnectionTable<T> {
    /// Allocates all slots up front; fails instead of aborting when memory is
    /// short.
    pub fn with_capacity(max_flows: usize) -> Result<Self> {
        if max_flows == 0 || max_flows > MAX_SLOTS {
            return Err(Error::Config("max_flows must be in 1..=65535"));
        }
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(max_flows)
            .map_err(|_| Error::Alloc("connection table"))?;
        entries.extend((0..max_flows).map(|_| Entry {
            index: 0,
            epoch: 0,
            value: None,
        }));
        Ok(Self {
            entries: entries.into_boxed_slice(),
            live: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Admits `value` into the first empty slot.
    pub fn start(&mut self, value: T) -> Result<Handle> {
        let Some((slot, entry)) = self
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, entry)| entry.index == 0)
        else {
            warn!("connection table full ({} flows)", self.live);
            return Err(Error::TableFull);
        };
        let handle = ((entry.epoch as u32) << SLOT_BITS) | (slot as u32 + 1);
        entry.index = handle;
        entry.value = Some(value);
        self.live += 1;
        trace!("connection {handle:#x} admitted in slot {slot}");
        Ok(handle)
    }

    pub fn lookup(&self, handle: Handle) -> Result<&T> {
        let slot = self.slot(handle)?;
        self.entries[slot]
            .value
            .as_ref()
            .ok_or(Error::NotFound(handle))
    }

    pub fn lookup_mut(&mut self, handle: Handle) -> Result<&mut T> {
        let slot = self.slot(handle)?;
        self.entries[slot]
            .value
            .as_mut()
            .ok_or(Error::NotFound(handle))
    }

    /// Empties the slot and returns its value. Stale handles are a no-op.
    pub fn free(&mut self, handle: Handle) -> Result<T> {
        let slot = self.slot(handle)?;
        let entry = &mut self.entries[slot];
        let value = entry.value.take().ok_or(Error::NotFound(handle))?;
        entry.index = 0;
        entry.epoch = entry.epoch.wrapping_add(1);
        self.live -= 1;
        trace!("connection {handle:#x} freed");
        Ok(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.value.as_ref().map(|value| (entry.index, value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> + '_ {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.value.as_mut().map(|value| (entry.index, value)))
    }

    /// Bounds check, then the stored index must still be this handle.
    fn slot(&self, handle: Handle) -> Result<usize> {
        let slot = (handle & SLOT_MASK) as usize;
        if slot == 0 || slot > self.entries.len() {
            return Err(Error::NotFound(handle));
        }
        if self.entries[slot - 1].index != handle {
            return Err(Error::NotFound(handle));
        }
        Ok(slot - 1)
    }
}
