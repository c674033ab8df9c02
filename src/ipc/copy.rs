//! Copy strategies for moving bytes across an execution-context boundary.
//!
//! A ring channel picks its strategy once, at construction. Writers go through
//! `copy_in` (caller buffer into a slot), readers through `copy_out` (slot into
//! caller buffer). A strategy that cannot complete the copy returns
//! `Error::Copy` and the channel releases the slot untouched.

use crate::{Error, Result};

pub trait CopyStrategy: Send + Sync + 'static {
    fn copy_in(&self, slot: &mut [u8], src: &[u8]) -> Result<()>;
    fn copy_out(&self, dst: &mut [u8], slot: &[u8]) -> Result<()>;
}

/// Plain memory copy; both sides share one address space.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCopy;

impl CopyStrategy for LocalCopy {
    #[inline]
    fn copy_in(&self, slot: &mut [u8], src: &[u8]) -> Result<()> {
        checked_copy(slot, src)
    }

    #[inline]
    fn copy_out(&self, dst: &mut [u8], slot: &[u8]) -> Result<()> {
        checked_copy(dst, slot)
    }
}

#[inline]
fn checked_copy(dst: &mut [u8], src: &[u8]) -> Result<()> {
    let Some(dst) = dst.get_mut(..src.len()) else {
        return Err(Error::Copy("destination shorter than source"));
    };
    dst.copy_from_slice(src);
    Ok(())
}
