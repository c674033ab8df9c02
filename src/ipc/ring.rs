//! Bounded lock-free ring of variable-length byte messages.
//!
//! # Layout
//!
//! ```text
//!   buf        [ slot 0 | slot 1 | ... | slot N-1 ]      N * slot_size bytes
//!   msg_list   [ desc   | desc   | ... ]                 published ring (read_head, write_head)
//!   free_list  [ slot+1 | slot+1 | ... ]                 free ring (free_head, free_tail)
//! ```
//!
//! Every slot starts with a 2-byte little-endian length followed by the
//! payload. A published descriptor packs `len << 32 | slot + 1` so readers
//! can budget without touching slot memory they do not own yet; `0` marks a
//! position that has been reserved but not yet published.
//!
//! # Write
//!
//! 1. Claim a free slot: clear the free-ring entry at `free_head`, then CAS
//!    `free_head` forward. Fail fast when the free ring is exhausted, or when
//!    the entry at `free_head` is still empty because a slot return or another
//!    claim is in flight.
//! 2. Copy the payload in through the channel's [`CopyStrategy`].
//! 3. CAS `write_head` forward to reserve a publish position. The free ring
//!    holds back one more position than the publish ring, so it runs out
//!    first and this step does not collide with `read_head` in practice.
//! 4. Store the descriptor; wake parked readers in blocking mode.
//!
//! # Read
//!
//! While the descriptor at `read_head` is published and fits the remaining
//! budget: clear it, CAS `read_head` forward, copy the payload out and CAS the
//! slot back onto the free ring via `free_tail`. A failed copy-out ends the
//! read; it is reported only when nothing was delivered before it.
//!
//! A head only moves after its entry is cleared, so writers and returning
//! readers always store into empty entries. If the head CAS fails after a
//! successful clear, the entry was republished a lap later and is put back.
//!
//! All four indices wrap at the ring size. One free position and one publish
//! position are held back to tell full from empty, so at most `capacity - 2`
//! messages are in flight.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::ipc::copy::{CopyStrategy, LocalCopy};
use crate::wait::{futex_wait, futex_wake};
use crate::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_SLOT_SIZE: usize = 512;
pub const LEN_PREFIX: usize = 2;
const DEFAULT_SPIN_US: u32 = 10;
const MIN_CAPACITY: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// `read` returns 0 when nothing is ready.
    NonBlocking,
    /// `read` spins for `spin_us`, then parks until a writer publishes.
    Blocking { spin_us: u32 },
}

#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    /// Number of slots.
    pub capacity: usize,
    /// Bytes per slot, length prefix included.
    pub slot_size: usize,
    pub read_mode: ReadMode,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            read_mode: ReadMode::NonBlocking,
        }
    }
}

impl ChannelConfig {
    pub fn blocking() -> Self {
        Self {
            read_mode: ReadMode::Blocking {
                spin_us: DEFAULT_SPIN_US,
            },
            ..Self::default()
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity < MIN_CAPACITY {
            return Err(Error::Config("channel capacity must be at least 3"));
        }
        if self.capacity > u32::MAX as usize / 2 {
            return Err(Error::Config("channel capacity too large"));
        }
        if self.slot_size <= LEN_PREFIX {
            return Err(Error::Config("slot size must exceed the length prefix"));
        }
        if self.slot_size - LEN_PREFIX > u16::MAX as usize {
            return Err(Error::Config("slot payload must fit a u16 length"));
        }
        if self.capacity.checked_mul(self.slot_size).is_none() {
            return Err(Error::Config("channel buffer size overflows"));
        }
        Ok(())
    }
}

// Keeps each index on its own cache line.
#[repr(C, align(128))]
struct Index(AtomicU32);

impl Index {
    fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }
}

pub struct RingChannel<S: CopyStrategy = LocalCopy> {
    buf: Box<[UnsafeCell<u8>]>,
    msg_list: Box<[AtomicU64]>,
    free_list: Box<[AtomicU32]>,

    read_head: Index,
    write_head: Index,
    free_head: Index,
    free_tail: Index,

    notify_seq: AtomicU32,
    waiters_pending: AtomicU32,
    interrupted: AtomicBool,

    capacity: u32,
    slot_size: usize,
    read_mode: ReadMode,
    copy: S,
}

// SAFETY: slot bytes are only touched by the thread that cleared the entry
// handing it the slot (free ring for writers, message ring for readers). All
// other shared state is atomic.
unsafe impl<S: CopyStrategy> Sync for RingChannel<S> {}
unsafe impl<S: CopyStrategy> Send for RingChannel<S> {}

impl RingChannel<LocalCopy> {
    pub fn new(config: ChannelConfig) -> Result<Self> {
        Self::with_copy(config, LocalCopy)
    }
}

impl<S: CopyStrategy> RingChannel<S> {
    /// Allocates the ring. Allocation failure is reported, not aborted on,
    /// so a subsystem can refuse to come up.
    pub fn with_copy(config: ChannelConfig, copy: S) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity;

        let buf = try_alloc(capacity * config.slot_size, "ring buffer", |_| UnsafeCell::new(0))?;
        let msg_list = try_alloc(capacity, "message list", |_| AtomicU64::new(0))?;
        // The last position starts empty: it is the free ring's sentinel.
        let free_list = try_alloc(capacity, "free list", |i| {
            AtomicU32::new(if i + 1 < capacity { i as u32 + 1 } else { 0 })
        })?;

        debug!(
            "ring channel: {} slots x {} bytes, {:?}",
            capacity, config.slot_size, config.read_mode
        );

        Ok(Self {
            buf,
            msg_list,
            free_list,
            read_head: Index::new(0),
            write_head: Index::new(0),
            free_head: Index::new(0),
            free_tail: Index::new(capacity as u32 - 1),
            notify_seq: AtomicU32::new(0),
            waiters_pending: AtomicU32::new(0),
            interrupted: AtomicBool::new(false),
            capacity: capacity as u32,
            slot_size: config.slot_size,
            read_mode: config.read_mode,
            copy,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Messages that can be in flight at once.
    pub fn usable_slots(&self) -> usize {
        self.capacity as usize - 2
    }

    pub fn max_message_len(&self) -> usize {
        self.slot_size - LEN_PREFIX
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    /// Published positions not yet consumed. Racy; for diagnostics.
    pub fn len(&self) -> usize {
        let read = self.read_head.0.load(Ordering::Acquire);
        let write = self.write_head.0.load(Ordering::Acquire);
        ((write + self.capacity - read) % self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes one message. Never blocks.
    ///
    /// # Errors
    ///
    /// - `Error::FreeListExhausted`: no free slot to copy into right now; a
    ///   slot return in flight on another thread also reports this
    /// - `Error::ChannelFull`: no publish position left; the free ring runs out
    ///   first, so this only guards the publish CAS
    /// - `Error::MessageTooLarge`: payload exceeds `max_message_len()`
    /// - `Error::Copy`: the copy strategy refused the payload
    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() {
            return Err(Error::Malformed("empty message"));
        }
        if payload.len() > self.max_message_len() {
            return Err(Error::MessageTooLarge(payload.len()));
        }
        let len = payload.len();

        let slot = self.acquire_free_slot()?;
        // SAFETY: the slot was just claimed from the free ring; nobody else
        // can reach it until it is published.
        let block = unsafe { self.slot_mut(slot) };
        block[..LEN_PREFIX].copy_from_slice(&(len as u16).to_le_bytes());
        if let Err(err) = self.copy.copy_in(&mut block[LEN_PREFIX..LEN_PREFIX + len], payload) {
            self.return_slot(slot);
            return Err(err);
        }

        let n = self.capacity;
        let mut old = self.write_head.0.load(Ordering::Acquire);
        let new = loop {
            let new = (old + 1) % n;
            if new == self.read_head.0.load(Ordering::Acquire) {
                // Unreachable while in-flight slots stay below capacity - 1.
                self.return_slot(slot);
                return Err(Error::ChannelFull);
            }
            match self
                .write_head
                .0
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break new,
                Err(actual) => old = actual,
            }
        };

        // Wraps to the ring size, not zero: the reserved position is new - 1.
        let position = if new == 0 { n } else { new } - 1;
        self.msg_list[position as usize].store(descriptor(slot, len), Ordering::Release);
        trace!("ring: slot {} published at {} ({} bytes)", slot, position, len);

        if matches!(self.read_mode, ReadMode::Blocking { .. }) {
            self.wake_readers();
        }
        Ok(len)
    }

    /// Copies as many ready messages as fit into `buf`, back to back.
    ///
    /// Returns the bytes delivered; 0 means nothing was ready (non-blocking
    /// mode only). In blocking mode the call parks until a message arrives or
    /// the wait is interrupted.
    ///
    /// # Errors
    ///
    /// - `Error::BufferTooSmall`: the next message alone exceeds `buf`
    /// - `Error::Copy`: the copy strategy failed on the first message; that
    ///   message is dropped. A later failure ends the read with the bytes
    ///   already delivered.
    /// - `Error::Interrupted`: [`interrupt`](Self::interrupt) or a signal ended the wait
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let ReadMode::Blocking { spin_us } = self.read_mode else {
            return self.try_read(buf);
        };
        loop {
            let read = self.try_read(buf)?;
            if read > 0 {
                return Ok(read);
            }
            if self.interrupted.swap(false, Ordering::AcqRel) {
                return Err(Error::Interrupted);
            }
            self.park(spin_us)?;
        }
    }

    /// Non-blocking read regardless of the channel's read mode.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.capacity;
        let mut written = 0;
        loop {
            let head = self.read_head.0.load(Ordering::Acquire);
            if head == self.write_head.0.load(Ordering::Acquire) {
                break;
            }
            let entry = &self.msg_list[head as usize];
            let desc = entry.load(Ordering::Acquire);
            if desc == 0 {
                // Reserved but unpublished, or claimed by a reader that has
                // not moved the head yet.
                break;
            }
            let len = descriptor_len(desc);
            if len > buf.len() - written {
                if written == 0 {
                    return Err(Error::BufferTooSmall {
                        needed: len,
                        available: buf.len(),
                    });
                }
                break;
            }
            if entry
                .compare_exchange(desc, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if self
                .read_head
                .0
                .compare_exchange(head, (head + 1) % n, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Same descriptor republished a lap later; not ours yet.
                entry.store(desc, Ordering::Release);
                continue;
            }

            let slot = descriptor_slot(desc);
            // SAFETY: clearing the descriptor at the head handed this reader
            // exclusive ownership of the slot.
            let block = unsafe { self.slot_ref(slot) };
            let stored = u16::from_le_bytes([block[0], block[1]]) as usize;
            debug_assert_eq!(stored, len);
            let copied = self
                .copy
                .copy_out(&mut buf[written..written + len], &block[LEN_PREFIX..LEN_PREFIX + stored]);
            self.return_slot(slot);
            if let Err(err) = copied {
                if written == 0 {
                    return Err(err);
                }
                debug!("ring: copy-out failed after {written} bytes, message dropped: {err}");
                break;
            }
            written += len;
        }
        if written > 0 {
            trace!("ring: read {} bytes", written);
        }
        Ok(written)
    }

    /// Wakes a parked reader with `Error::Interrupted`. If no reader is
    /// parked, the next blocking read that finds nothing returns it instead.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify_seq.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = futex_wake(&self.notify_seq) {
            debug!("ring: interrupt wake failed: {err}");
        }
    }

    fn acquire_free_slot(&self) -> Result<u32> {
        let n = self.capacity;
        loop {
            let head = self.free_head.0.load(Ordering::Acquire);
            if (head + 1) % n == self.free_tail.0.load(Ordering::Acquire) {
                return Err(Error::FreeListExhausted);
            }
            let entry = &self.free_list[head as usize];
            let slot = entry.load(Ordering::Acquire);
            if slot == 0 {
                // A reader moved free_tail and has not stored its slot yet, or
                // another writer is between its two CASes. Never wait on them.
                return Err(Error::FreeListExhausted);
            }
            if entry
                .compare_exchange(slot, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if self
                .free_head
                .0
                .compare_exchange(head, (head + 1) % n, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                entry.store(slot, Ordering::Release);
                continue;
            }
            return Ok(slot - 1);
        }
    }

    fn return_slot(&self, slot: u32) {
        let n = self.capacity;
        let mut tail = self.free_tail.0.load(Ordering::Acquire);
        let new_tail = loop {
            let new_tail = (tail + 1) % n;
            match self
                .free_tail
                .0
                .compare_exchange_weak(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break new_tail,
                Err(actual) => tail = actual,
            }
        };
        let position = (if new_tail == 0 { n } else { new_tail } - 1) as usize;
        self.free_list[position].store(slot + 1, Ordering::Release);
    }

    fn has_ready(&self) -> bool {
        let read = self.read_head.0.load(Ordering::Acquire);
        read != self.write_head.0.load(Ordering::Acquire)
            && self.msg_list[read as usize].load(Ordering::Acquire) != 0
    }

    fn park(&self, spin_us: u32) -> Result<()> {
        let spin_deadline = Instant::now() + Duration::from_micros(spin_us as u64);
        let mut i = 0u32;
        loop {
            if self.has_ready() {
                return Ok(());
            }
            i += 1;
            if i % 128 == 0 && Instant::now() >= spin_deadline {
                break;
            }
            std::hint::spin_loop();
        }

        // Register before sampling the sequence so a concurrent publish either
        // sees us waiting or changes the sequence we sleep on.
        self.waiters_pending.fetch_add(1, Ordering::SeqCst);
        let seq = self.notify_seq.load(Ordering::SeqCst);
        if self.has_ready() || self.interrupted.load(Ordering::Acquire) {
            self.waiters_pending.fetch_sub(1, Ordering::SeqCst);
            return Ok(());
        }
        let res = futex_wait(&self.notify_seq, seq);
        self.waiters_pending.fetch_sub(1, Ordering::SeqCst);
        res
    }

    fn wake_readers(&self) {
        self.notify_seq.fetch_add(1, Ordering::SeqCst);
        if self.waiters_pending.load(Ordering::SeqCst) > 0 {
            if let Err(err) = futex_wake(&self.notify_seq) {
                debug!("ring: reader wake failed: {err}");
            }
        }
    }

    /// # Safety
    ///
    /// The caller must own `slot`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, slot: u32) -> &mut [u8] {
        let start = slot as usize * self.slot_size;
        let ptr = UnsafeCell::raw_get(self.buf.as_ptr().add(start));
        std::slice::from_raw_parts_mut(ptr, self.slot_size)
    }

    /// # Safety
    ///
    /// The caller must own `slot`.
    unsafe fn slot_ref(&self, slot: u32) -> &[u8] {
        let start = slot as usize * self.slot_size;
        let ptr = UnsafeCell::raw_get(self.buf.as_ptr().add(start));
        std::slice::from_raw_parts(ptr, self.slot_size)
    }
}

#[inline]
fn descriptor(slot: u32, len: usize) -> u64 {
    ((len as u64) << 32) | (slot as u64 + 1)
}

#[inline]
fn descriptor_len(desc: u64) -> usize {
    (desc >> 32) as usize
}

#[inline]
fn descriptor_slot(desc: u64) -> u32 {
    (desc as u32) - 1
}

fn try_alloc<T>(len: usize, what: &'static str, init: impl FnMut(usize) -> T) -> Result<Box<[T]>> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(len)
        .map_err(|_| Error::Alloc(what))?;
    storage.extend((0..len).map(init));
    Ok(storage.into_boxed_slice())
}
