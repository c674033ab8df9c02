//! Futex park/wake used by blocking ring readers.

use std::sync::atomic::AtomicU32;

use crate::{Error, Result};

/// Parks the caller while `addr` still holds `expected`.
///
/// Spurious wakeups and a changed value both return `Ok`; the caller re-checks
/// its condition. A signal delivered while parked surfaces as
/// `Error::Interrupted` so the caller can unwind instead of re-parking.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32) -> Result<()> {
    if futex(addr, libc::FUTEX_WAIT, expected) == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(()),
        Some(libc::EINTR) => Err(Error::Interrupted),
        _ => Err(Error::Io(err)),
    }
}

/// Wakes every waiter parked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32) -> Result<()> {
    if futex(addr, libc::FUTEX_WAKE, i32::MAX as u32) < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn futex(addr: &AtomicU32, op: libc::c_int, value: u32) -> libc::c_long {
    // SAFETY: `addr` is a live, aligned u32 for the duration of the call; no
    // timeout or second address is passed.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr.as_ptr() as *const u32,
            op,
            value,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        )
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32) -> Result<()> {
    std::thread::sleep(std::time::Duration::from_millis(1));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_when_value_already_changed() {
        let word = AtomicU32::new(1);
        futex_wait(&word, 0).unwrap();
    }

    #[test]
    fn wake_without_waiters_is_ok() {
        let word = AtomicU32::new(0);
        futex_wake(&word).unwrap();
    }
}
