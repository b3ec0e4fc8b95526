//! Cross-process spin lock living inside the shared region.
//!
//! The lock word holds the owner's pid (zero when free). Contended
//! acquirers spin, then yield, then sleep briefly; there is no OS-level
//! wakeup. A lock whose owner process no longer exists is taken over so a
//! crashed worker cannot wedge the queue.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 128;
const BACKOFF_SLEEP: Duration = Duration::from_micros(50);
/// Sleeping attempts between liveness checks of the owner.
const OWNER_CHECK_EVERY: u32 = 256;

/// Lock token of the calling process.
fn current_owner() -> u32 {
    std::process::id()
}

/// Whether `pid` names a live process.
fn owner_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// RAII guard; the lock is released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ShmLockGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Try to take the lock without waiting.
pub fn try_lock(word: &AtomicU32) -> Option<ShmLockGuard<'_>> {
    word.compare_exchange(0, current_owner(), Ordering::Acquire, Ordering::Relaxed)
        .ok()
        .map(|_| ShmLockGuard { word })
}

/// Take the lock, waiting as long as needed.
pub fn lock(word: &AtomicU32) -> ShmLockGuard<'_> {
    let me = current_owner();
    let mut attempts: u32 = 0;

    loop {
        match word.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return ShmLockGuard { word },
            Err(owner) => {
                attempts = attempts.wrapping_add(1);
                if attempts < SPIN_LIMIT {
                    hint::spin_loop();
                } else if attempts < YIELD_LIMIT {
                    thread::yield_now();
                } else {
                    if attempts % OWNER_CHECK_EVERY == 0
                        && owner != 0
                        && owner != me
                        && !owner_alive(owner)
                        && word
                            .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        tracing::warn!(dead_owner = owner, "Took over lock held by exited process");
                        return ShmLockGuard { word };
                    }
                    thread::sleep(BACKOFF_SLEEP);
                }
            }
        }
    }
}
