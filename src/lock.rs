//! The cross-process write lock.
//!
//! The lock word in the region header holds an owner token: the writer's pid
//! and a ticket drawn for this one acquisition. Handles in the same process
//! share a pid, so only the ticket tells one acquisition from the next.
//! Waiters spin briefly, then sleep between attempts, and every so often look
//! at the holder: a holder that no longer exists, or that has held the lock
//! for too long, is assumed to have died mid-write and the lock is taken
//! over.
//!
//! The acquisition time is stamped with the ticket it belongs to, after the
//! owner is set. A stamp carrying another ticket is left over from an earlier
//! holder and says nothing about how long the current one has held the lock.
//!
//! Timing here uses the system clock in milliseconds, independent of the
//! cache [Clock](crate::Clock), since it must agree between processes that may
//! use test clocks.

use crate::clock::unix_now_ms;
use crate::config::LockPolicy;
use crate::error::{CacheError, Result};
use crate::layout::{LockCounter, LockWord};
use crossbeam_utils::Backoff;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[inline]
fn token(pid: u32, ticket: u32) -> u64 {
    (pid as u64) << 32 | ticket as u64
}

#[inline]
fn token_pid(token: u64) -> u32 {
    (token >> 32) as u32
}

#[inline]
fn stamp(ticket: u32, at_ms: i64) -> u64 {
    (ticket as u64) << 32 | (at_ms as u32) as u64
}

/// A ticket for a new acquisition. Never 0, which an unstamped word carries.
fn next_ticket(word: &LockWord) -> u32 {
    loop {
        let ticket = word.next_ticket.fetch_add(1, Ordering::Relaxed);
        if ticket != 0 {
            return ticket;
        }
    }
}

/// Releases the lock on drop, unless it was taken over meanwhile.
#[derive(Debug)]
pub(crate) struct LockGuard<'r> {
    word: &'r LockWord,
    token: u64,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self
            .word
            .owner
            .compare_exchange(self.token, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            tracing::warn!(
                pid = token_pid(self.token),
                ticket = self.token as u32,
                "lock was taken over while held"
            );
        }
    }
}

/// Claim a free lock, returning the owner token.
#[inline]
fn try_lock(word: &LockWord, pid: u32) -> Option<u64> {
    if word.owner.load(Ordering::Relaxed) != 0 {
        return None;
    }
    let ticket = next_ticket(word);
    let token = token(pid, ticket);
    word.owner
        .compare_exchange(0, token, Ordering::AcqRel, Ordering::Relaxed)
        .ok()?;
    word.stamp.store(stamp(ticket, unix_now_ms()), Ordering::Release);
    Some(token)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// The owner token to take the lock from, if its holder is dead or overdue.
fn stale_holder(word: &LockWord, policy: &LockPolicy, now_ms: i64) -> Option<u64> {
    let owner = word.owner.load(Ordering::Acquire);
    if owner == 0 {
        return None;
    }
    let holder = token_pid(owner);
    if !process_alive(holder) {
        tracing::warn!(holder, "lock holder is dead");
        return Some(owner);
    }
    if policy.max_hold_ms == 0 {
        return None;
    }
    let stamped = word.stamp.load(Ordering::Acquire);
    if (stamped >> 32) as u32 != owner as u32 {
        // Acquired but not stamped yet.
        return None;
    }
    let held_ms = (now_ms as u32).wrapping_sub(stamped as u32) as u64;
    if held_ms >= policy.max_hold_ms {
        tracing::warn!(holder, held_ms, "lock holder is overdue");
        return Some(owner);
    }
    None
}

/// Replace `owner` with a fresh token for `pid`.
fn take_over(word: &LockWord, owner: u64, pid: u32, now_ms: i64) -> Option<u64> {
    let ticket = next_ticket(word);
    let token = token(pid, ticket);
    word.owner
        .compare_exchange(owner, token, Ordering::AcqRel, Ordering::Relaxed)
        .ok()?;
    word.stamp.store(stamp(ticket, now_ms), Ordering::Release);
    Some(token)
}

/// Acquire the lock for `pid`.
pub(crate) fn acquire<'r>(
    word: &'r LockWord,
    stats: &LockCounter,
    policy: &LockPolicy,
    pid: u32,
) -> Result<LockGuard<'r>> {
    stats.total.fetch_add(1, Ordering::Relaxed);
    if let Some(token) = try_lock(word, pid) {
        return Ok(LockGuard { word, token });
    }

    let start = unix_now_ms();
    let mut last_detect = start;
    let backoff = Backoff::new();
    loop {
        if !backoff.is_completed() {
            backoff.snooze();
            if let Some(token) = try_lock(word, pid) {
                return Ok(LockGuard { word, token });
            }
            continue;
        }

        let now = unix_now_ms();
        if now - last_detect >= policy.detect_deadlock_interval_ms as i64 {
            last_detect = now;
            stats.detect_deadlock.fetch_add(1, Ordering::Relaxed);
            stats
                .last_detect_deadlock_time
                .store(now / 1000, Ordering::Relaxed);
            if let Some(owner) = stale_holder(word, policy, now) {
                if let Some(token) = take_over(word, owner, pid, now) {
                    stats.unlock_deadlock.fetch_add(1, Ordering::Relaxed);
                    stats
                        .last_unlock_deadlock_time
                        .store(now / 1000, Ordering::Relaxed);
                    tracing::warn!(holder = token_pid(owner), pid, "took over the cache lock");
                    return Ok(LockGuard { word, token });
                }
            }
        }

        let waited_ms = (now - start).max(0) as u64;
        if policy.timeout_ms > 0 && waited_ms >= policy.timeout_ms {
            tracing::error!(waited_ms, "timed out waiting for the cache lock");
            return Err(CacheError::LockTimeout { waited_ms });
        }

        stats.retry.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(Duration::from_micros(policy.trylock_interval_us));
        if let Some(token) = try_lock(word, pid) {
            return Ok(LockGuard { word, token });
        }
    }
}
