//! OR-of-flags signal shared between audio threads, network threads and the
//! controller loop.
//!
//! Bits set before a wait are coalesced: a waiter sees the union of every
//! bit set since its last wake, never a count.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

pub const SCHEDULE_EVENT: u32 = 1 << 0;
pub const AUDIO_INPUT_READY_EVENT: u32 = 1 << 1;
pub const AUDIO_OUTPUT_READY_EVENT: u32 = 1 << 2;
pub const SHUTDOWN_EVENT: u32 = 1 << 3;

#[derive(Debug, Default)]
pub struct EventGroup {
    bits: Mutex<u32>,
    cond: Condvar,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks beyond the brief critical section and never runs user code.
    pub fn set(&self, bits: u32) {
        let mut current = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        *current |= bits;
        self.cond.notify_all();
    }

    /// Block until any bit in `mask` is set, clear those bits and return them.
    pub fn wait(&self, mask: u32) -> u32 {
        let guard = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = self
            .cond
            .wait_while(guard, |bits| *bits & mask == 0)
            .unwrap_or_else(PoisonError::into_inner);
        let hit = *guard & mask;
        *guard &= !hit;
        hit
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning 0.
    pub fn wait_timeout(&self, mask: u32, timeout: Duration) -> u32 {
        let guard = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |bits| *bits & mask == 0)
            .unwrap_or_else(PoisonError::into_inner);
        let hit = *guard & mask;
        *guard &= !hit;
        hit
    }

    pub fn peek(&self) -> u32 {
        *self.bits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
