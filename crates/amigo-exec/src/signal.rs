//! Per-task signal bookkeeping.
//!
//! A registry is a pair of 32-bit masks: which signal numbers are allocated and which of those
//! are pending. For scheduled tasks both masks live in the guest `Task` (`tc_SigAlloc`,
//! `tc_SigRecvd`); calls made outside any task share one [`FallbackSignals`] registry.

use std::sync::{Mutex, MutexGuard, PoisonError};

use amigo_astructs::StructResult;
use tracing::warn;

use crate::structs::Task;

/// Returned by allocation when no signal could be handed out.
pub const NO_SIGNAL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalMasks {
    pub alloc: u32,
    pub recvd: u32,
}

impl SignalMasks {
    pub const fn new(alloc: u32) -> Self {
        Self { alloc, recvd: 0 }
    }

    pub fn load(task: &Task<'_>) -> StructResult<Self> {
        Ok(Self {
            alloc: task.sig_alloc().get()?,
            recvd: task.sig_recvd().get()?,
        })
    }

    pub fn store(&self, task: &Task<'_>) -> StructResult<()> {
        task.sig_alloc().set(self.alloc)?;
        task.sig_recvd().set(self.recvd)
    }

    /// Allocates `requested`, or the lowest free bit when `requested` is -1. Returns the bit
    /// number or [`NO_SIGNAL`]. A newly allocated bit starts out not pending.
    pub fn alloc(&mut self, requested: i32) -> i32 {
        let bit = if requested == NO_SIGNAL {
            match (0..32).find(|bit| self.alloc & (1 << bit) == 0) {
                Some(bit) => bit,
                None => return NO_SIGNAL,
            }
        } else if (0..32).contains(&requested) {
            if self.alloc & (1 << requested) != 0 {
                return NO_SIGNAL;
            }
            requested
        } else {
            warn!(signal = requested, "signal number out of range");
            return NO_SIGNAL;
        };

        let mask = 1u32 << bit;
        self.alloc |= mask;
        self.recvd &= !mask;
        bit
    }

    /// Releases `bit`, dropping it from the pending mask too. Returns `false` (and changes
    /// nothing) if the bit was not allocated.
    pub fn free(&mut self, bit: i32) -> bool {
        if !(0..32).contains(&bit) {
            return false;
        }
        let mask = 1u32 << bit;
        if self.alloc & mask == 0 {
            return false;
        }
        self.alloc &= !mask;
        self.recvd &= !mask;
        true
    }

    /// Replaces the pending bits selected by `mask` with those of `new`, returning the previous
    /// pending mask. Only allocated bits can become pending.
    pub fn set(&mut self, new: u32, mask: u32) -> u32 {
        let old = self.recvd;
        self.recvd = (old & !mask) | (new & mask & self.alloc);
        old
    }

    /// Marks the allocated subset of `mask` pending and returns that subset.
    pub fn post(&mut self, mask: u32) -> u32 {
        let delivered = mask & self.alloc;
        self.recvd |= delivered;
        delivered
    }

    /// Consumes and returns the pending bits selected by `mask`.
    pub fn take(&mut self, mask: u32) -> u32 {
        let got = self.recvd & mask;
        self.recvd &= !got;
        got
    }
}

#[derive(Debug)]
struct FallbackState {
    masks: SignalMasks,
    forbid: u32,
}

/// Registry used when exec functions are called with no current task.
///
/// Starts with the reserved signals allocated and nothing pending; [`reset`](Self::reset)
/// returns it to that state.
#[derive(Debug)]
pub struct FallbackSignals {
    reserved: u32,
    state: Mutex<FallbackState>,
}

impl FallbackSignals {
    pub fn new(reserved: u32) -> Self {
        Self {
            reserved,
            state: Mutex::new(FallbackState {
                masks: SignalMasks::new(reserved),
                forbid: 0,
            }),
        }
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.masks = SignalMasks::new(self.reserved);
        state.forbid = 0;
    }

    pub fn masks(&self) -> SignalMasks {
        self.lock().masks
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SignalMasks) -> R) -> R {
        f(&mut self.lock().masks)
    }

    pub fn forbid_count(&self) -> u32 {
        self.lock().forbid
    }

    /// Increments the forbid nesting count and returns the new count.
    pub fn forbid(&self) -> u32 {
        let mut state = self.lock();
        state.forbid += 1;
        state.forbid
    }

    /// Decrements the forbid nesting count (never below zero) and returns the new count.
    pub fn permit(&self) -> u32 {
        let mut state = self.lock();
        state.forbid = state.forbid.saturating_sub(1);
        state.forbid
    }

    fn lock(&self) -> MutexGuard<'_, FallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
