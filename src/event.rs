// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Wait/wake primitives shared by sessions and the interrupt path.
//!
//! An [`Event`] is a generation counter behind its own mutex. A waiter
//! samples the generation *before* checking its predicate under whatever
//! lock protects that predicate, drops that lock, and then sleeps until the
//! generation moves. Any signal raised after the sample wakes it, so no
//! wakeup can fall between the check and the sleep. The event mutex is a
//! leaf lock: nothing else is acquired while it is held, which makes
//! [`Event::signal`] safe to call from the interrupt path.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::AesResult;

/// Lock a mutex, recovering the guard if a previous holder panicked.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on a condition variable, recovering from poisoning.
#[inline]
pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Broadcast wakeup with a generation counter.
#[derive(Debug, Default)]
pub struct Event {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation; pass it to [`Event::wait_past`].
    pub fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Advance the generation and wake every waiter.
    pub fn signal(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Sleep until the generation differs from `seen`.
    ///
    /// `abort` is evaluated before every sleep and after every wakeup; its
    /// error ends the wait. Spurious wakeups are absorbed here.
    pub fn wait_past<F>(&self, seen: u64, abort: F) -> AesResult<()>
    where
        F: Fn() -> AesResult<()>,
    {
        let mut generation = lock(&self.generation);
        loop {
            abort()?;
            if *generation != seen {
                return Ok(());
            }
            generation = wait(&self.cv, generation);
        }
    }
}
