// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Outstanding device tasks.
//!
//! A [`Task`] ties one ring slot to the combo-buffer range it encrypts.
//! Tasks live in a [`TaskArena`] indexed by ring slot; each entry is stamped
//! with the ring position it was submitted at, so a lookup for a recycled
//! slot can never return a task from an earlier lap.

use std::sync::Arc;

use crate::dma::HwRange;
use crate::event::Event;

/// Identifier of a session, unique per device.
pub type SessionId = u64;

/// One submitted device command.
#[derive(Debug)]
pub struct Task {
    /// Owning session.
    pub session: SessionId,
    /// Device-owned byte range of the session's combo buffer.
    pub range: HwRange,
    /// Number of blocks in the command.
    pub blocks: u32,
    /// Signaled when the task completes.
    pub data_ready: Arc<Event>,
}

/// Fixed-size, position-stamped task storage.
#[derive(Debug)]
pub struct TaskArena {
    slots: Vec<Option<(u64, Task)>>,
}

impl TaskArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    #[inline]
    fn index(&self, position: u64) -> usize {
        (position % self.slots.len() as u64) as usize
    }

    /// Store the task submitted at `position`.
    ///
    /// # Panics
    ///
    /// Panics if the slot still holds an unretired task.
    pub fn insert(&mut self, position: u64, task: Task) {
        let index = self.index(position);
        let slot = &mut self.slots[index];
        if let Some((stale, _)) = slot {
            panic!("ring slot {index} reused at position {position} while position {stale} is outstanding");
        }
        *slot = Some((position, task));
    }

    /// Remove the task submitted at `position`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is empty or holds a task from another position.
    pub fn take(&mut self, position: u64) -> Task {
        let index = self.index(position);
        match self.slots[index].take() {
            Some((stamp, task)) if stamp == position => task,
            Some((stamp, _)) => {
                panic!("ring slot {index} holds position {stamp}, expected {position}")
            }
            None => panic!("ring slot {index} empty at position {position}"),
        }
    }

    /// Number of stored tasks.
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
