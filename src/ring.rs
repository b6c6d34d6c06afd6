// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device command ring.
//!
//! The ring is an array of [`COMMAND_SIZE`]-byte slots in DMA memory shared
//! by every session of one device. The driver tracks two monotonically
//! increasing positions: `head`, the oldest submitted command the device
//! may still be working on, and `tail`, the next position to fill. The slot
//! of a position is `position % capacity`.
//!
//! At most `capacity - 1` commands are ever outstanding, so the device's
//! read pointer equals its write pointer only when the ring is empty.
//! `CMD_END_PTR` is exclusive: the device wraps back to `CMD_BEGIN_PTR`
//! when its read pointer reaches it.

use std::sync::atomic::{fence, Ordering};

use crate::descriptor::{intr_bit_for_slot, AesCommand, COMMAND_SIZE};
use crate::dma::{BusAddr, DmaBuffer};
use crate::regs::{Registers, CMD_WRITE_PTR};
use crate::task::{Task, TaskArena};

/// A reserved ring position. Consumed by [`CommandRing::submit`].
#[derive(Debug)]
pub struct RingSlot {
    position: u64,
    index: usize,
}

impl RingSlot {
    /// Slot index within the ring.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Bounded ring of hardware command slots and the tasks occupying them.
#[derive(Debug)]
pub struct CommandRing {
    mem: DmaBuffer,
    capacity: usize,
    head: u64,
    tail: u64,
    tasks: TaskArena,
}

impl CommandRing {
    /// Build a ring over `mem`, one slot per [`COMMAND_SIZE`] bytes.
    pub fn new(mem: DmaBuffer) -> Self {
        let capacity = mem.len() / COMMAND_SIZE;
        assert!(capacity >= 2, "command ring needs at least two slots");
        Self {
            mem,
            capacity,
            head: 0,
            tail: 0,
            tasks: TaskArena::new(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently holding submitted, unretired commands.
    #[inline]
    pub fn occupied(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// True when another command may be submitted.
    ///
    /// One slot always stays empty so a full ring is distinguishable from
    /// an empty one by pointer comparison.
    #[inline]
    pub fn has_free_slot(&self) -> bool {
        self.occupied() + 2 <= self.capacity
    }

    /// Value for `CMD_BEGIN_PTR`.
    #[inline]
    pub fn begin_ptr(&self) -> BusAddr {
        self.mem.bus_addr()
    }

    /// Value for `CMD_END_PTR`.
    #[inline]
    pub fn end_ptr(&self) -> BusAddr {
        self.mem.bus_addr() + (self.capacity * COMMAND_SIZE) as BusAddr
    }

    #[inline]
    fn index_of(&self, position: u64) -> usize {
        (position % self.capacity as u64) as usize
    }

    /// Device-visible address of the slot for `position`.
    #[inline]
    fn ptr_of(&self, position: u64) -> BusAddr {
        self.mem.bus_at(self.index_of(position) * COMMAND_SIZE)
    }

    /// Value the device's write pointer holds after the last submission.
    #[inline]
    pub fn write_ptr(&self) -> BusAddr {
        self.ptr_of(self.tail)
    }

    /// Reserve the next position, or `None` if the ring is full.
    pub fn reserve(&self) -> Option<RingSlot> {
        self.has_free_slot().then(|| RingSlot {
            position: self.tail,
            index: self.index_of(self.tail),
        })
    }

    /// Write `cmd` into the reserved slot and hand it to the device.
    ///
    /// The command's interrupt-select field is replaced with the slot's
    /// bit. Must be called under the same lock that produced `slot`.
    pub fn submit(&mut self, regs: &dyn Registers, slot: RingSlot, cmd: AesCommand, task: Task) {
        assert_eq!(slot.position, self.tail, "stale ring reservation");
        assert!(self.has_free_slot(), "ring overflow");

        let cmd = AesCommand {
            task: cmd.task.with_intr(intr_bit_for_slot(slot.index)),
            ..cmd
        };
        // SAFETY: slots outside [head, tail) are not read by the device; the
        // write pointer has not been advanced past this slot yet.
        unsafe { self.mem.write_at(slot.index * COMMAND_SIZE, &cmd.to_bytes()) };

        self.tasks.insert(slot.position, task);
        self.tail += 1;

        // The descriptor must be visible before the device sees the pointer.
        fence(Ordering::Release);
        regs.write32(CMD_WRITE_PTR, self.ptr_of(self.tail));
    }

    /// Retire every command the device has finished.
    ///
    /// `read_ptr` and `write_ptr` are the device's current pointers. Every
    /// position before the one whose slot `read_ptr` names is complete; if
    /// the pointers are equal the device has drained and all outstanding
    /// commands are complete. Retired tasks are passed to `on_done` in
    /// submission order. Returns the number retired.
    ///
    /// # Panics
    ///
    /// Panics if `read_ptr` does not name a slot of this ring or lies
    /// outside the outstanding window.
    pub fn retire<F>(&mut self, read_ptr: BusAddr, write_ptr: BusAddr, mut on_done: F) -> usize
    where
        F: FnMut(Task),
    {
        let occupied = self.occupied();
        if occupied == 0 {
            return 0;
        }

        let done = if read_ptr == write_ptr {
            occupied
        } else {
            let begin = self.begin_ptr();
            assert!(
                read_ptr >= begin
                    && read_ptr < self.end_ptr()
                    && (read_ptr - begin) as usize % COMMAND_SIZE == 0,
                "device read pointer {read_ptr:#x} outside command ring"
            );
            let read_index = (read_ptr - begin) as usize / COMMAND_SIZE;
            let head_index = self.index_of(self.head);
            let done = (read_index + self.capacity - head_index) % self.capacity;
            assert!(
                done <= occupied,
                "device read pointer {read_ptr:#x} ahead of submitted commands"
            );
            done
        };

        for _ in 0..done {
            let task = self.tasks.take(self.head);
            self.head += 1;
            on_done(task);
        }
        debug_assert_eq!(self.tasks.len(), self.occupied());
        done
    }

    /// Total commands ever submitted.
    #[inline]
    pub fn submitted(&self) -> u64 {
        self.tail
    }

    /// Total commands ever retired.
    #[inline]
    pub fn retired(&self) -> u64 {
        self.head
    }
}
