// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-open cipher stream.
//!
//! A [`Session`] is a byte stream: bytes written are encrypted (or
//! decrypted) by the device under the session's current mode and come back
//! through [`Session::read`] in the same order.
//!
//! # Locking
//!
//! Three session locks, always taken in this order:
//!
//! 1. `write_excl` or `read_excl`, held for a whole `write` or `read` call
//!    (release takes both, write first)
//! 2. `state`, held only for bookkeeping and dropped before any sleep
//! 3. the device lock, taken inside the state lock to fold completions
//!
//! Event locks are leaves below all of them.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::combo::ComboBuffer;
use crate::descriptor::AesCommand;
use crate::device::Device;
use crate::dma::{DmaBuffer, HwRange};
use crate::error::{AesError, AesResult};
use crate::event::{lock, Event};
use crate::mode::{CipherMode, ControlOp, BLOCK_SIZE, KEY_SIZE};
use crate::task::{SessionId, Task};

/// Size of the key/state scratch block: key, then chaining value.
pub const SCRATCH_SIZE: usize = KEY_SIZE + BLOCK_SIZE;

bitflags! {
    /// Per-call I/O flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// Fail with [`AesError::WouldBlock`] instead of sleeping for data
        /// or buffer space.
        const NONBLOCK = 1 << 0;
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Opened, no cipher mode selected yet.
    Open = 0,
    /// A mode is selected; I/O is allowed.
    Active = 1,
    /// Release has started; every call fails.
    Closing = 2,
    /// Buffers freed.
    Closed = 3,
}

impl Lifecycle {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Snapshot of a session's buffer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub capacity: usize,
    /// Encrypted bytes ready to read.
    pub read_count: usize,
    /// Bytes written and not yet encrypted-and-read.
    pub write_count: usize,
    /// Bytes owned by submitted device tasks.
    pub in_flight: usize,
}

struct SessionBuffers {
    combo: ComboBuffer,
    /// Key at 0..16, chaining value at 16..32. Read by the device while
    /// any of this session's tasks is outstanding.
    scratch: DmaBuffer,
}

struct SessionState {
    mode: Option<CipherMode>,
    buffers: Option<SessionBuffers>,
}

/// One open cipher stream on a [`Device`].
pub struct Session {
    id: SessionId,
    device: Arc<Device>,
    lifecycle: AtomicU8,
    /// Bumped by [`Session::interrupt`]; waits compare against their
    /// value at entry.
    interrupts: AtomicU64,
    read_excl: Mutex<()>,
    write_excl: Mutex<()>,
    state: Mutex<SessionState>,
    data_ready: Arc<Event>,
    space_ready: Event,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a session, allocating its combo and scratch buffers.
    ///
    /// # Errors
    ///
    /// - [`AesError::DeviceRemoved`] if the device has been removed
    /// - [`AesError::DmaAllocation`] if either buffer cannot be allocated
    pub fn open(device: Arc<Device>) -> AesResult<Self> {
        if device.is_removed() {
            return Err(AesError::DeviceRemoved);
        }
        let combo = ComboBuffer::new(device.dma().alloc(device.config().buffer_capacity)?);
        let scratch = device.dma().alloc(SCRATCH_SIZE)?;
        let id = device.session_opened()?;
        log::debug!("session {id} opened");

        Ok(Self {
            id,
            device,
            lifecycle: AtomicU8::new(Lifecycle::Open as u8),
            interrupts: AtomicU64::new(0),
            read_excl: Mutex::new(()),
            write_excl: Mutex::new(()),
            state: Mutex::new(SessionState {
                mode: None,
                buffers: Some(SessionBuffers { combo, scratch }),
            }),
            data_ready: Arc::new(Event::new()),
            space_ready: Event::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Currently selected mode.
    pub fn mode(&self) -> Option<CipherMode> {
        lock(&self.state).mode
    }

    /// Buffer counters after folding completed tasks.
    pub fn stats(&self) -> BufferStats {
        let mut state = lock(&self.state);
        self.fold(&mut state);
        state
            .buffers
            .as_ref()
            .map_or_else(BufferStats::default, |b| BufferStats {
                capacity: b.combo.capacity(),
                read_count: b.combo.read_count(),
                write_count: b.combo.write_count(),
                in_flight: b.combo.in_flight(),
            })
    }

    #[inline]
    fn is_closing(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Closing | Lifecycle::Closed)
    }

    fn check_open(&self) -> AesResult<()> {
        if self.is_closing() {
            Err(AesError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Abort condition for a blocking call starting now: the session began
    /// closing, or [`Session::interrupt`] was called since.
    fn abort_check(&self) -> impl Fn() -> AesResult<()> + '_ {
        let epoch = self.interrupts.load(Ordering::SeqCst);
        move || {
            self.check_open()?;
            if self.interrupts.load(Ordering::SeqCst) != epoch {
                return Err(AesError::Interrupted);
            }
            Ok(())
        }
    }

    fn check_mode(state: &SessionState) -> AesResult<CipherMode> {
        state
            .mode
            .ok_or(AesError::InvalidState("no cipher mode selected"))
    }

    fn buffers(state: &mut SessionState) -> AesResult<&mut SessionBuffers> {
        state.buffers.as_mut().ok_or(AesError::SessionClosed)
    }

    /// Move this session's completed tasks into the ready segment.
    fn fold(&self, state: &mut SessionState) {
        if let Some(buffers) = state.buffers.as_mut() {
            let combo = &mut buffers.combo;
            self.device
                .drain_completed(self.id, |task| combo.reclaim_completed(task.range));
        }
    }

    /// Make every wait that is currently in progress (or starts before it
    /// observes this call) return [`AesError::Interrupted`].
    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.data_ready.signal();
        self.space_ready.signal();
        self.device.wake_slot_waiters();
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Read up to `buf.len()` processed bytes.
    ///
    /// Blocks until at least one byte is ready unless `flags` has
    /// [`IoFlags::NONBLOCK`]. An empty `buf` returns `Ok(0)` at once.
    ///
    /// # Errors
    ///
    /// - [`AesError::SessionClosed`] if the session is closing
    /// - [`AesError::InvalidState`] if no mode was selected
    /// - [`AesError::WouldBlock`] if non-blocking and nothing is ready
    /// - [`AesError::Interrupted`] if the wait was interrupted
    pub fn read(&self, buf: &mut [u8], flags: IoFlags) -> AesResult<usize> {
        self.check_open()?;
        let abort = self.abort_check();
        let _excl = lock(&self.read_excl);
        let mut state = lock(&self.state);

        loop {
            abort()?;
            Self::check_mode(&state)?;
            let seen = self.data_ready.generation();
            self.fold(&mut state);
            if buf.is_empty() || Self::buffers(&mut state)?.combo.read_count() > 0 {
                break;
            }
            if flags.contains(IoFlags::NONBLOCK) {
                return Err(AesError::WouldBlock);
            }
            drop(state);
            self.data_ready.wait_past(seen, &abort)?;
            state = lock(&self.state);
        }

        let copied = Self::buffers(&mut state)?.combo.take_for_read(buf);
        drop(state);
        self.space_ready.signal();
        Ok(copied)
    }

    /// Write bytes for processing.
    ///
    /// Copies as much of `buf` as fits contiguously into the session buffer
    /// and hands every whole block to the device. Short counts are normal;
    /// the caller loops. A trailing partial block waits for the next write.
    ///
    /// With [`IoFlags::NONBLOCK`] the call never sleeps: neither for buffer
    /// space nor for a ring slot.
    ///
    /// # Errors
    ///
    /// As for [`Session::read`]. A write that is interrupted, closing, or
    /// non-blocking with the ring full withdraws every byte it appended
    /// that did not reach the device; if some did, their count is returned
    /// instead of the error.
    pub fn write(&self, buf: &[u8], flags: IoFlags) -> AesResult<usize> {
        self.check_open()?;
        let abort = self.abort_check();
        let _excl = lock(&self.write_excl);
        let mut state = lock(&self.state);

        loop {
            abort()?;
            Self::check_mode(&state)?;
            if buf.is_empty() {
                return Ok(0);
            }
            let seen = self.space_ready.generation();
            if Self::buffers(&mut state)?.combo.free() > 0 {
                break;
            }
            if flags.contains(IoFlags::NONBLOCK) {
                return Err(AesError::WouldBlock);
            }
            drop(state);
            self.space_ready.wait_past(seen, &abort)?;
            state = lock(&self.state);
        }

        let mode = Self::check_mode(&state)?;
        let buffers = Self::buffers(&mut state)?;
        let copied = buffers.combo.append(buf);
        let scratch = buffers.scratch.bus_addr();

        let mut claims = Vec::new();
        while let Some(range) = buffers.combo.claim_for_task() {
            let data = buffers.combo.bus_addr_of(&range);
            claims.push((range, data));
        }
        drop(state);

        let nonblock = flags.contains(IoFlags::NONBLOCK);
        let mut pending = claims.into_iter();
        while let Some((range, data)) = pending.next() {
            let reservation = match self.device.reserve_slot(nonblock, &abort) {
                Ok(reservation) => reservation,
                Err(e) => {
                    let unsubmitted =
                        std::iter::once(range).chain(pending.map(|(range, _)| range));
                    return self.roll_back_write(unsubmitted.collect(), copied, e);
                }
            };
            let blocks = (range.len() / BLOCK_SIZE) as u32;
            let cmd = AesCommand::in_place(data, scratch, blocks, mode);
            reservation.submit(
                cmd,
                Task {
                    session: self.id,
                    range,
                    blocks,
                    data_ready: Arc::clone(&self.data_ready),
                },
            );
        }

        Ok(copied)
    }

    /// Undo the unsubmitted part of a write that could not get a slot.
    fn roll_back_write(
        &self,
        unsubmitted: Vec<HwRange>,
        copied: usize,
        error: AesError,
    ) -> AesResult<usize> {
        let mut state = lock(&self.state);
        let Some(buffers) = state.buffers.as_mut() else {
            return Err(error);
        };
        // Claims are undone newest first.
        for range in unsubmitted.into_iter().rev() {
            buffers.combo.unclaim(range);
        }
        let withdrawn = buffers.combo.unappend(copied);
        let accepted = copied - withdrawn;
        if accepted == 0 || matches!(error, AesError::SessionClosed) {
            return Err(error);
        }
        Ok(accepted)
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Select `mode` with `key` and, for chaining modes, `iv`.
    ///
    /// Waits for this session's outstanding tasks first, since the device
    /// reads the key and chaining value while they run. Buffered bytes are
    /// kept; every byte submitted afterwards uses the new mode.
    ///
    /// # Errors
    ///
    /// - [`AesError::InvalidArgument`] if a chaining mode has no `iv`
    /// - [`AesError::SessionClosed`] if the session is closing
    /// - [`AesError::Interrupted`] if the drain wait was interrupted
    pub fn set_mode(
        &self,
        mode: CipherMode,
        key: &[u8; KEY_SIZE],
        iv: Option<&[u8; BLOCK_SIZE]>,
    ) -> AesResult<()> {
        if mode.has_state() && iv.is_none() {
            return Err(AesError::InvalidArgument(format!("{} needs an IV", mode.name())));
        }
        self.check_open()?;
        let abort = self.abort_check();
        let _excl = lock(&self.write_excl);
        let mut state = self.drain_in_flight(&abort)?;

        let buffers = Self::buffers(&mut state)?;
        // SAFETY: none of this session's tasks is outstanding, so the device
        // is not reading the scratch block.
        unsafe {
            buffers.scratch.write_at(0, key);
            if let Some(iv) = iv {
                buffers.scratch.write_at(KEY_SIZE, iv);
            }
        }
        state.mode = Some(mode);
        let _ = self.lifecycle.compare_exchange(
            Lifecycle::Open as u8,
            Lifecycle::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        log::debug!("session {} mode {mode}", self.id);
        Ok(())
    }

    /// Wait until none of this session's tasks is outstanding and return
    /// the state lock.
    fn drain_in_flight<F>(&self, abort: &F) -> AesResult<MutexGuard<'_, SessionState>>
    where
        F: Fn() -> AesResult<()>,
    {
        let mut state = lock(&self.state);
        loop {
            abort()?;
            let seen = self.data_ready.generation();
            self.fold(&mut state);
            if Self::buffers(&mut state)?.combo.in_flight() == 0 {
                return Ok(state);
            }
            drop(state);
            self.data_ready.wait_past(seen, abort)?;
            state = lock(&self.state);
        }
    }

    /// Current chaining value.
    ///
    /// # Errors
    ///
    /// [`AesError::InvalidState`] unless a chaining mode is selected and
    /// nothing is buffered, since otherwise the value is still changing.
    pub fn chaining_state(&self) -> AesResult<[u8; BLOCK_SIZE]> {
        self.check_open()?;
        let mut state = lock(&self.state);
        let mode = Self::check_mode(&state)?;
        if !mode.has_state() {
            return Err(AesError::InvalidState("mode has no chaining state"));
        }
        self.fold(&mut state);
        let buffers = Self::buffers(&mut state)?;
        if buffers.combo.write_count() != 0 || buffers.combo.read_count() != 0 {
            return Err(AesError::InvalidState("chaining state read mid-stream"));
        }
        let mut out = [0u8; BLOCK_SIZE];
        // SAFETY: write_count is zero, so no task of this session is running.
        unsafe { buffers.scratch.read_at(KEY_SIZE, &mut out) };
        Ok(out)
    }

    /// Run a control operation with its raw argument buffer.
    ///
    /// `SetMode` reads the key (and IV) from `arg`; `GetState` fills it.
    ///
    /// # Errors
    ///
    /// [`AesError::BufferSizeMismatch`] if `arg` is not exactly
    /// [`ControlOp::arg_len`] bytes, otherwise as for the operation.
    pub fn control(&self, op: ControlOp, arg: &mut [u8]) -> AesResult<()> {
        let expected = op.arg_len();
        if arg.len() != expected {
            return Err(AesError::BufferSizeMismatch {
                expected,
                actual: arg.len(),
            });
        }
        match op {
            ControlOp::SetMode(mode) => {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(&arg[..KEY_SIZE]);
                let mut iv = [0u8; BLOCK_SIZE];
                let iv = if mode.has_state() {
                    iv.copy_from_slice(&arg[KEY_SIZE..]);
                    Some(&iv)
                } else {
                    None
                };
                self.set_mode(mode, &key, iv)
            }
            ControlOp::GetState => {
                arg.copy_from_slice(&self.chaining_state()?);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Close the session.
    ///
    /// Marks it closing, wakes every blocked call, waits for all other
    /// calls to leave, waits for every outstanding task to complete and
    /// only then frees the buffers. Calling it again is a no-op.
    pub fn release(&self) {
        {
            let _state = lock(&self.state);
            if self.is_closing() {
                return;
            }
            self.lifecycle
                .store(Lifecycle::Closing as u8, Ordering::SeqCst);
        }

        self.data_ready.signal();
        self.space_ready.signal();
        self.device.wake_slot_waiters();

        let _write = lock(&self.write_excl);
        let _read = lock(&self.read_excl);
        let mut state = lock(&self.state);
        loop {
            let seen = self.data_ready.generation();
            self.fold(&mut state);
            let in_flight = state.buffers.as_ref().map_or(0, |b| b.combo.in_flight());
            if in_flight == 0 {
                break;
            }
            log::debug!("session {} closing, {in_flight} byte(s) in flight", self.id);
            drop(state);
            // Not cancellable: the buffers stay DMA targets until drained.
            let _ = self.data_ready.wait_past(seen, || Ok(()));
            state = lock(&self.state);
        }

        state.buffers = None;
        self.lifecycle
            .store(Lifecycle::Closed as u8, Ordering::SeqCst);
        drop(state);
        self.device.session_closed();
        log::debug!("session {} released", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}
