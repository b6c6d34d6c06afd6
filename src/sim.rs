// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of the accelerator.
//!
//! [`SimulatedAccelerator`] implements [`Platform`] with a register file, a
//! DMA pool and a worker thread that plays the device: while `ENABLE` has
//! both units on it fetches commands from `CMD_READ_PTR` up to
//! `CMD_WRITE_PTR`, runs AES-128 over the referenced blocks, saves the
//! chaining value when asked, advances the read pointer (wrapping from
//! `CMD_END_PTR` to `CMD_BEGIN_PTR`), raises the command's interrupt bits
//! and calls the installed handler.
//!
//! The DMA pool only keeps weak references to the memory it hands out. A
//! command that touches memory whose owner already dropped it counts as a
//! DMA fault instead of touching freed memory.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::descriptor::{AesCommand, COMMAND_SIZE};
use crate::dma::{BusAddr, DmaAllocator, DmaBuffer, DmaMemory};
use crate::error::{AesError, AesResult};
use crate::event::{lock, wait};
use crate::mode::{CipherMode, BLOCK_SIZE, KEY_SIZE};
use crate::platform::{IrqHandler, IrqReturn, Platform};
use crate::regs::{
    EngineFlags, Registers, BAR0_SIZE, CMD_BEGIN_PTR, CMD_END_PTR, CMD_READ_PTR, CMD_WRITE_PTR,
    ENABLE, INTR, INTR_ENABLE, STATUS, XFER_IN_PTR, XFER_OUT_PTR, XFER_STATE_PTR, XFER_TASK,
};

/// First bus address handed out by the DMA pool.
const DMA_BASE: BusAddr = 0x0010_0000;

/// Bus-address granularity of the DMA pool.
const DMA_PAGE: usize = 4096;

/// Software accelerator settings.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Time the worker spends on each command before completing it.
    pub latency: Duration,
    /// Start with command processing paused (see [`SimulatedAccelerator::resume`]).
    pub start_paused: bool,
    /// Total bytes of DMA memory that may be live at once.
    pub dma_budget: Option<usize>,
    /// Refuse [`Platform::request_irq`].
    pub irq_unavailable: bool,
}

impl SimConfig {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn paused(mut self) -> Self {
        self.start_paused = true;
        self
    }

    pub fn with_dma_budget(mut self, bytes: usize) -> Self {
        self.dma_budget = Some(bytes);
        self
    }

    pub fn without_irq(mut self) -> Self {
        self.irq_unavailable = true;
        self
    }
}

// ============================================================================
// DMA pool
// ============================================================================

struct PoolInner {
    next_bus: BusAddr,
    regions: BTreeMap<BusAddr, Weak<DmaMemory>>,
}

/// DMA allocator that can translate bus addresses back to memory.
pub struct SimDmaPool {
    inner: Mutex<PoolInner>,
    budget: Option<usize>,
}

impl SimDmaPool {
    fn new(budget: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                next_bus: DMA_BASE,
                regions: BTreeMap::new(),
            }),
            budget,
        }
    }

    /// Live memory containing `[bus, bus + len)` and the offset of `bus`.
    fn resolve(&self, bus: BusAddr, len: usize) -> Option<(Arc<DmaMemory>, usize)> {
        let inner = lock(&self.inner);
        let (&base, weak) = inner.regions.range(..=bus).next_back()?;
        let mem = weak.upgrade()?;
        let offset = (bus - base) as usize;
        (offset + len <= mem.len()).then_some((mem, offset))
    }

    fn read(&self, bus: BusAddr, dst: &mut [u8]) -> bool {
        match self.resolve(bus, dst.len()) {
            // SAFETY: the driver hands the range to the device for the
            // duration of the command.
            Some((mem, offset)) => {
                unsafe { mem.read_at(offset, dst) };
                true
            }
            None => false,
        }
    }

    fn write(&self, bus: BusAddr, src: &[u8]) -> bool {
        match self.resolve(bus, src.len()) {
            // SAFETY: as for `read`.
            Some((mem, offset)) => {
                unsafe { mem.write_at(offset, src) };
                true
            }
            None => false,
        }
    }

    /// Bytes currently allocated and alive.
    pub fn live_bytes(&self) -> usize {
        let inner = lock(&self.inner);
        inner
            .regions
            .values()
            .filter_map(Weak::upgrade)
            .map(|mem| mem.len())
            .sum()
    }
}

impl DmaAllocator for SimDmaPool {
    fn alloc(&self, len: usize) -> AesResult<DmaBuffer> {
        let used = self.live_bytes();
        let mut inner = lock(&self.inner);
        inner.regions.retain(|_, weak| weak.strong_count() > 0);

        if self.budget.is_some_and(|budget| used + len > budget) {
            return Err(AesError::DmaAllocation { len });
        }

        let bus = inner.next_bus;
        let next = u32::try_from(len.div_ceil(DMA_PAGE) * DMA_PAGE)
            .ok()
            .and_then(|span| bus.checked_add(span))
            .ok_or(AesError::DmaAllocation { len })?;

        let buf = DmaBuffer::from_memory(DmaMemory::new(len, bus)?);
        inner.regions.insert(bus, buf.downgrade());
        inner.next_bus = next;
        Ok(buf)
    }
}

// ============================================================================
// Register file and worker
// ============================================================================

struct RegFile {
    enable: u32,
    intr: u32,
    intr_enable: u32,
    begin: BusAddr,
    end: BusAddr,
    read: BusAddr,
    write: BusAddr,
    /// Key/data/state and transfer registers.
    misc: [u32; BAR0_SIZE / 4],
    busy: bool,
    paused: bool,
    shutdown: bool,
}

impl RegFile {
    fn running(&self) -> bool {
        EngineFlags::from_bits_truncate(self.enable).contains(EngineFlags::RUNNING)
    }

    fn has_work(&self) -> bool {
        self.running() && !self.paused && self.read != self.write
    }
}

fn misc_index(offset: u32) -> usize {
    let index = offset as usize / 4;
    assert!(
        offset % 4 == 0 && index < BAR0_SIZE / 4,
        "register offset {offset:#x} outside window"
    );
    index
}

struct SimShared {
    regs: Mutex<RegFile>,
    wake: Condvar,
    pool: Arc<SimDmaPool>,
    handler: Mutex<Option<Arc<IrqHandler>>>,
    irq_unavailable: bool,
    latency: Duration,
    dma_faults: AtomicU64,
    commands_completed: AtomicU64,
}

impl Registers for SimShared {
    fn read32(&self, offset: u32) -> u32 {
        let regs = lock(&self.regs);
        match offset {
            ENABLE => regs.enable,
            STATUS => {
                if regs.busy || regs.has_work() {
                    regs.enable
                } else {
                    0
                }
            }
            INTR => regs.intr,
            INTR_ENABLE => regs.intr_enable,
            CMD_BEGIN_PTR => regs.begin,
            CMD_END_PTR => regs.end,
            CMD_READ_PTR => regs.read,
            CMD_WRITE_PTR => regs.write,
            _ => regs.misc[misc_index(offset)],
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut regs = lock(&self.regs);
        match offset {
            ENABLE => regs.enable = value & EngineFlags::RUNNING.bits(),
            STATUS => {}
            INTR => regs.intr &= !value,
            INTR_ENABLE => regs.intr_enable = value,
            CMD_BEGIN_PTR => regs.begin = value,
            CMD_END_PTR => regs.end = value,
            CMD_READ_PTR => regs.read = value,
            CMD_WRITE_PTR => regs.write = value,
            _ => regs.misc[misc_index(offset)] = value,
        }
        self.wake.notify_all();
    }
}

impl SimShared {
    fn fault(&self, what: &str, bus: BusAddr) {
        self.dma_faults.fetch_add(1, Ordering::SeqCst);
        log::warn!("DMA fault: {what} at {bus:#x} does not name live memory");
    }

    fn run(self: Arc<Self>) {
        loop {
            let (cmd_ptr, begin, end) = {
                let mut regs = lock(&self.regs);
                while !regs.has_work() {
                    if regs.shutdown {
                        return;
                    }
                    regs = wait(&self.wake, regs);
                }
                if regs.shutdown {
                    return;
                }
                regs.busy = true;
                (regs.read, regs.begin, regs.end)
            };

            if cmd_ptr < begin || cmd_ptr >= end {
                log::warn!("command read pointer {cmd_ptr:#x} outside ring, engine stopped");
                let mut regs = lock(&self.regs);
                regs.enable = 0;
                regs.busy = false;
                continue;
            }

            if !self.latency.is_zero() {
                thread::sleep(self.latency);
            }
            let intr = self.execute(cmd_ptr);
            self.commands_completed.fetch_add(1, Ordering::SeqCst);

            let fire = {
                let mut regs = lock(&self.regs);
                let next = cmd_ptr + COMMAND_SIZE as BusAddr;
                regs.read = if next >= end { begin } else { next };
                regs.intr |= u32::from(intr);
                regs.busy = false;
                regs.intr & regs.intr_enable != 0
            };

            if fire {
                let handler = lock(&self.handler).clone();
                if let Some(handler) = handler {
                    if (**handler)() == IrqReturn::None {
                        log::warn!("interrupt {intr:#04x} not claimed by the driver");
                    }
                }
            }
        }
    }

    /// Run one command. Returns its interrupt-select bits.
    fn execute(&self, cmd_ptr: BusAddr) -> u8 {
        let mut raw = [0u8; COMMAND_SIZE];
        if !self.pool.read(cmd_ptr, &mut raw) {
            self.fault("command", cmd_ptr);
            return 0;
        }
        let cmd = AesCommand::from_bytes(&raw);
        {
            let mut regs = lock(&self.regs);
            regs.misc[misc_index(XFER_IN_PTR)] = cmd.in_ptr;
            regs.misc[misc_index(XFER_OUT_PTR)] = cmd.out_ptr;
            regs.misc[misc_index(XFER_STATE_PTR)] = cmd.state_ptr;
            regs.misc[misc_index(XFER_TASK)] = cmd.task.bits();
        }

        let mut key_state = [0u8; KEY_SIZE + BLOCK_SIZE];
        if !self.pool.read(cmd.state_ptr, &mut key_state) {
            self.fault("key/state", cmd.state_ptr);
            return cmd.task.intr();
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&key_state[..KEY_SIZE]);
        let mut state = [0u8; BLOCK_SIZE];
        state.copy_from_slice(&key_state[KEY_SIZE..]);
        let cipher = Aes128::new(&key.into());

        let mode = cmd.task.mode();
        for i in 0..cmd.task.count() {
            let step = i * BLOCK_SIZE as BusAddr;
            let mut block = [0u8; BLOCK_SIZE];
            if !self.pool.read(cmd.in_ptr + step, &mut block) {
                self.fault("input", cmd.in_ptr + step);
                break;
            }
            apply_block(mode, &cipher, &mut state, &mut block);
            if !self.pool.write(cmd.out_ptr + step, &block) {
                self.fault("output", cmd.out_ptr + step);
                break;
            }
        }

        let state_ptr = cmd.state_ptr + KEY_SIZE as BusAddr;
        if cmd.task.save() && !self.pool.write(state_ptr, &state) {
            self.fault("state save", state_ptr);
        }
        cmd.task.intr()
    }
}

/// Process one block in place under `mode`, updating the chaining value.
pub fn apply_block(
    mode: CipherMode,
    cipher: &Aes128,
    state: &mut [u8; BLOCK_SIZE],
    block: &mut [u8; BLOCK_SIZE],
) {
    let encrypt = |input: [u8; BLOCK_SIZE]| {
        let mut b = Block::from(input);
        cipher.encrypt_block(&mut b);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&b);
        out
    };
    let decrypt = |input: [u8; BLOCK_SIZE]| {
        let mut b = Block::from(input);
        cipher.decrypt_block(&mut b);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&b);
        out
    };
    let xor = |a: [u8; BLOCK_SIZE], b: [u8; BLOCK_SIZE]| {
        let mut out = a;
        out.iter_mut().zip(b).for_each(|(x, y)| *x ^= y);
        out
    };

    let input = *block;
    match mode {
        CipherMode::EcbEncrypt => *block = encrypt(input),
        CipherMode::EcbDecrypt => *block = decrypt(input),
        CipherMode::CbcEncrypt => {
            *block = encrypt(xor(input, *state));
            *state = *block;
        }
        CipherMode::CbcDecrypt => {
            *block = xor(decrypt(input), *state);
            *state = input;
        }
        CipherMode::CfbEncrypt => {
            *block = xor(input, encrypt(*state));
            *state = *block;
        }
        CipherMode::CfbDecrypt => {
            *block = xor(input, encrypt(*state));
            *state = input;
        }
        CipherMode::Ofb => {
            *state = encrypt(*state);
            *block = xor(input, *state);
        }
        CipherMode::Ctr => {
            *block = xor(input, encrypt(*state));
            *state = u128::from_be_bytes(*state).wrapping_add(1).to_be_bytes();
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Software accelerator with its own worker thread.
pub struct SimulatedAccelerator {
    shared: Arc<SimShared>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedAccelerator {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`AesError::Io`] if the thread cannot be spawned.
    pub fn new(config: SimConfig) -> AesResult<Self> {
        let shared = Arc::new(SimShared {
            regs: Mutex::new(RegFile {
                enable: 0,
                intr: 0,
                intr_enable: 0,
                begin: 0,
                end: 0,
                read: 0,
                write: 0,
                misc: [0; BAR0_SIZE / 4],
                busy: false,
                paused: config.start_paused,
                shutdown: false,
            }),
            wake: Condvar::new(),
            pool: Arc::new(SimDmaPool::new(config.dma_budget)),
            handler: Mutex::new(None),
            irq_unavailable: config.irq_unavailable,
            latency: config.latency,
            dma_faults: AtomicU64::new(0),
            commands_completed: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("aesdev-sim".to_string())
                .spawn(move || shared.run())?
        };
        log::info!("software accelerator started ({config:?})");

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Stop fetching commands after the current one.
    pub fn pause(&self) {
        lock(&self.shared.regs).paused = true;
    }

    /// Resume fetching commands.
    pub fn resume(&self) {
        lock(&self.shared.regs).paused = false;
        self.shared.wake.notify_all();
    }

    /// Commands that referenced memory no longer alive.
    pub fn dma_faults(&self) -> u64 {
        self.shared.dma_faults.load(Ordering::SeqCst)
    }

    /// Commands executed since start.
    pub fn commands_completed(&self) -> u64 {
        self.shared.commands_completed.load(Ordering::SeqCst)
    }

    /// The DMA pool backing [`Platform::dma`].
    pub fn pool(&self) -> &SimDmaPool {
        &self.shared.pool
    }
}

impl Platform for SimulatedAccelerator {
    fn registers(&self) -> Arc<dyn Registers> {
        self.shared.clone()
    }

    fn dma(&self) -> Arc<dyn DmaAllocator> {
        self.shared.pool.clone()
    }

    fn request_irq(&self, handler: IrqHandler) -> AesResult<()> {
        let mut slot = lock(&self.shared.handler);
        if self.shared.irq_unavailable || slot.is_some() {
            return Err(AesError::IrqUnavailable);
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    fn free_irq(&self) {
        lock(&self.shared.handler).take();
    }
}

impl Drop for SimulatedAccelerator {
    fn drop(&mut self) {
        lock(&self.shared.regs).shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            // The last reference may be released by the handler on the
            // worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
