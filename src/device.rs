// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! One accelerator: its command ring, completed tasks and interrupt path.
//!
//! # Locking
//!
//! The device lock protects the ring bookkeeping and the completed list. It
//! is shared by the interrupt path and every session, so nothing sleeps
//! while holding it except [`Device::reserve_slot`], which waits on the
//! `slot_ready` condition (releasing the lock while asleep). Session locks
//! are always taken before the device lock, and event locks after it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crate::config::DeviceConfig;
use crate::descriptor::{AesCommand, COMMAND_SIZE};
use crate::dma::DmaAllocator;
use crate::error::{AesError, AesResult};
use crate::event::{lock, wait};
use crate::platform::{IrqReturn, Platform};
use crate::regs::{
    EngineFlags, Registers, CMD_BEGIN_PTR, CMD_END_PTR, CMD_READ_PTR, CMD_WRITE_PTR, ENABLE,
    INTR, INTR_ENABLE, INTR_MASK,
};
use crate::ring::{CommandRing, RingSlot};
use crate::task::{SessionId, Task};

struct DeviceInner {
    ring: CommandRing,
    /// Retired tasks not yet folded back by their session, in completion order.
    completed: VecDeque<Task>,
}

/// A probed accelerator shared by all of its sessions.
pub struct Device {
    platform: Arc<dyn Platform>,
    regs: Arc<dyn Registers>,
    dma: Arc<dyn DmaAllocator>,
    config: DeviceConfig,
    inner: Mutex<DeviceInner>,
    slot_ready: Condvar,
    open_sessions: AtomicUsize,
    next_session: AtomicU64,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("open_sessions", &self.open_sessions())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Bring up the accelerator behind `platform`.
    ///
    /// Allocates the command ring, programs the ring pointers, clears and
    /// unmasks the ring interrupts, installs the interrupt handler and
    /// starts the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the ring cannot be
    /// allocated or the interrupt line cannot be requested. The engine is
    /// left stopped in every error case.
    pub fn probe(platform: Arc<dyn Platform>, config: DeviceConfig) -> AesResult<Arc<Self>> {
        config.validate()?;

        let regs = platform.registers();
        let dma = platform.dma();

        regs.write32(ENABLE, 0);
        let stop_engine = scopeguard::guard(Arc::clone(&regs), |regs| {
            regs.write32(INTR_ENABLE, 0);
            regs.write32(ENABLE, 0);
        });

        let ring = CommandRing::new(dma.alloc(config.ring_slots * COMMAND_SIZE)?);
        regs.write32(CMD_BEGIN_PTR, ring.begin_ptr());
        regs.write32(CMD_END_PTR, ring.end_ptr());
        regs.write32(CMD_READ_PTR, ring.begin_ptr());
        regs.write32(CMD_WRITE_PTR, ring.begin_ptr());
        regs.write32(INTR, INTR_MASK);

        let device = Arc::new(Self {
            platform: Arc::clone(&platform),
            regs: Arc::clone(&regs),
            dma,
            config,
            inner: Mutex::new(DeviceInner {
                ring,
                completed: VecDeque::new(),
            }),
            slot_ready: Condvar::new(),
            open_sessions: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&device);
        let installed = platform.request_irq(Box::new(move || match weak.upgrade() {
            Some(device) => device.handle_interrupt(),
            None => IrqReturn::None,
        }));
        if let Err(e) = installed {
            // Nothing to free; keep Drop from releasing a line we never got.
            device.stopped.store(true, Ordering::SeqCst);
            return Err(e);
        }

        regs.write32(INTR_ENABLE, INTR_MASK);
        regs.write32(ENABLE, EngineFlags::RUNNING.bits());
        scopeguard::ScopeGuard::into_inner(stop_engine);

        log::info!(
            "accelerator up: {} ring slots, {}-byte session buffers",
            config.ring_slots,
            config.buffer_capacity
        );
        Ok(device)
    }

    /// Configuration the device was probed with.
    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn dma(&self) -> &dyn DmaAllocator {
        &*self.dma
    }

    /// Interrupt entry point.
    ///
    /// Clears the signaled bits, retires every command before the device's
    /// read pointer, moves the retired tasks to the completed list, wakes
    /// their sessions and then wakes every thread waiting for a ring slot.
    /// Returns [`IrqReturn::None`] if no ring interrupt was pending.
    pub fn handle_interrupt(&self) -> IrqReturn {
        let pending = self.regs.read32(INTR) & INTR_MASK;
        log::trace!("interrupt scan: pending {pending:#04x}");
        if pending == 0 {
            return IrqReturn::None;
        }
        // Clear before sampling the read pointer: a completion after the
        // sample raises a fresh interrupt.
        self.regs.write32(INTR, pending);

        {
            let mut inner = lock(&self.inner);
            let read_ptr = self.regs.read32(CMD_READ_PTR);
            let write_ptr = self.regs.read32(CMD_WRITE_PTR);
            let DeviceInner { ring, completed } = &mut *inner;
            ring.retire(read_ptr, write_ptr, |task| {
                let data_ready = Arc::clone(&task.data_ready);
                completed.push_back(task);
                data_ready.signal();
            });
        }
        self.slot_ready.notify_all();
        IrqReturn::Handled
    }

    /// Wait for a free ring slot, or fail with [`AesError::WouldBlock`]
    /// at once when `nonblock` is set and the ring is full.
    ///
    /// `abort` is checked under the device lock before every wait; its
    /// error is returned as-is. The returned reservation keeps the device
    /// locked until it is submitted or dropped.
    pub(crate) fn reserve_slot<F>(&self, nonblock: bool, abort: F) -> AesResult<SlotReservation<'_>>
    where
        F: Fn() -> AesResult<()>,
    {
        let mut inner = lock(&self.inner);
        loop {
            abort()?;
            if let Some(slot) = inner.ring.reserve() {
                return Ok(SlotReservation {
                    device: self,
                    inner,
                    slot,
                });
            }
            if nonblock {
                return Err(AesError::WouldBlock);
            }
            inner = wait(&self.slot_ready, inner);
        }
    }

    /// Wake every thread in [`Device::reserve_slot`] so it re-checks its
    /// abort condition.
    pub(crate) fn wake_slot_waiters(&self) {
        let _inner = lock(&self.inner);
        self.slot_ready.notify_all();
    }

    /// Hand every completed task of `session` to `fold`, oldest first.
    pub(crate) fn drain_completed<F>(&self, session: SessionId, mut fold: F)
    where
        F: FnMut(Task),
    {
        let mut inner = lock(&self.inner);
        let mut i = 0;
        while i < inner.completed.len() {
            if inner.completed[i].session != session {
                i += 1;
                continue;
            }
            if let Some(task) = inner.completed.remove(i) {
                fold(task);
            }
        }
    }

    /// Count a new session, unless the device has been removed.
    ///
    /// Runs under the device lock, as does the open-session check in
    /// [`Device::remove`], so a session is either counted before removal
    /// (and removal panics) or refused.
    pub(crate) fn session_opened(&self) -> AesResult<SessionId> {
        let _inner = lock(&self.inner);
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AesError::DeviceRemoved);
        }
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn session_closed(&self) {
        let prev = self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "session count underflow");
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    /// Ring slots holding unretired commands.
    pub fn occupied_slots(&self) -> usize {
        lock(&self.inner).ring.occupied()
    }

    /// Sessions opened and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Commands submitted since probe.
    pub fn tasks_submitted(&self) -> u64 {
        lock(&self.inner).ring.submitted()
    }

    /// Commands retired by the interrupt path since probe.
    pub fn tasks_completed(&self) -> u64 {
        lock(&self.inner).ring.retired()
    }

    /// Take the device away.
    ///
    /// # Panics
    ///
    /// Removing a device with open sessions is unrecoverable: their buffers
    /// may still be DMA targets.
    pub fn remove(&self) {
        let inner = lock(&self.inner);
        let open = self.open_sessions();
        if open != 0 {
            drop(inner);
            log::error!("device removed with {open} open session(s)");
            panic!("device removed with {open} open session(s)");
        }
        let was_stopped = self.stopped.swap(true, Ordering::SeqCst);
        drop(inner);
        if !was_stopped {
            self.stop_engine();
        }
    }

    /// True once the device has been removed or dropped.
    pub fn is_removed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_engine();
        }
    }

    fn stop_engine(&self) {
        self.regs.write32(INTR_ENABLE, 0);
        self.regs.write32(ENABLE, 0);
        self.platform.free_irq();
        log::info!("accelerator stopped");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A reserved ring slot with the device lock held.
pub(crate) struct SlotReservation<'a> {
    device: &'a Device,
    inner: MutexGuard<'a, DeviceInner>,
    slot: RingSlot,
}

impl SlotReservation<'_> {
    /// Write the command and record the task in the same locked section
    /// that reserved the slot.
    pub(crate) fn submit(self, cmd: AesCommand, task: Task) {
        let SlotReservation {
            device,
            mut inner,
            slot,
        } = self;
        log::debug!(
            "session {} submits {} block(s) in slot {}: {}",
            task.session,
            task.blocks,
            slot.index(),
            cmd.task.mode()
        );
        inner.ring.submit(&*device.regs, slot, cmd, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaBuffer, DmaMemory, HwRange};
    use crate::error::AesError;
    use crate::event::Event;
    use crate::mode::CipherMode;
    use crate::platform::IrqHandler;
    use crate::regs::BAR0_SIZE;
    use std::sync::atomic::AtomicU32;

    /// Register file without a device behind it.
    struct FakeRegs([AtomicU32; BAR0_SIZE / 4]);

    impl FakeRegs {
        fn new() -> Self {
            Self(std::array::from_fn(|_| AtomicU32::new(0)))
        }

        fn set(&self, offset: u32, value: u32) {
            self.0[offset as usize / 4].store(value, Ordering::SeqCst);
        }
    }

    impl Registers for FakeRegs {
        fn read32(&self, offset: u32) -> u32 {
            self.0[offset as usize / 4].load(Ordering::SeqCst)
        }

        fn write32(&self, offset: u32, value: u32) {
            if offset == INTR {
                self.0[offset as usize / 4].fetch_and(!value, Ordering::SeqCst);
            } else {
                self.set(offset, value);
            }
        }
    }

    struct HeapDma(AtomicU32);

    impl DmaAllocator for HeapDma {
        fn alloc(&self, len: usize) -> AesResult<DmaBuffer> {
            let bus = self.0.fetch_add(0x1000, Ordering::SeqCst);
            Ok(DmaBuffer::from_memory(DmaMemory::new(len, bus)?))
        }
    }

    struct FakePlatform {
        regs: Arc<FakeRegs>,
        dma: Arc<HeapDma>,
        irq_ok: bool,
        handler: Mutex<Option<IrqHandler>>,
        freed: AtomicBool,
    }

    impl FakePlatform {
        fn new(irq_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                regs: Arc::new(FakeRegs::new()),
                dma: Arc::new(HeapDma(AtomicU32::new(0x10_0000))),
                irq_ok,
                handler: Mutex::new(None),
                freed: AtomicBool::new(false),
            })
        }
    }

    impl Platform for FakePlatform {
        fn registers(&self) -> Arc<dyn Registers> {
            self.regs.clone()
        }

        fn dma(&self) -> Arc<dyn DmaAllocator> {
            self.dma.clone()
        }

        fn request_irq(&self, handler: IrqHandler) -> AesResult<()> {
            if !self.irq_ok {
                return Err(AesError::IrqUnavailable);
            }
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }

        fn free_irq(&self) {
            self.handler.lock().unwrap().take();
            self.freed.store(true, Ordering::SeqCst);
        }
    }

    fn task(session: SessionId, event: &Arc<Event>) -> Task {
        Task {
            session,
            range: HwRange::new(0, 16),
            blocks: 1,
            data_ready: Arc::clone(event),
        }
    }

    fn submit_one(device: &Device, session: SessionId, event: &Arc<Event>) {
        let cmd = AesCommand::in_place(0x4000, 0x5000, 1, CipherMode::EcbEncrypt);
        device
            .reserve_slot(false, || Ok(()))
            .unwrap()
            .submit(cmd, task(session, event));
    }

    #[test]
    fn test_probe_programs_registers() {
        let platform = FakePlatform::new(true);
        let device = Device::probe(platform.clone(), DeviceConfig::default()).unwrap();
        let regs = &platform.regs;

        let begin = regs.read32(CMD_BEGIN_PTR);
        assert_eq!(regs.read32(CMD_END_PTR), begin + 8 * 16);
        assert_eq!(regs.read32(CMD_READ_PTR), begin);
        assert_eq!(regs.read32(CMD_WRITE_PTR), begin);
        assert_eq!(regs.read32(INTR_ENABLE), INTR_MASK);
        assert_eq!(regs.read32(ENABLE), 0x3);
        assert!(platform.handler.lock().unwrap().is_some());

        device.remove();
        assert_eq!(regs.read32(ENABLE), 0);
        assert!(platform.freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_probe_without_irq_leaves_engine_stopped() {
        let platform = FakePlatform::new(false);
        let result = Device::probe(platform.clone(), DeviceConfig::default());
        assert!(matches!(result, Err(AesError::IrqUnavailable)));
        assert_eq!(platform.regs.read32(ENABLE), 0);
        assert_eq!(platform.regs.read32(INTR_ENABLE), 0);
        assert!(!platform.freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_probe_rejects_bad_config() {
        let platform = FakePlatform::new(true);
        let config = DeviceConfig::default().with_ring_slots(1);
        assert!(matches!(
            Device::probe(platform, config),
            Err(AesError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_spurious_interrupt_is_not_ours() {
        let platform = FakePlatform::new(true);
        let device = Device::probe(platform.clone(), DeviceConfig::default()).unwrap();
        assert_eq!(device.handle_interrupt(), IrqReturn::None);

        // Through the installed handler as well.
        let handler = platform.handler.lock().unwrap();
        assert_eq!((handler.as_ref().unwrap())(), IrqReturn::None);
    }

    #[test]
    fn test_interrupt_retires_in_order() {
        let platform = FakePlatform::new(true);
        let device = Device::probe(platform.clone(), DeviceConfig::default()).unwrap();
        let event = Arc::new(Event::new());

        submit_one(&device, 7, &event);
        submit_one(&device, 9, &event);
        submit_one(&device, 7, &event);
        assert_eq!(device.occupied_slots(), 3);
        assert_eq!(device.tasks_submitted(), 3);

        // Device finished the first two commands.
        let begin = platform.regs.read32(CMD_BEGIN_PTR);
        platform.regs.set(CMD_READ_PTR, begin + 32);
        platform.regs.set(INTR, 0x03);

        let seen = event.generation();
        assert_eq!(device.handle_interrupt(), IrqReturn::Handled);
        assert_ne!(event.generation(), seen);
        assert_eq!(platform.regs.read32(INTR), 0);
        assert_eq!(device.occupied_slots(), 1);
        assert_eq!(device.tasks_completed(), 2);

        let mut folded = Vec::new();
        device.drain_completed(7, |t| folded.push(t.session));
        assert_eq!(folded, vec![7]);
        device.drain_completed(9, |t| folded.push(t.session));
        assert_eq!(folded, vec![7, 9]);
        device.drain_completed(9, |_| panic!("already drained"));
    }

    #[test]
    fn test_reserve_slot_abort() {
        let platform = FakePlatform::new(true);
        let config = DeviceConfig::default().with_ring_slots(2);
        let device = Device::probe(platform, config).unwrap();
        let event = Arc::new(Event::new());

        submit_one(&device, 1, &event);
        let result = device.reserve_slot(false, || Err(AesError::Interrupted));
        assert!(matches!(result, Err(AesError::Interrupted)));
    }

    #[test]
    fn test_reserve_slot_waits_for_interrupt() {
        let platform = FakePlatform::new(true);
        let config = DeviceConfig::default().with_ring_slots(2);
        let device = Device::probe(platform.clone(), config).unwrap();
        let event = Arc::new(Event::new());
        submit_one(&device, 1, &event);

        let waiter = {
            let device = Arc::clone(&device);
            let event = Arc::clone(&event);
            std::thread::spawn(move || submit_one(&device, 2, &event))
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        let write = platform.regs.read32(CMD_WRITE_PTR);
        platform.regs.set(CMD_READ_PTR, write);
        platform.regs.set(INTR, 0x01);
        device.handle_interrupt();

        waiter.join().unwrap();
        assert_eq!(device.tasks_submitted(), 2);
    }

    #[test]
    #[should_panic(expected = "open session")]
    fn test_remove_with_open_session_panics() {
        let platform = FakePlatform::new(true);
        let device = Device::probe(platform, DeviceConfig::default()).unwrap();
        device.session_opened().unwrap();
        device.remove();
    }

    #[test]
    fn test_reserve_slot_nonblock_on_full_ring() {
        let platform = FakePlatform::new(true);
        let config = DeviceConfig::default().with_ring_slots(2);
        let device = Device::probe(platform, config).unwrap();
        let event = Arc::new(Event::new());
        submit_one(&device, 1, &event);

        assert!(matches!(
            device.reserve_slot(true, || Ok(())),
            Err(AesError::WouldBlock)
        ));
        assert_eq!(device.tasks_submitted(), 1);
    }

    #[test]
    fn test_no_sessions_after_remove() {
        let platform = FakePlatform::new(true);
        let device = Device::probe(platform.clone(), DeviceConfig::default()).unwrap();
        let id = device.session_opened().unwrap();
        device.session_closed();
        assert_eq!(id, 1);

        device.remove();
        assert!(device.is_removed());
        assert_eq!(platform.regs.read32(ENABLE), 0);
        assert!(matches!(device.session_opened(), Err(AesError::DeviceRemoved)));
        assert_eq!(device.open_sessions(), 0);

        // A second removal is a no-op.
        device.remove();
    }
}
