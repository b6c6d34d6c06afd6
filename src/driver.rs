// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Driver instance: device registry and file-handle entry points.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::{AesError, AesResult};
use crate::mode::ControlOp;
use crate::platform::Platform;
use crate::session::{IoFlags, Session};

/// Handle to an open session, as returned by [`AesDriver::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(u64);

impl FileHandle {
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fh{}", self.0)
    }
}

/// Registry of probed devices and open sessions.
///
/// Devices are addressed by minor number, sessions by [`FileHandle`].
/// Every entry point looks its session up under the registry lock and
/// keeps a strong reference for the duration of the call, so a concurrent
/// [`AesDriver::release`] can never free a session that is still in use.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use aesdev_rust::sim::{SimConfig, SimulatedAccelerator};
/// use aesdev_rust::{AesDriver, CipherMode, ControlOp, DeviceConfig, IoFlags};
///
/// let driver = AesDriver::new();
/// let sim = Arc::new(SimulatedAccelerator::new(SimConfig::default())?);
/// let minor = driver.register(sim, DeviceConfig::default())?;
///
/// let fh = driver.open(minor)?;
/// let mut key = [0u8; 16];
/// driver.ioctl(fh, ControlOp::SetMode(CipherMode::EcbEncrypt).ioctl_number(), &mut key)?;
/// driver.write(fh, &[0u8; 16], IoFlags::empty())?;
/// let mut out = [0u8; 16];
/// driver.read(fh, &mut out, IoFlags::empty())?;
/// driver.release(fh)?;
/// # Ok::<(), aesdev_rust::AesError>(())
/// ```
#[derive(Debug, Default)]
pub struct AesDriver {
    devices: RwLock<BTreeMap<u32, Arc<Device>>>,
    files: RwLock<HashMap<FileHandle, Arc<Session>>>,
    next_minor: AtomicU32,
    next_handle: AtomicU64,
}

impl AesDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe the device behind `platform` and publish it.
    ///
    /// # Errors
    ///
    /// Returns the probe error; nothing is registered in that case.
    pub fn register(&self, platform: Arc<dyn Platform>, config: DeviceConfig) -> AesResult<u32> {
        let device = Device::probe(platform, config)?;
        let minor = self.next_minor.fetch_add(1, Ordering::SeqCst);
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(minor, device);
        log::info!("registered aesdev{minor}");
        Ok(minor)
    }

    /// Unpublish and remove a device.
    ///
    /// # Panics
    ///
    /// Panics if the device still has open sessions (see [`Device::remove`]).
    pub fn unregister(&self, minor: u32) -> AesResult<()> {
        let device = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&minor)
            .ok_or(AesError::DeviceNotFound(minor))?;
        device.remove();
        log::info!("unregistered aesdev{minor}");
        Ok(())
    }

    /// Registered device by minor number.
    pub fn device(&self, minor: u32) -> AesResult<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&minor)
            .cloned()
            .ok_or(AesError::DeviceNotFound(minor))
    }

    /// Open a session on device `minor`.
    pub fn open(&self, minor: u32) -> AesResult<FileHandle> {
        let session = Arc::new(Session::open(self.device(minor)?)?);
        let fh = FileHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh, session);
        Ok(fh)
    }

    fn session(&self, fh: FileHandle) -> AesResult<Arc<Session>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fh)
            .cloned()
            .ok_or(AesError::BadFileHandle)
    }

    /// See [`Session::read`].
    pub fn read(&self, fh: FileHandle, buf: &mut [u8], flags: IoFlags) -> AesResult<usize> {
        self.session(fh)?.read(buf, flags)
    }

    /// See [`Session::write`].
    pub fn write(&self, fh: FileHandle, buf: &[u8], flags: IoFlags) -> AesResult<usize> {
        self.session(fh)?.write(buf, flags)
    }

    /// Decode a raw ioctl number and run it.
    ///
    /// # Errors
    ///
    /// [`AesError::UnknownControl`] for numbers that are not control
    /// operations, otherwise as for [`Session::control`].
    pub fn ioctl(&self, fh: FileHandle, cmd: u32, arg: &mut [u8]) -> AesResult<()> {
        let session = self.session(fh)?;
        session.control(ControlOp::from_ioctl(cmd)?, arg)
    }

    /// See [`Session::control`].
    pub fn control(&self, fh: FileHandle, op: ControlOp, arg: &mut [u8]) -> AesResult<()> {
        self.session(fh)?.control(op, arg)
    }

    /// Interrupt every blocked call on `fh` (signal delivery).
    pub fn interrupt(&self, fh: FileHandle) -> AesResult<()> {
        self.session(fh)?.interrupt();
        Ok(())
    }

    /// Close `fh`. The handle is unpublished before the session drains, so
    /// no new call can reach it.
    pub fn release(&self, fh: FileHandle) -> AesResult<()> {
        let session = self
            .files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fh)
            .ok_or(AesError::BadFileHandle)?;
        session.release();
        Ok(())
    }

    /// Number of open file handles.
    pub fn open_files(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
