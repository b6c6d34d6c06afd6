// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Accelerator register map and register access.
//!
//! All registers are 32 bits wide and live in BAR0. The command ring
//! pointers are bus addresses into a DMA-visible array of 16-byte command
//! slots; the device fetches from `CMD_READ_PTR` until it reaches
//! `CMD_WRITE_PTR`, wrapping from `CMD_END_PTR` back to `CMD_BEGIN_PTR`.

use bitflags::bitflags;
use std::ptr::NonNull;

use crate::error::{AesError, AesResult};

/// Engine enable bits.
pub const ENABLE: u32 = 0x000;
/// Engine busy bits (read only).
pub const STATUS: u32 = 0x004;
/// Interrupt status, write-1-to-clear. Bit *i* is raised by commands whose
/// interrupt-select field has bit *i* set.
pub const INTR: u32 = 0x008;
/// Interrupt enable mask.
pub const INTR_ENABLE: u32 = 0x00c;

// 0x010..0x040 holds the direct-path key, data and state registers. The
// driver only uses the command ring and never touches them.

/// Current transfer, as latched by the engine.
pub const XFER_IN_PTR: u32 = 0x040;
pub const XFER_OUT_PTR: u32 = 0x044;
pub const XFER_STATE_PTR: u32 = 0x048;
pub const XFER_TASK: u32 = 0x04c;

/// Command ring bounds and pointers.
pub const CMD_BEGIN_PTR: u32 = 0x050;
pub const CMD_END_PTR: u32 = 0x054;
pub const CMD_READ_PTR: u32 = 0x058;
pub const CMD_WRITE_PTR: u32 = 0x05c;

/// Size of the register window.
pub const BAR0_SIZE: usize = 0x060;

/// Interrupt bits used by the command ring.
pub const INTR_MASK: u32 = 0xFF;

bitflags! {
    /// Bits of the `ENABLE` and `STATUS` registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineFlags: u32 {
        /// Data transfer (and cipher) unit.
        const XFER_DATA = 1 << 0;
        /// Command fetch unit.
        const FETCH_CMD = 1 << 1;
    }
}

impl EngineFlags {
    /// Both units running.
    pub const RUNNING: Self = Self::XFER_DATA.union(Self::FETCH_CMD);
}

/// 32-bit register access to one accelerator.
///
/// Implemented by the memory-mapped BAR on real hardware and by the
/// software accelerator in tests.
pub trait Registers: Send + Sync {
    /// Read the register at `offset`.
    fn read32(&self, offset: u32) -> u32;

    /// Write `value` to the register at `offset`.
    fn write32(&self, offset: u32, value: u32);
}

/// Memory-mapped register window.
pub struct MmioRegisters {
    base: NonNull<u8>,
    len: usize,
    /// Set when the mapping was created by [`MmioRegisters::map_file`].
    owned: bool,
}

// SAFETY: register accesses are single volatile 32-bit loads/stores, which
// the device serializes; the mapping stays valid for the lifetime of `self`.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wrap an existing mapping.
    ///
    /// # Safety
    ///
    /// - `base` must point to a mapped register window of at least `len` bytes
    /// - the mapping must outlive the returned value
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            owned: false,
        }
    }

    /// Map a PCI resource file (e.g. `/sys/bus/pci/devices/.../resource0`).
    #[cfg(target_os = "linux")]
    pub fn map_file(path: &std::path::Path) -> AesResult<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .open(path)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                BAR0_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(AesError::MmapFailed(format!(
                "mmap failed for {}",
                path.display()
            )));
        }

        let base = NonNull::new(base as *mut u8)
            .ok_or_else(|| AesError::MmapFailed(format!("null mapping for {}", path.display())))?;

        Ok(Self {
            base,
            len: BAR0_SIZE,
            owned: true,
        })
    }

    /// Map a PCI resource file.
    #[cfg(not(target_os = "linux"))]
    pub fn map_file(_path: &std::path::Path) -> AesResult<Self> {
        Err(AesError::PlatformNotSupported)
    }

    #[inline]
    fn reg(&self, offset: u32) -> *mut u32 {
        let offset = offset as usize;
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} outside window"
        );
        unsafe { self.base.as_ptr().add(offset) as *mut u32 }
    }
}

impl Registers for MmioRegisters {
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        unsafe { std::ptr::read_volatile(self.reg(offset)) }
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        unsafe { std::ptr::write_volatile(self.reg(offset), value) }
    }
}

impl Drop for MmioRegisters {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if self.owned {
            unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_flags() {
        assert_eq!(EngineFlags::RUNNING.bits(), 0x3);
        assert_eq!(EngineFlags::from_bits_truncate(0xF), EngineFlags::RUNNING);
    }

    #[test]
    fn test_mmio_over_plain_memory() {
        let mut window = [0u32; BAR0_SIZE / 4];
        let base = NonNull::new(window.as_mut_ptr() as *mut u8).unwrap();
        let regs = unsafe { MmioRegisters::from_raw(base, BAR0_SIZE) };

        regs.write32(CMD_BEGIN_PTR, 0x1000);
        regs.write32(ENABLE, EngineFlags::RUNNING.bits());
        assert_eq!(regs.read32(CMD_BEGIN_PTR), 0x1000);
        assert_eq!(regs.read32(ENABLE), 0x3);
        drop(regs);
        assert_eq!(window[(CMD_BEGIN_PTR / 4) as usize], 0x1000);
    }

    #[test]
    #[should_panic(expected = "outside window")]
    fn test_mmio_rejects_out_of_range() {
        let mut window = [0u32; 4];
        let base = NonNull::new(window.as_mut_ptr() as *mut u8).unwrap();
        let regs = unsafe { MmioRegisters::from_raw(base, 16) };
        regs.read32(CMD_WRITE_PTR);
    }
}
