// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA-visible memory.
//!
//! A [`DmaBuffer`] is the one owning handle to a block of device-visible
//! memory. The accelerator reads and writes that memory on its own schedule,
//! so the CPU side never hands out references into it: bytes move in and
//! out through bounds-checked copies, and ranges that belong to the device
//! are named by an [`HwRange`] token instead of a slice.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use crate::error::{AesError, AesResult};

/// 32-bit device-visible address.
pub type BusAddr = u32;

/// Alignment of every DMA allocation.
pub const DMA_ALIGN: usize = 64;

/// Raw DMA-capable allocation.
pub struct DmaMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    bus_addr: BusAddr,
}

// SAFETY: the memory is a plain heap allocation; concurrent access is only
// performed on disjoint ranges, which the owners of the memory guarantee.
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl DmaMemory {
    /// Allocate `len` zeroed bytes that the device sees at `bus_addr`.
    pub fn new(len: usize, bus_addr: BusAddr) -> AesResult<Arc<Self>> {
        if len == 0 {
            return Err(AesError::InvalidArgument(
                "zero-length DMA allocation".to_string(),
            ));
        }
        let layout =
            Layout::from_size_align(len, DMA_ALIGN).map_err(|_| AesError::DmaAllocation { len })?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(AesError::DmaAllocation { len })?;

        Ok(Arc::new(Self {
            ptr,
            layout,
            bus_addr,
        }))
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; zero-length allocations are rejected.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Bus address of the first byte.
    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.bus_addr
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "DMA access {offset:#x}+{len:#x} outside {:#x}-byte region",
            self.len()
        );
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    ///
    /// # Safety
    ///
    /// No other party (CPU or device) may write the range concurrently.
    pub unsafe fn read_at(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
    }

    /// Copy `src` into the region starting at `offset`.
    ///
    /// # Safety
    ///
    /// No other party (CPU or device) may access the range concurrently.
    pub unsafe fn write_at(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

/// Owning handle to DMA memory.
///
/// Not `Clone`: dropping the handle frees the memory. Allocators keep at
/// most a [`Weak`] reference so they can translate bus addresses.
#[derive(Debug)]
pub struct DmaBuffer {
    mem: Arc<DmaMemory>,
}

impl DmaBuffer {
    /// Take ownership of freshly allocated memory.
    ///
    /// The caller must not retain another strong reference.
    pub fn from_memory(mem: Arc<DmaMemory>) -> Self {
        Self { mem }
    }

    /// Weak reference for bus-address translation. It stops upgrading once
    /// the buffer is dropped.
    pub fn downgrade(&self) -> Weak<DmaMemory> {
        Arc::downgrade(&self.mem)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.mem.bus_addr()
    }

    /// Bus address of the byte at `offset`.
    #[inline]
    pub fn bus_at(&self, offset: usize) -> BusAddr {
        assert!(offset < self.len(), "bus offset {offset:#x} out of range");
        self.mem.bus_addr() + offset as BusAddr
    }

    /// See [`DmaMemory::read_at`].
    ///
    /// # Safety
    ///
    /// The device must not be writing the range.
    #[inline]
    pub unsafe fn read_at(&self, offset: usize, dst: &mut [u8]) {
        self.mem.read_at(offset, dst)
    }

    /// See [`DmaMemory::write_at`].
    ///
    /// # Safety
    ///
    /// The device must not be accessing the range.
    #[inline]
    pub unsafe fn write_at(&self, offset: usize, src: &[u8]) {
        self.mem.write_at(offset, src)
    }
}

/// Allocator for device-visible memory, supplied by device bring-up.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `len` zeroed bytes.
    fn alloc(&self, len: usize) -> AesResult<DmaBuffer>;
}

/// Byte range of a session buffer currently owned by the device.
///
/// Deliberately neither `Clone` nor `Copy`: the token is created when the
/// range is handed to the device and consumed when the completed bytes are
/// given back, so a range cannot be reclaimed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct HwRange {
    offset: usize,
    len: usize,
}

impl HwRange {
    pub(crate) fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed_and_aligned() {
        let mem = DmaMemory::new(100, 0x2000).unwrap();
        assert_eq!(mem.len(), 100);
        assert_eq!(mem.bus_addr(), 0x2000);

        let mut out = [0xFFu8; 100];
        unsafe { mem.read_at(0, &mut out) };
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(mem.ptr.as_ptr() as usize % DMA_ALIGN, 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            DmaMemory::new(0, 0x1000),
            Err(AesError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_copy_in_and_out() {
        let buf = DmaBuffer::from_memory(DmaMemory::new(32, 0x4000).unwrap());
        unsafe { buf.write_at(8, b"abcd") };

        let mut out = [0u8; 6];
        unsafe { buf.read_at(7, &mut out) };
        assert_eq!(&out, b"\0abcd\0");
        assert_eq!(buf.bus_at(8), 0x4008);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_out_of_bounds_copy_panics() {
        let buf = DmaBuffer::from_memory(DmaMemory::new(16, 0x4000).unwrap());
        unsafe { buf.write_at(10, &[0u8; 8]) };
    }

    #[test]
    fn test_weak_reference_dies_with_buffer() {
        let buf = DmaBuffer::from_memory(DmaMemory::new(16, 0x4000).unwrap());
        let weak = buf.downgrade();
        assert!(weak.upgrade().is_some());
        drop(buf);
        assert!(weak.upgrade().is_none());
    }
}
