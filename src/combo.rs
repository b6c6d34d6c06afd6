// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-session combo buffer.
//!
//! One circular DMA region holds, in order of increasing offset (mod C):
//!
//! ```text
//!   read_tail        write_tail       to_encrypt_tail     write_head
//!       |  ready to read  |  owned by device  |  not yet claimed  |  free  ...
//!       |<- read_count ->|<------------- write_count ------------>|
//!                                             |<- to_encrypt_count ->|
//! ```
//!
//! Bytes are appended at `write_head`, claimed for a device task from
//! `to_encrypt_tail` in whole blocks, encrypted in place, handed back at
//! `write_tail` once the task completes, and copied out from `read_tail`.
//! Every offset only moves forward and wraps modulo the capacity.
//!
//! All methods assume the caller holds the session's state lock.

use crate::dma::{BusAddr, DmaBuffer, HwRange};
use crate::mode::BLOCK_SIZE;

/// Circular buffer multiplexing unencrypted, in-flight and ready bytes.
#[derive(Debug)]
pub struct ComboBuffer {
    mem: DmaBuffer,
    capacity: usize,
    write_head: usize,
    write_tail: usize,
    to_encrypt_tail: usize,
    read_tail: usize,
    write_count: usize,
    to_encrypt_count: usize,
    read_count: usize,
}

impl ComboBuffer {
    /// Wrap a DMA buffer whose length is a power of two and a whole number
    /// of blocks.
    pub fn new(mem: DmaBuffer) -> Self {
        let capacity = mem.len();
        assert!(
            capacity.is_power_of_two() && capacity % BLOCK_SIZE == 0,
            "combo buffer capacity {capacity} must be a power-of-two multiple of the block size"
        );
        Self {
            mem,
            capacity,
            write_head: 0,
            write_tail: 0,
            to_encrypt_tail: 0,
            read_tail: 0,
            write_count: 0,
            to_encrypt_count: 0,
            read_count: 0,
        }
    }

    #[inline]
    fn wrap(&self, offset: usize) -> usize {
        offset & (self.capacity - 1)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written and not yet read back (unclaimed plus device-owned).
    #[inline]
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    /// Bytes waiting to be claimed by a task.
    #[inline]
    pub fn to_encrypt_count(&self) -> usize {
        self.to_encrypt_count
    }

    /// Bytes ready to be read.
    #[inline]
    pub fn read_count(&self) -> usize {
        self.read_count
    }

    /// Bytes currently owned by submitted tasks.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.write_count - self.to_encrypt_count
    }

    /// True when nothing is buffered in any segment.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write_count == 0 && self.read_count == 0
    }

    /// Free bytes anywhere in the buffer.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.write_count - self.read_count
    }

    /// Free bytes reachable from `write_head` without wrapping.
    #[inline]
    pub fn free_to_end(&self) -> usize {
        self.free().min(self.capacity - self.write_head)
    }

    /// Unclaimed bytes reachable from `to_encrypt_tail` without wrapping.
    #[inline]
    pub fn to_encrypt_count_to_end(&self) -> usize {
        self.to_encrypt_count
            .min(self.capacity - self.to_encrypt_tail)
    }

    /// Bus address of the first byte of `range`.
    #[inline]
    pub fn bus_addr_of(&self, range: &HwRange) -> BusAddr {
        self.mem.bus_at(range.offset())
    }

    /// Copy as much of `src` as fits before the end of the buffer.
    ///
    /// Returns the number of bytes taken; a short count is normal and the
    /// caller retries with the rest.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free_to_end());
        if n == 0 {
            return 0;
        }
        // SAFETY: [write_head, write_head + n) is free space, which neither
        // a reader nor the device touches.
        unsafe { self.mem.write_at(self.write_head, &src[..n]) };
        self.write_head = self.wrap(self.write_head + n);
        self.write_count += n;
        self.to_encrypt_count += n;
        n
    }

    /// Withdraw up to `max` of the most recently appended, still unclaimed
    /// bytes. Returns how many were withdrawn.
    pub fn unappend(&mut self, max: usize) -> usize {
        let n = max.min(self.to_encrypt_count);
        self.write_head = self.wrap(self.write_head + self.capacity - n);
        self.write_count -= n;
        self.to_encrypt_count -= n;
        n
    }

    /// Claim every whole block that is contiguous from `to_encrypt_tail`.
    ///
    /// Returns `None` when less than one block is available; the fractional
    /// remainder waits for a later append.
    pub fn claim_for_task(&mut self) -> Option<HwRange> {
        let blocks = self.to_encrypt_count_to_end() / BLOCK_SIZE;
        if blocks == 0 {
            return None;
        }
        let len = blocks * BLOCK_SIZE;
        let range = HwRange::new(self.to_encrypt_tail, len);
        self.to_encrypt_tail = self.wrap(self.to_encrypt_tail + len);
        self.to_encrypt_count -= len;
        Some(range)
    }

    /// Undo the most recent claim that never reached the device.
    pub fn unclaim(&mut self, range: HwRange) {
        assert_eq!(
            self.wrap(range.offset() + range.len()),
            self.to_encrypt_tail,
            "unclaim out of order"
        );
        assert!(range.len() <= self.in_flight(), "unclaim exceeds claimed bytes");
        self.to_encrypt_tail = range.offset();
        self.to_encrypt_count += range.len();
    }

    /// Give completed device bytes back as readable bytes.
    ///
    /// Ranges must be reclaimed in the order they were claimed; anything
    /// else is a broken invariant.
    pub fn reclaim_completed(&mut self, range: HwRange) {
        assert_eq!(
            range.offset(),
            self.write_tail,
            "completed range reclaimed out of order"
        );
        assert!(
            range.len() <= self.in_flight(),
            "completed range {} exceeds in-flight bytes {}",
            range.len(),
            self.in_flight()
        );
        self.write_tail = self.wrap(self.write_tail + range.len());
        self.write_count -= range.len();
        self.read_count += range.len();
    }

    /// Copy up to `dst.len()` ready bytes out, wrapping at the buffer end.
    pub fn take_for_read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.read_count);
        if n == 0 {
            return 0;
        }
        let first = n.min(self.capacity - self.read_tail);
        // SAFETY: the ready segment has been handed back by the device and
        // only the reader (holding the state lock) touches it.
        unsafe {
            self.mem.read_at(self.read_tail, &mut dst[..first]);
            if first < n {
                self.mem.read_at(0, &mut dst[first..n]);
            }
        }
        self.read_tail = self.wrap(self.read_tail + n);
        self.read_count -= n;
        n
    }

    /// Consume the buffer, returning the DMA memory.
    pub fn into_inner(self) -> DmaBuffer {
        self.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaMemory;
    use std::collections::VecDeque;

    fn buffer(capacity: usize) -> ComboBuffer {
        ComboBuffer::new(DmaBuffer::from_memory(
            DmaMemory::new(capacity, 0x10_0000).unwrap(),
        ))
    }

    #[test]
    fn test_fresh_buffer() {
        let combo = buffer(64);
        assert_eq!(combo.free(), 64);
        assert_eq!(combo.free_to_end(), 64);
        assert!(combo.is_empty());
    }

    #[test]
    #[should_panic(expected = "power-of-two")]
    fn test_rejects_odd_capacity() {
        buffer(48);
    }

    #[test]
    fn test_partial_block_is_not_claimed() {
        let mut combo = buffer(64);
        assert_eq!(combo.append(&[1u8; 10]), 10);
        assert!(combo.claim_for_task().is_none());
        assert_eq!(combo.append(&[2u8; 10]), 10);
        let range = combo.claim_for_task().unwrap();
        assert_eq!(range.offset(), 0);
        assert_eq!(range.len(), 16);
        assert_eq!(combo.to_encrypt_count(), 4);
        assert_eq!(combo.in_flight(), 16);
    }

    #[test]
    fn test_reclaim_then_read() {
        let mut combo = buffer(64);
        combo.append(b"0123456789abcdefXY");
        let range = combo.claim_for_task().unwrap();
        assert_eq!(combo.bus_addr_of(&range), 0x10_0000);
        combo.reclaim_completed(range);

        assert_eq!(combo.read_count(), 16);
        assert_eq!(combo.write_count(), 2);

        let mut out = [0u8; 20];
        assert_eq!(combo.take_for_read(&mut out), 16);
        assert_eq!(&out[..16], b"0123456789abcdef");
        assert_eq!(combo.free(), 62);
    }

    #[test]
    fn test_append_stops_at_buffer_end() {
        let mut combo = buffer(32);
        combo.append(&[0u8; 16]);
        let range = combo.claim_for_task().unwrap();
        combo.reclaim_completed(range);
        let mut sink = [0u8; 16];
        combo.take_for_read(&mut sink);

        // Head at 16 of 32: only 16 bytes fit before wrapping.
        assert_eq!(combo.free(), 32);
        assert_eq!(combo.free_to_end(), 16);
        assert_eq!(combo.append(&[7u8; 24]), 16);
        assert_eq!(combo.free_to_end(), 16);
        assert_eq!(combo.append(&[8u8; 8]), 8);
    }

    #[test]
    fn test_read_wraps_in_two_copies() {
        let mut combo = buffer(32);
        combo.append(&[0u8; 16]);
        let first = combo.claim_for_task().unwrap();
        combo.reclaim_completed(first);
        let mut sink = [0u8; 16];
        combo.take_for_read(&mut sink);

        let tail: Vec<u8> = (0..16).collect();
        let head: Vec<u8> = (16..32).collect();
        combo.append(&tail);
        let r1 = combo.claim_for_task().unwrap();
        combo.append(&head);
        let r2 = combo.claim_for_task().unwrap();
        assert_eq!(r2.offset(), 0);
        combo.reclaim_completed(r1);
        combo.reclaim_completed(r2);

        let mut out = [0u8; 32];
        assert_eq!(combo.take_for_read(&mut out), 32);
        let expected: Vec<u8> = (0..32).collect();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn test_unclaim_and_unappend() {
        let mut combo = buffer(64);
        combo.append(&[0u8; 8]);
        assert_eq!(combo.append(&[1u8; 24]), 24);
        let range = combo.claim_for_task().unwrap();
        assert_eq!(range.len(), 32);
        combo.unclaim(range);
        assert_eq!(combo.to_encrypt_count(), 32);

        assert_eq!(combo.unappend(24), 24);
        assert_eq!(combo.write_count(), 8);
        assert_eq!(combo.free_to_end(), 56);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_out_of_order_reclaim_panics() {
        let mut combo = buffer(64);
        combo.append(&[0u8; 16]);
        let _first = combo.claim_for_task().unwrap();
        combo.append(&[0u8; 16]);
        let second = combo.claim_for_task().unwrap();
        combo.reclaim_completed(second);
    }

    /// Random appends, claims, completions and reads never break the
    /// capacity invariant, and every byte written comes back in order.
    #[test]
    fn test_capacity_invariant_random_ops() {
        let mut combo = buffer(128);
        let mut device: VecDeque<HwRange> = VecDeque::new();
        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut written: Vec<u8> = Vec::new();
        let mut read: Vec<u8> = Vec::new();
        let mut counter = 0u8;

        for _ in 0..20_000 {
            match next() % 4 {
                0 => {
                    let len = (next() % 40) as usize;
                    let chunk: Vec<u8> = (0..len)
                        .map(|_| {
                            counter = counter.wrapping_add(1);
                            counter
                        })
                        .collect();
                    let n = combo.append(&chunk);
                    written.extend_from_slice(&chunk[..n]);
                    counter = counter.wrapping_sub((len - n) as u8);
                    while let Some(range) = combo.claim_for_task() {
                        device.push_back(range);
                    }
                }
                1 => {
                    if let Some(range) = device.pop_front() {
                        combo.reclaim_completed(range);
                    }
                }
                _ => {
                    let mut out = vec![0u8; (next() % 50) as usize];
                    let n = combo.take_for_read(&mut out);
                    read.extend_from_slice(&out[..n]);
                }
            }
            assert!(combo.read_count() + combo.write_count() <= combo.capacity());
            assert_eq!(
                combo.in_flight(),
                device.iter().map(HwRange::len).sum::<usize>()
            );
        }

        assert_eq!(&written[..read.len()], &read[..]);
    }
}
