// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Command ring slot layout.
//!
//! Each ring slot is 16 bytes: input pointer, output pointer, key/state
//! pointer and a task word, all little-endian 32-bit values.
//!
//! # Task word
//!
//! | Bits    | Field                                  |
//! |---------|----------------------------------------|
//! | 0..3    | mode code                              |
//! | 3       | save chaining state after the command  |
//! | 4..12   | interrupt-select bits                  |
//! | 12..32  | block count                            |

use crate::dma::BusAddr;
use crate::mode::CipherMode;

/// Size of one ring slot in bytes.
pub const COMMAND_SIZE: usize = 16;

/// Largest block count a single command can carry.
pub const MAX_BLOCKS: u32 = 0xFFFFF;

/// Packed control word of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskWord(u32);

impl TaskWord {
    /// Pack a task word. `count` is truncated to 20 bits.
    #[inline]
    pub const fn new(count: u32, intr: u8, save: bool, mode: CipherMode) -> Self {
        Self(
            (count & MAX_BLOCKS) << 12
                | (intr as u32) << 4
                | (save as u32) << 3
                | mode.code() as u32,
        )
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Mode code (3 bits).
    #[inline]
    pub const fn mode_code(self) -> u8 {
        (self.0 & 7) as u8
    }

    #[inline]
    pub const fn mode(self) -> CipherMode {
        match CipherMode::from_code(self.mode_code()) {
            Some(mode) => mode,
            // 3-bit field; every value is a mode.
            None => CipherMode::EcbEncrypt,
        }
    }

    #[inline]
    pub const fn save(self) -> bool {
        (self.0 >> 3) & 1 != 0
    }

    #[inline]
    pub const fn intr(self) -> u8 {
        (self.0 >> 4) as u8
    }

    #[inline]
    pub const fn count(self) -> u32 {
        (self.0 >> 12) & MAX_BLOCKS
    }

    /// A command with no work and no side effects has only mode bits set.
    #[inline]
    pub const fn is_active(self) -> bool {
        self.0 & !7 != 0
    }

    /// Return the word with the interrupt-select field replaced.
    #[inline]
    pub const fn with_intr(self, intr: u8) -> Self {
        Self((self.0 & !(0xFF << 4)) | (intr as u32) << 4)
    }
}

/// Interrupt-select bits for a ring slot.
#[inline]
pub const fn intr_bit_for_slot(slot: usize) -> u8 {
    1 << (slot % 8)
}

/// One command ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct AesCommand {
    /// Bus address of the input blocks.
    pub in_ptr: BusAddr,
    /// Bus address of the output blocks (may equal `in_ptr`).
    pub out_ptr: BusAddr,
    /// Bus address of the 32-byte key/state block: key, then chaining value.
    pub state_ptr: BusAddr,
    /// Packed control word.
    pub task: TaskWord,
}

impl AesCommand {
    /// In-place command over `blocks` blocks starting at `data`.
    pub fn in_place(data: BusAddr, state_ptr: BusAddr, blocks: u32, mode: CipherMode) -> Self {
        Self {
            in_ptr: data,
            out_ptr: data,
            state_ptr,
            task: TaskWord::new(blocks, 0, mode.has_state(), mode),
        }
    }

    /// Serialize to the ring layout.
    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        out[0..4].copy_from_slice(&self.in_ptr.to_le_bytes());
        out[4..8].copy_from_slice(&self.out_ptr.to_le_bytes());
        out[8..12].copy_from_slice(&self.state_ptr.to_le_bytes());
        out[12..16].copy_from_slice(&self.task.bits().to_le_bytes());
        out
    }

    /// Parse the ring layout.
    pub fn from_bytes(bytes: &[u8; COMMAND_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            in_ptr: word(0),
            out_ptr: word(4),
            state_ptr: word(8),
            task: TaskWord::from_bits(word(12)),
        }
    }
}

// Compile-time size and alignment checks for the ring layout
const _: () = assert!(std::mem::size_of::<AesCommand>() == COMMAND_SIZE);
const _: () = assert!(std::mem::align_of::<AesCommand>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_size_and_alignment() {
        assert_eq!(std::mem::size_of::<AesCommand>(), 16);
        assert_eq!(std::mem::align_of::<AesCommand>(), 16);
    }

    #[test]
    fn test_task_word_packing() {
        let word = TaskWord::new(3, 0x04, true, CipherMode::CbcDecrypt);
        assert_eq!(word.bits(), 3 << 12 | 0x04 << 4 | 1 << 3 | 3);
        assert_eq!(word.count(), 3);
        assert_eq!(word.intr(), 0x04);
        assert!(word.save());
        assert_eq!(word.mode(), CipherMode::CbcDecrypt);
        assert!(word.is_active());
    }

    #[test]
    fn test_task_word_limits() {
        let word = TaskWord::new(MAX_BLOCKS, 0xFF, false, CipherMode::Ctr);
        assert_eq!(word.count(), MAX_BLOCKS);
        assert_eq!(word.intr(), 0xFF);
        assert!(!word.save());

        assert!(!TaskWord::new(0, 0, false, CipherMode::Ofb).is_active());
    }

    #[test]
    fn test_with_intr_preserves_other_fields() {
        let word = TaskWord::new(9, 0x01, true, CipherMode::Ofb).with_intr(0x80);
        assert_eq!(word.intr(), 0x80);
        assert_eq!(word.count(), 9);
        assert!(word.save());
        assert_eq!(word.mode(), CipherMode::Ofb);
    }

    #[test]
    fn test_intr_bit_for_slot() {
        assert_eq!(intr_bit_for_slot(0), 0x01);
        assert_eq!(intr_bit_for_slot(4), 0x10);
        assert_eq!(intr_bit_for_slot(7), 0x80);
        assert_eq!(intr_bit_for_slot(9), 0x02);
    }

    #[test]
    fn test_command_layout_bytes() {
        let cmd = AesCommand::in_place(0x1000_0040, 0x2000_0000, 2, CipherMode::EcbEncrypt);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[0..4], &[0x40, 0x00, 0x00, 0x10]);
        assert_eq!(&bytes[4..8], &[0x40, 0x00, 0x00, 0x10]);
        assert_eq!(AesCommand::from_bytes(&bytes), cmd);
        assert!(!cmd.task.save());
    }
}
