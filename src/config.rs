// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device configuration.

use crate::descriptor::MAX_BLOCKS;
use crate::error::{AesError, AesResult};
use crate::mode::BLOCK_SIZE;

/// Default number of command ring slots.
pub const DEFAULT_RING_SLOTS: usize = 8;

/// Default session buffer capacity (0x100 blocks).
pub const DEFAULT_BUFFER_CAPACITY: usize = 0x100 * BLOCK_SIZE;

/// Upper bound on ring slots.
pub const MAX_RING_SLOTS: usize = 256;

/// Per-device settings, fixed at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Command ring slots. At most `ring_slots - 1` commands are in flight.
    pub ring_slots: usize,
    /// Capacity in bytes of every session's combo buffer.
    pub buffer_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ring_slots: DEFAULT_RING_SLOTS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl DeviceConfig {
    /// Set the number of ring slots.
    pub fn with_ring_slots(mut self, slots: usize) -> Self {
        self.ring_slots = slots;
        self
    }

    /// Set the session buffer capacity in bytes.
    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    /// Check the settings against the hardware and buffer constraints.
    pub fn validate(&self) -> AesResult<()> {
        if self.ring_slots < 2 {
            return Err(AesError::InvalidConfig(format!(
                "ring needs at least 2 slots, got {}",
                self.ring_slots
            )));
        }
        if self.ring_slots > MAX_RING_SLOTS {
            return Err(AesError::InvalidConfig(format!(
                "ring supports at most {MAX_RING_SLOTS} slots, got {}",
                self.ring_slots
            )));
        }
        if !self.buffer_capacity.is_power_of_two() || self.buffer_capacity < BLOCK_SIZE {
            return Err(AesError::InvalidConfig(format!(
                "buffer capacity must be a power of two of at least {BLOCK_SIZE} bytes, got {}",
                self.buffer_capacity
            )));
        }
        if self.buffer_capacity / BLOCK_SIZE > MAX_BLOCKS as usize {
            return Err(AesError::InvalidConfig(format!(
                "buffer capacity {} exceeds the per-command block count",
                self.buffer_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity, 4096);
    }

    #[test]
    fn test_rejects_bad_ring() {
        assert!(DeviceConfig::default().with_ring_slots(1).validate().is_err());
        assert!(DeviceConfig::default().with_ring_slots(257).validate().is_err());
        assert!(DeviceConfig::default().with_ring_slots(2).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_capacity() {
        let base = DeviceConfig::default();
        assert!(base.with_buffer_capacity(48).validate().is_err());
        assert!(base.with_buffer_capacity(8).validate().is_err());
        assert!(base.with_buffer_capacity(1 << 25).validate().is_err());
        assert!(base.with_buffer_capacity(16).validate().is_ok());
        assert!(base.with_buffer_capacity(1 << 16).validate().is_ok());
    }
}
