// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for accelerator operations.

use thiserror::Error;

/// Errors that can occur during accelerator operations.
#[derive(Debug, Error)]
pub enum AesError {
    /// No data, buffer space or ring slot available and the call was non-blocking.
    #[error("operation would block")]
    WouldBlock,

    /// Call made in a state that does not allow it (no mode selected,
    /// chaining state requested mid-stream, ...).
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// The session is closing or already closed.
    #[error("session is closed")]
    SessionClosed,

    /// A blocking wait was interrupted.
    #[error("interrupted while waiting")]
    Interrupted,

    /// DMA-capable memory could not be allocated.
    #[error("DMA allocation of {len} bytes failed")]
    DmaAllocation { len: usize },

    /// The interrupt line could not be requested.
    #[error("interrupt line unavailable")]
    IrqUnavailable,

    /// No device is registered under the given minor number.
    #[error("no device with minor {0}")]
    DeviceNotFound(u32),

    /// The device was removed; it accepts no new sessions.
    #[error("device removed")]
    DeviceRemoved,

    /// The file handle does not name an open session.
    #[error("bad file handle")]
    BadFileHandle,

    /// Unknown control (ioctl) command.
    #[error("unknown control command {0:#010x}")]
    UnknownControl(u32),

    /// Buffer size mismatch.
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Device configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Platform not supported.
    #[error("platform not supported")]
    PlatformNotSupported,
}

impl AesError {
    /// Returns true for the errors a caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Interrupted)
    }

    /// Maps the error to the errno a character-device entry point returns.
    #[cfg(unix)]
    pub fn errno(&self) -> i32 {
        match self {
            Self::WouldBlock => libc::EAGAIN,
            Self::InvalidState(_) | Self::InvalidArgument(_) | Self::InvalidConfig(_) => {
                libc::EINVAL
            }
            Self::SessionClosed | Self::BadFileHandle => libc::EBADF,
            Self::Interrupted => libc::EINTR,
            Self::DmaAllocation { .. } => libc::ENOMEM,
            Self::IrqUnavailable => libc::EBUSY,
            Self::DeviceNotFound(_) | Self::DeviceRemoved | Self::PlatformNotSupported => {
                libc::ENODEV
            }
            Self::UnknownControl(_) => libc::ENOTTY,
            Self::BufferSizeMismatch { .. } => libc::EFAULT,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::MmapFailed(_) => libc::EIO,
        }
    }
}

/// Result type alias for accelerator operations.
pub type AesResult<T> = Result<T, AesError>;
