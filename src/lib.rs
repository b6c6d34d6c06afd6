// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # AES-128 command-ring accelerator driver core
//!
//! This crate drives a PCI AES-128 accelerator (vendor `0x1af4`, device
//! `0x10fc`) that executes ECB, CBC, CFB, OFB and CTR commands from a
//! DMA-visible command ring and signals completion by interrupt.
//!
//! ## Architecture
//!
//! | Layer | Type | Role |
//! |-------|------|------|
//! | Registry | [`AesDriver`] | minor numbers, file handles, ioctl decoding |
//! | Stream | [`Session`] | blocking/non-blocking read, write, control, release |
//! | Buffer | [`ComboBuffer`] | one circular DMA region per session |
//! | Device | [`Device`] | shared command ring, interrupt completion path |
//! | Bring-up | [`Platform`] | registers, DMA allocator, interrupt line |
//!
//! Bytes written to a session are copied into its combo buffer; every
//! whole block is handed to the device as one in-place command. The
//! interrupt handler retires finished commands in ring order and wakes the
//! owning session, whose next read folds the processed bytes back and
//! copies them out.
//!
//! ## Simulator
//!
//! With the `sim` feature (on by default) [`sim::SimulatedAccelerator`]
//! provides a complete software device, so the driver runs and is tested
//! without hardware.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aesdev_rust::sim::{SimConfig, SimulatedAccelerator};
//! use aesdev_rust::{AesError, CipherMode, Device, DeviceConfig, IoFlags, Session};
//!
//! fn main() -> Result<(), AesError> {
//!     let sim = Arc::new(SimulatedAccelerator::new(SimConfig::default())?);
//!     let device = Device::probe(sim, DeviceConfig::default())?;
//!
//!     let session = Session::open(device)?;
//!     let key = [0x2bu8; 16];
//!     let iv = [0u8; 16];
//!     session.set_mode(CipherMode::CbcEncrypt, &key, Some(&iv))?;
//!
//!     session.write(b"sixteen byte msg", IoFlags::empty())?;
//!     let mut out = [0u8; 16];
//!     let n = session.read(&mut out, IoFlags::empty())?;
//!     println!("ciphertext: {:02x?}", &out[..n]);
//!     Ok(())
//! }
//! ```

pub mod combo;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod driver;
pub mod error;
mod event;
pub mod mode;
pub mod pci;
pub mod platform;
pub mod regs;
pub mod ring;
pub mod session;
#[cfg(feature = "sim")]
pub mod sim;
pub mod task;

// Re-exports for convenient access
pub use combo::ComboBuffer;
pub use config::DeviceConfig;
pub use descriptor::{AesCommand, TaskWord};
pub use device::Device;
pub use dma::{BusAddr, DmaAllocator, DmaBuffer, DmaMemory, HwRange};
pub use driver::{AesDriver, FileHandle};
pub use error::{AesError, AesResult};
pub use mode::{CipherMode, ControlOp, BLOCK_SIZE, KEY_SIZE};
pub use platform::{IrqHandler, IrqReturn, Platform};
pub use regs::{MmioRegisters, Registers};
pub use session::{BufferStats, IoFlags, Lifecycle, Session};
