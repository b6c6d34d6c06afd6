// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! What device bring-up hands to the driver core.

use std::sync::Arc;

use crate::dma::DmaAllocator;
use crate::error::AesResult;
use crate::regs::Registers;

/// Result of an interrupt handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The device did not raise the interrupt.
    None,
    /// The interrupt was ours and has been serviced.
    Handled,
}

/// Interrupt handler. Runs in interrupt context: it must not sleep.
pub type IrqHandler = Box<dyn Fn() -> IrqReturn + Send + Sync>;

/// A mapped, interrupt-capable accelerator ready to be driven.
pub trait Platform: Send + Sync {
    /// The device's register window.
    fn registers(&self) -> Arc<dyn Registers>;

    /// DMA-capable memory for the command ring and session buffers.
    fn dma(&self) -> Arc<dyn DmaAllocator>;

    /// Install the handler for the device's interrupt line.
    fn request_irq(&self, handler: IrqHandler) -> AesResult<()>;

    /// Remove the installed handler. Returns once no invocation is running.
    fn free_irq(&self);
}
