// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example: encrypt and decrypt through the simulated accelerator.
//!
//! Run with: `cargo run --example basic`

use std::sync::Arc;

use aesdev_rust::pci::{discover_devices, is_aesdev_available};
use aesdev_rust::sim::{SimConfig, SimulatedAccelerator};
use aesdev_rust::{AesDriver, AesError, CipherMode, ControlOp, DeviceConfig, FileHandle, IoFlags};

// NIST SP 800-38A, F.2.1
const KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];
const IV: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];
const PLAIN: [u8; 16] = [
    0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
];

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `input` and block until the same number of bytes has come back.
fn transform(driver: &AesDriver, fh: FileHandle, input: &[u8]) -> Result<Vec<u8>, AesError> {
    let mut written = 0;
    while written < input.len() {
        written += driver.write(fh, &input[written..], IoFlags::empty())?;
    }
    let mut out = vec![0u8; input.len()];
    let mut read = 0;
    while read < out.len() {
        read += driver.read(fh, &mut out[read..], IoFlags::empty())?;
    }
    Ok(out)
}

fn run_mode(driver: &AesDriver, minor: u32, mode: CipherMode) -> Result<(), AesError> {
    let fh = driver.open(minor)?;

    // SET_MODE takes the key, followed by the IV for chaining modes.
    let mut arg = [0u8; 32];
    arg[..16].copy_from_slice(&KEY);
    arg[16..].copy_from_slice(&IV);
    let op = ControlOp::SetMode(mode);
    driver.control(fh, op, &mut arg[..op.arg_len()])?;

    let cipher = transform(driver, fh, &PLAIN)?;
    println!("  {:<12} {}", mode.name(), hex(&cipher));

    // Decrypt on a fresh session with the inverse mode.
    let back = driver.open(minor)?;
    let op = ControlOp::SetMode(mode.inverse());
    driver.control(back, op, &mut arg[..op.arg_len()])?;
    let plain = transform(driver, back, &cipher)?;
    println!("  {:<12} {}", mode.inverse().name(), hex(&plain));

    driver.release(back)?;
    driver.release(fh)?;
    Ok(())
}

fn main() {
    println!("AES-128 Accelerator Basic Example");
    println!("=================================\n");

    // Check for hardware
    println!("Checking accelerator availability...");
    println!("  Hardware detected: {}", is_aesdev_available());
    match discover_devices() {
        Ok(devices) => {
            for device in &devices {
                println!("  Device: {}", device.address);
                println!("    Path: {}", device.sysfs_path.display());
                println!("    IRQ:  {:?}", device.irq);
            }
        }
        Err(AesError::PlatformNotSupported) => println!("  Platform not supported."),
        Err(e) => println!("  Error discovering devices: {}", e),
    }
    println!();

    // The simulator stands in for the hardware from here on.
    println!("Starting simulated accelerator...");
    let sim = match SimulatedAccelerator::new(SimConfig::default()) {
        Ok(sim) => Arc::new(sim),
        Err(e) => {
            println!("  Failed to start simulator: {}", e);
            return;
        }
    };
    let driver = AesDriver::new();
    let minor = match driver.register(sim.clone(), DeviceConfig::default()) {
        Ok(minor) => minor,
        Err(e) => {
            println!("  Probe failed: {}", e);
            return;
        }
    };
    println!("  Registered aesdev{}\n", minor);

    println!("Plaintext:     {}", hex(&PLAIN));
    println!("Key:           {}", hex(&KEY));
    println!("IV:            {}\n", hex(&IV));

    for mode in [
        CipherMode::EcbEncrypt,
        CipherMode::CbcEncrypt,
        CipherMode::CfbEncrypt,
        CipherMode::Ofb,
        CipherMode::Ctr,
    ] {
        if let Err(e) = run_mode(&driver, minor, mode) {
            println!("  {} failed: {}", mode.name(), e);
        }
    }
    println!();

    println!("Commands completed: {}", sim.commands_completed());
    match driver.unregister(minor) {
        Ok(()) => println!("Done!"),
        Err(e) => println!("Unregister failed: {}", e),
    }
}
