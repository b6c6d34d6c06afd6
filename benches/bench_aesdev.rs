// AES-128 Accelerator Driver Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks of stream throughput through the simulated accelerator.

use aes::cipher::KeyInit;
use aes::Aes128;
use aesdev_rust::sim::{apply_block, SimConfig, SimulatedAccelerator};
use aesdev_rust::{CipherMode, Device, DeviceConfig, IoFlags, Session};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

const KEY: [u8; 16] = [0x2b; 16];
const IV: [u8; 16] = [0x00; 16];

/// Write `data` and read the same number of bytes back.
///
/// Writes never block: a full buffer only drains through this thread's
/// reads, so the loop falls back to a blocking read instead.
fn process(session: &Session, data: &[u8], out: &mut [u8]) {
    let (mut written, mut read) = (0, 0);
    while read < data.len() {
        let mut read_flags = IoFlags::NONBLOCK;
        if written < data.len() {
            match session.write(&data[written..], IoFlags::NONBLOCK) {
                Ok(n) => written += n,
                Err(e) if e.is_retryable() => read_flags = IoFlags::empty(),
                Err(e) => panic!("write: {e}"),
            }
        } else {
            read_flags = IoFlags::empty();
        }
        match session.read(&mut out[read..], read_flags) {
            Ok(n) => read += n,
            Err(e) if e.is_retryable() => {}
            Err(e) => panic!("read: {e}"),
        }
    }
}

fn open(config: DeviceConfig, mode: CipherMode) -> (Arc<SimulatedAccelerator>, Session) {
    let sim = Arc::new(SimulatedAccelerator::new(SimConfig::default()).expect("sim"));
    let device = Device::probe(sim.clone(), config).expect("probe");
    let session = Session::open(device).expect("open");
    session
        .set_mode(mode, &KEY, mode.has_state().then_some(&IV))
        .expect("set mode");
    (sim, session)
}

/// Benchmark one stream per mode against a direct software loop.
fn bench_modes(c: &mut Criterion) {
    let sizes: Vec<usize> = vec![
        4 * 1024,   // 4 KB
        64 * 1024,  // 64 KB
        256 * 1024, // 256 KB
    ];

    let mut group = c.benchmark_group("stream");

    for size in sizes {
        let data: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        let mut out = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));

        // Software baseline
        let cipher = Aes128::new(&KEY.into());
        group.bench_with_input(BenchmarkId::new("software_cbc", size), &data, |b, data| {
            b.iter(|| {
                let mut state = IV;
                for chunk in data.chunks_exact(16) {
                    let mut block = [0u8; 16];
                    block.copy_from_slice(chunk);
                    apply_block(CipherMode::CbcEncrypt, &cipher, &mut state, &mut block);
                }
            });
        });

        for mode in [CipherMode::EcbEncrypt, CipherMode::CbcEncrypt, CipherMode::Ctr] {
            let (_sim, session) = open(DeviceConfig::default(), mode);
            group.bench_with_input(BenchmarkId::new(mode.name(), size), &data, |b, data| {
                b.iter(|| process(&session, data, &mut out));
            });
        }
    }

    group.finish();
}

/// Benchmark the effect of ring depth and buffer capacity.
fn bench_ring_depth(c: &mut Criterion) {
    let size = 64 * 1024;
    let data: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
    let mut out = vec![0u8; size];

    let mut group = c.benchmark_group("ring_depth");
    group.throughput(Throughput::Bytes(size as u64));

    for (slots, capacity) in [(2, 1024), (8, 4096), (32, 16 * 1024)] {
        let config = DeviceConfig::default()
            .with_ring_slots(slots)
            .with_buffer_capacity(capacity);
        let (_sim, session) = open(config, CipherMode::Ctr);
        group.bench_with_input(
            BenchmarkId::new(format!("{slots}_slots"), capacity),
            &data,
            |b, data| b.iter(|| process(&session, data, &mut out)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_modes, bench_ring_depth);
criterion_main!(benches);
