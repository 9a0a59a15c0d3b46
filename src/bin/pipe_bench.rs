//! SPSC block buffer throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin pipe_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)
//!     BLOCK_SIZE=4096 Segment size in bytes (default: page size)

use std::env;
use std::time::Instant;

use bytepipe::spsc::buffer;
use bytepipe::wait::Spin;

const CHUNK: usize = 256;
const TOTAL_BYTES: usize = 1 << 30;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn block_size() -> Option<usize> {
    env::var("BLOCK_SIZE").ok().and_then(|s| s.parse().ok())
}

fn bench_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (mut tx, mut rx) = match block_size() {
        Some(size) => buffer::channel_with_block_size::<Spin>(size),
        None => buffer::channel::<Spin>(),
    }
    .expect("creating buffer");

    let rounds = TOTAL_BYTES / CHUNK;

    let consumer = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        let mut out = [0u8; CHUNK];
        for i in 0..rounds {
            rx.get_cont(&mut out);
            let expected = (i % 251) as u8;
            if out[0] != expected {
                panic!("data corruption: expected {}, got {}", expected, out[0]);
            }
        }
        rx.blocks_allocated()
    });

    pin_to_cpu(producer_cpu);
    let start = Instant::now();
    for i in 0..rounds {
        let chunk = [(i % 251) as u8; CHUNK];
        tx.write_cont(&chunk, true);
    }
    let allocated = consumer.join().expect("consumer thread");
    let elapsed = start.elapsed();

    let gib = TOTAL_BYTES as f64 / (1u64 << 30) as f64;
    let secs = elapsed.as_secs_f64();
    println!(
        "throughput: {:.2} GiB/s ({} bytes in {:.3} s, {} chunks, {} blocks allocated)",
        gib / secs,
        TOTAL_BYTES,
        secs,
        rounds,
        allocated,
    );
}

fn main() {
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();
    println!(
        "pinning producer to {:?}, consumer to {:?}",
        producer_cpu, consumer_cpu
    );
    bench_throughput(producer_cpu, consumer_cpu);
}
