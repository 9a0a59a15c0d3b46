//! Concurrent stream behavior of the SPSC block buffer.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bytepipe::spsc::buffer;
use bytepipe::wait::{BatchedCondvar, Condvar, Spin, SpinCondvar, TimedCondvar, WaitFree};

#[test]
fn condvar_read_wakes_on_write() {
    let (mut tx, rx) = buffer::channel_with_block_size::<Condvar>(32).unwrap();

    let consumer = std::thread::spawn(move || rx.read::<u64>());

    // Let the consumer reach the condvar wait before publishing.
    std::thread::sleep(Duration::from_millis(50));
    tx.put(0xDEAD_BEEFu64, true);

    assert_eq!(consumer.join().unwrap(), 0xDEAD_BEEF);
}

#[test]
fn spin_then_condvar_read_wakes_on_write() {
    let (mut tx, rx) = buffer::channel_with_block_size::<SpinCondvar<64>>(32).unwrap();

    let consumer = std::thread::spawn(move || rx.read::<u64>());

    std::thread::sleep(Duration::from_millis(50));
    tx.put(7u64, true);

    assert_eq!(consumer.join().unwrap(), 7);
}

#[test]
fn timed_condvar_delivers_despite_batched_signals() {
    // Signals every 4th notify; the timed wait covers the swallowed ones.
    let (mut tx, mut rx) = buffer::channel_with_block_size::<TimedCondvar<4, 200>>(64).unwrap();

    let consumer = std::thread::spawn(move || {
        let mut sum = 0u64;
        for _ in 0..10 {
            sum += rx.get::<u64>();
        }
        sum
    });

    std::thread::sleep(Duration::from_millis(20));
    for i in 0..10u64 {
        tx.put(i, true);
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(consumer.join().unwrap(), 45);
}

#[test]
fn batched_condvar_delivers_flushed_batches() {
    let (mut tx, mut rx) = buffer::channel_with_block_size::<BatchedCondvar<2>>(64).unwrap();

    let consumer = std::thread::spawn(move || {
        let mut values = Vec::new();
        for _ in 0..4 {
            values.push(rx.get::<u32>());
        }
        values
    });

    std::thread::sleep(Duration::from_millis(20));
    // Four puts: the condvar fires on the 2nd and 4th, covering all data.
    for i in 0..4u32 {
        tx.put(i, true);
    }

    assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn spin_stream_fidelity_with_random_chunks() {
    const SEED: u64 = 0x5eed_1234;
    const CHUNKS: usize = 10_000;
    const BLOCK: usize = 256;

    let (mut tx, rx) = buffer::channel_with_block_size::<Spin>(BLOCK).unwrap();

    let producer = std::thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(SEED);
        let mut chunk = [0u8; BLOCK];
        for _ in 0..CHUNKS {
            let len = rng.random_range(1..=BLOCK);
            rng.fill(&mut chunk[..len]);
            tx.write_cont(&chunk[..len], true);
        }
    });

    let consumer = std::thread::spawn(move || {
        // Same seed, so the consumer knows every chunk length and content.
        let mut rng = StdRng::seed_from_u64(SEED);
        let mut expected = [0u8; BLOCK];
        let mut consumed = 0usize;
        let mut rx = rx;
        for _ in 0..CHUNKS {
            let len = rng.random_range(1..=BLOCK);
            rng.fill(&mut expected[..len]);
            let chunk = rx.read_cont(len);
            assert_eq!(chunk, &expected[..len]);
            consumed += len;
        }
        rx.clear_preserved(consumed);
        rx
    });

    producer.join().unwrap();
    let rx = consumer.join().unwrap();
    assert!(rx.is_empty());
}

#[test]
fn alternating_fill_drain_reaches_allocation_steady_state() {
    const BLOCK: usize = 64;
    let (mut tx, mut rx) = buffer::channel_with_block_size::<WaitFree>(BLOCK).unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    let mut after_warmup = 0;
    for round in 0..100 {
        // Fill at least four blocks' worth.
        let mut chunk = [0u8; BLOCK];
        for _ in 0..8 {
            rng.fill(&mut chunk[..]);
            tx.write_cont(&chunk, true);
        }
        // Drain everything and release it.
        let mut out = [0u8; BLOCK];
        for _ in 0..8 {
            rx.get_cont(&mut out);
        }
        if round == 10 {
            after_warmup = rx.blocks_allocated();
        }
    }

    // Once the freelist is primed, rounds stop allocating.
    assert_eq!(rx.blocks_allocated(), after_warmup);
}

#[test]
fn empty_becomes_false_after_notified_write() {
    let (mut tx, rx) = buffer::channel_with_block_size::<Spin>(32).unwrap();

    assert!(rx.is_empty());

    let producer = std::thread::spawn(move || {
        tx.put(1u8, true);
        tx
    });
    producer.join().unwrap();

    // The publish happened-before the join; the consumer must see it.
    assert!(!rx.is_empty());
}
