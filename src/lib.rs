//! Byte-oriented buffers and queues for single-producer/single-consumer
//! (SPSC) handoff between threads.
//!
//! The crate is built in three layers:
//!
//! - [`spsc::queue`] - A wait-free intrusive SPSC node queue with a paired
//!   freelist for node reuse. The substrate everything else sits on.
//! - [`spsc::buffer`] - An unbounded SPSC byte buffer over linked fixed-size
//!   segments: zero-copy writes and reads, direct file-descriptor I/O, and a
//!   selectable notification mode (busy spin, condition variable, hybrid
//!   spin-then-CV, timed CV, or eventfd).
//! - [`seq`] - A single-threaded block buffer with the same external
//!   contract, for callers that need deferred release of already-read data
//!   without any concurrency.
//!
//! Segments are allocated once and never move, so slices handed out by the
//! read side stay valid until the caller explicitly releases them with
//! `clear_preserved`. Growth is unbounded by design; flow control is the
//! caller's responsibility.
//!
//! # Example
//!
//! ```
//! use bytepipe::spsc::buffer;
//! use bytepipe::wait::Spin;
//!
//! let (mut tx, mut rx) = buffer::channel_with_block_size::<Spin>(64).unwrap();
//!
//! let producer = std::thread::spawn(move || {
//!     tx.put(0x1122_3344u32, true);
//!     tx.write_str("hello", true);
//! });
//!
//! assert_eq!(rx.get::<u32>(), 0x1122_3344);
//! assert_eq!(rx.get_string(), "hello");
//! producer.join().unwrap();
//! ```

pub mod plain;
pub mod seq;
pub mod spsc;
pub mod wait;

pub(crate) mod block;
pub(crate) mod trace;

#[cfg(feature = "tracing")]
pub use trace::init_tracing;

pub use plain::Plain;
