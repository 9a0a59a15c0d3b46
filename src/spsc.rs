//! Single-producer/single-consumer primitives.
//!
//! - [`queue`] - the intrusive node queue the byte buffer is built on
//! - [`buffer`] - the unbounded segmented byte buffer

pub mod buffer;
pub mod queue;
