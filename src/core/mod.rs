//! Core module: lock-free MPSC ring buffer with mmap-backed slots
//!
//! Design principles:
//! - Lock-Free: producers and the consumer only touch atomics
//! - No-Allocation: slots are mapped once per ring, never on the hot path
//! - Whole-ring resize: capacity changes build a new ring and migrate into it

mod migrate;
mod ring_buffer;
mod slot_storage;

pub use migrate::{migrate, Migration};
pub use ring_buffer::RingBuffer;
pub use slot_storage::SlotStorage;
