//! pktq - resizable lock-free packet queue stage
//!
//! Architecture:
//! - Lock-Free: MPSC ring with CAS slot reservation, single-store consume
//! - No-Allocation: mmap-backed slots, reusable burst batches
//! - Drop-on-full: overflow is released at the producer, never an error
//! - Live resize: whole-ring replacement under exclusive access

pub mod config;
pub mod core;
pub mod error;
pub mod module;
pub mod packet;

pub use config::QueueConfig;
pub use error::QueueError;
pub use module::{Ingress, Queue, Scheduler, Task, TaskContext, TaskResult, Worker};
pub use packet::{Packet, PacketBatch, PacketBuf};
