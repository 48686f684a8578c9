//! Pipeline stage contracts
//!
//! A stage is composed from two narrow capabilities instead of a base
//! class:
//! - `Ingress`: accepts batches pushed by an upstream stage
//! - `Task`: a unit of work a cooperative scheduler invokes repeatedly,
//!   producing a batch for the next stage plus throughput stats

mod queue;
mod worker;

use std::fmt;
use std::ops::{Add, AddAssign};

use thiserror::Error;

use crate::packet::PacketBatch;

pub use queue::{Command, Queue, QueueDesc};
pub use worker::{TaskStats, Worker};

/// Accepts packet batches from an upstream stage.
///
/// The callee takes ownership of every packet: `batch` is empty on
/// return. Callable from many threads at once.
pub trait Ingress<P>: Send + Sync {
    fn process_batch(&self, batch: &mut PacketBatch<P>);
}

/// Work unit driven by a cooperative scheduler.
///
/// The scheduler never runs the same task concurrently with itself.
pub trait Task<P>: Send + Sync {
    fn run_task(&self, ctx: &mut TaskContext<'_, P>) -> TaskResult;
}

/// Per-invocation environment a scheduler hands to a task
pub struct TaskContext<'a, P> {
    /// Scratch batch owned by the scheduler, empty on entry
    pub batch: &'a mut PacketBatch<P>,
    /// Stage receiving the task's output
    pub next: &'a dyn Ingress<P>,
}

/// Throughput of one task invocation, used for rate accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskResult {
    pub packets: u64,
    pub bits: u64,
}

impl Add for TaskResult {
    type Output = TaskResult;

    fn add(self, rhs: TaskResult) -> TaskResult {
        TaskResult {
            packets: self.packets + rhs.packets,
            bits: self.bits + rhs.bits,
        }
    }
}

impl AddAssign for TaskResult {
    fn add_assign(&mut self, rhs: TaskResult) {
        *self = *self + rhs;
    }
}

/// Identifier of a registered task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task limit reached ({max})")]
    TaskLimit { max: usize },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is already attached")]
    AlreadyAttached(TaskId),
}

/// Registration side of a cooperative scheduler
pub trait Scheduler {
    fn register_task(&mut self, name: &str) -> Result<TaskId, SchedulerError>;
}
