//! Cooperative worker
//!
//! Minimal run-to-completion scheduler: every attached task is invoked
//! once per round, serially, on the calling thread. A task's output batch
//! goes straight to the stage it was attached to.

use std::sync::Arc;

use super::{Ingress, Scheduler, SchedulerError, Task, TaskContext, TaskId, TaskResult};
use crate::packet::PacketBatch;

const DEFAULT_MAX_TASKS: usize = 64;

/// Accumulated stats of one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub runs: u64,
    /// Runs that produced no packets
    pub idle_runs: u64,
    pub packets: u64,
    pub bits: u64,
}

struct TaskSlot<P> {
    name: String,
    bound: Option<(Arc<dyn Task<P>>, Arc<dyn Ingress<P>>)>,
    batch: PacketBatch<P>,
    stats: TaskStats,
}

pub struct Worker<P> {
    tasks: Vec<TaskSlot<P>>,
    max_tasks: usize,
}

impl<P> Default for Worker<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Worker<P> {
    pub fn new() -> Self {
        Self::with_max_tasks(DEFAULT_MAX_TASKS)
    }

    pub fn with_max_tasks(max_tasks: usize) -> Self {
        Self {
            tasks: Vec::new(),
            max_tasks,
        }
    }

    /// Bind a registered task to the task object and its downstream stage.
    pub fn attach(
        &mut self,
        id: TaskId,
        task: Arc<dyn Task<P>>,
        next: Arc<dyn Ingress<P>>,
    ) -> Result<(), SchedulerError> {
        let slot = self
            .tasks
            .get_mut(id.0)
            .ok_or(SchedulerError::UnknownTask(id))?;

        if slot.bound.is_some() {
            return Err(SchedulerError::AlreadyAttached(id));
        }

        tracing::debug!(task = %id, name = %slot.name, "task attached");
        slot.bound = Some((task, next));
        Ok(())
    }

    /// Run every attached task once. Returns the round's total.
    pub fn run_once(&mut self) -> TaskResult {
        let mut total = TaskResult::default();

        for slot in &mut self.tasks {
            let Some((task, next)) = &slot.bound else {
                continue;
            };

            let mut ctx = TaskContext {
                batch: &mut slot.batch,
                next: next.as_ref(),
            };
            let ret = task.run_task(&mut ctx);

            // Whatever the task left behind is released here
            slot.batch.clear();

            slot.stats.runs += 1;
            if ret.packets == 0 {
                slot.stats.idle_runs += 1;
            }
            slot.stats.packets += ret.packets;
            slot.stats.bits += ret.bits;
            total += ret;
        }

        total
    }

    pub fn stats(&self, id: TaskId) -> Option<TaskStats> {
        self.tasks.get(id.0).map(|slot| slot.stats)
    }

    pub fn task_name(&self, id: TaskId) -> Option<&str> {
        self.tasks.get(id.0).map(|slot| slot.name.as_str())
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl<P> Scheduler for Worker<P> {
    fn register_task(&mut self, name: &str) -> Result<TaskId, SchedulerError> {
        if self.tasks.len() >= self.max_tasks {
            return Err(SchedulerError::TaskLimit {
                max: self.max_tasks,
            });
        }

        let id = TaskId(self.tasks.len());
        self.tasks.push(TaskSlot {
            name: name.to_string(),
            bound: None,
            batch: PacketBatch::new(),
            stats: TaskStats::default(),
        });
        Ok(id)
    }
}
