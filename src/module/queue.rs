//! Queue stage
//!
//! Terminates the current task and enqueues packets for a new one:
//! upstream stages push batches in from any thread, and the queue's own
//! task hands them downstream in bursts when the scheduler runs it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use super::{Ingress, Scheduler, Task, TaskContext, TaskId, TaskResult};
use crate::config::{self, QueueConfig};
use crate::core::{migrate, RingBuffer};
use crate::error::QueueError;
use crate::packet::{prefetch0, Packet, PacketBatch};

/// Administrative commands understood by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetBurst(u64),
    SetSize(u64),
}

impl Command {
    /// Parse a command name and its loosely typed argument.
    pub fn parse(name: &str, arg: &Value) -> Result<Self, QueueError> {
        match name {
            "set_burst" => Ok(Command::SetBurst(config::uint_arg(arg, "burst")?)),
            "set_size" => Ok(Command::SetSize(config::uint_arg(arg, "argument")?)),
            _ => Err(QueueError::UnknownCommand(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SetBurst(_) => "set_burst",
            Command::SetSize(_) => "set_size",
        }
    }

    /// Whether the command may run while producers and the task are live
    pub fn is_mt_safe(&self) -> bool {
        matches!(self, Command::SetBurst(_))
    }
}

/// Occupancy snapshot, rendered as `count/capacity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDesc {
    pub count: usize,
    pub capacity: usize,
}

impl fmt::Display for QueueDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.capacity)
    }
}

/// Resizable MPSC packet queue stage.
///
/// `process_batch` may be called from any number of producer threads;
/// `run_task` is driven by a single scheduler. Resizing takes `&mut self`,
/// so it can only happen while nothing else holds the queue.
pub struct Queue<P> {
    ring: RingBuffer<P>,
    burst: AtomicUsize,
    prefetch: bool,
    pkt_overhead: u64,
    task_id: TaskId,
}

impl<P: Packet> Queue<P> {
    /// Build the queue and register its task with `scheduler`.
    ///
    /// Validation and ring allocation happen before registration, so a
    /// failed init leaves no task behind.
    pub fn init(config: &QueueConfig, scheduler: &mut dyn Scheduler) -> Result<Self, QueueError> {
        let burst = config.burst()?;
        let size = config.size()?;
        let ring = allocate(size)?;
        let task_id = scheduler.register_task("queue")?;

        tracing::debug!(
            task = %task_id,
            burst,
            size,
            prefetch = config.prefetch,
            pkt_overhead = config.pkt_overhead,
            "queue initialized"
        );

        Ok(Self {
            ring,
            burst: AtomicUsize::new(burst),
            prefetch: config.prefetch,
            pkt_overhead: config.pkt_overhead,
            task_id,
        })
    }

    /// Replace the ring with one of `slots` slots, keeping queued packets.
    ///
    /// The oldest packets that fit are migrated in order, the rest are
    /// released. On allocation failure the current ring stays in place.
    /// `slots` must already be validated.
    fn resize(&mut self, slots: usize) -> Result<(), QueueError> {
        let new_ring = allocate(slots)?;
        let old_capacity = self.ring.capacity();

        let old_ring = std::mem::replace(&mut self.ring, new_ring);
        let stats = migrate(old_ring, &self.ring);

        tracing::info!(
            old_capacity,
            new_capacity = slots,
            storage_bytes = self.ring.storage_bytes(),
            migrated = stats.migrated,
            dropped = stats.dropped,
            "queue resized"
        );
        Ok(())
    }

    pub fn set_burst(&self, burst: u64) -> Result<(), QueueError> {
        let burst = config::validate_burst(burst)?;
        self.burst.store(burst, Ordering::Relaxed);
        tracing::debug!(burst, "burst updated");
        Ok(())
    }

    pub fn set_size(&mut self, size: u64) -> Result<(), QueueError> {
        let size = config::validate_size(size)?;
        self.resize(size)
    }

    /// Run a command that is safe while the pipeline is live.
    pub fn command(&self, cmd: Command) -> Result<(), QueueError> {
        match cmd {
            Command::SetBurst(n) => self.set_burst(n),
            Command::SetSize(_) => Err(QueueError::NeedsExclusiveAccess(cmd.name())),
        }
    }

    /// Run any command. Exclusive access makes resizing safe.
    pub fn command_mut(&mut self, cmd: Command) -> Result<(), QueueError> {
        match cmd {
            Command::SetBurst(n) => self.set_burst(n),
            Command::SetSize(n) => self.set_size(n),
        }
    }

    pub fn describe(&self) -> QueueDesc {
        QueueDesc {
            count: self.ring.count(),
            capacity: self.ring.capacity(),
        }
    }

    pub fn burst(&self) -> usize {
        self.burst.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Tear down, releasing every queued packet.
    pub fn deinit(self) -> usize {
        let mut released = 0;
        let mut pkts = Vec::with_capacity(config::MAX_BURST);
        while self.ring.dequeue_burst(&mut pkts, config::MAX_BURST) > 0 {
            released += pkts.len();
            pkts.clear();
        }
        tracing::debug!(released, "queue torn down");
        released
    }
}

fn allocate<P>(slots: usize) -> Result<RingBuffer<P>, QueueError> {
    RingBuffer::with_capacity(slots).map_err(|source| QueueError::ResourceExhausted { slots, source })
}

/// From upstream
impl<P: Packet> Ingress<P> for Queue<P> {
    fn process_batch(&self, batch: &mut PacketBatch<P>) {
        let pkts = batch.as_mut_vec();
        let queued = self.ring.enqueue_burst(pkts);

        if !pkts.is_empty() {
            tracing::trace!(queued, dropped = pkts.len(), "queue full");
            pkts.clear();
        }
    }
}

/// To downstream
impl<P: Packet> Task<P> for Queue<P> {
    fn run_task(&self, ctx: &mut TaskContext<'_, P>) -> TaskResult {
        let burst = self.burst.load(Ordering::Relaxed);

        let cnt = self.ring.dequeue_burst(ctx.batch.as_mut_vec(), burst);
        if cnt == 0 {
            return TaskResult::default();
        }

        let mut total_bytes = 0u64;
        if self.prefetch {
            for pkt in ctx.batch.iter() {
                total_bytes += pkt.total_len() as u64;
                prefetch0(pkt.head_data().as_ptr());
            }
        } else {
            for pkt in ctx.batch.iter() {
                total_bytes += pkt.total_len() as u64;
            }
        }

        ctx.next.process_batch(ctx.batch);

        let packets = cnt as u64;
        TaskResult {
            packets,
            bits: (total_bytes + packets * self.pkt_overhead) * 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{SchedulerError, Worker};
    use crate::packet::PacketBuf;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    /// Downstream stage recording what it received
    #[derive(Default)]
    struct Collect {
        seqs: Mutex<Vec<u64>>,
        calls: AtomicU64,
    }

    impl Ingress<PacketBuf> for Collect {
        fn process_batch(&self, batch: &mut PacketBatch<PacketBuf>) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.seqs
                .lock()
                .unwrap()
                .extend(batch.drain().map(|p| p.seq()));
        }
    }

    /// Scheduler that refuses every registration
    struct Full;

    impl Scheduler for Full {
        fn register_task(&mut self, _name: &str) -> Result<TaskId, SchedulerError> {
            Err(SchedulerError::TaskLimit { max: 0 })
        }
    }

    fn queue(config: QueueConfig) -> Queue<PacketBuf> {
        let mut worker: Worker<PacketBuf> = Worker::new();
        Queue::init(&config, &mut worker).unwrap()
    }

    fn sized(size: u64) -> Queue<PacketBuf> {
        queue(QueueConfig {
            size: Some(size),
            ..QueueConfig::default()
        })
    }

    fn batch_of(seqs: std::ops::Range<u64>, len: usize) -> PacketBatch<PacketBuf> {
        let mut batch = PacketBatch::new();
        for seq in seqs {
            batch.push(PacketBuf::zeroed(seq, len)).unwrap();
        }
        batch
    }

    fn run(q: &Queue<PacketBuf>, next: &Collect) -> TaskResult {
        let mut scratch = PacketBatch::new();
        let mut ctx = TaskContext {
            batch: &mut scratch,
            next,
        };
        q.run_task(&mut ctx)
    }

    #[test]
    fn test_init_defaults() {
        let q = queue(QueueConfig::default());
        assert_eq!(q.burst(), config::MAX_BURST);
        assert_eq!(q.capacity(), config::DEFAULT_QUEUE_SIZE);
        assert_eq!(q.describe().to_string(), "0/1024");
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let mut worker: Worker<PacketBuf> = Worker::new();

        let bad_burst = QueueConfig {
            burst: Some(0),
            ..QueueConfig::default()
        };
        assert!(matches!(
            Queue::<PacketBuf>::init(&bad_burst, &mut worker),
            Err(QueueError::Config(_))
        ));

        let bad_size = QueueConfig {
            size: Some(100),
            ..QueueConfig::default()
        };
        assert!(matches!(
            Queue::<PacketBuf>::init(&bad_size, &mut worker),
            Err(QueueError::Config(_))
        ));

        // Nothing was registered by the failed attempts
        assert_eq!(worker.num_tasks(), 0);
    }

    #[test]
    fn test_init_registration_failure() {
        let err = Queue::<PacketBuf>::init(&QueueConfig::default(), &mut Full)
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::TaskRegistration(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_overflow_scenario() {
        let q = queue(QueueConfig {
            size: Some(4),
            burst: Some(4),
            ..QueueConfig::default()
        });
        let next = Collect::default();

        let mut batch = batch_of(0..6, 100);
        q.process_batch(&mut batch);
        assert!(batch.is_empty());
        assert_eq!(q.describe().to_string(), "4/4");

        let ret = run(&q, &next);
        assert_eq!(ret, TaskResult { packets: 4, bits: 3968 });
        assert_eq!(*next.seqs.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(next.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_run_empty_skips_handoff() {
        let q = sized(16);
        let next = Collect::default();

        assert_eq!(run(&q, &next), TaskResult::default());
        assert_eq!(next.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_run_respects_burst() {
        let q = sized(64);
        let next = Collect::default();
        q.set_burst(5).unwrap();

        let mut batch = batch_of(0..12, 10);
        q.process_batch(&mut batch);

        assert_eq!(run(&q, &next).packets, 5);
        assert_eq!(run(&q, &next).packets, 5);
        assert_eq!(run(&q, &next).packets, 2);
        assert_eq!(*next.seqs.lock().unwrap(), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_prefetch_and_overhead_do_not_change_semantics() {
        let plain = queue(QueueConfig {
            size: Some(8),
            ..QueueConfig::default()
        });
        let tuned = queue(QueueConfig {
            size: Some(8),
            prefetch: true,
            pkt_overhead: 0,
            ..QueueConfig::default()
        });

        let (a, b) = (Collect::default(), Collect::default());
        plain.process_batch(&mut batch_of(0..3, 60));
        tuned.process_batch(&mut batch_of(0..3, 60));

        assert_eq!(run(&plain, &a), TaskResult { packets: 3, bits: 3 * 84 * 8 });
        assert_eq!(run(&tuned, &b), TaskResult { packets: 3, bits: 3 * 60 * 8 });
        assert_eq!(*a.seqs.lock().unwrap(), *b.seqs.lock().unwrap());
    }

    #[test]
    fn test_resize_grow_preserves_order() {
        let mut q = sized(4);
        let next = Collect::default();
        q.process_batch(&mut batch_of(0..4, 10));

        q.set_size(64).unwrap();
        assert_eq!(q.describe().to_string(), "4/64");

        q.process_batch(&mut batch_of(4..10, 10));
        run(&q, &next);
        assert_eq!(*next.seqs.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_resize_shrink_keeps_oldest() {
        let mut q = sized(64);
        let next = Collect::default();
        q.process_batch(&mut batch_of(0..20, 10));

        q.set_size(8).unwrap();
        assert_eq!(q.describe().to_string(), "8/8");

        run(&q, &next);
        assert_eq!(*next.seqs.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_set_size_rejects_without_change() {
        let mut q = sized(16);
        q.process_batch(&mut batch_of(0..3, 10));

        for bad in [3, 2, 100, 32768] {
            assert!(matches!(q.set_size(bad), Err(QueueError::Config(_))));
        }
        assert_eq!(q.describe().to_string(), "3/16");
    }

    #[test]
    fn test_resize_allocation_failure_keeps_ring() {
        let mut q = sized(16);
        let next = Collect::default();
        q.process_batch(&mut batch_of(0..5, 10));

        // Not a power of 2: the ring constructor refuses it
        let err = q.resize(24).unwrap_err();
        assert!(matches!(err, QueueError::ResourceExhausted { slots: 24, .. }));
        assert_eq!(q.describe().to_string(), "5/16");

        assert_eq!(run(&q, &next).packets, 5);
        assert_eq!(*next.seqs.lock().unwrap(), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn test_set_size_validates_before_allocating() {
        let mut q = sized(16);
        for bad in [2, 24] {
            assert!(matches!(q.set_size(bad), Err(QueueError::Config(_))));
        }
        assert_eq!(q.capacity(), 16);
    }

    #[test]
    fn test_set_burst_rejects_without_change() {
        let q = sized(16);
        q.set_burst(7).unwrap();
        assert!(q.set_burst(0).is_err());
        assert!(q.set_burst(33).is_err());
        assert_eq!(q.burst(), 7);
    }

    #[test]
    fn test_commands() {
        let mut q = sized(16);

        let cmd = Command::parse("set_burst", &json!(4)).unwrap();
        assert!(cmd.is_mt_safe());
        q.command(cmd).unwrap();
        assert_eq!(q.burst(), 4);

        let cmd = Command::parse("set_size", &json!(256)).unwrap();
        assert!(!cmd.is_mt_safe());
        assert!(matches!(
            q.command(cmd),
            Err(QueueError::NeedsExclusiveAccess("set_size"))
        ));
        assert_eq!(q.capacity(), 16);
        q.command_mut(cmd).unwrap();
        assert_eq!(q.capacity(), 256);

        assert!(matches!(
            Command::parse("set_burst", &json!("4")),
            Err(QueueError::Config(_))
        ));
        assert!(matches!(
            Command::parse("flush", &json!(null)),
            Err(QueueError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_deinit_releases_everything() {
        let q = sized(16);
        q.process_batch(&mut batch_of(0..9, 10));
        assert_eq!(q.deinit(), 9);
    }
}
