//! Ring migration used by live resize
//!
//! Moves every queued item from an old ring into a new one through the
//! regular consumer and producer paths, so FIFO order carries over.
//! Items the new ring cannot hold are dropped, which releases them.

use super::ring_buffer::RingBuffer;

/// Chunk size used while draining the old ring
const MIGRATE_BURST: usize = 64;

/// Outcome of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Migration {
    /// Items now queued in the new ring
    pub migrated: usize,
    /// Items released because the new ring was full
    pub dropped: usize,
}

/// Drain `old` into `new`, oldest first.
///
/// Takes `old` by value: once drained its slot storage is released.
/// When `new` is smaller than the backlog, the oldest items survive and
/// the newest ones are dropped.
pub fn migrate<T>(old: RingBuffer<T>, new: &RingBuffer<T>) -> Migration {
    let mut stats = Migration::default();
    let mut chunk = Vec::with_capacity(MIGRATE_BURST);

    while old.dequeue_burst(&mut chunk, MIGRATE_BURST) > 0 {
        stats.migrated += new.enqueue_burst(&mut chunk);
        stats.dropped += chunk.len();
        chunk.clear();
    }

    stats
}
