//! Lock-Free Multi-Producer Single-Consumer (MPSC) Ring Buffer
//!
//! Burst-oriented ring in the style of packet-processing rings:
//! - Producers reserve a run of slots with one CAS on `prod_head`, fill
//!   them, then publish in reservation order by advancing `prod_tail`
//! - The single consumer reads up to a burst from `cons_tail` and
//!   publishes the freed slots with one store
//!
//! No Mutex, no allocation after construction.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::slot_storage::SlotStorage;

/// Padding for cache line isolation (64 bytes on x86-64)
#[repr(C, align(64))]
struct CacheLinePadded<T> {
    value: T,
}

impl<T> CacheLinePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

/// Lock-free MPSC ring buffer of owned values.
///
/// Cursors are monotonic `usize` counters wrapped with `mask`, so the
/// capacity must be a power of two. Occupancy is `prod_tail - cons_tail`
/// and never exceeds capacity.
#[repr(C)]
pub struct RingBuffer<T> {
    // Producer reservation cursor
    prod_head: CacheLinePadded<AtomicUsize>,
    // Producer publication cursor, trails prod_head while writes are in flight
    prod_tail: CacheLinePadded<AtomicUsize>,
    // Consumer cursor
    cons_tail: CacheLinePadded<AtomicUsize>,
    // Set while a consumer is inside dequeue_burst
    consumer_claimed: CacheLinePadded<AtomicBool>,
    slots: SlotStorage<T>,
    mask: usize,
}

// SAFETY: RingBuffer is Send/Sync because:
// - every slot is written by exactly one producer (unique CAS reservation)
// - only one consumer reads at a time (consumer_claimed)
// - Release/Acquire on prod_tail and cons_tail order slot accesses
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring with `capacity` slots. `capacity` must be a power of 2.
    ///
    /// Allocation happens once here. Fails with `InvalidInput` on a bad
    /// capacity or with the mapping error if the slots cannot be allocated.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "capacity must be a power of 2",
            ));
        }

        Ok(Self {
            prod_head: CacheLinePadded::new(AtomicUsize::new(0)),
            prod_tail: CacheLinePadded::new(AtomicUsize::new(0)),
            cons_tail: CacheLinePadded::new(AtomicUsize::new(0)),
            consumer_claimed: CacheLinePadded::new(AtomicBool::new(false)),
            slots: SlotStorage::allocate(capacity)?,
            mask: capacity - 1,
        })
    }

    /// Enqueue a burst from the front of `items` (Producer side)
    ///
    /// Safe to call from any number of threads at once. Accepts as many
    /// items as there are free slots, removes them from the front of
    /// `items` in order and returns the accepted count. The rejected
    /// suffix is left in `items` for the caller.
    pub fn enqueue_burst(&self, items: &mut Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }

        let capacity = self.capacity();
        let mut head = self.prod_head.value.load(Ordering::Relaxed);
        let n = loop {
            let cons = self.cons_tail.value.load(Ordering::Acquire);
            let used = head.wrapping_sub(cons);
            if used > capacity {
                // Stale head: the consumer already moved past it
                head = self.prod_head.value.load(Ordering::Relaxed);
                continue;
            }
            let n = (capacity - used).min(items.len());
            if n == 0 {
                return 0;
            }

            match self.prod_head.value.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break n,
                Err(current) => head = current,
            }
        };

        // Slots [head, head + n) now belong to this producer
        for (i, item) in items.drain(..n).enumerate() {
            let idx = head.wrapping_add(i) & self.mask;
            // SAFETY: reserved slot, the consumer cannot reach it before
            // prod_tail passes it
            unsafe {
                (*self.slots.slot(idx)).write(item);
            }
        }

        // Earlier reservations publish first
        while self.prod_tail.value.load(Ordering::Acquire) != head {
            std::hint::spin_loop();
        }
        self.prod_tail
            .value
            .store(head.wrapping_add(n), Ordering::Release);

        n
    }

    /// Dequeue up to `max` items into `out` in FIFO order (Consumer side)
    ///
    /// Returns the number appended. Only one consumer may run at a time;
    /// a second concurrent caller gets 0 and reads nothing.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        if self.consumer_claimed.value.swap(true, Ordering::Acquire) {
            tracing::warn!("concurrent dequeue on single-consumer ring ignored");
            return 0;
        }

        let cons = self.cons_tail.value.load(Ordering::Relaxed);
        let prod = self.prod_tail.value.load(Ordering::Acquire);
        let n = prod.wrapping_sub(cons).min(max);

        out.reserve(n);
        for i in 0..n {
            let idx = cons.wrapping_add(i) & self.mask;
            // SAFETY: slot published by prod_tail and not yet released
            let item = unsafe { (*self.slots.slot(idx)).assume_init_read() };
            out.push(item);
        }

        // Release: reads above complete before producers reuse the slots
        self.cons_tail
            .value
            .store(cons.wrapping_add(n), Ordering::Release);
        self.consumer_claimed.value.store(false, Ordering::Release);

        n
    }

    /// Approximate occupancy, for diagnostics only
    #[inline(always)]
    pub fn count(&self) -> usize {
        let cons = self.cons_tail.value.load(Ordering::Relaxed);
        let prod = self.prod_tail.value.load(Ordering::Relaxed);
        // Racy snapshot, the two loads can straddle an update
        prod.wrapping_sub(cons).min(self.capacity())
    }

    /// Approximate number of free slots
    #[inline(always)]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.count()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Bytes of slot storage backing this ring
    pub fn storage_bytes(&self) -> usize {
        self.slots.bytes()
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let cons = *self.cons_tail.value.get_mut();
        let prod = *self.prod_tail.value.get_mut();
        for i in 0..prod.wrapping_sub(cons) {
            let idx = cons.wrapping_add(i) & self.mask;
            // SAFETY: exclusive access; slot holds a published value
            unsafe { (*self.slots.slot(idx)).assume_init_drop() };
        }
    }
}
