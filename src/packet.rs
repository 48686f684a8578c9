//! Packet handles and batches
//!
//! A packet is an opaque, exclusively owned handle. The queue only moves
//! handles around: dropping one releases the packet it refers to.

use std::ops::Deref;

use crate::config::MAX_BURST;

/// Opaque packet handle.
///
/// Only the length and the head of the payload are visible to the queue,
/// for rate accounting and the cache warm-up hint.
pub trait Packet: Send + 'static {
    /// Total payload length in bytes
    fn total_len(&self) -> usize;

    /// First segment of the payload
    fn head_data(&self) -> &[u8];
}

/// Owned packet buffer with a sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuf {
    data: Box<[u8]>,
    seq: u64,
}

impl PacketBuf {
    pub fn new(seq: u64, data: &[u8]) -> Self {
        Self {
            data: data.into(),
            seq,
        }
    }

    /// Zero-filled packet of `len` bytes
    pub fn zeroed(seq: u64, len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            seq,
        }
    }

    #[inline(always)]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Packet for PacketBuf {
    #[inline(always)]
    fn total_len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    fn head_data(&self) -> &[u8] {
        &self.data
    }
}

/// Batch of at most `MAX_BURST` packets passed between pipeline stages.
///
/// The backing `Vec` is allocated once and reused; clearing the batch
/// drops, and so releases, whatever it still holds.
#[derive(Debug)]
pub struct PacketBatch<P> {
    pkts: Vec<P>,
}

impl<P> Default for PacketBatch<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PacketBatch<P> {
    pub fn new() -> Self {
        Self {
            pkts: Vec::with_capacity(MAX_BURST),
        }
    }

    /// Append a packet, handing it back if the batch is full.
    #[inline]
    pub fn push(&mut self, pkt: P) -> Result<(), P> {
        if self.pkts.len() >= MAX_BURST {
            return Err(pkt);
        }
        self.pkts.push(pkt);
        Ok(())
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.pkts.len() >= MAX_BURST
    }

    /// Take ownership of every packet in the batch.
    #[inline]
    pub fn drain(&mut self) -> std::vec::Drain<'_, P> {
        self.pkts.drain(..)
    }

    /// Release every packet still in the batch.
    #[inline]
    pub fn clear(&mut self) {
        self.pkts.clear();
    }

    #[inline(always)]
    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<P> {
        &mut self.pkts
    }
}

impl<P> Deref for PacketBatch<P> {
    type Target = [P];

    fn deref(&self) -> &[P] {
        &self.pkts
    }
}

/// Cache warm-up hint for data about to be read.
///
/// Has no functional effect; a no-op on architectures without a
/// prefetch instruction.
#[inline(always)]
pub fn prefetch0<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch never faults, even on an invalid address
    unsafe {
        core::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), core::arch::x86_64::_MM_HINT_T0);
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: prefetch never faults, even on an invalid address
    unsafe {
        core::arch::asm!(
            "prfm pldl1keep, [{ptr}]",
            ptr = in(reg) ptr,
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = ptr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_buf() {
        let pkt = PacketBuf::new(7, b"Hello, pktq!");
        assert_eq!(pkt.seq(), 7);
        assert_eq!(pkt.total_len(), 12);
        assert_eq!(pkt.head_data(), b"Hello, pktq!");

        let pkt = PacketBuf::zeroed(1, 100);
        assert_eq!(pkt.total_len(), 100);
        assert!(pkt.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_batch_capacity() {
        let mut batch = PacketBatch::new();
        for i in 0..MAX_BURST as u64 {
            assert!(batch.push(PacketBuf::zeroed(i, 1)).is_ok());
        }
        assert!(batch.is_full());

        let rejected = batch.push(PacketBuf::zeroed(99, 1)).unwrap_err();
        assert_eq!(rejected.seq(), 99);
        assert_eq!(batch.len(), MAX_BURST);

        let seqs: Vec<u64> = batch.drain().map(|p| p.seq()).collect();
        assert_eq!(seqs, (0..MAX_BURST as u64).collect::<Vec<_>>());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_prefetch_is_harmless() {
        let pkt = PacketBuf::zeroed(0, 64);
        prefetch0(pkt.head_data().as_ptr());
        prefetch0(std::ptr::null::<u8>());
    }
}
