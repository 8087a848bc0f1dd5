//! Session-wide monotonic counters and gauges.
//!
//! All counters live in a single flat array indexed by [`Counter`]. They are
//! only ever mutated from the task that owns them (the session task for
//! network counters, the disk task for cache gauges), so no atomics are
//! needed; snapshots are shipped between tasks by value.

use std::ops::Index;

/// The full set of counters and gauges the engine maintains.
///
/// Variants prefixed `Num` that count messages are monotonic counters; the
/// `Arc*`/`*Blocks`/`*Unchoked*` variants are gauges kept in lockstep with
/// the state they mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    // block cache
    WriteCacheBlocks,
    ReadCacheBlocks,
    PinnedBlocks,
    ArcMruSize,
    ArcMruGhostSize,
    ArcMfuSize,
    ArcMfuGhostSize,
    ArcWriteSize,
    ArcVolatileSize,

    // unchoke scheduler
    NumUnchokeSlots,
    NumPeersUpUnchoked,
    NumPeersUpUnchokedOptimistic,
    NumPeersUpUnchokedAll,

    // aggregate transfer accounting
    TotalPayloadDownload,
    TotalPayloadUpload,
    TotalProtocolDownload,
    TotalProtocolUpload,

    // per message type receive counters
    NumIncomingChoke,
    NumIncomingUnchoke,
    NumIncomingInterested,
    NumIncomingNotInterested,
    NumIncomingHave,
    NumIncomingBitfield,
    NumIncomingRequest,
    NumIncomingPiece,
    NumIncomingCancel,
    NumIncomingDhtPort,
    NumIncomingSuggest,
    NumIncomingHaveAll,
    NumIncomingHaveNone,
    NumIncomingRejectRequest,
    NumIncomingAllowedFast,
    NumIncomingExtended,
    NumIncomingHashRequest,
    NumIncomingHashes,
    NumIncomingHashReject,

    // per message type send counters
    NumOutgoingChoke,
    NumOutgoingUnchoke,
    NumOutgoingInterested,
    NumOutgoingNotInterested,
    NumOutgoingHave,
    NumOutgoingBitfield,
    NumOutgoingRequest,
    NumOutgoingPiece,
    NumOutgoingCancel,
    NumOutgoingDhtPort,
    NumOutgoingSuggest,
    NumOutgoingHaveAll,
    NumOutgoingHaveNone,
    NumOutgoingRejectRequest,
    NumOutgoingAllowedFast,
    NumOutgoingExtended,
    NumOutgoingHashRequest,
    NumOutgoingHashes,
    NumOutgoingHashReject,
}

/// One past the highest counter index.
pub const NUM_COUNTERS: usize = Counter::NumOutgoingHashReject as usize + 1;

/// The flat counter array.
#[derive(Clone, Debug)]
pub struct Counters([u64; NUM_COUNTERS]);

impl Default for Counters {
    fn default() -> Self {
        Self([0; NUM_COUNTERS])
    }
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps a monotonic counter by one.
    pub fn inc(&mut self, c: Counter) {
        self.0[c as usize] += 1;
    }

    /// Adds to a counter or gauge.
    pub fn add(&mut self, c: Counter, n: u64) {
        self.0[c as usize] += n;
    }

    /// Subtracts from a gauge. Going below zero is a bookkeeping bug which
    /// debug builds catch.
    pub fn sub(&mut self, c: Counter, n: u64) {
        debug_assert!(self.0[c as usize] >= n);
        self.0[c as usize] = self.0[c as usize].saturating_sub(n);
    }

    /// Overwrites a gauge.
    pub fn set(&mut self, c: Counter, n: u64) {
        self.0[c as usize] = n;
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.0[c as usize]
    }

    /// Copies all gauge and counter values from `other` in the given range of
    /// the counter space. Used by the disk task to publish its cache gauges
    /// into the session's counter snapshot.
    pub fn merge_from(&mut self, other: &Counters, counters: &[Counter]) {
        for &c in counters {
            self.0[c as usize] = other.0[c as usize];
        }
    }
}

impl Index<Counter> for Counters {
    type Output = u64;

    fn index(&self, c: Counter) -> &u64 {
        &self.0[c as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_roundtrip() {
        let mut c = Counters::new();
        c.inc(Counter::ArcMruSize);
        c.inc(Counter::ArcMruSize);
        c.sub(Counter::ArcMruSize, 1);
        assert_eq!(c[Counter::ArcMruSize], 1);
        assert_eq!(c[Counter::ArcMfuSize], 0);
    }

    #[test]
    fn test_merge_from() {
        let mut a = Counters::new();
        let mut b = Counters::new();
        b.set(Counter::PinnedBlocks, 3);
        b.set(Counter::NumIncomingHave, 7);
        a.merge_from(&b, &[Counter::PinnedBlocks]);
        assert_eq!(a[Counter::PinnedBlocks], 3);
        // only the listed counters are copied
        assert_eq!(a[Counter::NumIncomingHave], 0);
    }
}
