use serde::{Deserialize, Serialize};

/// Monetary amount in millions of currency units.
pub type Money = f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub usize);

/// Zero-based index of a simulated loss year within a batch.
/// The index doubles as the RNG stream id, so year `n` of a batch draws the
/// same values however the batch is produced (lazily, in parallel, restarted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Year(pub u32);

impl Year {
    pub fn stream(self) -> u64 {
        self.0 as u64
    }
}
