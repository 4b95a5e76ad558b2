//! Shard Router - maps an item key to a worker lane.
//!
//! Every event with the same `item_id` lands on the same lane for the
//! lifetime of the process, and each lane applies its events one at a time.
//! That is what gives per-key ordering without a lock per key.
//!
//! # Architecture
//!
//! ```text
//! Event (item_id: "A1")
//!     │
//!     ▼
//! ┌──────────────────────────────────┐
//! │          SHARD ROUTER            │
//! │                                  │
//! │  fnv1a32("A1") % lane_count = 2  │
//! └──────────────────────────────────┘
//!     │
//!     ▼
//!   lane 2 queue -> lane 2 worker
//! ```
//!
//! The mapping depends on `lane_count`. Restarting with a different lane
//! count reshuffles keys, so ordering holds within one process run only.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic key-to-lane mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    lane_count: usize,
}

impl ShardRouter {
    /// Create a router over `lane_count` lanes.
    ///
    /// A lane count of zero is treated as one lane.
    pub fn new(lane_count: usize) -> Self {
        Self {
            lane_count: lane_count.max(1),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    /// Lane index for `key`, always in `0..lane_count`.
    pub fn route(&self, key: &str) -> usize {
        route(key, self.lane_count)
    }
}

/// Map `key` to a lane in `0..lane_count`.
pub fn route(key: &str, lane_count: usize) -> usize {
    let lanes = lane_count.max(1) as u64;
    (u64::from(fnv1a32(key.as_bytes())) % lanes) as usize
}
