//! # Adaptive Hash Index Configuration Constants
//!
//! This module centralizes the tuning constants of the crate, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> NODE_SIZE (16 bytes)          hash node, must divide PAGE_SIZE
//!       │     └─> NODES_PER_FRAME         slots per borrowed slab frame
//!       │
//!       └─> hash table sizing at enable(): pool bytes / ptr size / 64,
//!           split evenly across partitions
//!
//! BUILD_LIMIT (100)
//!       │
//!       └─> POTENTIAL_CLAMP (BUILD_LIMIT + 5)
//!             upper bound of the per-index success streak; keeps a long
//!             streak from taking forever to decay after a workload shift
//! ```

// ============================================================================
// PAGE AND NODE LAYOUT
// ============================================================================

/// Size of each buffer-pool frame in bytes (16 KiB). The fundamental unit
/// for both leaf pages and borrowed slab frames.
pub const PAGE_SIZE: usize = 16384;

/// Size of one hash-chain node in bytes.
pub const NODE_SIZE: usize = 16;

/// Number of node slots in a page-sized slab frame.
pub const NODES_PER_FRAME: usize = PAGE_SIZE / NODE_SIZE;

const _: () = assert!(
    PAGE_SIZE % NODE_SIZE == 0,
    "slab frames must hold a whole number of nodes"
);

const _: () = assert!(
    NODES_PER_FRAME <= u16::MAX as usize,
    "node slots are addressed by a 16-bit slot index"
);

// ============================================================================
// HEURISTIC THRESHOLDS
// ============================================================================

/// Length of the consecutive potentially-successful-search streak an index
/// must accumulate before any of its pages may be hashed.
pub const BUILD_LIMIT: u8 = 100;

/// If the number of per-page accesses consistent with the recommendation
/// exceeds the page's record count divided by this, and the global streak
/// is long enough, the page hash is built.
pub const PAGE_BUILD_LIMIT: u16 = 16;

/// Upper clamp of the per-index success streak.
pub const POTENTIAL_CLAMP: u8 = BUILD_LIMIT + 5;

/// Number of positionings to sit out after the prefix recommendation
/// changes, before analyzing again. Saves CPU while there is no chance of a
/// stable recommendation.
pub const HASH_ANALYSIS_THRESHOLD: u16 = 17;

const _: () = assert!(
    POTENTIAL_CLAMP as u16 == BUILD_LIMIT as u16 + 5,
    "POTENTIAL_CLAMP derivation mismatch"
);

// ============================================================================
// CONCURRENCY AND BATCHING
// ============================================================================

/// Default number of hash table partitions. An index is pinned to the
/// partition `index_id % n_parts`; more partitions mean less latch
/// contention across indexes.
pub const DEFAULT_N_PARTS: usize = 8;

/// Number of page-hash chain lock shards in the buffer pool.
pub const CHAIN_LOCK_COUNT: usize = 64;

/// Records staged per exclusive-latch window while building a page hash.
pub const BUILD_BATCH: usize = 64;

/// Fold values staged per exclusive-latch window while dropping a page
/// hash.
pub const DROP_BATCH: usize = 128;

/// Hash cells checked per latch window during validation. Latches are
/// released and reacquired between chunks to reduce starvation.
pub const VALIDATE_CHUNK: usize = 10_000;

// ============================================================================
// RECORD FORMAT LIMITS
// ============================================================================

/// Largest fixed column width the redundant-format NULL filler covers.
pub const MAX_FIXED_FIELD_LEN: usize = 256;
