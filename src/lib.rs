//! # AHIndex - Adaptive Hash Index for B-tree Point Lookups
//!
//! AHIndex is an opportunistic, in-memory hash index that sits *beside* a
//! B-tree and remembers which leaf-page record answered a previously seen
//! key prefix. The B-tree remains authoritative; the hash index is a
//! best-effort shortcut that may be silently disabled, cleared, or found
//! stale at any moment.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        B-tree search / DML (caller)           │
//! ├──────────────────────────────────────────────┤
//! │  Fast path (guess_on_hash)  │  Heuristics     │
//! │  + repair on HASH_FAIL      │  (search info)  │
//! ├──────────────────────────────────────────────┤
//! │  Partitioned hash table (buckets + chains)    │
//! │  Slab arena for hash nodes (swap-with-top)    │
//! ├──────────────────────────────────────────────┤
//! │  Buffer pool (frames, states, page latches)   │
//! │  Leaf pages (compact / redundant records)     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The moving parts, bottom up:
//!
//! - [`page`]: 16 KiB leaf pages holding records in either the compact or
//!   the redundant row format, chained in key order between infimum and
//!   supremum pseudo-records.
//! - [`pool`]: a fixed-frame buffer pool. Frames back both leaf pages and,
//!   borrowed one at a time, the hash-node slab, so memory accounting stays
//!   in one place.
//! - [`fold`]: CRC-32C fingerprints of `(index id, record prefix)`. A
//!   record fold and a tuple fold agree whenever the encoded prefix bytes
//!   agree; that equivalence is what makes a hash hit trustworthy.
//! - [`ahi`]: the index itself - partitioned bucket chains keyed by fold,
//!   a self-tuning heuristic deciding when a page deserves a hash, build
//!   and drop of whole-page entries, and the guarded fast-path lookup.
//! - [`dict`] and [`cursor`]: index descriptors with their racy-by-design
//!   search statistics, and the positioning cursor that carries match
//!   state between the B-tree and the heuristic.
//!
//! ## Usage
//!
//! ```ignore
//! use ahindex::{AhiConfig, BufferPool, Dict, Mtr, SearchSys};
//!
//! let pool = Arc::new(BufferPool::new(256)?);
//! let dict = Arc::new(Dict::new());
//! let ahi = SearchSys::new(AhiConfig::default(), pool.clone(), dict.clone())?;
//!
//! // After every B-tree positioning:
//! ahi.search_info_update(&mut cursor);
//!
//! // Before descending the B-tree:
//! let mut mtr = Mtr::new(&pool);
//! if ahi.guess_on_hash(&index, &tuple, SearchMode::Ge,
//!                      LatchMode::Shared, &mut cursor, &mut mtr) {
//!     // cursor is positioned; the page is latched and pinned in mtr
//! }
//! ```
//!
//! ## Guarantees and non-guarantees
//!
//! - A successful guess positions the cursor on a user record whose prefix
//!   fingerprint matches the probe and which satisfies the search mode
//!   relative to the tuple. Nothing else is promised.
//! - Every other outcome is a miss: the caller falls back to the B-tree,
//!   and the next `search_info_update` lazily repairs one stale entry.
//! - No operation ever fails a caller: out-of-memory, contention, stale
//!   metadata, and a disabled index all degrade to "no effect".
//! - There is no durability. The index holds no authoritative state and is
//!   rebuilt from scratch by usage after enable/disable cycles.

pub mod ahi;
pub mod config;
pub mod cursor;
pub mod dict;
pub mod fold;
pub mod monitor;
pub mod page;
pub mod pool;
pub mod records;

pub use ahi::{AhiConfig, SearchSys};
pub use cursor::{Cursor, CursorFlag, LatchMode, Mtr, SearchMode};
pub use dict::{Dict, FieldDef, IndexDef, IndexId};
pub use monitor::SearchStatsSnapshot;
pub use pool::{BufferPool, PageId, RecPtr};
pub use records::{PrefixParams, RecordFormat, Tuple, TupleField};
