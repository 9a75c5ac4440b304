//! A paged, single-writer/many-reader B+-tree storage engine (spec §1–§9):
//! a [`File`] holds any number of named sub-files, each an independently
//! addressed, copy-on-write sorted tree; [`Edit`] is the one writer a file
//! may have open at a time, [`ReadSnapshot`] is a pinned, lock-free reader,
//! and [`UnionReader`] merges many sub-files' scanners into one ordered,
//! deduplicated, seek-windowed stream.
//!
//! Four layers, bottom to top:
//! - **L1** — [`file`]: the paged container, its double-buffered header,
//!   and the commit/rollback protocol (spec §4.1, §5).
//! - **L2** — [`subfile`]: translates a sub-file's logical pages into
//!   physical blocks through up to four levels of indirect index blocks,
//!   copy-on-write renaming a block's ancestry as it's rewritten (spec §4.2).
//! - **L3** — the `snapdb-tree` crate: node encodings, insert/split,
//!   remove, and scanning (spec §4.3).
//! - **L4** — [`union`]: merges many trees' scanners behind seek windows
//!   and an optional match filter (spec §4.4).
//!
//! Every on-disk block, including the file header's two slots, carries the
//! same trailing checksum (spec §3); [`footer`] and [`checksum`] implement
//! that uniformly rather than giving the header its own format.

mod checksum;
mod error;
mod footer;

pub mod file;
pub mod guid;
pub mod header;
pub mod storage;
pub mod subfile;
pub mod union;

pub use error::Error;
pub use file::{Edit, File, ReadSnapshot, DEFAULT_BLOCK_SIZE};
pub use guid::{Guid, ARCHIVE_FILE_TYPE, METADATA_PURPOSE, PRIMARY_ARCHIVE_PURPOSE};
pub use union::{CancelHandle, MatchFilter, SeekFilter, UniverseSeekFilter, UnionReader};

/// Re-exported so callers can name `snapdb_tree::KeyType`, `FixedSizePair`,
/// and friends (needed for [`Edit::with_tree`]'s and
/// [`ReadSnapshot::open_sub_file`]'s type parameters) without a separate
/// `Cargo.toml` dependency on the tree crate.
pub use snapdb_tree;
