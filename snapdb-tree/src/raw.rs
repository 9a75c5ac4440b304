//! The seam between the tree (this crate) and whatever owns physical block
//! storage (the paged file container, in `snapdb-core`). The tree never
//! touches a file, a mmap, or a lock directly — it only asks its
//! [`NodeStore`] to copy block-sized buffers in and out by block index.
//!
//! The API is copy-based rather than borrow-based: a `read_block`/
//! `write_block` pair that hands back `&mut [u8]` tied to `&mut self` would
//! make it impossible to hold two blocks open at once (the common case
//! during a split, where both halves of a node must be live
//! simultaneously). Copying a few kilobytes per node touch is cheap next to
//! the I/O this sits on top of.

use crate::StorageError;

/// Block-granularity storage backing a single sorted tree's sub-file.
///
/// Implementations are responsible for copy-on-write semantics (spec
/// §4.2): `write_block` on a block committed in a prior snapshot copies it
/// first and returns the new block number.
pub trait NodeStore {
    /// Size of one node's payload in bytes (block size minus any footer
    /// the backing container reserves for itself).
    fn block_size(&self) -> usize;

    /// Copy `block`'s current contents into `out` (`out.len()` must equal
    /// `block_size()`).
    fn read_block(&self, block: u32, out: &mut [u8]) -> Result<(), StorageError>;

    /// Write `data` back to `block`. If `block` belongs to an already
    /// committed snapshot, the implementation copies it to a fresh block
    /// first and returns `Some(new_block)`; `data` lands in that block
    /// instead of the original.
    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<Option<u32>, StorageError>;

    /// Allocate a fresh, zeroed block, returning its index.
    fn alloc_block(&mut self) -> Result<u32, StorageError>;

    /// Mark a block as reclaimable once the current edit either commits or
    /// aborts (spec §3: "Any block allocated but not referenced by the
    /// committed header is reclaimable before next commit").
    fn free_block(&mut self, block: u32) -> Result<(), StorageError>;
}
