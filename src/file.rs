//! Paged file container (spec §4.1): `File`, the single-writer `Edit`
//! session, and the many-reader `ReadSnapshot`. Ties [`Storage`], the
//! double-buffered [`FileHeader`], and the sub-file stores together.
//!
//! Grounded on the teacher's `OpenOptions`/`CommitUnit` commit-sequencing
//! pattern in the old `lib.rs`: a writer mutates an in-memory header, then a
//! single `commit()` call flushes data, writes the inactive slot, and flips
//! which slot is active. `EditInProgress` is enforced here at the type
//! level — `Edit<'_>` holds `&mut File`, so the borrow checker already
//! refuses a second concurrent edit or an overlapping snapshot; `begin_edit`
//! only needs to check its own `edit_open` flag to produce the documented
//! error instead of a generic borrow-check failure.

use std::collections::HashSet;
use std::path::Path;

use log::{debug, warn};

use snapdb_tree::encoding::NodeEncoding;
use snapdb_tree::key::{KeyType, ValueType};
use snapdb_tree::tree::SortedTree;

use crate::guid::Guid;
use crate::header::{FileHeader, SubFileEntry};
use crate::storage::Storage;
use crate::subfile::{ReadOnlySubFileStore, SubFileStore};
use crate::Error;

/// Default block size for `create`/`create_in_memory` (spec §6: "Default
/// block size 4096").
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// An open archive file: owns the backing storage and the in-memory header.
///
/// At most one [`Edit`] may be open at a time (spec §5, single-writer); any
/// number of [`ReadSnapshot`]s may coexist, but none may overlap a live
/// `Edit` — `Edit::new` takes `&mut File`, so the compiler enforces this
/// more strictly than the spec requires (which only forbids a writer and
/// reader from blocking each other, not from existing at the same instant).
/// See DESIGN.md.
pub struct File {
    storage: Storage,
    header: FileHeader,
    active_is_slot1: bool,
    edit_open: bool,
}

impl File {
    /// `create(path, blockSize, flags)` (spec §4.1). `flags` is spec.md's
    /// file-type flag bitmask (see [`FileHeader::flags`]).
    pub fn create(path: &Path, block_size: u32, flags: u64) -> Result<Self, Error> {
        let mut storage = Storage::open(path, block_size as usize, false, true)?;
        let mut header = FileHeader::new(block_size);
        header.flags = flags;
        let active_is_slot1 = header.commit(&mut storage, false)?;
        debug!("created archive at {:?}, block size {block_size}", path);
        Ok(Self { storage, header, active_is_slot1, edit_open: false })
    }

    /// `createInMemory(...)` (spec §4.1).
    pub fn create_in_memory(block_size: u32, flags: u64) -> Result<Self, Error> {
        let mut storage = Storage::open_anon(block_size as usize, 2)?;
        let mut header = FileHeader::new(block_size);
        header.flags = flags;
        let active_is_slot1 = header.commit(&mut storage, false)?;
        Ok(Self { storage, header, active_is_slot1, edit_open: false })
    }

    /// `open(path, readOnly)` (spec §4.1). Unlike spec.md's signature, the
    /// block size must be supplied up front: picking it out of the header
    /// would require reading block 0 at a block size we don't know yet. See
    /// DESIGN.md.
    pub fn open(path: &Path, block_size: u32, read_only: bool) -> Result<Self, Error> {
        let storage = Storage::open(path, block_size as usize, read_only, false)?;
        let (header, active_is_slot1) = FileHeader::load_active(&storage)?;
        if header.block_size != block_size {
            return Err(Error::Corrupt { reason: "header block size does not match the opened block size" });
        }
        debug!("opened archive at {:?}, sequence {}", path, header.sequence);
        Ok(Self { storage, header, active_is_slot1, edit_open: false })
    }

    /// `changeExtension`/`changeShareMode` (spec §4.1) both reduce, in this
    /// design, to re-acquiring the backing file's advisory lock in shared or
    /// exclusive mode. There is no file extension to rename, so only the
    /// share-mode half is implemented.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<(), Error> {
        if self.edit_open {
            return Err(Error::EditInProgress);
        }
        self.storage.set_read_only(read_only)
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// `beginEdit() → Edit` (spec §4.1). Fails with `EditInProgress` if an
    /// edit is already open on this file.
    pub fn begin_edit(&mut self) -> Result<Edit<'_>, Error> {
        if self.edit_open {
            return Err(Error::EditInProgress);
        }
        self.edit_open = true;
        let original_header = self.header.clone();
        let last_allocated_block = self.header.last_allocated_block;
        Ok(Edit { file: self, original_header, last_allocated_block, written_this_edit: HashSet::new(), committed: false })
    }

    /// `snapshot() → ReadSnapshot` (spec §4.1). Pins a clone of the
    /// currently-committed header; later commits on this `File` do not
    /// affect a snapshot taken before them.
    pub fn snapshot(&self) -> ReadSnapshot<'_> {
        ReadSnapshot { storage: &self.storage, header: self.header.clone() }
    }

    /// `close` (spec §4.1). Dropping a `File` releases its lock already;
    /// this just flushes first so a caller doesn't have to reason about
    /// when the final flush happens.
    pub fn close(mut self) -> Result<(), Error> {
        self.storage.flush()
    }
}

/// A single-writer editing session (spec §4.1, §4.2, §5).
///
/// Sub-file pointer and allocation-counter changes are applied directly to
/// the parent `File`'s header as tree operations run (through
/// [`SubFileStore`]); `rollback` discards them by restoring the header
/// captured at `begin_edit`, and `commit` makes them durable.
pub struct Edit<'a> {
    file: &'a mut File,
    original_header: FileHeader,
    last_allocated_block: u32,
    written_this_edit: HashSet<u32>,
    committed: bool,
}

impl<'a> Edit<'a> {
    /// `createSubFile(name) → SubFileStream` (spec §4.1). `name` here is the
    /// purpose/key-type/value-type GUID triple spec §6 calls a sub-file's
    /// "name"; the caller also supplies the type-parameter pair it will use
    /// to open the tree (`with_tree`) so this layer never needs a factory
    /// keyed off the GUIDs.
    pub fn create_sub_file(&mut self, purpose: Guid, key_type: Guid, value_type: Guid) -> Result<u16, Error> {
        let file_id = self.file.header.next_sub_file_id();
        let entry = SubFileEntry {
            file_id,
            purpose,
            key_type,
            value_type,
            direct: 0,
            single_indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
            quadruple_indirect: 0,
            next_logical_page: 0,
            root_block: 0,
            root_level: 0,
        };
        self.file.header.sub_files.push(entry)?;
        Ok(file_id)
    }

    pub fn find_sub_file(&self, purpose: Guid) -> Option<u16> {
        self.file.header.sub_files.iter().find(|e| e.purpose == purpose).map(|e| e.file_id)
    }

    /// `openSubFile(name|id) → SubFileStream(readWrite)` (spec §4.1),
    /// fused with the tree layer: runs `f` against the sub-file's
    /// [`SortedTree`], then writes the tree's (possibly moved) root back
    /// into the sub-file's directory entry. The `SubFileStore` backing the
    /// tree only borrows the entry for the duration of `f`, so the
    /// root/level write-back below never conflicts with that borrow.
    pub fn with_tree<K, V, E, R>(
        &mut self,
        file_id: u16,
        f: impl FnOnce(&mut SortedTree<K, V, E, SubFileStore<'_>>) -> Result<R, Error>,
    ) -> Result<R, Error>
    where
        K: KeyType,
        V: ValueType,
        E: NodeEncoding<K, V>,
    {
        let (new_root_block, new_root_level, result) = {
            let File { storage, header, .. } = &mut *self.file;
            let entry = header.find_mut(file_id).ok_or(Error::NotFound(Guid::ZERO))?;
            let is_new = entry.next_logical_page == 0;
            let root_block = entry.root_block;
            let root_level = entry.root_level;
            let store = SubFileStore::new(storage, entry, &mut self.last_allocated_block, &mut self.written_this_edit);
            let mut tree = if is_new { SortedTree::create(store)? } else { SortedTree::open(store, root_block, root_level) };
            let result = f(&mut tree)?;
            (tree.root_block(), tree.root_level(), result)
        };
        let entry = self.file.header.find_mut(file_id).ok_or(Error::NotFound(Guid::ZERO))?;
        entry.root_block = new_root_block;
        entry.root_level = new_root_level;
        Ok(result)
    }

    /// `commit()` (spec §4.1, §5): flush data blocks (already durable as
    /// writes happened, via `SubFileStore`), persist the allocation
    /// counter, write the new header to the inactive slot, fsync, and flip
    /// the active slot.
    pub fn commit(mut self) -> Result<(), Error> {
        self.file.storage.flush()?;
        self.file.header.last_allocated_block = self.last_allocated_block;
        let new_slot1 = self.file.header.commit(&mut self.file.storage, self.file.active_is_slot1)?;
        self.file.active_is_slot1 = new_slot1;
        self.file.edit_open = false;
        self.committed = true;
        debug!("committed edit, new sequence {}", self.file.header.sequence);
        Ok(())
    }

    /// `rollback()` (spec §4.1). Discards every header mutation made during
    /// this edit; blocks allocated but never referenced by the restored
    /// header are simply left unreferenced (spec §3: reclaimable before the
    /// next commit).
    pub fn rollback(mut self) {
        self.file.header = self.original_header.clone();
        self.file.edit_open = false;
        self.committed = true;
        warn!("rolled back edit, {} blocks allocated and discarded", self.written_this_edit.len());
    }
}

impl<'a> Drop for Edit<'a> {
    fn drop(&mut self) {
        if !self.committed {
            self.file.header = self.original_header.clone();
            self.file.edit_open = false;
        }
    }
}

/// A pinned, read-only view of a committed header (spec §4.1, §5). Any
/// number of snapshots may coexist and scan concurrently; none of them
/// ever block, or are blocked by, a writer.
pub struct ReadSnapshot<'a> {
    storage: &'a Storage,
    header: FileHeader,
}

impl<'a> ReadSnapshot<'a> {
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn find_sub_file(&self, purpose: Guid) -> Option<u16> {
        self.header.sub_files.iter().find(|e| e.purpose == purpose).map(|e| e.file_id)
    }

    /// `openSubFile(name|id) → SubFileStream(readOnly)` (spec §4.1), fused
    /// with the tree layer as in [`Edit::with_tree`], but read-only and
    /// with no write-back: a snapshot's header is never mutated.
    pub fn open_sub_file<K, V, E>(&self, file_id: u16) -> Result<SortedTree<K, V, E, ReadOnlySubFileStore<'a>>, Error>
    where
        K: KeyType,
        V: ValueType,
        E: NodeEncoding<K, V>,
    {
        let entry = *self.header.find(file_id).ok_or(Error::NotFound(Guid::ZERO))?;
        let store = ReadOnlySubFileStore::new(self.storage, entry);
        Ok(SortedTree::open(store, entry.root_block, entry.root_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapdb_tree::encoding::FixedSizePair;

    #[test]
    fn single_insert_and_read_through_an_edit() {
        let mut file = File::create_in_memory(4096, 0).unwrap();
        let mut edit = file.begin_edit().unwrap();
        let id = edit.create_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE, Guid::ZERO, Guid::ZERO).unwrap();
        edit.with_tree::<i32, i32, FixedSizePair, _>(id, |tree| {
            assert!(tree.try_add(&1, &1)?);
            assert_eq!(tree.try_get(&1)?, Some(1));
            Ok(())
        })
        .unwrap();
        edit.commit().unwrap();

        let snap = file.snapshot();
        let sub_file_id = snap.find_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE).unwrap();
        let tree = snap.open_sub_file::<i32, i32, FixedSizePair>(sub_file_id).unwrap();
        assert_eq!(tree.try_get(&1).unwrap(), Some(1));
        assert_eq!(tree.get_key_range().unwrap(), Some((1, 1)));
    }

    #[test]
    fn second_edit_fails_with_edit_in_progress() {
        let mut file = File::create_in_memory(4096, 0).unwrap();
        let _edit = file.begin_edit().unwrap();
        assert!(matches!(file.begin_edit(), Err(Error::EditInProgress)));
    }

    #[test]
    fn commit_then_rollback_scenario() {
        let mut file = File::create_in_memory(4096, 0).unwrap();
        let mut edit = file.begin_edit().unwrap();
        let a = edit.create_sub_file(Guid([1u8; 16]), Guid::ZERO, Guid::ZERO).unwrap();
        let b = edit.create_sub_file(Guid([2u8; 16]), Guid::ZERO, Guid::ZERO).unwrap();
        let c = edit.create_sub_file(Guid([3u8; 16]), Guid::ZERO, Guid::ZERO).unwrap();
        for id in [a, b, c] {
            edit.with_tree::<i32, i32, FixedSizePair, _>(id, |tree| {
                tree.try_add(&1, &1)?;
                Ok(())
            })
            .unwrap();
        }
        edit.commit().unwrap();
        let sequence_after_first_commit = file.header().sequence;

        let mut edit2 = file.begin_edit().unwrap();
        edit2
            .with_tree::<i32, i32, FixedSizePair, _>(a, |tree| {
                tree.try_add(&3, &3)?;
                Ok(())
            })
            .unwrap();
        edit2.rollback();

        assert_eq!(file.header().sequence, sequence_after_first_commit);
        assert_eq!(file.header().sub_files.len(), 3);
        let snap = file.snapshot();
        let tree = snap.open_sub_file::<i32, i32, FixedSizePair>(a).unwrap();
        assert_eq!(tree.try_get(&1).unwrap(), Some(1));
        assert_eq!(tree.try_get(&3).unwrap(), None);
    }

    #[test]
    fn corrupted_block_surfaces_corrupt_error() {
        let mut file = File::create_in_memory(4096, 0).unwrap();
        let mut edit = file.begin_edit().unwrap();
        let id = edit.create_sub_file(Guid([9u8; 16]), Guid::ZERO, Guid::ZERO).unwrap();
        edit.with_tree::<i32, i32, FixedSizePair, _>(id, |tree| {
            tree.try_add(&1, &1)?;
            Ok(())
        })
        .unwrap();
        edit.commit().unwrap();

        let snap = file.snapshot();
        let root_block = snap.header().find(id).unwrap().direct;
        let mut buf = vec![0u8; 4096];
        snap.storage.read_block(root_block, &mut buf).unwrap();
        buf[10] ^= 0xff;
        // SAFETY-free poke at the in-memory mapping, simulating a bit-flip
        // between commit and the next read.
        drop(snap);
        file.storage.write_block(root_block, &buf).unwrap();

        let snap = file.snapshot();
        let tree = snap.open_sub_file::<i32, i32, FixedSizePair>(id).unwrap();
        assert!(matches!(tree.try_get(&1), Err(_)));
    }
}
