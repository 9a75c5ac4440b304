//! Sub-file stream (spec §4.2): translates a logical page number within one
//! named sub-file into a physical block, walking up to four levels of
//! indirect index blocks, and implements [`snapdb_tree::NodeStore`] on top
//! so a [`snapdb_tree::SortedTree`] can treat a sub-file as if it were a
//! flat array of block-sized node slots.
//!
//! Physical block allocation is one monotonically increasing counter in the
//! file header (spec §4.1), shared by every sub-file's data pages and
//! indirect index blocks in the archive.

use std::collections::HashSet;

use snapdb_tree::subfile::{fan_out, map_page, IndirectLevel};
use snapdb_tree::{NodeStore, StorageError};

use crate::footer::{Footer, BLOCK_TYPE_INDEX, BLOCK_TYPE_NODE, FOOTER_SIZE};
use crate::header::SubFileEntry;
use crate::storage::Storage;
use crate::Error;

/// Borrowed view over one sub-file's directory entry plus the shared
/// physical block allocator, wired into [`NodeStore`] for the tree layer.
///
/// Copy-on-write (spec §3, §4.2): a physical block is only overwritten in
/// place if it was allocated during the *current* edit (tracked in
/// `written_this_edit`); otherwise a write allocates a fresh physical
/// block and rewrites whichever index pointer addressed the old one,
/// cascading the rename up through any indirect blocks that themselves
/// turn out to need copy-on-write.
pub struct SubFileStore<'a> {
    storage: &'a mut Storage,
    entry: &'a mut SubFileEntry,
    last_allocated_block: &'a mut u32,
    written_this_edit: &'a mut HashSet<u32>,
    payload_size: usize,
}

impl<'a> SubFileStore<'a> {
    pub fn new(
        storage: &'a mut Storage,
        entry: &'a mut SubFileEntry,
        last_allocated_block: &'a mut u32,
        written_this_edit: &'a mut HashSet<u32>,
    ) -> Self {
        let payload_size = storage.block_size() - FOOTER_SIZE;
        Self { storage, entry, last_allocated_block, written_this_edit, payload_size }
    }

    fn alloc_physical(&mut self) -> u32 {
        *self.last_allocated_block += 1;
        let block = *self.last_allocated_block;
        self.written_this_edit.insert(block);
        block
    }

    fn fan_out(&self) -> u64 {
        fan_out(self.payload_size)
    }

    fn indices_for(&self, page: u64) -> Result<(IndirectLevel, [u32; 4], usize), Error> {
        let f = self.fan_out();
        let addr = map_page(page, f).map_err(StorageError::from)?;
        let depth = match addr.level {
            IndirectLevel::Direct => 0,
            IndirectLevel::Single => 1,
            IndirectLevel::Double => 2,
            IndirectLevel::Triple => 3,
            IndirectLevel::Quadruple => 4,
        };
        Ok((addr.level, addr.indices, depth))
    }

    fn root_for(&self, level: IndirectLevel) -> u32 {
        match level {
            IndirectLevel::Direct => self.entry.direct,
            IndirectLevel::Single => self.entry.single_indirect,
            IndirectLevel::Double => self.entry.double_indirect,
            IndirectLevel::Triple => self.entry.triple_indirect,
            IndirectLevel::Quadruple => self.entry.quadruple_indirect,
        }
    }

    fn set_root_for(&mut self, level: IndirectLevel, block: u32) {
        match level {
            IndirectLevel::Direct => self.entry.direct = block,
            IndirectLevel::Single => self.entry.single_indirect = block,
            IndirectLevel::Double => self.entry.double_indirect = block,
            IndirectLevel::Triple => self.entry.triple_indirect = block,
            IndirectLevel::Quadruple => self.entry.quadruple_indirect = block,
        }
    }

    fn read_index_slot(&self, indirect_block: u32, slot: u32) -> Result<u32, Error> {
        let mut buf = vec![0u8; self.storage.block_size()];
        self.storage.read_block(indirect_block, &mut buf)?;
        Footer::verify(&buf, indirect_block)?;
        let off = slot as usize * 4;
        Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
    }

    /// Write one 32-bit child pointer into an indirect block at `slot`,
    /// copy-on-write renaming the indirect block itself if it was not
    /// allocated during this edit. Returns the (possibly new) block number.
    fn write_index_slot(&mut self, indirect_block: u32, slot: u32, value: u32) -> Result<u32, Error> {
        let block_size = self.storage.block_size();
        let mut buf = vec![0u8; block_size];
        let target = if indirect_block != 0 {
            self.storage.read_block(indirect_block, &mut buf)?;
            Footer::verify(&buf, indirect_block)?;
            indirect_block
        } else {
            0
        };
        let renamed = target == 0 || !self.written_this_edit.contains(&target);
        let block = if renamed { self.alloc_physical() } else { target };
        let off = slot as usize * 4;
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        Footer::stamp(&mut buf, block, self.entry.file_id as u32, BLOCK_TYPE_INDEX, 0);
        self.storage.write_block(block, &buf)?;
        Ok(block)
    }

    /// Read-only lookup: the physical block logical `page` currently maps
    /// to, or 0 if any part of the chain is unallocated.
    fn get_page_pointer(&self, page: u64) -> Result<u32, Error> {
        let (level, indices, depth) = self.indices_for(page)?;
        if depth == 0 {
            return Ok(self.root_for(level));
        }
        let mut current = self.root_for(level);
        for &idx in &indices[..depth] {
            if current == 0 {
                return Ok(0);
            }
            current = self.read_index_slot(current, idx)?;
        }
        Ok(current)
    }

    /// Point logical `page` at `new_physical`, allocating any missing
    /// intermediate indirect blocks and cascading copy-on-write renames of
    /// existing ones up to the sub-file's root pointer.
    fn set_page_pointer(&mut self, page: u64, new_physical: u32) -> Result<(), Error> {
        let (level, indices, depth) = self.indices_for(page)?;
        if depth == 0 {
            self.set_root_for(level, new_physical);
            return Ok(());
        }
        // Read the existing chain top-down, stopping at the first gap.
        let mut chain = vec![self.root_for(level)];
        for &idx in &indices[..depth] {
            let cur = *chain.last().unwrap();
            if cur == 0 {
                break;
            }
            chain.push(self.read_index_slot(cur, idx)?);
        }
        while chain.len() <= depth {
            chain.push(0);
        }
        if chain[0] == 0 {
            chain[0] = self.alloc_physical();
            self.set_root_for(level, chain[0]);
        }
        // Walk down, writing (and possibly COW-renaming) each indirect
        // block in turn; a rename is propagated into the parent slot
        // immediately, which itself may cascade the same way.
        for (i, &idx) in indices[..depth].iter().enumerate() {
            let is_last = i == depth - 1;
            let value = if is_last { new_physical } else { chain[i + 1] };
            let parent = chain[i];
            let new_parent = self.write_index_slot(parent, idx, value)?;
            if new_parent != parent {
                chain[i] = new_parent;
                if i == 0 {
                    self.set_root_for(level, new_parent);
                } else {
                    self.propagate_rename(&chain, &indices, i, new_parent, level)?;
                }
            }
        }
        Ok(())
    }

    /// Having just renamed `chain[depth]` to `new_block`, rewrite
    /// `chain[depth - 1]`'s slot to point at it, cascading further up if
    /// that rewrite itself renames `chain[depth - 1]`.
    fn propagate_rename(&mut self, chain: &[u32], indices: &[u32; 4], depth: usize, new_block: u32, level: IndirectLevel) -> Result<(), Error> {
        let mut child_value = new_block;
        let mut d = depth;
        while d > 0 {
            let parent = chain[d - 1];
            let new_parent = self.write_index_slot(parent, indices[d - 1], child_value)?;
            if new_parent == parent {
                return Ok(());
            }
            child_value = new_parent;
            d -= 1;
        }
        self.set_root_for(level, child_value);
        Ok(())
    }

    fn next_unused_page(&mut self) -> u64 {
        let page = self.entry.next_logical_page as u64;
        self.entry.next_logical_page += 1;
        page
    }
}

impl<'a> NodeStore for SubFileStore<'a> {
    fn block_size(&self) -> usize {
        self.payload_size
    }

    fn read_block(&self, block: u32, out: &mut [u8]) -> Result<(), StorageError> {
        let physical = self
            .get_page_pointer(block as u64)
            .map_err(|_| StorageError::Io("failed to resolve logical block"))?;
        if physical == 0 {
            return Err(StorageError::Io("read of unallocated node block"));
        }
        let mut buf = vec![0u8; self.storage.block_size()];
        self.storage.read_block(physical, &mut buf).map_err(|_| StorageError::Io("storage read failed"))?;
        Footer::verify(&buf, physical).map_err(|_| StorageError::Corruption("node block checksum mismatch"))?;
        out.copy_from_slice(&buf[..self.payload_size]);
        Ok(())
    }

    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<Option<u32>, StorageError> {
        let existing = self
            .get_page_pointer(block as u64)
            .map_err(|_| StorageError::Io("failed to resolve logical block for write"))?;
        if existing == 0 {
            return Err(StorageError::Io("write to a logical block that was never allocated"));
        }
        let renamed = !self.written_this_edit.contains(&existing);
        let physical = if renamed {
            let new_block = self.alloc_physical();
            self.set_page_pointer(block as u64, new_block).map_err(|_| StorageError::Io("failed to repoint copy-on-write block"))?;
            new_block
        } else {
            existing
        };
        let block_size = self.storage.block_size();
        let mut buf = vec![0u8; block_size];
        buf[..self.payload_size].copy_from_slice(data);
        Footer::stamp(&mut buf, physical, self.entry.file_id as u32, BLOCK_TYPE_NODE, 0);
        self.storage.write_block(physical, &buf).map_err(|_| StorageError::Io("storage write failed"))?;
        Ok(if renamed { Some(physical) } else { None })
    }

    fn alloc_block(&mut self) -> Result<u32, StorageError> {
        let page = self.next_unused_page();
        let physical = self.alloc_physical();
        self.set_page_pointer(page, physical).map_err(|_| StorageError::Io("failed to allocate logical block"))?;
        Ok(page as u32)
    }

    fn free_block(&mut self, _block: u32) -> Result<(), StorageError> {
        // Spec §3: a block unreferenced by the committed header is
        // reclaimable before the next commit. This single-writer,
        // single-edit-at-a-time model never reuses a page within the same
        // edit it was freed in, so there is nothing to do here beyond
        // letting the page go unreferenced — the next commit's header
        // simply never points at it again. See DESIGN.md.
        Ok(())
    }
}

impl From<StorageError> for Error {
    fn from(value: StorageError) -> Self {
        Error::from(snapdb_tree::Error::from(value))
    }
}

/// A read-only view over one sub-file, used by [`crate::file::ReadSnapshot`]
/// so any number of snapshots can scan the same committed tree
/// concurrently without contending on a `&mut Storage`. Implements
/// [`NodeStore`] in full (as the tree layer requires) but its mutating
/// methods are unreachable from a pure scan and fail loudly if ever hit.
pub struct ReadOnlySubFileStore<'a> {
    storage: &'a Storage,
    entry: SubFileEntry,
    payload_size: usize,
}

impl<'a> ReadOnlySubFileStore<'a> {
    /// Takes `entry` by value (it is `Copy`) rather than by reference, so a
    /// [`crate::file::ReadSnapshot`] can hand out stores for entries read out
    /// of its own owned header clone without tying their lifetime to it.
    pub fn new(storage: &'a Storage, entry: SubFileEntry) -> Self {
        let payload_size = storage.block_size() - FOOTER_SIZE;
        Self { storage, entry, payload_size }
    }

    fn root_for(&self, level: IndirectLevel) -> u32 {
        match level {
            IndirectLevel::Direct => self.entry.direct,
            IndirectLevel::Single => self.entry.single_indirect,
            IndirectLevel::Double => self.entry.double_indirect,
            IndirectLevel::Triple => self.entry.triple_indirect,
            IndirectLevel::Quadruple => self.entry.quadruple_indirect,
        }
    }

    fn read_index_slot(&self, indirect_block: u32, slot: u32) -> Result<u32, Error> {
        let mut buf = vec![0u8; self.storage.block_size()];
        self.storage.read_block(indirect_block, &mut buf)?;
        Footer::verify(&buf, indirect_block)?;
        let off = slot as usize * 4;
        Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
    }

    fn get_page_pointer(&self, page: u64) -> Result<u32, Error> {
        let f = fan_out(self.payload_size);
        let addr = map_page(page, f).map_err(StorageError::from)?;
        let (level, indices, depth) = match addr.level {
            IndirectLevel::Direct => (addr.level, addr.indices, 0),
            IndirectLevel::Single => (addr.level, addr.indices, 1),
            IndirectLevel::Double => (addr.level, addr.indices, 2),
            IndirectLevel::Triple => (addr.level, addr.indices, 3),
            IndirectLevel::Quadruple => (addr.level, addr.indices, 4),
        };
        let mut current = self.root_for(level);
        for &idx in &indices[..depth] {
            if current == 0 {
                return Ok(0);
            }
            current = self.read_index_slot(current, idx)?;
        }
        Ok(current)
    }

    pub fn root_block(&self) -> u32 {
        self.entry.root_block
    }

    pub fn root_level(&self) -> u8 {
        self.entry.root_level
    }
}

impl<'a> NodeStore for ReadOnlySubFileStore<'a> {
    fn block_size(&self) -> usize {
        self.payload_size
    }

    fn read_block(&self, block: u32, out: &mut [u8]) -> Result<(), StorageError> {
        let physical = self.get_page_pointer(block as u64).map_err(|_| StorageError::Io("failed to resolve logical block"))?;
        if physical == 0 {
            return Err(StorageError::Io("read of unallocated node block"));
        }
        let mut buf = vec![0u8; self.storage.block_size()];
        self.storage.read_block(physical, &mut buf).map_err(|_| StorageError::Io("storage read failed"))?;
        Footer::verify(&buf, physical).map_err(|_| StorageError::Corruption("node block checksum mismatch"))?;
        out.copy_from_slice(&buf[..self.payload_size]);
        Ok(())
    }

    fn write_block(&mut self, _block: u32, _data: &[u8]) -> Result<Option<u32>, StorageError> {
        Err(StorageError::Io("attempted write through a read-only snapshot"))
    }

    fn alloc_block(&mut self) -> Result<u32, StorageError> {
        Err(StorageError::Io("attempted allocation through a read-only snapshot"))
    }

    fn free_block(&mut self, _block: u32) -> Result<(), StorageError> {
        Err(StorageError::Io("attempted free through a read-only snapshot"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;

    fn entry() -> SubFileEntry {
        SubFileEntry {
            file_id: 0,
            purpose: Guid::ZERO,
            key_type: Guid::ZERO,
            value_type: Guid::ZERO,
            direct: 0,
            single_indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
            quadruple_indirect: 0,
            next_logical_page: 0,
            root_block: 0,
            root_level: 0,
        }
    }

    #[test]
    fn alloc_then_write_then_read_round_trips() {
        let mut storage = Storage::open_anon(256, 4).unwrap();
        let mut e = entry();
        let mut last_block = 1u32;
        let mut written = HashSet::new();
        let mut store = SubFileStore::new(&mut storage, &mut e, &mut last_block, &mut written);
        let block = store.alloc_block().unwrap();
        let payload_size = store.block_size();
        let data = vec![0x42u8; payload_size];
        let renamed = store.write_block(block, &data).unwrap();
        assert!(renamed.is_none());
        let mut out = vec![0u8; payload_size];
        store.read_block(block, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn write_past_fan_out_uses_single_indirect() {
        let mut storage = Storage::open_anon(64, 4).unwrap();
        let mut e = entry();
        let mut last_block = 1u32;
        let mut written = HashSet::new();
        let mut store = SubFileStore::new(&mut storage, &mut e, &mut last_block, &mut written);
        let payload_size = store.block_size();
        let mut last_logical = 0u32;
        for i in 0..20u32 {
            last_logical = store.alloc_block().unwrap();
            let data = vec![i as u8; payload_size];
            store.write_block(last_logical, &data).unwrap();
        }
        let mut out = vec![0u8; payload_size];
        store.read_block(last_logical, &mut out).unwrap();
        assert_eq!(out[0], 19);
        assert_ne!(e.single_indirect, 0);
    }

    #[test]
    fn rewriting_a_committed_block_renames_it_and_updates_index() {
        let mut storage = Storage::open_anon(64, 4).unwrap();
        let mut e = entry();
        let mut last_block = 1u32;
        let mut blocks = Vec::new();
        {
            let mut written = HashSet::new();
            let mut store = SubFileStore::new(&mut storage, &mut e, &mut last_block, &mut written);
            let payload_size = store.block_size();
            for i in 0..20u32 {
                let logical = store.alloc_block().unwrap();
                store.write_block(logical, &vec![i as u8; payload_size]).unwrap();
                blocks.push(logical);
            }
        }
        // New edit: written_this_edit is fresh/empty, so any rewrite must COW.
        let mut written = HashSet::new();
        let mut store = SubFileStore::new(&mut storage, &mut e, &mut last_block, &mut written);
        let payload_size = store.block_size();
        let target = blocks[15];
        let renamed = store.write_block(target, &vec![0xffu8; payload_size]).unwrap();
        assert!(renamed.is_some());
        let mut out = vec![0u8; payload_size];
        store.read_block(target, &mut out).unwrap();
        assert_eq!(out[0], 0xff);
        // Unrelated earlier logical pages are untouched.
        let mut out2 = vec![0u8; payload_size];
        store.read_block(blocks[2], &mut out2).unwrap();
        assert_eq!(out2[0], 2);
    }
}
