//! Sorted tree (B+-tree) operations (spec §4.3): `tryAdd`, `tryGet`,
//! `tryRemove`, range queries, and scanner creation, plus the insert/split
//! algorithm with its sequential-append fast path.
//!
//! Interior nodes always use the fixed-size encoding for their
//! `(key, child_block)` separators — a 32-bit block pointer never benefits
//! from a pluggable compressor. Every write goes through [`NodeStore`],
//! which may copy a block to a new number for copy-on-write (spec §4.2);
//! when that happens the caller one level up patches its child pointer
//! in place and rewrites itself too, so a block rename cascades up to the
//! root exactly once per insert/remove.

use alloc::vec::Vec;

use crate::encoding::{FixedSizePair, NodeEncoding};
use crate::key::{BinarySearchHint, KeyType, ValueType};
use crate::node::{NodeView, NodeViewMut, NO_BLOCK};
use crate::raw::NodeStore;
use crate::scanner::Scanner;
use crate::Error;

enum InsertResult<K> {
    /// The insert completed without a split. `block` is this node's
    /// current block number (unchanged unless copy-on-write moved it).
    Done { block: u32, changed: bool },
    /// This node split. `left_block` is the (possibly renamed) original
    /// node; `new_block` holds the upper half, reachable via `sep_key`.
    Split { sep_key: K, left_block: u32, new_block: u32 },
}

/// A B+-tree stored entirely within one sub-file (spec §3, "Sorted tree").
pub struct SortedTree<K, V, E, S> {
    store: S,
    root_block: u32,
    root_level: u8,
    dirty: bool,
    _marker: core::marker::PhantomData<(K, V, E)>,
}

impl<K, V, E, S> SortedTree<K, V, E, S>
where
    K: KeyType,
    V: ValueType,
    E: NodeEncoding<K, V>,
    S: NodeStore,
{
    /// Create a brand-new, empty tree: a single empty leaf as the root.
    pub fn create(mut store: S) -> Result<Self, Error> {
        let block_size = store.block_size();
        let mut buf = alloc::vec![0u8; block_size];
        let mut leaf = NodeViewMut::<K, V, E>::new(&mut buf);
        leaf.init_empty(NO_BLOCK, NO_BLOCK);
        let block = store.alloc_block().map_err(Error::Storage)?;
        store.write_block(block, &buf).map_err(Error::Storage)?;
        Ok(Self {
            store,
            root_block: block,
            root_level: 0,
            dirty: true,
            _marker: core::marker::PhantomData,
        })
    }

    /// Open a tree whose root is already known (read from the sub-file's
    /// tree header, spec §6).
    pub fn open(store: S, root_block: u32, root_level: u8) -> Self {
        Self {
            store,
            root_block,
            root_level,
            dirty: false,
            _marker: core::marker::PhantomData,
        }
    }

    pub fn root_block(&self) -> u32 {
        self.root_block
    }

    pub fn root_level(&self) -> u8 {
        self.root_level
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag. The actual block I/O already went through
    /// `NodeStore` as it happened; the owning sub-file/edit is responsible
    /// for durability of the committed blocks.
    pub fn flush(&mut self) {
        self.dirty = false;
    }

    fn find_child_and_index(node: &NodeView<'_, K, u32, FixedSizePair>, key: &K) -> Result<(usize, u32), Error> {
        let mut chosen = None;
        for (i, item) in node.iter().enumerate() {
            let (sep, child) = item?;
            if sep.is_less_than(key) || sep.is_equal_to(key) {
                chosen = Some((i, child));
            } else {
                break;
            }
        }
        match chosen {
            Some(c) => Ok(c),
            None => {
                let (_, c) = node.get_at(0)?.ok_or(Error::DataCorruption("interior node has no children"))?;
                Ok((0, c))
            }
        }
    }

    fn find_child(node: &NodeView<'_, K, u32, FixedSizePair>, key: &K) -> Result<u32, Error> {
        Self::find_child_and_index(node, key).map(|(_, c)| c)
    }

    pub fn try_get(&self, key: &K) -> Result<Option<V>, Error> {
        let mut block = self.root_block;
        let mut level = self.root_level;
        let mut buf = alloc::vec![0u8; self.store.block_size()];
        let mut depth = 0;
        loop {
            self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
            if level == 0 {
                let leaf = NodeView::<K, V, E>::new(&buf)?;
                let mut hint = BinarySearchHint::new();
                let idx = leaf.find(key, &mut hint)?;
                if idx < 0 {
                    return Ok(None);
                }
                return Ok(leaf.get_at(idx as usize)?.map(|(_, v)| v));
            }
            let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
            block = Self::find_child(&interior, key)?;
            level -= 1;
            depth += 1;
            if depth > 64 {
                return Err(Error::DataCorruption("tree depth unreasonably large"));
            }
        }
    }

    /// Returns the tree's current `(min, max)` key, or `None` if empty.
    ///
    /// An interior node's own cached `lower_bound`/`upper_bound` header
    /// fields (set at creation/split time by [`Self::set_interior_bounds`])
    /// can go stale between splits: a plain leaf append that extends the
    /// rightmost leaf's max key never rewrites the ancestors above it. So
    /// rather than trust those cached fields, this always descends the
    /// left/right spine live down to the leaf that actually holds the
    /// current extremes.
    pub fn get_key_range(&self) -> Result<Option<(K, K)>, Error> {
        let mut buf = alloc::vec![0u8; self.store.block_size()];
        self.store.read_block(self.root_block, &mut buf).map_err(Error::Storage)?;
        if self.root_level == 0 {
            let leaf = NodeView::<K, V, E>::new(&buf)?;
            if leaf.record_count() == 0 {
                return Ok(None);
            }
            return Ok(Some((leaf.lower_bound(), leaf.upper_bound())));
        }
        let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
        let count = interior.record_count() as usize;
        if count == 0 {
            return Ok(None);
        }
        let child_level = self.root_level - 1;
        let (_, first_child) = interior.get_at(0)?.ok_or(Error::DataCorruption("interior node has no first record"))?;
        let (_, last_child) = interior.get_at(count - 1)?.ok_or(Error::DataCorruption("interior node has no last record"))?;
        Ok(Some((self.leftmost_key(first_child, child_level)?, self.rightmost_key(last_child, child_level)?)))
    }

    /// Descend the leftmost spine from `block`/`level` down to a leaf,
    /// returning its `lower_bound`.
    fn leftmost_key(&self, block: u32, level: u8) -> Result<K, Error> {
        let mut buf = alloc::vec![0u8; self.store.block_size()];
        self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
        if level == 0 {
            return Ok(NodeView::<K, V, E>::new(&buf)?.lower_bound());
        }
        let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
        let (_, child) = interior.get_at(0)?.ok_or(Error::DataCorruption("interior node has no first record"))?;
        self.leftmost_key(child, level - 1)
    }

    /// Descend the rightmost spine from `block`/`level` down to a leaf,
    /// returning its `upper_bound`.
    fn rightmost_key(&self, block: u32, level: u8) -> Result<K, Error> {
        let mut buf = alloc::vec![0u8; self.store.block_size()];
        self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
        if level == 0 {
            return Ok(NodeView::<K, V, E>::new(&buf)?.upper_bound());
        }
        let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
        let count = interior.record_count() as usize;
        let (_, child) = interior.get_at(count - 1)?.ok_or(Error::DataCorruption("interior node has no last record"))?;
        self.rightmost_key(child, level - 1)
    }

    /// Set an interior node's `lower_bound`/`upper_bound` header fields
    /// from its first and last child (spec §6 gives leaves this same
    /// treatment via [`Self::set_bounds_from_contents`]). The lower bound
    /// is the first child's separator key directly (a child's separator is
    /// always its exact lower bound, and position 0 never moves once set);
    /// the upper bound needs a live descent since the last separator is
    /// only the last child's lower bound, not the subtree's true max.
    fn set_interior_bounds(&self, node: &mut NodeViewMut<'_, K, u32, FixedSizePair>, child_level: u8) -> Result<(), Error> {
        let count = node.as_const().record_count() as usize;
        if count == 0 {
            return Ok(());
        }
        let (lo, _) = node.as_const().get_at(0)?.ok_or(Error::DataCorruption("empty node has no first record"))?;
        let (_, last_child) = node.as_const().get_at(count - 1)?.ok_or(Error::DataCorruption("empty node has no last record"))?;
        let hi = self.rightmost_key(last_child, child_level)?;
        node.set_lower_bound(&lo);
        node.set_upper_bound(&hi);
        Ok(())
    }

    pub fn create_scanner(&self) -> Scanner<'_, K, V, E, S> {
        Scanner::new(&self.store, self.root_block, self.root_level)
    }

    /// Insert `key -> value` if `key` is not already present. Returns
    /// `false` (never an error) when the key already exists.
    pub fn try_add(&mut self, key: &K, value: &V) -> Result<bool, Error> {
        let root_block = self.root_block;
        let root_level = self.root_level;
        match self.insert_at(root_block, root_level, key, value)? {
            InsertResult::Done { block, changed } => {
                if block != root_block {
                    self.root_block = block;
                }
                if changed {
                    self.dirty = true;
                }
                Ok(changed)
            }
            InsertResult::Split { sep_key, left_block, new_block } => {
                let block_size = self.store.block_size();
                let left_lower = self.leftmost_key(left_block, root_level)?;
                let mut new_root_buf = alloc::vec![0u8; block_size];
                {
                    let mut new_root = NodeViewMut::<K, u32, FixedSizePair>::new(&mut new_root_buf);
                    new_root.init_empty(NO_BLOCK, NO_BLOCK);
                    new_root.append(&left_lower, &left_block, block_size)?;
                    new_root.append(&sep_key, &new_block, block_size)?;
                    self.set_interior_bounds(&mut new_root, root_level)?;
                }
                let new_root_block = self.store.alloc_block().map_err(Error::Storage)?;
                self.store.write_block(new_root_block, &new_root_buf).map_err(Error::Storage)?;
                self.root_block = new_root_block;
                self.root_level = root_level + 1;
                self.dirty = true;
                Ok(true)
            }
        }
    }

    pub fn try_add_range<I>(&mut self, items: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut count = 0;
        for (k, v) in items {
            if self.try_add(&k, &v)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn insert_at(&mut self, block: u32, level: u8, key: &K, value: &V) -> Result<InsertResult<K>, Error> {
        if level == 0 {
            return self.insert_leaf(block, key, value);
        }

        let mut buf = alloc::vec![0u8; self.store.block_size()];
        self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
        let (child_idx, child_block) = {
            let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
            Self::find_child_and_index(&interior, key)?
        };

        match self.insert_at(child_block, level - 1, key, value)? {
            InsertResult::Done { block: new_child, changed } => {
                if new_child == child_block {
                    return Ok(InsertResult::Done { block, changed });
                }
                {
                    let mut node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut buf);
                    node.set_value_at(child_idx, &new_child)?;
                }
                let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
                Ok(InsertResult::Done { block: moved.unwrap_or(block), changed })
            }
            InsertResult::Split { sep_key, left_block, new_block } => {
                if left_block != child_block {
                    let mut node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut buf);
                    node.set_value_at(child_idx, &left_block)?;
                }
                self.insert_interior_record(block, buf, &sep_key, new_block, level - 1)
            }
        }
    }

    fn insert_leaf(&mut self, block: u32, key: &K, value: &V) -> Result<InsertResult<K>, Error> {
        let block_size = self.store.block_size();
        let mut buf = alloc::vec![0u8; block_size];
        self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
        let mut leaf = NodeViewMut::<K, V, E>::new(&mut buf);

        let idx = {
            let mut hint = BinarySearchHint::new();
            leaf.as_const().find(key, &mut hint)?
        };
        if idx >= 0 {
            return Ok(InsertResult::Done { block, changed: false });
        }
        let insertion_point = !idx as usize;

        match leaf.insert_at(insertion_point, key, value, block_size) {
            Ok(()) => {
                self.set_bounds_from_contents(&mut leaf)?;
                drop(leaf);
                let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
                self.dirty = true;
                Ok(InsertResult::Done { block: moved.unwrap_or(block), changed: true })
            }
            Err(Error::OutOfSpace(_)) => {
                let mut new_buf = alloc::vec![0u8; block_size];
                let new_block;
                let sep_key;
                let old_right_sibling;
                {
                    let mut new_leaf = NodeViewMut::<K, V, E>::new(&mut new_buf);
                    old_right_sibling = leaf.as_const().right_sibling();
                    new_leaf.init_empty(block, old_right_sibling);
                    sep_key = leaf.split_to(&mut new_leaf, block_size)?;

                    let target_is_new = *key >= sep_key;
                    if target_is_new {
                        let idx2 = {
                            let mut hint = BinarySearchHint::new();
                            new_leaf.as_const().find(key, &mut hint)?
                        };
                        new_leaf.insert_at(!idx2 as usize, key, value, block_size)?;
                    } else {
                        let idx2 = {
                            let mut hint = BinarySearchHint::new();
                            leaf.as_const().find(key, &mut hint)?
                        };
                        leaf.insert_at(!idx2 as usize, key, value, block_size)?;
                    }
                    self.set_bounds_from_contents(&mut leaf)?;
                    self.set_bounds_from_contents(&mut new_leaf)?;
                }
                new_block = self.store.alloc_block().map_err(Error::Storage)?;
                self.store.write_block(new_block, &new_buf).map_err(Error::Storage)?;
                if old_right_sibling != NO_BLOCK {
                    self.patch_left_sibling(old_right_sibling, new_block)?;
                }
                // Now that `new_block`'s final number is known, point the
                // original leaf's right sibling at it before persisting.
                let mut leaf = NodeViewMut::<K, V, E>::new(&mut buf);
                leaf.set_right_sibling(new_block);
                drop(leaf);
                let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
                let left_block = moved.unwrap_or(block);
                self.dirty = true;
                Ok(InsertResult::Split { sep_key, left_block, new_block })
            }
            Err(e) => Err(e),
        }
    }

    /// Insert a new `(sep_key, child)` separator into the interior node at
    /// `block`, whose children live at `child_level`. Needed so a freshly
    /// written or split interior node's cached bounds can be derived from
    /// its children (see [`Self::set_interior_bounds`]).
    fn insert_interior_record(&mut self, block: u32, mut buf: Vec<u8>, sep_key: &K, child: u32, child_level: u8) -> Result<InsertResult<K>, Error> {
        let block_size = self.store.block_size();
        let mut node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut buf);
        let idx = {
            let mut hint = BinarySearchHint::new();
            node.as_const().find(sep_key, &mut hint)?
        };
        if idx >= 0 {
            return Err(Error::DataCorruption("duplicate separator key in interior node"));
        }
        let insertion_point = !idx as usize;

        match node.insert_at(insertion_point, sep_key, &child, block_size) {
            Ok(()) => {
                self.set_interior_bounds(&mut node, child_level)?;
                drop(node);
                let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
                Ok(InsertResult::Done { block: moved.unwrap_or(block), changed: true })
            }
            Err(Error::OutOfSpace(_)) => {
                let mut new_buf = alloc::vec![0u8; block_size];
                let new_sep;
                {
                    let mut new_node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut new_buf);
                    new_node.init_empty(NO_BLOCK, NO_BLOCK);
                    new_sep = node.split_to(&mut new_node, block_size)?;

                    let target_is_new = *sep_key >= new_sep;
                    if target_is_new {
                        let idx2 = {
                            let mut hint = BinarySearchHint::new();
                            new_node.as_const().find(sep_key, &mut hint)?
                        };
                        new_node.insert_at(!idx2 as usize, sep_key, &child, block_size)?;
                    } else {
                        let idx2 = {
                            let mut hint = BinarySearchHint::new();
                            node.as_const().find(sep_key, &mut hint)?
                        };
                        node.insert_at(!idx2 as usize, sep_key, &child, block_size)?;
                    }
                    self.set_interior_bounds(&mut node, child_level)?;
                    self.set_interior_bounds(&mut new_node, child_level)?;
                }
                drop(node);
                let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
                let left_block = moved.unwrap_or(block);
                let new_block = self.store.alloc_block().map_err(Error::Storage)?;
                self.store.write_block(new_block, &new_buf).map_err(Error::Storage)?;
                Ok(InsertResult::Split { sep_key: new_sep, left_block, new_block })
            }
            Err(e) => Err(e),
        }
    }

    fn set_bounds_from_contents<VV, EE>(&self, node: &mut NodeViewMut<'_, K, VV, EE>) -> Result<(), Error>
    where
        EE: NodeEncoding<K, VV>,
        VV: Copy,
    {
        let count = node.as_const().record_count() as usize;
        if count == 0 {
            return Ok(());
        }
        let (lo, _) = node.as_const().get_at(0)?.ok_or(Error::DataCorruption("empty node has no first record"))?;
        let (hi, _) = node.as_const().get_at(count - 1)?.ok_or(Error::DataCorruption("empty node has no last record"))?;
        node.set_lower_bound(&lo);
        node.set_upper_bound(&hi);
        Ok(())
    }

    /// Rewrite `leaf_block`'s `left_sibling` pointer to `new_left`. The
    /// write may copy-on-write rename `leaf_block` itself, in which case
    /// the rename is propagated up to whichever interior ancestor holds
    /// the separator addressing it (mirroring how a child rename already
    /// propagates up through [`Self::insert_at`]/[`Self::remove_at`]).
    fn patch_left_sibling(&mut self, leaf_block: u32, new_left: u32) -> Result<(), Error> {
        let block_size = self.store.block_size();
        let mut buf = alloc::vec![0u8; block_size];
        self.store.read_block(leaf_block, &mut buf).map_err(Error::Storage)?;
        let search_key = NodeView::<K, V, E>::new(&buf)?.lower_bound();
        {
            let mut node = NodeViewMut::<K, V, E>::new(&mut buf);
            node.set_left_sibling(new_left);
        }
        let moved = self.store.write_block(leaf_block, &buf).map_err(Error::Storage)?;
        if let Some(renamed) = moved {
            let new_root = self.repoint_leaf(self.root_block, self.root_level, &search_key, leaf_block, renamed)?;
            if new_root != self.root_block {
                self.root_block = new_root;
            }
        }
        Ok(())
    }

    /// Walk from `block`/`level` down to the interior node holding the
    /// separator that addresses `old_leaf`, repointing it at `new_leaf`,
    /// cascading any copy-on-write rename of that interior node (and its
    /// ancestors) back up. Returns `block` unchanged if `old_leaf` is not
    /// found along `search_key`'s path.
    fn repoint_leaf(&mut self, block: u32, level: u8, search_key: &K, old_leaf: u32, new_leaf: u32) -> Result<u32, Error> {
        let mut buf = alloc::vec![0u8; self.store.block_size()];
        self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
        let (child_idx, child_block) = {
            let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
            Self::find_child_and_index(&interior, search_key)?
        };
        if level == 1 {
            if child_block != old_leaf {
                return Ok(block);
            }
            let mut node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut buf);
            node.set_value_at(child_idx, &new_leaf)?;
            drop(node);
            let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
            return Ok(moved.unwrap_or(block));
        }
        let new_child = self.repoint_leaf(child_block, level - 1, search_key, old_leaf, new_leaf)?;
        if new_child == child_block {
            return Ok(block);
        }
        let mut node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut buf);
        node.set_value_at(child_idx, &new_child)?;
        drop(node);
        let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
        Ok(moved.unwrap_or(block))
    }

    /// Remove `key`, returning whether it was present. Removal does not
    /// rebalance underfull sibling nodes (spec Non-goals exclude in-place
    /// updates to committed blocks beyond what insert/split require); it
    /// rebuilds the owning leaf without the removed record.
    pub fn try_remove(&mut self, key: &K) -> Result<bool, Error> {
        let root_block = self.root_block;
        let root_level = self.root_level;
        let (removed, new_root) = self.remove_at(root_block, root_level, key)?;
        if new_root != root_block {
            self.root_block = new_root;
        }
        if removed {
            self.dirty = true;
        }
        Ok(removed)
    }

    fn remove_at(&mut self, block: u32, level: u8, key: &K) -> Result<(bool, u32), Error> {
        if level > 0 {
            let mut buf = alloc::vec![0u8; self.store.block_size()];
            self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
            let (child_idx, child_block) = {
                let interior = NodeView::<K, u32, FixedSizePair>::new(&buf)?;
                Self::find_child_and_index(&interior, key)?
            };
            let (removed, new_child) = self.remove_at(child_block, level - 1, key)?;
            if !removed {
                return Ok((false, block));
            }
            if new_child == child_block {
                return Ok((true, block));
            }
            {
                let mut node = NodeViewMut::<K, u32, FixedSizePair>::new(&mut buf);
                node.set_value_at(child_idx, &new_child)?;
            }
            let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
            return Ok((true, moved.unwrap_or(block)));
        }

        let block_size = self.store.block_size();
        let mut buf = alloc::vec![0u8; block_size];
        self.store.read_block(block, &mut buf).map_err(Error::Storage)?;
        let mut leaf = NodeViewMut::<K, V, E>::new(&mut buf);
        let idx = {
            let mut hint = BinarySearchHint::new();
            leaf.as_const().find(key, &mut hint)?
        };
        if idx < 0 {
            return Ok((false, block));
        }
        let remaining: Vec<(K, V)> = leaf
            .as_const()
            .iter()
            .enumerate()
            .filter_map(|(i, r)| if i as isize == idx { None } else { r.ok() })
            .collect();
        let left = leaf.as_const().left_sibling();
        let right = leaf.as_const().right_sibling();
        leaf.init_empty(left, right);
        for (k, v) in &remaining {
            leaf.append(k, v, block_size)?;
        }
        if !remaining.is_empty() {
            self.set_bounds_from_contents(&mut leaf)?;
        }
        drop(leaf);
        let moved = self.store.write_block(block, &buf).map_err(Error::Storage)?;
        self.dirty = true;
        Ok((true, moved.unwrap_or(block)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::FixedSizePair;

    struct MemStore {
        block_size: usize,
        blocks: Vec<Vec<u8>>,
    }

    impl MemStore {
        fn new(block_size: usize) -> Self {
            Self { block_size, blocks: Vec::new() }
        }
    }

    impl NodeStore for MemStore {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn read_block(&self, block: u32, out: &mut [u8]) -> Result<(), crate::StorageError> {
            let src = self.blocks.get(block as usize).ok_or(crate::StorageError::Io("block out of range"))?;
            out.copy_from_slice(src);
            Ok(())
        }

        fn write_block(&mut self, block: u32, data: &[u8]) -> Result<Option<u32>, crate::StorageError> {
            let dst = self.blocks.get_mut(block as usize).ok_or(crate::StorageError::Io("block out of range"))?;
            dst.copy_from_slice(data);
            Ok(None)
        }

        fn alloc_block(&mut self) -> Result<u32, crate::StorageError> {
            let idx = self.blocks.len() as u32;
            self.blocks.push(alloc::vec![0u8; self.block_size]);
            Ok(idx)
        }

        fn free_block(&mut self, _block: u32) -> Result<(), crate::StorageError> {
            Ok(())
        }
    }

    #[test]
    fn single_insert_and_read() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        assert!(tree.try_add(&1, &1).unwrap());
        assert_eq!(tree.try_get(&1).unwrap(), Some(1));
        assert_eq!(tree.get_key_range().unwrap(), Some((1, 1)));
    }

    #[test]
    fn duplicate_add_returns_false() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        assert!(tree.try_add(&1, &1).unwrap());
        assert!(!tree.try_add(&1, &2).unwrap());
        assert_eq!(tree.try_get(&1).unwrap(), Some(1));
    }

    #[test]
    fn many_ascending_inserts_trigger_split_and_scan_in_order() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        for k in 0u32..400 {
            assert!(tree.try_add(&k, &k).unwrap());
        }
        assert_eq!(tree.get_key_range().unwrap(), Some((0, 399)));
        assert!(tree.root_level() >= 1);

        let mut scanner = tree.create_scanner();
        scanner.seek_to_start().unwrap();
        let mut out = Vec::new();
        while let Some((k, _v)) = scanner.read().unwrap() {
            out.push(k);
        }
        let expected: Vec<u32> = (0..400).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn descending_inserts_also_split_and_scan_in_order() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        for k in (0u32..300).rev() {
            assert!(tree.try_add(&k, &k).unwrap());
        }
        let mut scanner = tree.create_scanner();
        scanner.seek_to_start().unwrap();
        let mut out = Vec::new();
        while let Some((k, _v)) = scanner.read().unwrap() {
            out.push(k);
        }
        let expected: Vec<u32> = (0..300).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn remove_then_get_none() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        tree.try_add(&1, &1).unwrap();
        tree.try_add(&2, &2).unwrap();
        assert!(tree.try_remove(&1).unwrap());
        assert_eq!(tree.try_get(&1).unwrap(), None);
        assert_eq!(tree.try_get(&2).unwrap(), Some(2));
        assert!(!tree.try_remove(&1).unwrap());
    }

    #[test]
    fn try_add_range_reports_count_of_new_keys() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        tree.try_add(&5, &5).unwrap();
        let inserted = tree.try_add_range((0u32..10).map(|k| (k, k))).unwrap();
        assert_eq!(inserted, 9);
    }

    /// A leaf split that is *not* at the right edge of the chain (here,
    /// filling in the odd keys after the evens have already forced splits)
    /// must patch the following leaf's `left_sibling` back at the new
    /// block, not just the new block's own `right_sibling`.
    #[test]
    fn leaf_split_patches_downstream_left_sibling() {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        for k in (0u32..400).step_by(2) {
            assert!(tree.try_add(&k, &k).unwrap());
        }
        for k in (1u32..400).step_by(2) {
            assert!(tree.try_add(&k, &k).unwrap());
        }
        assert!(tree.root_level() >= 1);

        let mut block = tree.root_block();
        let mut level = tree.root_level();
        let mut buf = alloc::vec![0u8; 256];
        while level > 0 {
            tree.store.read_block(block, &mut buf).unwrap();
            let interior = NodeView::<u32, u32, FixedSizePair>::new(&buf).unwrap();
            let (_, child) = interior.get_at(0).unwrap().unwrap();
            block = child;
            level -= 1;
        }

        let mut prev = NO_BLOCK;
        loop {
            tree.store.read_block(block, &mut buf).unwrap();
            let leaf = NodeView::<u32, u32, FixedSizePair>::new(&buf).unwrap();
            assert_eq!(leaf.left_sibling(), prev, "leaf {block} has a stale left_sibling");
            prev = block;
            let next = leaf.right_sibling();
            if next == NO_BLOCK {
                break;
            }
            block = next;
        }
    }
}
