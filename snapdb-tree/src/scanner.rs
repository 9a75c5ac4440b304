//! Ordered forward scanning over a sorted tree (spec §4.3.4): `seekToStart`,
//! `seekToKey`, `seekToEnd`, `read`, `peek`, and the two `readWhile`
//! variants used by the union reader to pull bounded, filtered runs out of
//! each underlying tree.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::encoding::{FixedSizePair, NodeEncoding};
use crate::key::{BinarySearchHint, KeyType, ValueType};
use crate::node::{NodeView, NO_BLOCK};
use crate::raw::NodeStore;
use crate::Error;

/// Where a [`Scanner`] currently sits relative to the tree's key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    /// Never positioned; the first `read`/`peek` implicitly seeks to start.
    BeforeStart,
    /// Sitting on a live leaf record.
    Positioned,
    /// Past the last record; every further read returns `None`.
    Exhausted,
}

/// A forward-only cursor over one sorted tree's leaves, following sibling
/// links rather than re-descending from the root for each record.
pub struct Scanner<'a, K, V, E, S> {
    store: &'a S,
    root_block: u32,
    root_level: u8,
    state: ScannerState,
    block: u32,
    index: usize,
    buf: Vec<u8>,
    hint: BinarySearchHint,
    _marker: PhantomData<(K, V, E)>,
}

impl<'a, K, V, E, S> Scanner<'a, K, V, E, S>
where
    K: KeyType,
    V: ValueType,
    E: NodeEncoding<K, V>,
    S: NodeStore,
{
    pub fn new(store: &'a S, root_block: u32, root_level: u8) -> Self {
        let block_size = store.block_size();
        Self {
            store,
            root_block,
            root_level,
            state: ScannerState::BeforeStart,
            block: NO_BLOCK,
            index: 0,
            buf: alloc::vec![0u8; block_size],
            hint: BinarySearchHint::new(),
            _marker: PhantomData,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    fn load(&mut self, block: u32) -> Result<(), Error> {
        self.store.read_block(block, &mut self.buf).map_err(Error::Storage)?;
        self.block = block;
        self.index = 0;
        self.hint.reset();
        Ok(())
    }

    fn leftmost_leaf(&self) -> Result<u32, Error> {
        let mut block = self.root_block;
        let mut level = self.root_level;
        let mut scratch = alloc::vec![0u8; self.store.block_size()];
        while level > 0 {
            self.store.read_block(block, &mut scratch).map_err(Error::Storage)?;
            let interior = NodeView::<K, u32, FixedSizePair>::new(&scratch)?;
            let (_, child) = interior.get_at(0)?.ok_or(Error::DataCorruption("empty interior node"))?;
            block = child;
            level -= 1;
        }
        Ok(block)
    }

    fn rightmost_leaf(&self) -> Result<u32, Error> {
        let mut block = self.root_block;
        let mut level = self.root_level;
        let mut scratch = alloc::vec![0u8; self.store.block_size()];
        while level > 0 {
            self.store.read_block(block, &mut scratch).map_err(Error::Storage)?;
            let interior = NodeView::<K, u32, FixedSizePair>::new(&scratch)?;
            let count = interior.record_count() as usize;
            let (_, child) = interior
                .get_at(count.saturating_sub(1))?
                .ok_or(Error::DataCorruption("empty interior node"))?;
            block = child;
            level -= 1;
        }
        Ok(block)
    }

    fn leaf_for_key(&self, key: &K) -> Result<u32, Error> {
        let mut block = self.root_block;
        let mut level = self.root_level;
        let mut scratch = alloc::vec![0u8; self.store.block_size()];
        while level > 0 {
            self.store.read_block(block, &mut scratch).map_err(Error::Storage)?;
            let interior = NodeView::<K, u32, FixedSizePair>::new(&scratch)?;
            let mut chosen = None;
            for item in interior.iter() {
                let (sep, child) = item?;
                if sep.is_less_than(key) || sep.is_equal_to(key) {
                    chosen = Some(child);
                } else {
                    break;
                }
            }
            block = match chosen {
                Some(c) => c,
                None => interior.get_at(0)?.map(|(_, c)| c).ok_or(Error::DataCorruption("empty interior node"))?,
            };
            level -= 1;
        }
        Ok(block)
    }

    pub fn seek_to_start(&mut self) -> Result<(), Error> {
        let leaf = self.leftmost_leaf()?;
        self.load(leaf)?;
        self.state = ScannerState::Positioned;
        Ok(())
    }

    pub fn seek_to_end(&mut self) -> Result<(), Error> {
        let leaf = self.rightmost_leaf()?;
        self.load(leaf)?;
        let count = NodeView::<K, V, E>::new(&self.buf)?.record_count() as usize;
        self.index = count;
        self.state = ScannerState::Positioned;
        Ok(())
    }

    pub fn seek_to_key(&mut self, key: &K) -> Result<(), Error> {
        let leaf = self.leaf_for_key(key)?;
        self.load(leaf)?;
        let view = NodeView::<K, V, E>::new(&self.buf)?;
        let idx = view.find(key, &mut self.hint)?;
        self.index = if idx < 0 { !idx as usize } else { idx as usize };
        self.state = ScannerState::Positioned;
        Ok(())
    }

    /// Returns the record the cursor currently sits on without advancing,
    /// transparently crossing empty leaves and sibling links as needed.
    fn current(&mut self) -> Result<Option<(K, V)>, Error> {
        match self.state {
            ScannerState::Exhausted => return Ok(None),
            ScannerState::BeforeStart => self.seek_to_start()?,
            ScannerState::Positioned => {}
        }
        loop {
            let view = NodeView::<K, V, E>::new(&self.buf)?;
            let count = view.record_count() as usize;
            if self.index < count {
                return Ok(view.get_at(self.index)?);
            }
            let next = view.right_sibling();
            if next == NO_BLOCK {
                self.state = ScannerState::Exhausted;
                return Ok(None);
            }
            self.load(next)?;
        }
    }

    /// Advance past the current record and return it.
    pub fn read(&mut self) -> Result<Option<(K, V)>, Error> {
        let item = self.current()?;
        if item.is_some() {
            self.index += 1;
        }
        Ok(item)
    }

    /// Like [`Scanner::read`] but does not advance.
    pub fn peek(&mut self) -> Result<Option<(K, V)>, Error> {
        self.current()
    }

    /// Read the current record only if its key is strictly less than
    /// `upper_bound` (exclusive upper bound, spec §4.3.4/§4.4.3), advancing
    /// past it when it is returned.
    pub fn read_while(&mut self, upper_bound: &K) -> Result<Option<(K, V)>, Error> {
        match self.current()? {
            Some((k, v)) if k.is_less_than(upper_bound) => {
                self.index += 1;
                Ok(Some((k, v)))
            }
            _ => Ok(None),
        }
    }

    /// Like [`Scanner::read_while`], but records that don't satisfy
    /// `matches` are skipped (consumed without being returned) rather than
    /// stopping the scan.
    pub fn read_while_matching<F>(&mut self, upper_bound: &K, mut matches: F) -> Result<Option<(K, V)>, Error>
    where
        F: FnMut(&K, &V) -> bool,
    {
        loop {
            match self.current()? {
                Some((k, v)) if k.is_less_than(upper_bound) => {
                    self.index += 1;
                    if matches(&k, &v) {
                        return Ok(Some((k, v)));
                    }
                }
                _ => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::FixedSizePair;
    use crate::tree::SortedTree;

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

    fn build_tree(n: u32) -> SortedTree<u32, u32, FixedSizePair, MemStore> {
        let store = MemStore::new(256);
        let mut tree = SortedTree::<u32, u32, FixedSizePair, _>::create(store).unwrap();
        for k in 0..n {
            tree.try_add(&k, &(k * 2)).unwrap();
        }
        tree
    }

    #[test]
    fn read_while_respects_exclusive_upper_bound() {
        let tree = build_tree(50);
        let mut scanner = tree.create_scanner();
        scanner.seek_to_start().unwrap();
        let mut out = Vec::new();
        while let Some((k, _)) = scanner.read_while(&10).unwrap() {
            out.push(k);
        }
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn seek_to_key_positions_at_or_after() {
        let tree = build_tree(50);
        let mut scanner = tree.create_scanner();
        scanner.seek_to_key(&25).unwrap();
        let (k, v) = scanner.read().unwrap().unwrap();
        assert_eq!(k, 25);
        assert_eq!(v, 50);
    }

    #[test]
    fn match_filter_skips_without_stopping() {
        let tree = build_tree(20);
        let mut scanner = tree.create_scanner();
        scanner.seek_to_start().unwrap();
        let mut out = Vec::new();
        while let Some((k, _)) = scanner.read_while_matching(&20, |k, _| k % 2 == 0).unwrap() {
            out.push(k);
        }
        assert_eq!(out, (0..20).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn peek_does_not_advance() {
        let tree = build_tree(5);
        let mut scanner = tree.create_scanner();
        scanner.seek_to_start().unwrap();
        let peeked = scanner.peek().unwrap();
        let read = scanner.read().unwrap();
        assert_eq!(peeked, read);
    }

    #[test]
    fn seek_to_end_then_read_returns_none() {
        let tree = build_tree(5);
        let mut scanner = tree.create_scanner();
        scanner.seek_to_end().unwrap();
        assert_eq!(scanner.read().unwrap(), None);
    }
}
