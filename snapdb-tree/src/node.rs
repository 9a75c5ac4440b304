//! Node layout (spec §3, §6): a leaf holds `(key, value)` records, an
//! interior node holds `(key, child_block)` separators. Both share the same
//! physical footer: record count, valid byte length, sibling links, and the
//! node's key range.
//!
//! Layout within a node's payload (after the block's own checksum footer,
//! which the sub-file layer owns):
//!
//! ```text
//! [record_count: u16][valid_length: u16][left_sibling: u32][right_sibling: u32]
//! [lower_bound: K::SIZE][upper_bound: K::SIZE]
//! [records...]
//! ```

use core::marker::PhantomData;

use crate::encoding::NodeEncoding;
use crate::key::{BinarySearchHint, KeyType};
use crate::Error;

pub const NODE_HEADER_SIZE: usize = 12;
/// Sentinel meaning "no sibling" / "no child yet".
pub const NO_BLOCK: u32 = u32::MAX;

fn header_fields<K: KeyType>() -> usize {
    NODE_HEADER_SIZE + 2 * K::SIZE
}

/// Read-only view of a node's payload.
pub struct NodeView<'a, K, V, E> {
    buf: &'a [u8],
    _marker: PhantomData<(K, V, E)>,
}

impl<'a, K, V, E> NodeView<'a, K, V, E>
where
    K: KeyType,
    E: NodeEncoding<K, V>,
{
    pub fn new(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < header_fields::<K>() {
            return Err(Error::DataCorruption("node payload shorter than its header"));
        }
        let view = Self { buf, _marker: PhantomData };
        let count = view.record_count() as usize;
        let valid = view.valid_length() as usize;
        if valid > buf.len() || header_fields::<K>() > valid.max(header_fields::<K>()) {
            return Err(Error::DataCorruption("node valid_length out of range"));
        }
        let _ = count;
        Ok(view)
    }

    pub fn record_count(&self) -> u16 {
        u16::from_le_bytes([self.buf[0], self.buf[1]])
    }

    pub fn valid_length(&self) -> u16 {
        u16::from_le_bytes([self.buf[2], self.buf[3]])
    }

    pub fn left_sibling(&self) -> u32 {
        u32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    pub fn right_sibling(&self) -> u32 {
        u32::from_le_bytes(self.buf[8..12].try_into().unwrap())
    }

    pub fn lower_bound(&self) -> K {
        K::read(&self.buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + K::SIZE])
    }

    pub fn upper_bound(&self) -> K {
        K::read(&self.buf[NODE_HEADER_SIZE + K::SIZE..NODE_HEADER_SIZE + 2 * K::SIZE])
    }

    fn records(&self) -> &'a [u8] {
        &self.buf[header_fields::<K>()..self.valid_length() as usize]
    }

    pub fn free_space(&self, block_size: usize) -> usize {
        block_size.saturating_sub(self.valid_length() as usize)
    }

    /// Iterate over decoded `(key, value)` pairs in order.
    pub fn iter(&self) -> NodeIter<'a, K, V, E> {
        NodeIter {
            buf: self.records(),
            prev_key: None,
            prev_value: None,
            remaining: self.record_count(),
            _marker: PhantomData,
        }
    }

    /// Locate `key` among this node's records. On the fixed-size encoding
    /// path this is O(log n) direct pointer arithmetic via `hint`; on the
    /// generic path it is an O(n) forward scan, as documented in spec
    /// §4.3.2.
    pub fn find(&self, key: &K, hint: &mut BinarySearchHint) -> Result<isize, Error> {
        if let Some(rec_size) = E::fixed_record_size() {
            let count = self.record_count() as usize;
            let records = self.records();
            let idx = hint.search(key, count, |i| K::read(&records[i * rec_size..i * rec_size + K::SIZE]));
            Ok(idx)
        } else {
            let mut idx = 0isize;
            for item in self.iter() {
                let (k, _) = item?;
                match k.cmp(key) {
                    core::cmp::Ordering::Equal => return Ok(idx),
                    core::cmp::Ordering::Greater => return Ok(!idx),
                    core::cmp::Ordering::Less => idx += 1,
                }
            }
            Ok(!idx)
        }
    }

    /// Fetch the value at record index `idx` (0-based), if in range.
    pub fn get_at(&self, idx: usize) -> Result<Option<(K, V)>, Error> {
        if idx >= self.record_count() as usize {
            return Ok(None);
        }
        if let Some(rec_size) = E::fixed_record_size() {
            let records = self.records();
            let off = idx * rec_size;
            let (k, v, _) = E::decode(&records[off..off + rec_size], None, None);
            Ok(Some((k, v)))
        } else {
            let mut it = self.iter();
            for _ in 0..idx {
                it.next();
            }
            it.next().transpose()
        }
    }
}

pub struct NodeIter<'a, K, V, E> {
    buf: &'a [u8],
    prev_key: Option<K>,
    prev_value: Option<V>,
    remaining: u16,
    _marker: PhantomData<E>,
}

impl<'a, K, V, E> Iterator for NodeIter<'a, K, V, E>
where
    K: Copy,
    V: Copy,
    E: NodeEncoding<K, V>,
{
    type Item = Result<(K, V), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.buf.is_empty() {
            return None;
        }
        let (k, v, consumed) = E::decode(self.buf, self.prev_key.as_ref(), self.prev_value.as_ref());
        self.buf = &self.buf[consumed..];
        self.prev_key = Some(k);
        self.prev_value = Some(v);
        self.remaining -= 1;
        Some(Ok((k, v)))
    }
}

/// Mutable view of a node's payload, used by the writer during insert/split.
pub struct NodeViewMut<'a, K, V, E> {
    buf: &'a mut [u8],
    _marker: PhantomData<(K, V, E)>,
}

impl<'a, K, V, E> NodeViewMut<'a, K, V, E>
where
    K: KeyType,
    E: NodeEncoding<K, V>,
{
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, _marker: PhantomData }
    }

    /// Initialize an empty node with the given sibling links.
    pub fn init_empty(&mut self, left_sibling: u32, right_sibling: u32) {
        self.set_record_count(0);
        self.set_valid_length(header_fields::<K>() as u16);
        self.set_left_sibling(left_sibling);
        self.set_right_sibling(right_sibling);
    }

    pub fn as_const(&self) -> NodeView<'_, K, V, E> {
        NodeView::new(self.buf).expect("node was already validated on construction")
    }

    pub fn record_count(&self) -> u16 {
        u16::from_le_bytes([self.buf[0], self.buf[1]])
    }

    pub fn set_record_count(&mut self, count: u16) {
        self.buf[0..2].copy_from_slice(&count.to_le_bytes());
    }

    pub fn valid_length(&self) -> u16 {
        u16::from_le_bytes([self.buf[2], self.buf[3]])
    }

    pub fn set_valid_length(&mut self, len: u16) {
        self.buf[2..4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn set_left_sibling(&mut self, page: u32) {
        self.buf[4..8].copy_from_slice(&page.to_le_bytes());
    }

    pub fn set_right_sibling(&mut self, page: u32) {
        self.buf[8..12].copy_from_slice(&page.to_le_bytes());
    }

    pub fn set_lower_bound(&mut self, key: &K) {
        key.write(&mut self.buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + K::SIZE]);
    }

    pub fn set_upper_bound(&mut self, key: &K) {
        key.write(&mut self.buf[NODE_HEADER_SIZE + K::SIZE..NODE_HEADER_SIZE + 2 * K::SIZE]);
    }

    fn records_mut(&mut self) -> &mut [u8] {
        let start = header_fields::<K>();
        let end = self.valid_length() as usize;
        &mut self.buf[start..end]
    }

    pub fn free_space(&self, block_size: usize) -> usize {
        block_size.saturating_sub(self.valid_length() as usize)
    }

    /// Insert a record at `idx`, shifting later records right. Returns
    /// `Err(Error::OutOfSpace(n))` (leaving the node untouched) if there is
    /// not enough room.
    pub fn insert_at(&mut self, idx: usize, key: &K, value: &V, block_size: usize) -> Result<(), Error>
    where
        V: Copy,
    {
        let mut scratch = [0u8; 64];
        let needed = E::encode(&mut scratch, None, key, None, value);
        if self.free_space(block_size) < needed {
            return Err(Error::OutOfSpace(needed));
        }
        let start = header_fields::<K>();
        let valid = self.valid_length() as usize;
        let count = self.record_count() as usize;

        let insert_offset = if let Some(rec_size) = E::fixed_record_size() {
            start + idx * rec_size
        } else {
            // Locate the byte offset of record `idx` via forward scan.
            let records = &self.buf[start..valid];
            let mut off = 0usize;
            let mut n = 0usize;
            while n < idx && off < records.len() {
                let (_, _, consumed) = E::decode(&records[off..], None, None);
                off += consumed;
                n += 1;
            }
            start + off
        };

        self.buf.copy_within(insert_offset..valid, insert_offset + needed);
        self.buf[insert_offset..insert_offset + needed].copy_from_slice(&scratch[..needed]);
        self.set_valid_length((valid + needed) as u16);
        self.set_record_count((count + 1) as u16);
        Ok(())
    }

    /// Append to the end of the node without shifting anything (sequential
    /// fast path, spec §4.3.3).
    pub fn append(&mut self, key: &K, value: &V, block_size: usize) -> Result<(), Error>
    where
        V: Copy,
    {
        let count = self.record_count() as usize;
        self.insert_at(count, key, value, block_size)
    }

    /// Overwrite the value at record `idx` in place. Only supported for
    /// fixed-size encodings (interior separator pointers, in particular) —
    /// a variable-length encoding would need to shift every later record.
    pub fn set_value_at(&mut self, idx: usize, value: &V) -> Result<(), Error>
    where
        V: Copy,
    {
        let rec_size = E::fixed_record_size().ok_or(Error::DataCorruption("set_value_at requires a fixed-size encoding"))?;
        if idx >= self.record_count() as usize {
            return Err(Error::DataCorruption("set_value_at index out of range"));
        }
        let key = self.as_const().get_at(idx)?.ok_or(Error::DataCorruption("missing record"))?.0;
        let start = header_fields::<K>() + idx * rec_size;
        let mut scratch = [0u8; 64];
        let n = E::encode(&mut scratch, None, &key, None, value);
        self.buf[start..start + n].copy_from_slice(&scratch[..n]);
        Ok(())
    }

    /// Split this node roughly in half into `other` (which must be freshly
    /// initialized and empty), moving the upper half of records out.
    /// Returns the separator key: the first key now in `other`.
    pub fn split_to(&mut self, other: &mut NodeViewMut<K, V, E>, block_size: usize) -> Result<K, Error>
    where
        V: Copy,
    {
        let start = header_fields::<K>();
        let count = self.record_count() as usize;
        debug_assert!(count >= 2, "cannot split a node with fewer than two records");

        let split_point = if let Some(rec_size) = E::fixed_record_size() {
            let half = count / 2;
            (half, start + half * rec_size)
        } else {
            // Greedy fill by size: walk records until we've used about half
            // of the valid bytes.
            let target = (self.valid_length() as usize - start) / 2;
            let records = &self.buf[start..self.valid_length() as usize];
            let mut off = 0usize;
            let mut n = 0usize;
            while off < target && n < count {
                let (_, _, consumed) = E::decode(&records[off..], None, None);
                off += consumed;
                n += 1;
            }
            (n, start + off)
        };

        let (moved_count, move_start) = split_point;
        let moved_count = moved_count.max(1).min(count - 1);
        let move_start = if let Some(rec_size) = E::fixed_record_size() {
            start + moved_count * rec_size
        } else {
            move_start
        };

        let moved_bytes = &self.buf[move_start..self.valid_length() as usize];
        let moved_len = moved_bytes.len();
        other.buf[start..start + moved_len].copy_from_slice(moved_bytes);
        other.set_valid_length((start + moved_len) as u16);
        other.set_record_count((count - moved_count) as u16);
        let _ = block_size;

        self.set_valid_length(move_start as u16);
        self.set_record_count(moved_count as u16);

        let (sep_key, _) = other.as_const().get_at(0)?.ok_or(Error::DataCorruption("split produced an empty sibling"))?;
        Ok(sep_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::FixedSizePair;

    fn fresh(block_size: usize) -> alloc::vec::Vec<u8> {
        alloc::vec![0u8; block_size]
    }

    #[test]
    fn insert_and_scan_in_order() {
        let mut buf = fresh(256);
        let mut node = NodeViewMut::<u32, u32, FixedSizePair>::new(&mut buf);
        node.init_empty(NO_BLOCK, NO_BLOCK);
        for k in [5u32, 1, 3, 2, 4] {
            let idx = {
                let mut hint = BinarySearchHint::new();
                let view = node.as_const();
                let r = view.find(&k, &mut hint).unwrap();
                if r < 0 { !r as usize } else { r as usize }
            };
            node.insert_at(idx, &k, &(k * 10), 256).unwrap();
        }
        let view = node.as_const();
        let got: alloc::vec::Vec<u32> = view.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(got, alloc::vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn split_partitions_cleanly() {
        let mut buf = fresh(256);
        let mut node = NodeViewMut::<u32, u32, FixedSizePair>::new(&mut buf);
        node.init_empty(NO_BLOCK, NO_BLOCK);
        for k in 0u32..10 {
            node.append(&k, &k, 256).unwrap();
        }
        let mut other_buf = fresh(256);
        let mut other = NodeViewMut::<u32, u32, FixedSizePair>::new(&mut other_buf);
        other.init_empty(NO_BLOCK, NO_BLOCK);
        let sep = node.split_to(&mut other, 256).unwrap();

        let left: alloc::vec::Vec<u32> = node.as_const().iter().map(|r| r.unwrap().0).collect();
        let right: alloc::vec::Vec<u32> = other.as_const().iter().map(|r| r.unwrap().0).collect();
        assert_eq!(right[0], sep);
        assert!(left.iter().all(|k| *k < sep));
        assert!(right.iter().all(|k| *k >= sep));
        assert_eq!(left.len() + right.len(), 10);
    }
}
