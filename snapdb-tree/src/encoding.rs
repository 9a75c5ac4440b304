//! Node encodings (spec §4.3.2, §6): how `(key, value)` pairs are packed
//! into a node's record area.
//!
//! Two families are supported: [`FixedSizePair`], where every record is
//! `K::SIZE + V::SIZE` bytes and random access is direct pointer
//! arithmetic, and a generic pair family where each record is individually
//! (de)compressed and random access degrades to an O(record_count) forward
//! scan from the first record.

use crate::key::{FixedSizeType, KeyType, ValueType};

/// The sentinel GUID for the fixed-size encoding (spec §6).
pub const FIXED_SIZE_ENCODING_GUID: [u8; 16] = [
    0x1d, 0xea, 0x32, 0x6d, 0xa6, 0x3a, 0x4f, 0x73, 0xb5, 0x1c, 0x7b, 0x31, 0x25, 0xc6, 0xda, 0x55,
];

/// How a node's record area decodes/encodes `(key, value)` pairs.
///
/// Implementations are monomorphized at each call site (no vtables in the
/// hot scan/insert loop, per the REDESIGN FLAGS preference for capability
/// traits over boxed dynamic dispatch).
pub trait NodeEncoding<K, V> {
    /// Worst-case encoded size of a single record, used by the split
    /// heuristic to decide how many records a fresh node can hold.
    const MAX_COMPRESSION_SIZE: usize;
    /// Whether decoding one record requires the previously decoded key.
    const USES_PREVIOUS_KEY: bool;
    /// Whether decoding one record requires the previously decoded value.
    const USES_PREVIOUS_VALUE: bool;
    /// Whether a record group is terminated by an explicit end-of-stream
    /// symbol rather than relying on an external record count.
    const CONTAINS_END_OF_STREAM_SYMBOL: bool;

    /// Fixed per-record size, if this encoding supports O(1) random access.
    /// `None` means every record must be reached via a forward scan.
    fn fixed_record_size() -> Option<usize>;

    /// Encode one record into `buf`, returning the number of bytes written.
    /// `buf` is guaranteed to have at least `MAX_COMPRESSION_SIZE` bytes.
    fn encode(buf: &mut [u8], prev_key: Option<&K>, key: &K, prev_value: Option<&V>, value: &V) -> usize;

    /// Decode one record from the front of `buf`, returning the decoded
    /// pair and the number of bytes consumed.
    fn decode(buf: &[u8], prev_key: Option<&K>, prev_value: Option<&V>) -> (K, V, usize);
}

/// Fixed-size pair encoding: `K::SIZE + V::SIZE` bytes per record, no
/// context needed from neighboring records.
pub struct FixedSizePair;

impl<K, V> NodeEncoding<K, V> for FixedSizePair
where
    K: KeyType,
    V: ValueType,
{
    const MAX_COMPRESSION_SIZE: usize = K::SIZE + V::SIZE;
    const USES_PREVIOUS_KEY: bool = false;
    const USES_PREVIOUS_VALUE: bool = false;
    const CONTAINS_END_OF_STREAM_SYMBOL: bool = false;

    fn fixed_record_size() -> Option<usize> {
        Some(K::SIZE + V::SIZE)
    }

    fn encode(buf: &mut [u8], _prev_key: Option<&K>, key: &K, _prev_value: Option<&V>, value: &V) -> usize {
        key.write(&mut buf[..K::SIZE]);
        value.write(&mut buf[K::SIZE..K::SIZE + V::SIZE]);
        K::SIZE + V::SIZE
    }

    fn decode(buf: &[u8], _prev_key: Option<&K>, _prev_value: Option<&V>) -> (K, V, usize) {
        let key = K::read(&buf[..K::SIZE]);
        let value = V::read(&buf[K::SIZE..K::SIZE + V::SIZE]);
        (key, value, K::SIZE + V::SIZE)
    }
}

/// Generic pair encoding: a length-prefixed byte blob per record, produced
/// by a pluggable compressor. The built-in delta-against-previous-key
/// variant is a simple, honest example of the family described in §4.3.2 —
/// it is not meant to be the only generic encoding a consumer could supply.
///
/// Wire format per record: `u8 key_len`, key bytes, `u8 value_len`, value
/// bytes. Real deployments would swap in varint delta coding; this crate
/// keeps the wire format simple since the tree's insert/split/scan logic
/// only depends on `fixed_record_size() == None` to pick the linear-scan
/// path, not on any particular compression scheme.
pub struct GenericPair;

impl<K, V> NodeEncoding<K, V> for GenericPair
where
    K: KeyType,
    V: ValueType,
{
    const MAX_COMPRESSION_SIZE: usize = 2 + 2 * (K::SIZE.max(V::SIZE));
    const USES_PREVIOUS_KEY: bool = false;
    const USES_PREVIOUS_VALUE: bool = false;
    const CONTAINS_END_OF_STREAM_SYMBOL: bool = false;

    fn fixed_record_size() -> Option<usize> {
        None
    }

    fn encode(buf: &mut [u8], _prev_key: Option<&K>, key: &K, _prev_value: Option<&V>, value: &V) -> usize {
        buf[0] = K::SIZE as u8;
        key.write(&mut buf[1..1 + K::SIZE]);
        buf[1 + K::SIZE] = V::SIZE as u8;
        value.write(&mut buf[2 + K::SIZE..2 + K::SIZE + V::SIZE]);
        2 + K::SIZE + V::SIZE
    }

    fn decode(buf: &[u8], _prev_key: Option<&K>, _prev_value: Option<&V>) -> (K, V, usize) {
        let klen = buf[0] as usize;
        let key = K::read(&buf[1..1 + klen]);
        let vlen = buf[1 + klen] as usize;
        let value = V::read(&buf[2 + klen..2 + klen + vlen]);
        (key, value, 2 + klen + vlen)
    }
}

/// Wire form of an encoding definition (spec §6): either one combined
/// key+value encoding id, or a separate key encoding id and value encoding
/// id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingDefinition {
    Combined([u8; 16]),
    Separate { key: [u8; 16], value: [u8; 16] },
}

impl EncodingDefinition {
    pub const TAG_COMBINED: u8 = 1;
    pub const TAG_SEPARATE: u8 = 2;

    /// True if this definition names the fixed-size sentinel on both sides.
    pub fn is_fixed_size(&self) -> bool {
        match self {
            Self::Combined(id) => *id == FIXED_SIZE_ENCODING_GUID,
            Self::Separate { key, value } => {
                *key == FIXED_SIZE_ENCODING_GUID && *value == FIXED_SIZE_ENCODING_GUID
            }
        }
    }

    pub fn fixed_size() -> Self {
        Self::Combined(FIXED_SIZE_ENCODING_GUID)
    }

    /// Serialize to the wire form described in spec §6.
    pub fn write(&self, buf: &mut [u8]) -> usize {
        match self {
            Self::Combined(id) => {
                buf[0] = Self::TAG_COMBINED;
                buf[1..17].copy_from_slice(id);
                17
            }
            Self::Separate { key, value } => {
                buf[0] = Self::TAG_SEPARATE;
                buf[1..17].copy_from_slice(key);
                buf[17..33].copy_from_slice(value);
                33
            }
        }
    }

    pub fn read(buf: &[u8]) -> Result<(Self, usize), crate::Error> {
        match buf.first() {
            Some(&Self::TAG_COMBINED) => {
                let mut id = [0u8; 16];
                id.copy_from_slice(&buf[1..17]);
                Ok((Self::Combined(id), 17))
            }
            Some(&Self::TAG_SEPARATE) => {
                let mut key = [0u8; 16];
                let mut value = [0u8; 16];
                key.copy_from_slice(&buf[1..17]);
                value.copy_from_slice(&buf[17..33]);
                Ok((Self::Separate { key, value }, 33))
            }
            _ => Err(crate::Error::InvalidArgument("unrecognized encoding definition tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_size_round_trip() {
        let mut buf = [0u8; 16];
        let n = <FixedSizePair as NodeEncoding<u64, u64>>::encode(&mut buf, None, &7u64, None, &9u64);
        assert_eq!(n, 16);
        let (k, v, consumed) = <FixedSizePair as NodeEncoding<u64, u64>>::decode(&buf, None, None);
        assert_eq!((k, v, consumed), (7, 9, 16));
    }

    #[test]
    fn generic_pair_round_trip() {
        let mut buf = [0u8; 32];
        let n = <GenericPair as NodeEncoding<u32, u64>>::encode(&mut buf, None, &3u32, None, &11u64);
        let (k, v, consumed) = <GenericPair as NodeEncoding<u32, u64>>::decode(&buf, None, None);
        assert_eq!(consumed, n);
        assert_eq!((k, v), (3, 11));
    }

    #[test]
    fn encoding_definition_wire_round_trip() {
        let def = EncodingDefinition::fixed_size();
        let mut buf = [0u8; 33];
        let n = def.write(&mut buf);
        let (read_back, consumed) = EncodingDefinition::read(&buf).unwrap();
        assert_eq!(n, consumed);
        assert_eq!(def, read_back);
        assert!(read_back.is_fixed_size());
    }
}
