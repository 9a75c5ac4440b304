#![no_std]

extern crate alloc;

pub mod encoding;
pub mod key;
pub mod node;
pub mod raw;
pub mod scanner;
pub mod subfile;
pub mod tree;

pub use encoding::{EncodingDefinition, FixedSizePair, NodeEncoding};
pub use key::{BinarySearchHint, KeyType, ValueType};
pub use raw::NodeStore;
pub use scanner::{Scanner, ScannerState};
pub use tree::SortedTree;

/// 4 kiB page. Standard on most architectures, particularly x64, RISC-V, and
/// non-Apple ARM.
pub const PAGE_4K: usize = 1 << 12;

/// Trailing footer reserved on every node block.
pub const FOOTER_SIZE: usize = 32;

#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    /// I/O error in the backing storage (surfaced from the sub-file layer).
    Io(&'static str),
    /// Database corruption detected: bad checksum, bad magic, broken invariant.
    Corruption(&'static str),
    /// Sub-file grew past the quadruple-indirect addressing limit.
    FileTooLarge,
}

impl From<StorageError> for Error {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Corruption(s) => write!(f, "database corruption: {}", s),
            Self::FileTooLarge => write!(f, "sub-file exceeded quadruple-indirect addressing"),
        }
    }
}

impl core::error::Error for StorageError {}

/// Error that can be returned while reading or mutating a sorted tree.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No space left in a node to insert a record of the given size.
    OutOfSpace(usize),
    /// A node's footer or record layout failed validation.
    DataCorruption(&'static str),
    /// A key or value can never fit in a node, even freshly split.
    RecordTooLarge,
    /// An encoding definition was malformed (e.g. unrecognized GUID).
    InvalidArgument(&'static str),
    /// Error from the sub-file / block layer underneath this tree.
    Storage(StorageError),
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        if let Self::Storage(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfSpace(s) => write!(f, "no space left in node to insert {s} bytes"),
            Self::DataCorruption(s) => write!(f, "data corruption: {s}"),
            Self::RecordTooLarge => f.write_str("record too large to ever fit in a node"),
            Self::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
            Self::Storage(e) => write!(f, "{e}"),
        }
    }
}
