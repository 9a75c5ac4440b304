use thiserror::Error;

/// Errors surfaced by the paged file container, its sub-files, and the
/// union reader built on top of them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open, lock, resize, or sync the backing file.
    #[error("I/O error on the backing file")]
    Io(#[source] std::io::Error),
    /// Couldn't lock the backing file for exclusive use.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// A checksum, magic number, or layout invariant failed to validate.
    #[error("database corruption: {reason}")]
    Corrupt { reason: &'static str },
    /// A sub-file grew past the quadruple-indirect addressing limit.
    #[error("sub-file exceeded the maximum addressable size")]
    FileTooLarge,
    /// An edit was already open on this file (single-writer, spec Non-goals).
    #[error("an edit is already open on this file")]
    EditInProgress,
    /// The named sub-file does not exist.
    #[error("sub-file {0:?} not found")]
    NotFound(crate::guid::Guid),
    /// `addSubFile` was called with a name that already exists.
    #[error("sub-file {0:?} already exists")]
    DuplicateKey(crate::guid::Guid),
    /// A union read was cancelled via its cancellation flag, or its
    /// deadline elapsed.
    #[error("read was cancelled")]
    Cancelled,
    /// A caller-supplied argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Error from the sub-file tree layer.
    #[error(transparent)]
    Tree(#[from] snapdb_tree::Error),
}