use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error as ioError;

use bitcoin::BlockHash;
use madeira_common::impl_error_from;

/// Marker for errors coming out of a [MetaStore](crate::MetaStore) backend.
/// Implementing it lets any backend error flow through
/// [BlockStoreError::Database] without the store caring which database is
/// underneath.
pub trait DatabaseError: Debug + Send + Sync + 'static {}

#[derive(Debug)]
pub enum BlockStoreError {
    /// A frame on disk doesn't add up: checksum mismatch, a declared length
    /// running past the end of the file, or a position inside the frame header
    CorruptData(String),

    /// A data file could not be opened, resized or mapped
    Io(ioError),

    /// A writer asked for a mapping that came back read-only
    NotWritable,

    /// The reindex worker saw the shutdown flag and stopped early
    Interrupted,

    /// The underlying key/value store returned an error
    Database(Box<dyn DatabaseError>),

    /// A stored value failed to deserialize
    Decode(bitcoin::consensus::encode::Error),

    /// A header references a parent we've never seen
    UnknownParent(BlockHash),

    /// The requested block isn't in our catalogue
    BlockNotFound,

    /// A lock was poisoned by a panicking thread
    Poisoned,
}

impl<T: DatabaseError> From<T> for BlockStoreError {
    fn from(value: T) -> Self {
        BlockStoreError::Database(Box::new(value))
    }
}

impl_error_from!(BlockStoreError, ioError, Io);
impl_error_from!(BlockStoreError, bitcoin::consensus::encode::Error, Decode);

impl Display for BlockStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStoreError::CorruptData(reason) => {
                write!(f, "corrupt block data: {}", reason)
            }
            BlockStoreError::Io(e) => write!(f, "I/O error: {}", e),
            BlockStoreError::NotWritable => {
                write!(f, "data file is not writable")
            }
            BlockStoreError::Interrupted => {
                write!(f, "interrupted by shutdown")
            }
            BlockStoreError::Database(e) => write!(f, "database error: {:?}", e),
            BlockStoreError::Decode(e) => write!(f, "decode error: {}", e),
            BlockStoreError::UnknownParent(hash) => {
                write!(f, "header builds on unknown parent {}", hash)
            }
            BlockStoreError::BlockNotFound => write!(f, "block not found"),
            BlockStoreError::Poisoned => write!(f, "poisoned lock"),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl DatabaseError for kv::Error {}
