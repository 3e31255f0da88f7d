pub mod chain_set;
pub mod config;
pub mod error;
pub mod file_mapper;
pub mod header_index;
pub mod kv_meta_store;
pub mod memory_meta_store;
pub mod meta_store;
pub mod raw_file;
pub mod reindex;
pub mod store;

use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

use crate::blocks::raw_file::BlockPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Where we are in rebuilding the header catalogue from the raw data files.
///
/// The state is persisted by the [MetaStore](crate::MetaStore), so an
/// interrupted reindex resumes on the next start instead of silently leaving
/// a half-built catalogue behind.
pub enum ReindexState {
    /// Normal operation, the catalogue is authoritative
    #[default]
    NoReindex,

    /// We are walking the blk files and submitting every framed block to the
    /// validation engine
    ScanningFiles,

    /// All files are scanned, we're waiting for validation to catch up
    ParsingBlocks,
}

/// The interface the validation engine exposes to us. During a reindex we
/// push raw-file positions through it and it parses and re-validates the
/// blocks on its own worker pool.
pub trait BlockSubmitter: Send + Sync {
    /// Blocks the caller while the submission queue is full
    fn wait_for_space(&self);

    /// Enqueues a raw-file position for parsing
    fn add_block(&self, position: BlockPosition);

    /// Returns once every submitted block has been processed
    fn wait_validation_finished(&self);
}

#[derive(Debug, Default)]
/// The process-wide stop flag. The reindex worker polls it between files and
/// after each submission; anyone may request a shutdown through it.
pub struct ShutdownFlag {
    closing: AtomicBool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag {
            closing: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

pub use crate::blocks::error::BlockStoreError;
pub use crate::blocks::error::DatabaseError;
