// SPDX-License-Identifier: MIT

//! # Madeira Blocks
//! This crate is the storage backend of a proof-of-work node. It keeps three
//! things on disk: the catalogue of every block header we ever heard about,
//! organised as a tree of competing chains with one best tip; the raw block
//! bodies and their undo payloads, framed into numbered append-only
//! `blkNNNNN.dat` / `revNNNNN.dat` files that are memory-mapped on demand;
//! and a transaction-id index pointing into those files.
//!
//! The main entry point is the [BlockStore] struct. It is generic over a
//! [MetaStore], the embedded key/value database holding the header catalogue
//! and file bookkeeping. [KvMetaStore] is the production implementation;
//! [MemoryMetaStore] is a volatile one for tests.
//!
//! If the catalogue is lost or the node is started with the reindex flag,
//! the raw data files are the source of truth: [BlockStore::start_block_importer]
//! walks them and feeds every framed block back to the validation engine.

pub mod blocks;

pub use blocks::chain_set::ChainSet;
pub use blocks::chain_set::HeaderChain;
pub use blocks::config::Config;
pub use blocks::error::BlockStoreError;
pub use blocks::error::DatabaseError;
pub use blocks::file_mapper::FileKind;
pub use blocks::file_mapper::FileMapper;
pub use blocks::file_mapper::SharedBytes;
pub use blocks::header_index::BlockStatus;
pub use blocks::header_index::HeaderEntry;
pub use blocks::header_index::HeaderIndex;
pub use blocks::kv_meta_store::KvMetaStore;
pub use blocks::memory_meta_store::MemoryMetaStore;
pub use blocks::meta_store::DiskHeaderRecord;
pub use blocks::meta_store::MetaStore;
pub use blocks::meta_store::TxPosition;
pub use blocks::raw_file::BlockPosition;
pub use blocks::raw_file::FastBlock;
pub use blocks::raw_file::FastUndoBlock;
pub use blocks::raw_file::FileInfo;
pub use blocks::store::BlockStore;
pub use blocks::BlockSubmitter;
pub use blocks::ReindexState;
pub use blocks::ShutdownFlag;
