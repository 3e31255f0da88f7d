//! The facade tying the pieces together: one [BlockStore] per data
//! directory, owned by whoever runs the node and passed to collaborators
//! explicitly.

use std::sync::Arc;
use std::sync::Mutex;

use bitcoin::block::Header as BlockHeader;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::consensus::deserialize_partial;
use bitcoin::hashes::Hash;
use bitcoin::p2p::Magic;
use bitcoin::BlockHash;
use bitcoin::Txid;

use crate::blocks::chain_set::ChainSet;
use crate::blocks::chain_set::HeaderChain;
use crate::blocks::config::Config;
use crate::blocks::error::BlockStoreError;
use crate::blocks::file_mapper::FileKind;
use crate::blocks::file_mapper::FileMapper;
use crate::blocks::file_mapper::SharedBytes;
use crate::blocks::header_index::BlockStatus;
use crate::blocks::header_index::HeaderEntry;
use crate::blocks::header_index::HeaderIndex;
use crate::blocks::meta_store::DiskHeaderRecord;
use crate::blocks::meta_store::MetaStore;
use crate::blocks::meta_store::TxPosition;
use crate::blocks::raw_file::BlockPosition;
use crate::blocks::raw_file::FastBlock;
use crate::blocks::raw_file::FastUndoBlock;
use crate::blocks::raw_file::RawFileWriter;
use crate::blocks::raw_file::MESSAGE_START_SIZE;
use crate::blocks::ReindexState;
use crate::blocks::ShutdownFlag;

/// The block storage engine. Generic over the [MetaStore] holding the
/// header catalogue; [KvMetaStore](crate::KvMetaStore) in production.
pub struct BlockStore<S: MetaStore> {
    meta: S,
    mapper: Arc<FileMapper>,
    writer: RawFileWriter,
    index: HeaderIndex,
    chain: Mutex<ChainSet>,
    reindexing: Mutex<ReindexState>,
    config: Config,
    magic: [u8; MESSAGE_START_SIZE],
    shutdown: Arc<ShutdownFlag>,
}

impl<S: MetaStore> BlockStore<S> {
    /// Wires a store up from its catalogue. Seeds the persisted reindex
    /// state when the config asks for a reindex, and loads the file
    /// bookkeeping the writer continues from.
    pub fn new(
        config: Config,
        meta: S,
        shutdown: Arc<ShutdownFlag>,
    ) -> Result<Self, BlockStoreError> {
        let magic = Magic::from(config.network).to_bytes();

        let reindexing = match config.reindex {
            true => {
                meta.set_reindex_state(ReindexState::ScanningFiles)?;
                ReindexState::ScanningFiles
            }
            false => meta.reindex_state()?,
        };

        let last_file = meta.last_file()?;
        let mut infos = Vec::new();
        if let Some(last_file) = last_file {
            for file in 0..=last_file {
                infos.push(meta.file_info(file)?.unwrap_or_default());
            }
        }
        let last_file = last_file.unwrap_or(0);

        let mapper = Arc::new(FileMapper::new(
            config.blocks_dir(),
            config.usable_block_data_dirs(),
        ));
        let writer = RawFileWriter::new(Arc::clone(&mapper), magic, last_file, infos);

        Ok(BlockStore {
            meta,
            mapper,
            writer,
            index: HeaderIndex::new(),
            chain: Mutex::new(ChainSet::new()),
            reindexing: Mutex::new(reindexing),
            config,
            magic,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &HeaderIndex {
        &self.index
    }

    pub fn shutdown(&self) -> &Arc<ShutdownFlag> {
        &self.shutdown
    }

    pub(crate) fn mapper(&self) -> &Arc<FileMapper> {
        &self.mapper
    }

    pub(crate) fn writer(&self) -> &RawFileWriter {
        &self.writer
    }

    pub(crate) fn magic(&self) -> [u8; MESSAGE_START_SIZE] {
        self.magic
    }

    /// Loads the whole catalogue into the in-memory index, rebuilds the
    /// skip pointers, and replays every record into the chain set so the
    /// tips and the best header come back exactly as before the restart.
    pub fn cache_all_block_infos(&self) -> Result<(), BlockStoreError> {
        let mut records = self.meta.all_headers()?;
        // parents first, so every record finds its ancestor in the arena
        records.sort_by_key(|(_, record)| record.height);

        let mut max_file = 0;
        for (hash, record) in records {
            max_file = max_file.max(record.file);
            match self.index.insert(hash, record) {
                Ok(_) => {}
                Err(BlockStoreError::UnknownParent(parent)) => {
                    log::warn!("skipping header {hash} with unknown parent {parent}");
                }
                Err(e) => return Err(e),
            }
        }
        self.index.build_skips();
        self.mapper.reserve_slots(max_file + 1);

        let mut chain = self.chain.lock().map_err(|_| BlockStoreError::Poisoned)?;
        for entry in self.index.all_by_height() {
            chain.append_header(&entry);
        }

        Ok(())
    }

    /// Materialises a freshly received header into the index. The parent
    /// must already be known, except for genesis.
    pub fn add_header(
        &self,
        header: BlockHeader,
        status: BlockStatus,
    ) -> Result<Arc<HeaderEntry>, BlockStoreError> {
        let hash = header.block_hash();
        if let Some(existing) = self.index.get(&hash) {
            return Ok(existing);
        }

        let height = match header.prev_blockhash == BlockHash::all_zeros() {
            true => 0,
            false => {
                self.index
                    .get(&header.prev_blockhash)
                    .ok_or(BlockStoreError::UnknownParent(header.prev_blockhash))?
                    .height()
                    + 1
            }
        };

        let record = DiskHeaderRecord::from_header(&header, height, status);
        let entry = self.index.insert(hash, record)?;
        self.index.mark_dirty(hash);

        Ok(entry)
    }

    /// Inserts the network's genesis header if it isn't in the catalogue
    /// yet. Safe to call any number of times.
    pub fn ensure_genesis(&self) -> Result<Arc<HeaderEntry>, BlockStoreError> {
        let genesis = genesis_block(self.config.network);
        let hash = genesis.header.block_hash();
        if let Some(existing) = self.index.get(&hash) {
            return Ok(existing);
        }

        let entry = self.add_header(
            genesis.header,
            BlockStatus::VALID_HEADER | BlockStatus::VALID_TREE,
        )?;
        self.append_header(&entry)?;
        self.meta.write_batch_sync(
            &[],
            self.writer.last_file(),
            &[(hash, entry.to_disk_record())],
        )?;

        Ok(entry)
    }

    /// Folds a header into the tip set. Returns whether the main chain
    /// changed. Consensus and the reindex epilogue are expected to call
    /// this single-threaded.
    pub fn append_header(&self, entry: &Arc<HeaderEntry>) -> Result<bool, BlockStoreError> {
        let mut chain = self.chain.lock().map_err(|_| BlockStoreError::Poisoned)?;
        Ok(chain.append_header(entry))
    }

    /// Durably persists one record and the last-file index, syncing the
    /// touched data files first so the referenced payloads are on disk
    /// before the catalogue points at them. Doesn't touch the header tree;
    /// the caller keeps the single-writer discipline.
    pub fn append_block(
        &self,
        entry: &Arc<HeaderEntry>,
        last_file: u32,
    ) -> Result<(), BlockStoreError> {
        if let Some(pos) = entry.data_position() {
            self.mapper.flush(FileKind::Block, pos.file)?;
        }
        if let Some(pos) = entry.undo_position() {
            self.mapper.flush(FileKind::Undo, pos.file)?;
        }

        self.meta
            .write_batch_sync(&[], last_file, &[(entry.hash(), entry.to_disk_record())])?;

        Ok(())
    }

    /// A snapshot view of the main chain
    pub fn header_chain(&self) -> HeaderChain {
        self.chain
            .lock()
            .map(|chain| chain.header_chain())
            .unwrap_or_default()
    }

    /// Every chain tip we know about, the best one included
    pub fn header_chain_tips(&self) -> Vec<Arc<HeaderEntry>> {
        self.chain
            .lock()
            .map(|chain| chain.tips())
            .unwrap_or_default()
    }

    /// Appends a serialized block to the data files. The block's timestamp
    /// is read from its header; `height` comes from the caller, who just
    /// connected it. Returns the position of the first payload byte.
    pub fn write_block(
        &self,
        block: &[u8],
        height: u32,
    ) -> Result<BlockPosition, BlockStoreError> {
        let (header, _) = deserialize_partial::<BlockHeader>(block).map_err(|_| {
            BlockStoreError::CorruptData("block payload too short for a header".into())
        })?;

        self.writer.write_block(block, height, header.time)
    }

    /// Appends undo data for `block_hash` to the rev file paired with the
    /// block's data file
    pub fn write_undo_block(
        &self,
        undo: &[u8],
        block_hash: &BlockHash,
        file: u32,
    ) -> Result<BlockPosition, BlockStoreError> {
        self.writer.write_undo(undo, block_hash, file)
    }

    /// Reads a block back from its position
    pub fn load_block(&self, pos: BlockPosition) -> Result<FastBlock, BlockStoreError> {
        self.writer.read_block(pos)
    }

    /// Reads undo data back, verifying its checksum against `block_hash`
    pub fn load_undo_block(
        &self,
        pos: BlockPosition,
        block_hash: &BlockHash,
    ) -> Result<FastUndoBlock, BlockStoreError> {
        self.writer.read_undo(pos, block_hash)
    }

    /// A view over one whole blk file, `None` when the file doesn't exist
    /// (anymore)
    pub fn load_block_file(&self, file: u32) -> Result<Option<SharedBytes>, BlockStoreError> {
        match self.mapper.view(FileKind::Block, file)? {
            None => Ok(None),
            Some(view) => {
                let len = view.len();
                Ok(Some(SharedBytes::new(view, 0, len)))
            }
        }
    }

    pub fn reindexing(&self) -> ReindexState {
        self.reindexing
            .lock()
            .map(|state| *state)
            .unwrap_or(ReindexState::NoReindex)
    }

    /// Moves the reindex state machine and persists the transition
    pub fn set_reindexing(&self, state: ReindexState) -> Result<(), BlockStoreError> {
        let mut current = self
            .reindexing
            .lock()
            .map_err(|_| BlockStoreError::Poisoned)?;
        if *current == state {
            return Ok(());
        }

        *current = state;
        self.meta.set_reindex_state(state)?;

        Ok(())
    }

    /// Persists everything that changed since the last flush: dirty file
    /// bookkeeping, the last-file index and dirty header records, in one
    /// durable batch. Data files are synced first, so a crash can only ever
    /// leave blocks on disk that the catalogue doesn't reference yet, never
    /// the other way around.
    pub fn flush(&self) -> Result<(), BlockStoreError> {
        let (files, last_file) = self.writer.take_dirty();
        for (file, _) in &files {
            self.mapper.flush(FileKind::Block, *file)?;
            self.mapper.flush(FileKind::Undo, *file)?;
        }

        let headers: Vec<_> = self
            .index
            .take_dirty()
            .iter()
            .map(|entry| (entry.hash(), entry.to_disk_record()))
            .collect();

        self.meta.write_batch_sync(&files, last_file, &headers)?;

        Ok(())
    }

    /// Looks a transaction up in the secondary index
    pub fn tx_position(&self, txid: &Txid) -> Result<Option<TxPosition>, BlockStoreError> {
        Ok(self.meta.tx_position(txid)?)
    }

    /// Adds a batch of entries to the transaction index
    pub fn write_tx_index(
        &self,
        entries: &[(Txid, TxPosition)],
    ) -> Result<(), BlockStoreError> {
        Ok(self.meta.write_tx_index(entries)?)
    }

    pub fn flag(&self, name: &str) -> Result<Option<bool>, BlockStoreError> {
        Ok(self.meta.flag(name)?)
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), BlockStoreError> {
        Ok(self.meta.write_flag(name, value)?)
    }
}
