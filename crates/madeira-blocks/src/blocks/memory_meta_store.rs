//! An in-memory header catalogue. Being in-memory means it is volatile and
//! everything is lost when the process ends; it exists for tests that want a
//! [MetaStore] without touching the filesystem.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use bitcoin::BlockHash;
use bitcoin::Txid;

use crate::blocks::error::DatabaseError;
use crate::blocks::meta_store::DiskHeaderRecord;
use crate::blocks::meta_store::MetaStore;
use crate::blocks::meta_store::TxPosition;
use crate::blocks::raw_file::FileInfo;
use crate::blocks::ReindexState;

#[derive(Debug, Default)]
struct Inner {
    headers: HashMap<BlockHash, DiskHeaderRecord>,
    files: HashMap<u32, FileInfo>,
    last_file: Option<u32>,
    tx_index: HashMap<Txid, TxPosition>,
    flags: HashMap<String, bool>,
    reindex: ReindexState,
}

#[derive(Debug)]
pub enum MemoryStoreError {
    PoisonedLock,
}

impl DatabaseError for MemoryStoreError {}

#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    inner: RwLock<Inner>,
}

type Result<T> = std::result::Result<T, MemoryStoreError>;

impl MemoryMetaStore {
    pub fn new() -> MemoryMetaStore {
        MemoryMetaStore {
            inner: Default::default(),
        }
    }

    fn get_inner(&self) -> Result<RwLockReadGuard<Inner>> {
        self.inner
            .read()
            .map_err(|_| MemoryStoreError::PoisonedLock)
    }

    fn get_inner_mut(&self) -> Result<RwLockWriteGuard<Inner>> {
        self.inner
            .write()
            .map_err(|_| MemoryStoreError::PoisonedLock)
    }
}

impl MetaStore for MemoryMetaStore {
    type Error = MemoryStoreError;

    fn header(&self, hash: &BlockHash) -> Result<Option<DiskHeaderRecord>> {
        Ok(self.get_inner()?.headers.get(hash).copied())
    }

    fn all_headers(&self) -> Result<Vec<(BlockHash, DiskHeaderRecord)>> {
        Ok(self
            .get_inner()?
            .headers
            .iter()
            .map(|(hash, record)| (*hash, *record))
            .collect())
    }

    fn file_info(&self, file: u32) -> Result<Option<FileInfo>> {
        Ok(self.get_inner()?.files.get(&file).copied())
    }

    fn last_file(&self) -> Result<Option<u32>> {
        Ok(self.get_inner()?.last_file)
    }

    fn write_batch_sync(
        &self,
        files: &[(u32, FileInfo)],
        last_file: u32,
        headers: &[(BlockHash, DiskHeaderRecord)],
    ) -> Result<()> {
        let mut inner = self.get_inner_mut()?;
        for (index, info) in files {
            inner.files.insert(*index, *info);
        }
        inner.last_file = Some(last_file);
        for (hash, record) in headers {
            inner.headers.insert(*hash, *record);
        }

        Ok(())
    }

    fn tx_position(&self, txid: &Txid) -> Result<Option<TxPosition>> {
        Ok(self.get_inner()?.tx_index.get(txid).copied())
    }

    fn write_tx_index(&self, entries: &[(Txid, TxPosition)]) -> Result<()> {
        let mut inner = self.get_inner_mut()?;
        for (txid, pos) in entries {
            inner.tx_index.insert(*txid, *pos);
        }

        Ok(())
    }

    fn flag(&self, name: &str) -> Result<Option<bool>> {
        Ok(self.get_inner()?.flags.get(name).copied())
    }

    fn write_flag(&self, name: &str, value: bool) -> Result<()> {
        self.get_inner_mut()?.flags.insert(name.to_string(), value);

        Ok(())
    }

    fn reindex_state(&self) -> Result<ReindexState> {
        Ok(self.get_inner()?.reindex)
    }

    fn set_reindex_state(&self, state: ReindexState) -> Result<()> {
        self.get_inner_mut()?.reindex = state;

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
