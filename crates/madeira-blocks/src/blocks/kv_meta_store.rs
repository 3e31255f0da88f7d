//! The persistent header catalogue, a thin typed layer over the `kv`
//! embedded store.
//!
//! One bucket per record family: header records, file bookkeeping, the
//! transaction index and named flags, plus the unnamed bucket for the
//! last-file index, the reindex state and the obfuscation key. Every value
//! is XOR-obfuscated with a per-database 8-byte random key generated the
//! first time the database is opened, so raw catalogue bytes never look like
//! block data to overzealous file scanners.

use std::path::Path;

use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::BlockHash;
use bitcoin::Txid;
use kv::Batch;
use kv::Bucket;
use kv::Config;
use kv::Integer;
use kv::Store;

use crate::blocks::meta_store::DiskHeaderRecord;
use crate::blocks::meta_store::MetaStore;
use crate::blocks::meta_store::TxPosition;
use crate::blocks::raw_file::FileInfo;
use crate::blocks::ReindexState;

const OBFUSCATE_KEY: &str = "obfuscate_key";
const LAST_FILE_KEY: &str = "last_block_file";
const REINDEX_KEY: &str = "reindexing";

/// Production [MetaStore] backed by the `kv` embedded database
pub struct KvMetaStore<'a> {
    _store: Store,
    headers: Bucket<'a, Vec<u8>, Vec<u8>>,
    files: Bucket<'a, Integer, Vec<u8>>,
    tx_index: Bucket<'a, Vec<u8>, Vec<u8>>,
    flags: Bucket<'a, Vec<u8>, Vec<u8>>,
    meta: Bucket<'a, &'a str, Vec<u8>>,
    obfuscate_key: [u8; 8],
}

impl<'a> KvMetaStore<'a> {
    /// Opens (or creates) the catalogue under the given index directory
    pub fn new(index_dir: impl AsRef<Path>) -> Result<KvMetaStore<'a>, kv::Error> {
        let cfg = Config::new(index_dir.as_ref()).cache_capacity(100_000_000);
        let store = Store::new(cfg)?;

        let meta = store.bucket(None)?;
        let obfuscate_key = Self::load_or_create_obfuscate_key(&meta)?;

        Ok(KvMetaStore {
            headers: store.bucket(Some("headers"))?,
            files: store.bucket(Some("fileinfo"))?,
            tx_index: store.bucket(Some("txindex"))?,
            flags: store.bucket(Some("flags"))?,
            meta,
            _store: store,
            obfuscate_key,
        })
    }

    /// The obfuscation key is the one value stored in the clear; everything
    /// else is XORed with it
    fn load_or_create_obfuscate_key(
        meta: &Bucket<'a, &'a str, Vec<u8>>,
    ) -> Result<[u8; 8], kv::Error> {
        if let Some(stored) = meta.get(&OBFUSCATE_KEY)? {
            if stored.len() == 8 {
                let mut key = [0u8; 8];
                key.copy_from_slice(&stored);
                return Ok(key);
            }
        }

        let key: [u8; 8] = rand::random();
        meta.set(&OBFUSCATE_KEY, &key.to_vec())?;
        meta.flush()?;
        Ok(key)
    }

    /// XOR obfuscation is an involution, the same call encodes and decodes
    fn obfuscate(&self, mut data: Vec<u8>) -> Vec<u8> {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.obfuscate_key[i % 8];
        }
        data
    }
}

impl MetaStore for KvMetaStore<'_> {
    type Error = kv::Error;

    fn header(&self, hash: &BlockHash) -> Result<Option<DiskHeaderRecord>, Self::Error> {
        let key = serialize(hash);
        Ok(self.headers.get(&key)?.map(|raw| {
            deserialize(&self.obfuscate(raw)).expect("infallible: came from serialize(record)")
        }))
    }

    fn all_headers(&self) -> Result<Vec<(BlockHash, DiskHeaderRecord)>, Self::Error> {
        let mut records = Vec::new();
        for item in self.headers.iter() {
            let item = item?;
            let key: Vec<u8> = item.key()?;
            let value: Vec<u8> = item.value()?;

            let hash = deserialize(&key).expect("infallible: keys are serialized hashes");
            let record = deserialize(&self.obfuscate(value))
                .expect("infallible: came from serialize(record)");
            records.push((hash, record));
        }

        Ok(records)
    }

    fn file_info(&self, file: u32) -> Result<Option<FileInfo>, Self::Error> {
        Ok(self.files.get(&Integer::from(file))?.map(|raw| {
            deserialize(&self.obfuscate(raw)).expect("infallible: came from serialize(info)")
        }))
    }

    fn last_file(&self) -> Result<Option<u32>, Self::Error> {
        Ok(self.meta.get(&LAST_FILE_KEY)?.map(|raw| {
            deserialize(&self.obfuscate(raw)).expect("infallible: came from serialize(index)")
        }))
    }

    fn write_batch_sync(
        &self,
        files: &[(u32, FileInfo)],
        last_file: u32,
        headers: &[(BlockHash, DiskHeaderRecord)],
    ) -> Result<(), Self::Error> {
        let mut batch = Batch::new();
        for (index, info) in files {
            batch.set(&Integer::from(*index), &self.obfuscate(serialize(info)))?;
        }
        self.files.batch(batch)?;

        let mut batch = Batch::new();
        for (hash, record) in headers {
            batch.set(&serialize(hash), &self.obfuscate(serialize(record)))?;
        }
        self.headers.batch(batch)?;

        // the last-file key goes in after the infos it references, so a
        // crash in between never leaves it pointing at unknown files
        self.meta
            .set(&LAST_FILE_KEY, &self.obfuscate(serialize(&last_file)))?;

        self.flush()
    }

    fn tx_position(&self, txid: &Txid) -> Result<Option<TxPosition>, Self::Error> {
        let key = serialize(txid);
        Ok(self.tx_index.get(&key)?.map(|raw| {
            deserialize(&self.obfuscate(raw)).expect("infallible: came from serialize(pos)")
        }))
    }

    fn write_tx_index(&self, entries: &[(Txid, TxPosition)]) -> Result<(), Self::Error> {
        let mut batch = Batch::new();
        for (txid, pos) in entries {
            batch.set(&serialize(txid), &self.obfuscate(serialize(pos)))?;
        }
        self.tx_index.batch(batch)?;

        Ok(())
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, Self::Error> {
        let key = name.as_bytes().to_vec();
        Ok(self
            .flags
            .get(&key)?
            .map(|raw| self.obfuscate(raw) == vec![b'1']))
    }

    fn write_flag(&self, name: &str, value: bool) -> Result<(), Self::Error> {
        let key = name.as_bytes().to_vec();
        let value = vec![if value { b'1' } else { b'0' }];
        self.flags.set(&key, &self.obfuscate(value))?;

        Ok(())
    }

    fn reindex_state(&self) -> Result<ReindexState, Self::Error> {
        let state = match self.meta.get(&REINDEX_KEY)? {
            None => ReindexState::NoReindex,
            Some(raw) => match self.obfuscate(raw).first() {
                Some(1) => ReindexState::ScanningFiles,
                _ => ReindexState::ParsingBlocks,
            },
        };

        Ok(state)
    }

    fn set_reindex_state(&self, state: ReindexState) -> Result<(), Self::Error> {
        match state {
            ReindexState::NoReindex => {
                self.meta.remove(&REINDEX_KEY)?;
            }
            ReindexState::ScanningFiles => {
                self.meta.set(&REINDEX_KEY, &self.obfuscate(vec![1]))?;
            }
            ReindexState::ParsingBlocks => {
                self.meta.set(&REINDEX_KEY, &self.obfuscate(vec![2]))?;
            }
        }
        self.meta.flush()?;

        Ok(())
    }

    fn flush(&self) -> Result<(), Self::Error> {
        self.headers.flush()?;
        self.files.flush()?;
        self.tx_index.flush()?;
        self.flags.flush()?;
        self.meta.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::block::Header as BlockHeader;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use bitcoin::CompactTarget;
    use bitcoin::TxMerkleNode;
    use bitcoin::Txid;

    use super::KvMetaStore;
    use crate::blocks::header_index::BlockStatus;
    use crate::blocks::meta_store::DiskHeaderRecord;
    use crate::blocks::meta_store::MetaStore;
    use crate::blocks::meta_store::TxPosition;
    use crate::blocks::raw_file::FileInfo;
    use crate::blocks::ReindexState;

    fn test_store() -> KvMetaStore<'static> {
        let test_id = rand::random::<u64>();
        KvMetaStore::new(format!("./tmp-db/{test_id}/index")).unwrap()
    }

    fn sample_record(nonce: u32) -> (BlockHash, DiskHeaderRecord) {
        let header = BlockHeader {
            version: Version::from_consensus(1),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce,
        };
        let record = DiskHeaderRecord::from_header(&header, nonce, BlockStatus::default());
        (header.block_hash(), record)
    }

    #[test]
    fn batch_sync_round_trip() {
        let store = test_store();

        let (hash_a, record_a) = sample_record(1);
        let (hash_b, record_b) = sample_record(2);
        let info = FileInfo {
            blocks: 2,
            size: 512,
            ..Default::default()
        };

        store
            .write_batch_sync(&[(0, info)], 0, &[(hash_a, record_a), (hash_b, record_b)])
            .unwrap();

        assert_eq!(store.header(&hash_a).unwrap(), Some(record_a));
        assert_eq!(store.header(&hash_b).unwrap(), Some(record_b));
        assert_eq!(store.file_info(0).unwrap(), Some(info));
        assert_eq!(store.last_file().unwrap(), Some(0));
        assert!(store.header(&BlockHash::all_zeros()).unwrap().is_none());

        let mut all = store.all_headers().unwrap();
        all.sort_by_key(|(_, record)| record.height);
        assert_eq!(all, vec![(hash_a, record_a), (hash_b, record_b)]);
    }

    #[test]
    fn flags_and_reindex_state() {
        let store = test_store();

        assert!(store.flag("txindex").unwrap().is_none());
        store.write_flag("txindex", true).unwrap();
        assert_eq!(store.flag("txindex").unwrap(), Some(true));
        store.write_flag("txindex", false).unwrap();
        assert_eq!(store.flag("txindex").unwrap(), Some(false));

        assert_eq!(store.reindex_state().unwrap(), ReindexState::NoReindex);
        store
            .set_reindex_state(ReindexState::ScanningFiles)
            .unwrap();
        assert_eq!(store.reindex_state().unwrap(), ReindexState::ScanningFiles);
        store
            .set_reindex_state(ReindexState::ParsingBlocks)
            .unwrap();
        assert_eq!(store.reindex_state().unwrap(), ReindexState::ParsingBlocks);
        store.set_reindex_state(ReindexState::NoReindex).unwrap();
        assert_eq!(store.reindex_state().unwrap(), ReindexState::NoReindex);
    }

    #[test]
    fn tx_index_round_trip() {
        let store = test_store();
        let txid = Txid::all_zeros();
        let pos = TxPosition {
            file: 0,
            block_pos: 8,
            tx_offset: 81,
        };

        assert!(store.tx_position(&txid).unwrap().is_none());
        store.write_tx_index(&[(txid, pos)]).unwrap();
        assert_eq!(store.tx_position(&txid).unwrap(), Some(pos));
    }
}
