//! End-to-end reindex: write blocks, wipe the catalogue, restart with the
//! reindex flag and check the header tree comes back identical.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use bitcoin::block::Header as BlockHeader;
use bitcoin::block::Version;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::Network;
use bitcoin::TxMerkleNode;
use madeira_blocks::BlockPosition;
use madeira_blocks::BlockStatus;
use madeira_blocks::BlockStore;
use madeira_blocks::BlockSubmitter;
use madeira_blocks::Config;
use madeira_blocks::KvMetaStore;
use madeira_blocks::ReindexState;
use madeira_blocks::ShutdownFlag;

fn test_datadir() -> PathBuf {
    let test_id = rand::random::<u64>();
    PathBuf::from(format!("./tmp-db/{test_id}"))
}

fn make_header(prev: BlockHash, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: Version::from_consensus(1),
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_600_000_000 + nonce,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce,
    }
}

type Store = BlockStore<KvMetaStore<'static>>;

fn open_store(datadir: &PathBuf, reindex: bool) -> (Arc<Store>, Arc<ShutdownFlag>) {
    let mut config = Config::new(datadir.clone(), Network::Regtest);
    config.reindex = reindex;
    let meta = KvMetaStore::new(config.index_dir()).unwrap();
    let shutdown = Arc::new(ShutdownFlag::new());
    let store = BlockStore::new(config, meta, Arc::clone(&shutdown)).unwrap();
    (Arc::new(store), shutdown)
}

/// Stands in for the validation engine: parses every submitted position
/// synchronously and feeds the header back into the store, the way the real
/// engine does from its worker pool.
struct MockValidator {
    store: Mutex<Option<Arc<Store>>>,
    positions: Mutex<Vec<BlockPosition>>,
}

impl MockValidator {
    fn new() -> Self {
        MockValidator {
            store: Mutex::new(None),
            positions: Mutex::new(Vec::new()),
        }
    }

    fn attach(&self, store: Arc<Store>) {
        *self.store.lock().unwrap() = Some(store);
    }
}

impl BlockSubmitter for MockValidator {
    fn wait_for_space(&self) {}

    fn add_block(&self, position: BlockPosition) {
        self.positions.lock().unwrap().push(position);

        let store = self.store.lock().unwrap().clone().unwrap();
        let block = store.load_block(position).unwrap();
        let header = block.header().unwrap();

        let entry = store.add_header(header, BlockStatus::default()).unwrap();
        store.append_header(&entry).unwrap();
        entry.record_data(position, 0);
    }

    fn wait_validation_finished(&self) {}
}

/// Builds a small chain on disk and returns (block hashes, tip hashes)
fn populate(store: &Store) -> (Vec<BlockHash>, Vec<BlockHash>) {
    let genesis = store.ensure_genesis().unwrap();

    let mut hashes = vec![genesis.hash()];
    let mut headers = vec![genesis.header()];
    let mut prev = genesis.hash();
    for nonce in 1..=5u32 {
        let header = make_header(prev, nonce);
        prev = header.block_hash();
        hashes.push(prev);
        headers.push(header);
    }

    for (height, header) in headers.iter().enumerate() {
        let block = Block {
            header: *header,
            txdata: Vec::new(),
        };
        let payload = serialize(&block);
        let pos = store.write_block(&payload, height as u32).unwrap();

        let entry = store
            .add_header(*header, BlockStatus::default())
            .unwrap();
        store.append_header(&entry).unwrap();
        entry.record_data(pos, 0);
    }
    store.flush().unwrap();

    let mut tips: Vec<_> = store
        .header_chain_tips()
        .iter()
        .map(|tip| tip.hash())
        .collect();
    tips.sort();
    (hashes, tips)
}

#[test]
fn reindex_rebuilds_the_catalogue() {
    let datadir = test_datadir();

    let (hashes, tips_before) = {
        let (store, _) = open_store(&datadir, false);
        populate(&store)
    };

    // lose the catalogue, keep the raw files
    std::fs::remove_dir_all(datadir.join("blocks").join("index")).unwrap();

    let (store, _) = open_store(&datadir, true);
    assert_eq!(store.reindexing(), ReindexState::ScanningFiles);

    let validator = Arc::new(MockValidator::new());
    validator.attach(Arc::clone(&store));

    let worker = store
        .start_block_importer(Arc::clone(&validator) as Arc<dyn BlockSubmitter>)
        .expect("a pending reindex spawns a worker");
    worker.join().unwrap();

    // the state machine ran to completion
    assert_eq!(store.reindexing(), ReindexState::NoReindex);

    // every written block was submitted, in file order
    let positions = validator.positions.lock().unwrap().clone();
    assert_eq!(positions.len(), hashes.len());
    for pair in positions.windows(2) {
        assert!(pair[0].pos < pair[1].pos);
    }

    // the header tree is back: same records, same tips
    assert_eq!(store.index().len(), hashes.len());
    for hash in &hashes {
        assert!(store.index().exists(hash), "missing header {hash}");
    }
    let mut tips_after: Vec<_> = store
        .header_chain_tips()
        .iter()
        .map(|tip| tip.hash())
        .collect();
    tips_after.sort();
    assert_eq!(tips_after, tips_before);
    assert_eq!(
        store.header_chain().tip().unwrap().hash(),
        *hashes.last().unwrap()
    );

    // the scan rebuilt the file bookkeeping too
    let files = store.index().files_with_data();
    assert_eq!(files.into_iter().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn reindex_resumes_after_restart_of_parsing_phase() {
    let datadir = test_datadir();

    {
        let (store, _) = open_store(&datadir, false);
        populate(&store);
    }

    // simulate a crash after scanning finished but before validation did
    {
        let (store, _) = open_store(&datadir, false);
        store
            .set_reindexing(ReindexState::ParsingBlocks)
            .unwrap();
    }

    let (store, _) = open_store(&datadir, false);
    store.cache_all_block_infos().unwrap();
    assert_eq!(store.reindexing(), ReindexState::ParsingBlocks);

    let validator = Arc::new(MockValidator::new());
    validator.attach(Arc::clone(&store));

    // the importer skips the scan and only waits validation out
    let worker = store
        .start_block_importer(Arc::clone(&validator) as Arc<dyn BlockSubmitter>)
        .unwrap();
    worker.join().unwrap();

    assert_eq!(store.reindexing(), ReindexState::NoReindex);
    assert!(validator.positions.lock().unwrap().is_empty());
}

#[test]
fn shutdown_interrupts_the_scan_and_preserves_state() {
    let datadir = test_datadir();

    {
        let (store, _) = open_store(&datadir, false);
        populate(&store);
    }

    std::fs::remove_dir_all(datadir.join("blocks").join("index")).unwrap();

    let (store, shutdown) = open_store(&datadir, true);
    let validator = Arc::new(MockValidator::new());
    validator.attach(Arc::clone(&store));

    // the flag is already up; the worker bails after the first submission
    shutdown.request_shutdown();
    let worker = store
        .start_block_importer(Arc::clone(&validator) as Arc<dyn BlockSubmitter>)
        .unwrap();
    worker.join().unwrap();

    assert_eq!(validator.positions.lock().unwrap().len(), 1);
    assert_eq!(store.reindexing(), ReindexState::ScanningFiles);
}

#[test]
fn stop_after_block_import_requests_shutdown() {
    let datadir = test_datadir();

    let (hashes, _) = {
        let (store, _) = open_store(&datadir, false);
        populate(&store)
    };

    std::fs::remove_dir_all(datadir.join("blocks").join("index")).unwrap();

    let mut config = Config::new(datadir.clone(), Network::Regtest);
    config.reindex = true;
    config.stop_after_block_import = true;
    let meta = KvMetaStore::new(config.index_dir()).unwrap();
    let shutdown = Arc::new(ShutdownFlag::new());
    let store = Arc::new(
        BlockStore::new(config, meta, Arc::clone(&shutdown)).unwrap(),
    );

    let validator = Arc::new(MockValidator::new());
    validator.attach(Arc::clone(&store));

    let worker = store
        .start_block_importer(Arc::clone(&validator) as Arc<dyn BlockSubmitter>)
        .unwrap();
    worker.join().unwrap();

    assert!(shutdown.is_shutting_down());
    assert_eq!(
        store.header_chain().tip().unwrap().hash(),
        *hashes.last().unwrap()
    );
}
