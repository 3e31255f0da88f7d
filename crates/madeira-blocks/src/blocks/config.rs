use std::path::Path;
use std::path::PathBuf;

use bitcoin::Network;

#[derive(Debug, Clone)]
/// Configuration for a [BlockStore](crate::BlockStore). See each field for
/// more information.
pub struct Config {
    /// The chain-specific data directory. Raw data files live under
    /// `<datadir>/blocks/`, the header catalogue under
    /// `<datadir>/blocks/index/`.
    pub datadir: PathBuf,

    /// Which network we're on. This decides the 4-byte magic prefixed to
    /// every stored frame and the genesis block we bootstrap from.
    pub network: Network,

    /// Extra directories searched when a blk/rev file is missing from the
    /// primary datadir, in order. Each entry must contain a `blocks`
    /// subdirectory; entries that don't are skipped at startup.
    pub block_data_dirs: Vec<PathBuf>,

    /// Start a reindex: the header catalogue is rebuilt by scanning the raw
    /// data files. Seeds the persisted reindex state at construction.
    pub reindex: bool,

    /// Request a process shutdown once the reindex finishes
    pub stop_after_block_import: bool,
}

impl Config {
    /// Creates a configuration with the default values
    pub fn new(datadir: impl Into<PathBuf>, network: Network) -> Self {
        Config {
            datadir: datadir.into(),
            network,
            block_data_dirs: Vec::new(),
            reindex: false,
            stop_after_block_import: false,
        }
    }

    /// The directory holding the raw blk/rev files
    pub fn blocks_dir(&self) -> PathBuf {
        self.datadir.join("blocks")
    }

    /// The directory holding the header catalogue
    pub fn index_dir(&self) -> PathBuf {
        self.blocks_dir().join("index")
    }

    /// The extra directories that actually carry a `blocks` subdirectory.
    /// Invalid entries are dropped with a log line, matching how a user
    /// would debug a mistyped option.
    pub fn usable_block_data_dirs(&self) -> Vec<PathBuf> {
        self.block_data_dirs
            .iter()
            .filter(|dir| {
                let ok = Path::new(dir).join("blocks").is_dir();
                if !ok {
                    log::warn!(
                        "invalid blockdatadir passed. No 'blocks' subdir found, skipping: {}",
                        dir.display()
                    );
                }
                ok
            })
            .map(|dir| dir.join("blocks"))
            .collect()
    }
}
