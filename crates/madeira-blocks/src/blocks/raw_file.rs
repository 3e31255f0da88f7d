//! Framing of raw blocks and undo payloads into the numbered data files.
//!
//! Every record is `magic[4] || length[4 LE] || payload`, and rev records
//! carry a trailing 32-byte double-SHA256 checksum over
//! `block_hash || payload`. Positions always point at the first payload
//! byte, so the frame header sits at `pos - 8` and the length at `pos - 4`.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::deserialize_partial;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;
use bitcoin::Block;
use bitcoin::BlockHash;

use crate::blocks::error::BlockStoreError;
use crate::blocks::file_mapper::FileKind;
use crate::blocks::file_mapper::FileMapper;
use crate::blocks::file_mapper::MappedFile;
use crate::blocks::file_mapper::SharedBytes;

/// Hard cap on a single blk file. A frame that would push a file past this
/// rolls over into a new file.
pub const MAX_BLOCKFILE_SIZE: u32 = 128 * 1024 * 1024;

/// How much a blk file grows at a time
pub const BLOCKFILE_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// How much a rev file grows at a time
pub const UNDOFILE_CHUNK_SIZE: u32 = 1024 * 1024;

/// Length of the network magic prefixing every frame
pub const MESSAGE_START_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A byte position inside the file store: which data file, and the offset of
/// the first payload byte within it
pub struct BlockPosition {
    pub file: u32,
    pub pos: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Bookkeeping for one numbered data file pair. Mutated only under the
/// writer lock, persisted by every batch sync.
pub struct FileInfo {
    /// How many blocks were written into the blk file
    pub blocks: u32,

    /// Bytes used in the blk file
    pub size: u32,

    /// Bytes used in the rev file
    pub undo_size: u32,

    /// Lowest block height stored in this file
    pub height_first: u32,

    /// Highest block height stored in this file
    pub height_last: u32,

    /// Earliest block timestamp stored in this file
    pub time_first: u32,

    /// Latest block timestamp stored in this file
    pub time_last: u32,
}

impl FileInfo {
    /// Accounts for one more block landing in this file
    pub fn add_block(&mut self, height: u32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
        self.blocks += 1;
    }
}

impl Encodable for FileInfo {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> bitcoin::io::Result<usize> {
        let mut len = 0;
        len += self.blocks.consensus_encode(writer)?;
        len += self.size.consensus_encode(writer)?;
        len += self.undo_size.consensus_encode(writer)?;
        len += self.height_first.consensus_encode(writer)?;
        len += self.height_last.consensus_encode(writer)?;
        len += self.time_first.consensus_encode(writer)?;
        len += self.time_last.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for FileInfo {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, bitcoin::consensus::encode::Error> {
        Ok(FileInfo {
            blocks: u32::consensus_decode(reader)?,
            size: u32::consensus_decode(reader)?,
            undo_size: u32::consensus_decode(reader)?,
            height_first: u32::consensus_decode(reader)?,
            height_last: u32::consensus_decode(reader)?,
            time_first: u32::consensus_decode(reader)?,
            time_last: u32::consensus_decode(reader)?,
        })
    }
}

#[derive(Clone)]
/// A zero-copy view of one serialized block inside a mapped data file
pub struct FastBlock {
    bytes: SharedBytes,
}

impl FastBlock {
    pub(crate) fn new(bytes: SharedBytes) -> Self {
        FastBlock { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes just the 80-byte header
    pub fn header(&self) -> Result<BlockHeader, BlockStoreError> {
        let (header, _) = deserialize_partial::<BlockHeader>(self.as_slice())?;
        Ok(header)
    }

    /// Decodes the whole block
    pub fn block(&self) -> Result<Block, BlockStoreError> {
        Ok(deserialize(self.as_slice())?)
    }

    pub fn block_hash(&self) -> Result<BlockHash, BlockStoreError> {
        Ok(self.header()?.block_hash())
    }
}

impl Deref for FastBlock {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl std::fmt::Debug for FastBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastBlock").field("len", &self.len()).finish()
    }
}

#[derive(Clone)]
/// A zero-copy view of one undo payload, already checksum-verified
pub struct FastUndoBlock {
    bytes: SharedBytes,
}

impl FastUndoBlock {
    pub(crate) fn new(bytes: SharedBytes) -> Self {
        FastUndoBlock { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Deref for FastUndoBlock {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl std::fmt::Debug for FastUndoBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastUndoBlock").field("len", &self.len()).finish()
    }
}

/// The checksum trailing every rev record: double-SHA256 over the block hash
/// followed by the raw payload
pub(crate) fn undo_checksum(block_hash: &BlockHash, payload: &[u8]) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(block_hash.as_byte_array());
    engine.input(payload);
    sha256d::Hash::from_engine(engine)
}

struct WriterState {
    last_file: u32,
    infos: Vec<FileInfo>,
    dirty: BTreeSet<u32>,
}

/// Appends framed blocks and undo payloads to the data files. All mutation
/// is serialised on one writer mutex; reads only touch the mapper briefly to
/// fetch a view and then run lock-free on the ref-counted buffer.
pub struct RawFileWriter {
    mapper: Arc<FileMapper>,
    magic: [u8; MESSAGE_START_SIZE],
    state: Mutex<WriterState>,
}

impl RawFileWriter {
    /// `last_file` and `infos` come from the persisted catalogue; a fresh
    /// datadir passes `0` and an empty vector.
    pub fn new(
        mapper: Arc<FileMapper>,
        magic: [u8; MESSAGE_START_SIZE],
        last_file: u32,
        infos: Vec<FileInfo>,
    ) -> Self {
        mapper.set_last_block_file(last_file);
        RawFileWriter {
            mapper,
            magic,
            state: Mutex::new(WriterState {
                last_file,
                infos,
                dirty: BTreeSet::new(),
            }),
        }
    }

    pub fn last_file(&self) -> u32 {
        self.state.lock().map(|state| state.last_file).unwrap_or(0)
    }

    pub fn file_info(&self, index: u32) -> Option<FileInfo> {
        let state = self.state.lock().ok()?;
        state.infos.get(index as usize).copied()
    }

    /// Appends a block to the current last blk file, opening a new file when
    /// this is the very first block or the frame wouldn't fit under
    /// [MAX_BLOCKFILE_SIZE]. `height` and `time` feed the file's bookkeeping
    /// bounds. Returns the position of the first payload byte.
    pub fn write_block(
        &self,
        payload: &[u8],
        height: u32,
        time: u32,
    ) -> Result<BlockPosition, BlockStoreError> {
        let block_size = payload.len() as u32;
        assert!(block_size < MAX_BLOCKFILE_SIZE - 8);

        let mut state = self.state.lock().map_err(|_| BlockStoreError::Poisoned)?;

        let mut new_file = false;
        if state.infos.is_empty() {
            new_file = true;
            let len = state.last_file as usize + 1;
            state.infos.resize(len, FileInfo::default());
        } else if state.infos[state.last_file as usize].size + block_size + 8 > MAX_BLOCKFILE_SIZE
        {
            // previous file full
            new_file = true;
            state.last_file += 1;
            let len = state.last_file as usize + 1;
            state.infos.resize(len, FileInfo::default());
        }
        let file = state.last_file;
        self.mapper.set_last_block_file(file);

        if new_file {
            let first_size = (block_size + 8).max(BLOCKFILE_CHUNK_SIZE) as u64;
            log::debug!(
                "Starting new file {}",
                self.mapper.primary_path(FileKind::Block, file).display()
            );
            self.mapper.create_file(FileKind::Block, file, first_size)?;
        }

        let used = state.infos[file as usize].size;
        let view = self.writable_view(FileKind::Block, file, used, block_size + 8)?;

        let start = used as usize;
        // SAFETY: the writer lock is held and the frame lands entirely past
        // the committed size, where no reader ever looks.
        unsafe {
            view.write_at(start, &self.magic);
            view.write_at(start + 4, &block_size.to_le_bytes());
            view.write_at(start + 8, payload);
        }

        let info = &mut state.infos[file as usize];
        info.add_block(height, time);
        info.size += block_size + 8;
        state.dirty.insert(file);

        Ok(BlockPosition {
            file,
            pos: used + 8,
        })
    }

    /// Appends an undo payload to the rev file matching `preferred_file`
    /// (the file its block lives in), with the checksum appended after the
    /// payload. A preferred index past the last known file advances it, for
    /// resyncs that write undo data before any block.
    pub fn write_undo(
        &self,
        payload: &[u8],
        block_hash: &BlockHash,
        preferred_file: u32,
    ) -> Result<BlockPosition, BlockStoreError> {
        let block_size = payload.len() as u32;
        assert!(block_size > 0);

        let mut state = self.state.lock().map_err(|_| BlockStoreError::Poisoned)?;

        let mut new_file = false;
        if state.infos.is_empty() {
            new_file = true;
            state.last_file = state.last_file.max(preferred_file);
            let len = state.last_file as usize + 1;
            state.infos.resize(len, FileInfo::default());
        } else if state.last_file < preferred_file {
            new_file = true;
            state.last_file = (state.last_file + 1).max(preferred_file);
            let len = state.last_file as usize + 1;
            state.infos.resize(len, FileInfo::default());
        }
        let file = preferred_file;
        debug_assert!(file <= state.last_file);
        self.mapper.set_last_block_file(state.last_file);

        if new_file || state.infos[file as usize].undo_size == 0 {
            let first_size = (block_size + 8).max(UNDOFILE_CHUNK_SIZE) as u64;
            log::debug!(
                "Starting new file {}",
                self.mapper.primary_path(FileKind::Undo, file).display()
            );
            self.mapper.create_file(FileKind::Undo, file, first_size)?;
        }

        let used = state.infos[file as usize].undo_size;
        let view = self.writable_view(FileKind::Undo, file, used, block_size + 8 + 32)?;

        let start = used as usize;
        let checksum = undo_checksum(block_hash, payload);
        // SAFETY: same as `write_block`, the frame lands past the committed
        // size under the writer lock.
        unsafe {
            view.write_at(start, &self.magic);
            view.write_at(start + 4, &block_size.to_le_bytes());
            view.write_at(start + 8, payload);
            view.write_at(start + 8 + payload.len(), checksum.as_byte_array());
        }

        let info = &mut state.infos[file as usize];
        info.undo_size += block_size + 8 + 32;
        state.dirty.insert(file);

        Ok(BlockPosition {
            file,
            pos: used + 8,
        })
    }

    /// Maps a file for writing, growing it chunk by chunk until a frame of
    /// `needed` more bytes fits past `used`
    fn writable_view(
        &self,
        kind: FileKind,
        file: u32,
        used: u32,
        needed: u32,
    ) -> Result<Arc<MappedFile>, BlockStoreError> {
        let open_err = || {
            BlockStoreError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                "could not map data file for writing",
            ))
        };

        let mut view = self.mapper.view(kind, file)?.ok_or_else(open_err)?;
        if !view.writable() {
            log::error!(
                "Wanting to write to data file {}{:05}.dat failed, file read-only",
                kind.prefix(),
                file
            );
            return Err(BlockStoreError::NotWritable);
        }

        // where re-mapping isn't possible, files are pre-allocated at full size
        #[cfg(not(windows))]
        {
            let chunk = match kind {
                FileKind::Block => BLOCKFILE_CHUNK_SIZE,
                FileKind::Undo => UNDOFILE_CHUNK_SIZE,
            };
            while (used + needed) as usize >= view.len() {
                let new_size = view.len() as u64 + chunk as u64;
                log::debug!(
                    "File {}{:05}.dat needs to be resized",
                    kind.prefix(),
                    file
                );
                self.mapper.grow_to(kind, file, new_size)?;
                view = self.mapper.view(kind, file)?.ok_or_else(open_err)?;
                if !view.writable() {
                    log::error!("Resized file no longer writable");
                    return Err(BlockStoreError::NotWritable);
                }
            }
        }

        Ok(view)
    }

    /// Reads a block back. The length is taken from the frame header at
    /// `pos - 4` and validated against the mapped size.
    pub fn read_block(&self, pos: BlockPosition) -> Result<FastBlock, BlockStoreError> {
        let bytes = self.read_frame(FileKind::Block, pos, None)?;
        Ok(FastBlock::new(bytes))
    }

    /// Reads an undo payload back, recomputing and verifying the trailing
    /// checksum
    pub fn read_undo(
        &self,
        pos: BlockPosition,
        block_hash: &BlockHash,
    ) -> Result<FastUndoBlock, BlockStoreError> {
        let bytes = self.read_frame(FileKind::Undo, pos, Some(block_hash))?;
        Ok(FastUndoBlock::new(bytes))
    }

    fn read_frame(
        &self,
        kind: FileKind,
        pos: BlockPosition,
        checksum_hash: Option<&BlockHash>,
    ) -> Result<SharedBytes, BlockStoreError> {
        if pos.pos < 4 {
            return Err(BlockStoreError::CorruptData(
                "position inside the frame header".into(),
            ));
        }

        let view = self.mapper.view(kind, pos.file)?.ok_or_else(|| {
            BlockStoreError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                "failed to map data file",
            ))
        })?;

        let file_size = view.len();
        let start = pos.pos as usize;
        if start >= file_size {
            return Err(BlockStoreError::CorruptData("position outside of file".into()));
        }

        let len_bytes: [u8; 4] = view.as_slice()[start - 4..start]
            .try_into()
            .expect("slice is four bytes");
        let block_size = u32::from_le_bytes(len_bytes) as usize;

        let trailer = if checksum_hash.is_some() { 32 } else { 0 };
        if start + block_size + trailer > file_size {
            return Err(BlockStoreError::CorruptData(
                "frame runs past the end of the file".into(),
            ));
        }

        if let Some(hash) = checksum_hash {
            let payload = &view.as_slice()[start..start + block_size];
            let expected = undo_checksum(hash, payload);
            let stored = &view.as_slice()[start + block_size..start + block_size + 32];
            if stored != expected.as_byte_array() {
                return Err(BlockStoreError::CorruptData("undo checksum mismatch".into()));
            }
        }

        Ok(SharedBytes::new(view, start, start + block_size))
    }

    /// Feeds back the block count and used size the reindex scan discovered
    /// for one file. Everything but the undo size is overwritten, since undo
    /// data may have been rewritten already.
    pub fn register_scanned_file(&self, index: u32, found: FileInfo) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if state.last_file < index {
            state.last_file = index;
        }
        let len = (state.last_file as usize + 1).max(state.infos.len());
        state.infos.resize(len, FileInfo::default());

        let info = &mut state.infos[index as usize];
        info.blocks = found.blocks;
        info.size = found.size;
        state.dirty.insert(index);
        self.mapper.set_last_block_file(state.last_file);

        log::info!(
            "Registering block file info {}: {} blocks with a total of {} bytes",
            index,
            found.blocks,
            found.size
        );
    }

    /// Drains the set of files touched since the last sync, paired with the
    /// current last-file index
    pub fn take_dirty(&self) -> (Vec<(u32, FileInfo)>, u32) {
        let Ok(mut state) = self.state.lock() else {
            return (Vec::new(), 0);
        };

        let dirty = core::mem::take(&mut state.dirty);
        let infos = dirty
            .into_iter()
            .filter_map(|index| {
                state
                    .infos
                    .get(index as usize)
                    .map(|info| (index, *info))
            })
            .collect();

        (infos, state.last_file)
    }
}
