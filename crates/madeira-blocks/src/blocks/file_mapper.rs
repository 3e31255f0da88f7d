//! Memory-mapped access to the numbered data files.
//!
//! Every blk/rev file is mapped at most once at a time; the mapping is held
//! behind an `Arc` and the mapper itself only keeps a `Weak` slot per file.
//! That way a mapping stays alive exactly as long as somebody is reading
//! from it, and growing a file simply drops the slot: readers holding the
//! old view keep a valid (smaller) mapping, the next `view` call maps the
//! resized file. A short FIFO of strong references keeps the most recently
//! used files open so we don't thrash mmap/munmap on every block load.

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use memmap2::Mmap;
use memmap2::MmapMut;
use memmap2::MmapOptions;

use crate::blocks::error::BlockStoreError;
#[cfg(windows)]
use crate::blocks::raw_file::MAX_BLOCKFILE_SIZE;

/// How many recently used mappings we keep alive to avoid closing and
/// opening files all the time
const FILE_HISTORY_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The two families of data files we manage
pub enum FileKind {
    /// `blkNNNNN.dat`, raw serialized blocks
    Block,

    /// `revNNNNN.dat`, undo payloads with a trailing checksum
    Undo,
}

impl FileKind {
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            FileKind::Block => "blk",
            FileKind::Undo => "rev",
        }
    }
}

enum FileMap {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// One live mapping of a data file. Handed out ref-counted; dropping the
/// last reference unmaps the file.
pub struct MappedFile {
    map: FileMap,
}

impl MappedFile {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this mapping was opened read-write. Only the current last
    /// blk file and rev files are; everything else is immutable history.
    pub fn writable(&self) -> bool {
        matches!(self.map, FileMap::ReadWrite(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            FileMap::ReadOnly(map) => map,
            FileMap::ReadWrite(map) => map,
        }
    }

    /// Writes `bytes` into the mapping at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold the writer lock and only ever write beyond the
    /// committed size of the file, so no reader can be looking at the bytes
    /// being written. `offset + bytes.len()` must be within the mapping.
    pub(crate) unsafe fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(self.writable());
        debug_assert!(offset + bytes.len() <= self.len());

        if let FileMap::ReadWrite(map) = &self.map {
            let dst = (map.as_ptr() as *mut u8).add(offset);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    /// Syncs the mapping to disk. A no-op for read-only views.
    pub(crate) fn flush(&self) -> Result<(), BlockStoreError> {
        if let FileMap::ReadWrite(map) = &self.map {
            map.flush()?;
        }

        Ok(())
    }
}

#[derive(Clone)]
/// A ref-counted view into a mapped data file. Cheap to clone, keeps the
/// underlying mapping alive for as long as any clone exists.
pub struct SharedBytes {
    map: Arc<MappedFile>,
    start: usize,
    end: usize,
}

impl SharedBytes {
    pub(crate) fn new(map: Arc<MappedFile>, start: usize, end: usize) -> Self {
        debug_assert!(start <= end && end <= map.len());
        SharedBytes { map, start, end }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map.as_slice()[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl Deref for SharedBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

#[derive(Default)]
struct MapperInner {
    block_slots: Vec<Option<Weak<MappedFile>>>,
    undo_slots: Vec<Option<Weak<MappedFile>>>,
    history: VecDeque<Arc<MappedFile>>,
}

impl MapperInner {
    fn slot_mut(&mut self, kind: FileKind, index: u32) -> &mut Option<Weak<MappedFile>> {
        let slots = match kind {
            FileKind::Block => &mut self.block_slots,
            FileKind::Undo => &mut self.undo_slots,
        };
        let index = index as usize;
        if slots.len() <= index {
            slots.resize(index + 10, None);
        }

        &mut slots[index]
    }
}

/// Opens, maps, grows and caches the data files. See the module docs for the
/// lifetime story.
pub struct FileMapper {
    /// The primary `<datadir>/blocks` directory, where files are created
    blocks_dir: PathBuf,

    /// Extra directories searched, in order, when a file is missing from
    /// the primary one
    extra_dirs: Vec<PathBuf>,

    /// The highest blk file in use. Decides which blk file is mapped
    /// read-write; advanced by the writer.
    last_block_file: AtomicU32,

    inner: Mutex<MapperInner>,
}

impl FileMapper {
    pub fn new(blocks_dir: PathBuf, extra_dirs: Vec<PathBuf>) -> Self {
        FileMapper {
            blocks_dir,
            extra_dirs,
            last_block_file: AtomicU32::new(0),
            inner: Mutex::new(MapperInner::default()),
        }
    }

    pub fn last_block_file(&self) -> u32 {
        self.last_block_file.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_block_file(&self, index: u32) {
        self.last_block_file.store(index, Ordering::SeqCst);
    }

    fn file_name(kind: FileKind, index: u32) -> String {
        format!("{}{:05}.dat", kind.prefix(), index)
    }

    /// The path a file would have in the primary directory, whether or not
    /// it exists yet
    pub(crate) fn primary_path(&self, kind: FileKind, index: u32) -> PathBuf {
        self.blocks_dir.join(Self::file_name(kind, index))
    }

    /// Finds an existing file, searching the primary directory first and the
    /// configured extra directories after it
    fn resolve_path(&self, kind: FileKind, index: u32) -> Option<PathBuf> {
        let primary = self.primary_path(kind, index);
        if primary.is_file() {
            return Some(primary);
        }
        for dir in &self.extra_dirs {
            let alternate = dir.join(Self::file_name(kind, index));
            if alternate.is_file() {
                return Some(alternate);
            }
        }

        None
    }

    /// Returns a ref-counted view of the given data file, mapping it if it
    /// isn't mapped already.
    ///
    /// The file is mapped read-write when it's a rev file or the current
    /// last blk file, read-only otherwise. A read-write request downgrades
    /// to read-only when the medium doesn't allow writing; writers must
    /// check [MappedFile::writable]. Returns `Ok(None)` when the file
    /// doesn't exist anywhere (the block got pruned).
    pub fn view(
        &self,
        kind: FileKind,
        index: u32,
    ) -> Result<Option<Arc<MappedFile>>, BlockStoreError> {
        let mut inner = self.inner.lock().map_err(|_| BlockStoreError::Poisoned)?;

        if let Some(live) = inner.slot_mut(kind, index).as_ref().and_then(Weak::upgrade) {
            return Ok(Some(live));
        }

        let Some(path) = self.resolve_path(kind, index) else {
            return Ok(None);
        };

        let want_write =
            kind == FileKind::Undo || index == self.last_block_file.load(Ordering::SeqCst);
        let Some(mapped) = Self::map_file(&path, want_write)? else {
            return Ok(None);
        };
        let mapped = Arc::new(mapped);

        *inner.slot_mut(kind, index) = Some(Arc::downgrade(&mapped));
        inner.history.push_back(Arc::clone(&mapped));
        if inner.history.len() > FILE_HISTORY_SIZE {
            inner.history.pop_front();
        }

        Ok(Some(mapped))
    }

    fn map_file(path: &Path, want_write: bool) -> Result<Option<MappedFile>, BlockStoreError> {
        let opened = if want_write {
            // the user may have moved the files to a read-only medium, so a
            // failed read-write open falls back to read-only below
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .ok()
                .map(|file| (file, true))
        } else {
            None
        };

        let (file, writable) = match opened {
            Some(opened) => opened,
            None => (OpenOptions::new().read(true).open(path)?, false),
        };

        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(None);
        }

        // SAFETY: we never shrink or truncate a mapped file; growth goes
        // through `grow_to`, which resizes on disk and leaves the old
        // mapping untouched until its last reference drops.
        let map = unsafe {
            match writable {
                true => FileMap::ReadWrite(MmapOptions::new().len(len).map_mut(&file)?),
                false => FileMap::ReadOnly(MmapOptions::new().len(len).map(&file)?),
            }
        };

        Ok(Some(MappedFile { map }))
    }

    /// Creates a new data file of `size` bytes in the primary directory.
    /// On platforms that can't re-map a growing file the file is created at
    /// its maximum permitted size right away.
    pub(crate) fn create_file(
        &self,
        kind: FileKind,
        index: u32,
        size: u64,
    ) -> Result<(), BlockStoreError> {
        let path = self.primary_path(kind, index);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(windows)]
        let size = {
            let _ = size;
            MAX_BLOCKFILE_SIZE as u64
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(size)?;

        self.invalidate(kind, index)?;
        Ok(())
    }

    /// Resizes the file on disk and invalidates its slot so the next `view`
    /// maps the grown file. Outstanding views stay valid on their old, now
    /// stale mapping.
    pub fn grow_to(
        &self,
        kind: FileKind,
        index: u32,
        new_size: u64,
    ) -> Result<(), BlockStoreError> {
        // files are pre-allocated at full size where re-mapping isn't possible
        #[cfg(windows)]
        {
            let _ = (kind, index, new_size);
            return Ok(());
        }

        #[cfg(not(windows))]
        {
            let path = self.primary_path(kind, index);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            file.set_len(new_size)?;

            self.invalidate(kind, index)
        }
    }

    /// Drops the cached mapping for a file without touching the file itself
    pub fn invalidate(&self, kind: FileKind, index: u32) -> Result<(), BlockStoreError> {
        let mut inner = self.inner.lock().map_err(|_| BlockStoreError::Poisoned)?;
        *inner.slot_mut(kind, index) = None;

        Ok(())
    }

    /// Syncs the live mapping of a file to disk, if there is one. Called
    /// before a durable metadata batch so the referenced payloads hit the
    /// platter first.
    pub fn flush(&self, kind: FileKind, index: u32) -> Result<(), BlockStoreError> {
        let live = {
            let mut inner = self.inner.lock().map_err(|_| BlockStoreError::Poisoned)?;
            inner.slot_mut(kind, index).as_ref().and_then(Weak::upgrade)
        };
        if let Some(map) = live {
            map.flush()?;
        }

        Ok(())
    }

    /// Pre-sizes the slot vectors for `count` files of each kind
    pub fn reserve_slots(&self, count: u32) {
        if count == 0 {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            // touching the last slot grows the vector past it
            inner.slot_mut(FileKind::Block, count - 1);
            inner.slot_mut(FileKind::Undo, count - 1);
        }
    }
}
