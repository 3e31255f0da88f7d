//! The in-memory header catalogue: one [HeaderEntry] per known header,
//! owned by the [HeaderIndex] arena for the life of the process. Entries
//! reference their parent directly, plus a skip pointer to a well-chosen
//! ancestor that makes `ancestor(height)` run in O(log height).

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use bitcoin::Work;

use crate::blocks::error::BlockStoreError;
use crate::blocks::meta_store::DiskHeaderRecord;
use crate::blocks::raw_file::BlockPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Validation and storage flags of one header record
pub struct BlockStatus(u32);

impl BlockStatus {
    /// The raw header parsed and carries valid proof of work
    pub const VALID_HEADER: BlockStatus = BlockStatus(1);

    /// All parents are known and the header tree checks out
    pub const VALID_TREE: BlockStatus = BlockStatus(2);

    /// Contextual checks against the chain passed
    pub const VALID_CHAIN: BlockStatus = BlockStatus(4);

    /// Scripts and signatures were verified
    pub const VALID_SCRIPTS: BlockStatus = BlockStatus(8);

    /// The full block body is stored in a blk file
    pub const HAVE_DATA: BlockStatus = BlockStatus(16);

    /// Undo data is stored in a rev file
    pub const HAVE_UNDO: BlockStatus = BlockStatus(32);

    /// The block itself failed validation
    pub const FAILED_VALID: BlockStatus = BlockStatus(64);

    /// Some ancestor failed validation
    pub const FAILED_CHILD: BlockStatus = BlockStatus(128);

    pub const FAILED_MASK: BlockStatus = BlockStatus(64 | 128);

    pub fn from_bits(bits: u32) -> Self {
        BlockStatus(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether any of `other`'s bits are set
    pub fn has(self, other: BlockStatus) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, other: BlockStatus) -> Self {
        BlockStatus(self.0 | other.0)
    }

    pub fn without(self, other: BlockStatus) -> Self {
        BlockStatus(self.0 & !other.0)
    }

    /// A record is valid as long as neither failure bit is set
    pub fn is_valid(self) -> bool {
        !self.has(Self::FAILED_MASK)
    }
}

impl BitOr for BlockStatus {
    type Output = BlockStatus;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

impl BitOrAssign for BlockStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.with(rhs);
    }
}

// Turn the lowest set bit off, e.g. 0b1011 -> 0b1010
fn invert_lowest_one(n: u32) -> u32 {
    n & n.wrapping_sub(1)
}

/// The height the skip pointer of a header at `height` points to. Chosen so
/// that repeatedly following skip pointers reaches any ancestor height in
/// O(log n) hops.
pub(crate) fn get_skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }

    // Determine which height to jump back to. Any number strictly lower
    // than height is acceptable, but the following expression keeps the
    // total number of hops logarithmic.
    match height & 1 {
        1 => invert_lowest_one(invert_lowest_one(height - 1)) + 1,
        _ => invert_lowest_one(height),
    }
}

/// Whether the skip pointer at `walk_height` is a useful jump towards
/// `height`: it must not overshoot, and it must not be worth deferring to
/// the strictly better skip available one parent below
fn skip_reaches(walk_height: u32, height: u32) -> bool {
    let skip_height = get_skip_height(walk_height);
    let skip_prev_height = get_skip_height(walk_height - 1) as i64;

    skip_height == height
        || (skip_height > height
            && !(skip_prev_height < skip_height as i64 - 2 && skip_prev_height >= height as i64))
}

/// One known header. Identity, parent link and cumulative work are fixed at
/// insertion; status and the body/undo positions change as validation and
/// storage catch up, serialised by the index lock by convention.
pub struct HeaderEntry {
    hash: BlockHash,
    header: BlockHeader,
    height: u32,
    chain_work: Work,
    prev: Option<Arc<HeaderEntry>>,
    skip: OnceLock<Option<Arc<HeaderEntry>>>,
    status: AtomicU32,
    file: AtomicU32,
    data_pos: AtomicU32,
    undo_pos: AtomicU32,
    tx_count: AtomicU32,
}

impl HeaderEntry {
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn header(&self) -> BlockHeader {
        self.header
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chain_work(&self) -> Work {
        self.chain_work
    }

    pub fn prev(&self) -> Option<Arc<HeaderEntry>> {
        self.prev.clone()
    }

    pub fn status(&self) -> BlockStatus {
        BlockStatus::from_bits(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: BlockStatus) {
        self.status.store(status.bits(), Ordering::Relaxed);
    }

    pub fn add_status(&self, status: BlockStatus) {
        self.status.fetch_or(status.bits(), Ordering::Relaxed);
    }

    pub fn clear_status(&self, status: BlockStatus) {
        self.status.fetch_and(!status.bits(), Ordering::Relaxed);
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count.load(Ordering::Relaxed)
    }

    /// The position of the stored block body, if we have one
    pub fn data_position(&self) -> Option<BlockPosition> {
        let pos = self.data_pos.load(Ordering::Relaxed);
        if pos == 0 {
            return None;
        }

        Some(BlockPosition {
            file: self.file.load(Ordering::Relaxed),
            pos,
        })
    }

    /// The position of the stored undo payload, if we have one
    pub fn undo_position(&self) -> Option<BlockPosition> {
        let pos = self.undo_pos.load(Ordering::Relaxed);
        if pos == 0 {
            return None;
        }

        Some(BlockPosition {
            file: self.file.load(Ordering::Relaxed),
            pos,
        })
    }

    /// Marks the block body as stored at `position` with `tx_count`
    /// transactions
    pub fn record_data(&self, position: BlockPosition, tx_count: u32) {
        self.file.store(position.file, Ordering::Relaxed);
        self.data_pos.store(position.pos, Ordering::Relaxed);
        self.tx_count.store(tx_count, Ordering::Relaxed);
        self.add_status(BlockStatus::HAVE_DATA);
    }

    /// Marks the undo payload as stored at `pos` in the rev file matching
    /// the block's data file
    pub fn record_undo(&self, pos: u32) {
        self.undo_pos.store(pos, Ordering::Relaxed);
        self.add_status(BlockStatus::HAVE_UNDO);
    }

    pub fn skip(&self) -> Option<Arc<HeaderEntry>> {
        self.skip.get().cloned().flatten()
    }

    /// Computes the skip pointer; a no-op when it's already built
    pub fn build_skip(self: &Arc<Self>) {
        if self.skip.get().is_some() {
            return;
        }

        let skip = match &self.prev {
            Some(prev) => prev.ancestor(get_skip_height(self.height)),
            None => None,
        };
        let _ = self.skip.set(skip);
    }

    /// The ancestor of this entry at `height`, `None` when `height` is above
    /// this entry. Jumps through skip pointers where that helps, so the walk
    /// is O(log height) once the skips are built, and degrades to a plain
    /// parent walk when they aren't.
    pub fn ancestor(self: &Arc<Self>, height: u32) -> Option<Arc<HeaderEntry>> {
        if height > self.height {
            return None;
        }

        let mut walk = Arc::clone(self);
        let mut walk_height = self.height;
        while walk_height > height {
            match walk.skip().filter(|_| skip_reaches(walk_height, height)) {
                Some(skip) => {
                    walk_height = skip.height;
                    walk = skip;
                }
                None => {
                    let prev = walk.prev.clone()?;
                    walk_height -= 1;
                    walk = prev;
                }
            }
        }

        Some(walk)
    }

    /// Whether `other` lies on this entry's parent chain (or is this entry)
    pub fn has_ancestor(self: &Arc<Self>, other: &Arc<HeaderEntry>) -> bool {
        self.ancestor(other.height)
            .map_or(false, |found| Arc::ptr_eq(&found, other))
    }

    /// Snapshot as the serializable catalogue row
    pub fn to_disk_record(&self) -> DiskHeaderRecord {
        DiskHeaderRecord {
            version: self.header.version.to_consensus(),
            height: self.height,
            status: self.status(),
            tx_count: self.tx_count(),
            file: self.file.load(Ordering::Relaxed),
            data_pos: self.data_pos.load(Ordering::Relaxed),
            undo_pos: self.undo_pos.load(Ordering::Relaxed),
            prev: self.header.prev_blockhash,
            merkle_root: self.header.merkle_root,
            time: self.header.time,
            bits: self.header.bits,
            nonce: self.header.nonce,
        }
    }
}

impl fmt::Debug for HeaderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderEntry")
            .field("hash", &self.hash)
            .field("height", &self.height)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Default)]
struct IndexInner {
    map: HashMap<BlockHash, Arc<HeaderEntry>>,
    dirty: HashSet<BlockHash>,
}

#[derive(Default)]
/// Owns every [HeaderEntry]. Entries are inserted parents-first (records are
/// replayed sorted by height at load) and never removed before shutdown.
pub struct HeaderIndex {
    inner: Mutex<IndexInner>,
}

impl HeaderIndex {
    pub fn new() -> Self {
        HeaderIndex::default()
    }

    /// Materialises a catalogue row into the arena, wiring it to its parent.
    /// Returns the existing entry when the hash is already known. The parent
    /// must already be present, except for genesis.
    pub fn insert(
        &self,
        hash: BlockHash,
        record: DiskHeaderRecord,
    ) -> Result<Arc<HeaderEntry>, BlockStoreError> {
        let mut inner = self.inner.lock().map_err(|_| BlockStoreError::Poisoned)?;

        if let Some(existing) = inner.map.get(&hash) {
            return Ok(Arc::clone(existing));
        }

        let prev = match record.prev == BlockHash::all_zeros() {
            true => None,
            false => Some(
                inner
                    .map
                    .get(&record.prev)
                    .cloned()
                    .ok_or(BlockStoreError::UnknownParent(record.prev))?,
            ),
        };

        let header = record.header();
        let own_work = match record.status.has(BlockStatus::VALID_HEADER) {
            true => header.work(),
            false => Work::from_be_bytes([0; 32]),
        };
        let parent_work = prev
            .as_ref()
            .map(|prev| prev.chain_work)
            .unwrap_or(Work::from_be_bytes([0; 32]));

        let entry = Arc::new(HeaderEntry {
            hash,
            header,
            height: record.height,
            chain_work: parent_work + own_work,
            prev,
            skip: OnceLock::new(),
            status: AtomicU32::new(record.status.bits()),
            file: AtomicU32::new(record.file),
            data_pos: AtomicU32::new(record.data_pos),
            undo_pos: AtomicU32::new(record.undo_pos),
            tx_count: AtomicU32::new(record.tx_count),
        });
        entry.build_skip();

        inner.map.insert(hash, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<Arc<HeaderEntry>> {
        self.inner.lock().ok()?.map.get(hash).cloned()
    }

    pub fn exists(&self, hash: &BlockHash) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.map.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flags an entry for re-persisting on the next batch sync
    pub fn mark_dirty(&self, hash: BlockHash) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.dirty.insert(hash);
        }
    }

    /// Drains the entries touched since the last sync
    pub fn take_dirty(&self) -> Vec<Arc<HeaderEntry>> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };

        let dirty = core::mem::take(&mut inner.dirty);
        dirty
            .into_iter()
            .filter_map(|hash| inner.map.get(&hash).cloned())
            .collect()
    }

    /// Clears the failure flags from `entry`, from every descendant of it,
    /// and from every ancestor of it, so a previously rejected branch can be
    /// validated again. Every touched record is marked dirty.
    pub fn reconsider(&self, entry: &Arc<HeaderEntry>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        let height = entry.height();
        let mut touched = Vec::new();

        for candidate in inner.map.values() {
            let failed = !candidate.status().is_valid();
            if failed && candidate.ancestor(height).map_or(false, |a| Arc::ptr_eq(&a, entry)) {
                candidate.clear_status(BlockStatus::FAILED_MASK);
                touched.push(candidate.hash());
            }
        }

        let mut walk = Some(Arc::clone(entry));
        while let Some(current) = walk {
            if current.status().has(BlockStatus::FAILED_MASK) {
                current.clear_status(BlockStatus::FAILED_MASK);
                touched.push(current.hash());
            }
            walk = current.prev();
        }

        inner.dirty.extend(touched);
    }

    /// The set of file indices referenced by any record that has its block
    /// body stored
    pub fn files_with_data(&self) -> BTreeSet<u32> {
        let Ok(inner) = self.inner.lock() else {
            return BTreeSet::new();
        };

        inner
            .map
            .values()
            .filter(|entry| entry.status().has(BlockStatus::HAVE_DATA))
            .filter_map(|entry| entry.data_position().map(|pos| pos.file))
            .collect()
    }

    /// Snapshot of every entry, sorted ascending by height
    pub fn all_by_height(&self) -> Vec<Arc<HeaderEntry>> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };

        let mut entries: Vec<_> = inner.map.values().cloned().collect();
        entries.sort_by_key(|entry| entry.height());
        entries
    }

    /// Builds the skip pointer of every entry, parents first. Called once
    /// after a full load; entries inserted afterwards build theirs on
    /// insertion.
    pub fn build_skips(&self) {
        for entry in self.all_by_height() {
            entry.build_skip();
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    use super::get_skip_height;
    use super::test_utils::make_record;
    use super::BlockStatus;
    use super::HeaderEntry;
    use super::HeaderIndex;
    use crate::blocks::error::BlockStoreError;

    /// Builds a straight chain of `len` entries and returns them in height
    /// order
    fn build_chain(index: &HeaderIndex, len: u32) -> Vec<Arc<HeaderEntry>> {
        let mut entries = Vec::new();
        let mut prev = BlockHash::all_zeros();
        for height in 0..len {
            let record = make_record(prev, height, height);
            let hash = record.block_hash();
            entries.push(index.insert(hash, record).unwrap());
            prev = hash;
        }
        entries
    }

    #[test]
    fn skip_heights_stay_below_and_converge() {
        assert_eq!(get_skip_height(0), 0);
        assert_eq!(get_skip_height(1), 0);
        for height in 2..10_000u32 {
            let skip = get_skip_height(height);
            assert!(skip < height);
        }
        // spot-check the shape: even heights clear the lowest set bit
        assert_eq!(get_skip_height(12), 8);
        assert_eq!(get_skip_height(16), 0);
        assert_eq!(get_skip_height(1024), 0);
    }

    #[test]
    fn skip_walk_is_logarithmic() {
        // replay the ancestor walk on heights alone: follow the skip when
        // the heuristic allows it, step to the parent otherwise. A walk
        // down a 100k chain must converge in a few dozen hops, not O(n).
        for target in [0u32, 1, 123, 5_000, 50_001, 99_998] {
            let mut walk_height = 100_000u32;
            let mut hops = 0u32;
            while walk_height > target {
                walk_height = match super::skip_reaches(walk_height, target) {
                    true => get_skip_height(walk_height),
                    false => walk_height - 1,
                };
                hops += 1;
                assert!(
                    hops <= 128,
                    "walk from 100000 to {target} took more than 128 hops"
                );
            }
        }
    }

    #[test]
    fn chain_work_and_heights_accumulate() {
        let index = HeaderIndex::new();
        let entries = build_chain(&index, 50);

        for pair in entries.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            assert_eq!(child.height(), parent.height() + 1);
            assert_eq!(
                child.chain_work(),
                parent.chain_work() + child.header().work()
            );
        }
    }

    #[test]
    fn ancestor_walks_to_every_height() {
        let index = HeaderIndex::new();
        let entries = build_chain(&index, 300);
        index.build_skips();

        let tip = entries.last().unwrap();
        for height in 0..entries.len() as u32 {
            let ancestor = tip.ancestor(height).unwrap();
            assert_eq!(ancestor.height(), height);
            assert!(Arc::ptr_eq(&ancestor, &entries[height as usize]));
        }
        assert!(Arc::ptr_eq(&tip.ancestor(0).unwrap(), &entries[0]));
        assert!(tip.ancestor(300).is_none());
    }

    #[test]
    fn insert_requires_known_parent() {
        let index = HeaderIndex::new();
        build_chain(&index, 2);

        let orphan = make_record(BlockHash::from_byte_array([0xaa; 32]), 5, 99);
        match index.insert(orphan.block_hash(), orphan) {
            Err(BlockStoreError::UnknownParent(_)) => (),
            other => panic!("expected UnknownParent, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_insert_returns_existing() {
        let index = HeaderIndex::new();
        let entries = build_chain(&index, 3);

        let record = entries[2].to_disk_record();
        let again = index.insert(entries[2].hash(), record).unwrap();
        assert!(Arc::ptr_eq(&again, &entries[2]));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn files_with_data_collects_referenced_files() {
        let index = HeaderIndex::new();
        let entries = build_chain(&index, 5);

        entries[1].record_data(crate::BlockPosition { file: 0, pos: 8 }, 1);
        entries[3].record_data(crate::BlockPosition { file: 2, pos: 8 }, 1);

        let files: Vec<u32> = index.files_with_data().into_iter().collect();
        assert_eq!(files, vec![0, 2]);
    }

    #[test]
    fn reconsider_clears_branch_and_ancestors() {
        let index = HeaderIndex::new();
        let entries = build_chain(&index, 10);

        // fail block 4, mark descendants as failed children
        entries[4].add_status(BlockStatus::FAILED_VALID);
        for entry in &entries[5..] {
            entry.add_status(BlockStatus::FAILED_CHILD);
        }
        // an unrelated failure below the reconsidered height must survive
        let fork = make_record(entries[2].hash(), 3, 1000);
        let fork_entry = index.insert(fork.block_hash(), fork).unwrap();
        fork_entry.add_status(BlockStatus::FAILED_VALID);

        index.reconsider(&entries[6]);

        // everything from 6 up, and every ancestor of 6, is clean again
        for entry in &entries {
            assert!(
                entry.status().is_valid(),
                "height {} still failed",
                entry.height()
            );
        }
        assert!(
            !fork_entry.status().is_valid(),
            "unrelated branch must stay failed"
        );

        // touched records are queued for persistence
        let dirty = index.take_dirty();
        assert!(!dirty.is_empty());
        assert!(index.take_dirty().is_empty());
    }
}
