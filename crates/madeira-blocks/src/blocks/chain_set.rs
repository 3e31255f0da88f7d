//! The forest of competing header chains.
//!
//! [ChainSet] tracks one tip per leaf of the non-failed header tree and
//! elects the main chain: the tip with the most cumulative work, first seen
//! winning ties. The main chain is never materialised; membership checks
//! ride the skip-pointer ancestor walk from the best tip.
//!
//! The set itself carries no lock. Consensus and the reindex epilogue are
//! the only callers and agree to call it single-threaded; the facade wraps
//! it in a mutex to make that contract explicit.

use std::sync::Arc;

use crate::blocks::header_index::HeaderEntry;

#[derive(Clone, Default)]
/// A read-only view of the main chain, anchored at the best tip at the time
/// it was taken
pub struct HeaderChain {
    tip: Option<Arc<HeaderEntry>>,
}

impl HeaderChain {
    pub(crate) fn new(tip: Option<Arc<HeaderEntry>>) -> Self {
        HeaderChain { tip }
    }

    pub fn tip(&self) -> Option<Arc<HeaderEntry>> {
        self.tip.clone()
    }

    pub fn height(&self) -> Option<u32> {
        self.tip.as_ref().map(|tip| tip.height())
    }

    /// Whether `entry` lies on this chain
    pub fn contains(&self, entry: &Arc<HeaderEntry>) -> bool {
        self.tip
            .as_ref()
            .map_or(false, |tip| tip.has_ancestor(entry))
    }

    /// The entry of this chain at `height`, `None` above the tip
    pub fn at_height(&self, height: u32) -> Option<Arc<HeaderEntry>> {
        self.tip.as_ref().and_then(|tip| tip.ancestor(height))
    }

    pub fn genesis(&self) -> Option<Arc<HeaderEntry>> {
        self.at_height(0)
    }
}

#[derive(Default)]
/// All known chain tips plus the distinguished best one
pub struct ChainSet {
    tips: Vec<Arc<HeaderEntry>>,
    best: Option<Arc<HeaderEntry>>,
}

impl ChainSet {
    pub fn new() -> Self {
        ChainSet::default()
    }

    /// The tip with the most cumulative work
    pub fn best_header(&self) -> Option<Arc<HeaderEntry>> {
        self.best.clone()
    }

    /// Every tip, the best one included
    pub fn tips(&self) -> Vec<Arc<HeaderEntry>> {
        self.tips.clone()
    }

    /// A snapshot view of the main chain
    pub fn header_chain(&self) -> HeaderChain {
        HeaderChain::new(self.best.clone())
    }

    fn main_chain_contains(&self, entry: &Arc<HeaderEntry>) -> bool {
        self.best
            .as_ref()
            .map_or(false, |best| best.has_ancestor(entry))
    }

    /// Folds one header into the tip set and re-elects the main chain.
    /// Returns whether the main chain changed.
    ///
    /// A failed record dissolves every chain containing it; the chain's
    /// surviving stem (the nearest non-failed ancestor) takes its place
    /// unless an existing chain already covers it, in which case the
    /// better-worked of the two represents it.
    pub fn append_header(&mut self, entry: &Arc<HeaderEntry>) -> bool {
        let valid = entry.status().is_valid();
        // the genesis record is never marked failed
        debug_assert!(valid || entry.prev().is_some());

        if valid && self.main_chain_contains(entry) {
            // nothing to do
            return false;
        }

        let mut effective = match valid {
            true => Arc::clone(entry),
            false => entry.prev().expect("genesis is never marked failed"),
        };
        while !effective.status().is_valid() {
            effective = effective.prev().expect("genesis is never marked failed");
        }

        // extension: the header builds on top of an existing tip, which
        // stops being a leaf and hands its slot to the replacement
        let extended = self
            .tips
            .iter()
            .position(|tip| !Arc::ptr_eq(tip, entry) && entry.has_ancestor(tip));

        let mut found = false;
        if let Some(i) = extended {
            let was_main = self
                .best
                .as_ref()
                .map_or(false, |best| Arc::ptr_eq(best, &self.tips[i]));
            self.tips.remove(i);
            self.tips.push(Arc::clone(&effective));
            if was_main {
                self.best = Some(effective);
                return true;
            }
            found = true;
        }

        let mut dissolved_main = false;
        if !found {
            let mut modified = false;
            let mut already_contains = false;

            let mut i = 0;
            while i < self.tips.len() {
                let tip = Arc::clone(&self.tips[i]);
                if tip.has_ancestor(entry) {
                    // this chain already knows the header
                    if valid {
                        return false;
                    }
                    // it is invalid: the whole chain above the stem goes
                    modified = true;
                    let was_main = self.main_chain_contains(&tip);
                    self.tips.remove(i);
                    if was_main {
                        self.best = Some(Arc::clone(&effective));
                    }
                    dissolved_main |= was_main;
                } else {
                    if tip.has_ancestor(&effective) {
                        // the stem is already covered by another chain; let
                        // whichever carries more work represent it
                        already_contains = true;
                        if effective.chain_work() < tip.chain_work() {
                            effective = Arc::clone(&tip);
                        }
                    }
                    i += 1;
                }
            }

            if modified && !already_contains {
                self.tips.push(Arc::clone(&effective));
            }
            if valid {
                self.tips.push(Arc::clone(entry));
                if self.best.is_none() {
                    // inserting genesis
                    self.best = Some(Arc::clone(entry));
                    return true;
                }
            }
        }

        let best = self
            .best
            .as_ref()
            .expect("a best tip exists once any valid header was appended");
        if best.chain_work() < effective.chain_work() {
            self.best = Some(effective);
            return true;
        }

        dissolved_main
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    use super::ChainSet;
    use crate::blocks::header_index::test_utils::make_record;
    use crate::blocks::header_index::BlockStatus;
    use crate::blocks::header_index::HeaderEntry;
    use crate::blocks::header_index::HeaderIndex;

    struct Harness {
        index: HeaderIndex,
        chain: ChainSet,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                index: HeaderIndex::new(),
                chain: ChainSet::new(),
            }
        }

        /// Inserts a header building on `prev` and appends it to the chain
        /// set, returning the entry and whether the main chain moved
        fn add(&mut self, prev: BlockHash, height: u32, nonce: u32) -> (Arc<HeaderEntry>, bool) {
            let record = make_record(prev, height, nonce);
            let entry = self.index.insert(record.block_hash(), record).unwrap();
            let moved = self.chain.append_header(&entry);
            (entry, moved)
        }

        fn tip_hashes(&self) -> BTreeSet<BlockHash> {
            self.chain.tips().iter().map(|tip| tip.hash()).collect()
        }

        fn best_hash(&self) -> BlockHash {
            self.chain.best_header().unwrap().hash()
        }
    }

    #[test]
    fn genesis_bootstrap() {
        let mut h = Harness::new();
        let (genesis, moved) = h.add(BlockHash::all_zeros(), 0, 0);

        assert!(moved);
        assert_eq!(genesis.chain_work(), genesis.header().work());
        assert_eq!(h.best_hash(), genesis.hash());
        assert_eq!(h.tip_hashes(), BTreeSet::from([genesis.hash()]));
        assert_eq!(
            h.chain.header_chain().tip().unwrap().hash(),
            genesis.hash()
        );
    }

    #[test]
    fn linear_extension() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);
        let (a, moved) = h.add(genesis.hash(), 1, 1);

        assert!(moved);
        assert_eq!(h.best_hash(), a.hash());
        assert_eq!(h.tip_hashes(), BTreeSet::from([a.hash()]));
    }

    #[test]
    fn equal_work_keeps_incumbent_and_reorg_switches() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);
        let (a, _) = h.add(genesis.hash(), 1, 1);

        // a same-height fork with equal work: first seen wins
        let (b, moved) = h.add(genesis.hash(), 1, 2);
        assert!(!moved);
        assert_eq!(h.best_hash(), a.hash());
        assert_eq!(h.tip_hashes(), BTreeSet::from([a.hash(), b.hash()]));

        // extending the fork tips the balance
        let (c, moved) = h.add(b.hash(), 2, 3);
        assert!(moved);
        assert_eq!(h.best_hash(), c.hash());
        assert_eq!(h.tip_hashes(), BTreeSet::from([a.hash(), c.hash()]));
    }

    #[test]
    fn invalid_branch_dissolves_and_main_falls_back() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);
        let (a, _) = h.add(genesis.hash(), 1, 1);
        let (b, _) = h.add(genesis.hash(), 1, 2);
        let (c, _) = h.add(b.hash(), 2, 3);
        assert_eq!(h.best_hash(), c.hash());

        // validation rejects b; it marks the descendants too
        b.add_status(BlockStatus::FAILED_VALID);
        c.add_status(BlockStatus::FAILED_CHILD);

        let moved = h.chain.append_header(&c);
        assert!(moved);
        assert_eq!(h.best_hash(), a.hash());
        assert_eq!(h.tip_hashes(), BTreeSet::from([a.hash()]));
    }

    #[test]
    fn dissolving_a_side_branch_keeps_its_stem() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);
        let (a, _) = h.add(genesis.hash(), 1, 1);
        let (a2, _) = h.add(a.hash(), 2, 2);
        let (a3, _) = h.add(a2.hash(), 3, 3);

        // a fork off a2 that later turns out invalid
        let (f, _) = h.add(a2.hash(), 3, 4);
        let (f2, _) = h.add(f.hash(), 4, 5);
        assert_eq!(h.best_hash(), f2.hash());

        f.add_status(BlockStatus::FAILED_VALID);
        f2.add_status(BlockStatus::FAILED_CHILD);
        let moved = h.chain.append_header(&f2);

        // a2, the stem, is already covered by the a3 chain
        assert!(moved);
        assert_eq!(h.best_hash(), a3.hash());
        assert_eq!(h.tip_hashes(), BTreeSet::from([a3.hash()]));
    }

    #[test]
    fn append_is_idempotent() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);
        let (a, _) = h.add(genesis.hash(), 1, 1);
        let (b, _) = h.add(genesis.hash(), 1, 2);
        let (c, _) = h.add(b.hash(), 2, 3);

        let tips_before = h.tip_hashes();
        let best_before = h.best_hash();

        // the main tip, a side tip, and an interior block are all no-ops
        for entry in [&c, &a, &b] {
            assert!(!h.chain.append_header(entry));
            assert_eq!(h.tip_hashes(), tips_before);
            assert_eq!(h.best_hash(), best_before);
        }
    }

    #[test]
    fn best_tip_has_maximal_work_and_is_a_tip() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);

        // grow a handful of competing branches of different lengths
        let mut nonce = 1;
        for branch_len in [3u32, 5, 2, 7, 4] {
            let mut prev = genesis.hash();
            for height in 1..=branch_len {
                let (entry, _) = h.add(prev, height, nonce);
                prev = entry.hash();
                nonce += 1;
            }
        }

        let best = h.chain.best_header().unwrap();
        assert!(h
            .chain
            .tips()
            .iter()
            .any(|tip| Arc::ptr_eq(tip, &best)));
        let max_work = h
            .chain
            .tips()
            .iter()
            .map(|tip| tip.chain_work())
            .max()
            .unwrap();
        assert_eq!(best.chain_work(), max_work);
        assert_eq!(best.height(), 7, "the longest branch carries most work");
    }

    #[test]
    fn header_chain_view_walks_the_main_chain() {
        let mut h = Harness::new();
        let (genesis, _) = h.add(BlockHash::all_zeros(), 0, 0);
        let mut prev = genesis.hash();
        let mut entries = vec![genesis.clone()];
        for height in 1..10 {
            let (entry, _) = h.add(prev, height, height);
            prev = entry.hash();
            entries.push(entry);
        }
        // a stale fork that must not show up in the view
        let (fork, _) = h.add(entries[4].hash(), 5, 1000);

        let view = h.chain.header_chain();
        assert_eq!(view.height(), Some(9));
        assert_eq!(view.genesis().unwrap().hash(), genesis.hash());
        for (height, entry) in entries.iter().enumerate() {
            assert!(view.contains(entry));
            assert_eq!(
                view.at_height(height as u32).unwrap().hash(),
                entry.hash()
            );
        }
        assert!(!view.contains(&fork));
        assert!(view.at_height(10).is_none());
    }
}
