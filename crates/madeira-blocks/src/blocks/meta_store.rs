//! The typed schema of the header catalogue.
//!
//! [MetaStore] is the contract between the block store and whatever embedded
//! key/value database sits underneath. [KvMetaStore](crate::KvMetaStore) is
//! the persistent implementation; [MemoryMetaStore](crate::MemoryMetaStore)
//! is a volatile one used by tests.

use bitcoin::block::Header as BlockHeader;
use bitcoin::block::Version;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::TxMerkleNode;
use bitcoin::Txid;

use crate::blocks::error::DatabaseError;
use crate::blocks::header_index::BlockStatus;
use crate::blocks::raw_file::FileInfo;
use crate::blocks::ReindexState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One header catalogue row, exactly as it is serialized. The raw header
/// fields are only meaningful when `status` carries
/// [BlockStatus::VALID_HEADER]; chain work is never stored, it is recomputed
/// parent-first on load.
pub struct DiskHeaderRecord {
    pub version: i32,
    pub height: u32,
    pub status: BlockStatus,
    pub tx_count: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub prev: BlockHash,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
    pub bits: CompactTarget,
    pub nonce: u32,
}

impl DiskHeaderRecord {
    pub fn from_header(header: &BlockHeader, height: u32, status: BlockStatus) -> Self {
        DiskHeaderRecord {
            version: header.version.to_consensus(),
            height,
            status: status.with(BlockStatus::VALID_HEADER),
            tx_count: 0,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            prev: header.prev_blockhash,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
        }
    }

    /// Reassembles the raw 80-byte header
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: Version::from_consensus(self.version),
            prev_blockhash: self.prev,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.header().block_hash()
    }
}

impl Encodable for DiskHeaderRecord {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> bitcoin::io::Result<usize> {
        let mut len = 0;
        len += self.version.consensus_encode(writer)?;
        len += self.height.consensus_encode(writer)?;
        len += self.status.bits().consensus_encode(writer)?;
        len += self.tx_count.consensus_encode(writer)?;
        len += self.file.consensus_encode(writer)?;
        len += self.data_pos.consensus_encode(writer)?;
        len += self.undo_pos.consensus_encode(writer)?;

        if self.status.has(BlockStatus::VALID_HEADER) {
            len += self.prev.consensus_encode(writer)?;
            len += self.merkle_root.consensus_encode(writer)?;
            len += self.time.consensus_encode(writer)?;
            len += self.bits.to_consensus().consensus_encode(writer)?;
            len += self.nonce.consensus_encode(writer)?;
        }

        Ok(len)
    }
}

impl Decodable for DiskHeaderRecord {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, bitcoin::consensus::encode::Error> {
        let version = i32::consensus_decode(reader)?;
        let height = u32::consensus_decode(reader)?;
        let status = BlockStatus::from_bits(u32::consensus_decode(reader)?);
        let tx_count = u32::consensus_decode(reader)?;
        let file = u32::consensus_decode(reader)?;
        let data_pos = u32::consensus_decode(reader)?;
        let undo_pos = u32::consensus_decode(reader)?;

        let mut record = DiskHeaderRecord {
            version,
            height,
            status,
            tx_count,
            file,
            data_pos,
            undo_pos,
            prev: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0),
            nonce: 0,
        };

        if status.has(BlockStatus::VALID_HEADER) {
            record.prev = BlockHash::consensus_decode(reader)?;
            record.merkle_root = TxMerkleNode::consensus_decode(reader)?;
            record.time = u32::consensus_decode(reader)?;
            record.bits = CompactTarget::from_consensus(u32::consensus_decode(reader)?);
            record.nonce = u32::consensus_decode(reader)?;
        }

        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a transaction lives: which data file, the offset of its block's
/// payload, and the transaction's offset within that payload
pub struct TxPosition {
    pub file: u32,
    pub block_pos: u32,
    pub tx_offset: u32,
}

impl Encodable for TxPosition {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> bitcoin::io::Result<usize> {
        let mut len = 0;
        len += self.file.consensus_encode(writer)?;
        len += self.block_pos.consensus_encode(writer)?;
        len += self.tx_offset.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for TxPosition {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, bitcoin::consensus::encode::Error> {
        Ok(TxPosition {
            file: u32::consensus_decode(reader)?,
            block_pos: u32::consensus_decode(reader)?,
            tx_offset: u32::consensus_decode(reader)?,
        })
    }
}

/// How the block store talks to its embedded database. The schema is small:
/// header records keyed by block hash, file bookkeeping keyed by file index,
/// a transaction index, named boolean flags, the last-file index and the
/// persisted reindex state.
///
/// `write_batch_sync` is the only durability point the store relies on: once
/// it returns, the records, the file infos and the last-file index it was
/// given survive a crash together.
pub trait MetaStore: Send + Sync {
    type Error: DatabaseError;

    /// Reads one header record
    fn header(&self, hash: &BlockHash) -> Result<Option<DiskHeaderRecord>, Self::Error>;

    /// Iterates the whole header catalogue, used once at startup to rebuild
    /// the in-memory index
    fn all_headers(&self) -> Result<Vec<(BlockHash, DiskHeaderRecord)>, Self::Error>;

    /// Reads the bookkeeping of one data file
    fn file_info(&self, file: u32) -> Result<Option<FileInfo>, Self::Error>;

    /// Reads the index of the last data file in use
    fn last_file(&self) -> Result<Option<u32>, Self::Error>;

    /// Durably persists file infos, the last-file index and header records
    /// in one batch
    fn write_batch_sync(
        &self,
        files: &[(u32, FileInfo)],
        last_file: u32,
        headers: &[(BlockHash, DiskHeaderRecord)],
    ) -> Result<(), Self::Error>;

    /// Looks a transaction up in the secondary index
    fn tx_position(&self, txid: &Txid) -> Result<Option<TxPosition>, Self::Error>;

    /// Adds a batch of entries to the transaction index
    fn write_tx_index(&self, entries: &[(Txid, TxPosition)]) -> Result<(), Self::Error>;

    /// Reads a named boolean flag, `None` when it was never written
    fn flag(&self, name: &str) -> Result<Option<bool>, Self::Error>;

    /// Writes a named boolean flag
    fn write_flag(&self, name: &str, value: bool) -> Result<(), Self::Error>;

    /// Reads the persisted reindex state; an absent key means no reindex
    fn reindex_state(&self) -> Result<ReindexState, Self::Error>;

    /// Persists the reindex state. [ReindexState::NoReindex] erases the key.
    fn set_reindex_state(&self, state: ReindexState) -> Result<(), Self::Error>;

    /// Flushes any write buffers. Backends without buffers may no-op.
    fn flush(&self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    use super::BlockHeader;
    use super::BlockStatus;
    use super::CompactTarget;
    use super::DiskHeaderRecord;
    use super::TxMerkleNode;
    use super::TxPosition;
    use super::Version;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: Version::from_consensus(2),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 7,
        }
    }

    #[test]
    fn record_round_trip() {
        let mut record = DiskHeaderRecord::from_header(&sample_header(), 42, BlockStatus::default());
        record.tx_count = 12;
        record.file = 3;
        record.data_pos = 4096;
        record.undo_pos = 128;
        record.status = record.status.with(BlockStatus::HAVE_DATA | BlockStatus::HAVE_UNDO);

        let decoded: DiskHeaderRecord = deserialize(&serialize(&record)).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.header(), sample_header());
        assert_eq!(decoded.block_hash(), sample_header().block_hash());
    }

    #[test]
    fn header_fields_gated_on_valid_header() {
        let with_header = DiskHeaderRecord::from_header(&sample_header(), 1, BlockStatus::default());
        let mut without_header = with_header;
        without_header.status = BlockStatus::from_bits(0);

        // a record without VALID_HEADER serializes only the bookkeeping
        assert_eq!(serialize(&without_header).len(), 7 * 4);
        assert_eq!(serialize(&with_header).len(), 7 * 4 + 80 - 4);

        let decoded: DiskHeaderRecord = deserialize(&serialize(&without_header)).unwrap();
        assert_eq!(decoded.height, 1);
        assert_eq!(decoded.prev, BlockHash::all_zeros());
    }

    #[test]
    fn tx_position_round_trip() {
        let pos = TxPosition {
            file: 1,
            block_pos: 8,
            tx_offset: 81,
        };
        let decoded: TxPosition = deserialize(&serialize(&pos)).unwrap();
        assert_eq!(decoded, pos);
    }
}
