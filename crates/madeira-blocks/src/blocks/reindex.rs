//! Rebuilding the header catalogue from the raw data files.
//!
//! The worker walks `blk00000.dat, blk00001.dat, ...` until a file is
//! missing, looking for the 4-byte network magic. Each match is read as a
//! frame header; anything long enough to carry a block header is handed to
//! the validation engine, which re-validates and re-inserts the blocks on
//! its own workers. The catalogue ends up exactly as if the blocks had
//! arrived over the network.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::blocks::error::BlockStoreError;
use crate::blocks::file_mapper::FileKind;
use crate::blocks::meta_store::MetaStore;
use crate::blocks::raw_file::BlockPosition;
use crate::blocks::raw_file::FileInfo;
use crate::blocks::raw_file::MESSAGE_START_SIZE;
use crate::blocks::store::BlockStore;
use crate::blocks::BlockSubmitter;
use crate::blocks::ReindexState;

fn find_magic(haystack: &[u8], magic: &[u8; MESSAGE_START_SIZE]) -> Option<usize> {
    haystack
        .windows(MESSAGE_START_SIZE)
        .position(|window| window == magic)
}

impl<S: MetaStore> BlockStore<S> {
    /// Spawns the importer thread when a reindex is pending. Returns `None`
    /// in normal operation.
    pub fn start_block_importer(
        self: &Arc<Self>,
        submitter: Arc<dyn BlockSubmitter>,
    ) -> Option<JoinHandle<()>>
    where
        S: 'static,
    {
        if self.reindexing() == ReindexState::NoReindex {
            return None;
        }

        let store = Arc::clone(self);
        Some(thread::spawn(move || {
            store.reimport_block_files(&*submitter);
        }))
    }

    /// The importer body: scan every data file, then wait for validation,
    /// then clear the reindex state. An error or a shutdown request leaves
    /// the persisted state untouched so the next start resumes.
    fn reimport_block_files(&self, submitter: &dyn BlockSubmitter) {
        if self.reindexing() == ReindexState::ScanningFiles {
            let mut file = 0u32;
            loop {
                match self.import_block_file(submitter, file) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(BlockStoreError::Interrupted) => {
                        log::info!("block import interrupted, will resume on next start");
                        return;
                    }
                    Err(e) => {
                        log::error!("block import failed on file {file}: {e}");
                        return;
                    }
                }
                if self.shutdown().is_shutting_down() {
                    return;
                }
                file += 1;
            }

            if let Err(e) = self.set_reindexing(ReindexState::ParsingBlocks) {
                log::error!("failed to persist reindex state: {e}");
                return;
            }
        }

        submitter.wait_validation_finished();

        if let Err(e) = self.set_reindexing(ReindexState::NoReindex) {
            log::error!("failed to persist reindex state: {e}");
            return;
        }
        if let Err(e) = self.flush() {
            log::error!("failed to flush after reindex: {e}");
            return;
        }
        log::info!("Reindexing finished");

        // to avoid ending up without a genesis block, re-try initializing;
        // a no-op when reindexing worked
        if let Err(e) = self.ensure_genesis() {
            log::error!("failed to re-insert genesis after reindex: {e}");
            return;
        }

        if self.config().stop_after_block_import {
            log::info!("Stopping after block import");
            self.shutdown().request_shutdown();
        }
    }

    /// Scans one blk file and submits every plausible frame. `Ok(false)`
    /// means the file doesn't exist and scanning is done.
    fn import_block_file(
        &self,
        submitter: &dyn BlockSubmitter,
        file: u32,
    ) -> Result<bool, BlockStoreError> {
        let Some(view) = self.mapper().view(FileKind::Block, file)? else {
            return Ok(false);
        };

        let data = view.as_slice();
        let magic = self.magic();
        let mut info = FileInfo::default();
        let mut offset = 0usize;

        while offset < data.len() {
            let Some(found) = find_magic(&data[offset..], &magic) else {
                // no more frames; don't complain
                break;
            };
            let at = offset + found;
            if at + 8 > data.len() {
                break;
            }

            let len_bytes: [u8; 4] = data[at + 4..at + 8]
                .try_into()
                .expect("slice is four bytes");
            let block_size = u32::from_le_bytes(len_bytes);
            if block_size < 80 {
                // too small to even hold a header; keep scanning behind the magic
                offset = at + 4;
                continue;
            }

            let payload_start = at + 8;
            submitter.wait_for_space();
            submitter.add_block(BlockPosition {
                file,
                pos: payload_start as u32,
            });
            info.blocks += 1;
            offset = payload_start + block_size as usize;
            info.size = offset as u32;

            if self.shutdown().is_shutting_down() {
                return Err(BlockStoreError::Interrupted);
            }
        }

        if info.blocks > 0 {
            log::info!("Loaded {} blocks from external file {}", info.blocks, file);
            self.writer().register_scanned_file(file, info);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::find_magic;

    #[test]
    fn finds_magic_only_on_full_match() {
        let magic = [0xfa, 0xbf, 0xb5, 0xda];

        assert_eq!(find_magic(&[0x00, 0xfa, 0xbf, 0xb5, 0xda], &magic), Some(1));
        // a lone first byte is not a frame start
        assert_eq!(find_magic(&[0xfa, 0x00, 0xfa, 0xbf, 0xb5], &magic), None);
        assert_eq!(find_magic(&[], &magic), None);
        assert_eq!(find_magic(&[0xfa, 0xbf, 0xb5], &magic), None);
    }
}
