use std::{
    fs,
    io,
    path::Path,
    sync::Arc,
};

use log::{debug, info};

use crate::{
    cache::CacheDir,
    error::CrosError,
    file::rename_atomic,
    manifest::Manifest,
    progress::ProgressListener,
    transfer::download_resumable,
    transport::Transport,
};

/// Policy deciding whether a staged chunk file can be used as-is.
pub trait ChunkValidator: Send + Sync {
    fn is_valid(&self, path: &Path) -> io::Result<bool>;
}

/// Accept any existing, non-empty file. The content is never checked, so a
/// chunk that was corrupted after it was staged is only caught by the size
/// check during assembly (if at all). Transfers are written to a separate
/// partial file and renamed once complete, so an interrupted transfer cannot produce a
/// truncated chunk file.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustNonEmptyLocalFile;

impl ChunkValidator for TrustNonEmptyLocalFile {
    fn is_valid(&self, path: &Path) -> io::Result<bool> {
        match fs::metadata(path) {
            Ok(m) => Ok(m.is_file() && m.len() > 0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// What happened to a single chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkOutcome {
    Downloaded { size: u64 },
    Skipped { size: u64 },
}

/// Summary of a pass over all chunks of a manifest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkFetchReport {
    pub downloaded: usize,
    pub skipped: usize,
    /// Size of the chunks fetched during this pass
    pub downloaded_bytes: u64,
}

impl ChunkFetchReport {
    pub fn total(&self) -> usize {
        self.downloaded + self.skipped
    }

    fn record(self, outcome: ChunkOutcome) -> Self {
        match outcome {
            ChunkOutcome::Downloaded { size } => Self {
                downloaded: self.downloaded + 1,
                downloaded_bytes: self.downloaded_bytes + size,
                ..self
            },
            ChunkOutcome::Skipped { .. } => Self {
                skipped: self.skipped + 1,
                ..self
            },
        }
    }
}

impl FromIterator<ChunkOutcome> for ChunkFetchReport {
    fn from_iter<I: IntoIterator<Item = ChunkOutcome>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), Self::record)
    }
}

/// Per-board staging area for chunk files.
pub struct ChunkStore<'a, T> {
    transport: &'a T,
    cache: CacheDir,
    validator: Arc<dyn ChunkValidator>,
}

impl<'a, T: Transport> ChunkStore<'a, T> {
    pub fn new(transport: &'a T, cache: CacheDir, validator: Arc<dyn ChunkValidator>) -> Self {
        Self {
            transport,
            cache,
            validator,
        }
    }

    /// Make sure every chunk of `manifest` is staged, fetching the ones that
    /// aren't. Chunks are processed one at a time in manifest order. The first
    /// failure aborts the pass, but everything staged so far is kept so that a
    /// later run can pick up where this one stopped.
    pub async fn ensure_all_present<L: ProgressListener>(
        &self,
        board: &str,
        manifest: &Manifest,
        listener: &mut L,
    ) -> Result<ChunkFetchReport, CrosError> {
        for dir in [self.cache.staging_dir(board), self.cache.partial_dir(board)] {
            tokio::fs::create_dir_all(&dir).await.map_err(CrosError::io(&dir))?;
        }

        let total = manifest.chunks.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, name) in manifest.chunks.iter().enumerate() {
            let path = self.cache.chunk_path(board, name);

            if self.validator.is_valid(&path).map_err(CrosError::io(&path))? {
                let size = fs::metadata(&path).map_err(CrosError::io(&path))?.len();
                debug!("[{board}] Chunk {}/{} ({name}) is already staged", index + 1, total);

                listener.chunk_skipped(index, total, name, size);
                outcomes.push(ChunkOutcome::Skipped { size });
                continue;
            }

            listener.chunk_started(index, total, name);

            let part_path = self.cache.chunk_part_path(board, name);
            let size = download_resumable(
                self.transport,
                &manifest.chunk_url(name),
                &part_path,
                &mut *listener,
            ).await.map_err(|source| CrosError::ChunkFetchFailed {
                index,
                name: name.clone(),
                board: board.to_owned(),
                source,
            })?;

            rename_atomic(&part_path, &path).map_err(CrosError::io(&path))?;
            debug!("[{board}] Staged chunk {}/{} ({name}): {size} bytes", index + 1, total);

            listener.chunk_finished(index, total, name);
            outcomes.push(ChunkOutcome::Downloaded { size });
        }

        let report: ChunkFetchReport = outcomes.into_iter().collect();
        info!("[{board}] Chunks downloaded: {}, already staged: {}",
              report.downloaded, report.skipped);

        Ok(report)
    }
}
