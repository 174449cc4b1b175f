use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;

use crate::{
    assemble::Assembler,
    cache::CacheDir,
    chunk::{ChunkFetchReport, ChunkStore, ChunkValidator, TrustNonEmptyLocalFile},
    error::CrosError,
    manifest::{Manifest, ManifestResolver, ShimConfig},
    progress::ProgressListener,
    transport::Transport,
};

/// Result of a successful shim download.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShimSummary {
    pub board: String,
    pub output: PathBuf,
    pub size: u64,
    pub chunks: ChunkFetchReport,
}

/// Downloads the RMA shim for a board: resolve the manifest, stage every
/// chunk, then assemble the output.
pub struct ShimDownloader<'a, T> {
    resolver: ManifestResolver<'a, T>,
    store: ChunkStore<'a, T>,
    assembler: Assembler,
}

impl<'a, T: Transport> ShimDownloader<'a, T> {
    pub fn new(transport: &'a T, cache: CacheDir, config: ShimConfig) -> Self {
        Self::with_validator(transport, cache, config, Arc::new(TrustNonEmptyLocalFile))
    }

    pub fn with_validator(
        transport: &'a T,
        cache: CacheDir,
        config: ShimConfig,
        validator: Arc<dyn ChunkValidator>,
    ) -> Self {
        Self {
            resolver: ManifestResolver::new(transport, cache.clone(), config),
            store: ChunkStore::new(transport, cache.clone(), validator.clone()),
            assembler: Assembler::new(cache, validator),
        }
    }

    pub fn resolver(&self) -> &ManifestResolver<'a, T> {
        &self.resolver
    }

    /// Download the shim for `board` into `output`. The first failure is
    /// returned as-is. Staged chunks survive failures and interruptions, so
    /// running this again only fetches what is still missing.
    pub async fn download_shim<L: ProgressListener>(
        &self,
        board: &str,
        output: &Path,
        listener: &mut L,
    ) -> Result<ShimSummary, CrosError> {
        let manifest = self.resolver.resolve(board).await?;

        self.download_resolved(board, manifest, output, listener).await
    }

    /// Same as [`Self::download_shim`], but with a manifest that the caller
    /// already resolved through [`Self::resolver`].
    pub async fn download_resolved<L: ProgressListener>(
        &self,
        board: &str,
        manifest: Manifest,
        output: &Path,
        listener: &mut L,
    ) -> Result<ShimSummary, CrosError> {
        listener.manifest_resolved(board, &manifest);

        let chunks = self.store.ensure_all_present(board, &manifest, &mut *listener).await?;

        listener.assembling(output);

        let size = {
            let assembler = self.assembler.clone();
            let board = board.to_owned();
            let output = output.to_owned();

            tokio::task::spawn_blocking(move || {
                assembler.assemble(&board, &manifest, &output)
            }).await??
        };

        listener.completed(output, size);
        info!("[{board}] Shim complete: {} chunks downloaded, {} already staged, {size} bytes",
              chunks.downloaded, chunks.skipped);

        Ok(ShimSummary {
            board: board.to_owned(),
            output: output.to_owned(),
            size,
            chunks,
        })
    }
}
