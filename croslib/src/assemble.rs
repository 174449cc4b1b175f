use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    cache::CacheDir,
    chunk::ChunkValidator,
    error::CrosError,
    file::{add_extension, delete_dir_if_exists, TempPath},
    manifest::Manifest,
};

/// Extension of the temporary file that the output is assembled into.
pub const TEMP_EXT: &str = "crosdl_temp";

/// Concatenates staged chunks into the final artifact.
#[derive(Clone)]
pub struct Assembler {
    cache: CacheDir,
    validator: Arc<dyn ChunkValidator>,
}

impl Assembler {
    pub fn new(cache: CacheDir, validator: Arc<dyn ChunkValidator>) -> Self {
        Self {
            cache,
            validator,
        }
    }

    /// Write the chunks of `manifest` in order to `output` and remove the
    /// board's staging area. `output` only ever appears once it has the size
    /// the manifest declares. If the size doesn't match, the assembled data is
    /// left at the path reported in [`CrosError::SizeMismatch`] and the staging
    /// area is kept. This performs blocking I/O.
    pub fn assemble(
        &self,
        board: &str,
        manifest: &Manifest,
        output: &Path,
    ) -> Result<u64, CrosError> {
        for name in &manifest.chunks {
            let path = self.cache.chunk_path(board, name);
            if !self.validator.is_valid(&path).map_err(CrosError::io(&path))? {
                return Err(CrosError::ChunkMissing(name.clone()));
            }
        }

        let temp = TempPath::new(add_extension(output, TEMP_EXT));
        debug!("[{board}] Assembling {} chunks into {:?}", manifest.chunks.len(), temp.path());

        let size = self.concatenate(board, manifest, temp.path())?;

        if size != manifest.total_size {
            let path = temp.keep();
            warn!("[{board}] Assembled size {size} does not match expected size {}",
                  manifest.total_size);

            return Err(CrosError::SizeMismatch {
                expected: manifest.total_size,
                actual: size,
                path,
            });
        }

        temp.persist(output).map_err(CrosError::io(output))?;

        for dir in [self.cache.staging_dir(board), self.cache.partial_dir(board)] {
            if let Err(e) = delete_dir_if_exists(&dir) {
                // The artifact is complete; a leftover staging area only wastes space
                warn!("[{board}] Failed to remove staging area {:?}: {}", dir, e);
            }
        }

        info!("[{board}] Wrote {size} bytes to {:?}", output);

        Ok(size)
    }

    /// Append every chunk to a new file at `path` and return the number of
    /// bytes written.
    fn concatenate(&self, board: &str, manifest: &Manifest, path: &Path) -> Result<u64, CrosError> {
        let file = File::create(path).map_err(CrosError::io(path))?;
        let mut writer = BufWriter::new(file);
        let mut size = 0;

        for name in &manifest.chunks {
            let chunk_path = self.cache.chunk_path(board, name);
            let mut chunk = File::open(&chunk_path).map_err(CrosError::io(&chunk_path))?;

            let n = io::copy(&mut chunk, &mut writer).map_err(CrosError::io(path))?;
            debug!("[{board}] Appended {n} bytes from {name}");

            size += n;
        }

        writer.flush().map_err(CrosError::io(path))?;
        writer.get_ref().sync_all().map_err(CrosError::io(path))?;

        Ok(size)
    }
}
