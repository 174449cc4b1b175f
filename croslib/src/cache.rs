use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::file::{add_extension, rename_atomic};

const BOARD_INDEX_NAME: &str = "boards.txt";
const RECOVERY_DB_NAME: &str = "recovery.json";
const MANIFESTS_DIR: &str = "manifests";
const CHUNKS_DIR: &str = "chunks";
const PARTIAL_DIR: &str = "partial";
const PART_EXT: &str = "part";

/// On-disk layout of the cache root. Nothing here is global: every component
/// receives the cache root it should use.
///
/// ```text
/// <root>/boards.txt
/// <root>/recovery.json
/// <root>/manifests/<board>.json
/// <root>/chunks/<board>/<chunk>
/// <root>/partial/<board>/<chunk>
/// ```
///
/// In-progress chunk transfers live in their own tree so that no chunk name
/// can collide with another chunk's partial file.
#[derive(Clone, Debug)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn board_index_path(&self) -> PathBuf {
        self.root.join(BOARD_INDEX_NAME)
    }

    pub fn recovery_db_path(&self) -> PathBuf {
        self.root.join(RECOVERY_DB_NAME)
    }

    /// Callers must have validated `board` as a plain path component.
    pub fn manifest_path(&self, board: &str) -> PathBuf {
        self.root.join(MANIFESTS_DIR).join(format!("{board}.json"))
    }

    pub fn staging_dir(&self, board: &str) -> PathBuf {
        self.root.join(CHUNKS_DIR).join(board)
    }

    pub fn chunk_path(&self, board: &str, chunk: &str) -> PathBuf {
        self.staging_dir(board).join(chunk)
    }

    pub fn partial_dir(&self, board: &str) -> PathBuf {
        self.root.join(PARTIAL_DIR).join(board)
    }

    /// Path that an in-progress transfer of `chunk` is written to.
    pub fn chunk_part_path(&self, board: &str, chunk: &str) -> PathBuf {
        self.partial_dir(board).join(chunk)
    }
}

/// Read a cached file. Returns `None` if the file does not exist.
pub(crate) async fn read_cached(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            debug!("Loaded {} bytes from cache: {:?}", data.len(), path);
            Ok(Some(data))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a cache file. The data is written to a sibling file first so that a
/// reader never observes a truncated cache entry.
pub(crate) async fn write_cached(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = add_extension(path, PART_EXT);
    trace!("Writing {} bytes to {:?}", data.len(), temp_path);

    tokio::fs::write(&temp_path, data).await?;
    rename_atomic(&temp_path, path)?;

    debug!("Cached {} bytes: {:?}", data.len(), path);

    Ok(())
}
