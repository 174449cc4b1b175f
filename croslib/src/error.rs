use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    manifest::ManifestError,
    recovery::DatabaseError,
    transport::TransportError,
    version::OsVersion,
};

#[derive(Debug, Error)]
pub enum CrosError {
    #[error("Invalid board name: {0:?}")]
    InvalidBoard(String),
    #[error("Board '{0}' was not found")]
    BoardNotFound(String),
    #[error("Could not fetch board index from {url}")]
    IndexUnavailable {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("Manifest for board '{board}' is unavailable")]
    ManifestUnavailable {
        board: String,
        #[source]
        source: ManifestError,
    },
    #[error("Failed to fetch chunk #{index} ({name}) for board '{board}'")]
    ChunkFetchFailed {
        index: usize,
        name: String,
        board: String,
        #[source]
        source: TransportError,
    },
    #[error("Chunk '{0}' is missing from the staging area")]
    ChunkMissing(String),
    #[error("Expected {expected} bytes, but {path:?} is {actual} bytes")]
    SizeMismatch {
        expected: u64,
        actual: u64,
        path: PathBuf,
    },
    #[error("Recovery database at {url} is unavailable")]
    DatabaseUnavailable {
        url: String,
        #[source]
        source: DatabaseError,
    },
    #[error("Version {version} is not available for board '{board}'")]
    VersionNotFound {
        board: String,
        version: OsVersion,
    },
    #[error("Failed to download {url}")]
    DownloadFailed {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("I/O error for path: {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Blocking task did not complete")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl CrosError {
    /// Return a closure for use with `map_err` that attaches `path` to an I/O
    /// error.
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}
