use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    cache::{read_cached, write_cached, CacheDir},
    error::CrosError,
    file::is_plain_component,
    transport::{Transport, TransportError},
};

/// Name of the manifest file within a board's directory on the server.
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to fetch manifest: {0}")]
    Fetch(#[from] TransportError),
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Manifest declares a total size of 0")]
    ZeroSize,
    #[error("Manifest lists no chunks")]
    NoChunks,
    #[error("Invalid chunk name in manifest: {0:?}")]
    InvalidChunkName(String),
}

/// Reject board names that are empty or that would escape the cache
/// directories they are used in.
pub fn validate_board(board: &str) -> Result<(), CrosError> {
    if is_plain_component(board) {
        Ok(())
    } else {
        Err(CrosError::InvalidBoard(board.to_owned()))
    }
}

/// Join a base URL and a relative path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Text listing of path fragments on the distribution server, one per line.
#[derive(Clone, Debug, Default)]
pub struct BoardIndex {
    entries: Vec<String>,
}

impl BoardIndex {
    pub fn parse(text: &str) -> Self {
        Self {
            entries: text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the directory for `board`. The first entry containing `/<board>/`
    /// wins and the returned path is truncated right after that segment.
    pub fn lookup(&self, board: &str) -> Option<&str> {
        let needle = format!("/{board}/");

        self.entries.iter().find_map(|e| {
            e.find(&needle).map(|pos| &e[..pos + needle.len()])
        })
    }
}

#[derive(Deserialize)]
struct RawManifest {
    size: u64,
    chunks: Vec<String>,
}

/// Description of an artifact that is split into ordered chunks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Manifest {
    /// Size of the reassembled artifact in bytes
    pub total_size: u64,
    /// Chunk names in concatenation order
    pub chunks: Vec<String>,
    /// URL of the directory holding the manifest and the chunks. Always ends
    /// with a slash.
    pub location: String,
}

impl Manifest {
    pub fn parse(data: &[u8], location: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_slice(data)?;

        if raw.size == 0 {
            return Err(ManifestError::ZeroSize);
        } else if raw.chunks.is_empty() {
            return Err(ManifestError::NoChunks);
        }

        if let Some(name) = raw.chunks.iter().find(|c| !is_plain_component(c)) {
            return Err(ManifestError::InvalidChunkName(name.clone()));
        }

        let mut location = location.to_owned();
        if !location.ends_with('/') {
            location.push('/');
        }

        Ok(Self {
            total_size: raw.size,
            chunks: raw.chunks,
            location,
        })
    }

    pub fn chunk_url(&self, name: &str) -> String {
        format!("{}{}", self.location, name)
    }
}

/// Where shims are published.
#[derive(Clone, Debug)]
pub struct ShimConfig {
    /// URL of the board index
    pub index_url: String,
    /// URL that board index entries are relative to
    pub base_url: String,
    /// Whether to read and write the cache root for the index and manifests
    pub use_cache: bool,
}

/// Resolves a board name to the manifest of its shim.
pub struct ManifestResolver<'a, T> {
    transport: &'a T,
    cache: CacheDir,
    config: ShimConfig,
}

impl<'a, T: Transport> ManifestResolver<'a, T> {
    pub fn new(transport: &'a T, cache: CacheDir, config: ShimConfig) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    /// Load the board index from the cache or fetch it from the server.
    pub async fn load_index(&self) -> Result<BoardIndex, CrosError> {
        let path = self.cache.board_index_path();

        if self.config.use_cache {
            if let Some(data) = read_cached(&path).await.map_err(CrosError::io(&path))? {
                return Ok(BoardIndex::parse(&String::from_utf8_lossy(&data)));
            }
        }

        let data = self.transport.fetch(&self.config.index_url).await
            .map_err(|source| CrosError::IndexUnavailable {
                url: self.config.index_url.clone(),
                source,
            })?;

        if self.config.use_cache {
            write_cached(&path, &data).await.map_err(CrosError::io(&path))?;
        }

        let index = BoardIndex::parse(&String::from_utf8_lossy(&data));
        debug!("Board index has {} entries", index.len());

        Ok(index)
    }

    /// Resolve `board` to its manifest. A cached manifest is trusted without
    /// checking whether the server has a newer one.
    pub async fn resolve(&self, board: &str) -> Result<Manifest, CrosError> {
        validate_board(board)?;

        let index = self.load_index().await?;
        let dir = index.lookup(board)
            .ok_or_else(|| CrosError::BoardNotFound(board.to_owned()))?;
        let location = join_url(&self.config.base_url, dir);

        debug!("[{board}] Board directory: {location}");

        let manifest = self.load_manifest(board, &location).await?;

        info!("[{board}] Manifest: {} bytes in {} chunks",
              manifest.total_size, manifest.chunks.len());

        Ok(manifest)
    }

    async fn load_manifest(&self, board: &str, location: &str) -> Result<Manifest, CrosError> {
        let path = self.cache.manifest_path(board);
        let unavailable = |source: ManifestError| CrosError::ManifestUnavailable {
            board: board.to_owned(),
            source,
        };

        if self.config.use_cache {
            if let Some(data) = read_cached(&path).await.map_err(CrosError::io(&path))? {
                match Manifest::parse(&data, location) {
                    Ok(m) => return Ok(m),
                    Err(e) => warn!("Discarding unusable cached manifest {:?}: {}", path, e),
                }
            }
        }

        let url = format!("{location}{MANIFEST_NAME}");
        let data = self.transport.fetch(&url).await
            .map_err(|e| unavailable(ManifestError::from(e)))?;
        let manifest = Manifest::parse(&data, location).map_err(unavailable)?;

        if self.config.use_cache {
            write_cached(&path, &data).await.map_err(CrosError::io(&path))?;
        }

        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::testutil::FakeTransport;

    use super::*;

    const INDEX_URL: &str = "https://shims.test/boards.txt";
    const BASE_URL: &str = "https://shims.test/files/";
    const MANIFEST_URL: &str = "https://shims.test/files/rma/octopus/manifest.json";
    const INDEX: &str = "rma/brya/brya.bin\nrma/octopus/octopus.bin\nmirror/octopus/old.bin\n";
    const MANIFEST: &str = r#"{"size": 22, "chunks": ["c1", "c2", "c3"]}"#;

    fn config(use_cache: bool) -> ShimConfig {
        ShimConfig {
            index_url: INDEX_URL.to_owned(),
            base_url: BASE_URL.to_owned(),
            use_cache,
        }
    }

    fn transport() -> FakeTransport {
        let transport = FakeTransport::new();
        transport.insert(INDEX_URL, INDEX);
        transport.insert(MANIFEST_URL, MANIFEST);
        transport
    }

    #[test]
    fn test_board_index_lookup() {
        let index = BoardIndex::parse(INDEX);
        assert_eq!(index.len(), 3);

        // First match wins
        assert_eq!(index.lookup("octopus"), Some("rma/octopus/"));
        assert_eq!(index.lookup("brya"), Some("rma/brya/"));
        // Only whole path segments match
        assert_eq!(index.lookup("octo"), None);
        assert_eq!(index.lookup("rma"), None);

        let index = BoardIndex::parse("\n  \n/rma/hatch/\n");
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup("hatch"), Some("/rma/hatch/"));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://a/b/", "/c/"), "https://a/b/c/");
        assert_eq!(join_url("https://a/b", "c/"), "https://a/b/c/");
    }

    #[test]
    fn test_manifest_parse() {
        let m = Manifest::parse(MANIFEST.as_bytes(), "https://a/b").unwrap();
        assert_eq!(m.total_size, 22);
        assert_eq!(m.chunks, ["c1", "c2", "c3"]);
        assert_eq!(m.location, "https://a/b/");
        assert_eq!(m.chunk_url("c2"), "https://a/b/c2");

        assert_matches!(Manifest::parse(br#"{"size": 0, "chunks": ["a"]}"#, ""),
                        Err(ManifestError::ZeroSize));
        assert_matches!(Manifest::parse(br#"{"size": 1, "chunks": []}"#, ""),
                        Err(ManifestError::NoChunks));
        assert_matches!(Manifest::parse(br#"{"size": 1, "chunks": ["a", "../b"]}"#, ""),
                        Err(ManifestError::InvalidChunkName(n)) if n == "../b");
        assert_matches!(Manifest::parse(br#"{"size": -1, "chunks": ["a"]}"#, ""),
                        Err(ManifestError::Parse(_)));
        assert_matches!(Manifest::parse(b"<html>", ""), Err(ManifestError::Parse(_)));
    }

    #[tokio::test]
    async fn test_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path());
        let transport = transport();
        let resolver = ManifestResolver::new(&transport, cache.clone(), config(true));

        let manifest = resolver.resolve("octopus").await.unwrap();
        assert_eq!(manifest.total_size, 22);
        assert_eq!(manifest.location, "https://shims.test/files/rma/octopus/");

        assert!(cache.board_index_path().exists());
        assert!(cache.manifest_path("octopus").exists());
    }

    #[tokio::test]
    async fn test_resolve_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path());
        let transport = transport();

        let resolver = ManifestResolver::new(&transport, cache.clone(), config(true));
        let first = resolver.resolve("octopus").await.unwrap();
        let second = resolver.resolve("octopus").await.unwrap();
        assert_eq!(first, second);

        // A fresh resolver over the same cache root doesn't hit the network
        let resolver = ManifestResolver::new(&transport, cache, config(true));
        assert_eq!(resolver.resolve("octopus").await.unwrap(), first);

        assert_eq!(transport.request_count(INDEX_URL), 1);
        assert_eq!(transport.request_count(MANIFEST_URL), 1);
    }

    #[tokio::test]
    async fn test_resolve_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path());
        let transport = transport();
        let resolver = ManifestResolver::new(&transport, cache.clone(), config(false));

        resolver.resolve("octopus").await.unwrap();
        resolver.resolve("octopus").await.unwrap();

        assert_eq!(transport.request_count(INDEX_URL), 2);
        assert_eq!(transport.request_count(MANIFEST_URL), 2);
        assert!(!cache.board_index_path().exists());
        assert!(!cache.manifest_path("octopus").exists());
    }

    #[tokio::test]
    async fn test_resolve_unknown_board() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport();
        let resolver = ManifestResolver::new(&transport, CacheDir::new(dir.path()), config(true));

        assert_matches!(resolver.resolve("zork").await,
                        Err(CrosError::BoardNotFound(b)) if b == "zork");
        assert_eq!(transport.requests(), [(INDEX_URL.to_owned(), 0)]);
    }

    #[tokio::test]
    async fn test_resolve_invalid_board() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport();
        let resolver = ManifestResolver::new(&transport, CacheDir::new(dir.path()), config(true));

        assert_matches!(resolver.resolve("").await, Err(CrosError::InvalidBoard(_)));
        assert_matches!(resolver.resolve("..").await, Err(CrosError::InvalidBoard(_)));
        assert_matches!(resolver.resolve("a/b").await, Err(CrosError::InvalidBoard(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_index_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport();
        transport.remove(INDEX_URL);
        let resolver = ManifestResolver::new(&transport, CacheDir::new(dir.path()), config(true));

        assert_matches!(resolver.resolve("octopus").await,
                        Err(CrosError::IndexUnavailable { url, .. }) if url == INDEX_URL);
    }

    #[tokio::test]
    async fn test_resolve_manifest_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path());
        let transport = transport();
        let resolver = ManifestResolver::new(&transport, cache.clone(), config(true));

        transport.remove(MANIFEST_URL);
        assert_matches!(resolver.resolve("octopus").await,
                        Err(CrosError::ManifestUnavailable { source: ManifestError::Fetch(_), .. }));

        transport.insert(MANIFEST_URL, "not json");
        assert_matches!(resolver.resolve("octopus").await,
                        Err(CrosError::ManifestUnavailable { source: ManifestError::Parse(_), .. }));

        // Nothing unusable is cached
        assert!(!cache.manifest_path("octopus").exists());
    }

    #[tokio::test]
    async fn test_resolve_discards_bad_cached_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path());
        let transport = transport();
        let resolver = ManifestResolver::new(&transport, cache.clone(), config(true));

        write_cached(&cache.manifest_path("octopus"), b"{").await.unwrap();

        assert_eq!(resolver.resolve("octopus").await.unwrap().total_size, 22);
        assert_eq!(transport.request_count(MANIFEST_URL), 1);
        assert_eq!(std::fs::read(cache.manifest_path("octopus")).unwrap(), MANIFEST.as_bytes());
    }
}
