use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::{
    cache::{read_cached, write_cached, CacheDir},
    error::CrosError,
    file::{add_extension, is_plain_component, rename_atomic},
    manifest::validate_board,
    progress::ProgressListener,
    transfer::download_resumable,
    transport::{Transport, TransportError},
    version::OsVersion,
};

/// Extension of the partial file that a recovery image is downloaded into.
pub const DOWNLOAD_EXT: &str = "crosdl_download";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to fetch recovery database: {0}")]
    Fetch(#[from] TransportError),
    #[error("Failed to parse recovery database: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Sizes show up both as JSON numbers and as strings.
fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Size>::deserialize(deserializer)? {
        Some(Size::Number(n)) => Some(n),
        Some(Size::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// One recovery image listed in the device database. Fields that aren't
/// needed for lookups are ignored.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RecoveryImage {
    /// Human-readable device name(s)
    #[serde(default)]
    pub name: String,
    /// Image filename. Contains the board as `_<board>_recovery`
    pub file: String,
    /// Download URL of the (zipped) image
    pub url: String,
    /// ChromeOS platform version
    pub version: String,
    /// Release channel
    #[serde(default)]
    pub channel: String,
    /// Chrome browser version
    #[serde(default)]
    pub chrome_version: String,
    /// Size of the unzipped image
    #[serde(default, deserialize_with = "deserialize_size")]
    pub filesize: Option<u64>,
    /// Size of the file at `url`
    #[serde(default, deserialize_with = "deserialize_size")]
    pub zipfilesize: Option<u64>,
}

impl RecoveryImage {
    pub fn matches_board(&self, board: &str) -> bool {
        self.file.contains(&format!("_{board}_recovery"))
    }

    pub fn os_version(&self) -> Option<OsVersion> {
        self.version.parse().ok()
    }

    /// Local filename for the download: the last path component of the URL,
    /// or `file` if the URL doesn't end in a usable name. Returns `None` if
    /// neither is a plain filename.
    pub fn filename(&self) -> Option<&str> {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        let last = path.rsplit('/').next().unwrap_or_default();

        [last, self.file.as_str()].into_iter().find(|n| is_plain_component(n))
    }
}

/// The JSON device database: a flat list of recovery images.
#[derive(Clone, Debug, Default)]
pub struct RecoveryDatabase {
    images: Vec<RecoveryImage>,
}

impl RecoveryDatabase {
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            images: serde_json::from_slice(data)?,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images_for_board(&self, board: &str) -> impl Iterator<Item = &RecoveryImage> + '_ {
        let board = board.to_owned();

        self.images.iter().filter(move |i| i.matches_board(&board))
    }

    /// Pick the image for `board`. With `version`, the first image with that
    /// version is returned. Otherwise, the newest image wins; images with
    /// unparseable versions are only picked if nothing else matches.
    pub fn select(&self, board: &str, version: Option<&OsVersion>) -> Result<&RecoveryImage, CrosError> {
        let not_found = || CrosError::BoardNotFound(board.to_owned());

        match version {
            Some(v) => {
                let mut candidates = self.images_for_board(board).peekable();
                if candidates.peek().is_none() {
                    return Err(not_found());
                }

                candidates
                    .find(|i| i.os_version().as_ref() == Some(v))
                    .ok_or_else(|| CrosError::VersionNotFound {
                        board: board.to_owned(),
                        version: v.clone(),
                    })
            }
            None => self.images_for_board(board)
                .max_by_key(|i| i.os_version())
                .ok_or_else(not_found),
        }
    }
}

/// Where the device database is published.
#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    pub database_url: String,
    /// Whether to read and write the cached database
    pub use_cache: bool,
}

/// Result of a successful recovery image download.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecoverySummary {
    pub board: String,
    pub version: String,
    pub output: PathBuf,
    pub size: u64,
}

/// Downloads recovery images listed in the device database.
pub struct RecoveryDownloader<'a, T> {
    transport: &'a T,
    cache: CacheDir,
    config: RecoveryConfig,
}

impl<'a, T: Transport> RecoveryDownloader<'a, T> {
    pub fn new(transport: &'a T, cache: CacheDir, config: RecoveryConfig) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    /// Load the device database from the cache or fetch it from the server.
    pub async fn load_database(&self) -> Result<RecoveryDatabase, CrosError> {
        let path = self.cache.recovery_db_path();
        let unavailable = |source: DatabaseError| CrosError::DatabaseUnavailable {
            url: self.config.database_url.clone(),
            source,
        };

        if self.config.use_cache {
            if let Some(data) = read_cached(&path).await.map_err(CrosError::io(&path))? {
                match RecoveryDatabase::parse(&data) {
                    Ok(db) => return Ok(db),
                    Err(e) => warn!("Discarding unusable cached database {:?}: {}", path, e),
                }
            }
        }

        let data = self.transport.fetch(&self.config.database_url).await
            .map_err(|e| unavailable(DatabaseError::from(e)))?;
        let db = RecoveryDatabase::parse(&data)
            .map_err(|e| unavailable(DatabaseError::from(e)))?;

        if self.config.use_cache {
            write_cached(&path, &data).await.map_err(CrosError::io(&path))?;
        }

        debug!("Recovery database has {} images", db.len());

        Ok(db)
    }

    /// Find the image to download for `board`.
    pub async fn select_image(
        &self,
        board: &str,
        version: Option<&OsVersion>,
    ) -> Result<RecoveryImage, CrosError> {
        validate_board(board)?;

        let db = self.load_database().await?;
        let image = db.select(board, version)?.clone();

        debug!("[{board}] Selected recovery image: {:#?}", image);

        Ok(image)
    }

    /// Download `image` into `output`. The data is written to a partial file
    /// next to `output` that is reused by later attempts and only renamed to
    /// `output` when the transfer completes with the expected size.
    pub async fn download_image<L: ProgressListener>(
        &self,
        image: &RecoveryImage,
        output: &Path,
        listener: &mut L,
    ) -> Result<u64, CrosError> {
        listener.image_selected(image);

        let part_path = add_extension(output, DOWNLOAD_EXT);
        let name = image.filename().unwrap_or(&image.file);

        listener.chunk_started(0, 1, name);

        let size = download_resumable(self.transport, &image.url, &part_path, &mut *listener).await
            .map_err(|source| CrosError::DownloadFailed {
                url: image.url.clone(),
                source,
            })?;

        listener.chunk_finished(0, 1, name);

        if let Some(expected) = image.zipfilesize {
            if size != expected {
                return Err(CrosError::SizeMismatch {
                    expected,
                    actual: size,
                    path: part_path,
                });
            }
        }

        rename_atomic(&part_path, output).map_err(CrosError::io(output))?;
        listener.completed(output, size);

        info!("Wrote {size} bytes to {:?}", output);

        Ok(size)
    }

    /// Select and download the recovery image for `board`.
    pub async fn download_recovery<L: ProgressListener>(
        &self,
        board: &str,
        version: Option<&OsVersion>,
        output: &Path,
        listener: &mut L,
    ) -> Result<RecoverySummary, CrosError> {
        let image = self.select_image(board, version).await?;
        let size = self.download_image(&image, output, listener).await?;

        Ok(RecoverySummary {
            board: board.to_owned(),
            version: image.version,
            output: output.to_owned(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use crate::testutil::FakeTransport;

    use super::*;

    const DB_URL: &str = "https://recovery.test/recovery.json";
    const OLD_URL: &str = "https://recovery.test/chromeos_15359.58.0_octopus_recovery_stable-channel_mp-v28.bin.zip";
    const NEW_URL: &str = "https://recovery.test/chromeos_15474.84.0_octopus_recovery_stable-channel_mp-v28.bin.zip";
    const DB: &str = r#"[
        {
            "name": "Lenovo 100e Chromebook 2nd Gen",
            "file": "chromeos_15359.58.0_octopus_recovery_stable-channel_mp-v28.bin",
            "url": "https://recovery.test/chromeos_15359.58.0_octopus_recovery_stable-channel_mp-v28.bin.zip",
            "version": "15359.58.0",
            "channel": "STABLE",
            "filesize": "2418139136",
            "zipfilesize": 6
        },
        {
            "name": "Lenovo 100e Chromebook 2nd Gen",
            "file": "chromeos_15474.84.0_octopus_recovery_stable-channel_mp-v28.bin",
            "url": "https://recovery.test/chromeos_15474.84.0_octopus_recovery_stable-channel_mp-v28.bin.zip",
            "version": "15474.84.0",
            "channel": "STABLE",
            "zipfilesize": "10"
        },
        {
            "file": "chromeos_15474.84.0_octopusfoo_recovery_stable-channel_mp.bin",
            "url": "https://recovery.test/other.bin.zip",
            "version": "99999.0.0"
        }
    ]"#;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            database_url: DB_URL.to_owned(),
            use_cache: true,
        }
    }

    fn fake_transport() -> FakeTransport {
        let transport = FakeTransport::new();
        transport.insert(DB_URL, DB);
        transport.insert(OLD_URL, "oldimg");
        transport.insert(NEW_URL, "newimage!!");
        transport
    }

    #[test]
    fn test_parse_database() {
        let db = RecoveryDatabase::parse(DB.as_bytes()).unwrap();
        assert_eq!(db.len(), 3);

        let images: Vec<_> = db.images_for_board("octopus").collect();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].filesize, Some(2418139136));
        assert_eq!(images[0].zipfilesize, Some(6));
        assert_eq!(images[1].filesize, None);
        assert_eq!(images[1].zipfilesize, Some(10));
        assert_eq!(images[1].filename(),
                   Some("chromeos_15474.84.0_octopus_recovery_stable-channel_mp-v28.bin.zip"));

        assert_matches!(RecoveryDatabase::parse(b"{}"), Err(_));
    }

    #[test]
    fn test_select() {
        let db = RecoveryDatabase::parse(DB.as_bytes()).unwrap();

        assert_eq!(db.select("octopus", None).unwrap().version, "15474.84.0");

        let version = "15359.58.0".parse().unwrap();
        assert_eq!(db.select("octopus", Some(&version)).unwrap().version, "15359.58.0");

        let version = "1.2.3".parse().unwrap();
        assert_matches!(db.select("octopus", Some(&version)),
                        Err(CrosError::VersionNotFound { board, .. }) if board == "octopus");

        assert_matches!(db.select("nissa", None), Err(CrosError::BoardNotFound(_)));
    }

    #[test]
    fn test_filename() {
        let image = |url: &str, file: &str| RecoveryImage {
            name: String::new(),
            file: file.to_owned(),
            url: url.to_owned(),
            version: String::new(),
            channel: String::new(),
            chrome_version: String::new(),
            filesize: None,
            zipfilesize: None,
        };

        assert_eq!(image("https://a.test/dir/image.bin.zip?token=abc", "image.bin").filename(),
                   Some("image.bin.zip"));

        // Falls back to the image name when the URL has no usable filename
        assert_eq!(image("https://a.test/dir/", "image.bin").filename(), Some("image.bin"));
        assert_eq!(image("https://a.test/dir/..", "image.bin").filename(), Some("image.bin"));
        assert_eq!(image("https://a.test/.?x=1", "image.bin").filename(), Some("image.bin"));
        assert_eq!(image("https://a.test/dir/", "../image.bin").filename(), None);
        assert_eq!(image("https://a.test/", "").filename(), None);
    }

    #[test]
    fn test_images_for_board_outlives_board_name() {
        let db = RecoveryDatabase::parse(DB.as_bytes()).unwrap();

        let image = {
            let board = String::from("octopus");
            db.select(&board, None).unwrap()
        };
        assert_eq!(image.version, "15474.84.0");
    }

    #[tokio::test]
    async fn test_download_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("octopus.bin.zip");
        let transport = fake_transport();
        let downloader = RecoveryDownloader::new(&transport, CacheDir::new(dir.path()), config());

        let summary = downloader.download_recovery("octopus", None, &output, &mut ()).await.unwrap();

        assert_eq!(summary.version, "15474.84.0");
        assert_eq!(summary.size, 10);
        assert_eq!(fs::read(&output).unwrap(), b"newimage!!");
        assert!(!add_extension(&output, DOWNLOAD_EXT).exists());
    }

    #[tokio::test]
    async fn test_download_recovery_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("octopus.bin.zip");
        fs::write(add_extension(&output, DOWNLOAD_EXT), b"newim").unwrap();
        let transport = fake_transport();
        let downloader = RecoveryDownloader::new(&transport, CacheDir::new(dir.path()), config());

        downloader.download_recovery("octopus", None, &output, &mut ()).await.unwrap();

        assert_eq!(transport.requests().last(), Some(&(NEW_URL.to_owned(), 5)));
        assert_eq!(fs::read(&output).unwrap(), b"newimage!!");
    }

    #[tokio::test]
    async fn test_download_recovery_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("octopus.bin.zip");
        let transport = fake_transport();
        transport.insert(NEW_URL, "short");
        let downloader = RecoveryDownloader::new(&transport, CacheDir::new(dir.path()), config());

        assert_matches!(downloader.download_recovery("octopus", None, &output, &mut ()).await,
                        Err(CrosError::SizeMismatch { expected: 10, actual: 5, .. }));
        assert!(!output.exists());
        assert!(add_extension(&output, DOWNLOAD_EXT).exists());
    }

    #[tokio::test]
    async fn test_download_recovery_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("octopus.bin.zip");
        let transport = fake_transport();
        transport.remove(NEW_URL);
        let downloader = RecoveryDownloader::new(&transport, CacheDir::new(dir.path()), config());

        assert_matches!(downloader.download_recovery("octopus", None, &output, &mut ()).await,
                        Err(CrosError::DownloadFailed { url, .. }) if url == NEW_URL);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_database_cache() {
        let dir = tempfile::tempdir().unwrap();
        let transport = fake_transport();
        let downloader = RecoveryDownloader::new(&transport, CacheDir::new(dir.path()), config());

        downloader.select_image("octopus", None).await.unwrap();
        downloader.select_image("octopus", None).await.unwrap();
        assert_eq!(transport.request_count(DB_URL), 1);

        let dir = tempfile::tempdir().unwrap();
        transport.insert(DB_URL, "[");
        let downloader = RecoveryDownloader::new(&transport, CacheDir::new(dir.path()), config());
        assert_matches!(downloader.select_image("octopus", None).await,
                        Err(CrosError::DatabaseUnavailable { source: DatabaseError::Parse(_), .. }));
    }
}
