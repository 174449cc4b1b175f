use std::{
    env,
    fmt,
    fs::File,
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, Level, log_enabled};
use serde::{Deserialize, Serialize};
use tokio::signal::ctrl_c;

use croslib::{
    cache::CacheDir,
    manifest::{join_url, Manifest, ShimConfig},
    progress::ProgressListener,
    recovery::{RecoveryConfig, RecoveryDownloader, RecoveryImage},
    shim::ShimDownloader,
    transport::{HttpTransport, HttpTransportBuilder, DEFAULT_CONNECT_TIMEOUT},
    version::OsVersion,
};
use progresslib::{ProgressBar, ProgressDrawMode};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_RECOVERY_DB_URL: &str =
    "https://dl.google.com/dl/edgedl/chromeos/recovery/recovery2.json";
const BOARD_INDEX_NAME: &str = "boards.txt";

/// Progress listener that renders a byte progress bar on stderr. The bar is
/// created once the expected size is known. `assembling` is raised once the
/// output starts being assembled, which can't be interrupted.
#[derive(Default)]
struct BarListener {
    bar: Option<ProgressBar<Stderr>>,
    assembling: Arc<AtomicBool>,
}

impl BarListener {
    fn new(assembling: Arc<AtomicBool>) -> Self {
        Self {
            bar: None,
            assembling,
        }
    }

    fn start(&mut self, len: u64) {
        let mut bar = ProgressBar::new(stderr(), len);
        if log_enabled!(Level::Debug) {
            // The escape sequences for the interactive progress bar would
            // clobber log messages.
            bar.set_mode(Some(ProgressDrawMode::Append));
        }

        self.bar = Some(bar);
    }

    fn update(&mut self, f: impl FnOnce(&mut ProgressBar<Stderr>) -> io::Result<()>) {
        if let Some(bar) = &mut self.bar {
            if let Err(e) = f(bar) {
                debug!("Failed to draw progress bar: {e}");
            }
        }
    }
}

impl ProgressListener for BarListener {
    fn manifest_resolved(&mut self, _board: &str, manifest: &Manifest) {
        self.start(manifest.total_size);
    }

    fn image_selected(&mut self, image: &RecoveryImage) {
        self.start(image.zipfilesize.unwrap_or(0));
    }

    fn chunk_skipped(&mut self, _index: usize, _total: usize, _name: &str, size: u64) {
        self.update(|bar| bar.set_position(bar.position() + size));
    }

    fn chunk_started(&mut self, index: usize, total: usize, name: &str) {
        if total > 1 {
            self.update(|bar| bar.set_label(Some(format!("chunk {}/{total} ({name})", index + 1))));
        }
    }

    fn transfer_resumed(&mut self, offset: u64) {
        self.update(|bar| bar.set_position(bar.position() + offset));
    }

    fn bytes_received(&mut self, bytes: u64) {
        self.update(|bar| bar.advance(bytes));
    }

    fn assembling(&mut self, _output: &Path) {
        self.assembling.store(true, Ordering::SeqCst);
    }

    fn completed(&mut self, _path: &Path, _size: u64) {
        // Dropping the bar draws the final frame
        self.bar = None;
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Config {
    cache_dir: Option<PathBuf>,
    shim_base_url: Option<String>,
    index_url: Option<String>,
    recovery_db_url: Option<String>,
    ignore_tls_validation: Option<bool>,
    connect_timeout: Option<u64>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let Some(path) = user_path.or(default_path.as_deref()) else {
        return Ok(None);
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(format!("Could not open file: {path:?}")),
    };

    let config = serde_json::from_reader(file)
        .context(format!("Could not parse config file: {path:?}"))?;

    Ok(Some(config))
}

/// Pick the first value from the command line (or its environment variable)
/// and then the config file.
fn pick<T: Clone>(
    arg: Option<&T>,
    config: &Option<Config>,
    field: impl FnOnce(&Config) -> Option<&T>,
) -> Option<T> {
    arg.or_else(|| config.as_ref().and_then(field)).cloned()
}

fn cache_root(opts: &Opts, config: &Option<Config>) -> Result<PathBuf> {
    pick(opts.cache_dir.as_ref(), config, |c| c.cache_dir.as_ref())
        .or_else(|| dirs::cache_dir().map(|p| p.join(PKG_NAME)))
        .ok_or_else(|| anyhow!("No cache directory specified and no default is available"))
}

fn shim_config(
    base_url: Option<&String>,
    index_url: Option<&String>,
    config: &Option<Config>,
    use_cache: bool,
) -> Result<ShimConfig> {
    let base_url = pick(base_url, config, |c| c.shim_base_url.as_ref())
        .ok_or_else(|| anyhow!("No shim base URL argument or variable specified"))?;
    let index_url = pick(index_url, config, |c| c.index_url.as_ref())
        .unwrap_or_else(|| join_url(&base_url, BOARD_INDEX_NAME));

    Ok(ShimConfig {
        index_url,
        base_url,
        use_cache,
    })
}

fn recovery_config(
    database_url: Option<&String>,
    config: &Option<Config>,
    use_cache: bool,
) -> RecoveryConfig {
    RecoveryConfig {
        database_url: pick(database_url, config, |c| c.recovery_db_url.as_ref())
            .unwrap_or_else(|| DEFAULT_RECOVERY_DB_URL.to_owned()),
        use_cache,
    }
}

fn build_transport(opts: &Opts, config: &Option<Config>) -> Result<HttpTransport> {
    let ignore_tls_validation = opts.ignore_tls_validation
        || config.as_ref().and_then(|c| c.ignore_tls_validation).unwrap_or(false);
    let connect_timeout = pick(opts.connect_timeout.as_ref(), config, |c| c.connect_timeout.as_ref())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    HttpTransportBuilder::new()
        .ignore_tls_validation(ignore_tls_validation)
        .connect_timeout(connect_timeout)
        .build()
        .context("Could not initialize HTTP client")
}

/// Returns false if the output exists and may not be overwritten.
fn check_output(output: &Path, force: bool) -> bool {
    if output.exists() && !force {
        eprintln!("{output:?} already exists. Use -f/--force to overwrite.");
        return false;
    }

    true
}

async fn run_shim(
    opts: &Opts,
    transport: &HttpTransport,
    cache: CacheDir,
    shim_config: ShimConfig,
    board: &str,
    assembling: Arc<AtomicBool>,
) -> Result<()> {
    let downloader = ShimDownloader::new(transport, cache, shim_config);

    debug!("Resolving manifest for board '{board}'");

    let manifest = downloader.resolver().resolve(board).await
        .context("Failed to query shim information")?;

    println!("Shim info:");
    println!("- Board: {board}");
    println!("- Location: {}", manifest.location);
    println!("- Chunks: {}", manifest.chunks.len());
    println!("- Size: {} bytes", manifest.total_size);

    let output = opts.output.clone()
        .unwrap_or_else(|| PathBuf::from(format!("{board}_shim.bin")));
    debug!("Output path: {output:?}");

    if !check_output(&output, opts.force) {
        return Ok(());
    }

    let mut listener = BarListener::new(assembling);
    let summary = downloader.download_resolved(board, manifest, &output, &mut listener).await
        .context(format!("Failed to download shim for board '{board}'"))?;

    println!("Wrote {} bytes to {:?} ({} chunks downloaded, {} already present)",
             summary.size, summary.output, summary.chunks.downloaded, summary.chunks.skipped);

    Ok(())
}

async fn run_recovery(
    opts: &Opts,
    transport: &HttpTransport,
    cache: CacheDir,
    recovery_config: RecoveryConfig,
    board: &str,
    version: Option<&OsVersion>,
    list: bool,
) -> Result<()> {
    let downloader = RecoveryDownloader::new(transport, cache, recovery_config);

    if list {
        let db = downloader.load_database().await
            .context("Failed to load recovery database")?;

        for image in db.images_for_board(board) {
            println!("{} ({}, {})", image.version, image.channel, image.file);
        }

        return Ok(());
    }

    let image = downloader.select_image(board, version).await
        .context("Failed to query recovery image information")?;

    println!("Recovery image info:");
    println!("- Name: {}", image.name);
    println!("- File: {}", image.file);
    println!("- Version: {}", image.version);
    println!("- Channel: {}", image.channel);
    println!("- Chrome version: {}", image.chrome_version);
    println!("- URL: {}", image.url);
    if let Some(size) = image.zipfilesize {
        println!("- Size: {size} bytes");
    }

    let output = match &opts.output {
        Some(p) => p.clone(),
        None => image.filename()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Could not determine an output filename. Use -o/--output."))?,
    };
    debug!("Output path: {output:?}");

    if !check_output(&output, opts.force) {
        return Ok(());
    }

    let mut listener = BarListener::default();
    let size = downloader.download_image(&image, &output, &mut listener).await
        .context(format!("Failed to download recovery image for board '{board}'"))?;

    println!("Wrote {size} bytes to {output:?}");

    Ok(())
}

async fn run(
    opts: &Opts,
    config: &Option<Config>,
    transport: &HttpTransport,
    cache: CacheDir,
    assembling: Arc<AtomicBool>,
) -> Result<()> {
    let use_cache = !opts.no_cache;

    match &opts.command {
        Command::Shim { board, base_url, index_url } => {
            let shim_config = shim_config(base_url.as_ref(), index_url.as_ref(), config, use_cache)?;

            run_shim(opts, transport, cache, shim_config, board, assembling).await
        }
        Command::Recovery { board, version, database_url, list } => {
            let recovery_config = recovery_config(database_url.as_ref(), config, use_cache);

            run_recovery(opts, transport, cache, recovery_config, board, version.as_ref(), *list).await
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download the RMA shim for a board
    ///
    /// The shim is downloaded in chunks that are staged in the cache directory.
    /// If the download is interrupted, rerunning the command only downloads
    /// the chunks that are still missing.
    Shim {
        /// Board name (eg. octopus)
        #[arg(short, long)]
        board: String,
        /// Base URL of the shim server
        ///
        /// If unspecified, the URL is loaded from the `CROSDL_SHIM_BASE_URL`
        /// environment variable, followed by the `shim_base_url` config file
        /// variable.
        #[arg(long, env = "CROSDL_SHIM_BASE_URL")]
        base_url: Option<String>,
        /// URL of the board index
        ///
        /// Defaults to `boards.txt` under the base URL.
        #[arg(long, env = "CROSDL_INDEX_URL")]
        index_url: Option<String>,
    },
    /// Download a recovery image for a board
    Recovery {
        /// Board name (eg. octopus)
        #[arg(short, long)]
        board: String,
        /// ChromeOS version (latest if unspecified)
        #[arg(short, long)]
        version: Option<OsVersion>,
        /// URL of the recovery image database
        #[arg(long, env = "CROSDL_RECOVERY_DB_URL")]
        database_url: Option<String>,
        /// List the available images instead of downloading one
        #[arg(long)]
        list: bool,
    },
}

/// A simple tool for downloading ChromeOS recovery images and RMA shims.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    #[command(subcommand)]
    command: Command,
    /// Output path
    ///
    /// By default, shims are written to `<board>_shim.bin` and recovery images
    /// use the filename from the download URL.
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,
    /// Allow overwriting the output file if it exists
    #[arg(short, long, global = true)]
    force: bool,
    /// Set logging verbosity
    ///
    /// This option overrides the RUST_LOG environment variable, which would
    /// otherwise be respected if this option was not passed.
    #[arg(value_enum, long, global = true)]
    loglevel: Option<LogLevel>,
    /// Cache directory for metadata and staged chunks
    #[arg(long, global = true, env = "CROSDL_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Always fetch the board index, manifests, and database
    ///
    /// Staged chunks are still reused.
    #[arg(long, global = true)]
    no_cache: bool,
    /// Ignore TLS validation for HTTPS connections
    #[arg(long, global = true)]
    ignore_tls_validation: bool,
    /// Connection timeout in seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    connect_timeout: Option<u64>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},croslib={l}"));
    }

    env_logger::init();

    debug!("Arguments: {:#?}", opts);

    let config = load_config_file(opts.config.as_deref())?;
    debug!("Config: {:#?}", config);

    let transport = build_transport(&opts, &config)?;
    let cache = CacheDir::new(cache_root(&opts, &config)?);

    debug!("Cache directory: {:?}", cache.root());

    let assembling = Arc::new(AtomicBool::new(false));
    let task = run(&opts, &config, &transport, cache, assembling.clone());
    tokio::pin!(task);

    loop {
        tokio::select! {
            c = ctrl_c() => {
                c.context("Could not listen for interrupt signal")?;

                if !assembling.load(Ordering::SeqCst) {
                    return Err(anyhow!("Download was interrupted. To resume, rerun the current command."));
                }

                // The blocking assembly task would keep running anyway
                eprintln!("All chunks are downloaded. Waiting for the output to be assembled...");
            }
            r = &mut task => return r,
        }
    }
}
