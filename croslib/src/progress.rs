use std::path::Path;

use crate::{
    manifest::Manifest,
    recovery::RecoveryImage,
};

/// Receiver of download progress notifications. Every method has an empty
/// default implementation so that implementors only handle what they display.
/// `()` ignores all notifications.
pub trait ProgressListener {
    /// The manifest for a shim was loaded.
    fn manifest_resolved(&mut self, _board: &str, _manifest: &Manifest) {}

    /// A recovery image was selected from the database.
    fn image_selected(&mut self, _image: &RecoveryImage) {}

    /// A chunk was already staged. `size` is the size of the staged file.
    fn chunk_skipped(&mut self, _index: usize, _total: usize, _name: &str, _size: u64) {}

    /// A chunk transfer is starting.
    fn chunk_started(&mut self, _index: usize, _total: usize, _name: &str) {}

    /// A transfer continues from a partial file that already has `offset`
    /// bytes.
    fn transfer_resumed(&mut self, _offset: u64) {}

    /// `bytes` more bytes were written to disk.
    fn bytes_received(&mut self, _bytes: u64) {}

    /// A chunk transfer completed.
    fn chunk_finished(&mut self, _index: usize, _total: usize, _name: &str) {}

    /// Every chunk is staged and the output is being assembled. This can't be
    /// interrupted once started.
    fn assembling(&mut self, _output: &Path) {}

    /// The final output file is in place.
    fn completed(&mut self, _path: &Path, _size: u64) {}
}

impl ProgressListener for () {}
