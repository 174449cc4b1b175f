use std::{
    ffi::OsStr,
    fs,
    io,
    path::{Component, Path, PathBuf},
};

use log::{debug, warn};

/// Add an extension to a file path.
pub fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Rename a file with POSIX semantics (atomic and overwrites destination if it
/// exists). On Windows, [`std::fs::rename`] replaces the destination as well,
/// but atomicity depends on the filesystem.
pub fn rename_atomic(src: &Path, dest: &Path) -> io::Result<()> {
    debug!("Renaming {:?} to {:?}", src, dest);
    fs::rename(src, dest)
}

/// Delete a file, but don't error out if the path doesn't exist.
pub fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Recursively delete a directory, but don't error out if the path doesn't
/// exist.
pub fn delete_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Return whether `name` can be used as a single path component without
/// escaping its parent directory.
pub fn is_plain_component(name: &str) -> bool {
    let mut components = Path::new(name).components();

    !name.is_empty()
        && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        && matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(c)), None) if c == OsStr::new(name)
        )
}

/// A file path that is deleted when dropped unless it is explicitly persisted
/// or kept.
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
    armed: bool,
}

impl TempPath {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the file to `dest`. If the rename fails, the temporary
    /// file is still deleted when `self` is dropped.
    pub fn persist(mut self, dest: &Path) -> io::Result<()> {
        rename_atomic(&self.path, dest)?;
        self.armed = false;
        Ok(())
    }

    /// Leave the file on disk and return its path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = delete_if_exists(&self.path) {
                warn!("Failed to delete temporary file {:?}: {}", self.path, e);
            }
        }
    }
}
