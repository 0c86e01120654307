//! File open helpers mapping OS errors onto the engine's startup errors.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{KeelError, KeelResult};

/// Create a new read/write file; fails if it already exists.
pub(crate) fn create_new(path: &Path) -> KeelResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| map_open_error(path, e))
}

/// Open an existing read/write file.
pub(crate) fn open_existing(path: &Path) -> KeelResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| map_open_error(path, e))
}

fn map_open_error(path: &Path, err: std::io::Error) -> KeelError {
    match err.kind() {
        ErrorKind::AlreadyExists => KeelError::FileExists(path.to_path_buf()),
        ErrorKind::NotFound => KeelError::FileNotExists(path.to_path_buf()),
        ErrorKind::PermissionDenied => KeelError::FileCannotReadWrite(path.to_path_buf()),
        _ => KeelError::Io(err),
    }
}
