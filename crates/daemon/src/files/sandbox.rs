//! Filesystem abstraction and the sandboxing decorator.
//!
//! [`LocalFileSystem`] talks to the real disk. [`SandboxedFileSystem`] wraps
//! any [`FileSystem`] and treats every path argument as relative to the
//! storage root: each one is resolved through the [`PathValidator`] before the
//! call is delegated. The daemon creates one sandbox around one local
//! filesystem at startup and never swaps it.

use std::fs::{self, File, Metadata, OpenOptions};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::error::TransferError;
use super::path_validator::PathValidator;

/// File and directory operations used by the transfer and RPC layers.
pub trait FileSystem: Send + Sync {
    /// Returns true if anything exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool, TransferError>;

    /// Returns true if a regular file exists at `path`.
    fn file_exists(&self, path: &Path) -> Result<bool, TransferError>;

    /// Returns true if a directory exists at `path`.
    fn directory_exists(&self, path: &Path) -> Result<bool, TransferError>;

    /// Metadata for `path`.
    fn metadata(&self, path: &Path) -> Result<Metadata, TransferError>;

    /// Open `path` for reading.
    fn open_read(&self, path: &Path) -> Result<File, TransferError>;

    /// Create or truncate `path` for writing.
    fn create_write(&self, path: &Path) -> Result<File, TransferError>;

    /// Read the whole file.
    fn read(&self, path: &Path) -> Result<Vec<u8>, TransferError>;

    /// Replace the file contents.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), TransferError>;

    /// Delete a file.
    fn delete_file(&self, path: &Path) -> Result<(), TransferError>;

    /// Copy a file, returning the number of bytes copied.
    fn copy_file(&self, from: &Path, to: &Path) -> Result<u64, TransferError>;

    /// Move a file, replacing the destination.
    fn move_file(&self, from: &Path, to: &Path) -> Result<(), TransferError>;

    /// Regular files below `dir`, optionally descending into subdirectories.
    fn enumerate_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, TransferError>;

    /// Create a directory and any missing parents.
    fn create_directory(&self, path: &Path) -> Result<(), TransferError>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> Result<bool, TransferError> {
        Ok(path.try_exists()?)
    }

    fn file_exists(&self, path: &Path) -> Result<bool, TransferError> {
        Ok(path.is_file())
    }

    fn directory_exists(&self, path: &Path) -> Result<bool, TransferError> {
        Ok(path.is_dir())
    }

    fn metadata(&self, path: &Path) -> Result<Metadata, TransferError> {
        fs::metadata(path).map_err(|e| TransferError::from_io(path, e))
    }

    fn open_read(&self, path: &Path) -> Result<File, TransferError> {
        File::open(path).map_err(|e| TransferError::from_io(path, e))
    }

    fn create_write(&self, path: &Path) -> Result<File, TransferError> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| TransferError::from_io(path, e))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, TransferError> {
        fs::read(path).map_err(|e| TransferError::from_io(path, e))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), TransferError> {
        fs::write(path, contents).map_err(|e| TransferError::from_io(path, e))
    }

    fn delete_file(&self, path: &Path) -> Result<(), TransferError> {
        fs::remove_file(path).map_err(|e| TransferError::from_io(path, e))
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<u64, TransferError> {
        fs::copy(from, to).map_err(|e| TransferError::from_io(from, e))
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), TransferError> {
        fs::rename(from, to).map_err(|e| TransferError::from_io(from, e))
    }

    fn enumerate_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, TransferError> {
        if !dir.is_dir() {
            return Err(TransferError::NotFound(dir.display().to_string()));
        }

        let mut walker = WalkDir::new(dir).min_depth(1);
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                TransferError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                )
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    fn create_directory(&self, path: &Path) -> Result<(), TransferError> {
        fs::create_dir_all(path).map_err(|e| TransferError::from_io(path, e))
    }
}

/// A [`FileSystem`] confined to a storage root.
#[derive(Debug, Clone)]
pub struct SandboxedFileSystem<F: FileSystem = LocalFileSystem> {
    validator: PathValidator,
    inner: F,
}

impl SandboxedFileSystem<LocalFileSystem> {
    /// Sandbox the local filesystem at `root`.
    pub fn local(root: impl AsRef<Path>) -> Result<Self, TransferError> {
        Ok(Self::new(PathValidator::new(root)?, LocalFileSystem))
    }
}

impl<F: FileSystem> SandboxedFileSystem<F> {
    /// Wrap `inner`, resolving every path through `validator`.
    pub fn new(validator: PathValidator, inner: F) -> Self {
        Self { validator, inner }
    }

    /// The canonical storage root.
    pub fn root(&self) -> &Path {
        self.validator.root()
    }

    /// Resolve a root-relative path string.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, TransferError> {
        self.validator.validate_path(path)
    }

    /// Absolute paths already under the root were resolved earlier and are only
    /// re-checked. Anything else is treated as root-relative caller input.
    fn resolve_path(&self, path: &Path) -> Result<PathBuf, TransferError> {
        if path.starts_with(self.validator.root()) {
            self.validator.validate_resolved(path)
        } else {
            self.validator.validate_path(&path.to_string_lossy())
        }
    }
}

impl<F: FileSystem> FileSystem for SandboxedFileSystem<F> {
    fn exists(&self, path: &Path) -> Result<bool, TransferError> {
        self.inner.exists(&self.resolve_path(path)?)
    }

    fn file_exists(&self, path: &Path) -> Result<bool, TransferError> {
        self.inner.file_exists(&self.resolve_path(path)?)
    }

    fn directory_exists(&self, path: &Path) -> Result<bool, TransferError> {
        self.inner.directory_exists(&self.resolve_path(path)?)
    }

    fn metadata(&self, path: &Path) -> Result<Metadata, TransferError> {
        self.inner.metadata(&self.resolve_path(path)?)
    }

    fn open_read(&self, path: &Path) -> Result<File, TransferError> {
        self.inner.open_read(&self.resolve_path(path)?)
    }

    fn create_write(&self, path: &Path) -> Result<File, TransferError> {
        self.inner.create_write(&self.resolve_path(path)?)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, TransferError> {
        self.inner.read(&self.resolve_path(path)?)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), TransferError> {
        self.inner.write(&self.resolve_path(path)?, contents)
    }

    fn delete_file(&self, path: &Path) -> Result<(), TransferError> {
        self.inner.delete_file(&self.resolve_path(path)?)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<u64, TransferError> {
        let from = self.resolve_path(from)?;
        let to = self.resolve_path(to)?;
        self.inner.copy_file(&from, &to)
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), TransferError> {
        let from = self.resolve_path(from)?;
        let to = self.resolve_path(to)?;
        self.inner.move_file(&from, &to)
    }

    fn enumerate_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, TransferError> {
        self.inner.enumerate_files(&self.resolve_path(dir)?, recursive)
    }

    fn create_directory(&self, path: &Path) -> Result<(), TransferError> {
        self.inner.create_directory(&self.resolve_path(path)?)
    }
}
