//! File enumeration and existence checks exposed over RPC.
//!
//! Both operations go through the shared sandbox. Enumeration failures are
//! reported inside the response so the client always gets a `files` array.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use globset::{GlobBuilder, GlobMatcher};
use protocol::messages::{
    EnumerateFilesRequest, EnumerateFilesResponse, FileInfoEntry, FilesExistRequest,
    FilesExistResponse, RecursionMode,
};
use tracing::{debug, warn};

use super::error::TransferError;
use super::sandbox::{FileSystem, SandboxedFileSystem};
use super::transfer::is_partial_upload;

/// Pattern used when the request leaves it empty.
const MATCH_ALL: &str = "*";

/// Handles the file-related RPC requests.
pub struct FileSystemRpcHandler {
    fs: Arc<SandboxedFileSystem>,
}

impl FileSystemRpcHandler {
    pub fn new(fs: Arc<SandboxedFileSystem>) -> Self {
        Self { fs }
    }

    /// List files under `request.directory` whose names match `request.pattern`.
    pub fn enumerate_files(&self, request: &EnumerateFilesRequest) -> EnumerateFilesResponse {
        match self.try_enumerate(request) {
            Ok(files) => EnumerateFilesResponse { files, error: None },
            Err(e) => {
                if e.is_security_event() {
                    warn!(directory = %request.directory, error = %e, "Enumeration rejected");
                } else {
                    debug!(directory = %request.directory, error = %e, "Enumeration failed");
                }
                EnumerateFilesResponse {
                    files: Vec::new(),
                    error: Some(e.for_caller(&request.directory).to_string()),
                }
            }
        }
    }

    fn try_enumerate(
        &self,
        request: &EnumerateFilesRequest,
    ) -> Result<Vec<FileInfoEntry>, TransferError> {
        let pattern = match request.pattern.trim() {
            "" => MATCH_ALL.to_string(),
            p => p.replace('\\', "/"),
        };
        let matcher = build_matcher(&pattern)?;
        let match_relative_path = pattern.contains('/');
        let recursive =
            request.recursion_mode == RecursionMode::AllDirectories || pattern.contains("**");

        let directory = self.resolve_directory(&request.directory)?;
        let mut files = Vec::new();
        for path in self.fs.enumerate_files(&directory, recursive)? {
            let relative = relative_path(&directory, &path);
            let name = relative.rsplit('/').next().unwrap_or(&relative);
            if is_partial_upload(name) {
                continue;
            }

            let candidate = if match_relative_path { relative.as_str() } else { name };
            if !matcher.is_match(candidate) {
                continue;
            }

            let metadata = self.fs.metadata(&path)?;
            files.push(FileInfoEntry {
                size: metadata.len(),
                created: metadata.created().ok().and_then(unix_seconds),
                modified: metadata.modified().ok().and_then(unix_seconds),
                path: relative,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(directory = %request.directory, pattern = %pattern, count = files.len(), "Enumerated files");
        Ok(files)
    }

    /// Report which of `request.filenames` exist as files in `request.directory`.
    ///
    /// A name that resolves outside the directory is reported as absent.
    pub fn files_exist(
        &self,
        request: &FilesExistRequest,
    ) -> Result<FilesExistResponse, TransferError> {
        let directory = self
            .resolve_directory(&request.directory)
            .map_err(|e| {
                if e.is_security_event() {
                    warn!(directory = %request.directory, error = %e, "Existence check rejected");
                }
                e.for_caller(&request.directory)
            })?;

        let mut exists = HashMap::with_capacity(request.filenames.len());
        for name in &request.filenames {
            if exists.contains_key(name) {
                continue;
            }
            let present = self.file_present(&request.directory, &directory, name);
            exists.insert(name.clone(), present);
        }

        Ok(FilesExistResponse { exists })
    }

    fn file_present(&self, raw_directory: &str, directory: &Path, name: &str) -> bool {
        let resolved = match self.fs.resolve(&format!("{raw_directory}/{name}")) {
            Ok(resolved) => resolved,
            Err(e) => {
                if e.is_security_event() {
                    warn!(directory = %raw_directory, name, error = %e, "Existence check for escaping name");
                }
                return false;
            }
        };
        if !resolved.starts_with(directory) || resolved == directory {
            return false;
        }
        self.fs.file_exists(&resolved).unwrap_or(false)
    }

    /// An empty directory names the storage root.
    fn resolve_directory(&self, directory: &str) -> Result<PathBuf, TransferError> {
        if directory.trim().is_empty() {
            Ok(self.fs.root().to_path_buf())
        } else {
            self.fs.resolve(directory)
        }
    }
}

fn build_matcher(pattern: &str) -> Result<GlobMatcher, TransferError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| TransferError::InvalidArgument(format!("invalid pattern '{pattern}': {e}")))
}

fn relative_path(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn unix_seconds(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn handler() -> (TempDir, FileSystemRpcHandler) {
        let temp_dir = TempDir::new().unwrap();
        let fs = Arc::new(SandboxedFileSystem::local(temp_dir.path()).unwrap());
        (temp_dir, FileSystemRpcHandler::new(fs))
    }

    fn touch(root: &Path, relative: &str, contents: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn enumerate(
        handler: &FileSystemRpcHandler,
        directory: &str,
        pattern: &str,
        recursion_mode: RecursionMode,
    ) -> EnumerateFilesResponse {
        handler.enumerate_files(&EnumerateFilesRequest {
            directory: directory.to_string(),
            pattern: pattern.to_string(),
            recursion_mode,
        })
    }

    fn paths(response: &EnumerateFilesResponse) -> Vec<&str> {
        response.files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_top_directory_only() {
        let (dir, handler) = handler();
        touch(dir.path(), "logs/a.log", b"a");
        touch(dir.path(), "logs/b.txt", b"b");
        touch(dir.path(), "logs/nested/c.log", b"c");

        let response = enumerate(&handler, "logs", "*.log", RecursionMode::TopDirectoryOnly);
        assert!(response.error.is_none());
        assert_eq!(paths(&response), vec!["a.log"]);
    }

    #[test]
    fn test_all_directories_matches_file_names() {
        let (dir, handler) = handler();
        touch(dir.path(), "logs/a.log", b"a");
        touch(dir.path(), "logs/nested/c.log", b"c");
        touch(dir.path(), "logs/nested/deeper/d.log", b"d");
        touch(dir.path(), "logs/nested/e.txt", b"e");

        let response = enumerate(&handler, "logs", "*.log", RecursionMode::AllDirectories);
        assert_eq!(
            paths(&response),
            vec!["a.log", "nested/c.log", "nested/deeper/d.log"]
        );
    }

    #[test]
    fn test_double_star_recurses() {
        let (dir, handler) = handler();
        touch(dir.path(), "logs/a.log", b"a");
        touch(dir.path(), "logs/x/b.log", b"bb");
        touch(dir.path(), "logs/x/y/c.log", b"ccc");
        touch(dir.path(), "logs/x/y/skip.txt", b"");

        let response = enumerate(&handler, "logs", "**/*.log", RecursionMode::TopDirectoryOnly);
        assert!(response.error.is_none());
        assert_eq!(paths(&response), vec!["a.log", "x/b.log", "x/y/c.log"]);
        assert_eq!(response.files[2].size, 3);
        assert!(response.files[0].modified.is_some());
    }

    #[test]
    fn test_single_star_does_not_cross_separator() {
        let (dir, handler) = handler();
        touch(dir.path(), "src/main.rs", b"");
        touch(dir.path(), "src/bin/tool.rs", b"");

        let response = enumerate(&handler, "/", "src/*.rs", RecursionMode::AllDirectories);
        assert_eq!(paths(&response), vec!["src/main.rs"]);
    }

    #[test]
    fn test_question_mark_and_class() {
        let (dir, handler) = handler();
        touch(dir.path(), "a1.txt", b"");
        touch(dir.path(), "a2.txt", b"");
        touch(dir.path(), "ab.txt", b"");

        let response = enumerate(&handler, "", "a[0-9].txt", RecursionMode::TopDirectoryOnly);
        assert_eq!(paths(&response), vec!["a1.txt", "a2.txt"]);

        let response = enumerate(&handler, "", "a?.txt", RecursionMode::TopDirectoryOnly);
        assert_eq!(response.files.len(), 3);
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        let (dir, handler) = handler();
        touch(dir.path(), "one.txt", b"");
        touch(dir.path(), "two", b"");

        let response = enumerate(&handler, "/", "", RecursionMode::TopDirectoryOnly);
        assert_eq!(paths(&response), vec!["one.txt", "two"]);
    }

    #[test]
    fn test_no_match_is_empty_array() {
        let (dir, handler) = handler();
        touch(dir.path(), "data/file.txt", b"");

        let response = enumerate(&handler, "data", "*.csv", RecursionMode::AllDirectories);
        assert!(response.error.is_none());
        assert!(response.files.is_empty());

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""files":[]"#));
    }

    #[test]
    fn test_missing_directory_is_not_found() {
        let (_dir, handler) = handler();
        let response = enumerate(&handler, "missing", "*", RecursionMode::TopDirectoryOnly);
        assert!(response.files.is_empty());
        assert!(response.error.unwrap().contains("not found"));
    }

    #[test]
    fn test_missing_directory_error_hides_storage_root() {
        let (dir, handler) = handler();
        let response = enumerate(&handler, "missing/inner", "*", RecursionMode::TopDirectoryOnly);
        let error = response.error.unwrap();

        assert!(error.contains("missing/inner"));
        for root in [dir.path(), handler.fs.root()] {
            assert!(!error.contains(root.to_str().unwrap()), "{error}");
        }
        let root_name = dir.path().file_name().unwrap().to_str().unwrap();
        assert!(!error.contains(root_name), "{error}");
    }

    #[test]
    fn test_traversal_reported_in_response() {
        let (_dir, handler) = handler();
        let response = enumerate(&handler, "../../etc", "*", RecursionMode::AllDirectories);
        assert!(response.files.is_empty());
        assert!(response.error.unwrap().contains("traversal"));
    }

    #[test]
    fn test_invalid_pattern_reported() {
        let (_dir, handler) = handler();
        let response = enumerate(&handler, "/", "[unclosed", RecursionMode::TopDirectoryOnly);
        assert!(response.error.unwrap().contains("invalid pattern"));
    }

    #[test]
    fn test_in_flight_uploads_hidden() {
        let (dir, handler) = handler();
        touch(dir.path(), "real.txt", b"");
        touch(dir.path(), ".real.txt.0123456789abcdef.partial", b"");

        let response = enumerate(&handler, "/", "*", RecursionMode::TopDirectoryOnly);
        assert_eq!(paths(&response), vec!["real.txt"]);
    }

    #[test]
    fn test_files_exist_mixed() {
        let (dir, handler) = handler();
        touch(dir.path(), "uploads/present.txt", b"");
        fs::create_dir_all(dir.path().join("uploads/subdir")).unwrap();

        let response = handler
            .files_exist(&FilesExistRequest {
                directory: "uploads".to_string(),
                filenames: vec![
                    "present.txt".to_string(),
                    "absent.txt".to_string(),
                    "subdir".to_string(),
                    "present.txt".to_string(),
                ],
            })
            .unwrap();

        assert_eq!(response.exists.len(), 3);
        assert_eq!(response.exists["present.txt"], true);
        assert_eq!(response.exists["absent.txt"], false);
        assert_eq!(response.exists["subdir"], false);
    }

    #[test]
    fn test_files_exist_escaping_name_is_false() {
        let (dir, handler) = handler();
        touch(dir.path(), "uploads/a.txt", b"");
        touch(dir.path(), "secret.txt", b"");

        let response = handler
            .files_exist(&FilesExistRequest {
                directory: "uploads".to_string(),
                filenames: vec![
                    "../secret.txt".to_string(),
                    "../../../etc/passwd".to_string(),
                    "a.txt".to_string(),
                ],
            })
            .unwrap();

        assert_eq!(response.exists["../secret.txt"], false);
        assert_eq!(response.exists["../../../etc/passwd"], false);
        assert_eq!(response.exists["a.txt"], true);
    }

    #[test]
    fn test_files_exist_directory_traversal_is_error() {
        let (_dir, handler) = handler();
        let result = handler.files_exist(&FilesExistRequest {
            directory: "../outside".to_string(),
            filenames: vec!["x".to_string()],
        });
        assert!(matches!(result, Err(TransferError::PathTraversal { .. })));
    }

    #[test]
    fn test_files_exist_large_batches() {
        let (dir, handler) = handler();
        for i in 0..150 {
            touch(dir.path(), &format!("batch/file-{i}.bin"), b"");
        }

        let filenames: Vec<String> = (0..250).map(|i| format!("file-{i}.bin")).collect();
        let response = handler
            .files_exist(&FilesExistRequest {
                directory: "batch".to_string(),
                filenames,
            })
            .unwrap();

        assert_eq!(response.exists.len(), 250);
        assert_eq!(response.exists.values().filter(|present| **present).count(), 150);
        assert!(response.exists["file-149.bin"]);
        assert!(!response.exists["file-150.bin"]);
    }
}
