//! Resolution of caller-supplied paths against the storage root.
//!
//! Paths arrive relative to the storage root with either separator. Transports
//! decode their own framing (HTTP query strings are decoded once by the query
//! extractor), so percent sequences left in a path are part of the name and are
//! kept literally. A path whose percent-decoded form would climb above the
//! root is still rejected. Resolution is lexical and checked against the
//! canonical root. A `..` that would climb above the root is rejected
//! wherever it appears; a path that descends and comes back (`a/../b`) is fine.

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

use super::error::TransferError;

/// Validates paths against a fixed storage root.
#[derive(Debug, Clone)]
pub struct PathValidator {
    /// Canonical storage root.
    root: PathBuf,
}

impl PathValidator {
    /// Create a validator for `root`. The root must already exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, TransferError> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| TransferError::from_io(root, e))?;
        Ok(Self { root })
    }

    /// The canonical storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` to an absolute path inside the storage root.
    ///
    /// `path` is taken as already decoded; `%XX` sequences stay in the name.
    pub fn validate_path(&self, path: &str) -> Result<PathBuf, TransferError> {
        if path.trim().is_empty() {
            return Err(TransferError::InvalidArgument(
                "path must not be empty".to_string(),
            ));
        }
        reject_encoded_escape(path)?;

        let unified = path.replace('\\', "/");
        let segments = normalize_segments(&unified).ok_or_else(|| TransferError::PathTraversal {
            path: path.to_string(),
        })?;

        let mut resolved = self.root.clone();
        for segment in &segments {
            resolved.push(segment);
        }

        self.ensure_within_root(&resolved, path)?;
        Ok(resolved)
    }

    /// Re-check an absolute path that already lies under the root.
    ///
    /// Used for paths produced by [`validate_path`](Self::validate_path), so no
    /// percent-decoding is applied a second time.
    pub fn validate_resolved(&self, path: &Path) -> Result<PathBuf, TransferError> {
        let original = path.display().to_string();
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| TransferError::PathTraversal {
                path: original.clone(),
            })?;

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                Component::ParentDir if resolved != self.root => {
                    resolved.pop();
                }
                _ => return Err(TransferError::PathTraversal { path: original }),
            }
        }

        self.ensure_within_root(&resolved, &original)?;
        Ok(resolved)
    }

    /// Rejects resolved paths whose nearest existing ancestor escapes the root
    /// through a symlink.
    fn ensure_within_root(&self, resolved: &Path, original: &str) -> Result<(), TransferError> {
        let mut cursor = Some(resolved);
        while let Some(candidate) = cursor {
            if candidate.symlink_metadata().is_ok() {
                let canonical = match candidate.canonicalize() {
                    Ok(canonical) => canonical,
                    // A dangling symlink cannot be followed anywhere.
                    Err(_) => {
                        return Err(TransferError::PathTraversal {
                            path: original.to_string(),
                        })
                    }
                };
                if canonical.starts_with(&self.root) {
                    return Ok(());
                }
                return Err(TransferError::PathTraversal {
                    path: original.to_string(),
                });
            }
            cursor = candidate.parent();
        }

        Err(TransferError::PathTraversal {
            path: original.to_string(),
        })
    }
}

/// Rejects paths that would escape or smuggle a NUL once percent-decoded.
///
/// Nothing is resolved from the decoded form; it is only inspected.
fn reject_encoded_escape(path: &str) -> Result<(), TransferError> {
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    if decoded.contains('\0') {
        return Err(TransferError::InvalidArgument(
            "path contains a NUL byte".to_string(),
        ));
    }
    if normalize_segments(&decoded.replace('\\', "/")).is_none() {
        return Err(TransferError::PathTraversal {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Lexically normalizes a `/`-separated path. Returns `None` if a `..` climbs
/// above the start.
fn normalize_segments(path: &str) -> Option<Vec<&str>> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            // Drive prefixes would make `PathBuf::push` replace the root.
            s if s.contains(':') && cfg!(windows) => return None,
            s => segments.push(s),
        }
    }
    Some(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn validator() -> (TempDir, PathValidator) {
        let temp_dir = TempDir::new().unwrap();
        let validator = PathValidator::new(temp_dir.path()).unwrap();
        (temp_dir, validator)
    }

    #[test]
    fn test_empty_path_is_invalid_argument() {
        let (_dir, validator) = validator();
        assert!(matches!(
            validator.validate_path(""),
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(matches!(
            validator.validate_path("   "),
            Err(TransferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_root_aliases_resolve_to_root() {
        let (_dir, validator) = validator();
        assert_eq!(validator.validate_path("/").unwrap(), validator.root());
        assert_eq!(validator.validate_path("\\").unwrap(), validator.root());
    }

    #[test]
    fn test_simple_relative_path() {
        let (_dir, validator) = validator();
        let resolved = validator.validate_path("docs/readme.txt").unwrap();
        assert_eq!(resolved, validator.root().join("docs").join("readme.txt"));
    }

    #[test]
    fn test_leading_separator_is_root_relative() {
        let (_dir, validator) = validator();
        let resolved = validator.validate_path("/docs/readme.txt").unwrap();
        assert_eq!(resolved, validator.root().join("docs").join("readme.txt"));
    }

    #[test]
    fn test_backslash_separators() {
        let (_dir, validator) = validator();
        let resolved = validator.validate_path("docs\\nested\\file.txt").unwrap();
        assert_eq!(
            resolved,
            validator.root().join("docs").join("nested").join("file.txt")
        );
    }

    #[test]
    fn test_visit_and_return_is_valid() {
        let (_dir, validator) = validator();
        let resolved = validator.validate_path("a/../b").unwrap();
        assert_eq!(resolved, validator.root().join("b"));

        let resolved = validator.validate_path("a/b/../../c/./d").unwrap();
        assert_eq!(resolved, validator.root().join("c").join("d"));
    }

    #[test]
    fn test_traversal_variants_are_rejected() {
        let (_dir, validator) = validator();
        let attempts = [
            "..",
            "../etc/passwd",
            "../../../etc/passwd",
            "docs/../../secret",
            "a/b/../../../x",
            "..\\..\\windows\\system32",
            "docs\\..\\..\\secret",
            "%2e%2e%2fetc%2fpasswd",
            "%2E%2E/secret",
            "docs/%2e%2e/%2e%2e/secret",
            "..%5c..%5csecret",
            "/../outside",
        ];

        for attempt in attempts {
            match validator.validate_path(attempt) {
                Err(TransferError::PathTraversal { path }) => assert_eq!(path, attempt),
                other => panic!("Expected traversal error for {attempt:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_traversal_error_message() {
        let (_dir, validator) = validator();
        let err = validator.validate_path("../x").unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_percent_sequences_stay_in_the_name() {
        let (_dir, validator) = validator();
        let resolved = validator.validate_path("a%41.txt").unwrap();
        assert_eq!(resolved, validator.root().join("a%41.txt"));

        let resolved = validator.validate_path("dir/my%20file.txt").unwrap();
        assert_eq!(resolved, validator.root().join("dir").join("my%20file.txt"));
    }

    #[test]
    fn test_nul_byte_rejected() {
        let (_dir, validator) = validator();
        assert!(matches!(
            validator.validate_path("a%00b"),
            Err(TransferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_resolved_accepts_paths_under_root() {
        let (_dir, validator) = validator();
        let inside = validator.root().join("a").join("100%41.txt");
        assert_eq!(validator.validate_resolved(&inside).unwrap(), inside);
    }

    #[test]
    fn test_validate_resolved_rejects_escapes() {
        let (_dir, validator) = validator();
        let escaping = validator.root().join("..").join("..").join("etc");
        assert!(matches!(
            validator.validate_resolved(&escaping),
            Err(TransferError::PathTraversal { .. })
        ));

        let elsewhere = TempDir::new().unwrap();
        assert!(matches!(
            validator.validate_resolved(elsewhere.path()),
            Err(TransferError::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = PathValidator::new(temp_dir.path().join("missing"));
        assert!(matches!(result, Err(TransferError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, validator) = validator();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        assert!(matches!(
            validator.validate_path("link/secret.txt"),
            Err(TransferError::PathTraversal { .. })
        ));
        assert!(matches!(
            validator.validate_path("link/new-file.txt"),
            Err(TransferError::PathTraversal { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_allowed() {
        let (dir, validator) = validator();
        fs::create_dir_all(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();

        assert!(validator.validate_path("alias/file.txt").is_ok());
    }
}
