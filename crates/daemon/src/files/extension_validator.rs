//! Extension allow-list enforcement.

use super::error::TransferError;

/// Placeholder reported when a rejected file has no extension.
const NO_EXTENSION: &str = "(none)";

/// Checks file names against an optional extension allow-list.
///
/// `None` accepts every file, including files without an extension. An empty
/// list rejects everything. Matching is case-insensitive and only looks at the
/// final extension.
#[derive(Debug, Clone, Default)]
pub struct ExtensionValidator {
    allowed: Option<Vec<String>>,
}

impl ExtensionValidator {
    /// Create a validator from the configured allow-list.
    pub fn new(allowed: Option<&[String]>) -> Self {
        let allowed = allowed.map(|list| {
            list.iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .collect()
        });
        Self { allowed }
    }

    /// The normalized allow-list, if any.
    pub fn allowed(&self) -> Option<&[String]> {
        self.allowed.as_deref()
    }

    /// Validate the final extension of `filename`.
    pub fn validate_extension(&self, filename: &str) -> Result<(), TransferError> {
        let Some(allowed) = &self.allowed else {
            return Ok(());
        };

        match final_extension(filename) {
            Some(ext) if allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)) => Ok(()),
            Some(ext) => Err(TransferError::ExtensionNotAllowed {
                extension: ext.to_string(),
            }),
            None => Err(TransferError::ExtensionNotAllowed {
                extension: NO_EXTENSION.to_string(),
            }),
        }
    }
}

/// Text after the last `.` of the final path segment, if non-empty.
fn final_extension(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rfind('.') {
        // A leading dot marks a hidden file, not an extension.
        Some(0) | None => None,
        Some(idx) if idx + 1 == name.len() => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_none_allows_everything() {
        let validator = ExtensionValidator::new(None);
        assert!(validator.validate_extension("a.exe").is_ok());
        assert!(validator.validate_extension("Makefile").is_ok());
        assert!(validator.validate_extension(".bashrc").is_ok());
    }

    #[test]
    fn test_case_insensitive_match() {
        let allowed = list(&["txt", "LOG"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        assert!(validator.validate_extension("notes.TXT").is_ok());
        assert!(validator.validate_extension("server.log").is_ok());
        assert!(validator.validate_extension("dir/nested/app.Log").is_ok());
    }

    #[test]
    fn test_leading_dot_in_config_is_ignored() {
        let allowed = list(&[".csv"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        assert!(validator.validate_extension("data.csv").is_ok());
    }

    #[test]
    fn test_multi_dot_checks_final_extension_only() {
        let allowed = list(&["gz"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        assert!(validator.validate_extension("archive.tar.gz").is_ok());

        let allowed = list(&["tar"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        match validator.validate_extension("archive.tar.gz") {
            Err(TransferError::ExtensionNotAllowed { extension }) => assert_eq!(extension, "gz"),
            other => panic!("Expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_no_extension_rejected_with_list() {
        let allowed = list(&["txt"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        assert!(validator.validate_extension("Makefile").is_err());
        assert!(validator.validate_extension("trailing.").is_err());
        assert!(validator.validate_extension(".hidden").is_err());
    }

    #[test]
    fn test_empty_list_rejects_everything() {
        let validator = ExtensionValidator::new(Some(Vec::new().as_slice()));
        assert!(validator.validate_extension("a.txt").is_err());
        assert!(validator.validate_extension("noext").is_err());
    }

    #[test]
    fn test_rejection_names_extension() {
        let allowed = list(&["txt"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        let err = validator.validate_extension("payload.EXE").unwrap_err();
        assert!(err.to_string().contains("EXE"));
    }

    #[test]
    fn test_dot_in_directory_name_is_not_an_extension() {
        let allowed = list(&["txt"]);
        let validator = ExtensionValidator::new(Some(allowed.as_slice()));
        assert!(validator.validate_extension("v1.2/README").is_err());
        assert!(validator.validate_extension("v1.2\\notes.txt").is_ok());
    }
}
