//! Path and content helpers for change-set entries.

use std::path::Path;

use sha2::{Digest, Sha256};

const LANGUAGE_BY_EXTENSION: &[(&str, &str)] = &[
    (".py", "python"),
    (".java", "java"),
    (".ts", "typescript"),
    (".tsx", "typescript"),
    (".js", "javascript"),
    (".jsx", "javascript"),
    (".go", "go"),
    (".rs", "rust"),
    (".kt", "kotlin"),
    (".cs", "csharp"),
];

pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// Normalize a change-set path: forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    let mut rest = normalized.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_string()
}

pub fn detect_language(path: &str) -> Option<String> {
    let path = Path::new(path);
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))?;
    LANGUAGE_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext.as_str())
        .map(|(_, lang)| lang.to_string())
}

/// Language tag for a path, falling back to `"unknown"`. The unified AST is
/// language-agnostic, so unknown extensions are still indexed.
pub fn language_or_unknown(path: &str) -> String {
    detect_language(path).unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string())
}

pub fn compute_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("src/a.py").as_deref(), Some("python"));
        assert_eq!(detect_language("web/App.TSX").as_deref(), Some("typescript"));
        assert_eq!(detect_language("README"), None);
        assert_eq!(language_or_unknown("notes.txt"), "unknown");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./pkg\\mod.py"), "pkg/mod.py");
        assert_eq!(normalize_path("././a.py"), "a.py");
    }

    #[test]
    fn test_content_hash_is_sha256() {
        assert_eq!(
            compute_content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(compute_content_hash(b"a"), compute_content_hash(b"b"));
    }
}
