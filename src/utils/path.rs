//! Path normalization utilities.
//!
//! - `normalize_path` - file system paths (canonicalize + fallback)
//! - `unix_slashes` - forward-slash form used for watch rule matching

use std::path::{Path, PathBuf};

/// Normalize a file system path to absolute form.
///
/// Tries `canonicalize()` first (resolves symlinks, `.`, `..`).
/// Falls back to:
/// - Return as-is if already absolute
/// - Join with current directory if relative
#[inline]
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
        }
    })
}

/// Render a path with `/` separators regardless of platform.
///
/// Watchers on Windows report both separator styles for the same file,
/// so matching always happens on this form.
pub fn unix_slashes(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_absolute() {
        let normalized = normalize_path(Path::new("/absolute/path/file.txt"));
        assert!(normalized.is_absolute());
    }

    #[test]
    fn test_normalize_path_relative() {
        let normalized = normalize_path(Path::new("relative/path/file.txt"));
        assert!(normalized.is_absolute());
    }

    #[test]
    fn test_normalize_existing_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let dotted = temp.path().join(".");
        assert_eq!(normalize_path(&dotted), normalize_path(temp.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_slashes_noop_on_unix() {
        assert_eq!(unix_slashes(Path::new("/a/b/c.rs")), "/a/b/c.rs");
    }
}
