//! File utility functions for listing and filtering directory entries.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// TIFF plane extensions.
pub const TIFF_EXTENSIONS: &[&str] = &["tif", "tiff"];

/// Headered raw plane extension.
pub const RAW_EXTENSIONS: &[&str] = &["raw"];

/// Returns true if `path` has one of `extensions` (case-insensitive).
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Returns paths to all files in a directory matching the given extensions,
/// sorted by path. Extensions are matched case-insensitively.
pub fn files_with_extensions(dir: &Path, extensions: &[&str]) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.is_file() && has_extension(path, extensions))
        .collect();
    files.sort();
    Ok(files)
}

/// Returns the immediate subdirectories of `dir`, sorted by path.
pub fn subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Final path component as UTF-8, if any.
pub fn file_name_str(path: &Path) -> Option<&str> {
    path.file_name().and_then(|s| s.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_extension_ignores_case() {
        assert!(has_extension(Path::new("a/000010.TIF"), TIFF_EXTENSIONS));
        assert!(has_extension(Path::new("a/000010.raw"), RAW_EXTENSIONS));
        assert!(!has_extension(Path::new("a/000010"), RAW_EXTENSIONS));
        assert!(!has_extension(Path::new("a/notes.txt"), TIFF_EXTENSIONS));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let result = files_with_extensions(Path::new("/nonexistent/flatalign"), RAW_EXTENSIONS);
        assert!(result.is_err());
    }
}
