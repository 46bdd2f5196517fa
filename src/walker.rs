use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;

/// A filesystem entry found below a walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute (or root-joined) path on disk
    pub path: PathBuf,
    /// Path relative to the walk root
    pub relative: PathBuf,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// Walk a directory and return every file and sub-directory below it.
/// Sorted by relative path so archive member order is OS independent; symlinks are
/// not followed.
pub fn walk_dir(root: &Path) -> Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        entries.push(WalkEntry {
            path: entry.path().to_path_buf(),
            relative,
            is_dir: entry.file_type().is_dir(),
            is_symlink: entry.path_is_symlink(),
        });
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_temp_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "world").unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.txt"), "nested").unwrap();
        dir
    }

    #[test]
    fn test_walk_finds_files_and_dirs() {
        let dir = make_temp_tree();
        let entries = walk_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries.iter().filter(|e| e.is_dir).count(), 1);
    }

    #[test]
    fn test_walk_is_sorted() {
        let dir = make_temp_tree();
        let entries = walk_dir(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.relative.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "walk_dir must return sorted paths");
        assert_eq!(names[0], PathBuf::from("a.txt"));
    }

    #[test]
    fn test_walk_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(walk_dir(dir.path()).unwrap().is_empty());
    }
}
