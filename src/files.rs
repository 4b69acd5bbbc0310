//! Discovery of files the dashboard offers for download.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A regular file in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Short id derived from the file name; small enough for button callback data.
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Stable id for a file name within one run.
pub fn file_id(name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// List the `limit` most recently modified regular files in `dir`.
///
/// Ties on modification time are broken by name so the result (and therefore
/// the rendered dashboard) is deterministic.
pub fn list_recent(
    dir: &Path,
    limit: usize,
    include_hidden: bool,
) -> std::io::Result<Vec<FileDescriptor>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = match entry.file_name().to_str() {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !include_hidden && name.starts_with('.') {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        found.push(FileDescriptor {
            id: file_id(&name),
            path: entry.path(),
            name,
            size: meta.len(),
            modified,
        });
    }

    found.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    found.truncate(limit);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let path = dir.join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_lists_most_recent_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "old.txt", 300);
        touch(dir.path(), "newest.csv", 10);
        touch(dir.path(), "middle.log", 100);

        let files = list_recent(dir.path(), 2, false).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["newest.csv", "middle.log"]);
        assert_eq!(files[0].size, "newest.csv".len() as u64);
        assert_eq!(files[0].id, file_id("newest.csv"));
    }

    #[test]
    fn test_skips_hidden_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), ".secret", 1);
        touch(dir.path(), "visible.txt", 5);
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let files = list_recent(dir.path(), 10, false).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["visible.txt"]);

        let files = list_recent(dir.path(), 10, true).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_recent(&dir.path().join("nope"), 5, false).is_err());
    }

    #[test]
    fn test_file_id_is_stable_and_short() {
        assert_eq!(file_id("report.md"), file_id("report.md"));
        assert_ne!(file_id("report.md"), file_id("report.txt"));
        assert_eq!(file_id("anything").len(), 8);
    }
}
