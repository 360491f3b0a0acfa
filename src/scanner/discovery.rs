use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Walker over a root. Symlinks are not followed, entries come back in
/// name order so partial scans visit files in a stable sequence.
pub fn walker(root: &Path, skip_hidden: bool) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| !(skip_hidden && entry.depth() > 0 && is_hidden(entry)))
}

pub fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

pub fn has_tracked_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        }
        None => false,
    }
}

/// Catalog key for a file: its path relative to the root, `/`-separated on
/// every platform. `None` for paths outside the root or not valid UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_walk_finds_tracked_files_and_skips_hidden() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        File::create(dir.path().join(".hidden.jpg")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        File::create(dir.path().join(".cache/photo4.jpg")).unwrap();

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let keys: Vec<String> = walker(dir.path(), true)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| has_tracked_extension(e.path(), &extensions))
            .filter_map(|e| relative_key(dir.path(), e.path()))
            .collect();

        assert_eq!(keys, vec!["photo1.jpg", "photo2.PNG", "subdir/photo3.jpeg"]);

        let all = walker(dir.path(), false)
            .filter_map(|e| e.ok())
            .filter(|e| has_tracked_extension(e.path(), &extensions))
            .count();
        assert_eq!(all, 5);
    }

    #[test]
    fn test_relative_key() {
        let root = Path::new("/photos");
        assert_eq!(
            relative_key(root, Path::new("/photos/2024/a.jpg")).as_deref(),
            Some("2024/a.jpg")
        );
        assert_eq!(relative_key(root, Path::new("/photos")), None);
        assert_eq!(relative_key(root, Path::new("/elsewhere/a.jpg")), None);
    }
}
