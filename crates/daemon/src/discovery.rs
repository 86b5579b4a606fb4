//! Directory discovery for tracked video files.
//!
//! Walks configured directories, filters by extension (case-insensitive,
//! including in-progress download suffixes so renames are observed), skips
//! hidden directories, and hands candidate paths to the manager for
//! registration.

use std::path::{Path, PathBuf};

/// A candidate file found during a directory walk.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Full path to the file.
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
}

/// Options for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Walk depth: 1 scans only the directory itself.
    pub max_depth: usize,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self { max_depth: 3 }
    }
}

/// Checks if a file has one of the tracked extensions (case-insensitive).
/// Extensions are given with their leading dot, e.g. `.mkv`.
pub fn is_tracked_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext_lower))
        })
        .unwrap_or(false)
}

/// Scans one directory for candidate files.
///
/// - Walks up to `max_depth` levels
/// - Skips hidden directories (names starting with `.`)
/// - Filters files by the tracked extension list
/// - Captures the size for the initial entry
pub fn scan_directory(
    root: &Path,
    options: &DiscoverOptions,
    extensions: &[String],
) -> Vec<DiscoveredFile> {
    use walkdir::WalkDir;

    let mut candidates = Vec::new();

    if !root.exists() {
        return candidates;
    }

    let walker = WalkDir::new(root)
        .max_depth(options.max_depth)
        .into_iter()
        .filter_entry(|entry| {
            // Skip hidden directories, but allow a hidden root
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') {
                        return false;
                    }
                }
            }
            true
        });

    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();

        if !entry.file_type().is_file() {
            continue;
        }

        if !is_tracked_file(path, extensions) {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            candidates.push(DiscoveredFile {
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        [".mkv", ".mp4", ".part"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_is_tracked_file() {
        let exts = exts();
        assert!(is_tracked_file(Path::new("/media/movie.mkv"), &exts));
        assert!(is_tracked_file(Path::new("/media/movie.MKV"), &exts));
        assert!(is_tracked_file(Path::new("/media/movie.mkv.part"), &exts));
        assert!(!is_tracked_file(Path::new("/media/movie.txt"), &exts));
        assert!(!is_tracked_file(Path::new("/media/movie"), &exts));
    }

    #[test]
    fn test_scan_finds_tracked_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        File::create(root.join("a.mkv")).unwrap();
        File::create(root.join("b.txt")).unwrap();
        File::create(root.join("c.mkv.part")).unwrap();

        let found = scan_directory(root, &DiscoverOptions::default(), &exts());
        let mut names: Vec<_> = found
            .iter()
            .map(|f| f.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        names.sort();

        assert_eq!(names, vec!["a.mkv", "c.mkv.part"]);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let found = scan_directory(
            Path::new("/nonexistent/root"),
            &DiscoverOptions::default(),
            &exts(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_scan_respects_max_depth() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let deep = root.join("one/two/three");
        fs::create_dir_all(&deep).unwrap();

        File::create(root.join("top.mkv")).unwrap();
        File::create(root.join("one").join("mid.mkv")).unwrap();
        File::create(deep.join("deep.mkv")).unwrap();

        let shallow = scan_directory(root, &DiscoverOptions { max_depth: 2 }, &exts());
        let names: Vec<_> = shallow
            .iter()
            .map(|f| f.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();

        assert!(names.contains(&"top.mkv".to_string()));
        assert!(names.contains(&"mid.mkv".to_string()));
        assert!(!names.contains(&"deep.mkv".to_string()));
    }

    #[test]
    fn test_scan_captures_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.mkv");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let found = scan_directory(temp.path(), &DiscoverOptions::default(), &exts());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].size_bytes, 4096);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_hidden_directories_excluded(
            visible_dir in "[a-zA-Z0-9]{1,10}",
            hidden_dir in "\\.[a-zA-Z0-9]{1,10}",
            filename in "[a-zA-Z0-9]{1,10}",
        ) {
            let temp = TempDir::new().unwrap();
            let root = temp.path();

            let visible_path = root.join(&visible_dir);
            fs::create_dir_all(&visible_path).unwrap();
            let visible_video = visible_path.join(format!("{}.mkv", filename));
            File::create(&visible_video).unwrap();

            let hidden_path = root.join(&hidden_dir);
            fs::create_dir_all(&hidden_path).unwrap();
            let hidden_video = hidden_path.join(format!("{}.mkv", filename));
            File::create(&hidden_video).unwrap();

            let found = scan_directory(root, &DiscoverOptions::default(), &exts());

            prop_assert!(found.iter().any(|f| f.path == visible_video));
            prop_assert!(!found.iter().any(|f| f.path == hidden_video));
        }

        #[test]
        fn prop_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("mp4"), Just("Mp4"), Just("part"),
                Just("txt"), Just("jpg"), Just("srt"), Just("nfo"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let tracked = is_tracked_file(&path, &exts());
            let expected = matches!(ext.to_lowercase().as_str(), "mkv" | "mp4" | "part");
            prop_assert_eq!(tracked, expected);
        }
    }
}
