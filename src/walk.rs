//! Repository walker shared by the corpus builder and the embedding generator.
//!
//! Traversal is depth-first and sorted by file name, so the order of the
//! returned files is stable across runs and platforms.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::models::SourceFile;

/// Which files a walk yields.
#[derive(Debug, Clone, Default)]
pub struct WalkFilter {
    /// Allowed extensions (with or without the leading dot, any case).
    /// Empty means every extension.
    pub extensions: Vec<String>,
    /// Directory names pruned at any depth.
    pub skip_dirs: Vec<String>,
    /// File names skipped at any depth.
    pub skip_files: Vec<String>,
    /// Glob patterns matched against the relative path.
    pub exclude_globs: Vec<String>,
    /// Absolute paths never yielded or descended into (e.g. the output of the run itself).
    pub exclude_paths: Vec<PathBuf>,
}

pub fn scan_sources(root: &Path, filter: &WalkFilter) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Source root does not exist: {}", root.display());
    }

    let extensions: Vec<String> = filter
        .extensions
        .iter()
        .map(|e| normalize_extension(e))
        .collect();
    let exclude_set = build_globset(&filter.exclude_globs)?;
    let excluded: Vec<PathBuf> = filter
        .exclude_paths
        .iter()
        .map(|p| absolute(p))
        .collect();

    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_pruned(entry, filter, &excluded));

    for entry in walker {
        // Unreadable entries are logged and left out; the walk goes on.
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                tracing::warn!(path = %path, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = to_slash(relative);

        if exclude_set.is_match(&rel_str) {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().to_string();
        let extension = extension_of(path);

        if !extensions.is_empty() && !extensions.contains(&extension) {
            continue;
        }

        files.push(SourceFile {
            path: path.to_path_buf(),
            relative_path: rel_str,
            file_name,
            extension,
        });
    }

    Ok(files)
}

fn is_pruned(entry: &DirEntry, filter: &WalkFilter, excluded: &[PathBuf]) -> bool {
    // The root itself is never pruned.
    if entry.depth() == 0 {
        return false;
    }

    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        if filter.skip_dirs.iter().any(|d| d == name.as_ref()) {
            return true;
        }
    } else if filter.skip_files.iter().any(|f| f == name.as_ref()) {
        return true;
    }

    if excluded.is_empty() {
        return false;
    }
    let path = absolute(entry.path());
    excluded.iter().any(|p| *p == path)
}

/// `".CS"`, `"cs"` and `".cs"` all normalize to `".cs"`.
pub fn normalize_extension(ext: &str) -> String {
    let lower = ext.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("src/a.cs"), "A").unwrap();
        fs::write(root.join("src/nested/B.CS"), "B").unwrap();
        fs::write(root.join("src/readme.txt"), "R").unwrap();
        fs::write(root.join("bin/out.cs"), "O").unwrap();
        fs::write(root.join(".git/HEAD"), "ref").unwrap();
        fs::write(root.join("appsettings.json"), "{}").unwrap();
        tmp
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        let tmp = tree();
        let filter = WalkFilter {
            extensions: vec![".cs".into()],
            ..Default::default()
        };
        let files = scan_sources(tmp.path(), &filter).unwrap();
        let rels: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["bin/out.cs", "src/a.cs", "src/nested/B.CS"]);
        assert_eq!(files[2].extension, ".cs");
        assert_eq!(files[2].file_name, "B.CS");
    }

    #[test]
    fn prunes_dirs_and_skips_files() {
        let tmp = tree();
        let filter = WalkFilter {
            skip_dirs: vec!["bin".into(), ".git".into()],
            skip_files: vec!["appsettings.json".into()],
            ..Default::default()
        };
        let files = scan_sources(tmp.path(), &filter).unwrap();
        let rels: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["src/a.cs", "src/nested/B.CS", "src/readme.txt"]);
    }

    #[test]
    fn exclude_globs_and_paths() {
        let tmp = tree();
        let filter = WalkFilter {
            exclude_globs: vec!["**/nested/**".into()],
            exclude_paths: vec![tmp.path().join("src/readme.txt"), tmp.path().join("bin")],
            skip_dirs: vec![".git".into()],
            ..Default::default()
        };
        let files = scan_sources(tmp.path(), &filter).unwrap();
        let rels: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["appsettings.json", "src/a.cs"]);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_does_not_abort_walk() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("hidden.cs"), "H").unwrap();
        fs::write(tmp.path().join("open.cs"), "O").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let result = scan_sources(tmp.path(), &WalkFilter::default());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let files = result.unwrap();
        assert!(files.iter().any(|f| f.relative_path == "open.cs"));
    }

    #[test]
    fn missing_root_fails() {
        let err = scan_sources(Path::new("/definitely/not/here"), &WalkFilter::default());
        assert!(err.is_err());
    }

    #[test]
    fn normalize_extension_variants() {
        assert_eq!(normalize_extension("CS"), ".cs");
        assert_eq!(normalize_extension(".Xaml"), ".xaml");
        assert_eq!(normalize_extension(" .config "), ".config");
    }
}
