use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Strip surrounding whitespace, then single and double quotes.
pub fn clean_path(p: &str) -> &str {
    p.trim().trim_matches('\'').trim_matches('"')
}

/// Regular files directly inside `dir` whose name ends with `ending`.
///
/// Entries are sorted by file name (byte-wise on Unix), so every caller sees
/// the same order on every filesystem.
pub fn list_files_with_ending(dir: &Path, ending: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if clean_path(&name).ends_with(ending) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Immediate subdirectories of `dir`, sorted by name.
pub fn list_subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

/// All regular files below `dir` at any depth, sorted by path.
pub fn list_files_recursive(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// File name of `path` as a cleaned string.
pub fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| clean_path(&n.to_string_lossy()).to_string())
        .unwrap_or_default()
}

/// Base name of a remote resource: separators normalized, last component
/// kept, one extension removed (`.nii.gz` counts as one).
pub fn resource_base_name(filename: &str) -> String {
    let normalized = filename.replace('\\', "/");
    let last = normalized.rsplit('/').next().unwrap_or_default();
    if let Some(stem) = last.strip_suffix(".nii.gz") {
        return stem.to_string();
    }
    match last.rfind('.') {
        // a leading dot marks a hidden file, not an extension
        Some(idx) if idx > 0 => last[..idx].to_string(),
        _ => last.to_string(),
    }
}

/// Create `dir` and its parents if missing.
pub fn maybe_mkdir(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
