use std::path::{Path, PathBuf};

/// Anchors a relative path to the directory the agent was launched from.
/// Paths that are already absolute, or a process whose working directory is
/// gone, pass through untouched.
pub fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(launch_dir) => launch_dir.join(path),
        Err(_) => path,
    }
}

/// Copies `source` into `dest`, recursing into directories.  `dest` is
/// created if needed; existing files are overwritten.
pub fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}
