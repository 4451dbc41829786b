//! Filesystem utilities.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

/// A file modification time in nanoseconds since the epoch.
///
/// A missing file and a zero-length file both read as [`Mtime::MISSING`],
/// which guarantees that a truncated output is rebuilt. [`Mtime::MAX`] is the
/// forced-rebuild sentinel used when cached dependency state is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mtime(pub u64);

impl Mtime {
    pub const MISSING: Mtime = Mtime(0);
    pub const MAX: Mtime = Mtime(u64::MAX);

    pub fn is_missing(self) -> bool {
        self == Mtime::MISSING
    }
}

impl fmt::Display for Mtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Mtime::MAX {
            write!(f, "+inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Sample the modification time of a file.
///
/// Missing files and zero-length files report [`Mtime::MISSING`].
pub fn mtime_of(path: &Path) -> Mtime {
    let Ok(meta) = fs::metadata(path) else {
        return Mtime::MISSING;
    };
    if meta.is_file() && meta.len() == 0 {
        return Mtime::MISSING;
    }
    let Ok(modified) = meta.modified() else {
        return Mtime::MISSING;
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => Mtime(d.as_nanos().min(u64::MAX as u128) as u64),
        Err(_) => Mtime::MISSING,
    }
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

/// Read a file to string, with nice error messages.
pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read file: {}", path.display()))
}

/// Write a string to a file, creating parent directories if needed.
pub fn write_string(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write file: {}", path.display()))
}

/// Atomically replace `path` with `contents` via write-temp-then-rename.
///
/// The temporary lives in the destination directory so the rename never
/// crosses a filesystem boundary.
pub fn atomic_replace(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    ensure_dir(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Copy a file verbatim, preserving the execute bit.
pub fn copy_preserving_exec(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(src)?.permissions().mode();
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set permissions on {}", dst.display()))?;
    }
    Ok(())
}

/// Get the relative path from `base` to `path`.
pub fn relative_path(base: &Path, path: &Path) -> PathBuf {
    pathdiff::diff_paths(path, base).unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mtime_missing_and_empty() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(mtime_of(&missing).is_missing());

        let empty = tmp.path().join("empty");
        fs::write(&empty, "").unwrap();
        assert!(mtime_of(&empty).is_missing());

        let real = tmp.path().join("real");
        fs::write(&real, "x").unwrap();
        assert!(!mtime_of(&real).is_missing());
    }

    #[test]
    fn test_atomic_replace_overwrites() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sub").join("file");

        atomic_replace(&path, "one").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one");

        atomic_replace(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserving_exec() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("tool");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        let dst = tmp.path().join("bin").join("tool");
        copy_preserving_exec(&src, &dst).unwrap();

        let mode = fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
