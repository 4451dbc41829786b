//! The persistent dependency cache.
//!
//! One record per built file, stored under `deps/` as a mirror of the
//! output path. Each record holds the input paths the producing tool
//! reported on its last successful run, one per line.
//!
//! The per-action `${DEPS}` temporary a tool writes lives beside the record
//! with a `.d` suffix; left-overs from an aborted run are deleted when the
//! cache is loaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::util::fs;

pub const DEPS_DIR: &str = "deps";

/// Mapping from built-file path to the ordered input paths its tool last
/// consumed. Paths are build-dir-relative.
#[derive(Debug)]
pub struct DepCache {
    dir: PathBuf,
    entries: HashMap<PathBuf, Vec<PathBuf>>,
}

impl DepCache {
    /// Sweep the cache directory, loading every record and deleting any
    /// left-over per-action `.d` temporaries.
    pub fn load(build_dir: &Path) -> Result<DepCache> {
        let dir = build_dir.join(DEPS_DIR);
        fs::ensure_dir(&dir)?;

        let mut entries = HashMap::new();
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "d") {
                std::fs::remove_file(path).with_context(|| {
                    format!("failed to remove stale deps temporary {}", path.display())
                })?;
                continue;
            }
            let rel = path
                .strip_prefix(&dir)
                .expect("cache entry outside cache dir")
                .to_path_buf();
            let text = fs::read_to_string(path)?;
            let deps = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect();
            entries.insert(rel, deps);
        }

        tracing::debug!(target: "bub::deps", "loaded {} cache entries", entries.len());
        Ok(DepCache { dir, entries })
    }

    /// The last known input set for `output`, if any.
    pub fn lookup(&self, output: &Path) -> Option<&[PathBuf]> {
        self.entries.get(output).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete the record for `output`. Used before its action re-runs so an
    /// aborted run can never present stale deps as current.
    pub fn remove(&mut self, output: &Path) -> Result<()> {
        self.entries.remove(output);
        let path = self.record_path(output);
        if path.exists() {
            tracing::debug!(target: "bub::deps", "invalidating {}", output.display());
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove cache record {}", path.display()))?;
        }
        Ok(())
    }

    /// Atomically replace the record for `output`. The output itself is
    /// filtered out of its own dependency list.
    pub fn update(&mut self, output: &Path, deps: Vec<PathBuf>) -> Result<()> {
        let deps: Vec<PathBuf> = deps.into_iter().filter(|d| d != output).collect();
        tracing::debug!(
            target: "bub::deps",
            "{} consumed {} input(s)",
            output.display(),
            deps.len()
        );
        let mut text = String::new();
        for d in &deps {
            text.push_str(&d.to_string_lossy());
            text.push('\n');
        }
        fs::atomic_replace(&self.record_path(output), &text)?;
        self.entries.insert(output.to_path_buf(), deps);
        Ok(())
    }

    /// Absolute path of the record for `output`.
    pub fn record_path(&self, output: &Path) -> PathBuf {
        self.dir.join(output)
    }

    /// Absolute path of the `${DEPS}` temporary for `output`.
    pub fn deps_temp_path(&self, output: &Path) -> PathBuf {
        let mut os = self.dir.join(output).into_os_string();
        os.push(".d");
        PathBuf::from(os)
    }
}

/// Parse a tool-emitted dependency file (Makefile-style `.d`).
///
/// Backslash continuations are joined; a `target:` prefix on a line is
/// stripped; the rest splits on whitespace. A missing file yields the empty
/// list.
pub fn parse_deps_file(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    let joined = text.replace("\\\r\n", " ").replace("\\\n", " ");

    let mut deps = Vec::new();
    for line in joined.lines() {
        let rest = match line.find(':') {
            Some(pos) => &line[pos + 1..],
            None => line,
        };
        for word in rest.split_whitespace() {
            deps.push(PathBuf::from(word));
        }
    }
    Ok(deps)
}
