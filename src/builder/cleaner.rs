//! Stale-output pruning.
//!
//! After the statements are loaded, every file under the output roots that
//! no File object points at — and that is not a declared companion of a
//! known output — is deleted, and emptied directories are removed
//! bottom-up. The deps mirror is pruned the same way against known built
//! files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::builder::depcache::DEPS_DIR;
use crate::builder::graph::Engine;
use crate::builder::loader::{DIST_DIR, OBJ_DIR, PRIV_DIR};

/// Remove unwanted files under `obj`, `priv`, `dist`, and the deps mirror.
/// Returns the number of files removed.
pub fn clean_stale(engine: &Engine) -> Result<usize> {
    let wanted = wanted_paths(engine);
    let mut removed = 0;

    for root in [OBJ_DIR, PRIV_DIR, DIST_DIR] {
        removed += prune(&engine.build_dir, Path::new(root), |rel| {
            wanted.contains(rel)
        })?;
    }
    removed += prune(&engine.build_dir, Path::new(DEPS_DIR), |rel| {
        let target = rel.strip_prefix(DEPS_DIR).unwrap_or(rel);
        engine
            .lookup_file(target)
            .is_some_and(|f| engine.file(f).built)
    })?;

    if removed > 0 {
        tracing::info!("removed {removed} stale output file(s)");
    }
    Ok(removed)
}

/// Every known file path plus the companion paths its rule may leave
/// beside a primary output (the first declared extension is the primary).
fn wanted_paths(engine: &Engine) -> HashSet<PathBuf> {
    let mut wanted = HashSet::new();
    for f in engine.file_ids() {
        let path = &engine.file(f).path;
        wanted.insert(path.clone());

        let text = path.to_string_lossy();
        for rule in engine.opts.rules() {
            let primary = &rule.output_exts[0];
            if rule.output_exts.len() < 2 || !text.ends_with(primary.as_str()) {
                continue;
            }
            let stem = &text[..text.len() - primary.len()];
            for companion in rule.companion_exts() {
                wanted.insert(PathBuf::from(format!("{stem}{companion}")));
            }
        }
    }
    wanted
}

fn prune(
    build_dir: &Path,
    root: &Path,
    keep: impl Fn(&Path) -> bool,
) -> Result<usize> {
    let abs_root = build_dir.join(root);
    if !abs_root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    // contents_first so files go before their directories and empty
    // directories can be removed on the way up.
    for entry in WalkDir::new(&abs_root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let rel = entry
            .path()
            .strip_prefix(build_dir)
            .expect("walk outside build dir")
            .to_path_buf();
        if entry.file_type().is_dir() {
            let _ = std::fs::remove_dir(entry.path());
            continue;
        }
        if keep(&rel) {
            continue;
        }
        tracing::debug!("removing stale {}", rel.display());
        std::fs::remove_file(entry.path())
            .with_context(|| format!("failed to remove {}", rel.display()))?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::depcache::DepCache;
    use crate::builder::graph::FileKind;
    use crate::core::error::Origin;
    use crate::core::node::{Privacy, ROOT};
    use crate::core::options::Options;
    use tempfile::TempDir;

    fn engine_with_output(tmp: &TempDir) -> Engine {
        let opts = Options::parse(
            ".c .obj .obj.d = gcc -c ${INPUT} -o ${OUTPUT} -MMD -MF ${DEPS}\n",
        )
        .unwrap();
        let cache = DepCache::load(tmp.path()).unwrap();
        let mut e = Engine::new(tmp.path().to_path_buf(), opts, cache).unwrap();
        e.create_file(
            ROOT,
            "x.obj",
            PathBuf::from("obj/x.obj"),
            Privacy::Public,
            FileKind::Built,
            true,
            0,
            Origin::none(),
        )
        .unwrap();
        e
    }

    fn touch(tmp: &TempDir, rel: &str) {
        let path = tmp.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    #[test]
    fn test_stale_files_removed_known_kept() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp, "obj/x.obj");
        touch(&tmp, "obj/old.obj");
        touch(&tmp, "obj/gone/deep.obj");

        let e = engine_with_output(&tmp);
        let removed = clean_stale(&e).unwrap();

        assert_eq!(removed, 2);
        assert!(tmp.path().join("obj/x.obj").exists());
        assert!(!tmp.path().join("obj/old.obj").exists());
        // Emptied directories go too.
        assert!(!tmp.path().join("obj/gone").exists());
    }

    #[test]
    fn test_companions_kept() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp, "obj/x.obj");
        touch(&tmp, "obj/x.obj.d");

        let e = engine_with_output(&tmp);
        clean_stale(&e).unwrap();

        assert!(tmp.path().join("obj/x.obj.d").exists());
    }

    #[test]
    fn test_deps_mirror_pruned() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp, "deps/obj/x.obj");
        touch(&tmp, "deps/obj/old.obj");

        let e = engine_with_output(&tmp);
        clean_stale(&e).unwrap();

        assert!(tmp.path().join("deps/obj/x.obj").exists());
        assert!(!tmp.path().join("deps/obj/old.obj").exists());
    }
}
