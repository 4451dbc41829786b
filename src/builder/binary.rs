//! Binaries: static libraries, dynamic libraries, and executables.
//!
//! A binary aggregates object files. Once those objects are up to date, its
//! link step is finalized by the one-shot augment: the cached dependencies
//! of each contained object reveal which other binaries the target really
//! uses, and those are rolled up transitively into a linker-safe library
//! list (descending creation number, so leaf libraries come last).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;

use crate::builder::graph::{is_system_path, ActionId, Engine, FileId};
use crate::core::error::{BuildError, Origin};

/// Concrete binary variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    StaticLib,
    DynamicLib,
    Exe,
}

/// Payload of a binary file.
#[derive(Debug)]
pub struct BinaryData {
    pub variant: BinaryKind,
    /// Contained source files, both compiled and interface.
    pub sources: Vec<FileId>,
    /// Contained object files (for a dynamic lib, those of its contained
    /// static libs).
    pub objects: Vec<FileId>,
    /// For a dynamic lib: the static libs it contains.
    pub contained_libs: Vec<FileId>,
    /// Explicitly required external library names.
    pub syslibs: Vec<String>,
    /// Canonical source extension the binary is built from.
    pub source_ext: Option<String>,
    /// Direct binaries discovered from contained-object dependencies.
    pub required_libs: BTreeSet<FileId>,
}

impl BinaryData {
    pub fn new(variant: BinaryKind) -> Self {
        BinaryData {
            variant,
            sources: Vec::new(),
            objects: Vec::new(),
            contained_libs: Vec::new(),
            syslibs: Vec::new(),
            source_ext: None,
            required_libs: BTreeSet::new(),
        }
    }
}

impl Engine {
    /// The subclass hook behind `issueIfReady`: finalize the target's link
    /// step once its inputs are in place. Returns false while newly
    /// discovered library dependencies are still being produced; the
    /// scheduler re-runs the hook when they complete.
    pub(crate) fn run_augment(&mut self, aid: ActionId) -> Result<bool> {
        let primary = self.primary_output(aid);
        if self.file(primary).binary().is_none() {
            return Ok(true);
        }
        self.augment_binary(aid, primary)
    }

    /// All binaries compiled into a target must share one source language.
    pub fn validate_extension(
        &mut self,
        target: FileId,
        ext: &str,
        origin: &Origin,
    ) -> Result<(), BuildError> {
        let path = self.file(target).path.display().to_string();
        let b = self
            .file_mut(target)
            .binary_mut()
            .expect("validate_extension on non-binary");
        match &b.source_ext {
            None => {
                b.source_ext = Some(ext.to_string());
                Ok(())
            }
            Some(c) if c == ext => Ok(()),
            Some(c) => Err(BuildError::config(
                origin,
                format!("{path} cannot mix {ext} sources with {c} sources"),
            )),
        }
    }

    /// The direct library requirements a target has discovered so far.
    pub fn required_libs(&self, target: FileId) -> &BTreeSet<FileId> {
        &self
            .file(target)
            .binary()
            .expect("required_libs on non-binary")
            .required_libs
    }

    fn augment_binary(&mut self, aid: ActionId, target: FileId) -> Result<bool> {
        let variant = self.file(target).binary().unwrap().variant;
        let objects = self.file(target).binary().unwrap().objects.clone();

        // Discover direct library dependencies from the cached deps of each
        // contained object. Static-lib edges are weak: they order the build
        // and carry visibility but never force the archive to rebuild.
        for obj in objects {
            let opath = self.file(obj).path.clone();
            let Some(entry) = self.cache.lookup(&opath).map(<[PathBuf]>::to_vec) else {
                continue;
            };
            for p in entry {
                if is_system_path(&p) {
                    continue;
                }
                let Some(f) = self.lookup_file(&p) else {
                    continue;
                };
                let Some(&owner) = self.content_index.get(&f) else {
                    continue;
                };
                if owner == target
                    || self.lib_container.get(&owner) == Some(&target)
                    || self.required_libs(target).contains(&owner)
                {
                    continue;
                }
                let weak = variant == BinaryKind::StaticLib;
                self.add_dependency(aid, owner, weak, false)?;
                self.file_mut(target)
                    .binary_mut()
                    .unwrap()
                    .required_libs
                    .insert(owner);
            }
        }

        // Not satisfied while any discovered library is still being built.
        for lib in self.required_libs(target).clone() {
            if let Some(pa) = self.file(lib).action {
                if !self.action(pa).completed {
                    return Ok(false);
                }
            }
        }

        if variant == BinaryKind::StaticLib {
            // Archiving links nothing; the discovered requirements are kept
            // for targets that roll this lib up later.
            return Ok(true);
        }

        let list = self.rollup_libs(aid, target)?;
        for &lib in &list {
            // Rolled-up libraries were reached through checked direct
            // edges; the ordering discipline already holds by construction.
            self.add_dependency(aid, lib, false, true)?;
        }

        let libs: Vec<PathBuf> = list.iter().map(|&l| self.file(l).path.clone()).collect();
        let flags = self.rollup_flags(target, &list);
        let a = self.action_mut(aid);
        a.libs = libs;
        a.extra_flags = flags;
        Ok(true)
    }

    /// Roll the direct static-lib requirements up transitively.
    ///
    /// A static lib contained by a dynamic lib created earlier than the
    /// target is absorbed: the dynamic lib takes its place and the
    /// requirements of everything it contains are followed instead. The
    /// result is ordered by descending creation number.
    fn rollup_libs(&self, aid: ActionId, target: FileId) -> Result<Vec<FileId>, BuildError> {
        let direct: Vec<FileId> = self.required_libs(target).iter().copied().collect();
        let mut acc = BTreeSet::new();
        let mut visited = HashSet::new();
        self.rollup_into(aid, target, &direct, &mut acc, &mut visited)?;

        let mut list: Vec<FileId> = acc.into_iter().collect();
        list.sort_by(|a, b| b.cmp(a));
        Ok(list)
    }

    fn rollup_into(
        &self,
        aid: ActionId,
        target: FileId,
        libs: &[FileId],
        acc: &mut BTreeSet<FileId>,
        visited: &mut HashSet<FileId>,
    ) -> Result<(), BuildError> {
        for &lib in libs {
            if !visited.insert(lib) {
                continue;
            }
            let data = self.file(lib).binary().expect("rollup over non-binary");
            match data.variant {
                BinaryKind::StaticLib => {
                    if let Some(&dynlib) = self.lib_container.get(&lib) {
                        if dynlib < target && dynlib != target {
                            // Absorbed: substitute the dynamic lib and chase
                            // the requirements of everything it contains.
                            if acc.insert(dynlib) {
                                visited.insert(dynlib);
                                let contained =
                                    self.file(dynlib).binary().unwrap().contained_libs.clone();
                                for s in &contained {
                                    visited.insert(*s);
                                }
                                for s in contained {
                                    let reqs: Vec<FileId> =
                                        self.required_libs(s).iter().copied().collect();
                                    self.rollup_into(aid, target, &reqs, acc, visited)?;
                                }
                            }
                            continue;
                        }
                    }
                    let target_data = self.file(target).binary().unwrap();
                    if target_data.variant == BinaryKind::DynamicLib
                        && !data.objects.is_empty()
                    {
                        return Err(BuildError::config(
                            &self.action(aid).origin.clone(),
                            format!(
                                "{} cannot link static library {}; link a dynamic library or keep it object-free",
                                self.file(target).path.display(),
                                self.file(lib).path.display()
                            ),
                        ));
                    }
                    acc.insert(lib);
                    let reqs: Vec<FileId> = self.required_libs(lib).iter().copied().collect();
                    self.rollup_into(aid, target, &reqs, acc, visited)?;
                }
                BinaryKind::DynamicLib => {
                    // A dynamic lib carries its own requirements.
                    acc.insert(lib);
                }
                BinaryKind::Exe => {}
            }
        }
        Ok(())
    }

    /// Combine flags from every transitively required external library,
    /// highest creation number first, deduplicated so that only the last
    /// occurrence of a repeated flag survives.
    fn rollup_flags(&self, target: FileId, list: &[FileId]) -> Vec<String> {
        let mut flags = Vec::new();
        let mut contributors = vec![target];
        contributors.extend(list.iter().copied());

        for &bin in &contributors {
            let Some(data) = self.file(bin).binary() else {
                continue;
            };
            for name in &data.syslibs {
                let key = format!("syslib-{name}");
                flags.extend(self.opts.option(&key).iter().cloned());
            }
        }
        dedup_keep_last(flags)
    }
}

/// Count-down dedup: a flag present N times keeps only its last occurrence.
fn dedup_keep_last(flags: Vec<String>) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for f in &flags {
        *counts.entry(f.as_str()).or_insert(0) += 1;
    }
    let mut out = Vec::new();
    for f in &flags {
        let c = counts.get_mut(f.as_str()).unwrap();
        *c -= 1;
        if *c == 0 {
            out.push(f.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_last_occurrence() {
        let flags = vec![
            "-lz".to_string(),
            "-lm".to_string(),
            "-lz".to_string(),
            "-pthread".to_string(),
        ];
        assert_eq!(dedup_keep_last(flags), ["-lm", "-lz", "-pthread"]);
    }

    #[test]
    fn test_dedup_no_duplicates_is_identity() {
        let flags = vec!["-la".to_string(), "-lb".to_string()];
        assert_eq!(dedup_keep_last(flags.clone()), flags);
    }
}
