//! Statement processing.
//!
//! Consumes the parsed statement stream top-down, starting from the root
//! package's build file, and materializes nodes, files, and actions.
//! `contain` recurses into child packages immediately, so creation numbers
//! follow the depth-first order of the build-file tree and the
//! declare-before-use discipline falls out of the numbering.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::builder::binary::{BinaryData, BinaryKind};
use crate::builder::graph::{ActionSpec, Engine, FileId, FileKind};
use crate::core::error::{BuildError, Origin};
use crate::core::node::{NodeId, NodeKind, Privacy};
use crate::core::options::RuleKind;
use crate::core::statement::{self, Statement};

pub const SRC_DIR: &str = "src";
pub const BUILD_FILE: &str = "Bubfile";
pub const OBJ_DIR: &str = "obj";
pub const PRIV_DIR: &str = "priv";
pub const DIST_DIR: &str = "dist";

impl Engine {
    /// Assemble an engine from a laid-out build directory: read the options
    /// and environment files, load the dependency cache, and process the
    /// whole build-file tree.
    pub fn load(build_dir: &Path) -> Result<Engine> {
        let opts = crate::core::options::Options::load(build_dir)?;
        crate::core::options::load_environment(build_dir)?;
        let cache = crate::builder::depcache::DepCache::load(build_dir)?;
        let mut engine = Engine::new(build_dir.to_path_buf(), opts, cache)?;
        engine.load_statements()?;
        Ok(engine)
    }

    /// Process the whole build-file tree, starting at `src/Bubfile`.
    pub fn load_statements(&mut self) -> Result<()> {
        self.load_package(crate::core::node::ROOT)
    }

    fn load_package(&mut self, pkg: NodeId) -> Result<()> {
        let trail = self.tree.node(pkg).trail.clone();
        let rel = if trail.is_empty() {
            PathBuf::from(SRC_DIR).join(BUILD_FILE)
        } else {
            PathBuf::from(SRC_DIR).join(&trail).join(BUILD_FILE)
        };

        let bf = self.create_file(
            pkg,
            BUILD_FILE,
            rel.clone(),
            Privacy::Public,
            FileKind::Source,
            false,
            0,
            Origin::new(rel.clone(), 0),
        )?;
        self.build_files.insert(pkg, bf);

        let archs = self.opts.architectures().to_vec();
        let statements = statement::parse_build_file(&self.abs(&rel), &rel, &archs)?;
        tracing::debug!(
            target: "bub::statements",
            "{}: {} statements",
            rel.display(),
            statements.len()
        );

        for stmt in statements {
            tracing::debug!(
                target: "bub::statements",
                "{}|{}| {} {}",
                rel.display(),
                stmt.line,
                stmt.rule,
                stmt.targets.join(" ")
            );
            self.process_statement(pkg, bf, &rel, &stmt)?;
        }
        Ok(())
    }

    fn process_statement(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        bubfile: &Path,
        stmt: &Statement,
    ) -> Result<()> {
        let origin = Origin::new(bubfile, stmt.line);
        match stmt.rule.as_str() {
            "contain" => self.do_contain(pkg, stmt, &origin),
            "static-lib" => self.do_lib(pkg, bf, stmt, &origin, false),
            "public-lib" => self.do_lib(pkg, bf, stmt, &origin, true),
            "dynamic-lib" => self.do_dynamic_lib(pkg, bf, stmt, &origin),
            "dist-exe" => self.do_exe(pkg, bf, stmt, &origin, ExeKind::Dist),
            "priv-exe" => self.do_exe(pkg, bf, stmt, &origin, ExeKind::Priv),
            "test-exe" => self.do_exe(pkg, bf, stmt, &origin, ExeKind::Test),
            "translate" => self.do_translate(pkg, bf, stmt, &origin),
            "generate" => self.do_generate(pkg, bf, stmt, &origin),
            other => Err(BuildError::config(&origin, format!("unknown rule `{other}`")).into()),
        }
    }

    fn do_contain(&mut self, pkg: NodeId, stmt: &Statement, origin: &Origin) -> Result<()> {
        let privacy = match stmt.args.first().and_then(|a| a.first()) {
            Some(word) => Privacy::parse(word).ok_or_else(|| {
                BuildError::config(origin, format!("unknown privacy level `{word}`"))
            })?,
            None => Privacy::Public,
        };
        for name in &stmt.targets {
            let child =
                self.tree
                    .add_child(pkg, name, privacy, NodeKind::Pkg, origin.clone())?;
            self.load_package(child)?;
        }
        Ok(())
    }

    fn do_lib(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        stmt: &Statement,
        origin: &Origin,
        public: bool,
    ) -> Result<()> {
        let name = single_target(stmt, origin)?;
        let sources = named_files(stmt, 0, origin)?;
        let syslibs = self.checked_syslibs(stmt, 1, origin)?;

        let trail = self.tree.node(pkg).trail.clone();
        let out_rel = if public {
            PathBuf::from(DIST_DIR).join("lib").join(format!("lib{name}.slib"))
        } else {
            PathBuf::from(OBJ_DIR).join(&trail).join(format!("lib{name}.slib"))
        };
        let privacy = if public {
            Privacy::Public
        } else {
            Privacy::SemiProtected
        };

        let mut data = BinaryData::new(BinaryKind::StaticLib);
        data.syslibs = syslibs;
        let lib = self.create_file(
            pkg,
            name,
            out_rel,
            privacy,
            FileKind::Binary(data),
            true,
            0,
            origin.clone(),
        )?;

        let iface_privacy = if public {
            Privacy::Public
        } else {
            Privacy::SemiProtected
        };
        self.add_contained_sources(pkg, bf, lib, &sources, iface_privacy, origin)?;

        let objects = self.file(lib).binary().unwrap().objects.clone();
        let template = if objects.is_empty() {
            // A header-only library archives nothing; a sentinel keeps the
            // up-to-date bookkeeping uniform.
            "DUMMY ${OUTPUT}".to_string()
        } else {
            let ext = self.file(lib).binary().unwrap().source_ext.clone().unwrap();
            self.lib_rule_template(&ext, RuleKind::StaticLib, origin)?
        };

        let lib_trail = self.tree.display_trail(self.file(lib).node).to_string();
        self.create_action(ActionSpec {
            name: format!("static-lib {lib_trail}"),
            template,
            inputs: objects,
            outputs: vec![lib],
            build_file: Some(bf),
            generator: false,
            is_test: false,
            is_compile: false,
            origin: origin.clone(),
        })?;
        Ok(())
    }

    fn do_dynamic_lib(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        stmt: &Statement,
        origin: &Origin,
    ) -> Result<()> {
        let name = single_target(stmt, origin)?;
        let lib_names = named_files(stmt, 0, origin)?;

        let out_rel = PathBuf::from(DIST_DIR)
            .join("lib")
            .join(format!("lib{name}.dlib"));
        let dynlib = self.create_file(
            pkg,
            name,
            out_rel,
            Privacy::Public,
            FileKind::Binary(BinaryData::new(BinaryKind::DynamicLib)),
            true,
            0,
            origin.clone(),
        )?;

        for lib_name in &lib_names {
            let s = self.resolve_static_lib(pkg, lib_name, origin)?;
            if let Some(&other) = self.lib_container.get(&s) {
                return Err(BuildError::config(
                    origin,
                    format!(
                        "{lib_name} is already contained by {}",
                        self.file(other).path.display()
                    ),
                )
                .into());
            }
            self.lib_container.insert(s, dynlib);
            let (s_objects, s_ext) = {
                let sd = self.file(s).binary().unwrap();
                (sd.objects.clone(), sd.source_ext.clone())
            };
            if let Some(ext) = s_ext {
                self.validate_extension(dynlib, &ext, origin)?;
            }
            let d = self.file_mut(dynlib).binary_mut().unwrap();
            d.contained_libs.push(s);
            d.objects.extend(s_objects);
        }

        let data = self.file(dynlib).binary().unwrap();
        let (objects, ext) = (data.objects.clone(), data.source_ext.clone());
        let Some(ext) = ext else {
            return Err(BuildError::config(
                origin,
                format!("dynamic-lib {name} contains no object files"),
            )
            .into());
        };
        let template = self.lib_rule_template(&ext, RuleKind::DynamicLib, origin)?;

        let dyn_trail = self.tree.display_trail(self.file(dynlib).node).to_string();
        self.create_action(ActionSpec {
            name: format!("dynamic-lib {dyn_trail}"),
            template,
            inputs: objects,
            outputs: vec![dynlib],
            build_file: Some(bf),
            generator: false,
            is_test: false,
            is_compile: false,
            origin: origin.clone(),
        })?;
        Ok(())
    }

    fn do_exe(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        stmt: &Statement,
        origin: &Origin,
        kind: ExeKind,
    ) -> Result<()> {
        let name = single_target(stmt, origin)?;
        let sources = named_files(stmt, 0, origin)?;
        let syslibs = self.checked_syslibs(stmt, 1, origin)?;

        let out_rel = match kind {
            ExeKind::Dist => PathBuf::from(DIST_DIR).join("bin").join(name),
            ExeKind::Priv => PathBuf::from(PRIV_DIR).join("bin").join(name),
            ExeKind::Test => PathBuf::from(PRIV_DIR).join("test").join(name),
        };

        let mut data = BinaryData::new(BinaryKind::Exe);
        data.syslibs = syslibs;
        let exe = self.create_file(
            pkg,
            name,
            out_rel.clone(),
            Privacy::Public,
            FileKind::Binary(data),
            true,
            0,
            origin.clone(),
        )?;

        self.add_contained_sources(pkg, bf, exe, &sources, Privacy::SemiProtected, origin)?;

        let (objects, ext) = {
            let d = self.file(exe).binary().unwrap();
            (d.objects.clone(), d.source_ext.clone())
        };
        let Some(ext) = ext else {
            return Err(BuildError::config(
                origin,
                format!("executable {name} has no compilable sources"),
            )
            .into());
        };
        let template = self.lib_rule_template(&ext, RuleKind::Exe, origin)?;

        let exe_trail = self.tree.display_trail(self.file(exe).node).to_string();
        self.create_action(ActionSpec {
            name: format!("exe {exe_trail}"),
            template,
            inputs: objects,
            outputs: vec![exe],
            build_file: Some(bf),
            generator: false,
            is_test: false,
            is_compile: false,
            origin: origin.clone(),
        })?;

        if kind == ExeKind::Test {
            let mut passed = out_rel.clone().into_os_string();
            passed.push("-passed");
            let sentinel = self.create_file(
                pkg,
                &format!("{name}-passed"),
                PathBuf::from(passed),
                Privacy::Protected,
                FileKind::Built,
                true,
                0,
                origin.clone(),
            )?;
            self.create_action(ActionSpec {
                name: format!("test {exe_trail}"),
                template: out_rel.display().to_string(),
                inputs: vec![exe],
                outputs: vec![sentinel],
                build_file: Some(bf),
                generator: false,
                is_test: true,
                is_compile: false,
                origin: origin.clone(),
            })?;
        }
        Ok(())
    }

    fn do_translate(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        stmt: &Statement,
        origin: &Origin,
    ) -> Result<()> {
        let dest = stmt
            .args
            .first()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or_else(|| format!("{DIST_DIR}/bin"));
        let group = self.new_translate_group();

        for name in &stmt.targets {
            let src = self.resolve_source(pkg, name, Privacy::Public, group, origin)?;
            let out_rel = PathBuf::from(&dest).join(name);
            let out = self.create_file(
                pkg,
                &format!("{dest}/{name}"),
                out_rel,
                Privacy::Public,
                FileKind::Built,
                true,
                group,
                origin.clone(),
            )?;
            let src_path = self.file(src).path.clone();
            self.create_action(ActionSpec {
                name: format!("translate {}", src_path.display()),
                template: "COPY ${INPUT} ${OUTPUT}".to_string(),
                inputs: vec![src],
                outputs: vec![out],
                build_file: Some(bf),
                generator: false,
                is_test: false,
                is_compile: false,
                origin: origin.clone(),
            })?;
        }
        Ok(())
    }

    fn do_generate(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        stmt: &Statement,
        origin: &Origin,
    ) -> Result<()> {
        let trail = self.tree.node(pkg).trail.clone();
        for name in &stmt.targets {
            let ext = extension_of(name).ok_or_else(|| {
                BuildError::config(origin, format!("{name} has no extension to generate from"))
            })?;
            let rule = self
                .opts
                .rule_for(&ext, RuleKind::Generate)
                .ok_or_else(|| {
                    BuildError::config(origin, format!("no generate rule for {ext}"))
                })?;
            let (template, out_exts) = (rule.template.clone(), rule.output_exts.clone());

            let src = self.resolve_source(pkg, name, Privacy::SemiProtected, 0, origin)?;
            let stem = Path::new(name)
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned();

            let mut outputs = Vec::new();
            for out_ext in &out_exts {
                let out_name = format!("{stem}{out_ext}");
                let out_rel = PathBuf::from(OBJ_DIR).join(&trail).join(&out_name);
                outputs.push(self.create_file(
                    pkg,
                    &out_name,
                    out_rel,
                    Privacy::SemiProtected,
                    FileKind::Built,
                    true,
                    0,
                    origin.clone(),
                )?);
            }

            self.create_action(ActionSpec {
                name: format!("generate {}", self.file(src).path.display()),
                template,
                inputs: vec![src],
                outputs,
                build_file: Some(bf),
                generator: true,
                is_test: false,
                is_compile: false,
                origin: origin.clone(),
            })?;
        }
        Ok(())
    }

    /// Split a target's named files into compiled sources (which each get a
    /// compile action and an object) and interface files, wiring all of
    /// them into the content index.
    fn add_contained_sources(
        &mut self,
        pkg: NodeId,
        bf: FileId,
        target: FileId,
        sources: &[String],
        iface_privacy: Privacy,
        origin: &Origin,
    ) -> Result<()> {
        let trail = self.tree.node(pkg).trail.clone();
        for name in sources {
            let ext = extension_of(name);
            let compiled = ext
                .as_deref()
                .is_some_and(|e| self.opts.rule_for(e, RuleKind::Compile).is_some());
            let privacy = if compiled {
                Privacy::Protected
            } else {
                iface_privacy
            };
            let src = self.resolve_source(pkg, name, privacy, 0, origin)?;
            self.content_index.insert(src, target);
            self.file_mut(target).binary_mut().unwrap().sources.push(src);

            if !compiled {
                continue;
            }
            let ext = ext.unwrap();
            self.validate_extension(target, &ext, origin)?;

            let stem = Path::new(name)
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned();
            let rule = self.opts.rule_for(&ext, RuleKind::Compile).unwrap();
            let (template, obj_ext) = (rule.template.clone(), rule.output_exts[0].clone());
            let obj_name = format!("{stem}{obj_ext}");
            let obj_rel = PathBuf::from(OBJ_DIR).join(&trail).join(&obj_name);
            let obj = self.create_file(
                pkg,
                &obj_name,
                obj_rel,
                Privacy::SemiProtected,
                FileKind::Built,
                true,
                0,
                origin.clone(),
            )?;
            self.content_index.insert(obj, target);
            self.file_mut(target).binary_mut().unwrap().objects.push(obj);

            let src_path = self.file(src).path.clone();
            self.create_action(ActionSpec {
                name: format!("compile {}", src_path.display()),
                template,
                inputs: vec![src],
                outputs: vec![obj],
                build_file: Some(bf),
                generator: false,
                is_test: false,
                is_compile: true,
                origin: origin.clone(),
            })?;
        }
        Ok(())
    }

    /// Resolve a file named by a statement, creating it lazily.
    ///
    /// Names resolve first against already-known files (a generated file in
    /// `obj/` can be named as a source by a later statement), then against
    /// the package's source directory on disk.
    fn resolve_source(
        &mut self,
        pkg: NodeId,
        name: &str,
        privacy: Privacy,
        translate_group: u32,
        origin: &Origin,
    ) -> Result<FileId, BuildError> {
        let trail = self.tree.node(pkg).trail.clone();
        let src_rel = PathBuf::from(SRC_DIR).join(&trail).join(name);
        if let Some(f) = self.lookup_file(&src_rel) {
            return Ok(f);
        }
        let obj_rel = PathBuf::from(OBJ_DIR).join(&trail).join(name);
        if let Some(f) = self.lookup_file(&obj_rel) {
            return Ok(f);
        }
        if !self.abs(&src_rel).exists() {
            return Err(BuildError::config(
                origin,
                format!("missing source file {}", src_rel.display()),
            ));
        }
        self.create_file(
            pkg,
            name,
            src_rel,
            privacy,
            FileKind::Source,
            false,
            translate_group,
            origin.clone(),
        )
    }

    /// Resolve a static-lib name, relative to the package first, then to
    /// the root.
    fn resolve_static_lib(
        &mut self,
        pkg: NodeId,
        name: &str,
        origin: &Origin,
    ) -> Result<FileId, BuildError> {
        let trail = self.tree.node(pkg).trail.clone();
        let local = if trail.is_empty() {
            name.to_string()
        } else {
            format!("{trail}/{name}")
        };
        let node = self
            .tree
            .lookup(&local)
            .or_else(|| self.tree.lookup(name))
            .ok_or_else(|| {
                BuildError::config(origin, format!("unknown static library {name}"))
            })?;
        let NodeKind::File(idx) = self.tree.node(node).kind else {
            return Err(BuildError::config(
                origin,
                format!("{name} is a package, not a static library"),
            ));
        };
        let fid = FileId(idx);
        match self.file(fid).binary() {
            Some(b) if b.variant == BinaryKind::StaticLib => Ok(fid),
            _ => Err(BuildError::config(
                origin,
                format!("{name} is not a static library"),
            )),
        }
    }

    fn lib_rule_template(
        &self,
        ext: &str,
        kind: RuleKind,
        origin: &Origin,
    ) -> Result<String, BuildError> {
        self.opts
            .rule_for(ext, kind)
            .map(|r| r.template.clone())
            .ok_or_else(|| {
                BuildError::config(origin, format!("no {kind:?} rule for {ext} sources"))
            })
    }

    /// Validate explicitly required external libraries against the options.
    fn checked_syslibs(
        &self,
        stmt: &Statement,
        arg: usize,
        origin: &Origin,
    ) -> Result<Vec<String>, BuildError> {
        let Some(names) = stmt.args.get(arg) else {
            return Ok(Vec::new());
        };
        for name in names {
            if self.opts.option(&format!("syslib-{name}")).is_empty() {
                return Err(BuildError::config(
                    origin,
                    format!("unknown system library {name}"),
                ));
            }
        }
        Ok(names.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExeKind {
    Dist,
    Priv,
    Test,
}

fn single_target<'a>(stmt: &'a Statement, origin: &Origin) -> Result<&'a str, BuildError> {
    match stmt.targets.as_slice() {
        [one] => Ok(one),
        _ => Err(BuildError::config(
            origin,
            format!("`{}` takes exactly one target", stmt.rule),
        )),
    }
}

fn named_files(
    stmt: &Statement,
    arg: usize,
    origin: &Origin,
) -> Result<Vec<String>, BuildError> {
    stmt.args
        .get(arg)
        .filter(|a| !a.is_empty())
        .cloned()
        .ok_or_else(|| {
            BuildError::config(origin, format!("`{}` names no files", stmt.rule))
        })
}

/// The extension of a filename, with the leading dot.
fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
}
