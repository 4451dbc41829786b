//! The file/action dependency graph.
//!
//! Files point at the action that produces them; actions point at their
//! inputs, outputs, and a growing dependency set. Both tables are
//! append-only vectors owned by the [`Engine`], so a `FileId`/`ActionId`
//! doubles as the entity's creation number. That number is load-bearing:
//! dependency edges must point backwards in creation order, the ready queue
//! pops lowest numbers first, and the generate fence blocks every action
//! numbered above the oldest pending generator.

use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::builder::binary::BinaryData;
use crate::builder::depcache::{self, DepCache};
use crate::core::error::{BuildError, Origin};
use crate::core::node::{NodeId, NodeKind, NodeTree, Privacy};
use crate::core::options::{Options, OPTIONS_FILE};
use crate::util::fs::{self, Mtime};

/// Id of a file; assignment order is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

/// Id of an action; assignment order is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub u32);

/// What a file is.
#[derive(Debug)]
pub enum FileKind {
    /// A file under `src/`, created lazily when first referenced.
    Source,
    /// A plain built file (generated, translated, object, test sentinel).
    Built,
    /// A static library, dynamic library, or executable.
    Binary(BinaryData),
}

/// A file known to the engine.
#[derive(Debug)]
pub struct File {
    pub node: NodeId,
    /// Build-dir-relative path; unique.
    pub path: PathBuf,
    pub built: bool,
    /// The action producing this file, if it is built.
    pub action: Option<ActionId>,
    pub modtime: Mtime,
    /// Actions that depend on this file (reverse edges).
    pub dependents: BTreeSet<ActionId>,
    /// Non-zero for files added together by a batch translate.
    pub translate_group: u32,
    pub kind: FileKind,
    pub origin: Origin,
}

impl File {
    pub fn binary(&self) -> Option<&BinaryData> {
        match &self.kind {
            FileKind::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn binary_mut(&mut self) -> Option<&mut BinaryData> {
        match &mut self.kind {
            FileKind::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// A unit of external work producing one or more files.
#[derive(Debug)]
pub struct Action {
    /// Display name, e.g. `compile a/b/x.c`.
    pub name: String,
    /// Unresolved command template.
    pub template: String,
    pub inputs: Vec<FileId>,
    pub outputs: Vec<FileId>,
    /// All dependency files, ordered by creation number.
    pub deps: BTreeSet<FileId>,
    /// Dependencies that do not by themselves force a rebuild.
    pub weak: BTreeSet<FileId>,
    /// Newest modtime among system-file dependencies, or [`Mtime::MAX`]
    /// when cached dependency state is unusable.
    pub newest: Mtime,
    pub newest_culprit: Option<PathBuf>,
    /// Library paths bound to `${LIBS}`, descending creation order.
    pub libs: Vec<PathBuf>,
    /// Flags accumulated from required external libraries.
    pub extra_flags: Vec<String>,
    pub generator: bool,
    pub is_test: bool,
    pub is_compile: bool,
    /// Build-dir-relative `${DEPS}` path, when the template asks for one.
    pub deps_file: Option<PathBuf>,
    pub issued: bool,
    pub completed: bool,
    pub augmented: bool,
    /// Resolved command, bound when the action is issued.
    pub command: Option<String>,
    pub origin: Origin,
}

/// Everything needed to create an action.
#[derive(Debug)]
pub struct ActionSpec {
    pub name: String,
    pub template: String,
    pub inputs: Vec<FileId>,
    pub outputs: Vec<FileId>,
    /// The owning package's build file, added as an automatic dependency.
    pub build_file: Option<FileId>,
    pub generator: bool,
    pub is_test: bool,
    pub is_compile: bool,
    pub origin: Origin,
}

/// An issued action waiting in the ready queue.
#[derive(Debug, Clone)]
pub struct ReadyEntry {
    /// 0 for the generator at the fence head, 1 otherwise.
    pub boost: u8,
    pub action: ActionId,
    pub dirty: bool,
    /// First dependency path that forced dirtiness.
    pub culprit: Option<PathBuf>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.boost, self.action) == (other.boost, other.action)
    }
}
impl Eq for ReadyEntry {}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.boost, self.action).cmp(&(other.boost, other.action))
    }
}

/// The build engine: the ownership tree, the file/action graph, the options
/// store, and the dependency cache, all indexed by engine-owned tables.
#[derive(Debug)]
pub struct Engine {
    pub build_dir: PathBuf,
    pub opts: Options,
    pub tree: NodeTree,
    pub cache: DepCache,

    files: Vec<File>,
    actions: Vec<Action>,
    by_path: HashMap<PathBuf, FileId>,

    /// Pending generator actions in ascending creation order.
    pending_generators: VecDeque<ActionId>,
    ready: BinaryHeap<Reverse<ReadyEntry>>,
    /// Sampled modtimes of files outside the project.
    system_mtimes: HashMap<PathBuf, Mtime>,

    /// The global options file; every action depends on it.
    pub options_file: FileId,
    /// Contained file (source, interface, object) to owning binary.
    pub content_index: HashMap<FileId, FileId>,
    /// Static lib to the dynamic lib that contains it.
    pub lib_container: HashMap<FileId, FileId>,
    /// Per-package build file.
    pub build_files: HashMap<NodeId, FileId>,

    next_translate_group: u32,
}

impl Engine {
    pub fn new(build_dir: PathBuf, opts: Options, cache: DepCache) -> Result<Engine, BuildError> {
        let mut engine = Engine {
            build_dir,
            opts,
            tree: NodeTree::new(),
            cache,
            files: Vec::new(),
            actions: Vec::new(),
            by_path: HashMap::new(),
            pending_generators: VecDeque::new(),
            ready: BinaryHeap::new(),
            system_mtimes: HashMap::new(),
            options_file: FileId(0),
            content_index: HashMap::new(),
            lib_container: HashMap::new(),
            build_files: HashMap::new(),
            next_translate_group: 0,
        };
        engine.options_file = engine.create_file(
            crate::core::node::ROOT,
            OPTIONS_FILE,
            PathBuf::from(OPTIONS_FILE),
            Privacy::Public,
            FileKind::Source,
            false,
            0,
            Origin::none(),
        )?;
        Ok(engine)
    }

    pub fn file(&self, id: FileId) -> &File {
        &self.files[id.0 as usize]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut File {
        &mut self.files[id.0 as usize]
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0 as usize]
    }

    pub fn action_mut(&mut self, id: ActionId) -> &mut Action {
        &mut self.actions[id.0 as usize]
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn file_ids(&self) -> impl Iterator<Item = FileId> {
        (0..self.files.len() as u32).map(FileId)
    }

    pub fn action_ids(&self) -> impl Iterator<Item = ActionId> {
        (0..self.actions.len() as u32).map(ActionId)
    }

    pub fn lookup_file(&self, path: &Path) -> Option<FileId> {
        self.by_path.get(path).copied()
    }

    /// Absolute path of a build-dir-relative path.
    pub fn abs(&self, rel: &Path) -> PathBuf {
        self.build_dir.join(rel)
    }

    /// Trail of the node owning a file, for diagnostics.
    pub fn file_trail(&self, id: FileId) -> &str {
        self.tree.display_trail(self.file(id).node)
    }

    /// Allocate a fresh translate group id.
    pub fn new_translate_group(&mut self) -> u32 {
        self.next_translate_group += 1;
        self.next_translate_group
    }

    /// Create a file node. Paths and trails must stay unique.
    #[allow(clippy::too_many_arguments)]
    pub fn create_file(
        &mut self,
        parent: NodeId,
        name: &str,
        path: PathBuf,
        privacy: Privacy,
        kind: FileKind,
        built: bool,
        translate_group: u32,
        origin: Origin,
    ) -> Result<FileId, BuildError> {
        if self.by_path.contains_key(&path) {
            return Err(BuildError::config(
                &origin,
                format!("duplicate definition of file {}", path.display()),
            ));
        }
        let id = FileId(self.files.len() as u32);
        let node = self.tree.add_child(
            parent,
            name,
            privacy,
            NodeKind::File(id.0),
            origin.clone(),
        )?;
        let modtime = fs::mtime_of(&self.build_dir.join(&path));
        self.by_path.insert(path.clone(), id);
        self.files.push(File {
            node,
            path,
            built,
            action: None,
            modtime,
            dependents: BTreeSet::new(),
            translate_group,
            kind,
            origin,
        });
        Ok(id)
    }

    /// Create an action and wire up its automatic dependencies: the owning
    /// package's build file, the options file, its declared inputs, and any
    /// in-project tools named by the command template.
    pub fn create_action(&mut self, spec: ActionSpec) -> Result<ActionId, BuildError> {
        let id = ActionId(self.actions.len() as u32);
        debug_assert!(!spec.outputs.is_empty());
        for &out in &spec.outputs {
            if self.file(out).action.is_some() {
                return Err(BuildError::config(
                    &spec.origin,
                    format!(
                        "duplicate producer for {}",
                        self.file(out).path.display()
                    ),
                ));
            }
        }

        let deps_file = spec.template.contains("${DEPS}").then(|| {
            let mut os = PathBuf::from(depcache::DEPS_DIR)
                .join(&self.file(spec.outputs[0]).path)
                .into_os_string();
            os.push(".d");
            PathBuf::from(os)
        });

        // In-project tool references in the template are dependencies; the
        // tool must already be known.
        let mut tools = Vec::new();
        for token in spec.template.split_whitespace() {
            if token.starts_with("dist/bin/") || token.starts_with("priv/") {
                match self.lookup_file(Path::new(token)) {
                    Some(f) => tools.push(f),
                    None => {
                        return Err(BuildError::config(
                            &spec.origin,
                            format!("unknown tool {token}"),
                        ));
                    }
                }
            }
        }

        self.actions.push(Action {
            name: spec.name,
            template: spec.template,
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            deps: BTreeSet::new(),
            weak: BTreeSet::new(),
            newest: Mtime::MISSING,
            newest_culprit: None,
            libs: Vec::new(),
            extra_flags: Vec::new(),
            generator: spec.generator,
            is_test: spec.is_test,
            is_compile: spec.is_compile,
            deps_file,
            issued: false,
            completed: false,
            augmented: false,
            command: None,
            origin: spec.origin,
        });

        for &out in &spec.outputs {
            self.file_mut(out).action = Some(id);
        }
        self.add_dependency(id, self.options_file, false, true)?;
        if let Some(bf) = spec.build_file {
            self.add_dependency(id, bf, false, true)?;
        }
        for tool in tools {
            self.add_dependency(id, tool, false, true)?;
        }
        for &input in &spec.inputs {
            self.add_dependency(id, input, false, false)?;
        }

        if spec.generator {
            self.pending_generators.push_back(id);
        }
        Ok(id)
    }

    /// The action's primary output.
    pub fn primary_output(&self, aid: ActionId) -> FileId {
        self.action(aid).outputs[0]
    }

    /// Add a dependency from an action to a file.
    ///
    /// Idempotent per pair; forbidden once the action has been issued.
    /// Silent adds (automatic deps, cached imports) skip the visibility
    /// check — a stale cache is validated only when the action next runs.
    pub fn add_dependency(
        &mut self,
        aid: ActionId,
        dep: FileId,
        weak: bool,
        silent: bool,
    ) -> Result<(), BuildError> {
        if self.action(aid).deps.contains(&dep) {
            return Ok(());
        }
        if self.action(aid).issued {
            return Err(BuildError::config(
                &self.action(aid).origin.clone(),
                format!(
                    "dependency on {} added after {} was issued",
                    self.file(dep).path.display(),
                    self.action(aid).name
                ),
            ));
        }
        if !silent {
            self.check_can_depend(self.primary_output(aid), dep)?;
        }
        self.action_mut(aid).deps.insert(dep);
        if weak {
            self.action_mut(aid).weak.insert(dep);
        }
        self.file_mut(dep).dependents.insert(aid);
        Ok(())
    }

    /// The visibility rule: may file `a` depend on file `b`?
    ///
    /// (a) `b` was created earlier, or shares a translate group with `a`,
    ///     or is an ancestor of `a`;
    /// (b) `a`'s owning package is not a strict descendant of `b`'s;
    /// (c) `b` is a visible descendant of the least common ancestor.
    pub fn check_can_depend(&self, a: FileId, b: FileId) -> Result<(), BuildError> {
        let fa = self.file(a);
        let fb = self.file(b);
        let ta = self.file_trail(a).to_string();
        let tb = self.file_trail(b).to_string();

        if a == b {
            return Err(BuildError::visibility(
                &fa.origin,
                format!("{ta} cannot depend on itself"),
            ));
        }

        let ordered = b < a
            || (fa.translate_group != 0 && fa.translate_group == fb.translate_group)
            || self.tree.is_strict_descendant_of(fa.node, fb.node);
        if !ordered {
            return Err(BuildError::visibility(
                &fa.origin,
                format!("{ta} cannot depend on {tb}, which is declared later"),
            ));
        }

        let pa = self.tree.owning_pkg(fa.node);
        let pb = self.tree.owning_pkg(fb.node);
        if self.tree.is_strict_descendant_of(pa, pb) {
            return Err(BuildError::visibility(
                &fa.origin,
                format!("{ta} cannot depend on {tb}, which belongs to an enclosing package"),
            ));
        }

        let lca = self.tree.common_ancestor_with(fa.node, fb.node);
        if !self.tree.is_visible_descendant_of(fb.node, lca) {
            return Err(BuildError::visibility(
                &fa.origin,
                format!(
                    "{ta} cannot depend on {tb}, which isn't visible via {}",
                    self.tree.display_trail(lca)
                ),
            ));
        }
        Ok(())
    }

    /// Import the cached dependency record for an action's primary output.
    ///
    /// Absolute paths and bare filenames are system files: their modtimes
    /// feed the action's `newest`. In-project paths become silent
    /// dependencies. An unknown in-project path, a vanished system file, or
    /// a missing record (for an action with inputs) all force a rebuild via
    /// `newest = +inf`.
    pub fn add_cached_dependencies(&mut self, aid: ActionId) -> Result<(), BuildError> {
        let primary = self.primary_output(aid);
        let ppath = self.file(primary).path.clone();

        let Some(entry) = self.cache.lookup(&ppath).map(<[PathBuf]>::to_vec) else {
            if !self.action(aid).inputs.is_empty() {
                self.force_rebuild(aid, None);
            }
            return Ok(());
        };

        for p in entry {
            if is_system_path(&p) {
                let m = self.system_mtime(&p);
                if m.is_missing() {
                    self.force_rebuild(aid, Some(p));
                } else if m > self.action(aid).newest {
                    let a = self.action_mut(aid);
                    a.newest = m;
                    a.newest_culprit = Some(p);
                }
            } else {
                match self.lookup_file(&p) {
                    Some(f) => self.add_dependency(aid, f, false, true)?,
                    None => {
                        self.force_rebuild(aid, Some(p));
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn force_rebuild(&mut self, aid: ActionId, culprit: Option<PathBuf>) {
        let a = self.action_mut(aid);
        a.newest = Mtime::MAX;
        a.newest_culprit = culprit;
    }

    fn system_mtime(&mut self, path: &Path) -> Mtime {
        if let Some(&m) = self.system_mtimes.get(path) {
            return m;
        }
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.build_dir.join(path)
        };
        let m = fs::mtime_of(&abs);
        self.system_mtimes.insert(path.to_path_buf(), m);
        m
    }

    /// The pending generator blocking this action, if any.
    pub fn blocking_generator(&self, aid: ActionId) -> Option<ActionId> {
        let head = *self.pending_generators.front()?;
        (aid > head).then_some(head)
    }

    /// Issue the action onto the ready queue if everything it needs is in
    /// place: not behind the generate fence, no dependency still being
    /// produced, and its one-shot augment satisfied.
    pub fn issue_if_ready(&mut self, aid: ActionId) -> Result<()> {
        if self.action(aid).issued {
            return Ok(());
        }
        if let Some(g) = self.blocking_generator(aid) {
            tracing::trace!(
                target: "bub::actions",
                "{} blocked by generator {}",
                self.action(aid).name,
                self.action(g).name
            );
            return Ok(());
        }

        loop {
            let deps: Vec<FileId> = self.action(aid).deps.iter().copied().collect();
            for d in &deps {
                if let Some(pa) = self.file(*d).action {
                    if !self.action(pa).completed {
                        return Ok(());
                    }
                }
            }
            if self.action(aid).augmented {
                break;
            }
            if !self.run_augment(aid)? {
                // New dependencies are still being produced; their
                // completion re-triggers this check.
                return Ok(());
            }
            self.action_mut(aid).augmented = true;
        }

        let out_m = self.out_mtime(aid);
        let mut dirty = false;
        let mut culprit = None;
        if self.action(aid).newest > out_m {
            dirty = true;
            culprit = self.action(aid).newest_culprit.clone();
        }
        if !dirty {
            for d in self.action(aid).deps.iter() {
                if self.action(aid).weak.contains(d) {
                    continue;
                }
                if self.file(*d).modtime > out_m {
                    dirty = true;
                    culprit = Some(self.file(*d).path.clone());
                    break;
                }
            }
        }

        let command = self.resolve_action_command(aid)?;
        let boost = if self.action(aid).generator
            && self.pending_generators.front() == Some(&aid)
        {
            0
        } else {
            1
        };
        {
            let a = self.action_mut(aid);
            a.command = Some(command);
            a.issued = true;
        }
        self.ready.push(Reverse(ReadyEntry {
            boost,
            action: aid,
            dirty,
            culprit,
        }));
        Ok(())
    }

    /// Oldest ready action, fence-head generators first.
    pub fn pop_ready(&mut self) -> Option<ReadyEntry> {
        self.ready.pop().map(|r| r.0)
    }

    pub fn peek_ready(&self) -> Option<&ReadyEntry> {
        self.ready.peek().map(|r| &r.0)
    }

    /// Minimum modtime over the action's outputs.
    fn out_mtime(&self, aid: ActionId) -> Mtime {
        self.action(aid)
            .outputs
            .iter()
            .map(|&f| self.file(f).modtime)
            .min()
            .unwrap_or(Mtime::MISSING)
    }

    /// Resolve the command template with live INPUT/OUTPUT/LIBS/DEPS
    /// bindings.
    pub fn resolve_action_command(&self, aid: ActionId) -> Result<String, BuildError> {
        let a = self.action(aid);
        let mut extras = HashMap::new();
        extras.insert("INPUT".to_string(), self.join_paths(&a.inputs));
        extras.insert("OUTPUT".to_string(), self.join_paths(&a.outputs));
        extras.insert(
            "LIBS".to_string(),
            a.libs
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        );
        if let Some(df) = &a.deps_file {
            extras.insert("DEPS".to_string(), df.to_string_lossy().into_owned());
        }
        self.opts.resolve_command(&a.template, &extras, &a.extra_flags)
    }

    fn join_paths(&self, files: &[FileId]) -> String {
        files
            .iter()
            .map(|&f| self.file(f).path.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Propagate the completion of an action.
    ///
    /// Refreshes output modtimes, re-derives the cache record from the
    /// tool-emitted deps file (validating freshly discovered in-project
    /// dependencies against the visibility rules), advances the generate
    /// fence, and re-checks dependents. `ran` is false when the action was
    /// up to date and skipped.
    pub fn action_finished(&mut self, aid: ActionId, ran: bool) -> Result<()> {
        self.action_mut(aid).completed = true;
        let outputs = self.action(aid).outputs.clone();
        for &out in &outputs {
            let abs = self.abs(&self.file(out).path.clone());
            self.file_mut(out).modtime = fs::mtime_of(&abs);
        }

        if ran {
            self.rederive_cache_record(aid)?;
        }

        if self.action(aid).generator && self.pending_generators.front() == Some(&aid) {
            self.pending_generators.pop_front();
            // Every action in the newly unblocked window gets another
            // ready-check.
            let unblocked: Vec<ActionId> = self
                .action_ids()
                .filter(|&a| !self.action(a).issued && self.blocking_generator(a).is_none())
                .collect();
            for a in unblocked {
                self.issue_if_ready(a)?;
            }
        }

        for &out in &outputs {
            let dependents: Vec<ActionId> =
                self.file(out).dependents.iter().copied().collect();
            for d in dependents {
                self.issue_if_ready(d)?;
            }
        }
        Ok(())
    }

    fn rederive_cache_record(&mut self, aid: ActionId) -> Result<()> {
        let primary = self.primary_output(aid);
        let ppath = self.file(primary).path.clone();

        let mut raw = Vec::new();
        if let Some(rel) = self.action(aid).deps_file.clone() {
            let temp = self.abs(&rel);
            raw = depcache::parse_deps_file(&temp)?;
            let _ = std::fs::remove_file(&temp);
        }

        let input_paths: HashSet<PathBuf> = self
            .action(aid)
            .inputs
            .iter()
            .map(|&f| self.file(f).path.clone())
            .collect();

        // Freshly discovered includes must still obey the visibility rules.
        let mut checked = HashSet::new();
        for p in &raw {
            if is_system_path(p) || *p == ppath || input_paths.contains(p) {
                continue;
            }
            if !checked.insert(p.clone()) {
                continue;
            }
            match self.lookup_file(p) {
                Some(f) => self.check_can_depend(primary, f)?,
                None => {
                    return Err(BuildError::config(
                        &self.action(aid).origin.clone(),
                        format!(
                            "{} depends on unknown file {}",
                            ppath.display(),
                            p.display()
                        ),
                    )
                    .into());
                }
            }
        }

        let mut seen = HashSet::new();
        raw.retain(|p| seen.insert(p.clone()));
        self.cache.update(&ppath, raw)?;
        Ok(())
    }
}

/// A path outside the project: absolute, or a bare filename with no
/// directory component.
pub fn is_system_path(p: &Path) -> bool {
    p.is_absolute() || p.parent().is_none_or(|d| d.as_os_str().is_empty())
}
