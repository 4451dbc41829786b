//! Artifact reporters.
//!
//! Each run regenerates four build-dir-root artifacts: a
//! `compile_commands.json` index for IDE integration, a topologically
//! ordered `package-depends` listing, the `include-paths` search list, and
//! the sorted `files-of-interest` inventory.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;

use crate::builder::graph::Engine;
use crate::builder::loader::OBJ_DIR;
use crate::core::node::NodeId;
use crate::core::options::RuleKind;
use crate::util::fs;

/// compile_commands.json entry.
#[derive(Debug, Serialize)]
struct CompileCommand {
    directory: String,
    command: String,
    file: String,
}

/// Emit `compile_commands.json` with one entry per compile action.
pub fn emit_compile_commands(engine: &Engine) -> Result<()> {
    let directory = engine.build_dir.display().to_string();
    let mut commands = Vec::new();
    for aid in engine.action_ids() {
        let a = engine.action(aid);
        if !a.is_compile {
            continue;
        }
        commands.push(CompileCommand {
            directory: directory.clone(),
            command: engine.resolve_action_command(aid)?,
            file: engine
                .file(a.inputs[0])
                .path
                .to_string_lossy()
                .into_owned(),
        });
    }

    let json = serde_json::to_string_pretty(&commands)?;
    fs::write_string(&engine.build_dir.join("compile_commands.json"), &json)?;
    Ok(())
}

/// Emit `include-paths`: the sorted directories holding interface files
/// (contained files with no compile rule) and generated headers.
pub fn emit_include_paths(engine: &Engine) -> Result<()> {
    // Extensions that name build artifacts (.obj, .slib, …) never mark an
    // include directory; generate-rule outputs do.
    let artifact_exts: BTreeSet<&str> = engine
        .opts
        .rules()
        .filter(|r| r.kind != RuleKind::Generate)
        .flat_map(|r| r.output_exts.iter().map(String::as_str))
        .collect();

    let mut dirs = BTreeSet::new();
    for f in engine.file_ids() {
        let file = engine.file(f);
        let text = file.path.to_string_lossy();
        let Some(ext) = file.path.extension().map(|e| format!(".{}", e.to_string_lossy()))
        else {
            continue;
        };
        if engine.opts.rule_for(&ext, RuleKind::Compile).is_some()
            || artifact_exts.iter().any(|a| text.ends_with(a))
        {
            continue;
        }
        let contained = engine.content_index.contains_key(&f) && !file.built;
        let generated = file.built && file.path.starts_with(OBJ_DIR);
        if !contained && !generated {
            continue;
        }
        if let Some(parent) = file.path.parent() {
            dirs.insert(parent.to_path_buf());
        }
    }

    let mut text = String::new();
    for dir in dirs {
        text.push_str(&dir.to_string_lossy());
        text.push('\n');
    }
    fs::write_string(&engine.build_dir.join("include-paths"), &text)?;
    Ok(())
}

/// Emit `files-of-interest`: sorted paths of every non-binary known file.
pub fn emit_files_of_interest(engine: &Engine) -> Result<()> {
    let paths: BTreeSet<_> = engine
        .file_ids()
        .filter(|&f| engine.file(f).binary().is_none())
        .map(|f| engine.file(f).path.to_string_lossy().into_owned())
        .collect();

    let mut text = String::new();
    for p in paths {
        text.push_str(&p);
        text.push('\n');
    }
    fs::write_string(&engine.build_dir.join("files-of-interest"), &text)?;
    Ok(())
}

/// Emit `package-depends`: each package and its direct package
/// dependencies, dependencies listed first.
///
/// Runs after the build, when discovered dependencies are in the graph.
pub fn emit_package_depends(engine: &Engine) -> Result<()> {
    let mut edges: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    let mut graph: DiGraphMap<u32, ()> = DiGraphMap::new();

    for aid in engine.action_ids() {
        let a = engine.action(aid);
        let primary = a.outputs[0];
        let owner = engine.tree.owning_pkg(engine.file(primary).node);
        graph.add_node(owner.0);

        // Graph edges plus the cached record, so dependencies discovered on
        // this very run are reported too.
        let mut dep_files: BTreeSet<_> = a.deps.iter().copied().collect();
        if let Some(record) = engine.cache.lookup(&engine.file(primary).path) {
            dep_files.extend(record.iter().filter_map(|p| engine.lookup_file(p)));
        }

        for dep in dep_files {
            if dep == engine.options_file {
                continue;
            }
            let dep_owner = engine.tree.owning_pkg(engine.file(dep).node);
            if dep_owner == owner {
                continue;
            }
            edges.entry(owner).or_default().insert(dep_owner);
            graph.add_edge(owner.0, dep_owner.0, ());
        }
    }

    // Toposort puts dependents before their dependencies along our edge
    // direction; the report lists dependencies first. Cycles fall back to
    // creation order.
    let order: Vec<NodeId> = match toposort(&graph, None) {
        Ok(mut nodes) => {
            nodes.reverse();
            nodes.into_iter().map(NodeId).collect()
        }
        Err(_) => {
            tracing::warn!("package dependency cycle; listing in creation order");
            graph.nodes().map(NodeId).collect()
        }
    };

    let mut text = String::new();
    for pkg in order {
        let deps = edges.get(&pkg);
        text.push_str(engine.tree.display_trail(pkg));
        text.push(':');
        if let Some(deps) = deps {
            for d in deps {
                text.push(' ');
                text.push_str(engine.tree.display_trail(*d));
            }
        }
        text.push('\n');
    }
    fs::write_string(&engine.build_dir.join("package-depends"), &text)?;
    Ok(())
}

/// The reports that only need the loaded graph, emitted before scheduling.
pub fn emit_static_reports(engine: &Engine) -> Result<()> {
    emit_compile_commands(engine)?;
    emit_include_paths(engine)?;
    emit_files_of_interest(engine)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::depcache::DepCache;
    use crate::core::options::Options;
    use std::path::Path;
    use tempfile::TempDir;

    const OPTIONS: &str = "\
.c .obj = gcc -c ${INPUT} -o ${OUTPUT} -MMD -MF ${DEPS}
.c .slib = ar csr ${OUTPUT} ${INPUT}
.c .exe = gcc ${INPUT} -o ${OUTPUT} ${LIBS}
";

    fn write(tmp: &TempDir, rel: &str, contents: &str) {
        let path = tmp.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn loaded(tmp: &TempDir) -> Engine {
        write(tmp, "Buboptions", OPTIONS);
        let opts = Options::load(tmp.path()).unwrap();
        let cache = DepCache::load(tmp.path()).unwrap();
        let mut e = Engine::new(tmp.path().to_path_buf(), opts, cache).unwrap();
        e.load_statements().unwrap();
        e
    }

    #[test]
    fn test_compile_commands_shape() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "src/Bubfile", "static-lib foo : foo.c foo.h ;\n");
        write(&tmp, "src/foo.c", "int foo;\n");
        write(&tmp, "src/foo.h", "extern int foo;\n");

        let e = loaded(&tmp);
        emit_compile_commands(&e).unwrap();

        let json = std::fs::read_to_string(tmp.path().join("compile_commands.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["file"], "src/foo.c");
        assert!(entries[0]["command"]
            .as_str()
            .unwrap()
            .starts_with("gcc -c src/foo.c"));
        assert!(entries[0]["directory"].as_str().is_some());
    }

    #[test]
    fn test_include_paths_and_files_of_interest() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "src/Bubfile", "contain a ;\n");
        write(&tmp, "src/a/Bubfile", "static-lib foo : foo.c foo.h ;\n");
        write(&tmp, "src/a/foo.c", "int foo;\n");
        write(&tmp, "src/a/foo.h", "extern int foo;\n");

        let e = loaded(&tmp);
        emit_include_paths(&e).unwrap();
        emit_files_of_interest(&e).unwrap();

        let includes = std::fs::read_to_string(tmp.path().join("include-paths")).unwrap();
        assert_eq!(includes, "src/a\n");

        let foi = std::fs::read_to_string(tmp.path().join("files-of-interest")).unwrap();
        assert!(foi.contains("src/a/foo.c\n"));
        assert!(foi.contains("src/a/foo.h\n"));
        assert!(foi.contains("obj/a/foo.obj\n"));
        // Binaries are not of interest.
        assert!(!foi.contains("libfoo.slib"));
    }

    #[test]
    fn test_package_depends_topological() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "src/Bubfile", "contain low high ;\n");
        write(&tmp, "src/low/Bubfile", "static-lib low : low.c ;\n");
        write(&tmp, "src/low/low.c", "int low;\n");
        write(&tmp, "src/high/Bubfile", "dist-exe app : main.c ;\n");
        write(&tmp, "src/high/main.c", "int main(void) { return 0; }\n");

        let mut e = loaded(&tmp);
        // Simulate the discovered link edge high -> low.
        let exe = e.lookup_file(Path::new("dist/bin/app")).unwrap();
        let lib = e.lookup_file(Path::new("obj/low/liblow.slib")).unwrap();
        let link = e.file(exe).action.unwrap();
        e.add_dependency(link, lib, false, false).unwrap();

        emit_package_depends(&e).unwrap();
        let text = std::fs::read_to_string(tmp.path().join("package-depends")).unwrap();
        let low_pos = text.find("low:").unwrap();
        let high_pos = text.find("high: low").unwrap();
        assert!(low_pos < high_pos, "{text}");
    }
}
