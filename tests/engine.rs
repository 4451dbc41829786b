//! End-to-end engine scenarios.
//!
//! These drive the assembled engine against scratch build directories. The
//! "compilers" are shell one-liners declared in `Buboptions`: a compile
//! copies its input and emits a dependency file listing the input plus
//! whatever extra dependencies a `<source>.deps` sidecar names, which lets
//! a test simulate `#include` discovery without a real toolchain.

use std::path::{Path, PathBuf};

use bub::builder::{cleaner, reports};
use bub::{Engine, Scheduler};

const OPTIONS: &str = "\
ARCHITECTURE = linux
MAX-JOBS = 4
syslib-m = -lm
.c .obj = cat ${INPUT} > ${OUTPUT} && echo ${OUTPUT}: ${INPUT} $(cat ${INPUT}.deps 2>/dev/null) > ${DEPS}
.c .slib = cat ${INPUT} > ${OUTPUT}
.c .dlib = cat ${INPUT} > ${OUTPUT} && echo libs: ${LIBS} >> ${OUTPUT}
.c .exe = cat ${INPUT} > ${OUTPUT} && echo libs: ${LIBS} >> ${OUTPUT}
.gen .h = cat ${INPUT} > ${OUTPUT}
";

struct Scratch {
    tmp: tempfile::TempDir,
}

impl Scratch {
    fn new() -> Scratch {
        let scratch = Scratch {
            tmp: tempfile::TempDir::new().unwrap(),
        };
        scratch.write("Buboptions", OPTIONS);
        scratch
    }

    fn dir(&self) -> &Path {
        self.tmp.path()
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.tmp.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.tmp.path().join(rel)).unwrap()
    }

    fn exists(&self, rel: &str) -> bool {
        self.tmp.path().join(rel).exists()
    }

    /// Load, clean, report, and run a build to completion.
    fn build(&self) -> anyhow::Result<(bub::BuildOutcome, Engine)> {
        let engine = Engine::load(self.dir())?;
        cleaner::clean_stale(&engine)?;
        reports::emit_static_reports(&engine)?;
        let mut scheduler = Scheduler::new(engine, Some(2), Some(5));
        let outcome = scheduler.run()?;
        reports::emit_package_depends(&scheduler.engine)?;
        Ok((outcome, scheduler.engine))
    }
}

#[test]
fn single_compile_produces_object_and_compile_commands() {
    let s = Scratch::new();
    s.write("src/Bubfile", "static-lib foo : foo.c ;\n");
    s.write("src/foo.c", "int foo(void) { return 1; }\n");

    let (outcome, engine) = s.build().unwrap();

    assert_eq!(engine.action_count(), 2);
    assert_eq!(outcome.updated, 2);
    assert!(s.exists("obj/foo.obj"));
    assert!(s.exists("obj/libfoo.slib"));

    let cc = s.read("compile_commands.json");
    assert!(cc.contains("\"file\": \"src/foo.c\""));

    // The dependency cache recorded what the tool consumed.
    let record = s.read("deps/obj/foo.obj");
    assert!(record.contains("src/foo.c"));
}

#[test]
fn second_run_is_idempotent() {
    let s = Scratch::new();
    s.write("src/Bubfile", "static-lib foo : foo.c ;\ndist-exe app : main.c ;\n");
    s.write("src/foo.c", "int foo;\n");
    s.write("src/main.c", "int main;\n");

    let (first, _) = s.build().unwrap();
    assert!(first.updated > 0);

    let (second, _) = s.build().unwrap();
    assert_eq!(second.updated, 0, "no-change rebuild must dispatch nothing");
}

#[test]
fn touched_source_rebuilds_only_its_chain() {
    let s = Scratch::new();
    s.write("src/Bubfile", "static-lib foo : foo.c ;\nstatic-lib bar : bar.c ;\n");
    s.write("src/foo.c", "int foo;\n");
    s.write("src/bar.c", "int bar;\n");

    s.build().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    s.write("src/foo.c", "int foo2;\n");

    let (outcome, _) = s.build().unwrap();
    // foo compile + foo archive, and nothing of bar's.
    assert_eq!(outcome.updated, 2);
    assert!(s.read("obj/foo.obj").contains("foo2"));
}

#[test]
fn generate_fence_orders_dependent_compile() {
    let s = Scratch::new();
    s.write(
        "src/Bubfile",
        "generate gen.gen ;\nstatic-lib user : user.c ;\n",
    );
    s.write("src/gen.gen", "generated header\n");
    s.write("src/user.c", "int user;\n");
    // The compile of user.c discovers the generated header.
    s.write("src/user.c.deps", "obj/gen.h\n");

    let (outcome, engine) = s.build().unwrap();

    assert!(s.exists("obj/gen.h"));
    assert_eq!(s.read("obj/gen.h"), "generated header\n");
    assert_eq!(outcome.updated, 3);

    // The discovered dependency was validated and cached.
    let obj = engine.lookup_file(Path::new("obj/user.obj")).unwrap();
    let record = engine
        .cache
        .lookup(Path::new("obj/user.obj"))
        .unwrap()
        .to_vec();
    assert!(record.contains(&PathBuf::from("obj/gen.h")), "{record:?}");
    let _ = obj;

    // And a second run dispatches nothing.
    let (second, _) = s.build().unwrap();
    assert_eq!(second.updated, 0);
}

#[test]
fn visibility_violation_from_discovered_include_fails() {
    let s = Scratch::new();
    s.write("src/Bubfile", "contain b a ;\n");
    // b's header is scoped to package b; a's compile claims to include it.
    s.write("src/b/Bubfile", "static-lib blib : y.c y.h ;\n");
    s.write("src/b/y.c", "int y;\n");
    s.write("src/b/y.h", "extern int y;\n");
    s.write("src/a/Bubfile", "static-lib alib : x.c ;\n");
    s.write("src/a/x.c", "int x;\n");
    s.write("src/a/x.c.deps", "src/b/y.c\n");

    // y.c is a compiled source, protected inside package b, so the
    // discovered dependency is rejected with a locating message.
    let err = s.build().unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("cannot depend on"), "{msg}");
}

#[test]
fn library_rollup_absorbs_static_libs_into_dynamic_lib() {
    let s = Scratch::new();
    // s1 depends on s2 (via a discovered header); d contains both; the exe
    // uses s1 and must link only d.
    s.write(
        "src/Bubfile",
        "static-lib s2 : s2.c s2.h ;\n\
         static-lib s1 : s1.c s1.h ;\n\
         dynamic-lib d : s1 s2 ;\n\
         dist-exe app : main.c : m ;\n",
    );
    s.write("src/s2.c", "int s2;\n");
    s.write("src/s2.h", "extern int s2;\n");
    s.write("src/s1.c", "int s1;\n");
    s.write("src/s1.h", "extern int s1;\n");
    s.write("src/s1.c.deps", "src/s2.h\n");
    s.write("src/main.c", "int main;\n");
    s.write("src/main.c.deps", "src/s1.h\n");

    let (_, engine) = s.build().unwrap();

    let exe = engine.lookup_file(Path::new("dist/bin/app")).unwrap();
    let link = engine.file(exe).action.unwrap();
    let libs = &engine.action(link).libs;
    assert_eq!(
        libs.as_slice(),
        [PathBuf::from("dist/lib/libd.dlib")],
        "s1 and s2 are absorbed into d"
    );

    // The link command saw the rolled-up lib and the syslib flags.
    let cmd = s.read("dist/bin/app");
    assert!(cmd.contains("libs: dist/lib/libd.dlib"), "{cmd}");

    let flags = &engine.action(link).extra_flags;
    assert_eq!(flags.as_slice(), ["-lm"]);
}

#[test]
fn library_order_is_strictly_decreasing() {
    let s = Scratch::new();
    s.write(
        "src/Bubfile",
        "static-lib s2 : s2.c s2.h ;\n\
         static-lib s1 : s1.c s1.h ;\n\
         dist-exe app : main.c ;\n",
    );
    s.write("src/s2.c", "int s2;\n");
    s.write("src/s2.h", "extern int s2;\n");
    s.write("src/s1.c", "int s1;\n");
    s.write("src/s1.h", "extern int s1;\n");
    s.write("src/s1.c.deps", "src/s2.h\n");
    s.write("src/main.c", "int main;\n");
    s.write("src/main.c.deps", "src/s1.h src/s2.h\n");

    let (_, engine) = s.build().unwrap();

    let exe = engine.lookup_file(Path::new("dist/bin/app")).unwrap();
    let link = engine.file(exe).action.unwrap();
    let numbers: Vec<_> = engine
        .action(link)
        .libs
        .iter()
        .map(|p| engine.lookup_file(p).unwrap())
        .collect();
    assert_eq!(numbers.len(), 2);
    assert!(
        numbers.windows(2).all(|w| w[0] > w[1]),
        "link order must be descending: {numbers:?}"
    );
    // Leaf lib (s2) last.
    assert_eq!(
        engine.file(*numbers.last().unwrap()).path,
        Path::new("obj/libs2.slib")
    );
}

#[test]
fn failing_action_bails_and_recovers_on_next_run() {
    let s = Scratch::new();
    s.write(
        "Buboptions",
        "\
.c .obj = sh src/cc.sh ${INPUT} ${OUTPUT} ${DEPS}
.c .slib = cat ${INPUT} > ${OUTPUT}
",
    );
    s.write(
        "src/cc.sh",
        "#!/bin/sh\nif [ -f src/fail ]; then echo compile exploded >&2; exit 1; fi\n\
         cat $1 > $2 && echo $2: $1 > $3\n",
    );
    s.write("src/Bubfile", "static-lib foo : foo.c ;\n");
    s.write("src/foo.c", "int foo;\n");
    s.write("src/fail", "");

    let err = s.build().unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("outstanding"), "{msg}");
    assert!(!s.exists("obj/foo.obj"), "partial output must be deleted");

    // Fix the "source" and rebuild: only the broken chain runs.
    std::fs::remove_file(s.dir().join("src/fail")).unwrap();
    let (outcome, _) = s.build().unwrap();
    assert_eq!(outcome.updated, 2);
    assert!(s.exists("obj/libfoo.slib"));
}

#[test]
fn stale_cache_record_forces_rerun() {
    let s = Scratch::new();
    s.write("src/Bubfile", "static-lib foo : foo.c ;\n");
    s.write("src/foo.c", "int foo;\n");

    s.build().unwrap();
    std::fs::remove_file(s.dir().join("deps/obj/foo.obj")).unwrap();

    let (outcome, _) = s.build().unwrap();
    // The compile re-runs, and the fresh object drags the archive along.
    assert_eq!(outcome.updated, 2);

    let (third, _) = s.build().unwrap();
    assert_eq!(third.updated, 0);
}

#[test]
fn truncated_output_is_rebuilt() {
    let s = Scratch::new();
    s.write("src/Bubfile", "static-lib foo : foo.c ;\n");
    s.write("src/foo.c", "int foo;\n");

    s.build().unwrap();
    // A zero-length output reads as missing.
    s.write("obj/foo.obj", "");

    let (outcome, _) = s.build().unwrap();
    assert!(outcome.updated >= 1);
    assert!(s.read("obj/foo.obj").contains("int foo"));
}

#[test]
fn stale_outputs_are_pruned() {
    let s = Scratch::new();
    s.write("src/Bubfile", "static-lib foo : foo.c ;\n");
    s.write("src/foo.c", "int foo;\n");
    s.write("obj/leftover.obj", "old\n");
    s.write("obj/dead/deep.obj", "old\n");

    s.build().unwrap();

    assert!(!s.exists("obj/leftover.obj"));
    assert!(!s.exists("obj/dead"));
    assert!(s.exists("obj/foo.obj"));
}

#[test]
fn test_exe_produces_passed_sentinel() {
    let s = Scratch::new();
    s.write(
        "Buboptions",
        "\
.c .obj = cat ${INPUT} > ${OUTPUT} && echo ${OUTPUT}: ${INPUT} > ${DEPS}
.c .exe = printf '#!/bin/sh\\necho ok\\n' > ${OUTPUT} && chmod +x ${OUTPUT}
",
    );
    s.write("src/Bubfile", "test-exe check : check.c ;\n");
    s.write("src/check.c", "int main;\n");

    let (outcome, _) = s.build().unwrap();

    assert_eq!(outcome.updated, 3);
    assert!(s.exists("priv/test/check-passed"));
    assert!(s.read("priv/test/check-passed").contains("ok"));
}

#[test]
fn translate_copies_with_exec_bit() {
    let s = Scratch::new();
    s.write("src/Bubfile", "translate run.sh : dist/bin ;\n");
    s.write("src/run.sh", "#!/bin/sh\necho run\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            s.dir().join("src/run.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }

    s.build().unwrap();

    assert!(s.exists("dist/bin/run.sh"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(s.dir().join("dist/bin/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}

#[test]
fn package_depends_lists_discovered_edges() {
    let s = Scratch::new();
    s.write("src/Bubfile", "contain low high ;\n");
    s.write("src/low/Bubfile", "static-lib low : low.c low.h ;\n");
    s.write("src/low/low.c", "int low;\n");
    s.write("src/low/low.h", "extern int low;\n");
    s.write("src/high/Bubfile", "static-lib high : high.c ;\n");
    s.write("src/high/high.c", "int high;\n");
    s.write("src/high/high.c.deps", "src/low/low.h\n");

    s.build().unwrap();

    let text = s.read("package-depends");
    assert!(text.contains("high: low"), "{text}");
    let low_pos = text.find("low:").unwrap();
    let high_pos = text.find("high:").unwrap();
    assert!(low_pos < high_pos, "dependencies listed first: {text}");
}
