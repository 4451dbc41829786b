//! The options store.
//!
//! Owns the option variables and per-extension build rules read from the
//! `Buboptions` file, and performs command-template expansion.
//!
//! Rule declarations are keys beginning with a dot:
//!
//! ```text
//! .c .obj .obj.d = gcc -c ${INPUT} -o ${OUTPUT} -MMD -MF ${DEPS} ${CFLAGS}
//! .c .slib      = ar csr ${OUTPUT} ${INPUT}
//! ```
//!
//! The first output extension selects the rule kind (`.obj` compile, `.slib`
//! static-lib, `.dlib` dynamic-lib, `.exe` executable, anything else a
//! generate rule). Output extensions after the first are companions the tool
//! may leave beside the primary output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::error::{BuildError, Origin};
use crate::util::fs;

pub const OPTIONS_FILE: &str = "Buboptions";
pub const ENVIRONMENT_FILE: &str = "environment";

/// What a build rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Compile,
    StaticLib,
    DynamicLib,
    Exe,
    Generate,
}

impl RuleKind {
    fn from_output_ext(ext: &str) -> RuleKind {
        match ext {
            ".obj" => RuleKind::Compile,
            ".slib" => RuleKind::StaticLib,
            ".dlib" => RuleKind::DynamicLib,
            ".exe" => RuleKind::Exe,
            _ => RuleKind::Generate,
        }
    }
}

/// A per-extension build rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Source extension including the dot, e.g. `.c`.
    pub source_ext: String,
    pub kind: RuleKind,
    /// Output extensions; the first is the primary, the rest companions.
    pub output_exts: Vec<String>,
    /// Unexpanded command template.
    pub template: String,
}

impl Rule {
    /// Companion extensions a run of this rule may leave beside its primary.
    pub fn companion_exts(&self) -> &[String] {
        &self.output_exts[1..]
    }
}

/// Read-only store of option variables and build rules.
#[derive(Debug)]
pub struct Options {
    vars: HashMap<String, Vec<String>>,
    rules: HashMap<(String, RuleKind), Rule>,
    /// Build-dir-relative path of the options file itself.
    pub path: PathBuf,
}

impl Options {
    /// Load and parse the options file from the build directory.
    pub fn load(build_dir: &Path) -> Result<Options, BuildError> {
        let path = build_dir.join(OPTIONS_FILE);
        let origin = Origin::new(OPTIONS_FILE, 0);
        let text = std::fs::read_to_string(&path).map_err(|_| {
            BuildError::config(&origin, format!("missing options file {}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parse options-file text: `KEY = tokens…` lines, `#` comments.
    pub fn parse(text: &str) -> Result<Options, BuildError> {
        let mut opts = Options {
            vars: HashMap::new(),
            rules: HashMap::new(),
            path: PathBuf::from(OPTIONS_FILE),
        };

        for (idx, raw) in text.lines().enumerate() {
            let origin = Origin::new(OPTIONS_FILE, idx as u32 + 1);
            let line = strip_comment(raw);
            if line.trim().is_empty() {
                continue;
            }
            let Some((lhs, rhs)) = line.split_once('=') else {
                return Err(BuildError::config(
                    &origin,
                    format!("malformed option line: {}", raw.trim()),
                ));
            };
            let keys: Vec<&str> = lhs.split_whitespace().collect();
            let value: Vec<String> = rhs.split_whitespace().map(str::to_string).collect();

            match keys.as_slice() {
                [] => {
                    return Err(BuildError::config(&origin, "option line without a key"));
                }
                [key] if !key.starts_with('.') => {
                    opts.vars.insert(key.to_string(), value);
                }
                _ => {
                    opts.add_rule(&origin, &keys, rhs.trim())?;
                }
            }
        }

        Ok(opts)
    }

    fn add_rule(&mut self, origin: &Origin, keys: &[&str], template: &str) -> Result<(), BuildError> {
        if keys.len() < 2 || keys.iter().any(|k| !k.starts_with('.')) {
            return Err(BuildError::config(
                origin,
                format!("malformed rule declaration: {}", keys.join(" ")),
            ));
        }
        let source_ext = keys[0].to_string();
        let output_exts: Vec<String> = keys[1..].iter().map(|s| s.to_string()).collect();
        let kind = RuleKind::from_output_ext(&output_exts[0]);
        if self
            .rules
            .insert(
                (source_ext.clone(), kind),
                Rule {
                    source_ext: source_ext.clone(),
                    kind,
                    output_exts,
                    template: template.to_string(),
                },
            )
            .is_some()
        {
            return Err(BuildError::config(
                origin,
                format!("duplicate rule for {source_ext}"),
            ));
        }
        Ok(())
    }

    /// Look up an option variable. A missing name yields the empty list.
    pub fn option(&self, name: &str) -> &[String] {
        self.vars.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The rule that turns `ext` sources into `kind` outputs.
    pub fn rule_for(&self, ext: &str, kind: RuleKind) -> Option<&Rule> {
        self.rules.get(&(ext.to_string(), kind))
    }

    /// All declared rules.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Architecture tags enabling conditional build-file blocks.
    pub fn architectures(&self) -> &[String] {
        self.option("ARCHITECTURE")
    }

    /// Expand a command template to a fixed point.
    ///
    /// `${NAME}` tokens inside a whitespace-delimited word are replaced by
    /// the cross product of the word's prefix/suffix with the value's
    /// whitespace-split tokens. Names resolve through `extras`, then the
    /// option variables, then the process environment; unknown names expand
    /// to nothing. `extra_flags` are appended verbatim.
    pub fn resolve_command(
        &self,
        template: &str,
        extras: &HashMap<String, String>,
        extra_flags: &[String],
    ) -> Result<String, BuildError> {
        let origin = Origin::new(OPTIONS_FILE, 0);
        let mut current = template.split_whitespace().collect::<Vec<_>>().join(" ");
        for _ in 0..MAX_EXPANSION_PASSES {
            let (next, changed) = self.expand_once(&current, extras, &origin)?;
            if !changed {
                let mut out = next;
                if !extra_flags.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&extra_flags.join(" "));
                }
                return Ok(out);
            }
            current = next;
        }
        Err(BuildError::config(
            &origin,
            format!("unterminated variable expansion in `{template}`"),
        ))
    }

    fn expand_once(
        &self,
        input: &str,
        extras: &HashMap<String, String>,
        origin: &Origin,
    ) -> Result<(String, bool), BuildError> {
        let mut words: Vec<String> = Vec::new();
        let mut changed = false;

        for word in input.split_whitespace() {
            match word.find("${") {
                Some(start) => {
                    let rest = &word[start + 2..];
                    let Some(end) = rest.find('}') else {
                        return Err(BuildError::config(
                            origin,
                            format!("unterminated ${{ in `{word}`"),
                        ));
                    };
                    let name = &rest[..end];
                    let prefix = &word[..start];
                    let suffix = &rest[end + 1..];
                    let value = self.lookup(name, extras);
                    for v in value.split_whitespace() {
                        words.push(format!("{prefix}{v}{suffix}"));
                    }
                    changed = true;
                }
                None => {
                    if word.contains('{') || word.contains('}') {
                        return Err(BuildError::config(
                            origin,
                            format!("unmatched brace in `{word}`"),
                        ));
                    }
                    words.push(word.to_string());
                }
            }
        }

        Ok((words.join(" "), changed))
    }

    fn lookup(&self, name: &str, extras: &HashMap<String, String>) -> String {
        if let Some(v) = extras.get(name) {
            return v.clone();
        }
        if let Some(v) = self.vars.get(name) {
            return v.join(" ");
        }
        std::env::var(name).unwrap_or_default()
    }
}

const MAX_EXPANSION_PASSES: usize = 20;

/// A comment starts at a `#` that opens the line or follows whitespace, so
/// a `#` embedded in a command template survives.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

/// Read the `environment` file and export its `KEY=VAL` lines into the
/// process environment, so both template expansion and child processes
/// observe them.
pub fn load_environment(build_dir: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let path = build_dir.join(ENVIRONMENT_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path)?;
    let mut vars = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            std::env::set_var(key.trim(), val.trim());
            vars.push((key.trim().to_string(), val.trim().to_string()));
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(text: &str) -> Options {
        Options::parse(text).unwrap()
    }

    #[test]
    fn test_parse_vars_and_rules() {
        let o = opts(
            "CFLAGS = -Wall -O2\n\
             ARCHITECTURE = linux\n\
             # comment\n\
             .c .obj .obj.d = gcc -c ${INPUT} -o ${OUTPUT} -MMD -MF ${DEPS}\n\
             .c .slib = ar csr ${OUTPUT} ${INPUT}\n",
        );
        assert_eq!(o.option("CFLAGS"), ["-Wall", "-O2"]);
        assert!(o.option("MISSING").is_empty());

        let rule = o.rule_for(".c", RuleKind::Compile).unwrap();
        assert_eq!(rule.output_exts[0], ".obj");
        assert_eq!(rule.companion_exts(), [".obj.d"]);
        assert!(o.rule_for(".c", RuleKind::StaticLib).is_some());
        assert!(o.rule_for(".c", RuleKind::Exe).is_none());
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(Options::parse("JUSTAKEY\n").is_err());
        assert!(Options::parse(".c = missing output ext\n").is_err());
    }

    #[test]
    fn test_resolve_no_placeholders_is_trimmed() {
        let o = opts("");
        let cmd = o
            .resolve_command("  gcc   -c  foo.c ", &HashMap::new(), &[])
            .unwrap();
        assert_eq!(cmd, "gcc -c foo.c");
    }

    #[test]
    fn test_cross_product_expansion() {
        let o = opts("LIBS = foo bar\n");
        let cmd = o
            .resolve_command("ld -l${LIBS} -o out", &HashMap::new(), &[])
            .unwrap();
        assert_eq!(cmd, "ld -lfoo -lbar -o out");
    }

    #[test]
    fn test_extras_shadow_options() {
        let o = opts("INPUT = from-options\n");
        let mut extras = HashMap::new();
        extras.insert("INPUT".to_string(), "from-extras".to_string());
        let cmd = o.resolve_command("cc ${INPUT}", &extras, &[]).unwrap();
        assert_eq!(cmd, "cc from-extras");
    }

    #[test]
    fn test_nested_expansion_fixed_point() {
        let o = opts("A = ${B} tail\nB = inner\n");
        let cmd = o.resolve_command("run ${A}", &HashMap::new(), &[]).unwrap();
        assert_eq!(cmd, "run inner tail");
    }

    #[test]
    fn test_cyclic_expansion_rejected() {
        let o = opts("A = ${B}\nB = ${A}\n");
        let err = o
            .resolve_command("run ${A}", &HashMap::new(), &[])
            .unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_unmatched_brace_fatal() {
        let o = opts("");
        assert!(o
            .resolve_command("cc ${INPUT", &HashMap::new(), &[])
            .is_err());
        assert!(o
            .resolve_command("cc IN}PUT", &HashMap::new(), &[])
            .is_err());
    }

    #[test]
    fn test_empty_value_drops_word() {
        let o = opts("");
        let cmd = o
            .resolve_command("ld -l${LIBS} -o out", &HashMap::new(), &[])
            .unwrap();
        assert_eq!(cmd, "ld -o out");
    }

    #[test]
    fn test_extra_flags_appended() {
        let o = opts("");
        let cmd = o
            .resolve_command("ld -o out", &HashMap::new(), &["-lz".to_string()])
            .unwrap();
        assert_eq!(cmd, "ld -o out -lz");
    }
}
