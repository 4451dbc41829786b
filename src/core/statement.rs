//! Build-file parsing.
//!
//! A build file is a sequence of statements:
//!
//! ```text
//! rule target… [: arg1… [: arg2… [: arg3…]]] ;
//! # comment
//! [tag] { … }        body used iff tag is an enabled architecture
//! ```

use std::path::Path;

use crate::core::error::{BuildError, Origin};

/// One parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub rule: String,
    pub targets: Vec<String>,
    /// Colon-separated argument groups after the targets.
    pub args: Vec<Vec<String>>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: u32,
}

/// Parse the build file at `path`. `origin_path` is the build-dir-relative
/// path used in diagnostics; `architectures` filters conditional blocks.
pub fn parse_build_file(
    path: &Path,
    origin_path: &Path,
    architectures: &[String],
) -> Result<Vec<Statement>, BuildError> {
    let origin = Origin::new(origin_path, 0);
    let text = std::fs::read_to_string(path).map_err(|_| {
        BuildError::config(&origin, format!("missing build file {}", path.display()))
    })?;
    parse_statements(&text, origin_path, architectures)
}

/// Parse build-file text into a statement stream.
pub fn parse_statements(
    text: &str,
    origin_path: &Path,
    architectures: &[String],
) -> Result<Vec<Statement>, BuildError> {
    let tokens = tokenize(text);
    let mut pos = 0;
    let mut out = Vec::new();
    parse_block(&tokens, &mut pos, origin_path, architectures, false, &mut out)?;
    Ok(out)
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx as u32 + 1;
        let content = strip_comment(raw);
        let mut word = String::new();
        for ch in content.chars() {
            match ch {
                c if c.is_whitespace() => flush(&mut word, line, &mut tokens),
                ';' | ':' | '{' | '}' => {
                    flush(&mut word, line, &mut tokens);
                    tokens.push(Token {
                        text: ch.to_string(),
                        line,
                    });
                }
                c => word.push(c),
            }
        }
        flush(&mut word, line, &mut tokens);
    }
    tokens
}

/// A comment starts at a `#` that opens the line or follows whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn flush(word: &mut String, line: u32, tokens: &mut Vec<Token>) {
    if !word.is_empty() {
        tokens.push(Token {
            text: std::mem::take(word),
            line,
        });
    }
}

fn parse_block(
    tokens: &[Token],
    pos: &mut usize,
    origin_path: &Path,
    architectures: &[String],
    nested: bool,
    out: &mut Vec<Statement>,
) -> Result<(), BuildError> {
    while *pos < tokens.len() {
        let tok = &tokens[*pos];
        let origin = Origin::new(origin_path, tok.line);

        if tok.text == "}" {
            if nested {
                *pos += 1;
                return Ok(());
            }
            return Err(BuildError::config(&origin, "unexpected `}`"));
        }

        if let Some(tag) = conditional_tag(&tok.text) {
            *pos += 1;
            if !tokens.get(*pos).is_some_and(|t| t.text == "{") {
                return Err(BuildError::config(
                    &origin,
                    format!("expected `{{` after [{tag}]"),
                ));
            }
            *pos += 1;
            let enabled = architectures.iter().any(|a| a == tag);
            let mut body = Vec::new();
            parse_block(tokens, pos, origin_path, architectures, true, &mut body)?;
            if enabled {
                out.extend(body);
            }
            continue;
        }

        out.push(parse_statement(tokens, pos, origin_path)?);
    }

    if nested {
        let origin = Origin::new(origin_path, last_line(tokens));
        return Err(BuildError::config(&origin, "unterminated conditional block"));
    }
    Ok(())
}

fn parse_statement(
    tokens: &[Token],
    pos: &mut usize,
    origin_path: &Path,
) -> Result<Statement, BuildError> {
    let first = &tokens[*pos];
    let origin = Origin::new(origin_path, first.line);
    let rule = first.text.clone();
    *pos += 1;

    let mut fields: Vec<Vec<String>> = vec![Vec::new()];
    loop {
        let Some(tok) = tokens.get(*pos) else {
            return Err(BuildError::config(
                &origin,
                format!("statement `{rule}` not terminated by `;`"),
            ));
        };
        *pos += 1;
        match tok.text.as_str() {
            ";" => break,
            ":" => fields.push(Vec::new()),
            "{" | "}" => {
                return Err(BuildError::config(
                    &origin,
                    format!("unexpected `{}` inside statement `{rule}`", tok.text),
                ));
            }
            word => fields.last_mut().unwrap().push(word.to_string()),
        }
    }

    let targets = fields.remove(0);
    if targets.is_empty() {
        return Err(BuildError::config(
            &origin,
            format!("statement `{rule}` names no targets"),
        ));
    }

    Ok(Statement {
        rule,
        targets,
        args: fields,
        line: first.line,
    })
}

fn conditional_tag(text: &str) -> Option<&str> {
    text.strip_prefix('[').and_then(|t| t.strip_suffix(']'))
}

fn last_line(tokens: &[Token]) -> u32 {
    tokens.last().map(|t| t.line).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(text: &str, archs: &[&str]) -> Result<Vec<Statement>, BuildError> {
        let archs: Vec<String> = archs.iter().map(|s| s.to_string()).collect();
        parse_statements(text, &PathBuf::from("src/Bubfile"), &archs)
    }

    #[test]
    fn test_simple_statement() {
        let stmts = parse("static-lib foo : foo.c util.c ;\n", &[]).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].rule, "static-lib");
        assert_eq!(stmts[0].targets, ["foo"]);
        assert_eq!(stmts[0].args, [vec!["foo.c".to_string(), "util.c".to_string()]]);
        assert_eq!(stmts[0].line, 1);
    }

    #[test]
    fn test_multiple_arg_groups() {
        let stmts = parse("dist-exe app : main.c : z m ;\n", &[]).unwrap();
        assert_eq!(stmts[0].args.len(), 2);
        assert_eq!(stmts[0].args[1], ["z", "m"]);
    }

    #[test]
    fn test_comments_ignored() {
        let stmts = parse("# header\ncontain a b ; # trailing\n", &[]).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].targets, ["a", "b"]);
    }

    #[test]
    fn test_conditional_block_enabled() {
        let text = "[linux] {\n  static-lib posix : posix.c ;\n}\ncontain core ;\n";
        let on = parse(text, &["linux"]).unwrap();
        assert_eq!(on.len(), 2);
        assert_eq!(on[0].rule, "static-lib");

        let off = parse(text, &["windows"]).unwrap();
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].rule, "contain");
    }

    #[test]
    fn test_tight_punctuation() {
        let stmts = parse("contain a:protected;\n", &[]).unwrap();
        assert_eq!(stmts[0].targets, ["a"]);
        assert_eq!(stmts[0].args, [vec!["protected".to_string()]]);
    }

    #[test]
    fn test_unterminated_statement() {
        assert!(parse("contain a\n", &[]).is_err());
    }

    #[test]
    fn test_unterminated_block() {
        assert!(parse("[linux] {\ncontain a ;\n", &["linux"]).is_err());
    }

    #[test]
    fn test_missing_targets() {
        assert!(parse("contain ;\n", &[]).is_err());
    }
}
