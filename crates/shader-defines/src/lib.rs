//! Macro-override injection and a minimal object-like `#define` preprocessor.
//!
//! Shaders are shipped as text with overridable constants:
//!
//! ```text
//! #ifndef _NBL_GLSL_WORKGROUP_SIZE_X_
//! #define _NBL_GLSL_WORKGROUP_SIZE_X_ 16
//! #endif
//! @compute @workgroup_size(_NBL_GLSL_WORKGROUP_SIZE_X_, 1, 1)
//! ```
//!
//! [`inject`] prepends `#define NAME VALUE` lines (after a leading `#version`
//! line, if present) and [`preprocess`] resolves the directives, producing
//! text a compiler without a preprocessor (WGSL) accepts.

use std::collections::HashMap;
use thiserror::Error;

/// Maximum nesting of macro expansion before giving up.
const MAX_EXPANSION_DEPTH: usize = 16;

/// Errors produced while preprocessing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
    /// `#else` or `#endif` without a matching `#if*`
    #[error("line {line}: unbalanced #{directive}")]
    Unbalanced { line: usize, directive: String },

    /// End of input inside a conditional block
    #[error("unterminated conditional opened at line {line}")]
    Unterminated { line: usize },

    /// Directive is missing its macro name or is otherwise malformed
    #[error("line {line}: malformed directive: {text}")]
    Malformed { line: usize, text: String },

    /// Function-like macros are not supported
    #[error("line {line}: function-like macro {name} is not supported")]
    FunctionLike { line: usize, name: String },

    /// Macro values reference each other too deeply (or cyclically)
    #[error("macro expansion of {name} exceeds depth {}", MAX_EXPANSION_DEPTH)]
    Recursion { name: String },
}

/// Insert `#define` lines for each override.
///
/// Overrides land after a leading `#version` line so GLSL sources stay valid,
/// otherwise at the very top.
pub fn inject<N: AsRef<str>, V: AsRef<str>>(source: &str, defines: &[(N, V)]) -> String {
    let mut block = String::new();
    for (name, value) in defines {
        block.push_str("#define ");
        block.push_str(name.as_ref());
        block.push(' ');
        block.push_str(value.as_ref());
        block.push('\n');
    }

    let first_line_end = source.find('\n');
    match first_line_end {
        Some(end) if source[..end].trim_start().starts_with("#version") => {
            let (head, tail) = source.split_at(end + 1);
            format!("{head}{block}{tail}")
        }
        None if source.trim_start().starts_with("#version") => {
            format!("{source}\n{block}")
        }
        _ => format!("{block}{source}"),
    }
}

struct Conditional {
    opened_at: usize,
    /// Whether the enclosing block was active when this one opened.
    parent_active: bool,
    /// Whether the current branch emits text.
    active: bool,
    seen_else: bool,
}

/// Resolve `#define`, `#undef`, `#ifdef`, `#ifndef`, `#else` and `#endif`.
///
/// Other directives (`#version`, `#extension`, ...) pass through untouched.
/// Identifiers are substituted outside `//` comments.
pub fn preprocess(source: &str) -> Result<String, PreprocessError> {
    let mut macros: HashMap<String, String> = HashMap::new();
    let mut stack: Vec<Conditional> = Vec::new();
    let mut out = String::with_capacity(source.len());

    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let active = stack.last().map_or(true, |c| c.active);
        let trimmed = raw.trim_start();

        if let Some(directive) = trimmed.strip_prefix('#') {
            let directive = directive.trim_start();
            let (keyword, rest) = split_word(directive);
            match keyword {
                "define" => {
                    if active {
                        let (name, value) = split_word(rest.trim_start());
                        if !is_identifier(name) {
                            if let Some(paren) = name.find('(') {
                                return Err(PreprocessError::FunctionLike {
                                    line: line_no,
                                    name: name[..paren].to_string(),
                                });
                            }
                            return Err(malformed(line_no, raw));
                        }
                        macros.insert(name.to_string(), strip_comment(value).trim().to_string());
                    }
                    continue;
                }
                "undef" => {
                    if active {
                        let (name, _) = split_word(rest.trim_start());
                        if !is_identifier(name) {
                            return Err(malformed(line_no, raw));
                        }
                        macros.remove(name);
                    }
                    continue;
                }
                "ifdef" | "ifndef" => {
                    let (name, _) = split_word(rest.trim_start());
                    if !is_identifier(name) {
                        return Err(malformed(line_no, raw));
                    }
                    let defined = macros.contains_key(name);
                    let taken = if keyword == "ifdef" { defined } else { !defined };
                    stack.push(Conditional {
                        opened_at: line_no,
                        parent_active: active,
                        active: active && taken,
                        seen_else: false,
                    });
                    continue;
                }
                "else" => {
                    let Some(top) = stack.last_mut() else {
                        return Err(unbalanced(line_no, "else"));
                    };
                    if top.seen_else {
                        return Err(unbalanced(line_no, "else"));
                    }
                    top.seen_else = true;
                    top.active = top.parent_active && !top.active;
                    continue;
                }
                "endif" => {
                    if stack.pop().is_none() {
                        return Err(unbalanced(line_no, "endif"));
                    }
                    continue;
                }
                _ => {}
            }
        }

        if active {
            out.push_str(&substitute(raw, &macros)?);
            out.push('\n');
        }
    }

    if let Some(open) = stack.last() {
        return Err(PreprocessError::Unterminated { line: open.opened_at });
    }
    Ok(out)
}

/// Inject overrides and preprocess in one step.
pub fn resolve<N: AsRef<str>, V: AsRef<str>>(
    source: &str,
    defines: &[(N, V)],
) -> Result<String, PreprocessError> {
    preprocess(&inject(source, defines))
}

fn malformed(line: usize, text: &str) -> PreprocessError {
    PreprocessError::Malformed { line, text: text.trim().to_string() }
}

fn unbalanced(line: usize, directive: &str) -> PreprocessError {
    PreprocessError::Unbalanced { line, directive: directive.to_string() }
}

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

fn strip_comment(s: &str) -> &str {
    match s.find("//") {
        Some(i) => &s[..i],
        None => s,
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn substitute(line: &str, macros: &HashMap<String, String>) -> Result<String, PreprocessError> {
    if macros.is_empty() {
        return Ok(line.to_string());
    }
    let (code, comment) = match line.find("//") {
        Some(i) => line.split_at(i),
        None => (line, ""),
    };
    let mut out = expand(code, macros, 0)?;
    out.push_str(comment);
    Ok(out)
}

fn expand(text: &str, macros: &HashMap<String, String>, depth: usize) -> Result<String, PreprocessError> {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'_' || c.is_ascii_alphabetic() {
            let start = i;
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            let word = &text[start..i];
            match macros.get(word) {
                Some(value) => {
                    if depth >= MAX_EXPANSION_DEPTH {
                        return Err(PreprocessError::Recursion { name: word.to_string() });
                    }
                    out.push_str(&expand(value, macros, depth + 1)?);
                }
                None => out.push_str(word),
            }
        } else if c.is_ascii_digit() {
            // numeric literals such as 16u or 1e5 are never macro names
            let start = i;
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i] == b'.' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            out.push_str(&text[start..i]);
        } else {
            let ch_len = text[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
        }
    }
    Ok(out)
}
