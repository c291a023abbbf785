//! Static pre-scan of snippet source.
//!
//! This is the inner, language-level layer: it rejects obvious capability
//! grabs before a worker is ever spawned. It tokenizes just enough Python to
//! skip strings and comments and to recognise import statements; anything it
//! misses is still confined by the restricted builtins inside the worker.

use super::policy::RestrictedRuntime;
use std::fmt;

/// Builtins that must not be referenced at all, even where they would
/// resolve to nothing inside the worker.
const FORBIDDEN_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "__import__",
    "__builtins__",
    "__loader__",
    "__spec__",
];

/// Frame and generator attributes that lead back to the interpreter's
/// internals without a leading underscore.
const FORBIDDEN_ATTRIBUTES: &[&str] = &[
    "gi_frame",
    "gi_code",
    "cr_frame",
    "ag_frame",
    "tb_frame",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
];

/// The only underscore attributes a snippet may touch.
const PUBLIC_DUNDERS: &[&str] = &["__init__", "__name__", "__doc__", "__version__"];

#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    ForbiddenModule(String),
    RelativeImport,
    ForbiddenName(String),
    ForbiddenAttribute(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub line: usize,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::ForbiddenModule(m) => {
                write!(f, "line {}: import of module '{}' is not allowed", self.line, m)
            }
            ViolationKind::RelativeImport => {
                write!(f, "line {}: relative imports are not allowed", self.line)
            }
            ViolationKind::ForbiddenName(n) => {
                write!(f, "line {}: use of '{}' is not allowed", self.line, n)
            }
            ViolationKind::ForbiddenAttribute(a) => {
                write!(f, "line {}: access to attribute '{}' is not allowed", self.line, a)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Dot,
    Comma,
    Open,
    Close,
    Colon,
    /// Logical line end: newline outside brackets, or `;`.
    End,
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

/// Check snippet source against a configured runtime. Returns the first
/// violation found.
pub fn check_snippet(code: &str, runtime: &RestrictedRuntime) -> Result<(), Violation> {
    let tokens = tokenize(code);
    let mut i = 0;
    while i < tokens.len() {
        let at_statement_start = i == 0
            || matches!(tokens[i - 1].tok, Tok::End | Tok::Colon);
        match &tokens[i].tok {
            Tok::Ident(word) if word == "import" => {
                i = check_import_names(&tokens, i + 1, runtime)?;
                continue;
            }
            Tok::Ident(word) if word == "from" && at_statement_start => {
                i = check_from_import(&tokens, i + 1, runtime)?;
                continue;
            }
            Tok::Ident(word) => {
                let after_dot = i > 0 && tokens[i - 1].tok == Tok::Dot;
                if after_dot && attribute_forbidden(word) {
                    return Err(Violation {
                        kind: ViolationKind::ForbiddenAttribute(word.clone()),
                        line: tokens[i].line,
                    });
                }
                if !after_dot && FORBIDDEN_NAMES.contains(&word.as_str()) {
                    return Err(Violation {
                        kind: ViolationKind::ForbiddenName(word.clone()),
                        line: tokens[i].line,
                    });
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

/// `import a.b as c, d`: returns the index after the statement.
fn check_import_names(
    tokens: &[Token],
    mut i: usize,
    runtime: &RestrictedRuntime,
) -> Result<usize, Violation> {
    loop {
        let line = tokens.get(i).map(|t| t.line).unwrap_or(0);
        let (name, next) = read_dotted(tokens, i);
        i = next;
        if name.is_empty() {
            return Ok(i);
        }
        ensure_module(&name, line, runtime)?;
        // optional alias
        if matches!(tokens.get(i), Some(Token { tok: Tok::Ident(w), .. }) if w == "as") {
            i += 2;
        }
        match tokens.get(i).map(|t| &t.tok) {
            Some(Tok::Comma) => i += 1,
            _ => return Ok(i),
        }
    }
}

/// `from a.b import c`: returns the index after the module name.
fn check_from_import(
    tokens: &[Token],
    i: usize,
    runtime: &RestrictedRuntime,
) -> Result<usize, Violation> {
    let line = tokens.get(i).map(|t| t.line).unwrap_or(0);
    if matches!(tokens.get(i).map(|t| &t.tok), Some(Tok::Dot)) {
        return Err(Violation {
            kind: ViolationKind::RelativeImport,
            line,
        });
    }
    let (name, next) = read_dotted(tokens, i);
    if !name.is_empty() {
        ensure_module(&name, line, runtime)?;
    }
    // Step over the `import` keyword so it is not read as a plain import.
    // The imported names are local bindings and still go through the name
    // check afterwards.
    match tokens.get(next).map(|t| &t.tok) {
        Some(Tok::Ident(w)) if w == "import" => {
            check_imported_members(tokens, next + 1, &name, runtime)?;
            Ok(next + 1)
        }
        _ => Ok(next),
    }
}

/// `c, d as e` or `(c, d)` after `from m import`.
fn check_imported_members(
    tokens: &[Token],
    mut i: usize,
    module: &str,
    runtime: &RestrictedRuntime,
) -> Result<(), Violation> {
    if matches!(tokens.get(i).map(|t| &t.tok), Some(Tok::Open)) {
        i += 1;
    }
    while let Some(Token { tok: Tok::Ident(member), line }) = tokens.get(i) {
        if !runtime.member_visible(module, member) {
            return Err(Violation {
                kind: ViolationKind::ForbiddenAttribute(member.clone()),
                line: *line,
            });
        }
        i += 1;
        if matches!(tokens.get(i), Some(Token { tok: Tok::Ident(w), .. }) if w == "as") {
            i += 2;
        }
        match tokens.get(i).map(|t| &t.tok) {
            Some(Tok::Comma) => i += 1,
            _ => break,
        }
    }
    Ok(())
}

/// Private and dunder attributes reach module internals (`random._os`) and
/// the object graph (`__class__`, `__globals__`), so all of them are out.
fn attribute_forbidden(name: &str) -> bool {
    if name.starts_with('_') {
        return !PUBLIC_DUNDERS.contains(&name);
    }
    FORBIDDEN_ATTRIBUTES.contains(&name)
}

fn ensure_module(name: &str, line: usize, runtime: &RestrictedRuntime) -> Result<(), Violation> {
    if runtime.module_allowed(name) {
        Ok(())
    } else {
        Err(Violation {
            kind: ViolationKind::ForbiddenModule(name.to_string()),
            line,
        })
    }
}

fn read_dotted(tokens: &[Token], mut i: usize) -> (String, usize) {
    let mut name = String::new();
    while let Some(Token { tok: Tok::Ident(part), .. }) = tokens.get(i) {
        name.push_str(part);
        i += 1;
        if matches!(tokens.get(i).map(|t| &t.tok), Some(Tok::Dot)) {
            name.push('.');
            i += 1;
        } else {
            break;
        }
    }
    (name, i)
}

fn tokenize(code: &str) -> Vec<Token> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut depth: usize = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Token { tok: Tok::End, line });
                }
                line += 1;
                i += 1;
            }
            '\\' if chars.get(i + 1) == Some(&'\n') => {
                line += 1;
                i += 2;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ';' => {
                tokens.push(Token { tok: Tok::End, line });
                i += 1;
            }
            '.' => {
                // Float literals such as `.5` are not attribute access.
                if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    tokens.push(Token { tok: Tok::Other, line });
                    i += 1;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                } else {
                    tokens.push(Token { tok: Tok::Dot, line });
                    i += 1;
                }
            }
            ',' => {
                tokens.push(Token { tok: Tok::Comma, line });
                i += 1;
            }
            ':' => {
                tokens.push(Token { tok: Tok::Colon, line });
                i += 1;
            }
            '(' | '[' | '{' => {
                depth += 1;
                tokens.push(Token { tok: Tok::Open, line });
                i += 1;
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                tokens.push(Token { tok: Tok::Close, line });
                i += 1;
            }
            '\'' | '"' => {
                i = skip_string(&chars, i, &mut line);
                tokens.push(Token { tok: Tok::Other, line });
            }
            c if c.is_ascii_digit() => {
                // Numbers, including `1.5e3` and `0x1f`; a trailing `.` is
                // consumed so `1.real` style access is not misread.
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token { tok: Tok::Other, line });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if i < chars.len() && (chars[i] == '\'' || chars[i] == '"') && is_string_prefix(&word) {
                    i = skip_string(&chars, i, &mut line);
                    tokens.push(Token { tok: Tok::Other, line });
                } else {
                    tokens.push(Token { tok: Tok::Ident(word), line });
                }
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                tokens.push(Token { tok: Tok::Other, line });
                i += 1;
            }
        }
    }
    tokens
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

/// Skip a string literal starting at the opening quote; returns the index
/// after the closing quote (or end of input for an unterminated literal).
fn skip_string(chars: &[char], start: usize, line: &mut usize) -> usize {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            // Even in raw strings a backslash protects the next quote.
            if chars.get(i + 1) == Some(&'\n') {
                *line += 1;
            }
            i += 2;
            continue;
        }
        if c == '\n' {
            *line += 1;
            if !triple {
                return i;
            }
        }
        if c == quote {
            if !triple {
                return i + 1;
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return i + 3;
            }
        }
        i += 1;
    }
    chars.len()
}
