//! Placeholder rebinding.
//!
//! Query templates are written with `?` placeholders. PostgreSQL expects
//! numbered `$N` placeholders, MySQL and SQLite take `?` as is. Named
//! templates (`:name`) are compiled down to `?` first.
//!
//! Both rewrites skip string literals, quoted identifiers and comments.
//! `?` is only rewritten for PostgreSQL, so `rebind` scans with its rules.

use std::borrow::Cow;

/// Placeholder syntax expected by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
}

/// Lexical rules that differ between dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lexicon {
    /// `\'` escapes a quote inside a string literal (MySQL).
    pub backslash_escapes: bool,
    /// `$tag$ ... $tag$` string constants (PostgreSQL).
    pub dollar_quotes: bool,
    /// `/* /* */ */` nests (PostgreSQL).
    pub nested_comments: bool,
}

impl Lexicon {
    pub const POSTGRES: Self = Self {
        backslash_escapes: false,
        dollar_quotes: true,
        nested_comments: true,
    };
    pub const MYSQL: Self = Self {
        backslash_escapes: true,
        dollar_quotes: false,
        nested_comments: false,
    };
    pub const SQLITE: Self = Self {
        backslash_escapes: false,
        dollar_quotes: false,
        nested_comments: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    LineComment,
    BlockComment(usize),
    /// Inside a dollar-quoted constant; the tag is `bytes[open..open + len]`.
    DollarQuoted { open: usize, len: usize },
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Length of the `$tag$` opener at `idx`, if there is one.
fn dollar_tag(bytes: &[u8], idx: usize) -> Option<usize> {
    if idx > 0 && is_ident_byte(bytes[idx - 1]) {
        return None;
    }
    let rest = &bytes[idx + 1..];
    if rest.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    let tag_len = rest.iter().take_while(|b| is_ident_byte(**b)).count();
    (rest.get(tag_len) == Some(&b'$')).then_some(tag_len + 2)
}

/// Advance the lexical state machine over `bytes[idx]`.
///
/// Returns the new state and how many extra bytes were consumed.
fn step(state: State, bytes: &[u8], idx: usize, lexicon: Lexicon) -> (State, usize) {
    let b = bytes[idx];
    let next = bytes.get(idx + 1).copied();
    match state {
        State::Normal => match (b, next) {
            (b'\'', _) => (State::SingleQuoted, 0),
            (b'"', _) => (State::DoubleQuoted, 0),
            (b'`', _) => (State::Backtick, 0),
            (b'-', Some(b'-')) => (State::LineComment, 1),
            (b'/', Some(b'*')) => (State::BlockComment(1), 1),
            (b'$', _) if lexicon.dollar_quotes => match dollar_tag(bytes, idx) {
                Some(len) => (State::DollarQuoted { open: idx, len }, len - 1),
                None => (State::Normal, 0),
            },
            _ => (State::Normal, 0),
        },
        State::SingleQuoted => match (b, next) {
            (b'\'', Some(b'\'')) => (State::SingleQuoted, 1),
            (b'\\', Some(_)) if lexicon.backslash_escapes => (State::SingleQuoted, 1),
            (b'\'', _) => (State::Normal, 0),
            _ => (state, 0),
        },
        State::DoubleQuoted => match (b, next) {
            (b'"', Some(b'"')) => (State::DoubleQuoted, 1),
            (b'"', _) => (State::Normal, 0),
            _ => (state, 0),
        },
        State::Backtick => match b {
            b'`' => (State::Normal, 0),
            _ => (state, 0),
        },
        State::LineComment => match b {
            b'\n' => (State::Normal, 0),
            _ => (state, 0),
        },
        State::BlockComment(depth) => match (b, next) {
            (b'/', Some(b'*')) if lexicon.nested_comments => (State::BlockComment(depth + 1), 1),
            (b'*', Some(b'/')) if depth > 1 => (State::BlockComment(depth - 1), 1),
            (b'*', Some(b'/')) => (State::Normal, 1),
            _ => (state, 0),
        },
        State::DollarQuoted { open, len } => {
            if b == b'$' && bytes[idx..].starts_with(&bytes[open..open + len]) {
                (State::Normal, len - 1)
            } else {
                (state, 0)
            }
        }
    }
}

/// Rewrite `?` placeholders into the target style.
///
/// Returns the input unchanged (borrowed) when nothing needs rewriting.
pub fn rebind(sql: &str, style: PlaceholderStyle) -> Cow<'_, str> {
    if style == PlaceholderStyle::Question || !sql.contains('?') {
        return Cow::Borrowed(sql);
    }

    let lexicon = Lexicon::POSTGRES;
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut state = State::Normal;
    let mut copied_up_to = 0;
    let mut ordinal = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        if state == State::Normal && bytes[idx] == b'?' {
            ordinal += 1;
            out.push_str(&sql[copied_up_to..idx]);
            out.push('$');
            out.push_str(&ordinal.to_string());
            copied_up_to = idx + 1;
            idx += 1;
            continue;
        }
        let (next_state, skip) = step(state, bytes, idx, lexicon);
        state = next_state;
        idx += 1 + skip;
    }

    if ordinal == 0 {
        return Cow::Borrowed(sql);
    }
    out.push_str(&sql[copied_up_to..]);
    Cow::Owned(out)
}

/// Compile a `:name` template into a `?` template plus the ordered names.
///
/// `::` (PostgreSQL casts) is left alone, as is anything inside quotes or
/// comments as `lexicon` defines them.
pub fn compile_named(sql: &str, lexicon: Lexicon) -> (String, Vec<String>) {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut names = Vec::new();
    let mut state = State::Normal;
    let mut copied_up_to = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        if state == State::Normal && bytes[idx] == b':' {
            if bytes.get(idx + 1) == Some(&b':') {
                idx += 2;
                continue;
            }
            let start = idx + 1;
            let end = start
                + bytes[start..]
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                    .count();
            let preceded_by_colon = idx > 0 && bytes[idx - 1] == b':';
            if end > start && !preceded_by_colon {
                out.push_str(&sql[copied_up_to..idx]);
                out.push('?');
                names.push(sql[start..end].to_string());
                copied_up_to = end;
                idx = end;
                continue;
            }
        }
        let (next_state, skip) = step(state, bytes, idx, lexicon);
        state = next_state;
        idx += 1 + skip;
    }

    out.push_str(&sql[copied_up_to..]);
    (out, names)
}
