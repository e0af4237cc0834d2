//! Lightweight scan for `require` calls in Lua source
//!
//! Only calls with a single literal argument are recognized:
//! `require("a.b")`, `require 'a.b'`. Comments and string contents are
//! skipped, and member calls such as `obj.require(...)` are ignored.

use std::ops::Range;

/// A `require` call with a literal module name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireCall {
    pub name: String,
    /// Byte range of the string literal, quotes included
    pub span: Range<usize>,
}

pub fn scan_requires(source: &str) -> Vec<RequireCall> {
    let bytes = source.as_bytes();
    let mut calls = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_comment(bytes, i + 2),
            b'"' | b'\'' => i = skip_short_string(bytes, i),
            b'[' => match long_bracket_level(bytes, i) {
                Some(level) => i = skip_long_bracket(bytes, i, level),
                None => i += 1,
            },
            c if is_ident_start(c) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                if &source[start..i] == "require" && !is_member_access(bytes, start) {
                    if let Some(call) = parse_call(source, i) {
                        i = call.span.end;
                        calls.push(call);
                    }
                }
            }
            _ => i += 1,
        }
    }

    calls
}

/// Replace the literal of every resolved call with the resolved module id
pub fn rewrite_requires<F>(source: &str, calls: &[RequireCall], mut resolve: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for call in calls {
        let Some(id) = resolve(&call.name) else {
            continue;
        };
        out.push_str(&source[last..call.span.start]);
        out.push_str(&lua_string(&id));
        last = call.span.end;
    }
    out.push_str(&source[last..]);
    out
}

/// Quote `s` as a Lua string literal
pub fn lua_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn parse_call(source: &str, after_name: usize) -> Option<RequireCall> {
    let bytes = source.as_bytes();
    let mut j = skip_whitespace(bytes, after_name);
    let parenthesized = bytes.get(j) == Some(&b'(');
    if parenthesized {
        j = skip_whitespace(bytes, j + 1);
    }

    let (name, literal) = string_literal(source, j)?;
    if parenthesized {
        let close = skip_whitespace(bytes, literal.end);
        if bytes.get(close) != Some(&b')') {
            return None;
        }
    }

    Some(RequireCall {
        name,
        span: literal,
    })
}

/// A short string literal without escapes starting at `start`
fn string_literal(source: &str, start: usize) -> Option<(String, Range<usize>)> {
    let bytes = source.as_bytes();
    let quote = *bytes.get(start)?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let end = skip_short_string(bytes, start);
    let content = source.get(start + 1..end.checked_sub(1)?)?;
    if end > bytes.len() || bytes[end - 1] != quote || end - start < 2 || content.contains('\\') {
        return None;
    }
    Some((content.to_string(), start..end))
}

fn is_member_access(bytes: &[u8], start: usize) -> bool {
    let mut j = start;
    while j > 0 && bytes[j - 1].is_ascii_whitespace() {
        j -= 1;
    }
    match j.checked_sub(1).map(|k| bytes[k]) {
        Some(b':') => true,
        // `..` is concatenation, a single `.` is a field access
        Some(b'.') => !(j >= 2 && bytes[j - 2] == b'.'),
        _ => false,
    }
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn skip_comment(bytes: &[u8], i: usize) -> usize {
    if bytes.get(i) == Some(&b'[') {
        if let Some(level) = long_bracket_level(bytes, i) {
            return skip_long_bracket(bytes, i, level);
        }
    }
    bytes[i..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |offset| i + offset + 1)
}

/// Index just past the closing quote; unterminated strings end at the newline
fn skip_short_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut j = start + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' => return j,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

/// `Some(level)` when `[` at `i` opens `[[`, `[=[`, `[==[`, ...
fn long_bracket_level(bytes: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while bytes.get(j) == Some(&b'=') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'[')).then_some(j - i - 1)
}

fn skip_long_bracket(bytes: &[u8], start: usize, level: usize) -> usize {
    let mut j = start + level + 2;
    while j < bytes.len() {
        if bytes[j] == b']' {
            let eqs = bytes[j + 1..].iter().take_while(|&&b| b == b'=').count();
            if eqs == level && bytes.get(j + 1 + eqs) == Some(&b']') {
                return j + eqs + 2;
            }
        }
        j += 1;
    }
    bytes.len()
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
