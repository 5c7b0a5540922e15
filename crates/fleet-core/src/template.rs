//! `{token}` substitution against an explicit attribute context.
//!
//! Tokens are attribute paths (`vm_name`, `role.role_name`). `{{` and `}}`
//! stand for literal braces. Resolution either replaces every token or fails;
//! it never hands back a half-substituted string.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Attribute values visible to a template, keyed by dotted path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    values: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, value: impl ToString) -> Self {
        self.insert(path, value);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, value: impl ToString) {
        self.values.insert(path.into(), value.to_string());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.values.get(path).map(String::as_str)
    }
}

enum Piece<'a> {
    Text(&'a str),
    Brace(char),
    Token(&'a str),
}

fn malformed(template: &str, reason: impl Into<String>) -> Error {
    Error::MalformedTemplate {
        template: template.to_string(),
        reason: reason.into(),
    }
}

fn is_valid_path(token: &str) -> bool {
    !token.is_empty()
        && token.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        if pos > 0 {
            pieces.push(Piece::Text(&rest[..pos]));
        }
        let brace = rest.as_bytes()[pos] as char;
        let after = &rest[pos + 1..];

        if after.starts_with(brace) {
            pieces.push(Piece::Brace(brace));
            rest = &after[1..];
            continue;
        }
        if brace == '}' {
            return Err(malformed(template, "single '}' (use '}}' for a literal brace)"));
        }

        let end = after
            .find('}')
            .ok_or_else(|| malformed(template, "unterminated '{'"))?;
        let token = &after[..end];
        if !is_valid_path(token) {
            return Err(malformed(template, format!("invalid token {{{token}}}")));
        }
        pieces.push(Piece::Token(token));
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

/// Attribute paths a template refers to, in order of appearance.
pub fn tokens(template: &str) -> Result<Vec<String>> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Token(t) => Some(t.to_string()),
            _ => None,
        })
        .collect())
}

/// Replace every token in `template` with its value from `ctx`.
pub fn resolve(template: &str, ctx: &Context) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    for piece in parse(template)? {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Brace(c) => out.push(c),
            Piece::Token(token) => {
                let value = ctx.get(token).ok_or_else(|| Error::UnresolvedToken {
                    token: token.to_string(),
                    template: template.to_string(),
                })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

/// Check that a template only uses tokens from `known`.
pub fn check_tokens(field: &str, template: &str, known: &[&str]) -> Result<()> {
    for token in tokens(template)? {
        if !known.contains(&token.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "{field}: unrecognized token {{{token}}} in {template:?}"
            )));
        }
    }
    Ok(())
}
