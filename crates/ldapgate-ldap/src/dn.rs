//! Distinguished name parsing and composition.
//!
//! Parsing is intentionally strict so malformed DNs surface early, before
//! they are interpolated into membership filters or probe entries.

use ldapgate_core::error::Error as CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnError {
    /// The distinguished name was empty.
    #[error("distinguished name cannot be empty")]
    Empty,
    /// A component lacked the `attr=value` shape.
    #[error("invalid distinguished name component: {0}")]
    InvalidComponent(String),
    /// The distinguished name ended inside an escape sequence.
    #[error("distinguished name contains an unterminated escape sequence")]
    UnterminatedEscape,
}

impl From<DnError> for CoreError {
    fn from(err: DnError) -> Self {
        CoreError::BadRequest(err.to_string())
    }
}

/// A parsed distinguished name.
///
/// Keeps the canonical string form alongside the decoded attribute/value
/// pairs, ordered leaf-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dn {
    raw: String,
    components: Vec<(String, String)>,
}

impl Dn {
    /// Parses a distinguished name.
    ///
    /// # Errors
    ///
    /// Returns [`DnError`] for empty input, a component without `=`, or an
    /// unterminated escape.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, DnError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Err(DnError::Empty);
        }

        let mut components = Vec::new();
        for part in split_unescaped(raw, ',')? {
            let (attribute, value) = part
                .split_once('=')
                .map(|(a, v)| (a.trim(), v.trim_start()))
                .ok_or_else(|| DnError::InvalidComponent(part.clone()))?;
            if attribute.is_empty() || value.is_empty() {
                return Err(DnError::InvalidComponent(part.clone()));
            }
            components.push((attribute.to_string(), unescape(value)?));
        }

        Ok(Self {
            raw: components_to_string(&components),
            components,
        })
    }

    /// Borrows the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the decoded value of the first component whose attribute
    /// matches `attribute` case-insensitively.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.components
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(attribute))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the leftmost (leaf) component.
    #[must_use]
    pub fn rdn(&self) -> Option<(&str, &str)> {
        self.components
            .first()
            .map(|(attr, value)| (attr.as_str(), value.as_str()))
    }

    /// Builds a child DN by prefixing `attribute=value` (escaped) onto this
    /// one; used to place entries beneath a base.
    #[must_use]
    pub fn child(&self, attribute: &str, value: &str) -> Self {
        let mut components = Vec::with_capacity(self.components.len() + 1);
        components.push((attribute.to_string(), value.to_string()));
        components.extend(self.components.iter().cloned());
        Self {
            raw: components_to_string(&components),
            components,
        }
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Dn {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn split_unescaped(input: &str, delimiter: char) -> Result<Vec<String>, DnError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escape = false;

    for ch in input.chars() {
        if escape {
            current.push('\\');
            current.push(ch);
            escape = false;
        } else if ch == '\\' {
            escape = true;
        } else if ch == delimiter {
            parts.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    if escape {
        return Err(DnError::UnterminatedEscape);
    }
    parts.push(current.trim().to_string());

    if parts.iter().any(String::is_empty) {
        return Err(DnError::InvalidComponent(input.to_string()));
    }
    Ok(parts)
}

fn unescape(value: &str) -> Result<String, DnError> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            result.push(chars.next().ok_or(DnError::UnterminatedEscape)?);
        } else {
            result.push(ch);
        }
    }
    Ok(result)
}

/// Escapes a value for use inside an RDN per RFC 4514.
fn escape_rdn_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut escaped = String::with_capacity(value.len());
    for (idx, ch) in chars.iter().enumerate() {
        let needs_escape = matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (idx == 0 && (*ch == ' ' || *ch == '#'))
            || (idx == chars.len() - 1 && *ch == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(*ch);
    }
    escaped
}

fn components_to_string(components: &[(String, String)]) -> String {
    components
        .iter()
        .map(|(attr, value)| format!("{attr}={}", escape_rdn_value(value)))
        .collect::<Vec<_>>()
        .join(",")
}
