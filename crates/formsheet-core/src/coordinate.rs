//! Scope-qualified cell coordinates
//!
//! A coordinate is either *relative* (`A1`, read within the current scope) or
//! *absolute* (`Form2!A1`, `'Annual report'!B7`). Dependency graphs store
//! coordinates normalized against their own scope: a prefix naming the graph's
//! scope is dropped, every other prefix is kept.

use crate::cell::CellAddress;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A cell reference, optionally qualified by the scope (sheet) it lives in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    /// Explicit scope name, `None` for a relative coordinate
    pub scope: Option<String>,
    /// Cell address within the scope
    pub address: CellAddress,
}

impl Coordinate {
    /// Create a relative coordinate
    pub fn relative(address: CellAddress) -> Self {
        Self {
            scope: None,
            address,
        }
    }

    /// Create a coordinate qualified by `scope`
    pub fn qualified<S: Into<String>>(scope: S, address: CellAddress) -> Self {
        Self {
            scope: Some(scope.into()),
            address,
        }
    }

    /// Parse `A1`, `Scope!A1` or `'Scope name'!A1`
    ///
    /// A coordinate without an explicit scope takes `default_scope`.
    ///
    /// # Examples
    /// ```
    /// use formsheet_core::Coordinate;
    ///
    /// let c = Coordinate::parse("'Annual report'!$B$7", None).unwrap();
    /// assert_eq!(c.scope.as_deref(), Some("Annual report"));
    /// assert_eq!(c.address.to_string(), "B7");
    ///
    /// let c = Coordinate::parse("C3", Some("Form1")).unwrap();
    /// assert_eq!(c.to_string(), "Form1!C3");
    /// ```
    pub fn parse(text: &str, default_scope: Option<&str>) -> Result<Self> {
        let text = text.trim();
        let (scope, address) = split_scope(text)?;
        let address = CellAddress::parse(address)
            .map_err(|e| Error::InvalidCoordinate(format!("'{}': {}", text, e)))?;
        let scope = scope
            .map(Cow::into_owned)
            .or_else(|| default_scope.map(str::to_string));
        Ok(Self { scope, address })
    }

    /// Re-express this coordinate relative to `scope`
    ///
    /// A coordinate whose explicit scope equals `scope` loses its prefix; any
    /// other coordinate is returned unchanged.
    pub fn relative_to(&self, scope: &str) -> Coordinate {
        match &self.scope {
            Some(own) if scope_eq(own, scope) => Coordinate::relative(self.address),
            _ => self.clone(),
        }
    }

    /// Give a relative coordinate the explicit scope `scope`
    pub fn qualify(&self, scope: &str) -> Coordinate {
        match &self.scope {
            Some(_) => self.clone(),
            None => Coordinate::qualified(scope, self.address),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}!{}", quote_scope(scope), self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Normalize coordinate text against `scope`
///
/// Idempotent: normalizing an already-normalized coordinate returns it unchanged.
///
/// ```
/// use formsheet_core::coordinate::normalize;
///
/// assert_eq!(normalize("Form1!$a$1", "Form1").unwrap(), "A1");
/// assert_eq!(normalize("'Form2'!A1", "Form1").unwrap(), "Form2!A1");
/// ```
pub fn normalize(text: &str, scope: &str) -> Result<String> {
    Ok(Coordinate::parse(text, None)?.relative_to(scope).to_string())
}

/// Compare two scope names the way sheet names are matched: case-insensitively
pub fn scope_eq(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Render a scope name for use as a reference prefix, quoting when needed
pub fn quote_scope(name: &str) -> Cow<'_, str> {
    if needs_quotes(name) {
        Cow::Owned(format!("'{}'", name.replace('\'', "''")))
    } else {
        Cow::Borrowed(name)
    }
}

fn needs_quotes(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        None => true,
        Some(first) if first.is_ascii_digit() => true,
        Some(_) => {
            !name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
                || CellAddress::parse(name).is_ok()
        }
    }
}

/// Split `prefix!rest` into the unquoted scope name and the remainder
///
/// Returns `None` for the scope when the text carries no prefix.
pub fn split_scope(text: &str) -> Result<(Option<Cow<'_, str>>, &str)> {
    if let Some(quoted) = text.strip_prefix('\'') {
        let mut name = String::new();
        let mut chars = quoted.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if let Some((_, '\'')) = chars.peek() {
                    name.push('\'');
                    chars.next();
                    continue;
                }
                let rest = &quoted[i + 1..];
                return match rest.strip_prefix('!') {
                    Some(rest) => Ok((Some(Cow::Owned(name)), rest)),
                    None => Err(Error::InvalidCoordinate(format!(
                        "expected '!' after quoted scope in '{}'",
                        text
                    ))),
                };
            }
            name.push(c);
        }
        return Err(Error::InvalidCoordinate(format!(
            "unterminated scope quote in '{}'",
            text
        )));
    }

    match text.rsplit_once('!') {
        Some(("", _)) => Err(Error::InvalidCoordinate(format!(
            "empty scope name in '{}'",
            text
        ))),
        Some((scope, rest)) => Ok((Some(Cow::Borrowed(scope)), rest)),
        None => Ok((None, text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_forms() {
        let c = Coordinate::parse("A1", None).unwrap();
        assert_eq!(c, Coordinate::relative(CellAddress::new(0, 0)));

        let c = Coordinate::parse("Форма1!B2", None).unwrap();
        assert_eq!(c.scope.as_deref(), Some("Форма1"));
        assert_eq!(c.address, CellAddress::new(1, 1));

        let c = Coordinate::parse("'It''s here'!C3", None).unwrap();
        assert_eq!(c.scope.as_deref(), Some("It's here"));
        assert_eq!(c.to_string(), "'It''s here'!C3");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Coordinate::parse("!A1", None).is_err());
        assert!(Coordinate::parse("'open!A1", None).is_err());
        assert!(Coordinate::parse("'x'A1", None).is_err());
        assert!(Coordinate::parse("Form1!", None).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("A1", "Form1").unwrap(), "A1");
        assert_eq!(normalize("Form1!A1", "Form1").unwrap(), "A1");
        assert_eq!(normalize("form1!A1", "Form1").unwrap(), "A1");
        assert_eq!(normalize("Form2!a1", "Form1").unwrap(), "Form2!A1");
        assert_eq!(
            normalize("'Scope Name'!A1", "Form1").unwrap(),
            "'Scope Name'!A1"
        );
        assert_eq!(normalize("'Scope Name'!A1", "scope name").unwrap(), "A1");
    }

    #[test]
    fn test_quote_scope() {
        assert_eq!(quote_scope("Form1"), "Form1");
        assert_eq!(quote_scope("Форма1"), "Форма1");
        assert_eq!(quote_scope("Two words"), "'Two words'");
        assert_eq!(quote_scope("2024"), "'2024'");
        assert_eq!(quote_scope("AB12"), "'AB12'");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(
            scope in "[A-Za-zА-я][A-Za-zА-я0-9 _']{0,8}",
            current in "[A-Za-zА-я][A-Za-zА-я0-9 _']{0,8}",
            col in 0u16..200,
            row in 0u32..5000,
        ) {
            let text = Coordinate::qualified(scope, CellAddress::new(row, col)).to_string();
            let once = normalize(&text, &current).unwrap();
            let twice = normalize(&once, &current).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
