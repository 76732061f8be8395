//! Hierarchical scope names
//!
//! A scope is an ordered sequence of non-empty name components rendered
//! with leading and trailing separators (`/a/b/`). Scopes form the
//! addressing plane of the bus: a subscriber on `/a/` receives events
//! published on `/a/`, `/a/b/`, `/a/b/c/` and so on.

use std::fmt;
use std::str::FromStr;

use crate::error::{BusError, Result};

/// Component separator in rendered scope strings
pub const SEPARATOR: char = '/';

fn valid_component_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// A hierarchical scope name
///
/// Immutable after construction. Two scopes are equal iff their
/// component sequences are identical; containment is strict prefix.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    components: Vec<String>,
}

impl Scope {
    /// The root scope `/`
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Build a scope from components, validating each one
    pub fn new<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut validated = Vec::new();
        for component in components {
            let component = component.into();
            validate_component(&component)?;
            validated.push(component);
        }
        Ok(Self {
            components: validated,
        })
    }

    /// Parse a scope string
    ///
    /// Accepts `/a/b` and `/a/b/`; both normalize to `/a/b/`. Fails on
    /// a missing leading separator, empty components (consecutive
    /// separators), or disallowed characters.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BusError::InvalidScope {
            scope: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s
            .strip_prefix(SEPARATOR)
            .ok_or_else(|| invalid("must start with '/'"))?;
        let rest = rest.strip_suffix(SEPARATOR).unwrap_or(rest);

        if rest.is_empty() {
            return Ok(Self::root());
        }

        let mut components = Vec::new();
        for component in rest.split(SEPARATOR) {
            if component.is_empty() {
                return Err(invalid("empty component"));
            }
            if !component.chars().all(valid_component_char) {
                return Err(invalid("component contains disallowed characters"));
            }
            components.push(component.to_string());
        }
        Ok(Self { components })
    }

    /// The component sequence
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// True for the root scope `/`
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Concatenate, appending `child`'s components to this scope's
    pub fn concat(&self, child: &Scope) -> Scope {
        let mut components = self.components.clone();
        components.extend(child.components.iter().cloned());
        Scope { components }
    }

    /// Append a single component, validating it
    pub fn push(&self, component: &str) -> Result<Scope> {
        validate_component(component).map_err(|_| BusError::InvalidScope {
            scope: component.to_string(),
            reason: "not a valid scope component".to_string(),
        })?;
        let mut components = self.components.clone();
        components.push(component.to_string());
        Ok(Scope { components })
    }

    /// True iff this scope's components are a strict prefix of `other`'s
    ///
    /// Irreflexive: a scope is never a super-scope of itself.
    pub fn is_super_scope_of(&self, other: &Scope) -> bool {
        self.components.len() < other.components.len()
            && other.components[..self.components.len()] == self.components[..]
    }

    /// True iff `other` is a strict super-scope of this scope
    pub fn is_sub_scope_of(&self, other: &Scope) -> bool {
        other.is_super_scope_of(self)
    }
}

fn validate_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(BusError::InvalidScope {
            scope: component.to_string(),
            reason: "empty component".to_string(),
        });
    }
    if !component.chars().all(valid_component_char) {
        return Err(BusError::InvalidScope {
            scope: component.to_string(),
            reason: "component contains disallowed characters".to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SEPARATOR)?;
        for component in &self.components {
            write!(f, "{}{}", component, SEPARATOR)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self)
    }
}

impl FromStr for Scope {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::parse(s)
    }
}
