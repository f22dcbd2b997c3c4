//! Tokens - Names and URNs used to identify stacks, projects and resources

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a stack or project name
pub const MAX_NAME_LENGTH: usize = 100;

/// Prefix shared by every resource URN
pub const URN_PREFIX: &str = "urn:pulumi:";

/// Separator between URN components
const URN_NAME_DELIMITER: &str = "::";

/// Separator between a parent type and a child type in a qualified type
const URN_TYPE_DELIMITER: &str = "$";

/// Errors raised while handling tokens
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid URN: {0}")]
    InvalidUrn(String),
}

/// Returns true if `s` is a valid name: non-empty, ASCII alphanumerics,
/// hyphens, underscores and periods only.
///
/// Length limits are enforced by callers, since stack and project names have
/// their own limits and error messages.
pub fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Returns true if `s` is a valid name no longer than [`MAX_NAME_LENGTH`]
pub fn is_bounded_name(s: &str) -> bool {
    is_name(s) && s.len() <= MAX_NAME_LENGTH
}

/// Uniform resource name of a resource within a stack
///
/// Format: `urn:pulumi:<stack>::<project>::<qualified type>::<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Build a URN. `parent_type` may be empty for top-level resources.
    pub fn new(stack: &str, project: &str, parent_type: &str, resource_type: &str, name: &str) -> Self {
        let qualified_type = if parent_type.is_empty() {
            resource_type.to_string()
        } else {
            format!("{}{}{}", parent_type, URN_TYPE_DELIMITER, resource_type)
        };
        Self(format!(
            "{URN_PREFIX}{stack}{URN_NAME_DELIMITER}{project}{URN_NAME_DELIMITER}{qualified_type}{URN_NAME_DELIMITER}{name}"
        ))
    }

    /// Parse and validate a URN string
    pub fn parse(s: &str) -> Result<Self, TokenError> {
        let urn = Self(s.to_string());
        if urn.components().is_none() {
            return Err(TokenError::InvalidUrn(s.to_string()));
        }
        Ok(urn)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into (stack, project, qualified type, name)
    fn components(&self) -> Option<(&str, &str, &str, &str)> {
        let rest = self.0.strip_prefix(URN_PREFIX)?;
        let mut parts = rest.splitn(4, URN_NAME_DELIMITER);
        let stack = parts.next()?;
        let project = parts.next()?;
        let qualified_type = parts.next()?;
        let name = parts.next()?;
        Some((stack, project, qualified_type, name))
    }

    /// Returns false if the URN does not follow the expected format
    pub fn is_valid(&self) -> bool {
        self.components().is_some()
    }

    pub fn stack(&self) -> Option<&str> {
        self.components().map(|(stack, _, _, _)| stack)
    }

    pub fn project(&self) -> Option<&str> {
        self.components().map(|(_, project, _, _)| project)
    }

    pub fn qualified_type(&self) -> Option<&str> {
        self.components().map(|(_, _, qualified_type, _)| qualified_type)
    }

    /// The resource type, without any parent type qualification
    pub fn resource_type(&self) -> Option<&str> {
        self.qualified_type()
            .map(|t| t.rsplit(URN_TYPE_DELIMITER).next().unwrap_or(t))
    }

    pub fn name(&self) -> Option<&str> {
        self.components().map(|(_, _, _, name)| name)
    }

    /// Return a copy of this URN moved to another stack, and optionally another project
    ///
    /// Malformed URNs are returned unchanged.
    pub fn rename(&self, stack: &str, project: Option<&str>) -> Self {
        match self.components() {
            Some((_, old_project, qualified_type, name)) => {
                let project = project.unwrap_or(old_project);
                Self(format!(
                    "{URN_PREFIX}{stack}{URN_NAME_DELIMITER}{project}{URN_NAME_DELIMITER}{qualified_type}{URN_NAME_DELIMITER}{name}"
                ))
            }
            None => self.clone(),
        }
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.0
    }
}
