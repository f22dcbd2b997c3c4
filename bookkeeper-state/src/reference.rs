//! Stack references

use std::fmt;

/// The only organization a self-managed state store knows about
pub const ORGANIZATION: &str = "organization";

/// A parsed, validated reference to a stack
///
/// The project is present exactly when the store uses the project layout.
/// References are produced by [`crate::layout::LayoutMode::parse_reference`]
/// or by listing a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackReference {
    project: Option<String>,
    name: String,
}

impl StackReference {
    pub(crate) fn new(project: Option<String>, name: impl Into<String>) -> Self {
        Self {
            project,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// `organization/<project>/<name>`, or the bare name for legacy stacks
    pub fn fully_qualified_name(&self) -> String {
        match &self.project {
            Some(project) => format!("{ORGANIZATION}/{project}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// A reference to a sibling stack in the same project
    pub(crate) fn with_name(&self, name: impl Into<String>) -> Self {
        Self::new(self.project.clone(), name)
    }
}

impl fmt::Display for StackReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified_name())
    }
}
