use thiserror::Error;

use crate::StructuredError;

/// The recognized domain error family.
///
/// Task bodies return it (possibly wrapped in context) to get a structured
/// error in their result envelope instead of a plain message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{full}")]
pub struct EndpointError {
    code: u32,
    name: String,
    scope: String,
    description: String,
    full: String,
}

impl EndpointError {
    #[must_use]
    pub fn new(
        code: u32,
        name: impl Into<String>,
        scope: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let scope = scope.into();
        let description = description.into();
        let full = format!("[{scope}] {name} (0x{code:08x}): {description}");
        Self {
            code,
            name,
            scope,
            description,
            full,
        }
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        self.code
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn full(&self) -> &str {
        &self.full
    }

    #[must_use]
    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: i64::from(self.code),
            name: self.name.clone(),
            scope: self.scope.clone(),
            description: self.description.clone(),
            full: self.full.clone(),
        }
    }
}
