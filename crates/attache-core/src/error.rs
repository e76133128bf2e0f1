//! Validation error collection
//!
//! Rule failures reported by validation hooks, keyed by the metadata field
//! that failed (`size`, `mime_type`, `extension`, ...).

use indexmap::IndexMap;
use thiserror::Error;

/// Validation errors collection
#[derive(Error, Debug, Default, Clone, PartialEq, Eq)]
#[error("{}", self.full_messages().join(", "))]
pub struct ValidationErrors {
    /// Field-specific errors: field_name -> Vec<error_messages>
    pub errors: IndexMap<String, Vec<String>>,
    /// Errors not tied to a specific field
    pub base_errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn add_base(&mut self, message: impl Into<String>) {
        self.base_errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.base_errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.base_errors.len() + self.errors.values().map(Vec::len).sum::<usize>()
    }

    /// Check if there are errors for a specific field
    pub fn has_error(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    /// Get errors for a specific field
    pub fn get(&self, field: &str) -> Option<&Vec<String>> {
        self.errors.get(field)
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.errors {
            self.errors.entry(field).or_default().extend(messages);
        }
        self.base_errors.extend(other.base_errors);
    }

    /// Prefix every field with a version name, e.g. `thumb.size`.
    pub fn scoped(self, scope: &str) -> Self {
        Self {
            errors: self
                .errors
                .into_iter()
                .map(|(field, messages)| (format!("{}.{}", scope, field), messages))
                .collect(),
            base_errors: self
                .base_errors
                .into_iter()
                .map(|message| format!("{}: {}", scope, message))
                .collect(),
        }
    }

    pub fn full_messages(&self) -> Vec<String> {
        let mut messages = self.base_errors.clone();
        for (field, field_messages) in &self.errors {
            for msg in field_messages {
                messages.push(format!("{} {}", field, msg));
            }
        }
        messages
    }
}
