//! `${name}` placeholder substitution.
//!
//! Substitution is a single left-to-right pass over the template: values are
//! copied verbatim and never rescanned, so the result does not depend on the
//! order in which placeholders are filled.

use std::collections::HashMap;

use crate::errors::CodegenError;

/// Named values for a template.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    values: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, replacing an earlier value.
    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        self.values.insert(name.into(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Replaces every `${name}` in `template`.
///
/// # Errors
/// - `UnresolvedPlaceholder` if a name has no value
/// - `UnterminatedPlaceholder` if `${` is never closed
pub fn render(template: &str, values: &Substitutions) -> Result<String, CodegenError> {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or(CodegenError::UnterminatedPlaceholder(offset + start))?;
        let name = &after[..end];
        let value = values
            .get(name)
            .ok_or_else(|| CodegenError::UnresolvedPlaceholder(name.to_string()))?;
        out.push_str(value);

        let consumed = start + 2 + end + 1;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}
