// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Template rendering
//!
//! Binds concrete values to a template's parameters and produces a
//! fresh, fully substituted [`Script`]. Rendered scripts keep the
//! template's id and name; callers re-id via
//! [`sanitize_id`][super::sanitize_id] where uniqueness matters.

use std::collections::BTreeMap;

use super::model::{ApduCommand, Script, Template};
use super::validate::check_value;

/// Template rendering errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A required parameter was neither bound nor defaulted
    #[error("required parameter '{0}' missing")]
    MissingParameter(String),

    /// A bound or defaulted value violated its definition
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A `${NAME}` pattern survived substitution
    #[error("unresolved placeholder in command {index}: {hex}")]
    UnresolvedPlaceholder { index: usize, hex: String },
}

/// Render a template with the given parameter bindings.
///
/// Values are resolved binding-first, then the parameter default; a
/// required parameter with neither fails. String-kind values are
/// hex-encoded from their UTF-8 bytes before substitution.
pub fn render(
    template: &Template,
    bindings: &BTreeMap<String, String>,
) -> Result<Script, RenderError> {
    // Resolve and validate every parameter up front
    let mut resolved: BTreeMap<&str, String> = BTreeMap::new();

    for (name, def) in &template.parameters {
        let value = match bindings.get(name).or(def.default.as_ref()) {
            Some(v) => v,
            None if def.required => return Err(RenderError::MissingParameter(name.clone())),
            None => continue,
        };

        let hex_value = check_value(name, value, def).map_err(RenderError::InvalidValue)?;
        resolved.insert(name, hex_value);
    }

    // Substitute into each command
    let mut commands = Vec::with_capacity(template.commands.len());

    for (i, cmd) in template.commands.iter().enumerate() {
        let mut hex = cmd.hex.clone();
        for (name, value) in &resolved {
            hex = hex.replace(&format!("${{{name}}}"), value);
        }

        if hex.contains("${") {
            return Err(RenderError::UnresolvedPlaceholder { index: i + 1, hex });
        }

        commands.push(ApduCommand {
            hex,
            name: cmd.name.clone(),
            description: cmd.description.clone(),
        });
    }

    Ok(Script {
        id: template.id.clone(),
        name: template.name.clone(),
        commands,
        description: template.description.clone(),
        tags: template.tags.clone(),
        created_at: Some(chrono::Utc::now()),
        updated_at: Some(chrono::Utc::now()),
    })
}
