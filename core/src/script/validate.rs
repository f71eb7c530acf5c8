// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Structural validation for scripts and templates
//!
//! Ids are constrained to kebab-case with no path characters so that a
//! script id is always safe to use as a file name. Hex fields are
//! strictly validated and size limits are enforced before anything is
//! accepted into the engine.

use super::model::{collect_placeholders, ApduCommand, ParameterDef, ParameterKind, Template};
use super::Script;
use std::collections::BTreeSet;

/// Maximum script / template id length
pub const MAX_ID_LEN: usize = 64;
/// Maximum script / template / command name length
pub const MAX_NAME_LEN: usize = 128;
/// Maximum description length
pub const MAX_DESCRIPTION_LEN: usize = 1024;
/// Maximum commands per script
pub const MAX_COMMANDS: usize = 100;
/// Maximum command hex length (extended APDU worst case)
pub const MAX_HEX_LEN: usize = 520;
/// Maximum tag length
pub const MAX_TAG_LEN: usize = 32;

/// Validation failure for a script or template
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{entity} '{id}' validation failed: {}", errors.join("; "))]
pub struct ValidationError {
    /// Entity kind ("script" or "template")
    pub entity: &'static str,
    /// Id of the offending entity (possibly itself invalid)
    pub id: String,
    /// All collected problems
    pub errors: Vec<String>,
}

/// Check an id against the kebab-case rules, returning a description of
/// the first problem found
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id cannot be empty".to_string());
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!("id exceeds maximum length of {MAX_ID_LEN}"));
    }
    // Path characters are rejected outright: ids are used as file names
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err("id contains path characters".to_string());
    }
    if !is_kebab_case(id) {
        return Err(
            "id must be kebab-case: lowercase letters, digits and single hyphens, \
             starting with a letter"
                .to_string(),
        );
    }
    Ok(())
}

fn is_kebab_case(s: &str) -> bool {
    let bytes = s.as_bytes();
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    let mut prev_hyphen = false;
    for &b in bytes {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => prev_hyphen = false,
            b'-' if !prev_hyphen => prev_hyphen = true,
            _ => return false,
        }
    }
    !prev_hyphen
}

/// Derive a valid id from an arbitrary name.
///
/// Lowercases, maps whitespace and underscores to hyphens, strips
/// everything else, collapses hyphen runs and forces an alphabetic
/// lead. Idempotent: `sanitize_id(sanitize_id(s)) == sanitize_id(s)`.
pub fn sanitize_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for c in name.trim().chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            'A'..='Z' => out.push(c.to_ascii_lowercase()),
            ' ' | '\t' | '_' | '-' => {
                if !out.is_empty() && !out.ends_with('-') {
                    out.push('-');
                }
            }
            _ => (),
        }
    }

    while out.ends_with('-') {
        out.pop();
    }

    if out
        .chars()
        .next()
        .map(|c| !c.is_ascii_alphabetic())
        .unwrap_or(false)
    {
        out.insert_str(0, "script-");
    }

    if out.len() > MAX_ID_LEN {
        out.truncate(MAX_ID_LEN);
        while out.ends_with('-') {
            out.pop();
        }
    }

    if out.is_empty() {
        out.push_str("script");
    }

    out
}

/// Validate a command hex string.
///
/// With `allow_placeholders`, `${NAME}` patterns are removed before the
/// even-length and alphabet checks.
pub fn validate_hex(hex_str: &str, allow_placeholders: bool) -> Result<(), String> {
    if hex_str.is_empty() {
        return Err("hex string cannot be empty".to_string());
    }
    if hex_str.len() > MAX_HEX_LEN {
        return Err(format!("hex exceeds maximum length of {MAX_HEX_LEN}"));
    }

    let check = if allow_placeholders {
        strip_placeholders(hex_str)
    } else {
        hex_str.to_string()
    };

    if check.len() % 2 != 0 {
        return Err("hex string must have even length".to_string());
    }
    if !check.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("hex string contains non-hex characters".to_string());
    }

    Ok(())
}

fn strip_placeholders(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => rest = &tail[end + 1..],
            None => {
                // Unterminated placeholder: keep the raw text so the
                // alphabet check rejects it
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

fn command_errors(cmd: &ApduCommand, index: usize, allow_placeholders: bool) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(e) = validate_hex(&cmd.hex, allow_placeholders) {
        errors.push(format!("command {}: {e}", index + 1));
    } else if !allow_placeholders && cmd.hex.len() < 8 {
        errors.push(format!(
            "command {}: APDU must be at least 4 bytes (CLA INS P1 P2)",
            index + 1
        ));
    }

    if let Some(name) = &cmd.name {
        if name.len() > MAX_NAME_LEN {
            errors.push(format!(
                "command {}: name exceeds maximum length of {MAX_NAME_LEN}",
                index + 1
            ));
        }
    }
    if let Some(desc) = &cmd.description {
        if desc.len() > MAX_DESCRIPTION_LEN {
            errors.push(format!(
                "command {}: description exceeds maximum length of {MAX_DESCRIPTION_LEN}",
                index + 1
            ));
        }
    }

    errors
}

fn common_errors(
    id: &str,
    name: &str,
    description: Option<&str>,
    tags: &[String],
    commands: &[ApduCommand],
    allow_placeholders: bool,
) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(e) = validate_id(id) {
        errors.push(e);
    }

    if name.is_empty() {
        errors.push("name cannot be empty".to_string());
    } else if name.len() > MAX_NAME_LEN {
        errors.push(format!("name exceeds maximum length of {MAX_NAME_LEN}"));
    }

    if let Some(desc) = description {
        if desc.len() > MAX_DESCRIPTION_LEN {
            errors.push(format!(
                "description exceeds maximum length of {MAX_DESCRIPTION_LEN}"
            ));
        }
    }

    if commands.is_empty() {
        errors.push("at least one command is required".to_string());
    } else if commands.len() > MAX_COMMANDS {
        errors.push(format!("command count exceeds maximum of {MAX_COMMANDS}"));
    } else {
        for (i, cmd) in commands.iter().enumerate() {
            errors.extend(command_errors(cmd, i, allow_placeholders));
        }
    }

    for tag in tags {
        if tag.len() > MAX_TAG_LEN {
            errors.push(format!(
                "tag '{tag}' exceeds maximum length of {MAX_TAG_LEN}"
            ));
        }
    }

    errors
}

/// Collect all validation problems for a script
pub fn script_errors(script: &Script) -> Vec<String> {
    common_errors(
        &script.id,
        &script.name,
        script.description.as_deref(),
        &script.tags,
        &script.commands,
        false,
    )
}

/// Validate a script, failing with the full problem list
pub fn validate_script(script: &Script) -> Result<(), ValidationError> {
    let errors = script_errors(script);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            entity: "script",
            id: script.id.clone(),
            errors,
        })
    }
}

fn parameter_errors(name: &str, def: &ParameterDef) -> Vec<String> {
    let mut errors = Vec::new();

    if !is_parameter_name(name) {
        errors.push(format!(
            "parameter '{name}': name must be uppercase letters, digits and underscores"
        ));
    }

    if let (Some(min), Some(max)) = (def.min_length, def.max_length) {
        if min > max {
            errors.push(format!(
                "parameter '{name}': min_length {min} exceeds max_length {max}"
            ));
        }
    }

    if let Some(default) = &def.default {
        if def.kind == ParameterKind::Hex {
            if let Err(e) = validate_hex(default, false) {
                errors.push(format!("parameter '{name}': invalid default: {e}"));
            } else {
                let len = default.len() / 2;
                if let Some(min) = def.min_length {
                    if len < min {
                        errors.push(format!(
                            "parameter '{name}': default shorter than min_length {min}"
                        ));
                    }
                }
                if let Some(max) = def.max_length {
                    if len > max {
                        errors.push(format!(
                            "parameter '{name}': default longer than max_length {max}"
                        ));
                    }
                }
            }
        }
    }

    errors
}

fn is_parameter_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Collect all validation problems for a template
pub fn template_errors(template: &Template) -> Vec<String> {
    let mut errors = common_errors(
        &template.id,
        &template.name,
        template.description.as_deref(),
        &template.tags,
        &template.commands,
        true,
    );

    for (name, def) in &template.parameters {
        errors.extend(parameter_errors(name, def));
    }

    // Placeholder coverage must hold in both directions
    let placeholders = template.placeholder_names();
    let defined: BTreeSet<String> = template.parameters.keys().cloned().collect();

    for p in placeholders.difference(&defined) {
        errors.push(format!("placeholder ${{{p}}} has no parameter definition"));
    }
    for d in defined.difference(&placeholders) {
        errors.push(format!("parameter '{d}' is defined but never used"));
    }

    errors
}

/// Validate a template, failing with the full problem list
pub fn validate_template(template: &Template) -> Result<(), ValidationError> {
    let errors = template_errors(template);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            entity: "template",
            id: template.id.clone(),
            errors,
        })
    }
}

/// Validate a parameter value against its definition, returning the
/// hex form to substitute
pub(crate) fn check_value(name: &str, value: &str, def: &ParameterDef) -> Result<String, String> {
    let hex_value = match def.kind {
        ParameterKind::Hex => {
            validate_hex(value, false)?;
            value.to_uppercase()
        }
        ParameterKind::String => hex::encode_upper(value.as_bytes()),
    };

    let len = hex_value.len() / 2;
    if let Some(min) = def.min_length {
        if len < min {
            return Err(format!(
                "parameter '{name}': value is {len} bytes, minimum is {min}"
            ));
        }
    }
    if let Some(max) = def.max_length {
        if len > max {
            return Err(format!(
                "parameter '{name}': value is {len} bytes, maximum is {max}"
            ));
        }
    }

    Ok(hex_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::model::{ApduCommand, Template};
    use std::collections::BTreeMap;

    fn script(id: &str, commands: &[&str]) -> Script {
        Script::new(
            id,
            "Test script",
            commands.iter().copied().map(ApduCommand::new).collect(),
        )
    }

    #[test]
    fn valid_ids() {
        for id in ["select-isd", "a", "ping2", "get-status-81"] {
            assert!(validate_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn invalid_ids() {
        for id in [
            "",
            "Select-ISD",
            "-select",
            "select-",
            "select--isd",
            "2select",
            "../etc/passwd",
            "a/b",
            "a\\b",
            &"x".repeat(65),
        ] {
            assert!(validate_id(id).is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn sanitize_examples() {
        let cases = [
            ("Select ISD", "select-isd"),
            ("select_isd", "select-isd"),
            ("  Get   Status!  ", "get-status"),
            ("2nd attempt", "script-2nd-attempt"),
            ("___", "script"),
            ("", "script"),
        ];

        for (input, expected) in cases {
            assert_eq!(sanitize_id(input), expected, "sanitize({input:?})");
        }
    }

    #[test]
    fn sanitize_idempotent() {
        let inputs = [
            "Select ISD",
            "weird__NAME--42",
            "ünïcode stuff",
            &"long name ".repeat(20),
        ];

        for input in inputs {
            let once = sanitize_id(input);
            assert_eq!(sanitize_id(&once), once, "idempotence for {input:?}");
            assert!(validate_id(&once).is_ok(), "result valid for {input:?}");
        }
    }

    #[test]
    fn script_validation() {
        assert!(validate_script(&script("ok", &["00A4040000"])).is_ok());

        // Too short
        assert!(validate_script(&script("short", &["00A404"])).is_err());
        // Odd length
        assert!(validate_script(&script("odd", &["00A40400F"])).is_err());
        // No commands
        assert!(validate_script(&Script::new("none", "x", vec![])).is_err());
        // Placeholders not allowed in plain scripts
        assert!(validate_script(&script("tmpl", &["00A40400${AID}"])).is_err());
    }

    #[test]
    fn script_error_collection() {
        let mut s = script("Bad ID", &["00A404"]);
        s.name = String::new();

        let errors = script_errors(&s);
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn template_coverage() {
        let mut params = BTreeMap::new();
        params.insert("AID".to_string(), ParameterDef::hex(5, 16));

        let t = Template::new(
            "select",
            "Select",
            vec![ApduCommand::new("00A40400${AID_LEN}${AID}")],
            params,
        );

        let errors = template_errors(&t);
        assert!(
            errors.iter().any(|e| e.contains("${AID_LEN}")),
            "{errors:?}"
        );

        // Unused definition is also an error
        let mut params = BTreeMap::new();
        params.insert("AID".to_string(), ParameterDef::hex(5, 16));
        params.insert("UNUSED".to_string(), ParameterDef::hex(1, 1));

        let t = Template::new(
            "select",
            "Select",
            vec![ApduCommand::new("00A4040005${AID}")],
            params,
        );
        let errors = template_errors(&t);
        assert!(errors.iter().any(|e| e.contains("UNUSED")), "{errors:?}");
    }

    #[test]
    fn template_parameter_rules() {
        let mut params = BTreeMap::new();
        params.insert(
            "aid".to_string(),
            ParameterDef::hex(5, 16).with_default("A0000000041010"),
        );

        let t = Template::new(
            "select",
            "Select",
            vec![ApduCommand::new("00A4040005${aid}")],
            params,
        );
        // Lowercase parameter names are rejected
        assert!(template_errors(&t)
            .iter()
            .any(|e| e.contains("uppercase")));

        let mut def = ParameterDef::hex(8, 4);
        let errors = parameter_errors("AID", &def);
        assert!(errors.iter().any(|e| e.contains("min_length")), "{errors:?}");

        def = ParameterDef::hex(1, 2).with_default("AABBCC");
        let errors = parameter_errors("AID", &def);
        assert!(errors.iter().any(|e| e.contains("longer")), "{errors:?}");
    }
}
