// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Script and template data model
//!
//! These records are immutable once loaded; validation lives in
//! [`validate`][super::validate] and is applied by the loader.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

/// A single command APDU within a script or template.
///
/// In documents a bare hex string is accepted as shorthand for
/// `{ hex: "..." }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApduCommand {
    /// Raw APDU hex (may contain `${NAME}` placeholders in templates)
    pub hex: String,

    /// Human readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ApduCommand {
    /// Create a command from a hex string
    pub fn new(hex: impl Into<String>) -> Self {
        Self {
            hex: hex.into(),
            name: None,
            description: None,
        }
    }

    /// Attach a label
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<'de> Deserialize<'de> for ApduCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Short(String),
            Full {
                hex: String,
                #[serde(default)]
                name: Option<String>,
                #[serde(default)]
                description: Option<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Short(hex) => ApduCommand::new(hex),
            Repr::Full {
                hex,
                name,
                description,
            } => ApduCommand {
                hex,
                name,
                description,
            },
        })
    }
}

/// An ordered, immutable sequence of command APDUs with metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Unique kebab-case identifier
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Command sequence (never empty once validated)
    pub commands: Vec<ApduCommand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Script {
    /// Create a script from id, name and commands
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        commands: Vec<ApduCommand>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            commands,
            description: None,
            tags: Vec::new(),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Supported template parameter kinds
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    /// Hex-encoded bytes, substituted as-is
    #[default]
    Hex,
    /// UTF-8 string, hex-encoded before substitution
    String,
}

/// Definition of one template parameter.
///
/// The parameter name is the key under which the definition is stored in
/// [`Template::parameters`]; length bounds are in bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDef {
    #[serde(default, rename = "type")]
    pub kind: ParameterKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default = "default_true")]
    pub required: bool,
}

impl Default for ParameterDef {
    fn default() -> Self {
        Self {
            kind: ParameterKind::Hex,
            description: None,
            min_length: None,
            max_length: None,
            default: None,
            required: true,
        }
    }
}

impl ParameterDef {
    /// Hex parameter with byte-length bounds
    pub fn hex(min_length: usize, max_length: usize) -> Self {
        Self {
            min_length: Some(min_length),
            max_length: Some(max_length),
            ..Default::default()
        }
    }

    /// Optional parameter with a default value
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self.required = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// A script template whose commands may contain `${NAME}` placeholders
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,

    pub name: String,

    pub commands: Vec<ApduCommand>,

    /// Parameter definitions keyed by placeholder name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Template {
    /// Create a template from id, name, commands and parameters
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        commands: Vec<ApduCommand>,
        parameters: BTreeMap<String, ParameterDef>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            commands,
            parameters,
            description: None,
            tags: Vec::new(),
        }
    }

    /// Collect the distinct `${NAME}` placeholders used by the commands
    pub fn placeholder_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for cmd in &self.commands {
            collect_placeholders(&cmd.hex, &mut names);
        }
        names
    }
}

/// Scan `s` for `${NAME}` patterns, collecting the names
pub(crate) fn collect_placeholders(s: &str, out: &mut BTreeSet<String>) {
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                out.insert(tail[..end].to_string());
                rest = &tail[end + 1..];
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_shorthand() {
        let full: ApduCommand =
            serde_yaml::from_str("{ hex: \"00A4040000\", name: SELECT }").unwrap();
        assert_eq!(full.hex, "00A4040000");
        assert_eq!(full.name.as_deref(), Some("SELECT"));

        let short: ApduCommand = serde_yaml::from_str("\"00A4040000\"").unwrap();
        assert_eq!(short, ApduCommand::new("00A4040000"));
    }

    #[test]
    fn placeholder_extraction() {
        let t = Template::new(
            "apdu-select",
            "Select by AID",
            vec![ApduCommand::new("00A40400${AID_LEN}${AID}")],
            BTreeMap::new(),
        );

        let names: Vec<_> = t.placeholder_names().into_iter().collect();
        assert_eq!(names, vec!["AID".to_string(), "AID_LEN".to_string()]);
    }

    #[test]
    fn placeholder_unterminated_ignored() {
        let mut names = BTreeSet::new();
        collect_placeholders("00A4${AID", &mut names);
        assert!(names.is_empty());
    }

    #[test]
    fn script_yaml_round_trip() {
        let script = Script::new(
            "select-isd",
            "Select ISD",
            vec![ApduCommand::new("00A4040007A000000151000000").named("SELECT ISD")],
        );

        let yaml = serde_yaml::to_string(&script).unwrap();
        let parsed: Script = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, script);
    }

    #[test]
    fn parameter_defaults() {
        let p: ParameterDef = serde_yaml::from_str("{}").unwrap();
        assert_eq!(p.kind, ParameterKind::Hex);
        assert!(p.required);

        let p: ParameterDef =
            serde_yaml::from_str("{ type: string, required: false, max_length: 8 }").unwrap();
        assert_eq!(p.kind, ParameterKind::String);
        assert!(!p.required);
        assert_eq!(p.max_length, Some(8));
    }
}
