// Copyright (c) 2022-2023 The MobileCoin Foundation

//! YAML loading and saving for script documents
//!
//! A document is a mapping with optional `scripts:` and `templates:`
//! lists. Directory loads aggregate every `.yaml`/`.yml` file and
//! report per-file outcomes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::{Script, Template};
use super::validate::{script_errors, template_errors, ValidationError};

/// Document file extensions recognised by [`load_dir`]
const EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Script document load errors
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in '{path}': {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Validation failure surfaced in fail-fast mode
    #[error("in '{path}': {source}")]
    Validation {
        path: PathBuf,
        source: ValidationError,
    },

    #[error("'{0}' is not a directory")]
    NotADirectory(PathBuf),
}

/// Loader behaviour options
#[derive(Copy, Clone, Debug)]
pub struct LoadOptions {
    /// Run structural validation on each item
    pub validate: bool,
    /// Abort on the first invalid item instead of skipping it with a
    /// warning
    pub fail_fast: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            validate: true,
            fail_fast: false,
        }
    }
}

/// Result of loading a single document
#[derive(Clone, Debug, Default)]
pub struct LoadOutcome {
    pub scripts: Vec<Script>,
    pub templates: Vec<Template>,
    /// Items dropped by skip-with-warning validation
    pub skipped: usize,
}

/// Result of loading a directory
#[derive(Debug, Default)]
pub struct DirOutcome {
    pub scripts: Vec<Script>,
    pub templates: Vec<Template>,
    /// Per-file (loaded item count, skipped item count)
    pub files: BTreeMap<PathBuf, (usize, usize)>,
}

#[derive(Default, Serialize, Deserialize)]
struct Document {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scripts: Vec<Script>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    templates: Vec<Template>,
}

/// Load scripts and templates from a single YAML document
pub fn load_file(path: impl AsRef<Path>, opts: LoadOptions) -> Result<LoadOutcome, LoadError> {
    let path = path.as_ref();

    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    // An empty document is fine and yields nothing
    if text.trim().is_empty() {
        return Ok(LoadOutcome::default());
    }

    let doc: Document = serde_yaml::from_str(&text).map_err(|source| LoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    let mut outcome = LoadOutcome::default();

    for script in doc.scripts {
        if opts.validate {
            let errors = script_errors(&script);
            if !errors.is_empty() {
                let err = ValidationError {
                    entity: "script",
                    id: script.id.clone(),
                    errors,
                };
                if opts.fail_fast {
                    return Err(LoadError::Validation {
                        path: path.to_path_buf(),
                        source: err,
                    });
                }
                warn!("skipping invalid script in {}: {err}", path.display());
                outcome.skipped += 1;
                continue;
            }
        }

        debug!("loaded script '{}' from {}", script.id, path.display());
        outcome.scripts.push(script);
    }

    for template in doc.templates {
        if opts.validate {
            let errors = template_errors(&template);
            if !errors.is_empty() {
                let err = ValidationError {
                    entity: "template",
                    id: template.id.clone(),
                    errors,
                };
                if opts.fail_fast {
                    return Err(LoadError::Validation {
                        path: path.to_path_buf(),
                        source: err,
                    });
                }
                warn!("skipping invalid template in {}: {err}", path.display());
                outcome.skipped += 1;
                continue;
            }
        }

        debug!("loaded template '{}' from {}", template.id, path.display());
        outcome.templates.push(template);
    }

    Ok(outcome)
}

/// Load every recognised document in a directory
pub fn load_dir(path: impl AsRef<Path>, opts: LoadOptions) -> Result<DirOutcome, LoadError> {
    let path = path.as_ref();

    if !path.is_dir() {
        return Err(LoadError::NotADirectory(path.to_path_buf()));
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(path)
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e))
                .unwrap_or(false)
        })
        .collect();

    // Deterministic aggregation order
    entries.sort();

    let mut outcome = DirOutcome::default();

    for file in entries {
        let loaded = load_file(&file, opts)?;
        let count = loaded.scripts.len() + loaded.templates.len();

        outcome.files.insert(file, (count, loaded.skipped));
        outcome.scripts.extend(loaded.scripts);
        outcome.templates.extend(loaded.templates);
    }

    Ok(outcome)
}

/// Write scripts and templates back out in the document shape accepted
/// by [`load_file`]
pub fn save_file(
    path: impl AsRef<Path>,
    scripts: &[Script],
    templates: &[Template],
) -> Result<(), LoadError> {
    let path = path.as_ref();

    let doc = Document {
        scripts: scripts.to_vec(),
        templates: templates.to_vec(),
    };

    let text = serde_yaml::to_string(&doc).map_err(|source| LoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    fs::write(path, text).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}
