// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Declarative APDU scripts and templates
//!
//! Scripts are ordered lists of command APDUs with metadata; templates
//! add `${NAME}` placeholders backed by typed parameter definitions.
//! Documents are loaded from YAML, validated structurally, and rendered
//! into concrete scripts before a session may transmit them.

mod model;
pub use model::{ApduCommand, ParameterDef, ParameterKind, Script, Template};

mod validate;
pub use validate::{
    sanitize_id, script_errors, template_errors, validate_hex, validate_id, validate_script,
    validate_template, ValidationError,
};

mod loader;
pub use loader::{load_dir, load_file, save_file, DirOutcome, LoadError, LoadOptions, LoadOutcome};

mod render;
pub use render::{render, RenderError};
