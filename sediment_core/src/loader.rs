//! Loads descriptors from a directory of JSON files.
//!
//! Each `*.json` file holds one descriptor:
//!
//! ```json
//! {
//!   "up": [
//!     { "op": "add_column", "table": "zones", "column": { "name": "code", "type": "text", "nullable": true } }
//!   ],
//!   "reversible": true
//! }
//! ```
//!
//! `id` and `name` default to the parts of the file stem: in
//! `2023_05_04_120000_create_zones.json` the id is `2023_05_04_120000` and
//! the name `create_zones`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::descriptor::{Descriptor, DescriptorError, Step};
use crate::operation::Operation;

/// Errors raised while loading descriptor files.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// A file or directory could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// The path being read.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A file is not a valid descriptor.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },
    /// No id was given and none could be derived from the file name.
    #[error("{path}: no id given and the file name does not start with one")]
    MissingId {
        /// The offending file.
        path: PathBuf,
    },
    /// The descriptor is malformed.
    #[error("{path}: {source}")]
    Invalid {
        /// The offending file.
        path: PathBuf,
        /// What is wrong with it.
        #[source]
        source: DescriptorError,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFile {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    up: Vec<Step>,
    #[serde(default)]
    down: Vec<Operation>,
    #[serde(default)]
    reversible: bool,
}

/// Loads every `*.json` file in `dir`, sorted by id.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Descriptor>, LoaderError> {
    let dir = dir.as_ref();
    let io = |source| LoaderError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }

    let mut descriptors = paths
        .iter()
        .map(|path| load_file(path))
        .collect::<Result<Vec<_>, _>>()?;
    descriptors.sort_by(|a, b| a.id().cmp(b.id()));
    log::debug!("Loaded {} descriptor(s) from {}", descriptors.len(), dir.display());
    Ok(descriptors)
}

/// Loads one descriptor file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Descriptor, LoaderError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &contents)
}

fn parse(path: &Path, contents: &str) -> Result<Descriptor, LoaderError> {
    let file: DescriptorFile =
        serde_json::from_str(contents).map_err(|source| LoaderError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem_id, stem_name) = split_stem(&stem);

    let id = match file.id.or(stem_id) {
        Some(id) => id,
        None => {
            return Err(LoaderError::MissingId {
                path: path.to_path_buf(),
            });
        }
    };
    let name = file.name.unwrap_or(stem_name);

    let invalid = |source| LoaderError::Invalid {
        path: path.to_path_buf(),
        source,
    };

    let mut descriptor = Descriptor::new(id, name);
    for step in file.up {
        descriptor = descriptor.step(step);
    }
    if file.reversible && file.down.is_empty() {
        descriptor = descriptor.with_derived_reverse().map_err(invalid)?;
    } else {
        for operation in file.down {
            descriptor = descriptor.down(operation);
        }
    }
    descriptor.validate().map_err(invalid)?;
    Ok(descriptor)
}

/// Splits `2023_05_04_120000_create_zones` into its id and name.
///
/// The id is the leading run of digits and underscores, without the
/// separator before the name.
fn split_stem(stem: &str) -> (Option<String>, String) {
    let end = stem
        .find(|c: char| !(c.is_ascii_digit() || c == '_'))
        .unwrap_or(stem.len());
    let id = stem[..end].trim_end_matches('_');
    if !id.chars().any(|c| c.is_ascii_digit()) {
        return (None, stem.to_string());
    }
    (Some(id.to_string()), stem[end..].to_string())
}
