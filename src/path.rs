//! Output path resolution
//!
//! Turns (requested format, optional user path, input file list) into a
//! validated [`OutputTarget`] before anything is written. Resolution policy,
//! in order:
//!
//! 1. no user path → one default per input file, the input path with its
//!    extension swapped for the format's canonical extension;
//! 2. directory target (no extension; created if absent) → default filename
//!    per input file, placed inside;
//! 3. bare filename → placed next to the first input file;
//! 4. full file path → used verbatim.
//!
//! A present extension must match the requested format, and a single-file
//! target is rejected when there are multiple input files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Errors raised during output path resolution
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// The requested output format is not one of the supported set
    #[error("unsupported output format: {0:?}")]
    UnsupportedFormat(String),

    /// Generic path validation failure
    #[error("path validation failed: {0}")]
    Validation(String),

    /// The supplied path's extension contradicts the requested format
    #[error("output extension {found:?} does not match {expected:?} required by the requested format")]
    ExtensionMismatch {
        /// Canonical extension of the requested format
        expected: String,
        /// Extension found on the supplied path
        found: String,
    },

    /// A single-file target cannot serve multiple input files
    #[error("a single output path is ambiguous for {inputs} input files; pass a directory or no path")]
    AmbiguousTarget {
        /// Number of input files
        inputs: usize,
    },

    /// Directory creation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Single-file ZIP container (`.echopak`)
    Container,
    /// Directory-based chunked store (`.zarr`)
    Bundle,
}

impl ExportFormat {
    /// Canonical filename extension, without the leading dot.
    pub fn canonical_extension(&self) -> &'static str {
        match self {
            ExportFormat::Container => "echopak",
            ExportFormat::Bundle => "zarr",
        }
    }

    /// Parse a user-supplied format string (`"zarr"`, `".echopak"`, ...).
    pub fn parse(s: &str) -> Result<Self, PathError> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "echopak" => Ok(ExportFormat::Container),
            "zarr" => Ok(ExportFormat::Bundle),
            _ => Err(PathError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_extension())
    }
}

/// Whether a conversion produces one artifact or one per input file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    /// One artifact for the whole run
    Single,
    /// One artifact per input file
    PerInput,
}

/// A fully resolved, validated output location set
#[derive(Debug, Clone)]
pub struct OutputTarget {
    /// The requested container format
    pub format: ExportFormat,
    /// Output multiplicity; matches the cardinality of `paths`
    pub multiplicity: Multiplicity,
    /// Resolved output paths, parallel to the input files when `PerInput`
    pub paths: Vec<PathBuf>,
}

/// Resolve and validate the output location(s) for a conversion run.
///
/// `combine` collapses the per-input cases to a single artifact derived from
/// the first input file.
pub fn resolve_output(
    format: ExportFormat,
    save_path: Option<&Path>,
    inputs: &[PathBuf],
    combine: bool,
) -> Result<OutputTarget, PathError> {
    if inputs.is_empty() {
        return Err(PathError::Validation("no input files to resolve against".into()));
    }

    let ext = format.canonical_extension();
    let named_inputs: &[PathBuf] = if combine { &inputs[..1] } else { inputs };

    let (paths, multiplicity) = match save_path {
        None => {
            let paths = named_inputs.iter().map(|p| p.with_extension(ext)).collect();
            (paths, per_input_or_single(combine))
        }
        Some(user) => {
            // An existing directory is a directory target even when its name
            // carries an extension-like suffix (`results.d/`, `old.zarr/`).
            let extension = if user.is_dir() { None } else { user.extension() };
            match extension {
                // Directory target: create it if absent and derive one
                // default filename per input inside.
                None => {
                    fs::create_dir_all(user)?;
                    let paths = named_inputs
                        .iter()
                        .map(|p| user.join(default_filename(p, ext)))
                        .collect();
                    (paths, per_input_or_single(combine))
                }
                Some(found) => {
                    if !found.eq_ignore_ascii_case(ext) {
                        return Err(PathError::ExtensionMismatch {
                            expected: ext.to_string(),
                            found: found.to_string_lossy().into_owned(),
                        });
                    }
                    if inputs.len() > 1 && !combine {
                        return Err(PathError::AmbiguousTarget {
                            inputs: inputs.len(),
                        });
                    }
                    let resolved = if is_bare_filename(user) {
                        // Bare filename goes next to the first input file.
                        parent_of(&inputs[0]).join(user)
                    } else {
                        user.to_path_buf()
                    };
                    (vec![resolved], Multiplicity::Single)
                }
            }
        }
    };

    let target = OutputTarget {
        format,
        multiplicity,
        paths,
    };
    debug_assert!(match target.multiplicity {
        Multiplicity::Single => target.paths.len() == 1,
        Multiplicity::PerInput => target.paths.len() == named_inputs.len(),
    });
    Ok(target)
}

fn per_input_or_single(combine: bool) -> Multiplicity {
    if combine {
        Multiplicity::Single
    } else {
        Multiplicity::PerInput
    }
}

fn default_filename(input: &Path, ext: &str) -> PathBuf {
    input.with_extension(ext).file_name().map(PathBuf::from).unwrap_or_default()
}

fn is_bare_filename(p: &Path) -> bool {
    match p.parent() {
        None => true,
        Some(parent) => parent.as_os_str().is_empty(),
    }
}

fn parent_of(p: &Path) -> PathBuf {
    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
