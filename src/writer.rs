//! Dataset persistence
//!
//! Both container formats share one store tree: JSON metadata documents
//! (`.zgroup` / `.zarray` / `.zattrs`) plus one raw little-endian f64 chunk
//! per variable, C order, single chunk spanning the whole array. The tree is
//! Zarr-v2 compatible and carries xarray `_ARRAY_DIMENSIONS` attributes, so
//! format interchangeability is structural.
//!
//! The serialization backends sit behind the [`ContainerSink`] seam:
//!
//! - [`ExportFormat::Bundle`]: directory store, staged in a temp directory
//!   next to the destination and renamed into place on success.
//! - [`ExportFormat::Container`]: single ZIP file with a stored `mimetype`
//!   first entry; chunk payloads are stored uncompressed so readers can seek,
//!   JSON entries are deflated. Staged as a temp file and persisted on
//!   success.
//!
//! On any mid-write failure the staged artifact is dropped and the
//! destination is left untouched.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use log::info;
use serde_json::{json, Value};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::dataset::{Dataset, Variable};
use crate::path::ExportFormat;

/// MIME type recorded as the first entry of a `.echopak` container.
pub const ECHOPAK_MIMETYPE: &str = "application/vnd.echopak";

/// Errors that can occur while persisting a dataset
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP container failure
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON serialization failure
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The destination exists and `overwrite` was not requested
    #[error("output already exists: {0} (pass overwrite=true to replace it)")]
    AlreadyExists(PathBuf),

    /// The destination path cannot host the artifact
    #[error("invalid output target: {0}")]
    InvalidTarget(String),
}

/// Store-entry writer collaborator implemented by each container backend
pub trait ContainerSink {
    /// Write a raw entry. `compress` hints that the entry is small metadata
    /// and may be compressed; chunk payloads pass `false`.
    fn put_bytes(&mut self, rel_path: &str, bytes: &[u8], compress: bool)
        -> Result<(), WriterError>;

    /// Write a JSON document entry.
    fn put_json(&mut self, rel_path: &str, value: &Value) -> Result<(), WriterError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put_bytes(rel_path, &bytes, true)
    }

    /// Finalize the artifact, replacing the destination atomically.
    fn finish(self: Box<Self>) -> Result<(), WriterError>;
}

/// Statistics from one persisted artifact
#[derive(Debug, Clone, Default)]
pub struct WriteStats {
    /// Variables written across all groups
    pub variables_written: usize,
    /// Total chunk payload bytes
    pub bytes_written: u64,
}

impl std::fmt::Display for WriteStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} variables, {} payload bytes",
            self.variables_written, self.bytes_written
        )
    }
}

/// Persists datasets to a destination path in a chosen format
pub struct DatasetWriter {
    format: ExportFormat,
    overwrite: bool,
}

impl DatasetWriter {
    /// Create a writer for the given format and overwrite policy.
    pub fn new(format: ExportFormat, overwrite: bool) -> Self {
        Self { format, overwrite }
    }

    /// Persist a dataset.
    ///
    /// Fails with [`WriterError::AlreadyExists`] when the destination exists
    /// and overwrite is off. The write is atomic from the caller's
    /// perspective: a failure mid-write leaves no finalized artifact.
    pub fn write(&self, dataset: &Dataset, dest: &Path) -> Result<WriteStats, WriterError> {
        if dest.exists() && !self.overwrite {
            return Err(WriterError::AlreadyExists(dest.to_path_buf()));
        }
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut sink: Box<dyn ContainerSink> = match self.format {
            ExportFormat::Container => {
                Box::new(ZipContainerSink::create(&parent, dest, self.overwrite)?)
            }
            ExportFormat::Bundle => Box::new(BundleSink::create(&parent, dest, self.overwrite)?),
        };

        let stats = emit_store(dataset, sink.as_mut())?;
        sink.finish()?;

        info!("wrote {} to {}", stats, dest.display());
        Ok(stats)
    }
}

/// Walk the dataset and emit the shared store tree through a sink.
fn emit_store(dataset: &Dataset, sink: &mut dyn ContainerSink) -> Result<WriteStats, WriterError> {
    let mut stats = WriteStats::default();

    sink.put_json(".zgroup", &json!({ "zarr_format": 2 }))?;
    sink.put_json(".zattrs", &Value::Object(dataset.attrs.clone()))?;
    sink.put_json("metadata.json", &run_summary(dataset))?;

    for group in &dataset.groups {
        sink.put_json(&format!("{}/.zgroup", group.name), &json!({ "zarr_format": 2 }))?;
        for variable in &group.variables {
            stats.bytes_written += emit_variable(sink, &group.name, variable)?;
            stats.variables_written += 1;
        }
    }

    Ok(stats)
}

fn emit_variable(
    sink: &mut dyn ContainerSink,
    group: &str,
    variable: &Variable,
) -> Result<u64, WriterError> {
    let prefix = format!("{}/{}", group, variable.name);

    sink.put_json(
        &format!("{prefix}/.zarray"),
        &json!({
            "zarr_format": 2,
            "shape": variable.shape,
            "chunks": variable.shape,
            "dtype": "<f8",
            "order": "C",
            "compressor": null,
            "filters": null,
            "fill_value": null,
        }),
    )?;

    let mut attrs = variable.attrs.clone();
    attrs.insert("_ARRAY_DIMENSIONS".into(), json!(variable.dims));
    sink.put_json(&format!("{prefix}/.zattrs"), &Value::Object(attrs))?;

    let mut payload = Vec::with_capacity(variable.data.len() * 8);
    for &v in &variable.data {
        payload.write_f64::<LittleEndian>(v)?;
    }
    let chunk_key = vec!["0"; variable.shape.len().max(1)].join(".");
    sink.put_bytes(&format!("{prefix}/{chunk_key}"), &payload, false)?;

    Ok(payload.len() as u64)
}

/// Human-readable run summary placed at the store root.
fn run_summary(dataset: &Dataset) -> Value {
    let groups: Vec<Value> = dataset
        .groups
        .iter()
        .map(|g| {
            json!({
                "name": g.name,
                "variables": g.variables.iter().map(|v| v.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "format": "echopak dataset",
        "attributes": Value::Object(dataset.attrs.clone()),
        "groups": groups,
    })
}

/// Single-file ZIP container backend
struct ZipContainerSink {
    zip: ZipWriter<BufWriter<File>>,
    staged: tempfile::TempPath,
    dest: PathBuf,
    overwrite: bool,
}

impl ZipContainerSink {
    fn create(parent: &Path, dest: &Path, overwrite: bool) -> Result<Self, WriterError> {
        let staged = tempfile::Builder::new()
            .prefix(".echopak-staging-")
            .tempfile_in(parent)?;
        let (file, staged) = staged.into_parts();
        let mut zip = ZipWriter::new(BufWriter::new(file));

        // The mimetype entry comes first and is stored uncompressed so it is
        // identifiable from the leading bytes of the archive.
        zip.start_file(
            "mimetype",
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
        )?;
        zip.write_all(ECHOPAK_MIMETYPE.as_bytes())?;

        Ok(Self {
            zip,
            staged,
            dest: dest.to_path_buf(),
            overwrite,
        })
    }
}

impl ContainerSink for ZipContainerSink {
    fn put_bytes(
        &mut self,
        rel_path: &str,
        bytes: &[u8],
        compress: bool,
    ) -> Result<(), WriterError> {
        let method = if compress {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        self.zip
            .start_file(rel_path, SimpleFileOptions::default().compression_method(method))?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), WriterError> {
        let inner = self.zip.finish()?;
        let file = inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if self.dest.exists() && self.overwrite {
            remove_existing(&self.dest)?;
        }
        self.staged
            .persist(&self.dest)
            .map_err(|e| WriterError::Io(e.error))?;
        Ok(())
    }
}

/// Directory bundle backend
struct BundleSink {
    staging: Option<TempDir>,
    dest: PathBuf,
    overwrite: bool,
}

impl BundleSink {
    fn create(parent: &Path, dest: &Path, overwrite: bool) -> Result<Self, WriterError> {
        let staging = tempfile::Builder::new()
            .prefix(".zarr-staging-")
            .tempdir_in(parent)?;
        Ok(Self {
            staging: Some(staging),
            dest: dest.to_path_buf(),
            overwrite,
        })
    }
}

impl ContainerSink for BundleSink {
    fn put_bytes(
        &mut self,
        rel_path: &str,
        bytes: &[u8],
        _compress: bool,
    ) -> Result<(), WriterError> {
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| WriterError::InvalidTarget("bundle already finalized".into()))?;
        let path = staging.path().join(rel_path);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), WriterError> {
        let staging = self
            .staging
            .take()
            .ok_or_else(|| WriterError::InvalidTarget("bundle already finalized".into()))?;

        if self.dest.exists() && self.overwrite {
            remove_existing(&self.dest)?;
        }

        let staged_path = staging.into_path();
        if let Err(e) = fs::rename(&staged_path, &self.dest) {
            // Failed rename: drop the staging tree rather than leaving it.
            let _ = fs::remove_dir_all(&staged_path);
            return Err(e.into());
        }
        Ok(())
    }
}

fn remove_existing(path: &Path) -> Result<(), WriterError> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, Group, Variable};
    use serde_json::Map;
    use std::io::Read;
    use tempfile::tempdir;

    fn tiny_dataset() -> Dataset {
        let variables = vec![
            Variable::new("ping_time", &[("ping_time", 3)], vec![1.0, 2.0, 3.0])
                .unwrap()
                .attr("units", "seconds since 1970-01-01 00:00:00"),
            Variable::new(
                "backscatter_r",
                &[("frequency", 1), ("ping_time", 3), ("range_bin", 2)],
                vec![0.5; 6],
            )
            .unwrap(),
        ];
        let mut attrs = Map::new();
        attrs.insert("conversion_software".into(), "echopak".into());
        Dataset {
            groups: vec![Group {
                name: "Beam".into(),
                variables,
            }],
            attrs,
        }
    }

    #[test]
    fn bundle_layout_is_a_zarr_store() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.zarr");
        let stats = DatasetWriter::new(ExportFormat::Bundle, false)
            .write(&tiny_dataset(), &dest)
            .unwrap();

        assert_eq!(stats.variables_written, 2);
        assert!(dest.join(".zgroup").is_file());
        assert!(dest.join("Beam/.zgroup").is_file());
        assert!(dest.join("Beam/ping_time/.zarray").is_file());
        assert!(dest.join("Beam/ping_time/0").is_file());
        assert!(dest.join("Beam/backscatter_r/0.0.0").is_file());

        let zarray: Value = serde_json::from_slice(
            &fs::read(dest.join("Beam/backscatter_r/.zarray")).unwrap(),
        )
        .unwrap();
        assert_eq!(zarray["shape"], json!([1, 3, 2]));
        assert_eq!(zarray["dtype"], "<f8");
        assert_eq!(zarray["compressor"], Value::Null);

        let zattrs: Value = serde_json::from_slice(
            &fs::read(dest.join("Beam/ping_time/.zattrs")).unwrap(),
        )
        .unwrap();
        assert_eq!(zattrs["_ARRAY_DIMENSIONS"], json!(["ping_time"]));

        // Chunk payload is raw little-endian f64.
        let chunk = fs::read(dest.join("Beam/ping_time/0")).unwrap();
        assert_eq!(chunk.len(), 24);
        assert_eq!(f64::from_le_bytes(chunk[8..16].try_into().unwrap()), 2.0);

        // No staging leftovers next to the artifact.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains("staging"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn container_has_mimetype_first() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.echopak");
        DatasetWriter::new(ExportFormat::Container, false)
            .write(&tiny_dataset(), &dest)
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        {
            let first = archive.by_index(0).unwrap();
            assert_eq!(first.name(), "mimetype");
        }
        let mut mimetype = String::new();
        archive
            .by_name("mimetype")
            .unwrap()
            .read_to_string(&mut mimetype)
            .unwrap();
        assert_eq!(mimetype, ECHOPAK_MIMETYPE);

        let mut chunk = Vec::new();
        archive
            .by_name("Beam/backscatter_r/0.0.0")
            .unwrap()
            .read_to_end(&mut chunk)
            .unwrap();
        assert_eq!(chunk.len(), 48);
    }

    #[test]
    fn existing_target_requires_overwrite() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.zarr");
        let writer = DatasetWriter::new(ExportFormat::Bundle, false);
        writer.write(&tiny_dataset(), &dest).unwrap();

        assert!(matches!(
            writer.write(&tiny_dataset(), &dest),
            Err(WriterError::AlreadyExists(_))
        ));

        // Overwrite replaces the artifact in place.
        DatasetWriter::new(ExportFormat::Bundle, true)
            .write(&tiny_dataset(), &dest)
            .unwrap();
        assert!(dest.join(".zgroup").is_file());
    }

    #[test]
    fn overwrite_replaces_across_kinds() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.echopak");
        // Occupy the destination with a directory, then overwrite with the
        // single-file container.
        fs::create_dir_all(dest.join("junk")).unwrap();
        DatasetWriter::new(ExportFormat::Container, true)
            .write(&tiny_dataset(), &dest)
            .unwrap();
        assert!(dest.is_file());
    }
}
