//! Conversion orchestration
//!
//! [`Converter`] ties the pipeline together: decode every capture file into a
//! [`PingStack`], derive the calibrated quantities, build the in-memory
//! [`Dataset`] and persist it through a [`DatasetWriter`]. By default each
//! input file yields one artifact; [`ConvertConfig::combine`] concatenates
//! all inputs along the ping axis into a single artifact instead.
//!
//! File decoding fans out over a small worker pool, with results committed
//! back in input order so artifacts and concatenation never depend on thread
//! scheduling.

use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::bounded;
use log::{debug, info};

use crate::assemble::{AssembleError, ChannelAssembler, PingStack};
use crate::calibration::{CalibrationError, CalibrationSet};
use crate::dataset::{build_dataset, DatasetBuildError, PlatformInfo, RunMetadata};
use crate::derive;
use crate::frame::{FrameError, FramePolicy, FrameReader};
use crate::path::{resolve_output, ExportFormat, Multiplicity, OutputTarget, PathError};
use crate::writer::{DatasetWriter, WriterError};

/// Decode workers used when converting several files at once.
const MAX_DECODE_WORKERS: usize = 4;

/// Errors raised during a conversion run
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// A capture file could not be opened or read
    #[error("cannot read capture file {file}: {source}")]
    Input {
        /// The capture file
        file: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// The calibration file could not be loaded
    #[error("calibration file {file}: {source}")]
    Calibration {
        /// The calibration file
        file: PathBuf,
        /// Underlying cause
        #[source]
        source: CalibrationError,
    },

    /// Calibration did not match the decoded data
    #[error("calibration mismatch: {0}")]
    CalibrationMismatch(#[from] CalibrationError),

    /// A capture file could not be decoded
    #[error("capture file {file}: {source}")]
    Frame {
        /// The capture file
        file: PathBuf,
        /// Underlying cause
        #[source]
        source: FrameError,
    },

    /// Ping assembly failed
    #[error(transparent)]
    Assemble(#[from] AssembleError),

    /// Dataset construction failed
    #[error(transparent)]
    Dataset(#[from] DatasetBuildError),

    /// Output path resolution failed
    #[error(transparent)]
    Path(#[from] PathError),

    /// Artifact persistence failed
    #[error(transparent)]
    Writer(#[from] WriterError),
}

/// The instrument families the converter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentModel {
    /// Multi-frequency autonomous echosounder
    Azfp,
}

impl std::fmt::Display for InstrumentModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentModel::Azfp => f.write_str("AZFP"),
        }
    }
}

/// The inputs of one conversion run
#[derive(Debug, Clone)]
pub struct ConversionSource {
    /// Capture files, in the order their pings concatenate
    pub files: Vec<PathBuf>,
    /// Instrument family the files came from
    pub model: InstrumentModel,
    /// Instrument calibration XML
    pub calibration_path: PathBuf,
}

impl ConversionSource {
    /// Describe a run over the given capture files and calibration file.
    pub fn new(
        files: impl IntoIterator<Item = impl Into<PathBuf>>,
        calibration_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            model: InstrumentModel::Azfp,
            calibration_path: calibration_path.into(),
        }
    }
}

/// Tunable conversion behavior
#[derive(Debug, Clone, Default)]
pub struct ConvertConfig {
    /// How corrupt frames are handled
    pub frame_policy: FramePolicy,
    /// Concatenate all inputs into one artifact instead of one per input
    pub combine: bool,
    /// Optional deployment description for the `Platform` group
    pub platform: Option<PlatformInfo>,
    /// Override the calibration file's water salinity (PSU)
    pub salinity_psu: Option<f64>,
    /// Override the calibration file's deployment pressure (dbar)
    pub pressure_dbar: Option<f64>,
}

/// Counters accumulated over one conversion run
#[derive(Debug, Clone, Default)]
pub struct ConversionStats {
    /// Capture files decoded
    pub files: usize,
    /// Pings decoded across all files
    pub pings: usize,
    /// Channels per ping
    pub channels: usize,
    /// Corrupt frames skipped (lenient policy only)
    pub skipped_frames: usize,
    /// Artifacts written
    pub artifacts: usize,
    /// Chunk payload bytes written across all artifacts
    pub bytes_written: u64,
}

impl std::fmt::Display for ConversionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} files, {} pings x {} channels -> {} artifacts ({} payload bytes, {} frames skipped)",
            self.files,
            self.pings,
            self.channels,
            self.artifacts,
            self.bytes_written,
            self.skipped_frames
        )
    }
}

/// The result of a completed conversion run
#[derive(Debug)]
pub struct ConversionOutcome {
    /// Where the artifacts landed
    pub target: OutputTarget,
    /// Run counters
    pub stats: ConversionStats,
}

/// One decoded capture file, pre-concatenation
struct DecodedFile {
    stack: PingStack,
    skipped: usize,
}

/// Drives conversions from capture files to persisted datasets
pub struct Converter {
    source: ConversionSource,
    config: ConvertConfig,
}

impl Converter {
    /// Create a converter with default behavior (strict frames, one artifact
    /// per input, no platform data).
    pub fn new(source: ConversionSource) -> Self {
        Self {
            source,
            config: ConvertConfig::default(),
        }
    }

    /// Replace the conversion behavior.
    pub fn with_config(mut self, config: ConvertConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the input set, keeping the configured behavior.
    pub fn with_source(mut self, source: ConversionSource) -> Self {
        self.source = source;
        self
    }

    /// Resolve and validate the output location(s) without converting.
    pub fn validate_path(
        &self,
        format: ExportFormat,
        save_path: Option<&Path>,
    ) -> Result<OutputTarget, ConvertError> {
        Ok(resolve_output(
            format,
            save_path,
            &self.source.files,
            self.config.combine,
        )?)
    }

    /// Run the conversion and persist the artifact(s).
    pub fn convert(
        &self,
        format: ExportFormat,
        save_path: Option<&Path>,
        overwrite: bool,
    ) -> Result<ConversionOutcome, ConvertError> {
        let target = self.validate_path(format, save_path)?;
        let mut cal = CalibrationSet::from_file(&self.source.calibration_path).map_err(|source| {
            ConvertError::Calibration {
                file: self.source.calibration_path.clone(),
                source,
            }
        })?;
        if let Some(salinity) = self.config.salinity_psu {
            cal.salinity_psu = salinity;
        }
        if let Some(pressure) = self.config.pressure_dbar {
            cal.pressure_dbar = pressure;
        }

        info!(
            "converting {} {} file(s) to {}",
            self.source.files.len(),
            self.source.model,
            format
        );

        let decoded = self.decode_all()?;

        let mut stats = ConversionStats {
            files: decoded.len(),
            ..ConversionStats::default()
        };
        for d in &decoded {
            stats.pings += d.stack.num_pings();
            stats.skipped_frames += d.skipped;
        }
        if let Some(first) = decoded.first() {
            stats.channels = first.stack.config.num_channels;
        }

        let writer = DatasetWriter::new(format, overwrite);
        let stacks: Vec<PingStack> = decoded.into_iter().map(|d| d.stack).collect();
        match target.multiplicity {
            Multiplicity::Single => {
                let stack = PingStack::concat(stacks)?;
                let written = self.write_one(&writer, &stack, &cal, &target.paths[0])?;
                stats.artifacts += 1;
                stats.bytes_written += written;
            }
            Multiplicity::PerInput => {
                for (stack, dest) in stacks.iter().zip(&target.paths) {
                    let written = self.write_one(&writer, stack, &cal, dest)?;
                    stats.artifacts += 1;
                    stats.bytes_written += written;
                }
            }
        }

        info!("conversion finished: {}", stats);
        Ok(ConversionOutcome { target, stats })
    }

    /// Convert to the single-file container format.
    pub fn to_container(
        &self,
        save_path: Option<&Path>,
        overwrite: bool,
    ) -> Result<ConversionOutcome, ConvertError> {
        self.convert(ExportFormat::Container, save_path, overwrite)
    }

    /// Convert to the directory bundle format.
    pub fn to_bundle(
        &self,
        save_path: Option<&Path>,
        overwrite: bool,
    ) -> Result<ConversionOutcome, ConvertError> {
        self.convert(ExportFormat::Bundle, save_path, overwrite)
    }

    fn write_one(
        &self,
        writer: &DatasetWriter,
        stack: &PingStack,
        cal: &CalibrationSet,
        dest: &Path,
    ) -> Result<u64, ConvertError> {
        // Each stack carries its own channel configuration; the calibration
        // must cover it exactly, in both directions.
        cal.ensure_channel_count(stack.config.num_channels)?;
        let derived = derive::compute(stack, cal)?;
        let run = RunMetadata::new(
            stack
                .source_files
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            cal.serial,
        );
        let dataset = build_dataset(stack, &derived, cal, &run, self.config.platform)?;
        let write_stats = writer.write(&dataset, dest)?;
        Ok(write_stats.bytes_written)
    }

    /// Decode every input file, in input order.
    fn decode_all(&self) -> Result<Vec<DecodedFile>, ConvertError> {
        let files = &self.source.files;
        let policy = self.config.frame_policy;
        let workers = files.len().min(MAX_DECODE_WORKERS);

        if workers <= 1 {
            return files.iter().map(|f| decode_file(f, policy)).collect();
        }

        let (job_tx, job_rx) = bounded::<(usize, &PathBuf)>(files.len());
        let (result_tx, result_rx) = bounded(files.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (index, file) in job_rx.iter() {
                        let _ = result_tx.send((index, decode_file(file, policy)));
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            for job in files.iter().enumerate() {
                let _ = job_tx.send(job);
            }
            drop(job_tx);

            // Commit results back in input order.
            let mut slots: Vec<Option<DecodedFile>> = Vec::new();
            slots.resize_with(files.len(), || None);
            for (index, result) in result_rx.iter() {
                slots[index] = Some(result?);
            }
            Ok(slots.into_iter().flatten().collect())
        })
    }
}

/// Decode one capture file into a ping stack.
fn decode_file(file: &Path, policy: FramePolicy) -> Result<DecodedFile, ConvertError> {
    let wrap = |source: FrameError| ConvertError::Frame {
        file: file.to_path_buf(),
        source,
    };

    let mut reader = FrameReader::open(file, policy).map_err(|e| match e {
        // Opening failures are input errors, not frame corruption.
        FrameError::Io(source) => ConvertError::Input {
            file: file.to_path_buf(),
            source,
        },
        other => wrap(other),
    })?;
    let mut assembler = ChannelAssembler::new(file);
    while let Some(ping) = reader.next_ping().map_err(wrap)? {
        assembler.push(&ping)?;
    }

    let skipped = reader.skipped_frames();
    let stack = assembler.finish()?;
    debug!(
        "decoded {} pings from {} ({} frames skipped)",
        stack.num_pings(),
        file.display(),
        skipped
    );
    Ok(DecodedFile { stack, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_display_is_compact() {
        let stats = ConversionStats {
            files: 2,
            pings: 240,
            channels: 4,
            skipped_frames: 1,
            artifacts: 2,
            bytes_written: 4096,
        };
        assert_eq!(
            stats.to_string(),
            "2 files, 240 pings x 4 channels -> 2 artifacts (4096 payload bytes, 1 frames skipped)"
        );
    }

    #[test]
    fn source_defaults_to_azfp() {
        let source = ConversionSource::new(["a.01A"], "cal.xml");
        assert_eq!(source.model, InstrumentModel::Azfp);
        assert_eq!(source.files, vec![PathBuf::from("a.01A")]);
    }

    #[test]
    fn missing_calibration_surfaces_the_file() {
        let source = ConversionSource::new(["a.01A"], "/nonexistent/cal.xml");
        let err = Converter::new(source)
            .to_bundle(None, false)
            .unwrap_err();
        match err {
            ConvertError::Calibration { file, .. } => {
                assert_eq!(file, PathBuf::from("/nonexistent/cal.xml"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
