//! # echopak - Echosounder Telemetry Conversion
//!
//! `echopak` converts raw capture files from multi-frequency autonomous
//! echosounders, together with the instrument's XML calibration file, into a
//! calibrated multi-dimensional dataset persisted in one of two
//! interchangeable container formats.
//!
//! ## Key Features
//!
//! - **Two container formats, one store tree**: a directory-based chunked
//!   bundle (`.zarr`) and a single-file ZIP container (`.echopak`) carry the
//!   identical Zarr-v2-compatible layout, so the choice of format never
//!   changes the data.
//!
//! - **Full calibration pipeline**: raw sensor counts become physical
//!   quantities — tilt angles, water temperature, sound speed, absorption and
//!   calibrated volume backscatter — using the per-instrument coefficients
//!   from the calibration file.
//!
//! - **Ragged channel support**: channels recorded at different range
//!   resolutions are kept at their native bin counts instead of being padded
//!   into a lossy cube.
//!
//! - **Strict by default**: corrupt frames abort the conversion unless the
//!   lenient policy is selected, and existing outputs are never overwritten
//!   unless asked.
//!
//! - **Provenance built in**: every artifact records the converting software,
//!   a unique conversion id, the wall-clock time and the source file list.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use echopak::convert::{ConversionSource, Converter};
//!
//! let source = ConversionSource::new(["deploy/17082117.01A"], "deploy/instrument.xml");
//! let outcome = Converter::new(source).to_bundle(None, false)?;
//! println!("{}", outcome.stats);
//! # Ok::<(), echopak::convert::ConvertError>(())
//! ```
//!
//! This produces a directory store next to the input:
//!
//! ```text
//! deploy/17082117.zarr/
//! ├── .zgroup                  # Zarr v2 group marker
//! ├── .zattrs                  # conversion provenance
//! ├── metadata.json            # human-readable run summary
//! ├── Beam/
//! │   ├── frequency/           # .zarray, .zattrs, chunk "0"
//! │   ├── ping_time/
//! │   └── backscatter_r/       # chunk "0.0.0", (frequency, ping_time, range_bin)
//! ├── Environment/             # temperature, sound_speed_indicative
//! └── Vendor/                  # battery_main, battery_tx
//! ```
//!
//! Passing [`path::ExportFormat::Container`] instead yields a single
//! `.echopak` ZIP with the same entries, led by a stored `mimetype` entry.
//!
//! ## Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`calibration`]: instrument calibration XML parsing
//! - [`frame`]: binary frame decoding and corrupt-frame policy
//! - [`assemble`]: stacking decoded pings into per-channel arrays
//! - [`derive`]: physical quantities from raw counts
//! - [`dataset`]: the in-memory grouped dataset model
//! - [`path`]: output path resolution and format validation
//! - [`writer`]: container backends and atomic persistence
//! - [`convert`]: end-to-end conversion orchestration
//! - [`reference`]: vendor CSV export reader for cross-validation

// Documentation lints - enforce complete documentation for publication
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
// Allow some patterns common in scientific code
#![allow(clippy::too_many_arguments)]

pub mod assemble;
pub mod calibration;
pub mod convert;
pub mod dataset;
pub mod derive;
pub mod frame;
pub mod path;
pub mod reference;
pub mod writer;

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::assemble::{AssembleError, ChannelAssembler, ChannelBlock, FileConfig, PingStack};
    pub use crate::calibration::{CalibrationError, CalibrationSet, ChannelCalibration};
    pub use crate::convert::{
        ConversionOutcome, ConversionSource, ConversionStats, ConvertConfig, ConvertError,
        Converter, InstrumentModel,
    };
    pub use crate::dataset::{
        build_dataset, Dataset, DatasetBuildError, Group, PlatformInfo, RunMetadata, Variable,
    };
    pub use crate::derive::DerivedQuantities;
    pub use crate::frame::{FrameError, FramePolicy, FrameReader, RawPing};
    pub use crate::path::{resolve_output, ExportFormat, Multiplicity, OutputTarget, PathError};
    pub use crate::reference::{read_power_export, ReferenceError};
    pub use crate::writer::{ContainerSink, DatasetWriter, WriteStats, WriterError, ECHOPAK_MIMETYPE};
}
