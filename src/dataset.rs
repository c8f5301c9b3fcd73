//! In-memory dataset model
//!
//! A [`Dataset`] is the structured product of a conversion: named groups of
//! variables with explicit dimension names, ready to be persisted through any
//! [`crate::writer::ContainerSink`]. It exists only in memory and is immutable
//! once built.
//!
//! Group layout:
//!
//! - `Beam`: `frequency(frequency)`, `ping_time(ping_time)`,
//!   `tilt_x`/`tilt_y(ping_time)` and `backscatter_r(frequency, ping_time,
//!   range_bin)`; a ragged file (channels with differing bin counts) stores
//!   one `backscatter_r_chN(ping_time, range_bin_chN)` per channel instead.
//! - `Environment`: `temperature(ping_time)`,
//!   `sound_speed_indicative(ping_time)`.
//! - `Vendor`: `battery_main(ping_time)`, `battery_tx(ping_time)`.
//! - `Platform`: optional; omitted entirely when no platform data was
//!   supplied — never emitted with missing fields.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::assemble::PingStack;
use crate::calibration::CalibrationSet;
use crate::derive::DerivedQuantities;

/// Errors raised while building or validating a dataset
#[derive(Debug, thiserror::Error)]
pub enum DatasetBuildError {
    /// A variable's data length does not match its declared shape
    #[error("variable {variable}: shape {shape:?} implies {expected} values, got {actual}")]
    ShapeMismatch {
        /// Variable name
        variable: String,
        /// Declared shape
        shape: Vec<usize>,
        /// Element count implied by the shape
        expected: usize,
        /// Actual data length
        actual: usize,
    },

    /// A structural dimension contract was violated
    #[error("dimension contract violation on {variable}: {detail}")]
    DimensionContract {
        /// Variable name
        variable: String,
        /// The violated constraint
        detail: String,
    },
}

/// One named multi-dimensional variable
#[derive(Debug, Clone)]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Dimension names, outermost first
    pub dims: Vec<String>,
    /// Shape along each dimension
    pub shape: Vec<usize>,
    /// Row-major (C order) values
    pub data: Vec<f64>,
    /// JSON attributes (units etc.)
    pub attrs: Map<String, Value>,
}

impl Variable {
    /// Create a variable, validating data length against the shape.
    pub fn new(
        name: impl Into<String>,
        dims: &[(&str, usize)],
        data: Vec<f64>,
    ) -> Result<Self, DatasetBuildError> {
        let name = name.into();
        let shape: Vec<usize> = dims.iter().map(|(_, n)| *n).collect();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DatasetBuildError::ShapeMismatch {
                variable: name,
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            name,
            dims: dims.iter().map(|(d, _)| d.to_string()).collect(),
            shape,
            data,
            attrs: Map::new(),
        })
    }

    /// Attach an attribute.
    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }
}

/// A named group of variables
#[derive(Debug, Clone)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Variables in emission order
    pub variables: Vec<Variable>,
}

impl Group {
    /// Look up a variable by name.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Provenance recorded with every conversion run
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    /// Unique id of this conversion run
    pub conversion_id: Uuid,
    /// Wall-clock time the conversion started
    pub conversion_time: DateTime<Utc>,
    /// Converting software name
    pub software: String,
    /// Converting software version
    pub version: String,
    /// Source capture files, in order
    pub source_files: Vec<String>,
    /// Instrument serial number
    pub instrument_serial: Option<u32>,
}

impl RunMetadata {
    /// Provenance for a run over the given source files.
    pub fn new(source_files: Vec<String>, instrument_serial: Option<u32>) -> Self {
        Self {
            conversion_id: Uuid::new_v4(),
            conversion_time: Utc::now(),
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            source_files,
            instrument_serial,
        }
    }
}

/// Optional platform (deployment) description for the `Platform` group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlatformInfo {
    /// Deployment latitude in decimal degrees
    pub latitude: f64,
    /// Deployment longitude in decimal degrees
    pub longitude: f64,
    /// Water level relative to the transducer face, in m
    pub water_level: f64,
}

/// The structured, immutable product of one conversion
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Named groups in emission order
    pub groups: Vec<Group>,
    /// Global attributes (provenance)
    pub attrs: Map<String, Value>,
}

impl Dataset {
    /// Look up a group by name.
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Re-check the structural dimension contracts.
    pub fn validate_contract(&self) -> Result<(), DatasetBuildError> {
        if let Some(beam) = self.group("Beam") {
            if let Some(v) = beam.variable("backscatter_r") {
                if v.dims != ["frequency", "ping_time", "range_bin"] {
                    return Err(DatasetBuildError::DimensionContract {
                        variable: "backscatter_r".into(),
                        detail: format!(
                            "dims must be (frequency, ping_time, range_bin), got {:?}",
                            v.dims
                        ),
                    });
                }
            }
        }
        if let Some(env) = self.group("Environment") {
            if let Some(v) = env.variable("temperature") {
                if v.dims != ["ping_time"] {
                    return Err(DatasetBuildError::DimensionContract {
                        variable: "temperature".into(),
                        detail: format!("dims must be (ping_time,), got {:?}", v.dims),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Assemble the final dataset from the pipeline products.
pub fn build_dataset(
    stack: &PingStack,
    derived: &DerivedQuantities,
    cal: &CalibrationSet,
    run: &RunMetadata,
    platform: Option<PlatformInfo>,
) -> Result<Dataset, DatasetBuildError> {
    let n_pings = stack.num_pings();
    let n_channels = stack.config.num_channels;

    let ping_time_var = |name: &str, data: Vec<f64>| -> Result<Variable, DatasetBuildError> {
        Variable::new(name, &[("ping_time", n_pings)], data)
    };

    // Beam group
    let mut beam = Group {
        name: "Beam".into(),
        variables: Vec::new(),
    };
    let frequency_hz: Vec<f64> = stack
        .config
        .frequency_khz
        .iter()
        .map(|f| f * 1000.0)
        .collect();
    beam.variables.push(
        Variable::new("frequency", &[("frequency", n_channels)], frequency_hz)?
            .attr("units", "Hz")
            .attr("long_name", "Transducer frequency"),
    );
    beam.variables.push(
        ping_time_var("ping_time", stack.ping_time.clone())?
            .attr("units", "seconds since 1970-01-01 00:00:00")
            .attr("long_name", "Timestamp of each ping"),
    );
    beam.variables
        .push(ping_time_var("tilt_x", derived.tilt_x.clone())?.attr("units", "degree"));
    beam.variables
        .push(ping_time_var("tilt_y", derived.tilt_y.clone())?.attr("units", "degree"));

    match stack.config.uniform_bins() {
        Some(n_bins) => {
            let mut cube = Vec::with_capacity(n_channels * n_pings * n_bins);
            for block in &derived.backscatter {
                cube.extend_from_slice(&block.samples);
            }
            beam.variables.push(
                Variable::new(
                    "backscatter_r",
                    &[
                        ("frequency", n_channels),
                        ("ping_time", n_pings),
                        ("range_bin", n_bins),
                    ],
                    cube,
                )?
                .attr("units", "dB")
                .attr("long_name", "Calibrated backscatter strength"),
            );
        }
        None => {
            // Ragged file: one variable per channel, each with its own
            // range-bin dimension.
            for (ch, block) in derived.backscatter.iter().enumerate() {
                let dim = format!("range_bin_ch{ch}");
                beam.variables.push(
                    Variable::new(
                        format!("backscatter_r_ch{ch}"),
                        &[("ping_time", n_pings), (dim.as_str(), block.n_bins)],
                        block.samples.clone(),
                    )?
                    .attr("units", "dB")
                    .attr("long_name", "Calibrated backscatter strength")
                    .attr("channel", ch as i64),
                );
            }
        }
    }

    // Environment group
    let environment = Group {
        name: "Environment".into(),
        variables: vec![
            ping_time_var("temperature", derived.temperature.clone())?
                .attr("units", "degree_Celsius"),
            ping_time_var("sound_speed_indicative", derived.sound_speed.clone())?
                .attr("units", "m/s")
                .attr("long_name", "Indicative sound speed"),
        ],
    };

    // Vendor group
    let vendor = Group {
        name: "Vendor".into(),
        variables: vec![
            ping_time_var("battery_main", stack.battery_main_counts.clone())?
                .attr("units", "count"),
            ping_time_var("battery_tx", stack.battery_tx_counts.clone())?.attr("units", "count"),
        ],
    };

    let mut groups = vec![beam, environment, vendor];

    if let Some(p) = platform {
        groups.push(Group {
            name: "Platform".into(),
            variables: vec![
                Variable::new("latitude", &[], vec![p.latitude])?.attr("units", "degrees_north"),
                Variable::new("longitude", &[], vec![p.longitude])?.attr("units", "degrees_east"),
                Variable::new("water_level", &[], vec![p.water_level])?.attr("units", "m"),
            ],
        });
    }

    let mut attrs = Map::new();
    attrs.insert("conversion_software".into(), json!(run.software));
    attrs.insert("conversion_software_version".into(), json!(run.version));
    attrs.insert("conversion_id".into(), json!(run.conversion_id.to_string()));
    attrs.insert(
        "conversion_time".into(),
        json!(run.conversion_time.to_rfc3339()),
    );
    attrs.insert("source_files".into(), json!(run.source_files));
    if let Some(serial) = cal.serial {
        attrs.insert("instrument_serial".into(), json!(serial));
    }
    attrs.insert("salinity_psu".into(), json!(cal.salinity_psu));
    attrs.insert("pressure_dbar".into(), json!(cal.pressure_dbar));

    let dataset = Dataset { groups, attrs };
    dataset.validate_contract()?;
    Ok(dataset)
}
