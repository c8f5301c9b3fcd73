//! Multi-ping array assembly
//!
//! [`ChannelAssembler`] consumes the decoded ping sequence of one capture
//! file and stacks each channel's per-ping sample vector into a 2-D block
//! (ping × range bin). Ordering is a caller responsibility: `ping_time` must
//! be strictly increasing and is never sorted here. Channels with different
//! range-bin counts are kept as independent blocks, preserving the
//! instrument-reported resolution differences instead of padding to a cube.
//!
//! Multiple files concatenate along the ping axis in file order, and only if
//! their channel configurations are identical.

use std::path::PathBuf;

use chrono::NaiveDateTime;

use crate::frame::RawPing;

/// Errors raised while assembling ping arrays
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// `ping_time` was not strictly increasing
    #[error("out-of-order ping at record {record}: {next} does not follow {prev}")]
    OutOfOrderPing {
        /// Record index of the offending ping
        record: usize,
        /// Timestamp of the preceding ping
        prev: NaiveDateTime,
        /// Timestamp of the offending ping
        next: NaiveDateTime,
    },

    /// A ping changed the channel configuration mid-file
    #[error("channel configuration changed at record {record} of {file}")]
    ChannelConfigChanged {
        /// File being assembled
        file: PathBuf,
        /// Record index where the configuration diverged
        record: usize,
    },

    /// Two input files disagree on the channel configuration
    #[error("inconsistent channel configuration: {second} does not match {first}")]
    InconsistentConfiguration {
        /// First file of the concatenation, which sets the configuration
        first: PathBuf,
        /// The file that diverged
        second: PathBuf,
    },

    /// The input produced no pings at all
    #[error("no pings decoded from {0}")]
    Empty(PathBuf),
}

/// Channel configuration of one capture file, constant across its pings
#[derive(Debug, Clone, PartialEq)]
pub struct FileConfig {
    /// Instrument serial number
    pub serial: u16,
    /// Active channel count
    pub num_channels: usize,
    /// Range bins per channel
    pub num_bins: Vec<usize>,
    /// Digitization rate per channel (Hz)
    pub dig_rate: Vec<f64>,
    /// Samples averaged into one range bin, per channel
    pub range_samples_per_bin: Vec<f64>,
    /// Lockout index per channel (samples)
    pub lockout_index: Vec<f64>,
    /// Transducer frequency per channel (kHz)
    pub frequency_khz: Vec<f64>,
    /// Acquisition phase (selects the calibration pulse-length entry)
    pub phase: u8,
}

impl FileConfig {
    fn from_ping(ping: &RawPing) -> Self {
        let n = ping.num_channels();
        let h = &ping.header;
        Self {
            serial: h.serial_number,
            num_channels: n,
            num_bins: h.num_bins[..n].iter().map(|&b| b as usize).collect(),
            dig_rate: h.dig_rate[..n].iter().map(|&r| r as f64).collect(),
            range_samples_per_bin: h.range_samples_per_bin[..n]
                .iter()
                .map(|&r| r as f64)
                .collect(),
            lockout_index: h.lockout_index[..n].iter().map(|&l| l as f64).collect(),
            frequency_khz: h.frequency_khz[..n].iter().map(|&f| f as f64).collect(),
            phase: h.phase,
        }
    }

    /// The shared range-bin count if every channel agrees, `None` when the
    /// file is ragged.
    pub fn uniform_bins(&self) -> Option<usize> {
        let first = *self.num_bins.first()?;
        self.num_bins.iter().all(|&b| b == first).then_some(first)
    }
}

/// One channel's samples stacked over the ping axis, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBlock {
    /// Ping count (rows)
    pub n_pings: usize,
    /// Range bins (columns)
    pub n_bins: usize,
    /// Row-major sample values, `n_pings * n_bins` long
    pub samples: Vec<f64>,
}

impl ChannelBlock {
    /// The samples of one ping.
    pub fn row(&self, ping: usize) -> &[f64] {
        &self.samples[ping * self.n_bins..(ping + 1) * self.n_bins]
    }
}

/// Assembled arrays for one file (or one concatenated sequence of files)
#[derive(Debug, Clone)]
pub struct PingStack {
    /// Source capture files, in concatenation order
    pub source_files: Vec<PathBuf>,
    /// The channel configuration shared by every ping
    pub config: FileConfig,
    /// Ping timestamps
    pub timestamps: Vec<NaiveDateTime>,
    /// Ping timestamps as fractional epoch seconds (the coordinate values)
    pub ping_time: Vec<f64>,
    /// Raw tilt X counts per ping
    pub tilt_x_counts: Vec<f64>,
    /// Raw tilt Y counts per ping
    pub tilt_y_counts: Vec<f64>,
    /// Raw temperature counts per ping
    pub temperature_counts: Vec<f64>,
    /// Raw main battery counts per ping
    pub battery_main_counts: Vec<f64>,
    /// Raw transmit battery counts per ping
    pub battery_tx_counts: Vec<f64>,
    /// One stacked block per channel; bin counts may differ across blocks
    pub channels: Vec<ChannelBlock>,
}

impl PingStack {
    /// Number of pings on the stack.
    pub fn num_pings(&self) -> usize {
        self.ping_time.len()
    }

    /// Concatenate stacks along the ping axis, in the given (file) order.
    ///
    /// Every stack must carry an identical channel configuration; the ping
    /// axis is appended as-is, never re-sorted globally.
    pub fn concat(stacks: Vec<PingStack>) -> Result<PingStack, AssembleError> {
        let mut iter = stacks.into_iter();
        let mut merged = match iter.next() {
            Some(first) => first,
            None => return Err(AssembleError::Empty(PathBuf::new())),
        };

        for stack in iter {
            if stack.config != merged.config {
                return Err(AssembleError::InconsistentConfiguration {
                    first: merged.source_files[0].clone(),
                    second: stack.source_files[0].clone(),
                });
            }
            merged.timestamps.extend(stack.timestamps);
            merged.ping_time.extend(stack.ping_time);
            merged.tilt_x_counts.extend(stack.tilt_x_counts);
            merged.tilt_y_counts.extend(stack.tilt_y_counts);
            merged.temperature_counts.extend(stack.temperature_counts);
            merged.battery_main_counts.extend(stack.battery_main_counts);
            merged.battery_tx_counts.extend(stack.battery_tx_counts);
            for (dst, src) in merged.channels.iter_mut().zip(stack.channels) {
                dst.n_pings += src.n_pings;
                dst.samples.extend(src.samples);
            }
            merged.source_files.extend(stack.source_files);
        }

        Ok(merged)
    }
}

/// Stacks the ping sequence of one capture file into per-channel arrays
pub struct ChannelAssembler {
    file: PathBuf,
    config: Option<FileConfig>,
    last: Option<NaiveDateTime>,
    timestamps: Vec<NaiveDateTime>,
    ping_time: Vec<f64>,
    tilt_x: Vec<f64>,
    tilt_y: Vec<f64>,
    temperature: Vec<f64>,
    battery_main: Vec<f64>,
    battery_tx: Vec<f64>,
    channels: Vec<Vec<f64>>,
}

impl ChannelAssembler {
    /// Start assembling the named capture file.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            config: None,
            last: None,
            timestamps: Vec::new(),
            ping_time: Vec::new(),
            tilt_x: Vec::new(),
            tilt_y: Vec::new(),
            temperature: Vec::new(),
            battery_main: Vec::new(),
            battery_tx: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Append one decoded ping.
    pub fn push(&mut self, ping: &RawPing) -> Result<(), AssembleError> {
        if let Some(prev) = self.last {
            if ping.timestamp <= prev {
                return Err(AssembleError::OutOfOrderPing {
                    record: ping.record_index,
                    prev,
                    next: ping.timestamp,
                });
            }
        }

        let config = FileConfig::from_ping(ping);
        match &self.config {
            None => {
                self.channels = vec![Vec::new(); config.num_channels];
                self.config = Some(config);
            }
            Some(existing) if *existing != config => {
                return Err(AssembleError::ChannelConfigChanged {
                    file: self.file.clone(),
                    record: ping.record_index,
                });
            }
            Some(_) => {}
        }

        self.last = Some(ping.timestamp);
        self.timestamps.push(ping.timestamp);
        self.ping_time
            .push(ping.timestamp.and_utc().timestamp_millis() as f64 / 1000.0);
        self.tilt_x.push(ping.tilt_x_count());
        self.tilt_y.push(ping.tilt_y_count());
        self.temperature.push(ping.temperature_count());
        self.battery_main.push(ping.battery_main_count());
        self.battery_tx.push(ping.battery_tx_count());
        for (dst, src) in self.channels.iter_mut().zip(&ping.counts) {
            dst.extend_from_slice(src);
        }

        Ok(())
    }

    /// Finalize the stack.
    pub fn finish(self) -> Result<PingStack, AssembleError> {
        let config = match self.config {
            Some(config) => config,
            None => return Err(AssembleError::Empty(self.file)),
        };

        let n_pings = self.ping_time.len();
        let channels = self
            .channels
            .into_iter()
            .zip(&config.num_bins)
            .map(|(samples, &n_bins)| ChannelBlock {
                n_pings,
                n_bins,
                samples,
            })
            .collect();

        Ok(PingStack {
            source_files: vec![self.file],
            config,
            timestamps: self.timestamps,
            ping_time: self.ping_time,
            tilt_x_counts: self.tilt_x,
            tilt_y_counts: self.tilt_y,
            temperature_counts: self.temperature,
            battery_main_counts: self.battery_main,
            battery_tx_counts: self.battery_tx,
            channels,
        })
    }
}
