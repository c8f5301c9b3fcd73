//! Instrument calibration parsing
//!
//! AZFP-class instruments ship with an XML calibration description, one node
//! per channel carrying the frequency and the conversion coefficients needed
//! to turn raw counts into physical units. This module parses that file into
//! an immutable [`CalibrationSet`] used by the derivation stage.
//!
//! The channel count declared here is checked lazily: a mismatch against the
//! data only surfaces when a missing channel is first requested.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Salinity default (PSU) applied when the calibration file carries no
/// `<Environment>` node.
pub const DEFAULT_SALINITY_PSU: f64 = 35.0;

/// Deployment pressure default (dbar) applied when the calibration file
/// carries no `<Environment>` node.
pub const DEFAULT_PRESSURE_DBAR: f64 = 50.0;

/// Errors that can occur while parsing a calibration file
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// I/O failure reading the calibration file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed XML
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// A required element or attribute is absent
    #[error("missing calibration element: {0}")]
    MissingElement(String),

    /// An attribute or text value failed to parse as a number
    #[error("invalid calibration value for {name}: {value}")]
    InvalidValue {
        /// Name of the offending attribute or element
        name: String,
        /// The raw text that failed to parse
        value: String,
    },

    /// The data references a channel the calibration does not declare
    #[error("calibration declares {declared} channel(s) but the data references channel index {requested}")]
    ChannelMismatch {
        /// Channels declared by the calibration file
        declared: usize,
        /// Zero-based channel index requested by the data
        requested: usize,
    },

    /// A channel has no pulse-length entry for the instrument phase in use
    #[error("channel {channel}: no pulse length entry for phase {phase}")]
    MissingPulseLength {
        /// Zero-based channel index
        channel: usize,
        /// Instrument phase number from the frame header
        phase: u8,
    },

    /// Non-UTF-8 content in the XML
    #[error("UTF-8 encoding error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Thermistor bridge coefficients for the temperature conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempCoefficients {
    /// Bridge numerator offset
    pub ka: f64,
    /// Bridge numerator slope
    pub kb: f64,
    /// Bridge denominator offset
    pub kc: f64,
    /// Steinhart-Hart constant A
    pub a: f64,
    /// Steinhart-Hart constant B
    pub b: f64,
    /// Steinhart-Hart constant C
    pub c: f64,
}

/// Cubic tilt polynomials, one coefficient set per axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltCoefficients {
    /// X-axis coefficients, constant term first
    pub x: [f64; 4],
    /// Y-axis coefficients, constant term first
    pub y: [f64; 4],
}

/// Per-channel conversion coefficients
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCalibration {
    /// Transducer frequency in kHz
    pub frequency_khz: f64,
    /// Transceiver gain in dB
    pub gain_db: f64,
    /// Echo level at full scale in dB
    pub el_max: f64,
    /// Digitization slope (dB per count, scaled by the vendor constant)
    pub ds: f64,
    /// Pulse-length table: (instrument phase, pulse length in microseconds)
    pub pulse_lengths_us: Vec<(u8, f64)>,
}

impl ChannelCalibration {
    /// Look up the transmit pulse length for an instrument phase.
    pub fn pulse_length_us(&self, phase: u8) -> Option<f64> {
        self.pulse_lengths_us
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, us)| *us)
    }
}

/// Parsed calibration description, immutable for the whole conversion run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSet {
    /// Instrument serial number, when declared
    pub serial: Option<u32>,
    /// Water salinity in PSU used for sound speed and absorption
    pub salinity_psu: f64,
    /// Deployment pressure in dbar used for sound speed and absorption
    pub pressure_dbar: f64,
    /// Temperature conversion coefficients
    pub temperature: TempCoefficients,
    /// Tilt conversion polynomials
    pub tilt: TiltCoefficients,
    channels: Vec<ChannelCalibration>,
}

impl CalibrationSet {
    /// Parse a calibration XML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse calibration XML from any buffered reader.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, CalibrationError> {
        Parser::new(reader).parse()
    }

    /// Number of channels the calibration declares.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Coefficients for a zero-based channel index.
    ///
    /// Fails with [`CalibrationError::ChannelMismatch`] when the index is not
    /// declared; this is the lazy per-channel check from the derivation stage.
    pub fn channel(&self, index: usize) -> Result<&ChannelCalibration, CalibrationError> {
        self.channels
            .get(index)
            .ok_or(CalibrationError::ChannelMismatch {
                declared: self.channels.len(),
                requested: index,
            })
    }

    /// Verify the declared channel count against the data's channel count.
    pub fn ensure_channel_count(&self, data_channels: usize) -> Result<(), CalibrationError> {
        if self.channels.len() != data_channels {
            return Err(CalibrationError::ChannelMismatch {
                declared: self.channels.len(),
                requested: data_channels.saturating_sub(1),
            });
        }
        Ok(())
    }
}

struct Parser<R: BufRead> {
    reader: Reader<R>,
}

impl<R: BufRead> Parser<R> {
    fn new(reader: R) -> Self {
        let mut xml = Reader::from_reader(reader);
        xml.config_mut().trim_text(true);
        Self { reader: xml }
    }

    fn parse(mut self) -> Result<CalibrationSet, CalibrationError> {
        let mut serial = None;
        let mut salinity = DEFAULT_SALINITY_PSU;
        let mut pressure = DEFAULT_PRESSURE_DBAR;
        let mut temperature: Option<TempCoefficients> = None;
        let mut tilt_x: Option<[f64; 4]> = None;
        let mut tilt_y: Option<[f64; 4]> = None;
        // (declared channel number, calibration) pairs, sorted after parsing
        let mut channels: Vec<(u32, ChannelCalibration)> = Vec::new();

        let mut buf = Vec::new();
        loop {
            match self.reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                    b"InstrumentCalibration" => {
                        if let Some(text) = get_attribute(e, "serial")? {
                            serial = Some(parse_number::<u32>("serial", &text)?);
                        }
                    }
                    b"Environment" => {
                        if let Some(text) = get_attribute(e, "salinity")? {
                            salinity = parse_number("salinity", &text)?;
                        }
                        if let Some(text) = get_attribute(e, "pressure")? {
                            pressure = parse_number("pressure", &text)?;
                        }
                    }
                    b"Temperature" => {
                        temperature = Some(TempCoefficients {
                            ka: require_number(e, "ka")?,
                            kb: require_number(e, "kb")?,
                            kc: require_number(e, "kc")?,
                            a: require_number(e, "a")?,
                            b: require_number(e, "b")?,
                            c: require_number(e, "c")?,
                        });
                    }
                    b"TiltX" => tilt_x = Some(parse_poly(e)?),
                    b"TiltY" => tilt_y = Some(parse_poly(e)?),
                    b"Channel" => {
                        let number_text = get_attribute(e, "number")?
                            .ok_or_else(|| CalibrationError::MissingElement("Channel/@number".into()))?;
                        let number: u32 = parse_number("Channel/@number", &number_text)?;
                        let channel = self.parse_channel(e)?;
                        channels.push((number, channel));
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
            buf.clear();
        }

        if channels.is_empty() {
            return Err(CalibrationError::MissingElement("Channel".into()));
        }
        channels.sort_by_key(|(number, _)| *number);
        for (slot, (number, _)) in channels.iter().enumerate() {
            if *number as usize != slot + 1 {
                return Err(CalibrationError::InvalidValue {
                    name: "Channel/@number".into(),
                    value: number.to_string(),
                });
            }
        }

        Ok(CalibrationSet {
            serial,
            salinity_psu: salinity,
            pressure_dbar: pressure,
            temperature: temperature
                .ok_or_else(|| CalibrationError::MissingElement("Temperature".into()))?,
            tilt: TiltCoefficients {
                x: tilt_x.ok_or_else(|| CalibrationError::MissingElement("TiltX".into()))?,
                y: tilt_y.ok_or_else(|| CalibrationError::MissingElement("TiltY".into()))?,
            },
            channels: channels.into_iter().map(|(_, c)| c).collect(),
        })
    }

    /// Parse the body of a `<Channel>` element: pulse-length entries until the
    /// closing tag.
    fn parse_channel(&mut self, start: &BytesStart) -> Result<ChannelCalibration, CalibrationError> {
        let mut channel = ChannelCalibration {
            frequency_khz: require_number(start, "frequency_khz")?,
            gain_db: require_number(start, "gain_db")?,
            el_max: require_number(start, "el_max")?,
            ds: require_number(start, "ds")?,
            pulse_lengths_us: Vec::new(),
        };

        let mut buf = Vec::new();
        let mut current_phase: Option<u8> = None;
        loop {
            match self.reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"PulseLength" => {
                    let phase_text = get_attribute(e, "phase")?.ok_or_else(|| {
                        CalibrationError::MissingElement("PulseLength/@phase".into())
                    })?;
                    current_phase = Some(parse_number::<u8>("PulseLength/@phase", &phase_text)?);
                }
                Ok(Event::Text(ref t)) => {
                    if let Some(phase) = current_phase {
                        let text = t.unescape()?;
                        let us = parse_number("PulseLength", text.trim())?;
                        channel.pulse_lengths_us.push((phase, us));
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"PulseLength" => current_phase = None,
                    b"Channel" => break,
                    _ => {}
                },
                Ok(Event::Eof) => {
                    return Err(CalibrationError::MissingElement("/Channel".into()));
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
            buf.clear();
        }

        Ok(channel)
    }
}

fn get_attribute(e: &BytesStart, name: &str) -> Result<Option<String>, CalibrationError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CalibrationError::Xml(quick_xml::Error::from(e)))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = std::str::from_utf8(&attr.value)?.to_string();
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn parse_number<T: std::str::FromStr>(name: &str, text: &str) -> Result<T, CalibrationError> {
    text.trim()
        .parse::<T>()
        .map_err(|_| CalibrationError::InvalidValue {
            name: name.to_string(),
            value: text.to_string(),
        })
}

fn require_number(e: &BytesStart, name: &str) -> Result<f64, CalibrationError> {
    let text = get_attribute(e, name)?
        .ok_or_else(|| CalibrationError::MissingElement(format!("{}/@{name}", element_name(e))))?;
    parse_number(name, &text)
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn parse_poly(e: &BytesStart) -> Result<[f64; 4], CalibrationError> {
    Ok([
        require_number(e, "a")?,
        require_number(e, "b")?,
        require_number(e, "c")?,
        require_number(e, "d")?,
    ])
}
