//! Binary telemetry frame decoding
//!
//! `.01A`-class capture files are a concatenation of ping records. Each record
//! is a 2-byte magic (`0xFCD2`), a 126-byte big-endian header, and a variable
//! payload whose length is fully derivable from the header: per active
//! channel, either `num_bins` u16 raw counts or, in averaged mode, `num_bins`
//! u32 linear sums followed by `num_bins` u8 overflow counts.
//!
//! [`FrameReader`] is a pull decoder: `decode_next()` yields one [`RawPing`]
//! per call and `Ok(None)` at a clean end of stream. Structural damage
//! (bad magic, truncated payload, impossible header values) is reported as
//! [`FrameError::CorruptFrame`] with the record index. The lenient policy
//! resynchronizes on the next magic instead of aborting.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use chrono::NaiveDateTime;
use log::warn;

/// Magic leading every frame; doubles as the structural check.
pub const FRAME_MAGIC: u16 = 0xFCD2;

/// Fixed header length in bytes, magic excluded.
pub const HEADER_LEN: usize = 126;

/// Maximum channels an instrument header can describe.
pub const MAX_CHANNELS: usize = 4;

/// Vendor fixed-point slope for converting averaged linear sums back to the
/// count domain.
const AVERAGED_SLOPE: f64 = 8.0 * 65535.0 * 1.477e-5;

/// Errors that can occur while decoding the telemetry stream
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// I/O failure reading the stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record: bad magic, truncated payload, or impossible header
    #[error("corrupt frame at record {record}: {reason}")]
    CorruptFrame {
        /// Zero-based index of the record in the stream
        record: usize,
        /// The violated structural constraint
        reason: String,
    },
}

/// What to do when a corrupt frame is encountered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramePolicy {
    /// Abort the conversion on the first corrupt frame (default)
    #[default]
    Strict,
    /// Skip the frame, log a warning, and resynchronize on the next magic
    Lenient,
}

/// Decoded fixed-size frame header
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// Profile flag word
    pub profile_flag: u16,
    /// Ping index as counted by the instrument
    pub profile_number: u16,
    /// Instrument serial number
    pub serial_number: u16,
    /// Ping status word
    pub ping_status: u16,
    /// Burst interval in seconds
    pub burst_interval: u32,
    /// Timestamp fields: year, month, day, hour, minute, second, hundredths
    pub date: [u16; 7],
    /// Digitization rate per channel (Hz)
    pub dig_rate: [u16; 4],
    /// Lockout index per channel (samples)
    pub lockout_index: [u16; 4],
    /// Range bins per channel
    pub num_bins: [u16; 4],
    /// Samples averaged into one range bin, per channel
    pub range_samples_per_bin: [u16; 4],
    /// Pings per profile
    pub ping_per_profile: u16,
    /// Whether pings are averaged over the profile
    pub avg_pings: u16,
    /// Pings acquired in the current burst
    pub num_acquired_pings: u32,
    /// Ping period in seconds
    pub ping_period: u16,
    /// First ping of the averaging window
    pub first_ping: u16,
    /// Last ping of the averaging window
    pub last_ping: u16,
    /// Payload encoding per channel: 0 = raw u16 counts, 1 = averaged sums
    pub data_type: [u8; 4],
    /// Error word reported by the instrument
    pub data_error: u16,
    /// Acquisition phase in use (selects the pulse-length table entry)
    pub phase: u8,
    /// Overrun flag
    pub overrun: u8,
    /// Active channel count (1..=4)
    pub num_channels: u8,
    /// Gain index per channel
    pub gain: [u8; 4],
    /// Spare byte
    pub spare: u8,
    /// Transmit pulse length per channel (microseconds)
    pub pulse_len: [u16; 4],
    /// Board number per channel
    pub board_num: [u16; 4],
    /// Transducer frequency per channel (kHz)
    pub frequency_khz: [u16; 4],
    /// Sensor availability flag
    pub sensor_flag: u16,
    /// Ancillary sensor counts: tilt X, tilt Y, battery main, battery TX,
    /// temperature
    pub ancillary: [u16; 5],
    /// Auxiliary A/D channel counts
    pub ad_channels: [u16; 2],
}

impl FrameHeader {
    /// Decode a header from its fixed-size buffer.
    fn decode(buf: &[u8]) -> Result<Self, std::io::Error> {
        let mut c = Cursor::new(buf);
        Ok(Self {
            profile_flag: c.read_u16::<BigEndian>()?,
            profile_number: c.read_u16::<BigEndian>()?,
            serial_number: c.read_u16::<BigEndian>()?,
            ping_status: c.read_u16::<BigEndian>()?,
            burst_interval: c.read_u32::<BigEndian>()?,
            date: read_u16_array(&mut c)?,
            dig_rate: read_u16_array(&mut c)?,
            lockout_index: read_u16_array(&mut c)?,
            num_bins: read_u16_array(&mut c)?,
            range_samples_per_bin: read_u16_array(&mut c)?,
            ping_per_profile: c.read_u16::<BigEndian>()?,
            avg_pings: c.read_u16::<BigEndian>()?,
            num_acquired_pings: c.read_u32::<BigEndian>()?,
            ping_period: c.read_u16::<BigEndian>()?,
            first_ping: c.read_u16::<BigEndian>()?,
            last_ping: c.read_u16::<BigEndian>()?,
            data_type: read_u8_array(&mut c)?,
            data_error: c.read_u16::<BigEndian>()?,
            phase: c.read_u8()?,
            overrun: c.read_u8()?,
            num_channels: c.read_u8()?,
            gain: read_u8_array(&mut c)?,
            spare: c.read_u8()?,
            pulse_len: read_u16_array(&mut c)?,
            board_num: read_u16_array(&mut c)?,
            frequency_khz: read_u16_array(&mut c)?,
            sensor_flag: c.read_u16::<BigEndian>()?,
            ancillary: read_u16_array(&mut c)?,
            ad_channels: read_u16_array(&mut c)?,
        })
    }

    /// Record timestamp assembled from the date fields.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        let [year, month, day, hour, minute, second, hundredths] = self.date;
        let date = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?;
        let time = chrono::NaiveTime::from_hms_milli_opt(
            hour as u32,
            minute as u32,
            second as u32,
            hundredths as u32 * 10,
        )?;
        Some(date.and_time(time))
    }

    /// Payload length in bytes implied by the header.
    pub fn payload_len(&self) -> usize {
        (0..self.num_channels as usize)
            .map(|ch| {
                let bins = self.num_bins[ch] as usize;
                if self.data_type[ch] != 0 {
                    bins * 5 // u32 linear sum + u8 overflow per bin
                } else {
                    bins * 2
                }
            })
            .sum()
    }
}

/// One decoded ping record
#[derive(Debug, Clone, PartialEq)]
pub struct RawPing {
    /// Zero-based index of the record in its file
    pub record_index: usize,
    /// Record timestamp
    pub timestamp: NaiveDateTime,
    /// Full decoded header
    pub header: FrameHeader,
    /// Per-channel raw sample counts, ordered by range bin; averaged-mode
    /// payloads are already converted back to the count domain
    pub counts: Vec<Vec<f64>>,
}

impl RawPing {
    /// Active channel count.
    pub fn num_channels(&self) -> usize {
        self.header.num_channels as usize
    }

    /// Raw tilt X sensor count.
    pub fn tilt_x_count(&self) -> f64 {
        self.header.ancillary[0] as f64
    }

    /// Raw tilt Y sensor count.
    pub fn tilt_y_count(&self) -> f64 {
        self.header.ancillary[1] as f64
    }

    /// Raw main battery count.
    pub fn battery_main_count(&self) -> f64 {
        self.header.ancillary[2] as f64
    }

    /// Raw transmit-side battery count.
    pub fn battery_tx_count(&self) -> f64 {
        self.header.ancillary[3] as f64
    }

    /// Raw temperature sensor count.
    pub fn temperature_count(&self) -> f64 {
        self.header.ancillary[4] as f64
    }
}

/// Pull decoder over a raw telemetry stream
pub struct FrameReader<R: Read> {
    reader: R,
    policy: FramePolicy,
    records_read: usize,
    skipped: usize,
}

impl FrameReader<BufReader<File>> {
    /// Open a capture file for decoding.
    pub fn open<P: AsRef<Path>>(path: P, policy: FramePolicy) -> Result<Self, FrameError> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::with_capacity(64 * 1024, file), policy))
    }
}

impl<R: Read> FrameReader<R> {
    /// Wrap an arbitrary byte stream.
    pub fn new(reader: R, policy: FramePolicy) -> Self {
        Self {
            reader,
            policy,
            records_read: 0,
            skipped: 0,
        }
    }

    /// Frames skipped so far under the lenient policy.
    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    /// Decode the next ping, honoring the configured corrupt-frame policy.
    ///
    /// Returns `Ok(None)` at a clean end of stream. Under
    /// [`FramePolicy::Strict`] the first corrupt frame aborts; under
    /// [`FramePolicy::Lenient`] it is logged, counted, and skipped by
    /// scanning forward for the next frame magic.
    pub fn next_ping(&mut self) -> Result<Option<RawPing>, FrameError> {
        loop {
            match self.decode_next() {
                Ok(ping) => return Ok(ping),
                Err(FrameError::CorruptFrame { record, reason })
                    if self.policy == FramePolicy::Lenient =>
                {
                    warn!("skipping corrupt frame at record {record}: {reason}");
                    self.skipped += 1;
                    if !self.resync()? {
                        return Ok(None);
                    }
                    // Magic already consumed by resync; decode the rest.
                    match self.decode_after_magic() {
                        Ok(ping) => return Ok(Some(ping)),
                        Err(FrameError::CorruptFrame { record, reason }) => {
                            warn!("skipping corrupt frame at record {record}: {reason}");
                            self.skipped += 1;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decode the next ping with no skip handling (strict primitive).
    pub fn decode_next(&mut self) -> Result<Option<RawPing>, FrameError> {
        let mut magic = [0u8; 2];
        match read_exact_or_eof(&mut self.reader, &mut magic)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => {
                return Err(self.corrupt("truncated record: stream ends inside the frame magic"))
            }
            ReadOutcome::Full => {}
        }

        let value = u16::from_be_bytes(magic);
        if value != FRAME_MAGIC {
            return Err(self.corrupt(format!(
                "bad frame magic 0x{value:04X}, expected 0x{FRAME_MAGIC:04X}"
            )));
        }

        self.decode_after_magic().map(Some)
    }

    fn decode_after_magic(&mut self) -> Result<RawPing, FrameError> {
        let record = self.records_read;
        self.records_read += 1;

        let mut header_buf = [0u8; HEADER_LEN];
        self.reader
            .read_exact(&mut header_buf)
            .map_err(|e| self.map_truncation(record, e, "header"))?;
        let header = FrameHeader::decode(&header_buf).map_err(FrameError::Io)?;

        let num_channels = header.num_channels as usize;
        if num_channels == 0 || num_channels > MAX_CHANNELS {
            return Err(FrameError::CorruptFrame {
                record,
                reason: format!("invalid channel count {num_channels}"),
            });
        }
        // A zero digitization rate on an active channel would make every
        // derived range infinite downstream.
        for ch in 0..num_channels {
            if header.dig_rate[ch] == 0 {
                return Err(FrameError::CorruptFrame {
                    record,
                    reason: format!("zero digitization rate on active channel {ch}"),
                });
            }
        }
        let timestamp = header.timestamp().ok_or_else(|| FrameError::CorruptFrame {
            record,
            reason: format!("invalid timestamp fields {:?}", header.date),
        })?;

        let mut payload = vec![0u8; header.payload_len()];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| self.map_truncation(record, e, "sample payload"))?;

        let counts = decode_payload(&header, &payload).map_err(FrameError::Io)?;

        Ok(RawPing {
            record_index: record,
            timestamp,
            header,
            counts,
        })
    }

    /// Scan forward for the next frame magic. Returns false at end of stream.
    fn resync(&mut self) -> Result<bool, FrameError> {
        let mut byte = [0u8; 1];
        let mut prev = 0u8;
        loop {
            match read_exact_or_eof(&mut self.reader, &mut byte)? {
                ReadOutcome::Eof | ReadOutcome::Partial => return Ok(false),
                ReadOutcome::Full => {}
            }
            if prev == 0xFC && byte[0] == 0xD2 {
                return Ok(true);
            }
            prev = byte[0];
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> FrameError {
        FrameError::CorruptFrame {
            record: self.records_read,
            reason: reason.into(),
        }
    }

    fn map_truncation(&self, record: usize, e: std::io::Error, what: &str) -> FrameError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::CorruptFrame {
                record,
                reason: format!("truncated record: stream ends inside the {what}"),
            }
        } else {
            FrameError::Io(e)
        }
    }
}

/// Decode the per-channel sample payload into count-domain values.
fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Vec<Vec<f64>>, std::io::Error> {
    let mut cursor = Cursor::new(payload);
    let mut counts = Vec::with_capacity(header.num_channels as usize);

    for ch in 0..header.num_channels as usize {
        let bins = header.num_bins[ch] as usize;
        let mut channel = Vec::with_capacity(bins);

        if header.data_type[ch] != 0 {
            // Averaged mode: u32 linear sums then u8 overflow counts, scaled
            // back to the count domain with the vendor fixed-point slope.
            let divisor = header.range_samples_per_bin[ch].max(1) as f64
                * if header.avg_pings != 0 {
                    header.ping_per_profile.max(1) as f64
                } else {
                    1.0
                };
            let mut sums = Vec::with_capacity(bins);
            for _ in 0..bins {
                sums.push(cursor.read_u32::<BigEndian>()? as f64);
            }
            for sum in sums {
                let overflow = cursor.read_u8()? as f64;
                let linear = (sum + overflow * u32::MAX as f64) / divisor;
                let value = if linear > 0.0 {
                    (linear.log10() - 2.5) * AVERAGED_SLOPE
                } else {
                    0.0
                };
                channel.push(value);
            }
        } else {
            for _ in 0..bins {
                channel.push(cursor.read_u16::<BigEndian>()? as f64);
            }
        }

        counts.push(channel);
    }

    Ok(counts)
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

/// `read_exact` that distinguishes a clean EOF before the first byte from a
/// truncation inside the buffer.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

fn read_u16_array<const N: usize>(c: &mut Cursor<&[u8]>) -> Result<[u16; N], std::io::Error> {
    let mut out = [0u16; N];
    for slot in &mut out {
        *slot = c.read_u16::<BigEndian>()?;
    }
    Ok(out)
}

fn read_u8_array<const N: usize>(c: &mut Cursor<&[u8]>) -> Result<[u8; N], std::io::Error> {
    let mut out = [0u8; N];
    for slot in &mut out {
        *slot = c.read_u8()?;
    }
    Ok(out)
}
