//! End-to-end conversion tests
//!
//! These tests synthesize capture files byte-by-byte, run the full pipeline
//! through [`Converter`], and re-read the persisted stores with plain
//! filesystem and ZIP access to verify the layout both formats promise.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use proptest::prelude::*;
use serde_json::Value;
use tempfile::{tempdir, TempDir};

use echopak::calibration::CalibrationError;
use echopak::convert::{ConversionSource, ConvertConfig, ConvertError, Converter};
use echopak::frame::{FramePolicy, FRAME_MAGIC};
use echopak::path::{ExportFormat, Multiplicity, PathError};
use echopak::writer::{WriterError, ECHOPAK_MIMETYPE};

const SERIAL: u16 = 55067;

/// Encode one two-channel raw-mode frame. Sample values ramp with the ping
/// index and bin so payload comparisons are meaningful.
fn encode_frame(minute: u16, second: u16, bins: [u16; 2], base: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(FRAME_MAGIC).unwrap();
    for v in [1u16, 0, SERIAL, 0] {
        out.write_u16::<BigEndian>(v).unwrap(); // profile_flag..ping_status
    }
    out.write_u32::<BigEndian>(30).unwrap(); // burst_interval
    for v in [2017u16, 8, 21, 17, minute, second, 0] {
        out.write_u16::<BigEndian>(v).unwrap(); // date
    }
    for v in [64000u16, 64000, 0, 0] {
        out.write_u16::<BigEndian>(v).unwrap(); // dig_rate
    }
    for _ in 0..4 {
        out.write_u16::<BigEndian>(180).unwrap(); // lockout_index
    }
    for ch in 0..4usize {
        out.write_u16::<BigEndian>(*bins.get(ch).unwrap_or(&0)).unwrap();
    }
    for _ in 0..4 {
        out.write_u16::<BigEndian>(4).unwrap(); // range_samples_per_bin
    }
    out.write_u16::<BigEndian>(1).unwrap(); // ping_per_profile
    out.write_u16::<BigEndian>(0).unwrap(); // avg_pings
    out.write_u32::<BigEndian>(1).unwrap(); // num_acquired_pings
    for v in [1u16, 1, 1] {
        out.write_u16::<BigEndian>(v).unwrap(); // ping_period, first, last
    }
    out.extend_from_slice(&[0u8; 4]); // data_type: raw counts
    out.write_u16::<BigEndian>(0).unwrap(); // data_error
    out.push(1); // phase
    out.push(0); // overrun
    out.push(2); // num_channels
    out.extend_from_slice(&[1u8; 4]); // gain
    out.push(0); // spare
    for _ in 0..4 {
        out.write_u16::<BigEndian>(300).unwrap(); // pulse_len
    }
    for _ in 0..4 {
        out.write_u16::<BigEndian>(1).unwrap(); // board_num
    }
    for v in [38u16, 125, 0, 0] {
        out.write_u16::<BigEndian>(v).unwrap(); // frequency_khz
    }
    out.write_u16::<BigEndian>(0).unwrap(); // sensor_flag
    for v in [410u16, 395, 520, 530, 22345] {
        out.write_u16::<BigEndian>(v).unwrap(); // ancillary
    }
    for _ in 0..2 {
        out.write_u16::<BigEndian>(0).unwrap(); // ad_channels
    }
    for ch in 0..2usize {
        for b in 0..bins[ch] {
            out.write_u16::<BigEndian>(base + (ch as u16) * 1000 + b * 7).unwrap();
        }
    }
    out
}

/// Write a capture file of `n_pings` strictly ordered pings.
fn write_capture(path: &Path, n_pings: u16, bins: [u16; 2], minute: u16) {
    let mut bytes = Vec::new();
    for p in 0..n_pings {
        bytes.extend_from_slice(&encode_frame(minute, p, bins, 100 * (p + 1)));
    }
    fs::write(path, bytes).unwrap();
}

/// Write a capture whose frames declare a single active channel.
fn write_single_channel_capture(path: &Path, n_pings: u16) {
    let mut bytes = Vec::new();
    for p in 0..n_pings {
        let mut frame = encode_frame(0, p, [6, 0], 100 * (p + 1));
        frame[82] = 1; // num_channels byte of the fixed header
        bytes.extend_from_slice(&frame);
    }
    fs::write(path, bytes).unwrap();
}

fn calibration_xml() -> String {
    let channels = [38u16, 125]
        .iter()
        .enumerate()
        .map(|(i, f)| {
            format!(
                r#"<Channel number="{}" frequency_khz="{f}" gain_db="18.0" el_max="142.8" ds="0.02329">
                     <PulseLength phase="1">300</PulseLength>
                   </Channel>"#,
                i + 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"<InstrumentCalibration serial="{SERIAL}">
             <Temperature ka="201.33" kb="64.21" kc="17.94" a="0.00133" b="0.000244" c="0.0000001"/>
             <TiltX a="-5.5" b="0.0246" c="0.0" d="0.0"/>
             <TiltY a="-4.9" b="0.0251" c="0.0" d="0.0"/>
             {channels}
           </InstrumentCalibration>"#
    )
}

/// A deployment directory with capture files and a calibration file.
struct Deployment {
    dir: TempDir,
    files: Vec<PathBuf>,
    calibration: PathBuf,
}

impl Deployment {
    fn new(captures: &[(&str, u16, u16)]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let files = captures
            .iter()
            .map(|(name, pings, minute)| {
                let path = dir.path().join(name);
                write_capture(&path, *pings, [6, 6], *minute);
                path
            })
            .collect();
        let calibration = dir.path().join("instrument.xml");
        fs::write(&calibration, calibration_xml()).unwrap();
        Self {
            dir,
            files,
            calibration,
        }
    }

    fn converter(&self) -> Converter {
        Converter::new(ConversionSource::new(self.files.clone(), &self.calibration))
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

fn zip_entry(archive_path: &Path, name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path).unwrap()).unwrap();
    let mut buf = Vec::new();
    archive.by_name(name).unwrap().read_to_end(&mut buf).unwrap();
    buf
}

/// Full pipeline into the directory bundle, verified by re-reading the store.
#[test]
fn bundle_conversion_produces_a_readable_store() {
    let deploy = Deployment::new(&[("17082117.01A", 5, 0)]);
    let outcome = deploy.converter().to_bundle(None, false).unwrap();

    assert_eq!(outcome.stats.files, 1);
    assert_eq!(outcome.stats.pings, 5);
    assert_eq!(outcome.stats.channels, 2);
    assert_eq!(outcome.stats.skipped_frames, 0);

    let store = deploy.dir.path().join("17082117.zarr");
    assert_eq!(outcome.target.paths, vec![store.clone()]);

    let zarray = read_json(&store.join("Beam/backscatter_r/.zarray"));
    assert_eq!(zarray["shape"], serde_json::json!([2, 5, 6]));
    assert_eq!(zarray["dtype"], "<f8");

    let zattrs = read_json(&store.join("Beam/backscatter_r/.zattrs"));
    assert_eq!(
        zattrs["_ARRAY_DIMENSIONS"],
        serde_json::json!(["frequency", "ping_time", "range_bin"])
    );

    // ping_time is strictly increasing fractional epoch seconds.
    let chunk = fs::read(store.join("Beam/ping_time/0")).unwrap();
    let times: Vec<f64> = chunk
        .chunks_exact(8)
        .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
        .collect();
    assert_eq!(times.len(), 5);
    assert!(times.windows(2).all(|w| w[1] > w[0]));

    // Environment and Vendor groups are present alongside Beam.
    assert!(store.join("Environment/temperature/0").is_file());
    assert!(store.join("Environment/sound_speed_indicative/0").is_file());
    assert!(store.join("Vendor/battery_main/0").is_file());
    // No platform data supplied, so no Platform group at all.
    assert!(!store.join("Platform").exists());

    let attrs = read_json(&store.join(".zattrs"));
    assert_eq!(attrs["conversion_software"], "echopak");
    assert_eq!(attrs["instrument_serial"], u64::from(SERIAL));
    assert_eq!(attrs["source_files"].as_array().unwrap().len(), 1);
}

/// The two formats carry byte-identical payloads and metadata documents.
#[test]
fn container_and_bundle_are_interchangeable() {
    let deploy = Deployment::new(&[("17082117.01A", 4, 0)]);
    let converter = deploy.converter();
    converter.to_bundle(None, false).unwrap();
    converter.to_container(None, false).unwrap();

    let bundle = deploy.dir.path().join("17082117.zarr");
    let container = deploy.dir.path().join("17082117.echopak");

    // The container leads with its stored mimetype entry.
    let mut archive = zip::ZipArchive::new(File::open(&container).unwrap()).unwrap();
    assert_eq!(archive.by_index(0).unwrap().name(), "mimetype");
    drop(archive);
    assert_eq!(zip_entry(&container, "mimetype"), ECHOPAK_MIMETYPE.as_bytes());

    for entry in [
        "Beam/backscatter_r/0.0.0",
        "Beam/ping_time/0",
        "Beam/tilt_x/0",
        "Environment/temperature/0",
        "Vendor/battery_tx/0",
        "Beam/backscatter_r/.zarray",
    ] {
        assert_eq!(
            zip_entry(&container, entry),
            fs::read(bundle.join(entry)).unwrap(),
            "payload mismatch for {entry}"
        );
    }
}

/// Existing artifacts are refused unless overwrite is requested.
#[test]
fn overwrite_is_opt_in() {
    let deploy = Deployment::new(&[("17082117.01A", 3, 0)]);
    let converter = deploy.converter();
    converter.to_bundle(None, false).unwrap();

    let err = converter.to_bundle(None, false).unwrap_err();
    assert!(matches!(
        err,
        ConvertError::Writer(WriterError::AlreadyExists(_))
    ));

    converter.to_bundle(None, true).unwrap();
}

/// Each input yields its own artifact unless combining is requested.
#[test]
fn per_input_artifacts_by_default() {
    let deploy = Deployment::new(&[("a.01A", 3, 0), ("b.01A", 2, 1)]);
    let outcome = deploy.converter().to_bundle(None, false).unwrap();

    assert_eq!(outcome.target.multiplicity, Multiplicity::PerInput);
    assert_eq!(outcome.stats.artifacts, 2);
    assert_eq!(outcome.stats.pings, 5);
    assert!(deploy.dir.path().join("a.zarr/.zgroup").is_file());
    assert!(deploy.dir.path().join("b.zarr/.zgroup").is_file());
}

/// Combining concatenates the inputs along the ping axis into one artifact.
#[test]
fn combine_concatenates_inputs() {
    let deploy = Deployment::new(&[("a.01A", 3, 0), ("b.01A", 2, 1)]);
    let converter = deploy.converter().with_config(ConvertConfig {
        combine: true,
        ..ConvertConfig::default()
    });
    let outcome = converter.to_bundle(None, false).unwrap();

    assert_eq!(outcome.target.multiplicity, Multiplicity::Single);
    assert_eq!(outcome.stats.artifacts, 1);

    let store = deploy.dir.path().join("a.zarr");
    let zarray = read_json(&store.join("Beam/backscatter_r/.zarray"));
    assert_eq!(zarray["shape"], serde_json::json!([2, 5, 6]));
    let attrs = read_json(&store.join(".zattrs"));
    assert_eq!(attrs["source_files"].as_array().unwrap().len(), 2);
}

/// Path validation catches bad targets before anything is decoded.
#[test]
fn path_validation_rejects_bad_targets() {
    let deploy = Deployment::new(&[("a.01A", 2, 0), ("b.01A", 2, 1)]);
    let converter = deploy.converter();

    let err = converter
        .validate_path(ExportFormat::Bundle, Some(Path::new("out.echopak")))
        .unwrap_err();
    assert!(matches!(
        err,
        ConvertError::Path(PathError::ExtensionMismatch { .. })
    ));

    let err = converter
        .validate_path(ExportFormat::Bundle, Some(Path::new("out.zarr")))
        .unwrap_err();
    assert!(matches!(
        err,
        ConvertError::Path(PathError::AmbiguousTarget { inputs: 2 })
    ));

    // A directory target is fine for any number of inputs.
    let out_dir = deploy.dir.path().join("converted");
    let target = converter
        .validate_path(ExportFormat::Container, Some(&out_dir))
        .unwrap();
    assert_eq!(target.paths.len(), 2);
    assert!(out_dir.is_dir());
}

/// Every input is validated against the calibration's channel count, not
/// just the first; a narrower later file fails before its artifact exists.
#[test]
fn later_file_with_fewer_channels_fails() {
    let deploy = Deployment::new(&[("a.01A", 2, 0)]);
    let narrow = deploy.dir.path().join("b.01A");
    write_single_channel_capture(&narrow, 2);

    let files = vec![deploy.files[0].clone(), narrow];
    let err = Converter::new(ConversionSource::new(files, &deploy.calibration))
        .to_bundle(None, false)
        .unwrap_err();
    assert!(matches!(
        err,
        ConvertError::CalibrationMismatch(CalibrationError::ChannelMismatch { declared: 2, .. })
    ));
    assert!(!deploy.dir.path().join("b.zarr").exists());
}

/// Missing capture files are input errors, reported with the path.
#[test]
fn missing_capture_file_is_an_input_error() {
    let deploy = Deployment::new(&[]);
    let missing = deploy.dir.path().join("missing.01A");
    let err = Converter::new(ConversionSource::new([&missing], &deploy.calibration))
        .to_bundle(None, false)
        .unwrap_err();
    match err {
        ConvertError::Input { file, .. } => assert_eq!(file, missing),
        other => panic!("expected Input, got {other:?}"),
    }
}

/// Environment overrides in the config take precedence over the calibration
/// file and land in the artifact's global attributes.
#[test]
fn environment_overrides_apply() {
    let deploy = Deployment::new(&[("17082117.01A", 2, 0)]);
    let converter = deploy.converter().with_config(ConvertConfig {
        salinity_psu: Some(8.5),
        pressure_dbar: Some(15.0),
        ..ConvertConfig::default()
    });
    converter.to_bundle(None, false).unwrap();

    let attrs = read_json(&deploy.dir.path().join("17082117.zarr/.zattrs"));
    assert_eq!(attrs["salinity_psu"], 8.5);
    assert_eq!(attrs["pressure_dbar"], 15.0);
}

/// A corrupt frame aborts a strict conversion and is skipped by a lenient one.
#[test]
fn frame_policy_controls_corruption_handling() {
    let deploy = Deployment::new(&[]);
    let path = deploy.dir.path().join("noisy.01A");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&encode_frame(0, 0, [6, 6], 100));
    let mut corrupt = encode_frame(0, 1, [6, 6], 200);
    corrupt[0] = 0x00;
    bytes.extend_from_slice(&corrupt);
    bytes.extend_from_slice(&encode_frame(0, 2, [6, 6], 300));
    fs::write(&path, bytes).unwrap();

    let source = ConversionSource::new([&path], &deploy.calibration);

    let err = Converter::new(source.clone())
        .to_bundle(None, false)
        .unwrap_err();
    assert!(matches!(err, ConvertError::Frame { .. }));

    let outcome = Converter::new(source)
        .with_config(ConvertConfig {
            frame_policy: FramePolicy::Lenient,
            ..ConvertConfig::default()
        })
        .to_bundle(None, false)
        .unwrap();
    assert_eq!(outcome.stats.pings, 2);
    assert_eq!(outcome.stats.skipped_frames, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any strictly ordered capture converts with its ping count preserved;
    /// the persisted ping_time axis is strictly increasing.
    #[test]
    fn ordered_captures_round_trip(n_pings in 1u16..40) {
        let deploy = Deployment::new(&[]);
        let path = deploy.dir.path().join("prop.01A");
        write_capture(&path, n_pings, [3, 3], 0);

        let converter = Converter::new(ConversionSource::new([&path], &deploy.calibration));
        let outcome = converter.to_bundle(None, false).unwrap();
        prop_assert_eq!(outcome.stats.pings, n_pings as usize);

        let chunk = fs::read(deploy.dir.path().join("prop.zarr/Beam/ping_time/0")).unwrap();
        let times: Vec<f64> = chunk
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
            .collect();
        prop_assert_eq!(times.len(), n_pings as usize);
        prop_assert!(times.windows(2).all(|w| w[1] > w[0]));
    }
}
