//! Derived physical quantities
//!
//! Pure functions over (assembled raw counts, calibration coefficients),
//! evaluated in double precision throughout. The conversions reproduce the
//! vendor-defined formulas: cubic tilt polynomials, a thermistor bridge for
//! temperature, oceanographic sound speed and seawater absorption, and the
//! round-trip power conversion producing `backscatter_r`.
//!
//! Calibration coverage is checked lazily per channel: a channel present in
//! the data but absent from the calibration only fails here, when its
//! coefficients are first requested.

use crate::assemble::{ChannelBlock, PingStack};
use crate::calibration::{CalibrationError, CalibrationSet, TempCoefficients};

/// Vendor count-domain scale for the echo-level conversion.
const COUNT_SCALE: f64 = 26214.0;

/// Evaluate a cubic polynomial `a + b·n + c·n² + d·n³`, constant term first.
pub fn eval_cubic(coeff: &[f64; 4], n: f64) -> f64 {
    coeff[0] + n * (coeff[1] + n * (coeff[2] + n * coeff[3]))
}

/// Temperature in °C from a raw thermistor count.
///
/// Bridge voltage `v = 2.5·N/65535`, resistance `R = (ka + kb·v)/(kc − v)`,
/// then the Steinhart-Hart inversion `1/(a + b·lnR + c·(lnR)³) − 273`.
pub fn temperature_celsius(count: f64, k: &TempCoefficients) -> f64 {
    let v = 2.5 * (count / 65535.0);
    let r = (k.ka + k.kb * v) / (k.kc - v);
    let ln_r = r.ln();
    1.0 / (k.a + k.b * ln_r + k.c * ln_r.powi(3)) - 273.0
}

/// Sound speed in m/s for temperature (°C), salinity (PSU) and pressure
/// (dbar).
pub fn sound_speed_m_s(temperature: f64, salinity: f64, pressure: f64) -> f64 {
    let z = temperature / 10.0;
    1449.05
        + z * (45.7 + z * (-5.21 + 0.23 * z))
        + (1.333 + z * (-0.126 + 0.009 * z)) * (salinity - 35.0)
        + (pressure / 1000.0) * (16.3 + 0.18 * (pressure / 1000.0))
}

/// Seawater absorption in dB/m for temperature (°C), frequency (kHz),
/// salinity (PSU) and pressure (dbar).
pub fn absorption_db_m(temperature: f64, frequency_khz: f64, salinity: f64, pressure: f64) -> f64 {
    let t = temperature;
    let t_k = t + 273.0;
    let f1 = 1320.0 * t_k * (-1700.0 / t_k).exp();
    let f2 = 1.55e7 * t_k * (-3052.0 / t_k).exp();

    let k = 1.0 + pressure / 10.0;
    let a = 8.95e-8 * (1.0 + t * (2.29e-2 - 5.08e-4 * t));
    let b = (salinity / 35.0)
        * 4.88e-7
        * (1.0 + 0.0134 * t)
        * (1.0 - 0.00103 * k + 3.7e-7 * k * k);
    let c = 4.86e-13
        * (1.0 + t * (-0.042 + t * (8.53e-4 - t * 6.23e-6)))
        * (1.0 + k * (-3.84e-4 + k * 7.57e-8));

    let f = frequency_khz * 1000.0;
    if salinity == 0.0 {
        c * f * f
    } else {
        (a * f1 * f * f) / (f1 * f1 + f * f) + (b * f2 * f * f) / (f2 * f2 + f * f) + c * f * f
    }
}

/// Echo level in dB from a raw count.
pub fn echo_level_db(count: f64, el_max: f64, ds: f64) -> f64 {
    el_max - 2.5 / ds + count / (COUNT_SCALE * ds)
}

/// All derived quantities for one ping stack
#[derive(Debug, Clone)]
pub struct DerivedQuantities {
    /// Tilt X in degrees, per ping
    pub tilt_x: Vec<f64>,
    /// Tilt Y in degrees, per ping
    pub tilt_y: Vec<f64>,
    /// Temperature in °C, per ping
    pub temperature: Vec<f64>,
    /// Indicative sound speed in m/s, per ping
    pub sound_speed: Vec<f64>,
    /// Mean temperature over the stack, the bulk value used for ranging
    pub mean_temperature: f64,
    /// Sound speed at the mean temperature, used for ranging
    pub bulk_sound_speed: f64,
    /// Absorption in dB/m at the mean temperature, per channel
    pub absorption: Vec<f64>,
    /// Range to each bin center in m, per channel
    pub range_m: Vec<Vec<f64>>,
    /// Calibrated backscatter strength, per channel (ping × range bin)
    pub backscatter: Vec<ChannelBlock>,
}

/// Compute every derived quantity for a stack.
///
/// Fails with [`CalibrationError::ChannelMismatch`] or
/// [`CalibrationError::MissingPulseLength`] when a data channel lacks
/// coefficients.
pub fn compute(stack: &PingStack, cal: &CalibrationSet) -> Result<DerivedQuantities, CalibrationError> {
    let tilt_x: Vec<f64> = stack
        .tilt_x_counts
        .iter()
        .map(|&n| eval_cubic(&cal.tilt.x, n))
        .collect();
    let tilt_y: Vec<f64> = stack
        .tilt_y_counts
        .iter()
        .map(|&n| eval_cubic(&cal.tilt.y, n))
        .collect();
    let temperature: Vec<f64> = stack
        .temperature_counts
        .iter()
        .map(|&n| temperature_celsius(n, &cal.temperature))
        .collect();
    let sound_speed: Vec<f64> = temperature
        .iter()
        .map(|&t| sound_speed_m_s(t, cal.salinity_psu, cal.pressure_dbar))
        .collect();

    let mean_temperature = temperature.iter().sum::<f64>() / temperature.len().max(1) as f64;
    let bulk_sound_speed = sound_speed_m_s(mean_temperature, cal.salinity_psu, cal.pressure_dbar);

    let config = &stack.config;
    let mut absorption = Vec::with_capacity(config.num_channels);
    let mut range_m = Vec::with_capacity(config.num_channels);
    let mut backscatter = Vec::with_capacity(config.num_channels);

    for (ch, block) in stack.channels.iter().enumerate() {
        let coeff = cal.channel(ch)?;
        let tau_s = coeff
            .pulse_length_us(config.phase)
            .ok_or(CalibrationError::MissingPulseLength {
                channel: ch,
                phase: config.phase,
            })?
            * 1e-6;

        let alpha = absorption_db_m(
            mean_temperature,
            coeff.frequency_khz,
            cal.salinity_psu,
            cal.pressure_dbar,
        );

        // Range to each bin center: two-way travel of range_samples_per_bin
        // digitizer samples per bin, plus the quarter-pulse offset.
        let bin_seconds = config.range_samples_per_bin[ch] / config.dig_rate[ch];
        let ranges: Vec<f64> = (0..block.n_bins)
            .map(|i| {
                bulk_sound_speed / 2.0 * (i as f64 + 1.0) * bin_seconds
                    + bulk_sound_speed * tau_s / 4.0
            })
            .collect();

        let gain_linear = 10f64.powf(coeff.gain_db / 10.0);
        let spreading_offset = 10.0 * (bulk_sound_speed * tau_s * gain_linear / 2.0).log10();

        let mut samples = Vec::with_capacity(block.samples.len());
        for ping in 0..block.n_pings {
            for (i, &count) in block.row(ping).iter().enumerate() {
                let el = echo_level_db(count, coeff.el_max, coeff.ds);
                let r = ranges[i];
                samples.push(el + 20.0 * r.log10() + 2.0 * alpha * r - spreading_offset);
            }
        }

        absorption.push(alpha);
        range_m.push(ranges);
        backscatter.push(ChannelBlock {
            n_pings: block.n_pings,
            n_bins: block.n_bins,
            samples,
        });
    }

    Ok(DerivedQuantities {
        tilt_x,
        tilt_y,
        temperature,
        sound_speed,
        mean_temperature,
        bulk_sound_speed,
        absorption,
        range_m,
        backscatter,
    })
}
