//! Automatic waveform measurements.
//!
//! Level-based measurements use the midpoint between the waveform's *top* and *base*
//! levels, where top and base are the means of the samples above and below the
//! min/max midpoint. Crossing times are linearly interpolated between samples.

use crate::error::{AppResult, AutomationError};
use crate::instrument::Waveform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Measurement kinds computed from a single waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Mean,
    Rms,
    PeakToPeak,
    Max,
    Min,
    Amplitude,
    Period,
    Frequency,
    RiseTime,
    FallTime,
    PulseWidth,
    DutyCycle,
    Overshoot,
    Undershoot,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 14] = [
        MeasurementKind::Mean,
        MeasurementKind::Rms,
        MeasurementKind::PeakToPeak,
        MeasurementKind::Max,
        MeasurementKind::Min,
        MeasurementKind::Amplitude,
        MeasurementKind::Period,
        MeasurementKind::Frequency,
        MeasurementKind::RiseTime,
        MeasurementKind::FallTime,
        MeasurementKind::PulseWidth,
        MeasurementKind::DutyCycle,
        MeasurementKind::Overshoot,
        MeasurementKind::Undershoot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::Mean => "mean",
            MeasurementKind::Rms => "rms",
            MeasurementKind::PeakToPeak => "peak_to_peak",
            MeasurementKind::Max => "max",
            MeasurementKind::Min => "min",
            MeasurementKind::Amplitude => "amplitude",
            MeasurementKind::Period => "period",
            MeasurementKind::Frequency => "frequency",
            MeasurementKind::RiseTime => "rise_time",
            MeasurementKind::FallTime => "fall_time",
            MeasurementKind::PulseWidth => "pulse_width",
            MeasurementKind::DutyCycle => "duty_cycle",
            MeasurementKind::Overshoot => "overshoot",
            MeasurementKind::Undershoot => "undershoot",
        }
    }

    /// Unit of the measured value.
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementKind::Period
            | MeasurementKind::RiseTime
            | MeasurementKind::FallTime
            | MeasurementKind::PulseWidth => "s",
            MeasurementKind::Frequency => "Hz",
            MeasurementKind::DutyCycle | MeasurementKind::Overshoot | MeasurementKind::Undershoot => "%",
            _ => "V",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let alias = match normalized.as_str() {
            "dc" | "average" | "avg" => "mean",
            "pk2pk" | "vpp" | "peak_peak" => "peak_to_peak",
            "freq" => "frequency",
            "duty" => "duty_cycle",
            other => other,
        };
        MeasurementKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == alias)
            .ok_or_else(|| AutomationError::Configuration(format!("Unknown measurement kind '{}'", s)))
    }
}

/// Computes `kind` over `waveform`.
///
/// # Errors
///
/// Returns [`AutomationError::Processing`] for an empty record or when a timing
/// measurement finds too few transitions.
pub fn measure(kind: MeasurementKind, waveform: &Waveform) -> AppResult<f64> {
    let samples = &waveform.samples;
    if samples.is_empty() {
        return Err(AutomationError::Processing(format!(
            "Cannot measure {} on an empty record from {}",
            kind, waveform.channel
        )));
    }

    let value = match kind {
        MeasurementKind::Mean => samples.iter().sum::<f64>() / samples.len() as f64,
        MeasurementKind::Rms => rms(samples),
        MeasurementKind::Max => max(samples),
        MeasurementKind::Min => min(samples),
        MeasurementKind::PeakToPeak => max(samples) - min(samples),
        MeasurementKind::Amplitude => {
            let levels = Levels::of(samples);
            levels.top - levels.base
        }
        MeasurementKind::Period => period(waveform)?,
        MeasurementKind::Frequency => 1.0 / period(waveform)?,
        MeasurementKind::RiseTime => transition_time(waveform, true)?,
        MeasurementKind::FallTime => transition_time(waveform, false)?,
        MeasurementKind::PulseWidth => pulse_width(waveform)?,
        MeasurementKind::DutyCycle => 100.0 * pulse_width(waveform)? / period(waveform)?,
        MeasurementKind::Overshoot => {
            let levels = Levels::of(samples);
            levels.percent_of_amplitude(max(samples) - levels.top)
        }
        MeasurementKind::Undershoot => {
            let levels = Levels::of(samples);
            levels.percent_of_amplitude(levels.base - min(samples))
        }
    };
    Ok(value)
}

/// Root mean square of a sample block.
pub fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
}

fn max(samples: &[f64]) -> f64 {
    samples.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min(samples: &[f64]) -> f64 {
    samples.iter().copied().fold(f64::INFINITY, f64::min)
}

struct Levels {
    top: f64,
    base: f64,
}

impl Levels {
    fn of(samples: &[f64]) -> Self {
        let (lo, hi) = (min(samples), max(samples));
        let mid = (lo + hi) / 2.0;
        let mean_of = |pred: &dyn Fn(f64) -> bool, fallback: f64| {
            let selected: Vec<f64> = samples.iter().copied().filter(|s| pred(*s)).collect();
            if selected.is_empty() {
                fallback
            } else {
                selected.iter().sum::<f64>() / selected.len() as f64
            }
        };
        Self {
            top: mean_of(&|s| s > mid, hi),
            base: mean_of(&|s| s < mid, lo),
        }
    }

    fn mid(&self) -> f64 {
        (self.top + self.base) / 2.0
    }

    fn at_fraction(&self, fraction: f64) -> f64 {
        self.base + fraction * (self.top - self.base)
    }

    fn percent_of_amplitude(&self, excursion: f64) -> f64 {
        let amplitude = self.top - self.base;
        if amplitude > 0.0 {
            100.0 * excursion.max(0.0) / amplitude
        } else {
            0.0
        }
    }
}

/// Interpolated times at which the waveform crosses `level` in one direction.
pub fn crossing_times(waveform: &Waveform, level: f64, rising: bool) -> Vec<f64> {
    let s = &waveform.samples;
    let mut times = Vec::new();
    for i in 1..s.len() {
        let (a, b) = (s[i - 1], s[i]);
        let crossed = if rising {
            a < level && b >= level
        } else {
            a > level && b <= level
        };
        if crossed {
            let fraction = if b != a { (level - a) / (b - a) } else { 0.0 };
            times.push(waveform.timestamp(i - 1) + fraction * waveform.sample_interval);
        }
    }
    times
}

fn period(waveform: &Waveform) -> AppResult<f64> {
    let levels = Levels::of(&waveform.samples);
    let rising = crossing_times(waveform, levels.mid(), true);
    if rising.len() < 2 {
        return Err(AutomationError::Processing(format!(
            "Period on {} needs at least two rising edges, found {}",
            waveform.channel,
            rising.len()
        )));
    }
    let span = rising[rising.len() - 1] - rising[0];
    Ok(span / (rising.len() - 1) as f64)
}

fn transition_time(waveform: &Waveform, rising: bool) -> AppResult<f64> {
    let levels = Levels::of(&waveform.samples);
    let (low, high) = (levels.at_fraction(0.1), levels.at_fraction(0.9));
    let (start_level, end_level) = if rising { (low, high) } else { (high, low) };
    for start in crossing_times(waveform, start_level, rising) {
        if let Some(end) = crossing_times(waveform, end_level, rising)
            .into_iter()
            .find(|t| *t >= start)
        {
            return Ok(end - start);
        }
    }
    Err(AutomationError::Processing(format!(
        "No complete {} transition on {}",
        if rising { "rising" } else { "falling" },
        waveform.channel
    )))
}

fn pulse_width(waveform: &Waveform) -> AppResult<f64> {
    let mid = Levels::of(&waveform.samples).mid();
    let falling = crossing_times(waveform, mid, false);
    crossing_times(waveform, mid, true)
        .into_iter()
        .find_map(|rise| falling.iter().find(|fall| **fall > rise).map(|fall| fall - rise))
        .ok_or_else(|| {
            AutomationError::Processing(format!("No complete positive pulse on {}", waveform.channel))
        })
}
