//! FFT-based cross-correlation between two sample blocks.
use num_complex::Complex;
use rustfft::FftPlanner;

/// Result of aligning a follower record against a reference record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Shift in samples at which the follower best matches the reference. Positive
    /// means a feature appears `lag` samples later in the follower.
    pub lag: isize,
    /// Normalized correlation coefficient at that lag, in [-1, 1].
    pub coefficient: f64,
}

/// Finds the lag maximizing the cross-correlation of `follower` against `reference`.
///
/// Both inputs are mean-removed first. Returns `None` if either input is empty or
/// has no variance, in which case no offset can be measured.
pub fn cross_correlate(reference: &[f64], follower: &[f64]) -> Option<Alignment> {
    if reference.is_empty() || follower.is_empty() {
        return None;
    }
    let reference = remove_mean(reference);
    let follower = remove_mean(follower);
    let energy_r: f64 = reference.iter().map(|x| x * x).sum();
    let energy_f: f64 = follower.iter().map(|x| x * x).sum();
    let norm = (energy_r * energy_f).sqrt();
    if norm <= f64::EPSILON {
        return None;
    }

    let n = (reference.len() + follower.len() - 1).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut r = padded(&reference, n);
    let mut f = padded(&follower, n);
    fft.process(&mut r);
    fft.process(&mut f);

    // c[k] = sum_i f[i + k] * r[i]
    let mut spectrum: Vec<Complex<f64>> = f.iter().zip(r.iter()).map(|(a, b)| a * b.conj()).collect();
    ifft.process(&mut spectrum);
    let scale = n as f64;

    let max_positive = follower.len() as isize - 1;
    let max_negative = reference.len() as isize - 1;
    let mut lags: Vec<isize> = (-max_negative..=max_positive).collect();
    // smallest |lag| wins exact ties
    lags.sort_by_key(|lag| (lag.abs(), *lag < 0));

    let mut best = Alignment {
        lag: 0,
        coefficient: f64::NEG_INFINITY,
    };
    for lag in lags {
        let index = lag.rem_euclid(n as isize) as usize;
        let coefficient = spectrum[index].re / scale / norm;
        if coefficient > best.coefficient + 1e-12 {
            best = Alignment { lag, coefficient };
        }
    }
    Some(best)
}

/// Pearson correlation of two equally indexed sample blocks (truncated to the shorter).
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let len = a.len().min(b.len());
    if len < 2 {
        return None;
    }
    let a = remove_mean(&a[..len]);
    let b = remove_mean(&b[..len]);
    let cov: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm = (a.iter().map(|x| x * x).sum::<f64>() * b.iter().map(|y| y * y).sum::<f64>()).sqrt();
    if norm <= f64::EPSILON {
        None
    } else {
        Some(cov / norm)
    }
}

fn remove_mean(samples: &[f64]) -> Vec<f64> {
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    samples.iter().map(|s| s - mean).collect()
}

fn padded(samples: &[f64], n: usize) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = samples.iter().map(|s| Complex::new(*s, 0.0)).collect();
    buffer.resize(n, Complex::new(0.0, 0.0));
    buffer
}
