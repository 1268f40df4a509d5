use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::levenberg_marquardt::{levenberg_marquardt, DataPoint, FitModel, LmOutcome, LmSettings};
use crate::algorithm::peak_search::{find_peaks, strongest_in_range, FoundPeak, PeakSearchParams};
use crate::data::histogram::Histogram1D;
use crate::error::{TofError, TofResult};

/// Fit window of one spectral component.
///
/// # Fields
///
/// * `low`, `high` - bounds of the single-peak warm-start fit
/// * `fixed_mean` - pins the mean during the warm start, for low-statistics reference peaks
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeakInterval {
    pub low: f64,
    pub high: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_mean: Option<f64>,
}

impl PeakInterval {
    pub fn new(low: f64, high: f64) -> Self {
        PeakInterval { low, high, fixed_mean: None }
    }

    pub fn with_fixed_mean(low: f64, high: f64, mean: f64) -> Self {
        PeakInterval { low, high, fixed_mean: Some(mean) }
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.low, self.high)
    }
}

/// Fitted Gaussian component with uncertainties. `amplitude` is the peak height.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeakFit {
    pub amplitude: f64,
    pub amplitude_error: f64,
    pub centroid: f64,
    pub centroid_error: f64,
    pub sigma: f64,
    pub sigma_error: f64,
}

impl PeakFit {
    fn from_outcome(outcome: &LmOutcome, component: usize) -> Self {
        let base = 3 * component;
        PeakFit {
            amplitude: outcome.parameters[base],
            amplitude_error: outcome.errors[base],
            centroid: outcome.parameters[base + 1],
            centroid_error: outcome.errors[base + 1],
            sigma: outcome.parameters[base + 2].abs(),
            sigma_error: outcome.errors[base + 2],
        }
    }
}

/// Sum of `n` Gaussians `A_i exp(-(x - mu_i)^2 / (2 sigma_i^2))`,
/// parameters laid out as `[A_0, mu_0, sigma_0, A_1, ...]`.
#[derive(Clone, Copy, Debug)]
pub struct GaussianSum {
    pub components: usize,
}

impl FitModel for GaussianSum {
    fn n_params(&self) -> usize {
        3 * self.components
    }

    fn value(&self, x: f64, p: &[f64]) -> f64 {
        p.chunks_exact(3)
            .map(|c| {
                let z = (x - c[1]) / c[2];
                c[0] * (-0.5 * z * z).exp()
            })
            .sum()
    }

    fn gradient(&self, x: f64, p: &[f64], grad: &mut [f64]) {
        for (c, g) in p.chunks_exact(3).zip(grad.chunks_exact_mut(3)) {
            let (a, mu, s) = (c[0], c[1], c[2]);
            let d = x - mu;
            let e = (-0.5 * d * d / (s * s)).exp();
            g[0] = e;
            g[1] = a * e * d / (s * s);
            g[2] = a * e * d * d / (s * s * s);
        }
    }
}

/// Composite fit over the union of all intervals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFit {
    pub peaks: Vec<PeakFit>,
    pub range: (f64, f64),
    pub chi2: f64,
    pub ndf: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralFitSettings {
    pub peak_search: PeakSearchParams,
    pub lm: LmSettings,
}

/// Multi-peak Gaussian fitter: one warm-start fit per interval, then a
/// combined fit of the sum of all components.
#[derive(Clone, Debug, Default)]
pub struct SpectralFitter {
    pub settings: SpectralFitSettings,
}

/// Non-empty bins with centers in `[low, high]`, weighted by their bin errors.
fn fit_points(hist: &Histogram1D, low: f64, high: f64) -> Vec<DataPoint> {
    hist.points_in_range(low, high)
        .into_iter()
        .filter(|&(_, y, err)| y != 0.0 && err > 0.0)
        .map(|(x, y, sigma)| DataPoint { x, y, sigma })
        .collect()
}

impl SpectralFitter {
    pub fn new(settings: SpectralFitSettings) -> Self {
        SpectralFitter { settings }
    }

    /// Fits one Gaussian per interval and refits their sum over the union range.
    ///
    /// # Arguments
    ///
    /// * `hist` - spectrum to fit
    /// * `intervals` - ordered fit windows, one per component
    ///
    /// # Returns
    ///
    /// * one `PeakFit` per interval, in interval order, from the combined fit
    ///
    pub fn fit(&self, hist: &Histogram1D, intervals: &[PeakInterval]) -> TofResult<Vec<PeakFit>> {
        Ok(self.fit_spectrum(hist, intervals)?.peaks)
    }

    pub fn fit_spectrum(&self, hist: &Histogram1D, intervals: &[PeakInterval]) -> TofResult<SpectrumFit> {
        if intervals.is_empty() {
            return Ok(SpectrumFit { peaks: Vec::new(), range: (0.0, 0.0), chi2: 0.0, ndf: 0 });
        }
        if hist.integral() == 0.0 {
            return Err(TofError::EmptyHistogram);
        }
        for iv in intervals {
            if !(iv.high > iv.low) {
                return Err(TofError::InvalidConfig(format!("fit interval [{}, {}] is empty", iv.low, iv.high)));
            }
        }

        let found = find_peaks(hist, &self.settings.peak_search);

        let mut seeds: Vec<f64> = Vec::with_capacity(3 * intervals.len());
        for iv in intervals {
            seeds.extend_from_slice(&self.warm_start_with(hist, iv, &found)?);
        }

        let (low, high) = match intervals.iter().flat_map(|iv| [iv.low, iv.high]).minmax_by(f64::total_cmp) {
            MinMaxResult::MinMax(low, high) => (low, high),
            MinMaxResult::OneElement(x) => (x, x),
            MinMaxResult::NoElements => return Err(TofError::InvalidConfig("no fit intervals".to_string())),
        };
        let points = fit_points(hist, low, high);
        let model = GaussianSum { components: intervals.len() };
        let fixed = vec![false; seeds.len()];

        let outcome = levenberg_marquardt(&model, &points, &seeds, &fixed, &self.settings.lm, (low, high))?;
        debug!(components = intervals.len(), chi2 = outcome.chi2, ndf = outcome.ndf, iterations = outcome.iterations, "combined gaussian fit");

        Ok(SpectrumFit {
            peaks: (0..intervals.len()).map(|i| PeakFit::from_outcome(&outcome, i)).collect(),
            range: (low, high),
            chi2: outcome.chi2,
            ndf: outcome.ndf,
        })
    }

    /// Single-Gaussian fit restricted to one interval, returning `[amplitude, mean, sigma]`.
    pub fn warm_start(&self, hist: &Histogram1D, interval: &PeakInterval) -> TofResult<[f64; 3]> {
        let found = find_peaks(hist, &self.settings.peak_search);
        self.warm_start_with(hist, interval, &found)
    }

    fn warm_start_with(&self, hist: &Histogram1D, interval: &PeakInterval, found: &[FoundPeak]) -> TofResult<[f64; 3]> {
        let (low, high) = interval.bounds();
        let points = fit_points(hist, low, high);
        if points.is_empty() {
            return Err(TofError::convergence((low, high), &[], "no filled bins in interval"));
        }

        // seed from the peak search, falling back to the highest bin
        let (mut height, mut mean) = match strongest_in_range(found, low, high) {
            Some(p) => (p.height, p.position),
            None => points
                .iter()
                .fold((f64::NEG_INFINITY, 0.5 * (low + high)), |best, pt| if pt.y > best.0 { (pt.y, pt.x) } else { best }),
        };
        if let Some(m) = interval.fixed_mean {
            mean = m;
            if let Some(bin) = hist.find_bin(m).filter(|&b| hist.counts[b] > 0.0) {
                height = hist.counts[bin];
            }
        }

        let weight: f64 = points.iter().map(|pt| pt.y.max(0.0)).sum();
        let second: f64 = points.iter().map(|pt| pt.y.max(0.0) * (pt.x - mean).powi(2)).sum();
        let sigma = if weight > 0.0 { (second / weight).sqrt() } else { 0.0 };
        let sigma = sigma.clamp(hist.bin_width(), (high - low).max(hist.bin_width()));

        let seed = [height, mean, sigma];
        let fixed = [false, interval.fixed_mean.is_some(), false];
        let outcome = levenberg_marquardt(&GaussianSum { components: 1 }, &points, &seed, &fixed, &self.settings.lm, (low, high))?;

        let p = &outcome.parameters;
        Ok([p[0], p[1], p[2].abs()])
    }
}
