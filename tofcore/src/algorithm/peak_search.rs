use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::data::histogram::Histogram1D;

/// Parameters of the automated peak search used to seed spectral fits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeakSearchParams {
    pub sigma_bins: f64,         // Gaussian smoothing width in bins
    pub truncate: f64,           // kernel cutoff in sigmas
    pub threshold: f64,          // minimum height relative to the highest peak
    pub background_window: usize, // SNIP clipping window in bins, 0 disables background suppression
    pub min_distance_bins: usize,
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,         // minimum net height relative to the smoothed maximum
}

fn default_noise_floor() -> f64 {
    1e-9
}

impl Default for PeakSearchParams {
    fn default() -> Self {
        PeakSearchParams {
            sigma_bins: 2.0,
            truncate: 3.0,
            threshold: 0.005,
            background_window: 20,
            min_distance_bins: 2,
            noise_floor: default_noise_floor(),
        }
    }
}

/// A local maximum of the background-suppressed spectrum.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoundPeak {
    pub bin: usize,
    /// Position on the histogram axis, refined to sub-bin precision
    pub position: f64,
    /// Raw bin content at the apex
    pub height: f64,
    /// Apex height of the smoothed, background-subtracted spectrum
    pub net_height: f64,
    pub prominence: f64,
}

/// Build a normalized 1D Gaussian kernel over bins.
/// `sigma`: stddev in bins, `truncate`: cutoff in sigmas (e.g., 3.0 => radius = ceil(3*sigma))
fn gaussian_kernel_1d(sigma: f64, truncate: f64) -> Vec<f64> {
    if sigma <= 0.0 { return vec![1.0]; }
    let radius = (truncate * sigma).ceil().max(1.0) as i64;
    let two_s2 = 2.0 * sigma * sigma;
    let mut w: Vec<f64> = (-radius..=radius).map(|dx| (-(dx * dx) as f64 / two_s2).exp()).collect();
    let sum: f64 = w.iter().sum();
    for v in &mut w { *v /= sum; }
    w
}

/// Gaussian smoothing with edge renormalisation.
pub fn smooth_gaussian(y: &[f64], sigma: f64, truncate: f64) -> Vec<f64> {
    let w = gaussian_kernel_1d(sigma, truncate);
    let rad = (w.len() as isize - 1) / 2;
    let n = y.len() as isize;
    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (k, &wk) in w.iter().enumerate() {
                let j = i + k as isize - rad;
                if j >= 0 && j < n {
                    acc += wk * y[j as usize];
                    norm += wk;
                }
            }
            if norm > 0.0 { acc / norm } else { 0.0 }
        })
        .collect()
}

/// SNIP background estimate with a decreasing clipping window.
pub fn snip_background(y: &[f64], window: usize) -> Vec<f64> {
    let n = y.len();
    let mut bg = y.to_vec();
    if window == 0 || n < 3 {
        return bg;
    }
    let mut tmp = bg.clone();
    for p in (1..=window).rev() {
        for i in p..n.saturating_sub(p) {
            let mean = 0.5 * (bg[i - p] + bg[i + p]);
            tmp[i] = bg[i].min(mean);
        }
        bg[p..n.saturating_sub(p)].copy_from_slice(&tmp[p..n.saturating_sub(p)]);
    }
    bg
}

#[inline(always)]
fn quad_subsample(y0: f64, y1: f64, y2: f64) -> f64 {
    let denom = y0 - 2.0 * y1 + y2;
    if denom.abs() < 1e-12 { 0.0 } else { 0.5 * (y0 - y2) / denom }
}

/// Finds peaks in a histogram: smooth, subtract SNIP background, keep local
/// maxima above `threshold` times the highest one.
///
/// # Arguments
///
/// * `hist` - spectrum to search
/// * `params` - smoothing, background and threshold settings
///
/// # Returns
///
/// * peaks sorted by decreasing net height
///
pub fn find_peaks(hist: &Histogram1D, params: &PeakSearchParams) -> Vec<FoundPeak> {
    let n = hist.bins();
    if n < 3 { return Vec::new(); }

    let smoothed = smooth_gaussian(&hist.counts, params.sigma_bins, params.truncate);
    let background = snip_background(&smoothed, params.background_window);
    let net: Vec<f64> = smoothed.iter().zip(&background).map(|(s, b)| (s - b).max(0.0)).collect();
    let floor = params.noise_floor * smoothed.iter().copied().fold(0.0, f64::max);

    let mut peaks: Vec<FoundPeak> = Vec::new();
    for i in 1..n - 1 {
        let apex = net[i];
        if !(apex > floor) || !(apex > net[i - 1] && apex >= net[i + 1]) { continue; }

        let mut l = i; let mut left_min = apex;
        while l > 0 { l -= 1; left_min = left_min.min(net[l]); if net[l] > apex { break; } }
        let mut r = i; let mut right_min = apex;
        while r + 1 < n { r += 1; right_min = right_min.min(net[r]); if net[r] > apex { break; } }
        let prominence = apex - left_min.max(right_min);

        if let Some(last) = peaks.last() {
            if i.abs_diff(last.bin) < params.min_distance_bins {
                if apex <= last.net_height { continue; }
                peaks.pop();
            }
        }

        let sub = quad_subsample(net[i - 1], net[i], net[i + 1]).clamp(-0.5, 0.5);
        peaks.push(FoundPeak {
            bin: i,
            position: hist.bin_center(i) + sub * hist.bin_width(),
            height: hist.counts[i],
            net_height: apex,
            prominence,
        });
    }

    let highest = peaks.iter().map(|p| p.net_height).fold(0.0, f64::max);
    peaks.retain(|p| p.net_height >= params.threshold * highest);
    peaks.sort_by_key(|p| std::cmp::Reverse(OrderedFloat(p.net_height)));
    peaks
}

/// Highest found peak whose position lies in `[low, high]`.
pub fn strongest_in_range(peaks: &[FoundPeak], low: f64, high: f64) -> Option<FoundPeak> {
    // peaks are sorted by decreasing height
    peaks.iter().copied().find(|p| p.position >= low && p.position <= high)
}
