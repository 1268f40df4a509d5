use serde::{Deserialize, Serialize};

use crate::error::{TofError, TofResult};

/// Fixed-width binned counts over `[low, high)`.
///
/// Every bin carries its sum of squared weights, so bin errors stay correct
/// after scaling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    pub low: f64,
    pub high: f64,
    pub counts: Vec<f64>,
    pub sumw2: Vec<f64>,
    pub underflow: f64,
    pub overflow: f64,
    pub entries: usize,
}

impl Histogram1D {
    /// Creates an empty histogram.
    ///
    /// # Arguments
    ///
    /// * `bins` - number of bins, must be > 0
    /// * `low` - lower edge of the first bin
    /// * `high` - upper edge of the last bin, must be > `low`
    ///
    pub fn new(bins: usize, low: f64, high: f64) -> TofResult<Self> {
        if bins == 0 || !(high > low) || !low.is_finite() || !high.is_finite() {
            return Err(TofError::InvalidConfig(format!(
                "histogram needs bins > 0 and low < high, got {} bins over [{}, {})", bins, low, high
            )));
        }
        Ok(Histogram1D {
            low,
            high,
            counts: vec![0.0; bins],
            sumw2: vec![0.0; bins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        })
    }

    /// Histogram from already binned counts, with Poisson bin errors.
    pub fn from_counts(low: f64, high: f64, counts: Vec<f64>) -> TofResult<Self> {
        let mut hist = Histogram1D::new(counts.len(), low, high)?;
        hist.entries = counts.iter().sum::<f64>().round().max(0.0) as usize;
        hist.sumw2 = counts.iter().map(|c| c.abs()).collect();
        hist.counts = counts;
        Ok(hist)
    }

    /// Builds a histogram whose range spans the data, for spectra booked
    /// without an explicit range.
    pub fn auto_range(values: &[f64], bins: usize) -> TofResult<Self> {
        let finite = values.iter().copied().filter(|v| v.is_finite());
        let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        if !min.is_finite() {
            return Err(TofError::EmptyHistogram);
        }
        // widen so the maximum lands inside the last bin
        let span = (max - min).abs().max(max.abs()).max(1.0);
        let mut hist = Histogram1D::new(bins, min, max + span * 1e-6)?;
        hist.fill_all(values);
        Ok(hist)
    }

    /// Builds a histogram with an explicit range, or a data-driven one if `range` is `None`.
    pub fn from_values(values: &[f64], bins: usize, range: Option<(f64, f64)>) -> TofResult<Self> {
        match range {
            Some((low, high)) => {
                let mut hist = Histogram1D::new(bins, low, high)?;
                hist.fill_all(values);
                Ok(hist)
            }
            None => Histogram1D::auto_range(values, bins),
        }
    }

    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / self.bins() as f64
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        self.low + (bin as f64 + 0.5) * self.bin_width()
    }

    /// Bin holding `x`, or `None` for under/overflow.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.low) || x >= self.high {
            return None;
        }
        let bin = ((x - self.low) / self.bin_width()) as usize;
        Some(bin.min(self.bins() - 1))
    }

    pub fn fill(&mut self, x: f64) {
        self.fill_weighted(x, 1.0);
    }

    pub fn fill_weighted(&mut self, x: f64, weight: f64) {
        self.entries += 1;
        match self.find_bin(x) {
            Some(bin) => {
                self.counts[bin] += weight;
                self.sumw2[bin] += weight * weight;
            }
            None if x < self.low => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    pub fn fill_all(&mut self, values: &[f64]) {
        for &v in values {
            if v.is_finite() {
                self.fill(v);
            }
        }
    }

    /// Sum of in-range bin contents.
    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn scale(&mut self, factor: f64) {
        for (c, w2) in self.counts.iter_mut().zip(self.sumw2.iter_mut()) {
            *c *= factor;
            *w2 *= factor * factor;
        }
        self.underflow *= factor;
        self.overflow *= factor;
    }

    /// Scales to unit integral; a histogram with zero integral is left untouched.
    pub fn normalize(&mut self) -> bool {
        let integral = self.integral();
        if integral != 0.0 {
            self.scale(1.0 / integral);
            true
        } else {
            false
        }
    }

    pub fn bin_error(&self, bin: usize) -> f64 {
        self.sumw2[bin].sqrt()
    }

    /// Bin with the largest content (first one on ties).
    pub fn max_bin(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, &c) in self.counts.iter().enumerate() {
            match best {
                Some(b) if self.counts[b] >= c => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Indices of bins whose centers lie in `[low, high]`.
    pub fn bins_in_range(&self, low: f64, high: f64) -> std::ops::Range<usize> {
        let width = self.bin_width();
        let first = ((low - self.low) / width - 0.5).ceil().max(0.0) as usize;
        let last = ((high - self.low) / width - 0.5).floor();
        if last < 0.0 {
            return 0..0;
        }
        let end = (last as usize + 1).min(self.bins());
        first.min(end)..end
    }

    /// (center, content, error) of every bin whose center lies in `[low, high]`.
    pub fn points_in_range(&self, low: f64, high: f64) -> Vec<(f64, f64, f64)> {
        self.bins_in_range(low, high)
            .map(|b| (self.bin_center(b), self.counts[b], self.bin_error(b)))
            .collect()
    }
}

/// Two-dimensional fixed-width histogram, used for detector hit maps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram2D {
    pub x_axis: (usize, f64, f64),
    pub y_axis: (usize, f64, f64),
    /// Row-major over y, then x
    pub counts: Vec<f64>,
    pub entries: usize,
}

impl Histogram2D {
    pub fn new(x_axis: (usize, f64, f64), y_axis: (usize, f64, f64)) -> TofResult<Self> {
        for &(bins, low, high) in &[x_axis, y_axis] {
            if bins == 0 || !(high > low) {
                return Err(TofError::InvalidConfig(format!(
                    "2D histogram axis needs bins > 0 and low < high, got {} bins over [{}, {})", bins, low, high
                )));
            }
        }
        Ok(Histogram2D { x_axis, y_axis, counts: vec![0.0; x_axis.0 * y_axis.0], entries: 0 })
    }

    /// Detector hit map: 40 x 40 bins over -20..20 mm on both axes.
    pub fn position_map() -> Self {
        Histogram2D {
            x_axis: (40, -20.0, 20.0),
            y_axis: (40, -20.0, 20.0),
            counts: vec![0.0; 1600],
            entries: 0,
        }
    }

    fn axis_bin(axis: (usize, f64, f64), v: f64) -> Option<usize> {
        let (bins, low, high) = axis;
        if !(v >= low) || v >= high {
            return None;
        }
        Some((((v - low) / (high - low)) * bins as f64).min((bins - 1) as f64) as usize)
    }

    pub fn fill(&mut self, x: f64, y: f64) {
        self.entries += 1;
        if let (Some(bx), Some(by)) = (Self::axis_bin(self.x_axis, x), Self::axis_bin(self.y_axis, y)) {
            self.counts[by * self.x_axis.0 + bx] += 1.0;
        }
    }

    pub fn get(&self, x_bin: usize, y_bin: usize) -> f64 {
        self.counts[y_bin * self.x_axis.0 + x_bin]
    }

    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_overflow() {
        let mut h = Histogram1D::new(10, 0.0, 10.0).unwrap();
        h.fill_all(&[-1.0, 0.0, 0.5, 9.99, 10.0, 3.2]);
        assert_eq!(h.counts[0], 2.0);
        assert_eq!(h.counts[3], 1.0);
        assert_eq!(h.counts[9], 1.0);
        assert_eq!(h.underflow, 1.0);
        assert_eq!(h.overflow, 1.0);
        assert_eq!(h.entries, 6);
        assert!((h.integral() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_auto_range_contains_extremes() {
        let values = vec![5.0, 7.5, 10.0];
        let h = Histogram1D::auto_range(&values, 5).unwrap();
        assert!((h.integral() - 3.0).abs() < 1e-12);
        assert_eq!(h.overflow, 0.0);
        assert_eq!(h.counts[4], 1.0);
    }

    #[test]
    fn test_auto_range_empty_is_error() {
        assert!(matches!(Histogram1D::auto_range(&[], 10), Err(TofError::EmptyHistogram)));
    }

    #[test]
    fn test_normalize_scales_errors() {
        let mut h = Histogram1D::new(2, 0.0, 2.0).unwrap();
        for _ in 0..4 {
            h.fill(0.5);
        }
        assert!(h.normalize());
        assert!((h.counts[0] - 1.0).abs() < 1e-12);
        // sqrt(4) / 4
        assert!((h.bin_error(0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_bins_in_range_uses_centers() {
        let h = Histogram1D::new(10, 0.0, 10.0).unwrap();
        assert_eq!(h.bins_in_range(2.0, 5.0), 2..5);
        assert_eq!(h.bins_in_range(2.5, 4.5), 2..5);
        assert_eq!(h.bins_in_range(-5.0, -1.0), 0..0);
        assert_eq!(h.bins_in_range(8.0, 50.0), 8..10);
    }

    #[test]
    fn test_position_map_fill() {
        let mut map = Histogram2D::position_map();
        map.fill(0.1, -0.1);
        map.fill(25.0, 0.0);
        assert_eq!(map.get(20, 19), 1.0);
        assert_eq!(map.entries, 2);
        assert!((map.integral() - 1.0).abs() < 1e-12);
    }
}
