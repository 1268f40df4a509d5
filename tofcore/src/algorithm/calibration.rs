use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::spectral_fit::PeakFit;
use crate::error::{TofError, TofResult};
use crate::physics::kinematics::predicted_time_of_flight;

/// Known emission line used as a calibration reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLine {
    pub energy_mev: f64,
    pub energy_error: f64,
    pub mass_amu: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ReferenceLine {
    pub fn new(energy_mev: f64, energy_error: f64, mass_amu: f64) -> Self {
        ReferenceLine { energy_mev, energy_error, mass_amu, label: None }
    }

    /// Expected flight time of this line's particle over `flight_path_mm`.
    pub fn predicted_tof(&self, flight_path_mm: f64) -> f64 {
        predicted_time_of_flight(self.energy_mev, self.mass_amu, flight_path_mm)
    }
}

/// Linear pulse-height to energy map plus the time-of-flight offset of one detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CalibrationModel {
    pub slope: f64,
    pub slope_error: f64,
    pub intercept: f64,
    pub intercept_error: f64,
    /// Subtracted from the raw time of flight, in ns
    pub time_offset: f64,
}

impl CalibrationModel {
    pub fn energy(&self, pulse_height: f64) -> f64 {
        pulse_height * self.slope + self.intercept
    }

    pub fn with_time_offset(mut self, time_offset: f64) -> Self {
        self.time_offset = time_offset;
        self
    }
}

/// Explicit selection of which fitted peaks take part in the energy calibration.
///
/// Peaks listed in `excluded_peaks` (e.g. an unresolved doublet component) are
/// dropped before the remaining ones are matched index by index to the
/// reference lines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationPairing {
    pub excluded_peaks: Vec<usize>,
}

impl CalibrationPairing {
    pub fn new(excluded_peaks: Vec<usize>) -> Self {
        CalibrationPairing { excluded_peaks }
    }

    /// Returns `(centroid, centroid_error)` and `(energy, energy_error)` pairs.
    pub fn pair(&self, fits: &[PeakFit], references: &[ReferenceLine]) -> TofResult<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        let centroids: Vec<(f64, f64)> = fits
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.excluded_peaks.contains(i))
            .map(|(_, f)| (f.centroid, f.centroid_error))
            .collect();

        if centroids.len() != references.len() {
            return Err(TofError::CalibrationMismatch { centroids: centroids.len(), references: references.len() });
        }
        let energies = references.iter().map(|r| (r.energy_mev, r.energy_error)).collect();
        Ok((centroids, energies))
    }
}

/// Straight-line fit `energy = slope * pulse_height + intercept`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub slope_error: f64,
    pub intercept: f64,
    pub intercept_error: f64,
    pub chi2: f64,
    pub ndf: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyCalibrator {
    /// Effective-variance iterations when centroid errors are present
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for EnergyCalibrator {
    fn default() -> Self {
        EnergyCalibrator { max_iterations: 50, tolerance: 1e-12 }
    }
}

fn ordinary_least_squares(x: &[f64], y: &[f64]) -> TofResult<LinearFit> {
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|xi| (xi - x_mean).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - x_mean) * (yi - y_mean)).sum();
    if sxx == 0.0 {
        return Err(TofError::LinearFit("all pulse-height centroids are identical".to_string()));
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let ssr: f64 = x.iter().zip(y).map(|(xi, yi)| (yi - intercept - slope * xi).powi(2)).sum();
    let ndf = x.len() - 2;
    let s2 = if ndf > 0 { ssr / ndf as f64 } else { 0.0 };

    Ok(LinearFit {
        slope,
        slope_error: (s2 / sxx).sqrt(),
        intercept,
        intercept_error: (s2 * (1.0 / n + x_mean * x_mean / sxx)).sqrt(),
        chi2: ssr,
        ndf,
    })
}

fn weighted_least_squares(x: &[f64], y: &[f64], w: &[f64]) -> TofResult<LinearFit> {
    let (mut s, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for ((&xi, &yi), &wi) in x.iter().zip(y).zip(w) {
        s += wi;
        sx += wi * xi;
        sy += wi * yi;
        sxx += wi * xi * xi;
        sxy += wi * xi * yi;
    }
    let delta = s * sxx - sx * sx;
    if !(delta.abs() > 0.0) || !delta.is_finite() {
        return Err(TofError::LinearFit("singular normal equations".to_string()));
    }

    let slope = (s * sxy - sx * sy) / delta;
    let intercept = (sxx * sy - sx * sxy) / delta;
    let chi2 = x.iter().zip(y).zip(w).map(|((xi, yi), wi)| wi * (yi - intercept - slope * xi).powi(2)).sum();

    Ok(LinearFit {
        slope,
        slope_error: (s / delta).sqrt(),
        intercept,
        intercept_error: (sxx / delta).sqrt(),
        chi2,
        ndf: x.len() - 2,
    })
}

impl EnergyCalibrator {
    /// Fits energy against pulse-height centroid.
    ///
    /// # Arguments
    ///
    /// * `centroids` - `(pulse_height_centroid, error)` per calibration peak
    /// * `references` - `(energy_mev, error)` matched by index
    ///
    /// # Returns
    ///
    /// * `LinearFit`; weighted by the effective variance `sigma_E^2 + slope^2 sigma_ph^2`
    ///   when every point has one, ordinary least squares when all errors are zero
    ///
    pub fn fit_line(&self, centroids: &[(f64, f64)], references: &[(f64, f64)]) -> TofResult<LinearFit> {
        if centroids.len() != references.len() {
            return Err(TofError::CalibrationMismatch { centroids: centroids.len(), references: references.len() });
        }
        if centroids.len() < 2 {
            return Err(TofError::LinearFit(format!("{} calibration points, need at least 2", centroids.len())));
        }

        let x: Vec<f64> = centroids.iter().map(|c| c.0).collect();
        let y: Vec<f64> = references.iter().map(|r| r.0).collect();
        if x.iter().chain(&y).any(|v| !v.is_finite()) {
            return Err(TofError::LinearFit("non-finite calibration point".to_string()));
        }

        let mut fit = ordinary_least_squares(&x, &y)?;
        let weighted = centroids
            .iter()
            .zip(references)
            .all(|(c, r)| r.1 > 0.0 || c.1 > 0.0);
        if !weighted {
            return Ok(fit);
        }

        for _ in 0..self.max_iterations {
            let w: Vec<f64> = centroids
                .iter()
                .zip(references)
                .map(|(c, r)| 1.0 / (r.1 * r.1 + fit.slope * fit.slope * c.1 * c.1))
                .collect();
            let next = weighted_least_squares(&x, &y, &w)?;
            let change = (next.slope - fit.slope).abs();
            fit = next;
            if change <= self.tolerance * fit.slope.abs() {
                break;
            }
        }
        Ok(fit)
    }

    /// Calibration model with zero time offset; see [`CalibrationModel::with_time_offset`].
    pub fn calibrate(&self, centroids: &[(f64, f64)], references: &[(f64, f64)]) -> TofResult<CalibrationModel> {
        let fit = self.fit_line(centroids, references)?;
        debug!(slope = fit.slope, intercept = fit.intercept, chi2 = fit.chi2, "energy calibration");
        Ok(CalibrationModel {
            slope: fit.slope,
            slope_error: fit.slope_error,
            intercept: fit.intercept,
            intercept_error: fit.intercept_error,
            time_offset: 0.0,
        })
    }
}

/// Which fitted time-of-flight peak corresponds to which reference line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TofReference {
    pub peak_index: usize,
    pub line_index: usize,
}

impl TofReference {
    /// Offset between the fitted centroid of the reference peak and its predicted flight time.
    pub fn time_offset(&self, tof_fits: &[PeakFit], references: &[ReferenceLine], flight_path_mm: f64) -> TofResult<f64> {
        let fit = tof_fits.get(self.peak_index).ok_or_else(|| {
            TofError::InvalidConfig(format!("time-of-flight reference peak {} of {} fitted", self.peak_index, tof_fits.len()))
        })?;
        let line = references.get(self.line_index).ok_or_else(|| {
            TofError::InvalidConfig(format!("time-of-flight reference line {} of {} configured", self.line_index, references.len()))
        })?;
        Ok(time_offset(fit.centroid, line, flight_path_mm))
    }
}

/// `fitted_centroid - predicted_tof(reference)`.
pub fn time_offset(fitted_centroid: f64, reference: &ReferenceLine, flight_path_mm: f64) -> f64 {
    fitted_centroid - reference.predicted_tof(flight_path_mm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit_at(centroid: f64) -> PeakFit {
        PeakFit { amplitude: 1.0, amplitude_error: 0.1, centroid, centroid_error: 0.5, sigma: 3.0, sigma_error: 0.1 }
    }

    #[test]
    fn test_collinear_points_exact_without_errors() {
        let centroids: Vec<(f64, f64)> = [1046.0, 1150.0, 1260.0, 1320.0].iter().map(|&x| (x, 0.0)).collect();
        let references: Vec<(f64, f64)> = centroids.iter().map(|c| (0.004 * c.0 + 0.6, 0.0)).collect();
        let model = EnergyCalibrator::default().calibrate(&centroids, &references).unwrap();
        assert!((model.slope - 0.004).abs() < 1e-14);
        assert!((model.intercept - 0.6).abs() < 1e-10);
        assert!(model.slope_error < 1e-12);
        assert!(model.intercept_error < 1e-9);
    }

    #[test]
    fn test_weighted_fit_exact_on_collinear_points() {
        let centroids: Vec<(f64, f64)> = [1046.0, 1150.0, 1260.0, 1320.0].iter().map(|&x| (x, 0.3)).collect();
        let references: Vec<(f64, f64)> = centroids.iter().map(|c| (0.004 * c.0 + 0.6, 1e-5)).collect();
        let fit = EnergyCalibrator::default().fit_line(&centroids, &references).unwrap();
        assert!((fit.slope - 0.004).abs() < 1e-12);
        assert!((fit.intercept - 0.6).abs() < 1e-9);
        assert!(fit.chi2 < 1e-12);
        assert!(fit.slope_error > 0.0 && fit.slope_error < 1e-4);
        assert_eq!(fit.ndf, 2);
    }

    #[test]
    fn test_weighted_fit_prefers_precise_points() {
        let centroids = vec![(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 0.0)];
        let references = vec![(0.0, 0.01), (1.0, 0.01), (2.5, 10.0), (3.0, 0.01)];
        let fit = EnergyCalibrator::default().fit_line(&centroids, &references).unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_count_mismatch() {
        let err = EnergyCalibrator::default().calibrate(&[(1.0, 0.0)], &[(1.0, 0.0), (2.0, 0.0)]).unwrap_err();
        assert!(matches!(err, TofError::CalibrationMismatch { centroids: 1, references: 2 }));
    }

    #[test]
    fn test_degenerate_centroids() {
        let err = EnergyCalibrator::default().calibrate(&[(5.0, 0.0), (5.0, 0.0)], &[(1.0, 0.0), (2.0, 0.0)]).unwrap_err();
        assert!(matches!(err, TofError::LinearFit(_)));
    }

    #[test]
    fn test_pairing_skips_excluded_peak() {
        let fits = vec![fit_at(100.0), fit_at(110.0), fit_at(120.0), fit_at(130.0)];
        let references = vec![ReferenceLine::new(5.0, 0.0, 4.0), ReferenceLine::new(5.2, 0.0, 4.0), ReferenceLine::new(5.3, 0.0, 4.0)];

        let (centroids, energies) = CalibrationPairing::new(vec![1]).pair(&fits, &references).unwrap();
        assert_eq!(centroids.iter().map(|c| c.0).collect::<Vec<_>>(), vec![100.0, 120.0, 130.0]);
        assert_eq!(energies[2].0, 5.3);

        let err = CalibrationPairing::default().pair(&fits, &references).unwrap_err();
        assert!(matches!(err, TofError::CalibrationMismatch { centroids: 4, references: 3 }));
    }

    #[test]
    fn test_time_offset_against_prediction() {
        let line = ReferenceLine::new(4.7758, 1e-5, 4.0);
        let predicted = line.predicted_tof(500.0);
        let fits = vec![fit_at(10.0), fit_at(20.0), fit_at(predicted + 12.5)];
        let offset = TofReference { peak_index: 2, line_index: 0 }.time_offset(&fits, &[line.clone()], 500.0).unwrap();
        assert!((offset - 12.5).abs() < 1e-9);

        let bad = TofReference { peak_index: 5, line_index: 0 }.time_offset(&fits, &[line], 500.0);
        assert!(bad.is_err());
    }
}
