use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use tofcore::algorithm::calibration::{CalibrationPairing, ReferenceLine, TofReference};
use tofcore::algorithm::decoder::DecoderConfig;
use tofcore::algorithm::spectral_fit::{PeakInterval, SpectralFitSettings};
use tofcore::data::roles::RoleMap;
use tofcore::physics::constants::{FLIGHT_PATH_MM, MAX_CHANNELS, POSITION_PER_TIME, TICK_TO_NS};
use tofcore::{TofError, TofResult};

use crate::logging::LogConfig;

/// Which spectrum of a detector a fit configuration applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumKind {
    TimeOfFlight,
    PulseHeight,
}

/// Binning of a spectrum before fitting.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramSpec {
    pub bins: usize,
    /// Explicit `(low, high)`; `None` spans the data
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    /// Scale to unit integral before fitting
    #[serde(default)]
    pub normalize: bool,
}

/// Binning and fit windows of one spectrum kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitSpec {
    pub histogram: HistogramSpec,
    pub intervals: Vec<PeakInterval>,
    /// Per-detector interval lists replacing `intervals`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<usize, Vec<PeakInterval>>,
}

impl FitSpec {
    fn from_bounds(bins: usize, bounds: &[(f64, f64)]) -> Self {
        FitSpec {
            histogram: HistogramSpec { bins, range: None, normalize: true },
            intervals: bounds.iter().map(|&(low, high)| PeakInterval::new(low, high)).collect(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn intervals_for(&self, detector: usize) -> &[PeakInterval] {
        self.overrides.get(&detector).unwrap_or(&self.intervals)
    }
}

/// Everything a calibration run needs, loaded from one JSON file.
///
/// Missing sections fall back to the defaults of the 23-detector alpha source
/// setup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub roles: RoleMap,
    pub detector_count: usize,
    pub tick_to_ns: f64,       // ns per timestamp tick
    pub position_per_time: f64, // mm/ns
    pub flight_path_mm: f64,
    pub references: Vec<ReferenceLine>,
    pub tof_reference: TofReference,
    /// Fitted pulse-height peaks left out of the energy calibration
    pub calibration_exclude: Vec<usize>,
    pub tof_fit: FitSpec,
    pub pulse_height_fit: FitSpec,
    pub fitter: SpectralFitSettings,
    pub log: LogConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            roles: RoleMap::default(),
            detector_count: 23,
            tick_to_ns: TICK_TO_NS,
            position_per_time: POSITION_PER_TIME,
            flight_path_mm: FLIGHT_PATH_MM,
            references: vec![
                ReferenceLine::new(4.7758, 1e-5, 4.0),
                ReferenceLine::new(4.93097, 1e-5, 4.0),
                ReferenceLine::new(5.03489, 1e-5, 4.0),
                ReferenceLine::new(5.07841, 1e-5, 4.0),
            ],
            tof_reference: TofReference { peak_index: 2, line_index: 0 },
            calibration_exclude: Vec::new(),
            tof_fit: FitSpec::from_bounds(300, &[(90.0, 103.0), (103.0, 110.0), (110.0, 115.0), (115.0, 122.0)]),
            pulse_height_fit: FitSpec::from_bounds(5500, &[(1046.0, 1126.0), (1126.0, 1224.0), (1224.0, 1282.0), (1282.0, 1350.0)]),
            fitter: SpectralFitSettings::default(),
            log: LogConfig::default(),
        }
    }
}

fn check(condition: bool, message: impl FnOnce() -> String) -> TofResult<()> {
    if condition {
        Ok(())
    } else {
        Err(TofError::InvalidConfig(message()))
    }
}

impl AnalysisConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> TofResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: AnalysisConfig = serde_json::from_reader(reader)
            .map_err(|e| TofError::Serialization(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> TofResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self).map_err(|e| TofError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> TofResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TofError::Serialization(e.to_string()))
    }

    /// Checks internal consistency; overlapping role channels only warn.
    pub fn validate(&self) -> TofResult<()> {
        check(self.detector_count > 0 && self.detector_count <= MAX_CHANNELS, || {
            format!("detector_count must be in 1..={}, got {}", MAX_CHANNELS, self.detector_count)
        })?;
        check(self.tick_to_ns > 0.0, || format!("tick_to_ns must be positive, got {}", self.tick_to_ns))?;
        check(self.flight_path_mm > 0.0, || format!("flight_path_mm must be positive, got {}", self.flight_path_mm))?;
        check(self.references.len() >= 2, || format!("need at least 2 reference lines, got {}", self.references.len()))?;
        check(self.references.iter().all(|r| r.energy_mev > 0.0 && r.mass_amu > 0.0), || {
            "reference lines need positive energy and mass".to_string()
        })?;

        for (kind, spec) in [(SpectrumKind::TimeOfFlight, &self.tof_fit), (SpectrumKind::PulseHeight, &self.pulse_height_fit)] {
            check(spec.histogram.bins > 0, || format!("{:?} histogram needs bins > 0", kind))?;
            if let Some((low, high)) = spec.histogram.range {
                check(high > low, || format!("{:?} histogram range [{}, {}] is empty", kind, low, high))?;
            }
            let lists = std::iter::once(&spec.intervals).chain(spec.overrides.values());
            for intervals in lists {
                check(!intervals.is_empty(), || format!("{:?} fit needs at least one interval", kind))?;
                check(intervals.iter().all(|iv| iv.low < iv.high), || format!("{:?} fit has an interval with low >= high", kind))?;
            }
            for &detector in spec.overrides.keys() {
                check(detector < self.detector_count, || format!("{:?} override for unknown detector {}", kind, detector))?;
            }
        }

        check(self.tof_reference.line_index < self.references.len(), || {
            format!("tof_reference line {} out of {} reference lines", self.tof_reference.line_index, self.references.len())
        })?;
        let tof_peaks = std::iter::once(&self.tof_fit.intervals).chain(self.tof_fit.overrides.values()).map(|v| v.len()).min().unwrap_or(0);
        check(self.tof_reference.peak_index < tof_peaks, || {
            format!("tof_reference peak {} out of {} time-of-flight intervals", self.tof_reference.peak_index, tof_peaks)
        })?;

        for (channel, shadowed) in self.roles.collisions(self.detector_count) {
            warn!(channel, shadowed = ?shadowed, "channel assigned to several roles, first role in MCP, X1, X2, Y1, Y2, detector order wins");
        }
        Ok(())
    }

    pub fn fit_spec(&self, kind: SpectrumKind) -> &FitSpec {
        match kind {
            SpectrumKind::TimeOfFlight => &self.tof_fit,
            SpectrumKind::PulseHeight => &self.pulse_height_fit,
        }
    }

    pub fn intervals_for(&self, detector: usize, kind: SpectrumKind) -> &[PeakInterval] {
        self.fit_spec(kind).intervals_for(detector)
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig { roles: self.roles, detector_count: self.detector_count, tick_to_ns: self.tick_to_ns }
    }

    pub fn pairing(&self) -> CalibrationPairing {
        CalibrationPairing::new(self.calibration_exclude.clone())
    }

    /// Predicted flight time of every reference line, in ns.
    pub fn predicted_reference_tofs(&self) -> Vec<f64> {
        self.references.iter().map(|r| r.predicted_tof(self.flight_path_mm)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AnalysisConfig::default();
        config.validate().unwrap();
        assert_eq!(config.detector_count, 23);
        assert_eq!(config.roles.mcp, 28);
        assert_eq!(config.intervals_for(0, SpectrumKind::PulseHeight).len(), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AnalysisConfig = serde_json::from_str(r#"{"detector_count": 4, "flight_path_mm": 250.0}"#).unwrap();
        assert_eq!(config.detector_count, 4);
        assert_eq!(config.flight_path_mm, 250.0);
        assert_eq!(config.references.len(), 4);
        assert!((config.tick_to_ns - 0.390625e-3).abs() < 1e-18);
    }

    #[test]
    fn test_overrides_replace_intervals() {
        let mut config = AnalysisConfig::default();
        config.pulse_height_fit.overrides.insert(20, vec![PeakInterval::new(980.0, 1043.0), PeakInterval::new(1043.0, 1098.0)]);
        config.validate().unwrap();
        assert_eq!(config.intervals_for(20, SpectrumKind::PulseHeight)[0].low, 980.0);
        assert_eq!(config.intervals_for(19, SpectrumKind::PulseHeight)[0].low, 1046.0);

        let json = config.to_json().unwrap();
        let back: AnalysisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pulse_height_fit.overrides.len(), 1);
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let bad = AnalysisConfig { detector_count: 300, ..Default::default() };
        assert!(matches!(bad.validate(), Err(TofError::InvalidConfig(_))));

        let bad = AnalysisConfig { tof_reference: TofReference { peak_index: 9, line_index: 0 }, ..Default::default() };
        assert!(bad.validate().is_err());

        let mut bad = AnalysisConfig::default();
        bad.tof_fit.intervals[1] = PeakInterval::new(110.0, 103.0);
        assert!(bad.validate().is_err());

        let bad = AnalysisConfig { references: vec![ReferenceLine::new(5.0, 0.0, 4.0)], ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("tofdf_config_{}.json", std::process::id()));
        let config = AnalysisConfig { detector_count: 8, ..Default::default() };
        config.save(&path).unwrap();
        let loaded = AnalysisConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
