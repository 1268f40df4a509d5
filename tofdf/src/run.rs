use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use tofcore::algorithm::calibration::{CalibrationModel, EnergyCalibrator};
use tofcore::algorithm::decoder::{CoincidenceDecoder, DecodeStats};
use tofcore::algorithm::mass::{derive_table, CalibratedEvent};
use tofcore::algorithm::spectral_fit::{SpectralFitter, SpectrumFit};
use tofcore::data::histogram::{Histogram1D, Histogram2D};
use tofcore::data::hit::ChannelEvent;
use tofcore::data::measurement::{MeasurementSet, MeasurementTable};
use tofcore::{TofError, TofResult};

use crate::config::{AnalysisConfig, HistogramSpec, SpectrumKind};

/// Calibration products of one detector.
#[derive(Clone, Debug)]
pub struct DetectorCalibration {
    pub detector_index: usize,
    pub tof_fit: SpectrumFit,
    pub pulse_height_fit: SpectrumFit,
    pub model: CalibrationModel,
    pub events: Vec<CalibratedEvent>,
    pub hit_map: Histogram2D,
}

#[derive(Debug)]
pub enum DetectorOutcome {
    Calibrated(Box<DetectorCalibration>),
    Failed { detector_index: usize, error: TofError },
}

impl DetectorOutcome {
    pub fn detector_index(&self) -> usize {
        match self {
            DetectorOutcome::Calibrated(c) => c.detector_index,
            DetectorOutcome::Failed { detector_index, .. } => *detector_index,
        }
    }

    pub fn calibration(&self) -> Option<&DetectorCalibration> {
        match self {
            DetectorOutcome::Calibrated(c) => Some(c),
            DetectorOutcome::Failed { .. } => None,
        }
    }
}

/// Serializable digest of a run, written next to the calibrated tables.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub decode: DecodeStats,
    pub flight_path_mm: f64,
    pub predicted_reference_tofs: Vec<f64>,
    pub detectors: Vec<DetectorSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DetectorSummary {
    pub detector_index: usize,
    pub calibrated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<CalibrationModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tof_centroids: Vec<(f64, f64)>,
    pub pulse_height_centroids: Vec<(f64, f64)>,
    pub events: usize,
    pub mean_mass_amu: Option<f64>,
}

/// Result of decoding plus calibrating one batch of events.
#[derive(Debug)]
pub struct RunReport {
    pub stats: DecodeStats,
    pub outcomes: Vec<DetectorOutcome>,
}

impl RunReport {
    pub fn calibrated(&self) -> impl Iterator<Item = &DetectorCalibration> {
        self.outcomes.iter().filter_map(|o| o.calibration())
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.calibration().is_none()).count()
    }

    pub fn summary(&self, config: &AnalysisConfig) -> RunSummary {
        let detectors = self
            .outcomes
            .iter()
            .map(|outcome| match outcome {
                DetectorOutcome::Calibrated(c) => {
                    let centroids = |fit: &SpectrumFit| fit.peaks.iter().map(|p| (p.centroid, p.centroid_error)).collect();
                    let mean_mass = if c.events.is_empty() {
                        None
                    } else {
                        Some(c.events.iter().map(|e| e.mass).sum::<f64>() / c.events.len() as f64)
                    };
                    DetectorSummary {
                        detector_index: c.detector_index,
                        calibrated: true,
                        model: Some(c.model),
                        error: None,
                        tof_centroids: centroids(&c.tof_fit),
                        pulse_height_centroids: centroids(&c.pulse_height_fit),
                        events: c.events.len(),
                        mean_mass_amu: mean_mass,
                    }
                }
                DetectorOutcome::Failed { detector_index, error } => DetectorSummary {
                    detector_index: *detector_index,
                    calibrated: false,
                    model: None,
                    error: Some(error.to_string()),
                    tof_centroids: Vec::new(),
                    pulse_height_centroids: Vec::new(),
                    events: 0,
                    mean_mass_amu: None,
                },
            })
            .collect();

        RunSummary {
            decode: self.stats,
            flight_path_mm: config.flight_path_mm,
            predicted_reference_tofs: config.predicted_reference_tofs(),
            detectors,
        }
    }
}

/// Per-run context: configuration plus the stage objects built from it.
pub struct AnalysisRun<'a> {
    config: &'a AnalysisConfig,
    decoder: CoincidenceDecoder,
    fitter: SpectralFitter,
    calibrator: EnergyCalibrator,
}

fn spectrum(values: &[f64], spec: &HistogramSpec) -> TofResult<Histogram1D> {
    let mut hist = Histogram1D::from_values(values, spec.bins, spec.range)?;
    if spec.normalize && !hist.normalize() {
        return Err(TofError::EmptyHistogram);
    }
    Ok(hist)
}

impl<'a> AnalysisRun<'a> {
    pub fn new(config: &'a AnalysisConfig) -> TofResult<Self> {
        config.validate()?;
        Ok(AnalysisRun {
            config,
            decoder: CoincidenceDecoder::new(config.decoder_config())?,
            fitter: SpectralFitter::new(config.fitter),
            calibrator: EnergyCalibrator::default(),
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        self.config
    }

    pub fn decode(&self, events: &[ChannelEvent]) -> (MeasurementSet, DecodeStats) {
        let (set, stats) = self.decoder.decode_all(events);
        info!(
            events = stats.events,
            complete = stats.complete_events,
            measurements = stats.measurements,
            malformed = stats.malformed_events,
            duplicates = stats.duplicate_hits,
            "decoded events"
        );
        (set, stats)
    }

    /// Time-of-flight fit, offset, pulse-height fit, energy calibration and mass
    /// derivation for one detector.
    pub fn calibrate_detector(&self, table: &MeasurementTable) -> TofResult<DetectorCalibration> {
        let config = self.config;
        let detector = table.detector_index;
        if table.is_empty() {
            return Err(TofError::EmptyHistogram);
        }

        let tof_hist = spectrum(&table.times_of_flight(), &config.tof_fit.histogram)?;
        let tof_fit = self.fitter.fit_spectrum(&tof_hist, config.intervals_for(detector, SpectrumKind::TimeOfFlight))?;
        let time_offset = config.tof_reference.time_offset(&tof_fit.peaks, &config.references, config.flight_path_mm)?;

        let ph_hist = spectrum(&table.pulse_heights(), &config.pulse_height_fit.histogram)?;
        let pulse_height_fit = self.fitter.fit_spectrum(&ph_hist, config.intervals_for(detector, SpectrumKind::PulseHeight))?;
        let (centroids, energies) = config.pairing().pair(&pulse_height_fit.peaks, &config.references)?;
        let model = self.calibrator.calibrate(&centroids, &energies)?.with_time_offset(time_offset);
        debug!(slope = model.slope, intercept = model.intercept, time_offset, "detector calibrated");

        let events = derive_table(table, &model, config.flight_path_mm);
        let mut hit_map = Histogram2D::position_map();
        for (x, y) in table.positions(config.position_per_time) {
            hit_map.fill(x, y);
        }

        Ok(DetectorCalibration { detector_index: detector, tof_fit, pulse_height_fit, model, events, hit_map })
    }

    /// Calibrates every detector in parallel; a failing detector does not affect the others.
    pub fn calibrate(&self, set: &MeasurementSet) -> Vec<DetectorOutcome> {
        set.tables
            .par_iter()
            .map(|table| {
                let span = info_span!("detector", index = table.detector_index, rows = table.len());
                let _enter = span.enter();
                match self.calibrate_detector(table) {
                    Ok(calibration) => DetectorOutcome::Calibrated(Box::new(calibration)),
                    Err(error) => {
                        warn!(%error, "detector calibration failed");
                        DetectorOutcome::Failed { detector_index: table.detector_index, error }
                    }
                }
            })
            .collect()
    }

    pub fn execute(&self, events: &[ChannelEvent]) -> RunReport {
        let (set, stats) = self.decode(events);
        let outcomes = self.calibrate(&set);
        let report = RunReport { stats, outcomes };
        info!(detectors = report.outcomes.len(), failed = report.failures(), "run finished");
        report
    }
}
