use bincode::{Decode, Encode};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algorithm::calibration::CalibrationModel;
use crate::data::measurement::MeasurementTable;
use crate::physics::kinematics::mass_from_energy_and_tof;

/// Calibrated observables of one detector measurement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CalibratedEvent {
    pub energy: f64, // MeV
    pub tof: f64,    // ns
    pub mass: f64,   // amu
}

/// Converts a pulse height and raw time of flight into energy, corrected flight time and mass.
///
/// # Arguments
///
/// * `pulse_height` - detector charge
/// * `raw_time_of_flight` - decoded time of flight in ns
/// * `model` - calibration of the detector the measurement belongs to
/// * `flight_path_mm` - flight path length in mm
///
/// # Returns
///
/// * `CalibratedEvent`; energies <= 0 yield masses <= 0 rather than an error
///
pub fn derive(pulse_height: f64, raw_time_of_flight: f64, model: &CalibrationModel, flight_path_mm: f64) -> CalibratedEvent {
    let energy = model.energy(pulse_height);
    let tof = raw_time_of_flight - model.time_offset;
    CalibratedEvent { energy, tof, mass: mass_from_energy_and_tof(energy, tof, flight_path_mm) }
}

/// Applies `derive` to every row of a detector's table, in row order.
pub fn derive_table(table: &MeasurementTable, model: &CalibrationModel, flight_path_mm: f64) -> Vec<CalibratedEvent> {
    table
        .rows
        .par_iter()
        .map(|m| derive(m.pulse_height, m.time_of_flight, model, flight_path_mm))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::measurement::DetectorMeasurement;
    use crate::physics::kinematics::predicted_time_of_flight;

    fn identity() -> CalibrationModel {
        CalibrationModel { slope: 1.0, intercept: 0.0, ..Default::default() }
    }

    #[test]
    fn test_reference_values() {
        // (c * 30e-9 / 0.5)^2 * 2 * 5 / 931.494
        let event = derive(5.0, 30.0, &identity(), 500.0);
        assert_eq!(event.energy, 5.0);
        assert_eq!(event.tof, 30.0);
        assert!((event.mass - 3.4735).abs() < 1e-3);
    }

    #[test]
    fn test_inverts_predicted_tof() {
        let model = CalibrationModel { slope: 0.004, slope_error: 0.0, intercept: 0.6, intercept_error: 0.0, time_offset: 7.5 };
        let energy = 5.0;
        let pulse_height = (energy - model.intercept) / model.slope;
        let raw_tof = predicted_time_of_flight(energy, 4.0, 500.0) + model.time_offset;

        let event = derive(pulse_height, raw_tof, &model, 500.0);
        assert!((event.energy - energy).abs() < 1e-12);
        assert!((event.mass - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_flight_path_gives_zero_mass() {
        assert_eq!(derive(5.0, 30.0, &identity(), 0.0).mass, 0.0);
    }

    #[test]
    fn test_nonpositive_energy_is_not_an_error() {
        let event = derive(-1.0, 30.0, &identity(), 500.0);
        assert!(event.mass < 0.0);
    }

    #[test]
    fn test_table_order_is_preserved() {
        let mut table = MeasurementTable::new(3);
        for i in 0..50 {
            table.push(DetectorMeasurement {
                detector_index: 3,
                time_difference_x: 0.0,
                time_difference_y: 0.0,
                time_of_flight: 30.0 + i as f64,
                pulse_height: 5.0,
                pulse_height_mcp: 0.0,
                pulse_height_x1: 0.0,
                pulse_height_x2: 0.0,
                pulse_height_y1: 0.0,
                pulse_height_y2: 0.0,
            });
        }
        let events = derive_table(&table, &identity(), 500.0);
        assert_eq!(events.len(), 50);
        assert!(events.windows(2).all(|w| w[0].tof < w[1].tof));
    }
}
