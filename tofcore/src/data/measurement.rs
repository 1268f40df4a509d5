use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Observables of one detector in one complete coincidence event.
///
/// # Fields
///
/// * `detector_index` - 0-based detector index
/// * `time_difference_x` - X1 - X2 delay-line time difference in ns
/// * `time_difference_y` - Y1 - Y2 delay-line time difference in ns
/// * `time_of_flight` - detector - MCP time difference in ns
/// * `pulse_height` - long-gate charge of the detector hit
/// * `pulse_height_mcp` .. `pulse_height_y2` - long-gate charges of the auxiliary hits
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct DetectorMeasurement {
    pub detector_index: usize,
    pub time_difference_x: f64,
    pub time_difference_y: f64,
    pub time_of_flight: f64,
    pub pulse_height: f64,
    pub pulse_height_mcp: f64,
    pub pulse_height_x1: f64,
    pub pulse_height_x2: f64,
    pub pulse_height_y1: f64,
    pub pulse_height_y2: f64,
}

impl DetectorMeasurement {
    /// Hit position on the delay-line anode in mm.
    ///
    /// # Arguments
    ///
    /// * `position_per_time` - scale constant in mm/ns
    ///
    pub fn position(&self, position_per_time: f64) -> (f64, f64) {
        (self.time_difference_x * position_per_time, self.time_difference_y * position_per_time)
    }
}

/// Append-only collection of measurements belonging to one detector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MeasurementTable {
    pub detector_index: usize,
    pub rows: Vec<DetectorMeasurement>,
}

impl MeasurementTable {
    pub fn new(detector_index: usize) -> Self {
        MeasurementTable { detector_index, rows: Vec::new() }
    }

    pub fn push(&mut self, measurement: DetectorMeasurement) {
        debug_assert_eq!(measurement.detector_index, self.detector_index);
        self.rows.push(measurement);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectorMeasurement> {
        self.rows.iter()
    }

    pub fn pulse_heights(&self) -> Vec<f64> {
        self.rows.iter().map(|m| m.pulse_height).collect()
    }

    pub fn times_of_flight(&self) -> Vec<f64> {
        self.rows.iter().map(|m| m.time_of_flight).collect()
    }

    pub fn positions(&self, position_per_time: f64) -> Vec<(f64, f64)> {
        self.rows.iter().map(|m| m.position(position_per_time)).collect()
    }
}

/// Measurement tables of one analysis run, one per detector index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MeasurementSet {
    pub tables: Vec<MeasurementTable>,
}

impl MeasurementSet {
    pub fn new(detector_count: usize) -> Self {
        MeasurementSet {
            tables: (0..detector_count).map(MeasurementTable::new).collect(),
        }
    }

    pub fn detector_count(&self) -> usize {
        self.tables.len()
    }

    /// Appends a measurement to its detector's table; out-of-range indices are dropped.
    pub fn route(&mut self, measurement: DetectorMeasurement) -> bool {
        match self.tables.get_mut(measurement.detector_index) {
            Some(table) => {
                table.push(measurement);
                true
            }
            None => false,
        }
    }

    pub fn table(&self, detector_index: usize) -> Option<&MeasurementTable> {
        self.tables.get(detector_index)
    }

    pub fn total(&self) -> usize {
        self.tables.iter().map(|t| t.len()).sum()
    }

    /// Appends every table of `other` after the rows already held, keeping event order.
    pub fn append(&mut self, other: MeasurementSet) {
        if self.tables.len() < other.tables.len() {
            let start = self.tables.len();
            self.tables.extend((start..other.tables.len()).map(MeasurementTable::new));
        }
        for (table, incoming) in self.tables.iter_mut().zip(other.tables) {
            table.rows.extend(incoming.rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(detector_index: usize, tof: f64) -> DetectorMeasurement {
        DetectorMeasurement {
            detector_index,
            time_difference_x: 3.0,
            time_difference_y: -1.5,
            time_of_flight: tof,
            pulse_height: 1200.0,
            pulse_height_mcp: 10.0,
            pulse_height_x1: 11.0,
            pulse_height_x2: 12.0,
            pulse_height_y1: 13.0,
            pulse_height_y2: 14.0,
        }
    }

    #[test]
    fn test_position_scales_time_differences() {
        let (x, y) = measurement(0, 1.0).position(2.0);
        assert!((x - 6.0).abs() < 1e-12);
        assert!((y + 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_route_and_append_keep_order() {
        let mut first = MeasurementSet::new(2);
        assert!(first.route(measurement(1, 1.0)));
        assert!(!first.route(measurement(5, 1.0)));

        let mut second = MeasurementSet::new(2);
        second.route(measurement(1, 2.0));
        second.route(measurement(0, 3.0));

        first.append(second);
        assert_eq!(first.total(), 3);
        assert_eq!(first.table(1).unwrap().times_of_flight(), vec![1.0, 2.0]);
        assert_eq!(first.table(0).unwrap().len(), 1);
    }
}
