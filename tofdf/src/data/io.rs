use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use tofcore::algorithm::mass::CalibratedEvent;
use tofcore::data::measurement::MeasurementSet;
use tofcore::{TofError, TofResult};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

fn serialization<E: std::fmt::Display>(e: E) -> TofError {
    TofError::Serialization(e.to_string())
}

// --- JSON (human-readable) ---
pub fn save_measurements_json(path: &Path, set: &MeasurementSet) -> TofResult<()> {
    let f = BufWriter::new(File::create(path)?);
    serde_json::to_writer(f, set).map_err(serialization)
}

pub fn load_measurements_json(path: &Path) -> TofResult<MeasurementSet> {
    let f = BufReader::new(File::open(path)?);
    serde_json::from_reader(f).map_err(serialization)
}

// --- Bincode + optional zstd compression ---
pub fn save_measurements_bincode(path: &Path, set: &MeasurementSet, compress: bool) -> TofResult<()> {
    let f = File::create(path)?;
    let config = bincode::config::standard();
    if compress {
        let mut zw = zstd::Encoder::new(f, 3)?;
        bincode::encode_into_std_write(set, &mut zw, config).map_err(serialization)?;
        zw.finish()?;
    } else {
        let mut bw = BufWriter::new(f);
        bincode::encode_into_std_write(set, &mut bw, config).map_err(serialization)?;
        bw.flush()?;
    }
    Ok(())
}

/// Loads a bincode measurement file, compressed or not.
pub fn load_measurements_bincode(path: &Path) -> TofResult<MeasurementSet> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 4];
    let compressed = f.read_exact(&mut magic).is_ok() && magic == ZSTD_MAGIC;
    f.seek(SeekFrom::Start(0))?;

    let config = bincode::config::standard();
    if compressed {
        let mut zr = zstd::Decoder::new(f)?;
        bincode::decode_from_std_read(&mut zr, config).map_err(serialization)
    } else {
        let mut br = BufReader::new(f);
        bincode::decode_from_std_read(&mut br, config).map_err(serialization)
    }
}

/// Saves by extension: `.json` as JSON, `.zst` as compressed bincode, anything else as bincode.
pub fn save_measurements(path: &Path, set: &MeasurementSet) -> TofResult<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => save_measurements_json(path, set),
        Some("zst") => save_measurements_bincode(path, set, true),
        _ => save_measurements_bincode(path, set, false),
    }
}

pub fn load_measurements(path: &Path) -> TofResult<MeasurementSet> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => load_measurements_json(path),
        _ => load_measurements_bincode(path),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub detector: usize,
    pub time_difference_x: f64,
    pub time_difference_y: f64,
    pub position_x_mm: f64,
    pub position_y_mm: f64,
    pub time_of_flight: f64,
    pub pulse_height: f64,
    pub pulse_height_mcp: f64,
    pub pulse_height_x1: f64,
    pub pulse_height_x2: f64,
    pub pulse_height_y1: f64,
    pub pulse_height_y2: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibratedRow {
    pub detector: usize,
    pub energy_mev: f64,
    pub tof_ns: f64,
    pub mass_amu: f64,
}

/// Flat table of every measurement, with positions in mm.
pub fn write_measurements_csv<W: Write>(writer: W, set: &MeasurementSet, position_per_time: f64) -> TofResult<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for m in set.tables.iter().flat_map(|t| t.iter()) {
        let (position_x_mm, position_y_mm) = m.position(position_per_time);
        wtr.serialize(MeasurementRow {
            detector: m.detector_index,
            time_difference_x: m.time_difference_x,
            time_difference_y: m.time_difference_y,
            position_x_mm,
            position_y_mm,
            time_of_flight: m.time_of_flight,
            pulse_height: m.pulse_height,
            pulse_height_mcp: m.pulse_height_mcp,
            pulse_height_x1: m.pulse_height_x1,
            pulse_height_x2: m.pulse_height_x2,
            pulse_height_y1: m.pulse_height_y1,
            pulse_height_y2: m.pulse_height_y2,
        })
        .map_err(serialization)?;
    }
    wtr.flush()?;
    Ok(())
}

/// One `(energy, tof, mass)` row per calibrated measurement, grouped by detector.
pub fn write_calibrated_csv<'a, W, I>(writer: W, detectors: I) -> TofResult<usize>
where
    W: Write,
    I: IntoIterator<Item = (usize, &'a [CalibratedEvent])>,
{
    let mut wtr = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for (detector, events) in detectors {
        for e in events {
            wtr.serialize(CalibratedRow { detector, energy_mev: e.energy, tof_ns: e.tof, mass_amu: e.mass })
                .map_err(serialization)?;
            rows += 1;
        }
    }
    wtr.flush()?;
    Ok(rows)
}

pub fn read_calibrated_csv<R: Read>(reader: R) -> TofResult<Vec<CalibratedRow>> {
    csv::Reader::from_reader(reader)
        .deserialize()
        .collect::<Result<Vec<CalibratedRow>, _>>()
        .map_err(serialization)
}
