use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Cursor, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tofcore::data::hit::{ChannelEvent, ChannelHit};
use tofcore::{TofError, TofResult};

/// Size of one binary hit record in bytes.
pub const RECORD_SIZE: usize = 16;

/// On-disk layout of a raw event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    /// One JSON `ChannelEvent` per line
    Jsonl,
    /// Little-endian 16-byte hit records
    Binary,
}

impl EventFormat {
    /// Guesses the format from the file extension; anything but `.jsonl`/`.json` is binary.
    pub fn from_path(path: &Path) -> EventFormat {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") | Some("json") => EventFormat::Jsonl,
            _ => EventFormat::Binary,
        }
    }
}

/// Reads one `ChannelEvent` per non-empty line.
pub struct JsonLinesReader<R: BufRead> {
    lines: std::io::Lines<R>,
    line_number: usize,
}

impl<R: BufRead> JsonLinesReader<R> {
    pub fn new(reader: R) -> Self {
        JsonLinesReader { lines: reader.lines(), line_number: 0 }
    }
}

impl<R: BufRead> Iterator for JsonLinesReader<R> {
    type Item = TofResult<ChannelEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<ChannelEvent>(&line)
                .map_err(|e| TofError::RawRecord(format!("line {}: {}", self.line_number, e)))
                .and_then(|event| event.validate().map(|_| event));
            return Some(parsed);
        }
    }
}

/// Reads coincidence groups from a stream of binary hit records.
///
/// # Record layout (little endian)
///
/// * `u64` timestamp in ticks
/// * `u16` short-gate charge
/// * `u16` long-gate charge
/// * `u16` baseline
/// * `u8` channel id
/// * `u8` coincidence group counter, the number of records in this record's group
///
/// A group is the counter's value of consecutive records, which must all carry
/// the same counter.
pub struct BinaryEventReader<R: Read> {
    reader: R,
    records: usize,
}

impl<R: Read> BinaryEventReader<R> {
    pub fn new(reader: R) -> Self {
        BinaryEventReader { reader, records: 0 }
    }

    fn read_record(&mut self) -> TofResult<Option<(ChannelHit, u8)>> {
        let mut buf = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < RECORD_SIZE {
            return Err(TofError::RawRecord(format!("record {} truncated to {} of {} bytes", self.records, filled, RECORD_SIZE)));
        }
        self.records += 1;

        let mut rdr = Cursor::new(&buf[..]);
        let timestamp = rdr.read_u64::<LittleEndian>()?;
        let charge_short = rdr.read_u16::<LittleEndian>()?;
        let charge_long = rdr.read_u16::<LittleEndian>()?;
        let baseline = rdr.read_u16::<LittleEndian>()?;
        let channel_id = rdr.read_u8()?;
        let group_counter = rdr.read_u8()?;

        Ok(Some((ChannelHit { channel_id, timestamp, charge_short, charge_long, baseline }, group_counter)))
    }

    fn read_group(&mut self) -> TofResult<Option<ChannelEvent>> {
        let Some((first, counter)) = self.read_record()? else {
            return Ok(None);
        };
        if counter == 0 {
            return Err(TofError::RawRecord(format!("record {} has a zero group counter", self.records - 1)));
        }

        let mut hits = Vec::with_capacity(counter as usize);
        hits.push(first);
        while hits.len() < counter as usize {
            match self.read_record()? {
                Some((hit, c)) if c == counter => hits.push(hit),
                Some((_, c)) => {
                    return Err(TofError::RawRecord(format!(
                        "record {} has group counter {} inside a group of {}", self.records - 1, c, counter
                    )))
                }
                None => {
                    return Err(TofError::RawRecord(format!("stream ends inside a group of {} ({} read)", counter, hits.len())))
                }
            }
        }
        Ok(Some(ChannelEvent { hits }))
    }
}

impl<R: Read> Iterator for BinaryEventReader<R> {
    type Item = TofResult<ChannelEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_group().transpose()
    }
}

/// Writes events as binary hit records.
pub fn write_binary_events<W: Write>(writer: &mut W, events: &[ChannelEvent]) -> TofResult<()> {
    for event in events {
        event.validate()?;
        let counter = event.coincidence_group_counter() as u8;
        for hit in &event.hits {
            writer.write_u64::<LittleEndian>(hit.timestamp)?;
            writer.write_u16::<LittleEndian>(hit.charge_short)?;
            writer.write_u16::<LittleEndian>(hit.charge_long)?;
            writer.write_u16::<LittleEndian>(hit.baseline)?;
            writer.write_u8(hit.channel_id)?;
            writer.write_u8(counter)?;
        }
    }
    Ok(())
}

pub fn write_json_lines<W: Write>(writer: &mut W, events: &[ChannelEvent]) -> TofResult<()> {
    for event in events {
        serde_json::to_writer(&mut *writer, event).map_err(|e| TofError::Serialization(e.to_string()))?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Loads every readable event of a file. Unreadable groups are logged and skipped;
/// I/O failures abort.
///
/// # Arguments
///
/// * `path` - event file
/// * `format` - layout, or `None` to guess from the extension
///
/// # Returns
///
/// * events in file order and the number of skipped groups
///
pub fn load_events(path: &Path, format: Option<EventFormat>) -> TofResult<(Vec<ChannelEvent>, usize)> {
    let format = format.unwrap_or_else(|| EventFormat::from_path(path));
    let file = BufReader::new(File::open(path)?);
    let iter: Box<dyn Iterator<Item = TofResult<ChannelEvent>>> = match format {
        EventFormat::Jsonl => Box::new(JsonLinesReader::new(file)),
        EventFormat::Binary => Box::new(BinaryEventReader::new(file)),
    };

    let mut events = Vec::new();
    let mut skipped = 0;
    for item in iter {
        match item {
            Ok(event) => events.push(event),
            Err(TofError::Io(e)) => return Err(TofError::Io(e)),
            Err(e) => {
                warn!(error = %e, "skipping unreadable coincidence group");
                skipped += 1;
            }
        }
    }
    debug!(path = %path.display(), ?format, events = events.len(), skipped, "loaded raw events");
    Ok((events, skipped))
}

pub fn save_events(path: &Path, events: &[ChannelEvent], format: Option<EventFormat>) -> TofResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    match format.unwrap_or_else(|| EventFormat::from_path(path)) {
        EventFormat::Jsonl => write_json_lines(&mut writer, events)?,
        EventFormat::Binary => write_binary_events(&mut writer, events)?,
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<ChannelEvent> {
        vec![
            ChannelEvent {
                hits: vec![
                    ChannelHit::new(28, 1000, 10, 200, 3),
                    ChannelHit::new(24, 1010, 11, 201, 3),
                    ChannelHit::new(25, 990, 12, 202, 3),
                    ChannelHit::new(26, 1005, 13, 203, 3),
                    ChannelHit::new(27, 995, 14, 204, 3),
                    ChannelHit::new(0, 1500, 15, 1100, 3),
                ],
            },
            ChannelEvent { hits: vec![ChannelHit::new(3, u64::MAX - 1, 1, 2, 0)] },
        ]
    }

    #[test]
    fn test_binary_record_layout() {
        let mut buf = Vec::new();
        write_binary_events(&mut buf, &sample_events()[1..]).unwrap();
        assert_eq!(buf.len(), RECORD_SIZE);
        assert_eq!(&buf[0..8], &(u64::MAX - 1).to_le_bytes());
        assert_eq!(buf[14], 3);
        assert_eq!(buf[15], 1);
    }

    #[test]
    fn test_binary_groups() {
        let events = sample_events();
        let mut buf = Vec::new();
        write_binary_events(&mut buf, &events).unwrap();
        let read: Vec<ChannelEvent> = BinaryEventReader::new(&buf[..]).collect::<TofResult<_>>().unwrap();
        assert_eq!(read, events);
    }

    #[test]
    fn test_truncated_and_inconsistent_records() {
        let mut buf = Vec::new();
        write_binary_events(&mut buf, &sample_events()).unwrap();
        let truncated = &buf[..RECORD_SIZE * 3 + 5];
        let results: Vec<_> = BinaryEventReader::new(truncated).collect();
        assert!(matches!(results.last(), Some(Err(TofError::RawRecord(_)))));

        // second record claims a group of two
        buf[RECORD_SIZE + 15] = 2;
        let first = BinaryEventReader::new(&buf[..]).next().unwrap();
        assert!(matches!(first, Err(TofError::RawRecord(_))));
    }

    #[test]
    fn test_json_lines_skip_blank_and_report_line() {
        let events = sample_events();
        let mut buf = Vec::new();
        write_json_lines(&mut buf, &events).unwrap();
        buf.extend_from_slice(b"\n\n{not json}\n");

        let results: Vec<_> = JsonLinesReader::new(&buf[..]).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &events[0]);
        match &results[2] {
            Err(TofError::RawRecord(msg)) => assert!(msg.starts_with("line 5")),
            other => panic!("unexpected {:?}", other.as_ref().map(|e| e.hits.len())),
        }
    }

    #[test]
    fn test_load_events_from_file() {
        let path = std::env::temp_dir().join(format!("tofdf_raw_{}.bin", std::process::id()));
        save_events(&path, &sample_events(), None).unwrap();
        let (events, skipped) = load_events(&path, None).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(events.len(), 2);
        assert_eq!(skipped, 0);
    }
}
