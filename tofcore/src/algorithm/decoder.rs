use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::hit::ChannelEvent;
use crate::data::measurement::{DetectorMeasurement, MeasurementSet};
use crate::data::roles::{AuxRole, Role, RoleMap};
use crate::error::{TofError, TofResult};
use crate::physics::constants::{MAX_CHANNELS, TICK_TO_NS};

/// Static configuration of one acquisition setup.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub roles: RoleMap,
    pub detector_count: usize,
    /// Clock tick to nanosecond conversion
    pub tick_to_ns: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig { roles: RoleMap::default(), detector_count: 23, tick_to_ns: TICK_TO_NS }
    }
}

/// Counters collected while decoding a batch of events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeStats {
    pub events: usize,
    /// Events that produced at least one measurement
    pub complete_events: usize,
    pub measurements: usize,
    /// Events rejected as malformed (oversized coincidence group)
    pub malformed_events: usize,
    /// Hits that overwrote an earlier hit of the same role in the same event
    pub duplicate_hits: usize,
    /// Hits on channels with no role
    pub unknown_hits: usize,
}

impl DecodeStats {
    pub fn merge(&mut self, other: &DecodeStats) {
        self.events += other.events;
        self.complete_events += other.complete_events;
        self.measurements += other.measurements;
        self.malformed_events += other.malformed_events;
        self.duplicate_hits += other.duplicate_hits;
        self.unknown_hits += other.unknown_hits;
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    timestamp: u64,
    charge_long: u16,
}

// signed tick difference; u64 timestamps may exceed i64
fn tick_delta(a: u64, b: u64) -> f64 {
    (a as i128 - b as i128) as f64
}

/// Rebuilds per-detector measurements from coincidence groups of channel hits.
///
/// The decoder keeps no state across events apart from its configuration.
#[derive(Clone, Debug)]
pub struct CoincidenceDecoder {
    config: DecoderConfig,
}

impl CoincidenceDecoder {
    pub fn new(config: DecoderConfig) -> TofResult<Self> {
        if config.detector_count > MAX_CHANNELS {
            return Err(TofError::InvalidConfig(format!(
                "detector count {} exceeds {} channels", config.detector_count, MAX_CHANNELS
            )));
        }
        if !(config.tick_to_ns > 0.0) || !config.tick_to_ns.is_finite() {
            return Err(TofError::InvalidConfig(format!("tick_to_ns must be positive, got {}", config.tick_to_ns)));
        }
        for (channel, shadowed) in config.roles.collisions(config.detector_count) {
            warn!(channel, ?shadowed, "channel claimed by several roles, first role in priority order wins");
        }
        Ok(CoincidenceDecoder { config })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decodes a single coincidence group.
    ///
    /// # Arguments
    ///
    /// * `event` - hits of one coincidence window
    ///
    /// # Returns
    ///
    /// * one measurement per detector that is present together with all five
    ///   auxiliary roles, in detector order; an empty vector if the set is incomplete
    ///
    pub fn decode(&self, event: &ChannelEvent) -> TofResult<Vec<DetectorMeasurement>> {
        let mut stats = DecodeStats::default();
        self.decode_with_stats(event, &mut stats)
    }

    /// Measurement of one detector, for callers that require it to be present.
    /// Fails with `MissingSignal` if the event has no complete signal set for it.
    pub fn decode_detector(&self, event: &ChannelEvent, detector_index: usize) -> TofResult<DetectorMeasurement> {
        self.decode(event)?
            .into_iter()
            .find(|m| m.detector_index == detector_index)
            .ok_or(TofError::MissingSignal { detector: detector_index })
    }

    pub fn decode_with_stats(&self, event: &ChannelEvent, stats: &mut DecodeStats) -> TofResult<Vec<DetectorMeasurement>> {
        stats.events += 1;
        if let Err(e) = event.validate() {
            stats.malformed_events += 1;
            return Err(e);
        }

        let detector_count = self.config.detector_count;
        let mut aux: [Option<Slot>; 5] = [None; 5];
        let mut detectors: [Option<Slot>; MAX_CHANNELS] = [None; MAX_CHANNELS];

        // later hits of the same role overwrite earlier ones
        for hit in &event.hits {
            let slot = Slot { timestamp: hit.timestamp, charge_long: hit.charge_long };
            let target = match self.config.roles.classify(hit.channel_id, detector_count) {
                Some(Role::Aux(role)) => &mut aux[role.index()],
                Some(Role::Detector(index)) => match detectors.get_mut(index) {
                    Some(target) => target,
                    None => {
                        stats.unknown_hits += 1;
                        continue;
                    }
                },
                None => {
                    stats.unknown_hits += 1;
                    continue;
                }
            };
            if target.replace(slot).is_some() {
                stats.duplicate_hits += 1;
            }
        }

        let [Some(mcp), Some(x1), Some(x2), Some(y1), Some(y2)] = aux else {
            return Ok(Vec::new());
        };

        let tick = self.config.tick_to_ns;
        let time_difference_x = tick_delta(x1.timestamp, x2.timestamp) * tick;
        let time_difference_y = tick_delta(y1.timestamp, y2.timestamp) * tick;

        let measurements: Vec<DetectorMeasurement> = detectors[..detector_count]
            .iter()
            .enumerate()
            .filter_map(|(detector_index, slot)| {
                slot.map(|det| DetectorMeasurement {
                    detector_index,
                    time_difference_x,
                    time_difference_y,
                    time_of_flight: tick_delta(det.timestamp, mcp.timestamp) * tick,
                    pulse_height: det.charge_long as f64,
                    pulse_height_mcp: mcp.charge_long as f64,
                    pulse_height_x1: x1.charge_long as f64,
                    pulse_height_x2: x2.charge_long as f64,
                    pulse_height_y1: y1.charge_long as f64,
                    pulse_height_y2: y2.charge_long as f64,
                })
            })
            .collect();

        if !measurements.is_empty() {
            stats.complete_events += 1;
            stats.measurements += measurements.len();
        }
        Ok(measurements)
    }

    /// Decodes a stream of events, fanning measurements out to per-detector tables.
    /// Malformed events are skipped and counted.
    pub fn decode_stream<I>(&self, events: I) -> (MeasurementSet, DecodeStats)
    where
        I: IntoIterator<Item = ChannelEvent>,
    {
        let mut set = MeasurementSet::new(self.config.detector_count);
        let mut stats = DecodeStats::default();
        for event in events {
            self.decode_event_into(&event, &mut set, &mut stats);
        }
        (set, stats)
    }

    /// Parallel batch decode over a read-only event slice.
    ///
    /// Chunks are decoded independently and merged in event order, so the
    /// result is identical to sequential decoding.
    pub fn decode_all(&self, events: &[ChannelEvent]) -> (MeasurementSet, DecodeStats) {
        let chunk_size = (events.len() / (rayon::current_num_threads() * 4)).max(1024);

        let partials: Vec<(MeasurementSet, DecodeStats)> = events
            .par_chunks(chunk_size)
            .map(|chunk| {
                let mut set = MeasurementSet::new(self.config.detector_count);
                let mut stats = DecodeStats::default();
                for event in chunk {
                    self.decode_event_into(event, &mut set, &mut stats);
                }
                (set, stats)
            })
            .collect();

        let mut set = MeasurementSet::new(self.config.detector_count);
        let mut stats = DecodeStats::default();
        for (partial, partial_stats) in partials {
            set.append(partial);
            stats.merge(&partial_stats);
        }

        debug!(
            events = stats.events,
            complete = stats.complete_events,
            measurements = stats.measurements,
            duplicates = stats.duplicate_hits,
            "decoded event batch"
        );
        (set, stats)
    }

    fn decode_event_into(&self, event: &ChannelEvent, set: &mut MeasurementSet, stats: &mut DecodeStats) {
        match self.decode_with_stats(event, stats) {
            Ok(measurements) => {
                for m in measurements {
                    set.route(m);
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed event"),
        }
    }

    /// Channel id of an auxiliary role, for diagnostics.
    pub fn aux_channel(&self, role: AuxRole) -> u8 {
        self.config.roles.channel(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::hit::ChannelHit;

    fn decoder(detector_count: usize) -> CoincidenceDecoder {
        CoincidenceDecoder::new(DecoderConfig {
            roles: RoleMap::new(28, 24, 25, 26, 27),
            detector_count,
            tick_to_ns: TICK_TO_NS,
        })
        .unwrap()
    }

    fn hit(channel: u8, ts: u64, qlong: u16) -> ChannelHit {
        ChannelHit::new(channel, ts, qlong / 2, qlong, 100)
    }

    fn reference_event() -> Vec<ChannelHit> {
        vec![
            hit(28, 1000, 50),
            hit(24, 1010, 51),
            hit(25, 990, 52),
            hit(26, 1005, 53),
            hit(27, 995, 54),
            hit(0, 1500, 1200),
        ]
    }

    #[test]
    fn test_reference_event() {
        let event = ChannelEvent::new(reference_event()).unwrap();
        let out = decoder(23).decode(&event).unwrap();
        assert_eq!(out.len(), 1);
        let m = out[0];
        assert_eq!(m.detector_index, 0);
        assert_eq!(m.time_difference_x, 20.0 * TICK_TO_NS);
        assert_eq!(m.time_difference_y, 10.0 * TICK_TO_NS);
        assert_eq!(m.time_of_flight, 500.0 * TICK_TO_NS);
        assert_eq!(m.pulse_height, 1200.0);
        assert_eq!(m.pulse_height_mcp, 50.0);
        assert_eq!(m.pulse_height_y2, 54.0);
    }

    #[test]
    fn test_missing_aux_role_yields_nothing() {
        for missing in 0..5 {
            let mut hits = reference_event();
            hits.remove(missing);
            hits.push(hit(3, 1600, 900));
            let event = ChannelEvent::new(hits).unwrap();
            assert!(decoder(23).decode(&event).unwrap().is_empty());
        }
    }

    #[test]
    fn test_decode_detector_requires_complete_set() {
        let event = ChannelEvent::new(reference_event()).unwrap();
        let m = decoder(23).decode_detector(&event, 0).unwrap();
        assert_eq!(m.pulse_height, 1200.0);
        assert!(matches!(decoder(23).decode_detector(&event, 5), Err(TofError::MissingSignal { detector: 5 })));

        let mut hits = reference_event();
        hits.remove(0);
        let event = ChannelEvent::new(hits).unwrap();
        assert!(matches!(decoder(23).decode_detector(&event, 0), Err(TofError::MissingSignal { detector: 0 })));
    }

    #[test]
    fn test_multiple_detectors_in_one_event() {
        let mut hits = reference_event();
        hits.push(hit(7, 1200, 800));
        hits.push(hit(30, 1200, 800)); // unknown channel
        let event = ChannelEvent::new(hits).unwrap();
        let mut stats = DecodeStats::default();
        let out = decoder(23).decode_with_stats(&event, &mut stats).unwrap();
        assert_eq!(out.iter().map(|m| m.detector_index).collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(out[1].time_of_flight, 200.0 * TICK_TO_NS);
        assert_eq!(stats.unknown_hits, 1);
        assert_eq!(stats.measurements, 2);
    }

    #[test]
    fn test_last_write_wins_on_duplicates() {
        let mut hits = reference_event();
        hits.push(hit(0, 1700, 1300));
        hits.push(hit(28, 900, 60));
        let event = ChannelEvent::new(hits).unwrap();
        let mut stats = DecodeStats::default();
        let out = decoder(23).decode_with_stats(&event, &mut stats).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time_of_flight, 800.0 * TICK_TO_NS);
        assert_eq!(out[0].pulse_height, 1300.0);
        assert_eq!(stats.duplicate_hits, 2);
    }

    #[test]
    fn test_detector_beyond_count_is_ignored() {
        let mut hits = reference_event();
        hits[5] = hit(23, 1500, 1200);
        let event = ChannelEvent::new(hits).unwrap();
        assert!(decoder(23).decode(&event).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_event_is_error() {
        let event = ChannelEvent { hits: vec![hit(0, 1, 1); 300] };
        assert!(matches!(decoder(23).decode(&event), Err(TofError::InputFormat { .. })));
    }

    #[test]
    fn test_decode_all_is_idempotent_and_matches_stream() {
        let mut events = Vec::new();
        for i in 0..5000u64 {
            let mut hits = reference_event();
            hits[5] = hit((i % 23) as u8, 1500 + i, 1000 + (i % 300) as u16);
            if i % 7 == 0 {
                hits.remove(2);
            }
            events.push(ChannelEvent::new(hits).unwrap());
        }
        events.push(ChannelEvent { hits: vec![hit(0, 1, 1); 256] });

        let d = decoder(23);
        let (first, stats) = d.decode_all(&events);
        let (second, _) = d.decode_all(&events);
        let (streamed, stream_stats) = d.decode_stream(events.clone());

        assert_eq!(first, second);
        assert_eq!(first, streamed);
        assert_eq!(stats, stream_stats);
        assert_eq!(stats.malformed_events, 1);
        assert_eq!(stats.events, 5001);
        assert_eq!(first.total(), 5000 - 5000 / 7 - 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DecoderConfig { detector_count: 300, ..DecoderConfig::default() };
        assert!(CoincidenceDecoder::new(config).is_err());
        let config = DecoderConfig { tick_to_ns: 0.0, ..DecoderConfig::default() };
        assert!(CoincidenceDecoder::new(config).is_err());
    }
}
