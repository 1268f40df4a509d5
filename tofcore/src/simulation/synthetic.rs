use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::data::hit::{ChannelEvent, ChannelHit};
use crate::data::roles::{AuxRole, Role, RoleMap};
use crate::error::{TofError, TofResult};
use crate::physics::constants::{FLIGHT_PATH_MM, MAX_CHANNELS, TICK_TO_NS};
use crate::physics::kinematics::predicted_time_of_flight;

// spacing between coincidence windows and the fixed delay of the delay-line signals, in ticks
const EVENT_SPACING_TICKS: i64 = 100_000_000;
const DELAY_LINE_OFFSET_TICKS: i64 = 1_000_000;

/// An emission line of the simulated source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmissionLine {
    pub energy_mev: f64,
    pub mass_amu: f64,
    /// Relative intensity
    pub weight: f64,
}

/// Parameters of the synthetic acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub roles: RoleMap,
    pub detector_count: usize,
    pub tick_to_ns: f64,
    pub flight_path_mm: f64,
    pub lines: Vec<EmissionLine>,
    /// Pulse-height response `energy = slope * pulse_height + intercept`
    pub slope: f64,
    pub intercept: f64,
    pub time_offset_ns: f64,
    pub energy_spread_mev: f64,
    pub timing_spread_ns: f64,
    /// Width of the X/Y delay-line time differences in ns
    pub position_spread_ns: f64,
    /// Probability that one auxiliary signal is missing from an event
    pub missing_role_probability: f64,
    /// Hits on unassigned channels added to each event
    pub noise_hits: usize,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            roles: RoleMap::default(),
            detector_count: 23,
            tick_to_ns: TICK_TO_NS,
            flight_path_mm: FLIGHT_PATH_MM,
            lines: vec![
                EmissionLine { energy_mev: 4.7758, mass_amu: 4.0, weight: 1.0 },
                EmissionLine { energy_mev: 4.93097, mass_amu: 4.0, weight: 1.0 },
                EmissionLine { energy_mev: 5.03489, mass_amu: 4.0, weight: 1.0 },
                EmissionLine { energy_mev: 5.07841, mass_amu: 4.0, weight: 1.0 },
            ],
            slope: 0.004,
            intercept: 0.6,
            time_offset_ns: 5.0,
            energy_spread_mev: 0.008,
            timing_spread_ns: 0.1,
            position_spread_ns: 6.0,
            missing_role_probability: 0.0,
            noise_hits: 0,
            seed: 42,
        }
    }
}

/// Generating parameters of one simulated event.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTruth {
    pub detector_index: usize,
    pub line_index: usize,
    pub energy_mev: f64,
    pub time_of_flight_ns: f64,
    /// False if an auxiliary signal was dropped, so the event cannot decode
    pub complete: bool,
}

/// Seeded generator of coincidence events with known physics.
pub struct EventSimulator {
    config: SimulationConfig,
    rng: StdRng,
    line_choice: WeightedIndex<f64>,
    energy_noise: Option<Normal>,
    timing_noise: Option<Normal>,
    position_noise: Option<Normal>,
    detector_channels: Vec<usize>,
    noise_channels: Vec<u8>,
    event_count: i64,
}

fn noise_distribution(sigma: f64, what: &str) -> TofResult<Option<Normal>> {
    if sigma == 0.0 {
        return Ok(None);
    }
    Normal::new(0.0, sigma)
        .map(Some)
        .map_err(|e| TofError::InvalidConfig(format!("{} spread {}: {}", what, sigma, e)))
}

fn sample(noise: &Option<Normal>, rng: &mut StdRng) -> f64 {
    noise.as_ref().map_or(0.0, |n| n.sample(rng))
}

impl EventSimulator {
    pub fn new(config: SimulationConfig) -> TofResult<Self> {
        if config.lines.is_empty() {
            return Err(TofError::InvalidConfig("simulation needs at least one emission line".to_string()));
        }
        if config.detector_count == 0 || config.detector_count > MAX_CHANNELS {
            return Err(TofError::InvalidConfig(format!("detector count {} out of range", config.detector_count)));
        }
        if !(config.tick_to_ns > 0.0) || config.slope == 0.0 {
            return Err(TofError::InvalidConfig("tick_to_ns must be positive and slope non-zero".to_string()));
        }

        let line_choice = WeightedIndex::new(config.lines.iter().map(|l| l.weight))
            .map_err(|e| TofError::InvalidConfig(format!("emission line weights: {}", e)))?;
        let energy_noise = noise_distribution(config.energy_spread_mev, "energy")?;
        let timing_noise = noise_distribution(config.timing_spread_ns, "timing")?;
        let position_noise = noise_distribution(config.position_spread_ns, "position")?;

        // detector indices whose channel is not claimed by an auxiliary role
        let detector_channels: Vec<usize> = (0..config.detector_count)
            .filter(|&d| config.roles.classify(d as u8, config.detector_count) == Some(Role::Detector(d)))
            .collect();
        if detector_channels.is_empty() {
            return Err(TofError::InvalidConfig(format!(
                "all {} detector channels are taken by auxiliary roles",
                config.detector_count
            )));
        }

        let noise_channels = (0..MAX_CHANNELS)
            .map(|c| c as u8)
            .filter(|&c| config.roles.classify(c, config.detector_count).is_none())
            .collect();

        Ok(EventSimulator {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            line_choice,
            energy_noise,
            timing_noise,
            position_noise,
            detector_channels,
            noise_channels,
            event_count: 0,
        })
    }

    fn ticks(&self, ns: f64) -> i64 {
        (ns / self.config.tick_to_ns).round() as i64
    }

    fn charge(value: f64) -> u16 {
        value.round().clamp(0.0, u16::MAX as f64) as u16
    }

    /// Generates the next event and the parameters it was generated from.
    pub fn next_event(&mut self) -> (ChannelEvent, SimulatedTruth) {
        let line_index = self.line_choice.sample(&mut self.rng);
        let line = self.config.lines[line_index];
        let detector_index = self.detector_channels[self.rng.gen_range(0..self.detector_channels.len())];

        let energy = line.energy_mev + sample(&self.energy_noise, &mut self.rng);
        let tof = predicted_time_of_flight(energy, line.mass_amu, self.config.flight_path_mm)
            + self.config.time_offset_ns
            + sample(&self.timing_noise, &mut self.rng);
        let dx = sample(&self.position_noise, &mut self.rng);
        let dy = sample(&self.position_noise, &mut self.rng);

        self.event_count += 1;
        let t0 = self.event_count * EVENT_SPACING_TICKS;
        let mut timed: Vec<(u8, i64)> = vec![(self.config.roles.mcp, t0)];
        for (role, half) in [(AuxRole::X1, dx / 2.0), (AuxRole::X2, -dx / 2.0), (AuxRole::Y1, dy / 2.0), (AuxRole::Y2, -dy / 2.0)] {
            timed.push((self.config.roles.channel(role), t0 + DELAY_LINE_OFFSET_TICKS + self.ticks(half)));
        }

        let complete = !(self.config.missing_role_probability > 0.0 && self.rng.gen_bool(self.config.missing_role_probability.min(1.0)));
        if !complete {
            let dropped = self.rng.gen_range(0..timed.len());
            timed.remove(dropped);
        }

        let mut hits: Vec<ChannelHit> = timed
            .into_iter()
            .map(|(channel, ts)| ChannelHit::new(channel, ts as u64, self.rng.gen_range(50..400), self.rng.gen_range(100..1000), 0))
            .collect();

        let pulse_height = (energy - self.config.intercept) / self.config.slope;
        hits.push(ChannelHit::new(
            detector_index as u8,
            (t0 + self.ticks(tof)) as u64,
            Self::charge(pulse_height * 0.2),
            Self::charge(pulse_height),
            0,
        ));

        if !self.noise_channels.is_empty() {
            for _ in 0..self.config.noise_hits {
                let channel = self.noise_channels[self.rng.gen_range(0..self.noise_channels.len())];
                let ts = t0 + self.rng.gen_range(0..DELAY_LINE_OFFSET_TICKS);
                hits.push(ChannelHit::new(channel, ts as u64, 10, 20, 0));
            }
        }
        hits.shuffle(&mut self.rng);

        let truth = SimulatedTruth { detector_index, line_index, energy_mev: energy, time_of_flight_ns: tof, complete };
        (ChannelEvent { hits }, truth)
    }

    /// Generates `count` events.
    pub fn simulate(&mut self, count: usize) -> (Vec<ChannelEvent>, Vec<SimulatedTruth>) {
        (0..count).map(|_| self.next_event()).unzip()
    }
}

/// Convenience wrapper: a fresh simulator from `config`, run for `count` events.
pub fn simulate_events(config: SimulationConfig, count: usize) -> TofResult<(Vec<ChannelEvent>, Vec<SimulatedTruth>)> {
    Ok(EventSimulator::new(config)?.simulate(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::decoder::{CoincidenceDecoder, DecoderConfig};

    fn decoder(config: &SimulationConfig) -> CoincidenceDecoder {
        CoincidenceDecoder::new(DecoderConfig {
            roles: config.roles,
            detector_count: config.detector_count,
            tick_to_ns: config.tick_to_ns,
        })
        .unwrap()
    }

    #[test]
    fn test_same_seed_same_events() {
        let (a, _) = simulate_events(SimulationConfig::default(), 100).unwrap();
        let (b, _) = simulate_events(SimulationConfig::default(), 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decoded_values_match_truth() {
        let config = SimulationConfig { detector_count: 4, ..Default::default() };
        let (events, truth) = simulate_events(config.clone(), 200).unwrap();
        let decoder = decoder(&config);

        for (event, t) in events.iter().zip(&truth) {
            let measurements = decoder.decode(event).unwrap();
            assert_eq!(measurements.len(), 1);
            let m = measurements[0];
            assert_eq!(m.detector_index, t.detector_index);
            // timestamps are rounded to one tick
            assert!((m.time_of_flight - t.time_of_flight_ns).abs() <= config.tick_to_ns);
            let energy = m.pulse_height * config.slope + config.intercept;
            assert!((energy - t.energy_mev).abs() <= 0.5 * config.slope + 1e-12);
        }
    }

    #[test]
    fn test_dropped_roles_do_not_decode() {
        let config = SimulationConfig { missing_role_probability: 0.5, noise_hits: 3, detector_count: 8, ..Default::default() };
        let (events, truth) = simulate_events(config.clone(), 300).unwrap();
        let (set, stats) = decoder(&config).decode_all(&events);

        let complete = truth.iter().filter(|t| t.complete).count();
        assert!(complete > 50 && complete < 250);
        assert_eq!(set.total(), complete);
        assert_eq!(stats.unknown_hits, 900);
    }

    #[test]
    fn test_detectors_skip_auxiliary_channels() {
        let config = SimulationConfig { detector_count: 30, ..Default::default() };
        let (events, truth) = simulate_events(config.clone(), 3000).unwrap();
        let decoder = decoder(&config);

        let mut used = [false; 30];
        for (event, t) in events.iter().zip(&truth) {
            assert!(!(24..=28).contains(&t.detector_index));
            used[t.detector_index] = true;
            let measurements = decoder.decode(event).unwrap();
            assert_eq!(measurements.len(), 1);
            assert_eq!(measurements[0].detector_index, t.detector_index);
        }
        assert!(used[29] && used[0]);
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(EventSimulator::new(SimulationConfig { lines: vec![], ..Default::default() }).is_err());
        assert!(EventSimulator::new(SimulationConfig { energy_spread_mev: -1.0, ..Default::default() }).is_err());
        assert!(EventSimulator::new(SimulationConfig { detector_count: 0, ..Default::default() }).is_err());
        let roles = RoleMap { mcp: 0, ..Default::default() };
        assert!(EventSimulator::new(SimulationConfig { roles, detector_count: 1, ..Default::default() }).is_err());
    }
}
