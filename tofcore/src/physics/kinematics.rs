use tracing::warn;

use crate::physics::constants::{AMU_TO_MEV, M_PER_MM, NS_PER_S, SPEED_OF_LIGHT};

/// Non-relativistic flight time of a particle over a fixed path.
///
/// # Arguments
///
/// * `energy_mev` - kinetic energy in MeV
/// * `mass_amu` - particle mass in unified atomic mass units
/// * `flight_path_mm` - distance between reference trigger and detector in mm
///
/// # Returns
///
/// * flight time in ns; `0.0` if the energy is exactly zero
///
/// # Example
///
/// ```
/// use tofcore::physics::kinematics::predicted_time_of_flight;
///
/// let tof = predicted_time_of_flight(5.0, 4.0, 500.0);
/// assert!((tof - 32.2).abs() < 0.1);
/// ```
pub fn predicted_time_of_flight(energy_mev: f64, mass_amu: f64, flight_path_mm: f64) -> f64 {
    if energy_mev == 0.0 {
        warn!(mass_amu, flight_path_mm, "division by zero in predicted time of flight, energy is 0");
        return 0.0;
    }

    NS_PER_S * (flight_path_mm * M_PER_MM / SPEED_OF_LIGHT)
        * ((mass_amu * AMU_TO_MEV) / (2.0 * energy_mev)).sqrt()
}

/// Mass in amu of a particle with the given kinetic energy (MeV) and flight time (ns).
///
/// Energies <= 0 are passed through the formula unchanged; an exactly zero
/// flight path returns `0.0` with a warning.
pub fn mass_from_energy_and_tof(energy_mev: f64, tof_ns: f64, flight_path_mm: f64) -> f64 {
    if flight_path_mm == 0.0 {
        warn!(energy_mev, tof_ns, "division by zero in mass derivation, flight path is 0");
        return 0.0;
    }

    let beta_inv = (SPEED_OF_LIGHT * tof_ns / NS_PER_S) / (flight_path_mm * M_PER_MM);
    beta_inv.powi(2) * 2.0 * energy_mev / AMU_TO_MEV
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_energy_returns_zero() {
        assert_eq!(predicted_time_of_flight(0.0, 4.0, 500.0), 0.0);
    }

    #[test]
    fn test_mass_inverts_predicted_tof() {
        for &(energy, mass) in &[(4.7758, 4.0), (5.486, 4.0), (2.0, 1.0), (60.0, 28.0)] {
            let tof = predicted_time_of_flight(energy, mass, 500.0);
            let recovered = mass_from_energy_and_tof(energy, tof, 500.0);
            assert!((recovered - mass).abs() < 1e-9, "{} vs {}", recovered, mass);
        }
    }

    #[test]
    fn test_zero_flight_path_returns_zero() {
        assert_eq!(mass_from_energy_and_tof(5.0, 30.0, 0.0), 0.0);
    }
}
