// Purpose: To store constants that are used in the program
pub const SPEED_OF_LIGHT: f64 = 299792458.0; // m/s
pub const AMU_TO_MEV: f64 = 931.494; // MeV/c^2 per unified atomic mass unit

// Acquisition hardware
pub const MAX_GROUP_SIZE: usize = 255; // hits per coincidence group (u8 counter)
pub const MAX_CHANNELS: usize = 256; // channel ids are u8
pub const TICK_TO_NS: f64 = (25.0 / 64.0) * 1e-3; // fine timestamp tick, ns
pub const TICK_TO_NS_SLOW: f64 = (25.0 / 16.0) * 1e-3; // tick at half the sampling rate, ns

// Delay-line anode
pub const POSITION_PER_TIME: f64 = 1.0 / (2.0 * 0.75); // mm/ns, 1 mm per 0.75 ns per side

// Flight geometry
pub const FLIGHT_PATH_MM: f64 = 500.0; // mm

// Unit helpers
pub const NS_PER_S: f64 = 1e9;
pub const M_PER_MM: f64 = 1e-3;
