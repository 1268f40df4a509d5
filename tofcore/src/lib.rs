// error module
pub mod error;

// physics module
pub mod physics {
    pub mod constants;
    pub mod kinematics;
}

// data module
pub mod data {
    pub mod hit;
    pub mod roles;
    pub mod measurement;
    pub mod histogram;
}

// algorithm module
pub mod algorithm {
    pub mod decoder;
    pub mod peak_search;
    pub mod levenberg_marquardt;
    pub mod spectral_fit;
    pub mod calibration;
    pub mod mass;
}

// simulation module
pub mod simulation {
    pub mod synthetic;
}

pub use error::{TofError, TofResult};
