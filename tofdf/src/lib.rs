// src/lib.rs
pub mod config;
pub mod logging;
pub mod run;

pub mod data {
    pub mod raw;
    pub mod io;
}
