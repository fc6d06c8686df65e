//! Shared data models exchanged with devices

mod device_config;

pub use device_config::*;
