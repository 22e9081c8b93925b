//! # EnvMon-rs
//! ## An environmental sensor poller for single-board computers
//!
//! Features:
//! - BME680 temperature, humidity, pressure and gas resistance readings
//! - Primary/secondary I2C address discovery
//! - Bounded retry on transient bus failures
//! - Status LED that is lit while a reading is in progress
//! - Simulated bus and LED for local runs without hardware

pub mod bme;
pub mod error;
pub mod indicator;
pub mod polling;
pub mod preferences;
pub mod rendering;
pub mod sensors;
pub mod simulation;
pub mod timer;
