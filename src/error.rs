use thiserror::Error;

use crate::indicator::IndicatorMode;
use crate::sensors::BusAddress;

/// Exit status for an operator interrupt
pub const EXIT_NORMAL: u8 = 0;
/// Exit status for any unrecoverable condition
pub const EXIT_FATAL: u8 = 2;

/// Errors raised by the sensor bus, device or driver
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// Nothing answered on the given address
    #[error("no response on {address}: {detail}")]
    BusNotResponding { address: BusAddress, detail: String },
    /// Neither the primary nor the secondary address answered
    #[error("BME680 not found on primary or secondary address")]
    DeviceNotFound,
    #[error("sensor configuration failed: {0}")]
    ConfigurationFailed(String),
    #[error("acquisition failed: {0}")]
    AcquisitionFailed(String),
    #[error("acquisition did not complete within {0:?}")]
    AcquisitionTimedOut(std::time::Duration),
    /// The driver was asked for something its current state does not allow
    #[error("operation not valid in driver state {0:?}")]
    InvalidState(crate::sensors::DriverState),
}

/// The indicator backend refused a level change
#[derive(Debug, Clone, PartialEq, Error)]
#[error("indicator could not switch to {mode:?}: {detail}")]
pub struct IndicatorFault {
    pub mode: IndicatorMode,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("a sensor named {0:?} is already registered")]
    DuplicateName(String),
    #[error("sensor name {0:?} is empty or too long")]
    InvalidName(String),
    #[error("sensor registry is full")]
    Full,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown environment {0:?} (expected production, staging or local-simulation)")]
    UnknownEnvironment(String),
    #[error("{key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}
