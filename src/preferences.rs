use core::time::Duration;

use log::warn;

use crate::error::ConfigError;
use crate::timer::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_RETRY_CEILING, PRODUCTION_POLL_INTERVAL,
    SIMULATION_POLL_INTERVAL, STAGING_POLL_INTERVAL,
};

pub const ENV_SELECTOR: &str = "ENVMON_ENV";
const ENV_POLL_INTERVAL: &str = "ENVMON_POLL_INTERVAL_SECS";
const ENV_RETRY_CEILING: &str = "ENVMON_RETRY_CEILING";
const ENV_ACQUIRE_TIMEOUT: &str = "ENVMON_ACQUIRE_TIMEOUT_SECS";
const ENV_I2C_BUS: &str = "ENVMON_I2C_BUS";
const ENV_GPIO_CHIP: &str = "ENVMON_GPIO_CHIP";
const ENV_LED_LINE: &str = "ENVMON_LED_LINE";
const ENV_SENSOR_NAME: &str = "ENVMON_SENSOR_NAME";
const ENV_BUSY_BLINK: &str = "ENVMON_BUSY_BLINK";

/// Deployment the process is running in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
    LocalSimulation,
}

/// Which bus implementation gets injected into the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    RealBus,
    SimulatedBus,
}

impl Environment {
    /// Parses the selector value: `production`, `staging` or `local-simulation`
    pub fn parse(selector: &str) -> Result<Environment, ConfigError> {
        match selector.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "pre-production" => Ok(Environment::Staging),
            "local-simulation" | "local" | "simulation" => Ok(Environment::LocalSimulation),
            _ => Err(ConfigError::UnknownEnvironment(selector.to_string())),
        }
    }

    pub fn backend(self) -> Backend {
        match self {
            Environment::Production | Environment::Staging => Backend::RealBus,
            Environment::LocalSimulation => Backend::SimulatedBus,
        }
    }

    pub fn default_poll_interval(self) -> Duration {
        match self {
            Environment::Production => PRODUCTION_POLL_INTERVAL,
            Environment::Staging => STAGING_POLL_INTERVAL,
            Environment::LocalSimulation => SIMULATION_POLL_INTERVAL,
        }
    }
}

/// Preferences hold everything the poller needs to know at startup.
/// They are loaded once and never change afterwards.
/// environment: deployment selected by `ENVMON_ENV`
/// backend: real or simulated bus, derived from the environment
/// poll_interval: sleep between acquisition cycles
/// retry_ceiling: consecutive failed cycles tolerated before a fatal shutdown
/// acquire_timeout: upper bound on a single acquisition attempt
/// busy_blink: blink instead of steady on while acquiring
#[derive(Debug, Clone, PartialEq)]
pub struct Preferences {
    pub environment: Environment,
    pub backend: Backend,
    pub poll_interval: Duration,
    pub retry_ceiling: u32,
    pub acquire_timeout: Duration,
    pub i2c_bus: String,
    pub gpio_chip: String,
    pub led_line: u32,
    pub sensor_name: String,
    pub busy_blink: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences::for_environment(Environment::Production)
    }
}

impl Preferences {
    pub fn for_environment(environment: Environment) -> Self {
        Preferences {
            environment,
            backend: environment.backend(),
            poll_interval: environment.default_poll_interval(),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            i2c_bus: "/dev/i2c-1".to_string(),
            gpio_chip: "/dev/gpiochip0".to_string(),
            led_line: 5, // BCM 5
            sensor_name: "bme680".to_string(),
            busy_blink: false,
        }
    }

    /// Loads preferences from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads preferences through `lookup`, which maps a variable name to its value
    /// A missing selector falls back to production with a warning
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup(ENV_SELECTOR) {
            Some(selector) => Environment::parse(&selector)?,
            None => {
                warn!("{} is not set, assuming production", ENV_SELECTOR);
                Environment::Production
            }
        };

        let mut preferences = Preferences::for_environment(environment);

        if let Some(value) = lookup(ENV_POLL_INTERVAL) {
            let secs = parse_number(ENV_POLL_INTERVAL, &value)?;
            if secs == 0 {
                return Err(invalid(ENV_POLL_INTERVAL, value, "must be at least 1"));
            }
            preferences.poll_interval = Duration::from_secs(secs);
        }
        if let Some(value) = lookup(ENV_RETRY_CEILING) {
            let ceiling = parse_number(ENV_RETRY_CEILING, &value)?;
            if ceiling == 0 || ceiling > u64::from(u32::MAX) {
                return Err(invalid(ENV_RETRY_CEILING, value, "must be between 1 and 2^32-1"));
            }
            preferences.retry_ceiling = ceiling as u32;
        }
        if let Some(value) = lookup(ENV_ACQUIRE_TIMEOUT) {
            let secs = parse_number(ENV_ACQUIRE_TIMEOUT, &value)?;
            if secs == 0 {
                return Err(invalid(ENV_ACQUIRE_TIMEOUT, value, "must be at least 1"));
            }
            preferences.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup(ENV_I2C_BUS) {
            preferences.i2c_bus = value;
        }
        if let Some(value) = lookup(ENV_GPIO_CHIP) {
            preferences.gpio_chip = value;
        }
        if let Some(value) = lookup(ENV_LED_LINE) {
            let line = parse_number(ENV_LED_LINE, &value)?;
            preferences.led_line = u32::try_from(line)
                .map_err(|_| invalid(ENV_LED_LINE, value, "out of range"))?;
        }
        if let Some(value) = lookup(ENV_SENSOR_NAME) {
            preferences.sensor_name = value;
        }
        if let Some(value) = lookup(ENV_BUSY_BLINK) {
            preferences.busy_blink = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }

        Ok(preferences)
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid(key, value.to_string(), "not a whole number"))
}

fn invalid(key: &'static str, value: String, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue { key, value, reason }
}
