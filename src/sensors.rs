use core::fmt;
use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use heapless::FnvIndexMap;
use log::{debug, info, warn};

use crate::error::{RegistryError, SensorError};

pub const MAX_SENSORS: usize = 4;
pub const MAX_NAME_LEN: usize = 16;

pub type SensorName = heapless::String<MAX_NAME_LEN>;

/// The two fixed addresses a BME680 can answer on, depending on SDO wiring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusAddress {
    Primary,
    Secondary,
}

impl BusAddress {
    pub fn value(self) -> u8 {
        match self {
            BusAddress::Primary => 0x76,
            BusAddress::Secondary => 0x77,
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.value())
    }
}

/// One environmental measurement
/// temperature: degrees Celsius
/// pressure: hectopascal
/// humidity: percent relative humidity
/// gas_resistance: ohms, only present when the heater was stable for this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub taken_at: SystemTime,
    pub temperature: f32,
    pub pressure: f32,
    pub humidity: f32,
    pub gas_resistance: Option<f32>,
}

impl Reading {
    pub fn new(temperature: f32, pressure: f32, humidity: f32, gas_resistance: Option<f32>) -> Self {
        Reading {
            taken_at: SystemTime::now(),
            temperature,
            pressure,
            humidity,
            gas_resistance,
        }
    }

    /// Drops the gas clause, used when the heater profile could not be applied
    pub fn without_gas(self) -> Self {
        Reading {
            gas_resistance: None,
            ..self
        }
    }
}

/// Result of one measurement cycle that did not hit a bus error
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquisition {
    Reading(Reading),
    /// The chip has not finished its measurement cycle yet
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oversampling {
    Skip,
    X1,
    X2,
    X4,
    X8,
    X16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSize {
    Off,
    Size1,
    Size3,
    Size7,
    Size15,
    Size31,
    Size63,
    Size127,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaterProfile {
    pub target_celsius: u16,
    pub duration: Duration,
    pub profile_index: u8,
    /// Ambient temperature the heater resistance is computed against
    pub ambient_celsius: i8,
}

/// Oversampling, filtering and gas heater parameters applied at configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementProfile {
    pub humidity_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub temperature_oversampling: Oversampling,
    pub filter: FilterSize,
    pub gas_enabled: bool,
    pub heater: HeaterProfile,
}

impl Default for MeasurementProfile {
    fn default() -> Self {
        MeasurementProfile {
            humidity_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X4,
            temperature_oversampling: Oversampling::X8,
            filter: FilterSize::Size3,
            gas_enabled: true,
            heater: HeaterProfile {
                target_celsius: 320,
                duration: Duration::from_millis(150),
                profile_index: 0,
                ambient_celsius: 25,
            },
        }
    }
}

/// A bus that can open a connection to a sensor at a given address
pub trait SensorBus: Send + 'static {
    type Device: SensorDevice;

    /// Opens the sensor at `address`; fails with `BusNotResponding` when nothing answers
    fn connect(&mut self, address: BusAddress) -> Result<Self::Device, SensorError>;
}

/// A connected sensor. Dropping it releases the underlying bus connection.
pub trait SensorDevice: Send + 'static {
    fn apply_profile(&mut self, profile: &MeasurementProfile) -> Result<(), SensorError>;

    /// Runs one forced measurement
    fn read(&mut self) -> Result<Acquisition, SensorError>;
}

/// Connection to one discovered sensor, released exactly once
pub struct SensorHandle<D> {
    address: BusAddress,
    device: D,
}

impl<D: SensorDevice> SensorHandle<D> {
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// Closes the bus connection
    pub fn release(self) -> BusAddress {
        let address = self.address;
        drop(self.device);
        address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Discovering,
    Configured,
    Ready,
    DeviceNotFound,
}

/// Walks one sensor through discovery, configuration and acquisition
pub struct SensorDriver<B: SensorBus> {
    bus: B,
    profile: MeasurementProfile,
    state: DriverState,
    degraded: bool,
}

impl<B: SensorBus> SensorDriver<B> {
    pub fn new(bus: B, profile: MeasurementProfile) -> Self {
        SensorDriver {
            bus,
            profile,
            state: DriverState::Uninitialized,
            degraded: false,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// True when configuration failed and readings carry no gas clause
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Tries the primary address, then the secondary one
    /// Failing on both is terminal for this driver
    pub fn discover(&mut self) -> Result<SensorHandle<B::Device>, SensorError> {
        if self.state != DriverState::Uninitialized {
            return Err(SensorError::InvalidState(self.state));
        }
        self.state = DriverState::Discovering;

        for address in [BusAddress::Primary, BusAddress::Secondary] {
            match self.bus.connect(address) {
                Ok(device) => {
                    info!("BME680 found on address {}", address);
                    return Ok(SensorHandle { address, device });
                }
                Err(e) => debug!("no BME680 on {}: {}", address, e),
            }
        }

        self.state = DriverState::DeviceNotFound;
        Err(SensorError::DeviceNotFound)
    }

    /// Applies the measurement profile
    /// A failure leaves the driver usable in degraded mode and is only reported
    pub fn configure(&mut self, handle: &mut SensorHandle<B::Device>) -> Result<(), SensorError> {
        if self.state != DriverState::Discovering {
            return Err(SensorError::InvalidState(self.state));
        }
        self.state = DriverState::Configured;

        match handle.device.apply_profile(&self.profile) {
            Ok(()) => {
                self.degraded = false;
                Ok(())
            }
            Err(e) => {
                warn!("BME680 configuration failed, continuing degraded: {}", e);
                self.degraded = true;
                Err(match e {
                    SensorError::ConfigurationFailed(detail) => {
                        SensorError::ConfigurationFailed(detail)
                    }
                    other => SensorError::ConfigurationFailed(other.to_string()),
                })
            }
        }
    }

    /// Runs one reading cycle
    pub fn acquire(&mut self, handle: &mut SensorHandle<B::Device>) -> Result<Acquisition, SensorError> {
        match self.state {
            DriverState::Configured | DriverState::Ready => {}
            other => return Err(SensorError::InvalidState(other)),
        }
        self.state = DriverState::Ready;

        let acquisition = handle.device.read()?;
        Ok(match acquisition {
            Acquisition::Reading(reading) if self.degraded => {
                Acquisition::Reading(reading.without_gas())
            }
            other => other,
        })
    }
}

/// A registered sensor: its driver, the handle once discovered, and the last reading
pub struct Sensor<B: SensorBus> {
    driver: SensorDriver<B>,
    handle: Option<SensorHandle<B::Device>>,
    latest: Option<Reading>,
}

impl<B: SensorBus> Sensor<B> {
    pub fn new(driver: SensorDriver<B>) -> Self {
        Sensor {
            driver,
            handle: None,
            latest: None,
        }
    }

    /// Discovers and configures the sensor
    /// Only discovery errors are returned; configuration problems leave it degraded
    pub fn initialize(&mut self) -> Result<BusAddress, SensorError> {
        let mut handle = self.driver.discover()?;
        let address = handle.address();
        // Already logged by the driver
        let _ = self.driver.configure(&mut handle);
        self.handle = Some(handle);
        Ok(address)
    }

    pub fn acquire(&mut self) -> Result<Acquisition, SensorError> {
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return Err(SensorError::InvalidState(self.driver.state())),
        };
        let acquisition = self.driver.acquire(handle)?;
        if let Acquisition::Reading(reading) = acquisition {
            self.latest = Some(reading);
        }
        Ok(acquisition)
    }

    /// Releases the handle if one is held; returns its address the first time only
    pub fn release(&mut self) -> Option<BusAddress> {
        self.handle.take().map(SensorHandle::release)
    }

    pub fn state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn is_degraded(&self) -> bool {
        self.driver.is_degraded()
    }

    pub fn address(&self) -> Option<BusAddress> {
        self.handle.as_ref().map(SensorHandle::address)
    }

    pub fn latest(&self) -> Option<Reading> {
        self.latest
    }
}

pub type SharedSensor<B> = Arc<Mutex<Sensor<B>>>;

/// Locks a sensor, recovering it if a previous holder panicked
pub fn lock_sensor<B: SensorBus>(sensor: &Mutex<Sensor<B>>) -> MutexGuard<'_, Sensor<B>> {
    sensor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Named sensors, at most one per name
pub struct SensorRegistry<B: SensorBus> {
    entries: FnvIndexMap<SensorName, SharedSensor<B>, MAX_SENSORS>,
}

impl<B: SensorBus> Default for SensorRegistry<B> {
    fn default() -> Self {
        SensorRegistry {
            entries: FnvIndexMap::new(),
        }
    }
}

impl<B: SensorBus> SensorRegistry<B> {
    pub fn insert(&mut self, name: &str, driver: SensorDriver<B>) -> Result<(), RegistryError> {
        let mut key = SensorName::new();
        if name.is_empty() || key.push_str(name).is_err() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        self.entries
            .insert(key, Arc::new(Mutex::new(Sensor::new(driver))))
            .map_err(|_| RegistryError::Full)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SharedSensor<B>> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, sensor)| sensor)
    }

    /// Snapshot of the registered sensors in registration order
    pub fn entries(&self) -> Vec<(SensorName, SharedSensor<B>)> {
        self.entries
            .iter()
            .map(|(name, sensor)| (name.clone(), Arc::clone(sensor)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{Scripted, SimulatedBus};

    fn driver(bus: SimulatedBus) -> SensorDriver<SimulatedBus> {
        SensorDriver::new(bus, MeasurementProfile::default())
    }

    #[test]
    fn discovery_prefers_primary() {
        let mut driver = driver(SimulatedBus::new());
        let handle = driver.discover().unwrap();
        assert_eq!(handle.address(), BusAddress::Primary);
        assert_eq!(driver.state(), DriverState::Discovering);
    }

    #[test]
    fn discovery_falls_back_to_secondary() {
        let bus = SimulatedBus::new().responding_on(&[BusAddress::Secondary]);
        let probe = bus.probe();
        let mut driver = driver(bus);

        let mut handle = driver.discover().unwrap();
        assert_eq!(handle.address(), BusAddress::Secondary);
        assert_eq!(probe.connect_attempts(), 2);

        driver.configure(&mut handle).unwrap();
        assert!(driver.acquire(&mut handle).is_ok());
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[test]
    fn discovery_failing_twice_is_terminal() {
        let mut driver = driver(SimulatedBus::new().responding_on(&[]));
        assert_eq!(driver.discover().err(), Some(SensorError::DeviceNotFound));
        assert_eq!(driver.state(), DriverState::DeviceNotFound);
        assert!(matches!(
            driver.discover(),
            Err(SensorError::InvalidState(DriverState::DeviceNotFound))
        ));
    }

    #[test]
    fn configuration_failure_degrades_readings() {
        let bus = SimulatedBus::new()
            .failing_configuration()
            .script([Scripted::reading(21.0, 1013.0, 40.0, Some(5000.0))]);
        let mut driver = driver(bus);
        let mut handle = driver.discover().unwrap();

        assert!(matches!(
            driver.configure(&mut handle),
            Err(SensorError::ConfigurationFailed(_))
        ));
        assert!(driver.is_degraded());

        match driver.acquire(&mut handle).unwrap() {
            Acquisition::Reading(reading) => {
                assert_eq!(reading.temperature, 21.0);
                assert_eq!(reading.gas_resistance, None);
            }
            Acquisition::NotReady => panic!("expected a reading"),
        }
    }

    #[test]
    fn acquire_before_configure_is_rejected() {
        let mut driver = driver(SimulatedBus::new());
        let mut handle = driver.discover().unwrap();
        assert!(matches!(
            driver.acquire(&mut handle),
            Err(SensorError::InvalidState(DriverState::Discovering))
        ));
    }

    #[test]
    fn not_ready_is_not_an_error() {
        let bus = SimulatedBus::new().script([Scripted::NotReady]);
        let mut sensor = Sensor::new(driver(bus));
        sensor.initialize().unwrap();
        assert_eq!(sensor.acquire(), Ok(Acquisition::NotReady));
        assert_eq!(sensor.latest(), None);
    }

    #[test]
    fn release_happens_once() {
        let bus = SimulatedBus::new();
        let probe = bus.probe();
        let mut sensor = Sensor::new(driver(bus));
        sensor.initialize().unwrap();

        assert_eq!(sensor.release(), Some(BusAddress::Primary));
        assert_eq!(sensor.release(), None);
        assert_eq!(probe.releases(), 1);
        assert!(matches!(sensor.acquire(), Err(SensorError::InvalidState(_))));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = SensorRegistry::default();
        registry.insert("indoor", driver(SimulatedBus::new())).unwrap();
        assert_eq!(
            registry.insert("indoor", driver(SimulatedBus::new())),
            Err(RegistryError::DuplicateName("indoor".to_string()))
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("indoor").is_some());
        assert!(registry.get("outdoor").is_none());
    }

    #[test]
    fn registry_rejects_bad_names() {
        let mut registry = SensorRegistry::default();
        assert!(matches!(
            registry.insert("", driver(SimulatedBus::new())),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            registry.insert("a-name-well-over-sixteen", driver(SimulatedBus::new())),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn registry_is_bounded() {
        let mut registry = SensorRegistry::default();
        for name in ["a", "b", "c", "d"] {
            registry.insert(name, driver(SimulatedBus::new())).unwrap();
        }
        assert_eq!(
            registry.insert("e", driver(SimulatedBus::new())),
            Err(RegistryError::Full)
        );
    }

    #[test]
    fn address_display() {
        assert_eq!(BusAddress::Primary.to_string(), "0x76");
        assert_eq!(BusAddress::Secondary.to_string(), "0x77");
    }
}
