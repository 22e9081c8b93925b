//! Simulated bus and indicator pin for `local-simulation` runs and tests.
//!
//! Without a script the device produces slowly drifting indoor values, and
//! the gas heater reports stable after a few cycles. A script replaces the
//! synthesized values one read at a time.

use core::fmt;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embedded_hal::digital::{Error, ErrorKind, ErrorType, OutputPin};
use heapless::HistoryBuffer;

use crate::error::SensorError;
use crate::sensors::{Acquisition, BusAddress, MeasurementProfile, Reading, SensorBus, SensorDevice};

/// Reads the heater needs before its gas reading is trusted
const HEATER_WARMUP_CYCLES: u32 = 3;

/// One scripted outcome for the next read
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Reading {
        temperature: f32,
        pressure: f32,
        humidity: f32,
        gas_resistance: Option<f32>,
    },
    NotReady,
    Fail(String),
    /// Blocks the read for the duration, then reports not ready
    Stall(Duration),
}

impl Scripted {
    pub fn reading(temperature: f32, pressure: f32, humidity: f32, gas_resistance: Option<f32>) -> Self {
        Scripted::Reading {
            temperature,
            pressure,
            humidity,
            gas_resistance,
        }
    }

    pub fn failure(detail: &str) -> Self {
        Scripted::Fail(detail.to_string())
    }
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: AtomicUsize,
    connections: AtomicUsize,
    releases: AtomicUsize,
    reads: AtomicUsize,
}

/// Read-only view of what happened on a simulated bus
#[derive(Debug, Clone)]
pub struct SimulationProbe(Arc<Counters>);

impl SimulationProbe {
    pub fn connect_attempts(&self) -> usize {
        self.0.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.0.connections.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.0.releases.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.0.reads.load(Ordering::SeqCst)
    }
}

pub struct SimulatedBus {
    responding: Vec<BusAddress>,
    configuration_fails: bool,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    counters: Arc<Counters>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        SimulatedBus::new()
    }
}

impl SimulatedBus {
    /// A bus with one sensor on the primary address
    pub fn new() -> Self {
        SimulatedBus {
            responding: vec![BusAddress::Primary],
            configuration_fails: false,
            script: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn responding_on(mut self, addresses: &[BusAddress]) -> Self {
        self.responding = addresses.to_vec();
        self
    }

    pub fn failing_configuration(mut self) -> Self {
        self.configuration_fails = true;
        self
    }

    /// Appends outcomes to the read script
    pub fn script<I>(self, outcomes: I) -> Self
    where
        I: IntoIterator<Item = Scripted>,
    {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(outcomes);
        self
    }

    pub fn probe(&self) -> SimulationProbe {
        SimulationProbe(Arc::clone(&self.counters))
    }
}

impl SensorBus for SimulatedBus {
    type Device = SimulatedDevice;

    fn connect(&mut self, address: BusAddress) -> Result<SimulatedDevice, SensorError> {
        self.counters.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.responding.contains(&address) {
            return Err(SensorError::BusNotResponding {
                address,
                detail: "simulated bus: no acknowledge".to_string(),
            });
        }
        self.counters.connections.fetch_add(1, Ordering::SeqCst);
        Ok(SimulatedDevice {
            configuration_fails: self.configuration_fails,
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
            heater_armed: false,
            cycle: 0,
        })
    }
}

pub struct SimulatedDevice {
    configuration_fails: bool,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    counters: Arc<Counters>,
    heater_armed: bool,
    cycle: u32,
}

impl SimulatedDevice {
    fn synthesize(&mut self) -> Reading {
        let phase = (self.cycle % 20) as f32;
        let gas = (self.heater_armed && self.cycle > HEATER_WARMUP_CYCLES)
            .then(|| 50_000.0 + 250.0 * phase);
        Reading::new(
            21.0 + 0.05 * phase,
            1013.25 - 0.1 * phase,
            45.0 + 0.2 * phase,
            gas,
        )
    }
}

impl SensorDevice for SimulatedDevice {
    fn apply_profile(&mut self, profile: &MeasurementProfile) -> Result<(), SensorError> {
        if self.configuration_fails {
            return Err(SensorError::ConfigurationFailed(
                "simulated bus: settings write rejected".to_string(),
            ));
        }
        self.heater_armed = profile.gas_enabled;
        Ok(())
    }

    fn read(&mut self) -> Result<Acquisition, SensorError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        self.cycle = self.cycle.wrapping_add(1);

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some(Scripted::Reading {
                temperature,
                pressure,
                humidity,
                gas_resistance,
            }) => Ok(Acquisition::Reading(Reading::new(
                temperature,
                pressure,
                humidity,
                gas_resistance,
            ))),
            Some(Scripted::NotReady) => Ok(Acquisition::NotReady),
            Some(Scripted::Fail(detail)) => Err(SensorError::AcquisitionFailed(detail)),
            Some(Scripted::Stall(duration)) => {
                std::thread::sleep(duration);
                Ok(Acquisition::NotReady)
            }
            None => Ok(Acquisition::Reading(self.synthesize())),
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedPinError;

impl Error for SimulatedPinError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Levels a [`SimulatedPin`] keeps for inspection; older writes are only counted
pub const PIN_HISTORY: usize = 32;

struct PinTrace {
    recent: HistoryBuffer<bool, PIN_HISTORY>,
    writes: usize,
}

impl Default for PinTrace {
    fn default() -> Self {
        PinTrace {
            recent: HistoryBuffer::new(),
            writes: 0,
        }
    }
}

impl fmt::Debug for PinTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinTrace")
            .field("level", &self.recent.recent())
            .field("writes", &self.writes)
            .finish()
    }
}

/// Output pin that remembers its recent levels and counts every write
#[derive(Debug, Clone, Default)]
pub struct SimulatedPin {
    trace: Arc<Mutex<PinTrace>>,
    failing: Arc<AtomicBool>,
}

impl SimulatedPin {
    pub fn new() -> Self {
        SimulatedPin::default()
    }

    /// Makes every following write fail, or succeed again
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The last [`PIN_HISTORY`] levels written, oldest first
    pub fn levels(&self) -> Vec<bool> {
        self.trace().recent.oldest_ordered().copied().collect()
    }

    pub fn level(&self) -> Option<bool> {
        self.trace().recent.recent().copied()
    }

    /// Successful writes since creation
    pub fn writes(&self) -> usize {
        self.trace().writes
    }

    fn trace(&self) -> MutexGuard<'_, PinTrace> {
        self.trace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&mut self, level: bool) -> Result<(), SimulatedPinError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SimulatedPinError);
        }
        let mut trace = self.trace();
        trace.recent.write(level);
        trace.writes += 1;
        Ok(())
    }
}

impl ErrorType for SimulatedPin {
    type Error = SimulatedPinError;
}

impl OutputPin for SimulatedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.record(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.record(true)
    }
}
