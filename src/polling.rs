//! The acquisition cycle.
//!
//! Each cycle marks the indicator busy, reads every registered sensor once,
//! reports what came back, marks the indicator idle and sleeps. Reads that
//! fail on the bus use up the retry budget; reads that are merely not ready
//! do not. Interrupts are honoured at the top of the cycle and during sleep.

use core::fmt;
use core::time::Duration;
use std::sync::TryLockError;

use embedded_hal::digital::OutputPin;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, SensorError, EXIT_FATAL, EXIT_NORMAL};
use crate::indicator::{IndicatorController, IndicatorMode};
use crate::preferences::Preferences;
use crate::rendering::Reporter;
use crate::sensors::{
    Acquisition, Reading, Sensor, SensorBus, SensorDriver, SensorRegistry, SharedSensor,
};
use crate::timer::{sleep_or_cancel, RetryBudget, Wake};

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Operator interrupt
    Interrupted,
    DeviceNotFound { sensor: String },
    RetryCeilingExhausted { failures: u32 },
    Misconfigured(String),
}

impl Termination {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Termination::Interrupted)
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            EXIT_FATAL
        } else {
            EXIT_NORMAL
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupted => write!(f, "interrupted by operator"),
            Termination::DeviceNotFound { sensor } => {
                write!(f, "sensor {:?} not found on primary or secondary address", sensor)
            }
            Termination::RetryCeilingExhausted { failures } => {
                write!(f, "{} consecutive acquisition failures", failures)
            }
            Termination::Misconfigured(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

/// Tally of one cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub readings: usize,
    pub not_ready: usize,
    pub failures: usize,
}

pub struct PollingLoop<B: SensorBus, P, R> {
    registry: SensorRegistry<B>,
    indicator: IndicatorController<P>,
    reporter: R,
    budget: RetryBudget,
    poll_interval: Duration,
    acquire_timeout: Duration,
    busy_mode: IndicatorMode,
    shutdown: CancellationToken,
    released: bool,
}

impl<B, P, R> PollingLoop<B, P, R>
where
    B: SensorBus,
    P: OutputPin + Send + 'static,
    R: Reporter,
{
    /// shutdown: cancelled by whoever observes the operator interrupt
    pub fn new(
        preferences: &Preferences,
        indicator: IndicatorController<P>,
        reporter: R,
        shutdown: CancellationToken,
    ) -> Self {
        PollingLoop {
            registry: SensorRegistry::default(),
            indicator,
            reporter,
            budget: RetryBudget::new(preferences.retry_ceiling),
            poll_interval: preferences.poll_interval,
            acquire_timeout: preferences.acquire_timeout,
            busy_mode: if preferences.busy_blink {
                IndicatorMode::Blink
            } else {
                IndicatorMode::On
            },
            shutdown,
            released: false,
        }
    }

    pub fn register(&mut self, name: &str, driver: SensorDriver<B>) -> Result<(), RegistryError> {
        self.registry.insert(name, driver)
    }

    /// Consecutive failed cycles so far
    pub fn retry_failures(&self) -> u32 {
        self.budget.failures()
    }

    pub fn indicator_mode(&self) -> Option<IndicatorMode> {
        self.indicator.mode()
    }

    /// Last reading a sensor produced, if any
    /// `None` as well while a stalled read still holds the sensor
    pub fn latest_reading(&self, name: &str) -> Option<Reading> {
        let sensor = self.registry.get(name)?;
        let latest = match sensor.try_lock() {
            Ok(sensor) => sensor.latest(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().latest(),
            Err(TryLockError::WouldBlock) => None,
        };
        latest
    }

    pub fn registry(&self) -> &SensorRegistry<B> {
        &self.registry
    }

    /// Runs until interrupted or until a fatal condition, then shuts down
    pub async fn run(mut self) -> Termination {
        let termination = self.drive().await;
        self.shutdown().await;
        match &termination {
            Termination::Interrupted => info!("Poller stopped: {}", termination),
            fatal => error!("Poller stopped: {}", fatal),
        }
        termination
    }

    async fn drive(&mut self) -> Termination {
        if let Err(termination) = self.initialize().await {
            return termination;
        }
        loop {
            if self.shutdown.is_cancelled() {
                return Termination::Interrupted;
            }
            if let Err(termination) = self.poll_cycle().await {
                return termination;
            }
            if sleep_or_cancel(self.poll_interval, &self.shutdown).await == Wake::Cancelled {
                return Termination::Interrupted;
            }
        }
    }

    /// Puts the indicator in a known state and brings up every sensor
    pub async fn initialize(&mut self) -> Result<(), Termination> {
        if self.registry.is_empty() {
            return Err(Termination::Misconfigured("no sensor registered".to_string()));
        }
        self.set_indicator(IndicatorMode::Off).await;

        for (name, sensor) in self.registry.entries() {
            let outcome =
                run_bounded(sensor, self.acquire_timeout, |sensor| sensor.initialize()).await;
            match outcome {
                Ok(address) => info!("Sensor {} ready on {}", name, address),
                Err(e) => {
                    error!("Sensor {}: {}", name, e);
                    return Err(Termination::DeviceNotFound {
                        sensor: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs one acquisition cycle, without the trailing sleep
    pub async fn poll_cycle(&mut self) -> Result<CycleReport, Termination> {
        self.set_indicator(self.busy_mode).await;

        let mut report = CycleReport::default();
        for (name, sensor) in self.registry.entries() {
            match run_bounded(sensor, self.acquire_timeout, |sensor| sensor.acquire()).await {
                Ok(Acquisition::Reading(reading)) => {
                    report.readings += 1;
                    self.reporter.report(&name, &reading);
                }
                Ok(Acquisition::NotReady) => {
                    report.not_ready += 1;
                    debug!("Sensor {} not ready", name);
                }
                Err(e) => {
                    report.failures += 1;
                    warn!("Sensor {}: {}", name, e);
                }
            }
        }

        if report.failures > 0 {
            let failures = self.budget.record_failure();
            if self.budget.is_exhausted() {
                return Err(Termination::RetryCeilingExhausted { failures });
            }
            warn!(
                "Acquisition failed ({} of {} tolerated)",
                failures,
                self.budget.ceiling()
            );
        } else if report.readings > 0 {
            self.budget.reset();
        }

        self.set_indicator(IndicatorMode::Off).await;
        Ok(report)
    }

    /// Releases the indicator and every sensor handle; later calls do nothing
    pub async fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(fault) = self.indicator.release().await {
            warn!("{}", fault);
        }

        for (name, sensor) in self.registry.entries() {
            let released = match sensor.try_lock() {
                Ok(mut sensor) => sensor.release(),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().release(),
                Err(TryLockError::WouldBlock) => {
                    warn!(
                        "Sensor {} is held by a stalled read; its bus closes when the read returns",
                        name
                    );
                    continue;
                }
            };
            if let Some(address) = released {
                info!("Sensor {} released from {}", name, address);
            }
        }
    }

    async fn set_indicator(&mut self, mode: IndicatorMode) {
        if let Err(fault) = self.indicator.set(mode).await {
            warn!("{}", fault);
        }
    }
}

/// Runs a blocking sensor operation on the blocking pool, bounded by `timeout`
/// A sensor still locked by an earlier stalled call fails immediately
async fn run_bounded<B, T, F>(
    sensor: SharedSensor<B>,
    timeout: Duration,
    operation: F,
) -> Result<T, SensorError>
where
    B: SensorBus,
    T: Send + 'static,
    F: FnOnce(&mut Sensor<B>) -> Result<T, SensorError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || {
        let result = match sensor.try_lock() {
            Ok(mut guard) => operation(&mut guard),
            Err(TryLockError::Poisoned(poisoned)) => operation(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(SensorError::AcquisitionFailed(
                "sensor still busy with a previous attempt".to_string(),
            )),
        };
        result
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(SensorError::AcquisitionFailed(format!(
            "sensor task failed: {}",
            join_error
        ))),
        Err(_) => Err(SensorError::AcquisitionTimedOut(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::Environment;
    use crate::rendering::CollectingReporter;
    use crate::sensors::{lock_sensor, BusAddress, MeasurementProfile};
    use crate::simulation::{Scripted, SimulatedBus, SimulatedPin, SimulationProbe};

    type TestLoop = PollingLoop<SimulatedBus, SimulatedPin, CollectingReporter>;

    fn preferences(retry_ceiling: u32) -> Preferences {
        let mut prefs = Preferences::for_environment(Environment::LocalSimulation);
        prefs.poll_interval = Duration::from_millis(5);
        prefs.acquire_timeout = Duration::from_millis(200);
        prefs.retry_ceiling = retry_ceiling;
        prefs
    }

    fn poller(
        bus: SimulatedBus,
        prefs: &Preferences,
    ) -> (TestLoop, SimulationProbe, SimulatedPin, CollectingReporter) {
        let probe = bus.probe();
        let pin = SimulatedPin::new();
        let reporter = CollectingReporter::default();
        let indicator = IndicatorController::new(pin.clone(), Duration::from_millis(5));
        let mut poller = PollingLoop::new(prefs, indicator, reporter.clone(), CancellationToken::new());
        poller
            .register("bme680", SensorDriver::new(bus, MeasurementProfile::default()))
            .unwrap();
        (poller, probe, pin, reporter)
    }

    #[tokio::test]
    async fn cycle_reports_and_goes_idle() {
        let bus = SimulatedBus::new().script([Scripted::reading(21.0, 1000.0, 50.0, Some(1234.5))]);
        let (mut poller, _, pin, reporter) = poller(bus, &preferences(10));

        poller.initialize().await.unwrap();
        let report = poller.poll_cycle().await.unwrap();

        assert_eq!(report, CycleReport { readings: 1, not_ready: 0, failures: 0 });
        assert_eq!(reporter.lines(), vec!["21.00 C,1000.00 hPa,50.00 %RH,1234.50 Ohms"]);
        // Off at init, on while busy, off when idle
        assert_eq!(pin.levels(), vec![false, true, false]);
        assert_eq!(poller.indicator_mode(), Some(IndicatorMode::Off));
        assert!(poller.latest_reading("bme680").is_some());
    }

    #[tokio::test]
    async fn not_ready_leaves_budget_alone() {
        let bus = SimulatedBus::new().script([
            Scripted::failure("nak"),
            Scripted::NotReady,
            Scripted::NotReady,
        ]);
        let (mut poller, _, _, reporter) = poller(bus, &preferences(10));
        poller.initialize().await.unwrap();

        poller.poll_cycle().await.unwrap();
        assert_eq!(poller.retry_failures(), 1);
        poller.poll_cycle().await.unwrap();
        poller.poll_cycle().await.unwrap();
        assert_eq!(poller.retry_failures(), 1);
        assert!(reporter.readings().is_empty());
    }

    #[tokio::test]
    async fn stalled_read_times_out_as_a_failure() {
        let bus = SimulatedBus::new().script([Scripted::Stall(Duration::from_millis(400))]);
        let (mut poller, _, _, _) = poller(bus, &preferences(10));
        poller.initialize().await.unwrap();

        let report = poller.poll_cycle().await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(poller.retry_failures(), 1);

        // Still locked by the stalled read
        let report = poller.poll_cycle().await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(poller.retry_failures(), 2);
    }

    #[tokio::test]
    async fn latest_reading_does_not_wait_for_a_stalled_read() {
        let bus = SimulatedBus::new().script([
            Scripted::reading(21.0, 1000.0, 50.0, None),
            Scripted::Stall(Duration::from_millis(400)),
        ]);
        let (mut poller, _, _, _) = poller(bus, &preferences(10));
        poller.initialize().await.unwrap();

        poller.poll_cycle().await.unwrap();
        assert!(poller.latest_reading("bme680").is_some());

        let report = poller.poll_cycle().await.unwrap();
        assert_eq!(report.failures, 1);
        let started = std::time::Instant::now();
        assert_eq!(poller.latest_reading("bme680"), None);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (mut poller, probe, pin, _) = poller(SimulatedBus::new(), &preferences(10));
        poller.initialize().await.unwrap();

        poller.shutdown().await;
        poller.shutdown().await;
        assert_eq!(probe.releases(), 1);
        assert_eq!(pin.level(), Some(false));
    }

    #[tokio::test]
    async fn indicator_fault_does_not_stop_the_cycle() {
        let (mut poller, _, pin, reporter) = poller(SimulatedBus::new(), &preferences(10));
        poller.initialize().await.unwrap();

        pin.fail_writes(true);
        let report = poller.poll_cycle().await.unwrap();
        assert_eq!(report.readings, 1);
        assert_eq!(reporter.readings().len(), 1);
    }

    #[tokio::test]
    async fn empty_registry_is_misconfigured() {
        let prefs = preferences(10);
        let indicator = IndicatorController::new(SimulatedPin::new(), Duration::from_millis(5));
        let poller: TestLoop = PollingLoop::new(
            &prefs,
            indicator,
            CollectingReporter::default(),
            CancellationToken::new(),
        );
        let termination = poller.run().await;
        assert!(matches!(termination, Termination::Misconfigured(_)));
        assert_eq!(termination.exit_code(), 2);
    }

    #[tokio::test]
    async fn secondary_address_is_used_when_primary_is_silent() {
        let bus = SimulatedBus::new().responding_on(&[BusAddress::Secondary]);
        let (mut poller, _, _, _) = poller(bus, &preferences(10));
        poller.initialize().await.unwrap();

        let registry = poller.registry();
        let sensor = registry.get("bme680").unwrap();
        assert_eq!(lock_sensor(sensor).address(), Some(BusAddress::Secondary));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Termination::Interrupted.exit_code(), 0);
        assert_eq!(
            Termination::DeviceNotFound { sensor: "bme680".into() }.exit_code(),
            2
        );
        assert_eq!(Termination::RetryCeilingExhausted { failures: 10 }.exit_code(), 2);
    }
}
