use std::process::ExitCode;
use std::time::Duration;

use embedded_hal::digital::OutputPin;
use envmon_rs::bme::{Bme680Bus, Compat};
use envmon_rs::error::{SensorError, EXIT_FATAL};
use envmon_rs::indicator::IndicatorController;
use envmon_rs::polling::{PollingLoop, Termination};
use envmon_rs::preferences::{Backend, Preferences};
use envmon_rs::rendering::ConsoleReporter;
use envmon_rs::sensors::{MeasurementProfile, SensorBus, SensorDriver};
use envmon_rs::simulation::{SimulatedBus, SimulatedPin};
use envmon_rs::timer::BLINK_HALF_PERIOD;
use linux_embedded_hal::gpio_cdev::{Chip, LineRequestFlags};
use linux_embedded_hal::{CdevPin, Delay, I2cdev};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

/// How long a wedged bus call may hold up process exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("EnvMon starting");

    let preferences = match Preferences::from_env() {
        Ok(preferences) => preferences,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    info!(
        "Environment {:?}, {:?}, polling every {:?}",
        preferences.environment, preferences.backend, preferences.poll_interval
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start runtime: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let termination = runtime.block_on(run(preferences));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    ExitCode::from(termination.exit_code())
}

async fn run(preferences: Preferences) -> Termination {
    let shutdown = CancellationToken::new();
    listen_for_interrupt(shutdown.clone());

    match preferences.backend {
        Backend::SimulatedBus => {
            poll(&preferences, SimulatedBus::new(), SimulatedPin::new(), shutdown).await
        }
        Backend::RealBus => {
            let path = preferences.i2c_bus.clone();
            let bus = Bme680Bus::new(move |address| {
                let i2c = I2cdev::new(&path).map_err(|e| SensorError::BusNotResponding {
                    address,
                    detail: format!("{}: {}", path, e),
                })?;
                Ok((Compat(i2c), Compat(Delay)))
            });
            match open_led(&preferences) {
                Ok(pin) => poll(&preferences, bus, pin, shutdown).await,
                Err(e) => {
                    warn!(
                        "Status LED on {} line {} unavailable, running without it: {}",
                        preferences.gpio_chip, preferences.led_line, e
                    );
                    poll(&preferences, bus, SimulatedPin::new(), shutdown).await
                }
            }
        }
    }
}

async fn poll<B, P>(
    preferences: &Preferences,
    bus: B,
    pin: P,
    shutdown: CancellationToken,
) -> Termination
where
    B: SensorBus,
    P: OutputPin + Send + 'static,
{
    let indicator = IndicatorController::new(pin, BLINK_HALF_PERIOD);
    let mut poller = PollingLoop::new(preferences, indicator, ConsoleReporter, shutdown);

    let driver = SensorDriver::new(bus, MeasurementProfile::default());
    if let Err(e) = poller.register(&preferences.sensor_name, driver) {
        let termination = Termination::Misconfigured(e.to_string());
        error!("{}", termination);
        return termination;
    }

    poller.run().await
}

fn open_led(preferences: &Preferences) -> Result<CdevPin, linux_embedded_hal::gpio_cdev::Error> {
    let mut chip = Chip::new(&preferences.gpio_chip)?;
    let line = chip.get_line(preferences.led_line)?;
    let handle = line.request(LineRequestFlags::OUTPUT, 0, "envmon")?;
    CdevPin::new(handle)
}

fn listen_for_interrupt(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!("Cannot listen for interrupts: {}", e),
        }
    });
}
