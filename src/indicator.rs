use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embedded_hal::digital::{OutputPin, PinState};
use log::warn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::IndicatorFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorMode {
    On,
    Off,
    Blink,
}

struct BlinkTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives a status LED
/// `Blink` runs as its own task; any other mode stops it first
pub struct IndicatorController<P> {
    pin: Arc<Mutex<P>>,
    /// `None` until the first successful write, or after a failed one
    mode: Option<IndicatorMode>,
    blink: Option<BlinkTask>,
    half_period: Duration,
}

impl<P> IndicatorController<P>
where
    P: OutputPin + Send + 'static,
{
    pub fn new(pin: P, half_period: Duration) -> Self {
        IndicatorController {
            pin: Arc::new(Mutex::new(pin)),
            mode: None,
            blink: None,
            half_period,
        }
    }

    pub fn mode(&self) -> Option<IndicatorMode> {
        self.mode
    }

    pub fn is_blinking(&self) -> bool {
        self.blink.is_some()
    }

    /// Switches the indicator; setting the current mode again does nothing
    pub async fn set(&mut self, mode: IndicatorMode) -> Result<(), IndicatorFault> {
        if self.mode == Some(mode) {
            return Ok(());
        }
        self.stop_blink().await;

        let result = match mode {
            IndicatorMode::On => self.drive(PinState::High, mode),
            IndicatorMode::Off => self.drive(PinState::Low, mode),
            IndicatorMode::Blink => {
                self.start_blink();
                Ok(())
            }
        };
        self.mode = result.is_ok().then_some(mode);
        result
    }

    /// Stops any blinking and leaves the line low
    pub async fn release(&mut self) -> Result<(), IndicatorFault> {
        self.stop_blink().await;
        let result = self.drive(PinState::Low, IndicatorMode::Off);
        self.mode = result.is_ok().then_some(IndicatorMode::Off);
        result
    }

    fn drive(&self, state: PinState, mode: IndicatorMode) -> Result<(), IndicatorFault> {
        lock_pin(&self.pin)
            .set_state(state)
            .map_err(|e| IndicatorFault {
                mode,
                detail: format!("{:?}", e),
            })
    }

    fn start_blink(&mut self) {
        let pin = Arc::clone(&self.pin);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let half_period = self.half_period;

        let handle = tokio::spawn(async move {
            let mut state = PinState::High;
            loop {
                toggle(&pin, state);
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(half_period) => {}
                }
                state = !state;
            }
        });

        self.blink = Some(BlinkTask { token, handle });
    }

    async fn stop_blink(&mut self) {
        if let Some(task) = self.blink.take() {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("indicator blink task ended abnormally: {}", e);
            }
        }
    }
}

impl<P> Drop for IndicatorController<P> {
    fn drop(&mut self) {
        if let Some(task) = self.blink.take() {
            task.token.cancel();
        }
    }
}

fn lock_pin<P>(pin: &Mutex<P>) -> MutexGuard<'_, P> {
    pin.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One blink edge; nothing from the pin outlives the call
fn toggle<P: OutputPin>(pin: &Mutex<P>, state: PinState) {
    if let Err(e) = lock_pin(pin).set_state(state) {
        warn!("indicator blink toggle failed: {:?}", e);
    }
}
