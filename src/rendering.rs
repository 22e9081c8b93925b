use core::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::sensors::Reading;

/// Renders `<T> C,<P> hPa,<H> %RH` and, when the heater was stable, `,<G> Ohms`
impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} C,{:.2} hPa,{:.2} %RH",
            self.temperature, self.pressure, self.humidity
        )?;
        if let Some(gas) = self.gas_resistance {
            write!(f, ",{:.2} Ohms", gas)?;
        }
        Ok(())
    }
}

/// Receives every successful reading
pub trait Reporter {
    fn report(&mut self, sensor: &str, reading: &Reading);
}

/// Prints one line per reading on stdout
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&mut self, _sensor: &str, reading: &Reading) {
        println!("{}", reading);
    }
}

/// Keeps readings in memory; clones share the same list
#[derive(Debug, Clone, Default)]
pub struct CollectingReporter {
    readings: Arc<Mutex<Vec<(String, Reading)>>>,
}

impl CollectingReporter {
    pub fn readings(&self) -> Vec<(String, Reading)> {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.readings()
            .iter()
            .map(|(_, reading)| reading.to_string())
            .collect()
    }
}

impl Reporter for CollectingReporter {
    fn report(&mut self, sensor: &str, reading: &Reading) {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sensor.to_string(), *reading));
    }
}
