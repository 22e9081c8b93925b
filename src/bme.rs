use core::fmt::Debug;

use bme680::{
    Bme680, FieldDataCondition, I2CAddress, IIRFilterSize, OversamplingSetting, PowerMode,
    SettingsBuilder,
};
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use embedded_hal_02::blocking::delay::DelayMs;
use embedded_hal_02::blocking::i2c::{Read, Write};
use log::debug;

use crate::error::SensorError;
use crate::sensors::{
    Acquisition, BusAddress, FilterSize, MeasurementProfile, Oversampling, Reading, SensorBus,
    SensorDevice,
};

type Opener<I, D> = Box<dyn FnMut(BusAddress) -> Result<(I, D), SensorError> + Send>;

/// Lends an embedded-hal 1.0 bus or delay to the bme680 driver, which speaks
/// the 0.2 blocking traits
#[derive(Debug)]
pub struct Compat<T>(pub T);

impl<T: I2c> Read for Compat<T> {
    type Error = T::Error;

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), Self::Error> {
        I2c::read(&mut self.0, address, buffer)
    }
}

impl<T: I2c> Write for Compat<T> {
    type Error = T::Error;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        I2c::write(&mut self.0, address, bytes)
    }
}

impl<T: DelayNs> DelayMs<u8> for Compat<T> {
    fn delay_ms(&mut self, ms: u8) {
        DelayNs::delay_ms(&mut self.0, u32::from(ms));
    }
}

/// BME680 on a real I2C bus
/// The bus is reopened for every connection attempt because a failed
/// `Bme680::init` consumes the I2C handle
pub struct Bme680Bus<I, D> {
    open: Opener<I, D>,
}

impl<I, D> Bme680Bus<I, D> {
    /// open: produces a fresh I2C handle and the delay used for the chip's
    /// measurement timing, given the address about to be probed
    pub fn new<F>(open: F) -> Self
    where
        F: FnMut(BusAddress) -> Result<(I, D), SensorError> + Send + 'static,
    {
        Bme680Bus {
            open: Box::new(open),
        }
    }
}

impl<I, D> SensorBus for Bme680Bus<I, D>
where
    I: Read + Write + Send + 'static,
    <I as Read>::Error: Debug,
    <I as Write>::Error: Debug,
    D: DelayMs<u8> + Send + 'static,
{
    type Device = Bme680Device<I, D>;

    fn connect(&mut self, address: BusAddress) -> Result<Self::Device, SensorError> {
        let (i2c, mut delay) = (self.open)(address)?;
        let sensor = Bme680::init(i2c, &mut delay, i2c_address(address)).map_err(|e| {
            SensorError::BusNotResponding {
                address,
                detail: format!("{:?}", e),
            }
        })?;
        Ok(Bme680Device { sensor, delay })
    }
}

pub struct Bme680Device<I, D> {
    sensor: Bme680<I, D>,
    delay: D,
}

impl<I, D> SensorDevice for Bme680Device<I, D>
where
    I: Read + Write + Send + 'static,
    <I as Read>::Error: Debug,
    <I as Write>::Error: Debug,
    D: DelayMs<u8> + Send + 'static,
{
    fn apply_profile(&mut self, profile: &MeasurementProfile) -> Result<(), SensorError> {
        // The driver only programs heater set-point 0
        if profile.heater.profile_index != 0 {
            return Err(SensorError::ConfigurationFailed(format!(
                "heater profile {} is not supported",
                profile.heater.profile_index
            )));
        }

        let settings = SettingsBuilder::new()
            .with_humidity_oversampling(oversampling(profile.humidity_oversampling))
            .with_pressure_oversampling(oversampling(profile.pressure_oversampling))
            .with_temperature_oversampling(oversampling(profile.temperature_oversampling))
            .with_temperature_filter(filter_size(profile.filter))
            .with_gas_measurement(
                profile.heater.duration,
                profile.heater.target_celsius,
                profile.heater.ambient_celsius,
            )
            .with_run_gas(profile.gas_enabled)
            .build();

        self.sensor
            .set_sensor_settings(&mut self.delay, settings)
            .map_err(|e| SensorError::ConfigurationFailed(format!("{:?}", e)))
    }

    fn read(&mut self) -> Result<Acquisition, SensorError> {
        // Every measurement needs a fresh trip through forced mode
        self.sensor
            .set_sensor_mode(&mut self.delay, PowerMode::ForcedMode)
            .map_err(|e| SensorError::AcquisitionFailed(format!("{:?}", e)))?;

        match self.sensor.get_sensor_data(&mut self.delay) {
            Ok((data, FieldDataCondition::NewData)) => {
                let gas = data
                    .heat_stable()
                    .then(|| data.gas_resistance_ohm() as f32);
                Ok(Acquisition::Reading(Reading::new(
                    data.temperature_celsius(),
                    data.pressure_hpa(),
                    data.humidity_percent(),
                    gas,
                )))
            }
            Ok((_, FieldDataCondition::Unchanged)) | Err(bme680::Error::NoNewData) => {
                debug!("BME680 measurement not finished");
                Ok(Acquisition::NotReady)
            }
            Err(e) => Err(SensorError::AcquisitionFailed(format!("{:?}", e))),
        }
    }
}

fn i2c_address(address: BusAddress) -> I2CAddress {
    match address {
        BusAddress::Primary => I2CAddress::Primary,
        BusAddress::Secondary => I2CAddress::Secondary,
    }
}

fn oversampling(setting: Oversampling) -> OversamplingSetting {
    match setting {
        Oversampling::Skip => OversamplingSetting::OSNone,
        Oversampling::X1 => OversamplingSetting::OS1x,
        Oversampling::X2 => OversamplingSetting::OS2x,
        Oversampling::X4 => OversamplingSetting::OS4x,
        Oversampling::X8 => OversamplingSetting::OS8x,
        Oversampling::X16 => OversamplingSetting::OS16x,
    }
}

fn filter_size(size: FilterSize) -> IIRFilterSize {
    match size {
        FilterSize::Off => IIRFilterSize::Size0,
        FilterSize::Size1 => IIRFilterSize::Size1,
        FilterSize::Size3 => IIRFilterSize::Size3,
        FilterSize::Size7 => IIRFilterSize::Size7,
        FilterSize::Size15 => IIRFilterSize::Size15,
        FilterSize::Size31 => IIRFilterSize::Size31,
        FilterSize::Size63 => IIRFilterSize::Size63,
        FilterSize::Size127 => IIRFilterSize::Size127,
    }
}
