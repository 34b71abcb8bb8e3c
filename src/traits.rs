use anyhow::Result;

use crate::sampler::{AdcFilter, AdcGain, AdcRate};

/// Raw monotonic counters of the target MCU. Both counters are free-running
/// 32-bit values that wrap; the virtual clock absorbs wrap and reset.
#[cfg_attr(test, mockall::automock)]
pub trait BoardClock {
    fn raw_micros(&mut self) -> u32;
    fn raw_millis(&mut self) -> u32;
    /// Busy-wait for short pacing delays (sub-millisecond to a few ms).
    fn delay_micros(&mut self, us: u32);
}

/// Delta-sigma ADC front end: channel mux, data-ready line, conversion read.
/// The 10 ms data-ready deadline is enforced by the sampler, not the driver.
#[cfg_attr(test, mockall::automock)]
pub trait Adc {
    fn set_rate(&mut self, rate: AdcRate) -> Result<()>;
    fn set_gain(&mut self, gain: AdcGain) -> Result<()>;
    fn set_filter(&mut self, filter: AdcFilter) -> Result<()>;
    fn select_input(&mut self, pos_pin: u8, neg_pin: u8);
    fn data_ready(&mut self) -> bool;
    fn read_conversion(&mut self) -> i64;
}

/// Line-oriented serial link to the host. Writes are fire-and-forget; flow
/// control is handled above this trait via `tx_available`.
#[cfg_attr(test, mockall::automock)]
pub trait HostLink {
    fn write_line(&mut self, line: &str);
    /// Non-blocking. Returns None when no byte is pending.
    fn read_byte(&mut self) -> Option<u8>;
    /// Free space in the TX buffer, in bytes.
    fn tx_available(&mut self) -> usize;
}

/// Byte-addressable persistent store holding the calibration record.
#[cfg_attr(test, mockall::automock)]
pub trait Eeprom {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<()>;
}

/// Temperature source for oscillator temperature compensation. Injectable
/// so targets without a usable sensor can supply a fixed reading.
#[cfg_attr(test, mockall::automock)]
pub trait TempSensor {
    fn read_celsius(&mut self) -> f32;
}
