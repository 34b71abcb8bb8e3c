//! ADC acquisition: data-rate/gain/filter presets, deadline-bounded
//! conversion reads, optional oversampling, and the throughput monitor that
//! warns when the configured preset cannot keep up with the stream.

use crate::traits::{Adc, BoardClock};

/// Data-ready must assert within this window or the conversion is abandoned.
pub const ADC_DEADLINE_US: u32 = 10_000;

/// Spacing between oversampled conversions.
pub const DITHER_SPACING_US: u32 = 50;

/// Differential input pin pairs for the three stream channels.
pub const CHANNEL_PINS: [(u8, u8); 3] = [(0, 1), (2, 3), (4, 5)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcRate {
    Sps2_5,
    Sps5,
    Sps10,
    Sps16_6,
    Sps20,
    Sps50,
    Sps60,
    Sps100,
    Sps400,
    Sps1200,
    Sps2400,
    Sps4800,
    Sps7200,
    Sps14400,
    Sps19200,
    Sps38400,
}

impl AdcRate {
    pub fn from_index(index: u8) -> Option<Self> {
        use AdcRate::*;
        const TABLE: [AdcRate; 16] = [
            Sps2_5, Sps5, Sps10, Sps16_6, Sps20, Sps50, Sps60, Sps100, Sps400, Sps1200, Sps2400,
            Sps4800, Sps7200, Sps14400, Sps19200, Sps38400,
        ];
        if (1..=16).contains(&index) {
            Some(TABLE[index as usize - 1])
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        use AdcRate::*;
        match self {
            Sps2_5 => 1,
            Sps5 => 2,
            Sps10 => 3,
            Sps16_6 => 4,
            Sps20 => 5,
            Sps50 => 6,
            Sps60 => 7,
            Sps100 => 8,
            Sps400 => 9,
            Sps1200 => 10,
            Sps2400 => 11,
            Sps4800 => 12,
            Sps7200 => 13,
            Sps14400 => 14,
            Sps19200 => 15,
            Sps38400 => 16,
        }
    }

    /// Conversion throughput of the preset, truncated to whole samples/s.
    pub fn sps(self) -> u32 {
        use AdcRate::*;
        match self {
            Sps2_5 => 2,
            Sps5 => 5,
            Sps10 => 10,
            Sps16_6 => 16,
            Sps20 => 20,
            Sps50 => 50,
            Sps60 => 60,
            Sps100 => 100,
            Sps400 => 400,
            Sps1200 => 1200,
            Sps2400 => 2400,
            Sps4800 => 4800,
            Sps7200 => 7200,
            Sps14400 => 14400,
            Sps19200 => 19200,
            Sps38400 => 38400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcGain {
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
}

impl AdcGain {
    pub fn from_index(index: u8) -> Option<Self> {
        use AdcGain::*;
        const TABLE: [AdcGain; 6] = [X1, X2, X4, X8, X16, X32];
        if (1..=6).contains(&index) {
            Some(TABLE[index as usize - 1])
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        use AdcGain::*;
        match self {
            X1 => 1,
            X2 => 2,
            X4 => 3,
            X8 => 4,
            X16 => 5,
            X32 => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcFilter {
    Sinc1,
    Sinc2,
    Sinc3,
    Sinc4,
    Fir,
}

impl AdcFilter {
    pub fn from_index(index: u8) -> Option<Self> {
        use AdcFilter::*;
        const TABLE: [AdcFilter; 5] = [Sinc1, Sinc2, Sinc3, Sinc4, Fir];
        if (1..=5).contains(&index) {
            Some(TABLE[index as usize - 1])
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        use AdcFilter::*;
        match self {
            Sinc1 => 1,
            Sinc2 => 2,
            Sinc3 => 3,
            Sinc4 => 4,
            Fir => 5,
        }
    }

    pub fn name(self) -> &'static str {
        use AdcFilter::*;
        match self {
            Sinc1 => "SINC1",
            Sinc2 => "SINC2",
            Sinc3 => "SINC3",
            Sinc4 => "SINC4",
            Fir => "FIR",
        }
    }
}

/// Tracks conversion health across a stream. The throughput warning is
/// one-shot and rearms once the preset is adequate again.
#[derive(Default)]
pub struct ThroughputMonitor {
    pub deadline_misses: u32,
    pub total_conversions: u32,
    warning_sent: bool,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns Some((required, available)) exactly once per inadequacy event.
    pub fn verify(&mut self, required_sps: u32, available_sps: u32) -> Option<(u32, u32)> {
        let adequate = available_sps >= required_sps;
        if !adequate && !self.warning_sent {
            self.warning_sent = true;
            return Some((required_sps, available_sps));
        }
        if adequate && self.warning_sent {
            self.warning_sent = false;
        }
        None
    }
}

pub struct Sampler {
    pub rate: AdcRate,
    pub gain: AdcGain,
    pub filter: AdcFilter,
    pub dithering: u8,
    pub channels: usize,
    pub monitor: ThroughputMonitor,
}

impl Sampler {
    pub fn new(channels: usize, dithering: u8) -> Self {
        Sampler {
            rate: AdcRate::Sps19200,
            gain: AdcGain::X1,
            filter: AdcFilter::Sinc3,
            dithering,
            channels,
            monitor: ThroughputMonitor::new(),
        }
    }

    /// Conversions per second the current stream setup demands. The factor of
    /// two covers filter settling and mux switching overhead.
    pub fn required_sps(&self, stream_rate_hz: f64) -> u32 {
        let oversample = self.dithering.max(1) as u32;
        (self.channels as u32) * oversample * (stream_rate_hz as u32) * 2
    }

    /// Acquire one sample for all active channels. With dithering enabled,
    /// each channel is converted `dithering` times, 50 µs apart, and the
    /// integer mean is returned. Inactive channels read as zero.
    pub fn acquire<C: BoardClock, A: Adc>(&mut self, clock: &mut C, adc: &mut A) -> [i64; 3] {
        let mut values = [0i64; 3];

        if self.dithering == 0 {
            for ch in 0..self.channels.min(3) {
                values[ch] = self.read_channel(clock, adc, ch);
            }
            return values;
        }

        let rounds = self.dithering as i64;
        let mut sums = [0i64; 3];
        for round in 0..self.dithering {
            for ch in 0..self.channels.min(3) {
                sums[ch] += self.read_channel(clock, adc, ch);
            }
            if round + 1 < self.dithering {
                clock.delay_micros(DITHER_SPACING_US);
            }
        }
        for ch in 0..self.channels.min(3) {
            values[ch] = sums[ch] / rounds;
        }
        values
    }

    fn read_channel<C: BoardClock, A: Adc>(
        &mut self,
        clock: &mut C,
        adc: &mut A,
        channel: usize,
    ) -> i64 {
        let (pos, neg) = CHANNEL_PINS[channel];
        adc.select_input(pos, neg);

        let start = clock.raw_micros();
        while !adc.data_ready() {
            if clock.raw_micros().wrapping_sub(start) > ADC_DEADLINE_US {
                self.monitor.deadline_misses += 1;
                return 0;
            }
        }

        self.monitor.total_conversions += 1;
        adc.read_conversion()
    }
}

// ============================================================================
// TESTS
// ============================================================================
