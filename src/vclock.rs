//! Continuous 64-bit microsecond time synthesized from the MCU's 32-bit
//! counters. Benign wraps are absorbed into a growing offset; backward jumps
//! that are not wraps are classified as clock resets and reported to the
//! caller, which decides how to recover.

const WRAP_HIGH_US: u32 = 4_000_000_000;
const WRAP_LOW_US: u32 = 300_000_000;
const LATE_WRAP_JUMP_US: u32 = 1_000_000_000;
const RESET_MICROS_JUMP_US: u32 = 1_000_000;
const RESET_MILLIS_JUMP_MS: u32 = 1_000;
const FRESH_BOOT_US: u32 = 5_000_000;
const FRESH_BOOT_MS: u32 = 5_000;
const PRIOR_UPTIME_US: u32 = 10_000_000;
const PRIOR_UPTIME_MS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// Expected 32-bit wraparound, already absorbed into the offset.
    Wrap { count: u32 },
    /// Raw microseconds jumped backward too far to be a wrap.
    MicrosReset { backward_us: u32 },
    /// Raw milliseconds went backward.
    MillisReset { backward_ms: u32 },
    /// Both counters are near zero after substantial uptime.
    PowerOnReset,
}

impl Anomaly {
    pub fn is_reset(&self) -> bool {
        !matches!(self, Anomaly::Wrap { .. })
    }
}

pub struct VirtualClock {
    offset_us: u64,
    last_raw_micros: u32,
    last_raw_millis: u32,
    wrap_count: u32,
    last_virtual_us: u64,
}

impl VirtualClock {
    pub fn new(raw_micros: u32, raw_millis: u32) -> Self {
        VirtualClock {
            offset_us: 0,
            last_raw_micros: raw_micros,
            last_raw_millis: raw_millis,
            wrap_count: 0,
            last_virtual_us: raw_micros as u64,
        }
    }

    /// Inspect a fresh pair of raw readings. Wraps are absorbed here; reset
    /// classifications are returned without mutating the clock so the caller
    /// can capture pre-reset state via `absorb_reset`.
    pub fn observe(&mut self, raw_micros: u32, raw_millis: u32) -> Option<Anomaly> {
        if raw_micros < self.last_raw_micros {
            if self.last_raw_micros > WRAP_HIGH_US && raw_micros < WRAP_LOW_US {
                self.wrap_count += 1;
                self.offset_us += 1u64 << 32;
                self.last_raw_micros = raw_micros;
                self.last_raw_millis = raw_millis;
                return Some(Anomaly::Wrap {
                    count: self.wrap_count,
                });
            }

            let backward_us = self.last_raw_micros - raw_micros;
            if backward_us > RESET_MICROS_JUMP_US {
                return Some(Anomaly::MicrosReset { backward_us });
            }
        }

        if raw_millis < self.last_raw_millis {
            let backward_ms = self.last_raw_millis - raw_millis;
            if backward_ms > RESET_MILLIS_JUMP_MS {
                return Some(Anomaly::MillisReset { backward_ms });
            }
        }

        if raw_micros < FRESH_BOOT_US
            && raw_millis < FRESH_BOOT_MS
            && (self.last_raw_micros > PRIOR_UPTIME_US || self.last_raw_millis > PRIOR_UPTIME_MS)
        {
            return Some(Anomaly::PowerOnReset);
        }

        self.last_raw_micros = raw_micros;
        self.last_raw_millis = raw_millis;
        None
    }

    /// Current virtual time. Catches wraps that happened since the last
    /// `observe` and never returns a value below a previous return.
    pub fn now(&mut self, raw_micros: u32) -> u64 {
        if raw_micros < self.last_raw_micros {
            let backward_us = self.last_raw_micros - raw_micros;
            if backward_us > LATE_WRAP_JUMP_US {
                self.wrap_count += 1;
                self.offset_us += 1u64 << 32;
            }
        }

        self.last_raw_micros = raw_micros;
        let virtual_us = self.offset_us + raw_micros as u64;
        self.last_virtual_us = self.last_virtual_us.max(virtual_us);
        self.last_virtual_us
    }

    /// Map a raw timestamp (e.g. a PPS edge capture) into the virtual domain.
    pub fn virtualize(&self, raw_micros: u32) -> u64 {
        self.offset_us + raw_micros as u64
    }

    /// Fold the pre-reset virtual time into the offset so time keeps counting
    /// forward from where it was. Returns the preserved virtual time.
    pub fn absorb_reset(&mut self, raw_micros: u32, raw_millis: u32) -> u64 {
        let pre_reset_virtual = self.offset_us + self.last_raw_micros as u64;
        self.offset_us = pre_reset_virtual;
        self.last_raw_micros = raw_micros;
        self.last_raw_millis = raw_millis;
        self.last_virtual_us = self.last_virtual_us.max(pre_reset_virtual);
        pre_reset_virtual
    }

    pub fn wrap_count(&self) -> u32 {
        self.wrap_count
    }

    pub fn offset_us(&self) -> u64 {
        self.offset_us
    }
}

// ============================================================================
// TESTS
// ============================================================================
