//! Timing-quality state machine. Classification is a pure function of the
//! discipline flags and the age of the last accepted PPS; the warning latches
//! carry the one-shot reporting state across ticks.

use crate::config::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingQuality {
    PpsActive,
    PpsHoldover,
    InternalCal,
    InternalRaw,
}

impl TimingQuality {
    pub fn code(self) -> u8 {
        match self {
            TimingQuality::PpsActive => 0,
            TimingQuality::PpsHoldover => 1,
            TimingQuality::InternalCal => 2,
            TimingQuality::InternalRaw => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TimingQuality::PpsActive => "PPS_ACTIVE",
            TimingQuality::PpsHoldover => "PPS_HOLDOVER",
            TimingQuality::InternalCal => "INTERNAL_CAL",
            TimingQuality::InternalRaw => "INTERNAL_RAW",
        }
    }
}

pub struct QualityInputs {
    pub pps_valid: bool,
    pub cal_valid: bool,
    pub pps_age_ms: u32,
    pub recent_reset: bool,
}

/// Classify the current timing source and its estimated accuracy in µs.
pub fn classify(inputs: &QualityInputs, cfg: &TimingConfig) -> (TimingQuality, f32) {
    let age = inputs.pps_age_ms;

    if inputs.pps_valid && age < cfg.active_age_ms && !inputs.recent_reset {
        (TimingQuality::PpsActive, 1.0)
    } else if inputs.pps_valid && age < cfg.holdover_age_ms && !inputs.recent_reset {
        // ppm stays frozen at the last good value; uncertainty grows slowly
        (TimingQuality::PpsHoldover, 1.0 + (age as f32 / 1000.0) * 0.1)
    } else if inputs.cal_valid && age < cfg.calibrated_age_ms && !inputs.recent_reset {
        (TimingQuality::InternalCal, 10.0 + (age as f32 / 1000.0) * 0.3)
    } else {
        let accuracy = if inputs.recent_reset { 2000.0 } else { 1000.0 };
        (TimingQuality::InternalRaw, accuracy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationWarning {
    /// PPS stopped arriving; caller should drop `pps_valid`.
    PpsLost { age_s: u32 },
    /// Raw mode entered because of a recent clock reset.
    RawAfterReset,
}

/// One-shot warning latches for raw-mode entry. The two causes de-latch each
/// other so alternating events are each reported once.
#[derive(Default)]
pub struct WarningLatches {
    degradation_warned: bool,
    reset_warned: bool,
}

impl WarningLatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_raw_entry(
        &mut self,
        pps_valid: bool,
        recent_reset: bool,
        pps_age_ms: u32,
    ) -> Option<DegradationWarning> {
        if recent_reset && !self.reset_warned {
            self.reset_warned = true;
            self.degradation_warned = false;
            return Some(DegradationWarning::RawAfterReset);
        }
        if pps_valid && !self.degradation_warned && !recent_reset {
            self.degradation_warned = true;
            self.reset_warned = false;
            return Some(DegradationWarning::PpsLost {
                age_s: pps_age_ms / 1000,
            });
        }
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================
