//! PPS discipline: estimates oscillator drift from the spacing of validated
//! PPS edges, smooths it into a ppm correction, and anchors the calibrated
//! timebase at every accepted edge. The caller (controller) turns outcomes
//! into protocol lines and persists accepted updates.

use crate::config::TimingConfig;

const PPS_NOMINAL_INTERVAL_US: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EstimateResult {
    /// No prior anchor; this edge only establishes one.
    NotReady,
    /// Estimate outside the sanity bound; ppm untouched, anchor refreshed.
    Rejected { error_ppm: f32 },
    Updated {
        error_ppm: f32,
        interval_us: u64,
        /// Pre-clamp value when the clamp bit.
        clamped_from: Option<f32>,
        /// Newly learned temperature coefficient, ppm per °C.
        tempco_learned: Option<f32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PpsOutcome {
    /// Edge arrived inside the post-reset blackout window.
    IgnoredResetRecovery,
    /// Edge spacing was outside the accepted cadence window.
    IgnoredBadCadence { interval_ms: u32 },
    Accepted {
        estimate: EstimateResult,
        /// True when PPS was not valid before this edge.
        reacquired: bool,
    },
}

pub struct Discipline {
    pub ppm: f32,
    pub cal_valid: bool,
    pub pps_valid: bool,
    pub cal_base_virtual_us: u64,
    pub cal_base_millis: u32,
    pub last_pps_ms: u32,
    pub pps_count: u32,
    pub pps_miss_count: u32,

    pub tempco_ppm_per_c: f32,
    pub reference_temp_c: f32,
    pub current_temp_c: f32,
    pub temp_comp_enabled: bool,

    cfg: TimingConfig,
}

impl Discipline {
    pub fn new(cfg: TimingConfig) -> Self {
        Discipline {
            ppm: 0.0,
            cal_valid: false,
            pps_valid: false,
            cal_base_virtual_us: 0,
            cal_base_millis: 0,
            last_pps_ms: 0,
            pps_count: 0,
            pps_miss_count: 0,
            tempco_ppm_per_c: 0.0,
            reference_temp_c: 25.0,
            current_temp_c: 25.0,
            temp_comp_enabled: false,
            cfg,
        }
    }

    /// Seed the correction from the persistent store at boot.
    pub fn load_stored_ppm(&mut self, ppm: f32) {
        self.ppm = ppm;
        self.cal_valid = true;
    }

    pub fn pps_age_ms(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.last_pps_ms)
    }

    /// Process one captured PPS edge, already mapped into virtual time.
    pub fn on_pps(
        &mut self,
        pps_virtual_us: u64,
        captured_at_ms: u32,
        in_reset_blackout: bool,
        temp_c: f32,
    ) -> PpsOutcome {
        self.pps_count += 1;

        if in_reset_blackout {
            return PpsOutcome::IgnoredResetRecovery;
        }

        if self.pps_valid {
            let interval_ms = captured_at_ms.wrapping_sub(self.last_pps_ms);
            if interval_ms < self.cfg.pps_min_interval_ms
                || interval_ms > self.cfg.pps_max_interval_ms
            {
                return PpsOutcome::IgnoredBadCadence { interval_ms };
            }
        }

        let mut estimate = EstimateResult::NotReady;
        if self.pps_count > 1 && self.cal_valid {
            let interval_us = pps_virtual_us.saturating_sub(self.cal_base_virtual_us);
            // µs of deviation over one second is exactly ppm
            let error_ppm = (interval_us as f64 - PPS_NOMINAL_INTERVAL_US) as f32;

            if error_ppm.abs() >= self.cfg.max_pps_error_ppm {
                estimate = EstimateResult::Rejected { error_ppm };
            } else {
                if self.pps_count < self.cfg.direct_set_pps_count {
                    self.ppm = -error_ppm;
                } else {
                    let w = self.cfg.ema_weight;
                    self.ppm = (1.0 - w) * self.ppm + w * (-error_ppm);
                }

                let clamped_from = self.clamp_ppm();
                let tempco_learned = self.learn_temperature(temp_c);

                estimate = EstimateResult::Updated {
                    error_ppm,
                    interval_us,
                    clamped_from,
                    tempco_learned,
                };
            }
        }

        let reacquired = !self.pps_valid;
        self.pps_valid = true;
        self.cal_valid = true;
        self.cal_base_virtual_us = pps_virtual_us;
        self.cal_base_millis = captured_at_ms;
        self.last_pps_ms = captured_at_ms;
        self.current_temp_c = temp_c;
        self.pps_miss_count = 0;

        PpsOutcome::Accepted {
            estimate,
            reacquired,
        }
    }

    /// Host-commanded correction; clamped and marked valid.
    pub fn set_manual_ppm(&mut self, ppm: f32) -> Option<f32> {
        self.ppm = ppm;
        self.cal_valid = true;
        self.clamp_ppm()
    }

    /// Map a virtual instant onto the PPS-disciplined timebase. Positive ppm
    /// stretches elapsed counter ticks into real time; the inverse sign lives
    /// in the scheduler's effective interval.
    pub fn calibrated_timestamp(&self, now_virtual_us: u64) -> u64 {
        if !self.cal_valid {
            return now_virtual_us;
        }
        let elapsed = now_virtual_us.saturating_sub(self.cal_base_virtual_us) as f64;
        let corrected = elapsed * (1.0 + self.ppm as f64 / 1e6);
        self.cal_base_virtual_us + corrected as u64
    }

    /// Apply the learned temperature coefficient while coasting on internal
    /// calibration. Returns the correction applied, if any.
    pub fn apply_temp_compensation(&mut self, temp_c: f32, in_internal_cal: bool) -> Option<f32> {
        self.current_temp_c = temp_c;
        if !self.temp_comp_enabled || !in_internal_cal {
            return None;
        }

        let correction = (temp_c - self.reference_temp_c) * self.tempco_ppm_per_c;
        if correction == 0.0 {
            return None;
        }
        self.ppm += correction;
        self.clamp_ppm();
        Some(correction)
    }

    /// Invalidate calibration after a clock reset; the stored ppm survives in
    /// RAM but timestamps fall back to raw until PPS re-anchors.
    pub fn invalidate_for_reset(&mut self) {
        self.cal_valid = false;
    }

    /// Count whole seconds of holdover as missed pulses.
    pub fn note_degraded(&mut self, pps_age_ms: u32) {
        self.pps_miss_count = pps_age_ms / 1000;
    }

    fn clamp_ppm(&mut self) -> Option<f32> {
        let limit = self.cfg.ppm_clamp;
        if self.ppm.abs() > limit {
            let before = self.ppm;
            self.ppm = self.ppm.clamp(-limit, limit);
            Some(before)
        } else {
            None
        }
    }

    fn learn_temperature(&mut self, temp_c: f32) -> Option<f32> {
        if self.pps_count <= 100 || self.pps_count % 50 != 0 {
            return None;
        }
        let temp_change = temp_c - self.reference_temp_c;
        if temp_change.abs() <= 1.0 {
            return None;
        }
        self.tempco_ppm_per_c = self.ppm / temp_change;
        self.temp_comp_enabled = true;
        Some(self.tempco_ppm_per_c)
    }
}

// ============================================================================
// TESTS
// ============================================================================
