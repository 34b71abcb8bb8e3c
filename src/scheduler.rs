//! Fractional-interval sample scheduler.
//!
//! The next firing time is kept in whole virtual microseconds while the
//! fractional remainder of each step accumulates in a double. Over N steps the
//! long-term average spacing equals the effective interval to well under a
//! microsecond, which is what keeps the stream's mean rate locked to the
//! PPS-disciplined oscillator estimate.

/// Hard cap on the per-sample phase correction, µs.
pub const MAX_PHASE_ADJUST_US: f64 = 20.0;

/// A phase-alignment plan spreads a signed phase error across a number of
/// samples. Installing a new plan replaces the old one; plans never stack.
#[derive(Debug, Clone, Copy)]
pub struct PhasePlan {
    active: bool,
    per_sample_adjust_us: f64,
    samples_remaining: u32,
    error_us: f64,
}

impl PhasePlan {
    pub fn idle() -> Self {
        PhasePlan {
            active: false,
            per_sample_adjust_us: 0.0,
            samples_remaining: 0,
            error_us: 0.0,
        }
    }

    /// Build a plan correcting `error_us` over at most `max_samples`, with the
    /// per-sample adjustment clamped to ±20 µs. When the clamp bites, the
    /// sample count grows so the full error is still corrected.
    pub fn spread(error_us: f64, max_samples: u32) -> Self {
        let max_samples = max_samples.max(1);
        let mut per_sample = error_us / max_samples as f64;
        per_sample = per_sample.clamp(-MAX_PHASE_ADJUST_US, MAX_PHASE_ADJUST_US);

        let samples = if per_sample.abs() > 0.0 {
            ((error_us.abs() / per_sample.abs()) + 0.5) as u32
        } else {
            1
        };

        PhasePlan {
            active: true,
            per_sample_adjust_us: per_sample,
            samples_remaining: samples.max(1),
            error_us,
        }
    }

    pub fn clear(&mut self) {
        *self = PhasePlan::idle();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn per_sample_adjust_us(&self) -> f64 {
        self.per_sample_adjust_us
    }

    pub fn samples_remaining(&self) -> u32 {
        self.samples_remaining
    }

    pub fn error_us(&self) -> f64 {
        self.error_us
    }

    /// Consume one step of the plan. Returns the adjustment to fold into the
    /// scheduler step, or None when no plan is active.
    fn take_step(&mut self) -> Option<f64> {
        if !self.active || self.samples_remaining == 0 {
            return None;
        }
        let adjust = self.per_sample_adjust_us;
        self.samples_remaining -= 1;
        if self.samples_remaining == 0 {
            self.clear();
        }
        Some(adjust)
    }
}

/// Signed phase of `pps_virtual_us` relative to the sampling grid anchored at
/// `base_virtual_us`, normalized into (-interval/2, +interval/2].
pub fn signed_phase_error(pps_virtual_us: u64, base_virtual_us: u64, interval_us: u64) -> i64 {
    let interval = interval_us as i64;
    let delta = pps_virtual_us.wrapping_sub(base_virtual_us) as i64;
    let phase_mod = ((delta % interval) + interval) % interval;
    if phase_mod <= interval / 2 {
        phase_mod
    } else {
        phase_mod - interval
    }
}

pub struct Scheduler {
    nominal_interval_us: u64,
    effective_interval_us: f64,
    phase_acc_us: f64,
    base_virtual_us: u64,
    next_sample_virtual_us: u64,
    sample_index: u64,
    reference_update_interval: u64,
    rebase_count: u32,
    established: bool,
}

impl Scheduler {
    pub fn new(rate_hz: f64, reference_update_interval: u64) -> Self {
        let nominal = (1_000_000.0 / rate_hz).round() as u64;
        Scheduler {
            nominal_interval_us: nominal,
            effective_interval_us: nominal as f64,
            phase_acc_us: 0.0,
            base_virtual_us: 0,
            next_sample_virtual_us: 0,
            sample_index: 0,
            reference_update_interval,
            rebase_count: 0,
            established: false,
        }
    }

    pub fn set_rate(&mut self, rate_hz: f64) {
        self.nominal_interval_us = (1_000_000.0 / rate_hz).round() as u64;
        self.effective_interval_us = self.nominal_interval_us as f64;
    }

    pub fn set_nominal_interval(&mut self, interval_us: u64) {
        self.nominal_interval_us = interval_us;
        self.effective_interval_us = interval_us as f64;
    }

    pub fn nominal_interval_us(&self) -> u64 {
        self.nominal_interval_us
    }

    pub fn base_virtual_us(&self) -> u64 {
        self.base_virtual_us
    }

    pub fn next_sample_virtual_us(&self) -> u64 {
        self.next_sample_virtual_us
    }

    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    pub fn rebase_count(&self) -> u32 {
        self.rebase_count
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Anchor the grid at the next interval boundary at or after `now`.
    pub fn establish(&mut self, now_virtual_us: u64) {
        let offset = now_virtual_us % self.nominal_interval_us;
        let base = now_virtual_us + (self.nominal_interval_us - offset);
        self.establish_at(base);
    }

    /// Anchor the grid at an exact point, e.g. a PPS edge or a sync target.
    pub fn establish_at(&mut self, base_virtual_us: u64) {
        self.base_virtual_us = base_virtual_us;
        self.next_sample_virtual_us = base_virtual_us;
        self.sample_index = 0;
        self.phase_acc_us = 0.0;
        self.established = true;
    }

    pub fn teardown(&mut self) {
        self.established = false;
    }

    /// Recompute the effective interval from the oscillator correction.
    /// Positive ppm means the hardware counter runs fast, so fewer of its
    /// ticks fit in one real-time interval.
    pub fn refresh_effective(&mut self, ppm: f32) {
        self.effective_interval_us =
            self.nominal_interval_us as f64 * (1.0 - (ppm as f64 / 1e6));
    }

    pub fn effective_interval_us(&self) -> f64 {
        self.effective_interval_us
    }

    pub fn due(&self, now_virtual_us: u64) -> bool {
        self.established && now_virtual_us >= self.next_sample_virtual_us
    }

    /// Advance the grid after a firing at `now`. Missed slots are jumped over
    /// in one step so a stalled loop never produces a catch-up burst; the
    /// return value is how many slots were skipped.
    pub fn advance_after_fire(&mut self, now_virtual_us: u64, plan: &mut PhasePlan) -> u64 {
        let late_us = now_virtual_us.saturating_sub(self.next_sample_virtual_us);
        let missed = (late_us as f64 / self.effective_interval_us) as u64;
        if missed > 0 {
            self.next_sample_virtual_us += (missed as f64 * self.effective_interval_us) as u64;
        }

        let mut step = self.effective_interval_us + self.phase_acc_us;
        if let Some(adjust) = plan.take_step() {
            step += adjust;
        }

        let whole = step.floor() as u64;
        self.phase_acc_us = step - whole as f64;
        self.next_sample_virtual_us += whole;

        missed
    }

    pub fn note_sample_emitted(&mut self) {
        self.sample_index += 1;
    }

    pub fn needs_rebase(&self) -> bool {
        self.sample_index >= self.reference_update_interval
    }

    /// Re-anchor the grid at the present to bound 64-bit arithmetic growth.
    /// Returns the number of samples in the epoch that just closed.
    pub fn rebase(&mut self, now_virtual_us: u64) -> u64 {
        let closed = self.sample_index;
        self.base_virtual_us = now_virtual_us;
        self.next_sample_virtual_us = now_virtual_us;
        self.sample_index = 0;
        self.rebase_count += 1;
        closed
    }

    /// After a clock reset, recompute the sample index from elapsed virtual
    /// time so emission continuity is preserved.
    pub fn resync_index(&mut self, now_virtual_us: u64) -> u64 {
        let elapsed = now_virtual_us.saturating_sub(self.base_virtual_us);
        self.sample_index = elapsed / self.nominal_interval_us;
        self.sample_index
    }

    pub fn phase_acc_us(&self) -> f64 {
        self.phase_acc_us
    }
}

// ============================================================================
// TESTS
// ============================================================================
