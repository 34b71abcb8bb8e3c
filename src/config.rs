use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub stream: StreamConfig,
    pub timing: TimingConfig,
    pub backpressure: BackpressureConfig,
}

/// Stream defaults applied at boot; all of these are host-mutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub rate_hz: f64,
    pub channels: usize,
    pub dithering: u8,
    pub compact_output: bool,
    pub sequence_validation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    // PPS acceptance
    pub pps_min_interval_ms: u32,
    pub pps_max_interval_ms: u32,
    pub max_pps_error_ppm: f32,

    // Oscillator calibration
    pub ppm_clamp: f32,
    pub ema_weight: f32,           // weight of the newest estimate
    pub direct_set_pps_count: u32, // below this, estimates are assigned directly

    // Quality state machine ages (ms since last accepted PPS)
    pub active_age_ms: u32,
    pub holdover_age_ms: u32,
    pub calibrated_age_ms: u32,

    // Clock reset handling
    pub reset_recovery_ms: u32,     // quality stays degraded this long
    pub reset_pps_blackout_ms: u32, // PPS edges ignored this long

    // Scheduler
    pub reference_update_interval: u64, // samples between rebases

    // Host rate nudges
    pub rate_gate_ppm: f32, // max change while PPS locked
    pub rate_warn_ppm: f32, // warn above this in any state

    pub stat_interval_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub min_tx_bytes: usize,   // below this the sample is dropped
    pub rearm_tx_bytes: usize, // above this the one-shot warning rearms
    pub oflow_interval_ms: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            stream: StreamConfig {
                rate_hz: 100.0,
                channels: 3,
                dithering: 4,
                compact_output: false,
                sequence_validation: true,
            },
            timing: TimingConfig {
                pps_min_interval_ms: 900,
                pps_max_interval_ms: 1100,
                max_pps_error_ppm: 1000.0,

                ppm_clamp: 200.0,
                ema_weight: 0.1,
                direct_set_pps_count: 10,

                active_age_ms: 1500,
                holdover_age_ms: 60_000,
                calibrated_age_ms: 300_000,

                reset_recovery_ms: 30_000,
                reset_pps_blackout_ms: 5_000,

                // ~2.8 hours at 100 Hz between rebases
                reference_update_interval: 1_000_000,

                rate_gate_ppm: 50.0,
                rate_warn_ppm: 1000.0,

                stat_interval_ms: 1000,
            },
            backpressure: BackpressureConfig {
                min_tx_bytes: 20,
                rearm_tx_bytes: 50,
                oflow_interval_ms: 1000,
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
