use serde::{Deserialize, Serialize};

/// Snapshot of the timing core, taken by the controller for telemetry and
/// assertions in tests. Field values mirror what the STAT beacon and the
/// GET_STATUS/GET_TIMING_STATUS replies report.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TimingStatus {
    /// True while the sample stream is running (including a pending
    /// synchronized start).
    pub streaming: bool,

    /// Quality code: 0 active, 1 holdover, 2 calibrated, 3 raw.
    pub quality_code: u8,
    pub quality_name: String,

    /// Estimated timing accuracy bound, µs.
    pub accuracy_us: f32,

    /// Current oscillator correction, signed ppm.
    pub ppm: f32,

    pub pps_valid: bool,
    pub cal_valid: bool,
    pub pps_count: u32,
    pub pps_age_ms: u32,

    pub clock_resets: u32,
    pub wraparounds: u32,
    pub reference_updates: u32,

    pub buffer_overflows: u32,
    pub samples_skipped: u32,
    pub sequence_gaps: u32,
    pub sequence_resets: u32,

    pub boot_id: u32,
    pub stream_id: u32,
    pub sample_index: u64,
    pub samples_generated: u64,
    pub adc_deadline_misses: u32,
}

impl Default for TimingStatus {
    fn default() -> Self {
        TimingStatus {
            streaming: false,
            quality_code: 3,
            quality_name: "INTERNAL_RAW".to_string(),
            accuracy_us: 1000.0,
            ppm: 0.0,
            pps_valid: false,
            cal_valid: false,
            pps_count: 0,
            pps_age_ms: 0,
            clock_resets: 0,
            wraparounds: 0,
            reference_updates: 0,
            buffer_overflows: 0,
            samples_skipped: 0,
            sequence_gaps: 0,
            sequence_resets: 0,
            boot_id: 0,
            stream_id: 0,
            sample_index: 0,
            samples_generated: 0,
            adc_deadline_misses: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_status_default() {
        let status = TimingStatus::default();
        assert!(!status.streaming);
        assert_eq!(status.quality_code, 3);
        assert_eq!(status.quality_name, "INTERNAL_RAW");
        assert!((status.accuracy_us - 1000.0).abs() < f32::EPSILON);
        assert!(!status.pps_valid);
    }

    #[test]
    fn test_timing_status_serde_roundtrip() {
        let mut status = TimingStatus::default();
        status.streaming = true;
        status.quality_code = 0;
        status.quality_name = "PPS_ACTIVE".to_string();
        status.ppm = -23.5;
        status.pps_count = 120;

        let json = serde_json::to_string(&status).expect("serialize failed");
        let restored: TimingStatus = serde_json::from_str(&json).expect("deserialize failed");

        assert!(restored.streaming);
        assert_eq!(restored.quality_code, 0);
        assert_eq!(restored.quality_name, "PPS_ACTIVE");
        assert!((restored.ppm + 23.5).abs() < f32::EPSILON);
        assert_eq!(restored.pps_count, 120);
    }
}
