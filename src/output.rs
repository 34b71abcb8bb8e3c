//! Host-side emission: TX back-pressure, sequence validation, and the
//! line-record formats. Every record is written as a single line so records
//! never interleave.

use crate::config::BackpressureConfig;
use crate::traits::HostLink;

/// Watches the TX buffer and drops samples instead of blocking when the host
/// stops draining. The `OFLOW:` meta record is rate-limited to one per
/// reporting interval; the near-overflow warning is one-shot and rearms once
/// the buffer recovers.
pub struct BackpressureMonitor {
    min_tx_bytes: usize,
    rearm_tx_bytes: usize,
    oflow_interval_ms: u32,

    overflows: u32,
    skipped_samples: u32,
    oflow_messages: u32,
    bytes_sent: u64,
    warning_sent: bool,
    last_oflow_ms: u32,
}

impl BackpressureMonitor {
    pub fn new(cfg: &BackpressureConfig) -> Self {
        BackpressureMonitor {
            min_tx_bytes: cfg.min_tx_bytes,
            rearm_tx_bytes: cfg.rearm_tx_bytes,
            oflow_interval_ms: cfg.oflow_interval_ms,
            overflows: 0,
            skipped_samples: 0,
            oflow_messages: 0,
            bytes_sent: 0,
            warning_sent: false,
            last_oflow_ms: 0,
        }
    }

    /// Emit a sample record unless the TX buffer is starved. Returns true
    /// when the record went out.
    pub fn try_emit<L: HostLink>(&mut self, link: &mut L, now_ms: u32, line: &str) -> bool {
        let available = link.tx_available();

        if available < self.min_tx_bytes {
            self.overflows += 1;
            self.skipped_samples += 1;

            if !self.warning_sent {
                link.write_line(&format!(
                    "WARNING:Serial buffer near overflow - available: {} bytes",
                    available
                ));
                self.warning_sent = true;
            }

            if now_ms.wrapping_sub(self.last_oflow_ms) >= self.oflow_interval_ms {
                let tx_free = link.tx_available();
                link.write_line(&format!(
                    "OFLOW:{},{},{}",
                    self.skipped_samples, self.overflows, tx_free
                ));
                self.oflow_messages += 1;
                self.last_oflow_ms = now_ms;
            }
            return false;
        }

        if available > self.rearm_tx_bytes {
            self.warning_sent = false;
        }

        link.write_line(line);
        self.bytes_sent += line.len() as u64;
        true
    }

    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    pub fn skipped_samples(&self) -> u32 {
        self.skipped_samples
    }

    pub fn oflow_messages(&self) -> u32 {
        self.oflow_messages
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceIssue {
    Gap { expected: u16, got: u16, gap: u16 },
    Reset { expected: u16, got: u16 },
}

impl SequenceIssue {
    pub fn to_line(self) -> String {
        match self {
            SequenceIssue::Gap { expected, got, gap } => format!(
                "SEQUENCE_GAP:Expected {}, got {} (gap: {} samples)",
                expected, got, gap
            ),
            SequenceIssue::Reset { expected, got } => format!(
                "SEQUENCE_RESET:Expected {}, got {} (reset detected)",
                expected, got
            ),
        }
    }
}

/// Validates that emitted sequence numbers advance one by one modulo 65536.
/// A forward jump is a gap; a backward jump of more than 1000 is a reset.
/// Either way the validator resyncs to the observed number.
pub struct SequenceValidator {
    expected: u16,
    gaps_detected: u32,
    resets_detected: u32,
    enabled: bool,
}

impl SequenceValidator {
    pub fn new(enabled: bool) -> Self {
        SequenceValidator {
            expected: 0,
            gaps_detected: 0,
            resets_detected: 0,
            enabled,
        }
    }

    pub fn validate(&mut self, seq: u16) -> Option<SequenceIssue> {
        if !self.enabled {
            return None;
        }

        // First sample of the first stream
        if self.expected == 0 && seq == 0 {
            self.expected = 1;
            return None;
        }

        if seq == self.expected {
            self.expected = self.expected.wrapping_add(1);
            return None;
        }

        let gap = if seq > self.expected {
            seq - self.expected
        } else {
            (65_536u32 - self.expected as u32 + seq as u32) as u16
        };

        let issue = if seq < self.expected && gap > 1000 {
            self.resets_detected += 1;
            SequenceIssue::Reset {
                expected: self.expected,
                got: seq,
            }
        } else {
            self.gaps_detected += 1;
            SequenceIssue::Gap {
                expected: self.expected,
                got: seq,
                gap,
            }
        };

        self.expected = seq.wrapping_add(1);
        Some(issue)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn expected(&self) -> u16 {
        self.expected
    }

    pub fn gaps_detected(&self) -> u32 {
        self.gaps_detected
    }

    pub fn resets_detected(&self) -> u32 {
        self.resets_detected
    }
}

// ----------------------------------------------------------------------------
// Record formats
// ----------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn session_line(
    boot_id: u32,
    stream_id: u32,
    rate_hz: f64,
    channels: usize,
    filter_index: u8,
    gain_index: u8,
    dithering: u8,
    quality_name: &str,
    ppm: f32,
) -> String {
    format!(
        "SESSION:{},{},{:.2},{},{},{},{},{},{:.2}",
        boot_id, stream_id, rate_hz, channels, filter_index, gain_index, dithering, quality_name,
        ppm
    )
}

pub fn sample_line_full(
    seq: u16,
    timestamp_us: u64,
    quality_code: u8,
    accuracy_us: f32,
    values: &[i64; 3],
) -> String {
    format!(
        "{},{},{},{:.1},{},{},{}",
        seq, timestamp_us, quality_code, accuracy_us, values[0], values[1], values[2]
    )
}

pub fn sample_line_compact(seq: u16, timestamp_us: u64, values: &[i64; 3]) -> String {
    format!(
        "{},{},{},{},{}",
        seq, timestamp_us, values[0], values[1], values[2]
    )
}

pub struct StatFields {
    pub quality_name: &'static str,
    pub accuracy_us: f32,
    pub ppm: f32,
    pub pps_valid: bool,
    pub pps_age_ms: u32,
    pub wraparounds: u32,
    pub overflows: u32,
    pub skipped_samples: u32,
    pub boot_id: u32,
    pub stream_id: u32,
    pub adc_deadline_misses: u32,
}

pub fn stat_line(fields: &StatFields) -> String {
    format!(
        "STAT:{},{:.1},{:.2},{},{},{},{},{},{},{},{}",
        fields.quality_name,
        fields.accuracy_us,
        fields.ppm,
        fields.pps_valid as u8,
        fields.pps_age_ms,
        fields.wraparounds,
        fields.overflows,
        fields.skipped_samples,
        fields.boot_id,
        fields.stream_id,
        fields.adc_deadline_misses
    )
}

// ============================================================================
// TESTS
// ============================================================================
