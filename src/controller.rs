//! The timing core's main aggregate. Owns all state, consumes PPS edges and
//! host commands, and drives the fractional scheduler from the main loop.
//! One call to `tick()` is one iteration of the firmware loop; it never emits
//! more than one sample.

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use crate::calstore;
use crate::command::{self, Command, OutputFormat};
use crate::config::SystemConfig;
use crate::discipline::{Discipline, EstimateResult, PpsOutcome};
use crate::output::{self, BackpressureMonitor, SequenceValidator, StatFields};
use crate::pps::{PpsEdge, PpsLatch};
use crate::quality::{self, DegradationWarning, QualityInputs, TimingQuality, WarningLatches};
use crate::sampler::{AdcFilter, AdcGain, AdcRate, Sampler};
use crate::scheduler::{signed_phase_error, PhasePlan, Scheduler};
use crate::status::TimingStatus;
use crate::traits::{Adc, BoardClock, Eeprom, HostLink, TempSensor};
use crate::vclock::{Anomaly, VirtualClock};

/// One-shot phase nudges may not exceed this ignore threshold, µs.
const NUDGE_IGNORE_US: i64 = 20;
/// Continuous lock hysteresis, µs.
const LOCK_HYSTERESIS_US: i64 = 5;
/// Sample budget for the one-shot nudge before the per-sample clamp stretches it.
const NUDGE_MAX_SAMPLES: u32 = 200;

pub struct Controller<C, A, L, E, T>
where
    C: BoardClock,
    A: Adc,
    L: HostLink,
    E: Eeprom,
    T: TempSensor,
{
    clock: C,
    adc: A,
    link: L,
    eeprom: E,
    temp: T,
    pps: Arc<PpsLatch>,
    config: SystemConfig,

    vclock: VirtualClock,
    discipline: Discipline,
    latches: WarningLatches,
    scheduler: Scheduler,
    phase_plan: PhasePlan,
    sampler: Sampler,
    backpressure: BackpressureMonitor,
    seq_validator: SequenceValidator,

    quality: TimingQuality,
    accuracy_us: f32,

    streaming: bool,
    stream_rate: f64,
    sequence: u16,
    compact_output: bool,
    samples_generated: u64,

    // Session
    boot_id: u32,
    stream_id: u32,
    header_sent: bool,

    // Start modes
    waiting_for_sync_start: bool,
    sync_start_target_us: u64,
    sync_on_pps: bool,
    pps_countdown: u8,
    started_on_pps: bool,
    phase_nudge_applied: bool,
    pps_phase_lock_enabled: bool,

    // Reset tracking
    reset_detected: bool,
    reset_detection_ms: u32,
    clock_resets: u32,

    last_stat_ms: u32,
    last_temp_comp_ms: u32,

    cmd_buffer: String,
}

impl<C, A, L, E, T> Controller<C, A, L, E, T>
where
    C: BoardClock,
    A: Adc,
    L: HostLink,
    E: Eeprom,
    T: TempSensor,
{
    pub fn new(
        mut clock: C,
        mut adc: A,
        mut link: L,
        mut eeprom: E,
        temp: T,
        pps: Arc<PpsLatch>,
        config: SystemConfig,
    ) -> Result<Self> {
        link.write_line("DEBUG:Starting precision ADC streamer with PPS timing...");

        let raw_us = clock.raw_micros();
        let raw_ms = clock.raw_millis();
        let boot_id = raw_ms;

        let sampler = Sampler::new(config.stream.channels, config.stream.dithering);
        adc.set_rate(sampler.rate)?;
        adc.set_gain(sampler.gain)?;
        adc.set_filter(sampler.filter)?;

        let mut discipline = Discipline::new(config.timing.clone());
        match calstore::load(&mut eeprom) {
            Ok(Some(ppm)) => {
                discipline.load_stored_ppm(ppm);
                link.write_line(&format!(
                    "DEBUG:Loaded oscillator calibration from EEPROM: {:.2} ppm",
                    ppm
                ));
            }
            Ok(None) => {
                link.write_line("DEBUG:No valid calibration found in EEPROM");
            }
            Err(e) => {
                warn!("Calibration load failed: {}", e);
                link.write_line("DEBUG:No valid calibration found in EEPROM");
            }
        }

        let stream_rate = config.stream.rate_hz;
        let scheduler = Scheduler::new(stream_rate, config.timing.reference_update_interval);
        let backpressure = BackpressureMonitor::new(&config.backpressure);
        let seq_validator = SequenceValidator::new(config.stream.sequence_validation);
        let compact_output = config.stream.compact_output;

        link.write_line("READY:Precision ADC streamer with PPS timing ready");
        info!("Timing core initialized (boot_id={})", boot_id);

        Ok(Controller {
            clock,
            adc,
            link,
            eeprom,
            temp,
            pps,
            config,
            vclock: VirtualClock::new(raw_us, raw_ms),
            discipline,
            latches: WarningLatches::new(),
            scheduler,
            phase_plan: PhasePlan::idle(),
            sampler,
            backpressure,
            seq_validator,
            quality: TimingQuality::InternalRaw,
            accuracy_us: 1000.0,
            streaming: false,
            stream_rate,
            sequence: 0,
            compact_output,
            samples_generated: 0,
            boot_id,
            stream_id: 0,
            header_sent: false,
            waiting_for_sync_start: false,
            sync_start_target_us: 0,
            sync_on_pps: false,
            pps_countdown: 0,
            started_on_pps: false,
            phase_nudge_applied: false,
            pps_phase_lock_enabled: true,
            reset_detected: false,
            reset_detection_ms: 0,
            clock_resets: 0,
            last_stat_ms: 0,
            last_temp_comp_ms: 0,
            cmd_buffer: String::new(),
        })
    }

    /// One main-loop iteration: anomaly detection, PPS consumption, quality
    /// update, telemetry, command handling, then at most one sample firing.
    pub fn tick(&mut self) -> Result<()> {
        let raw_us = self.clock.raw_micros();
        let raw_ms = self.clock.raw_millis();

        if let Some(anomaly) = self.vclock.observe(raw_us, raw_ms) {
            match anomaly {
                Anomaly::Wrap { count } => {
                    self.link
                        .write_line(&format!("DEBUG:micros() wraparound detected (#{})", count));
                }
                reset => self.handle_clock_reset(reset),
            }
        }

        if let Some(edge) = self.pps.take() {
            self.process_pps(edge);
        }

        self.update_quality();
        self.send_stat_beacon();
        self.update_temperature_compensation();
        self.poll_commands();

        if self.waiting_for_sync_start {
            self.await_sync_start();
            return Ok(());
        }

        if self.streaming && self.scheduler.is_established() {
            self.scheduler.refresh_effective(self.discipline.ppm);
            let now = self.now_virtual();
            if self.scheduler.due(now) {
                self.emit_sample(now);

                let plan_was_active = self.phase_plan.is_active();
                let missed = self.scheduler.advance_after_fire(now, &mut self.phase_plan);
                if missed > 0 {
                    self.link
                        .write_line(&format!("DEBUG:Skipped {} missed slots", missed));
                }
                if plan_was_active && !self.phase_plan.is_active() {
                    self.link.write_line("DEBUG:Phase alignment completed");
                }
            }
        }

        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn quality(&self) -> TimingQuality {
        self.quality
    }

    pub fn ppm(&self) -> f32 {
        self.discipline.ppm
    }

    pub fn status(&mut self) -> TimingStatus {
        let now_ms = self.clock.raw_millis();
        TimingStatus {
            streaming: self.streaming,
            quality_code: self.quality.code(),
            quality_name: self.quality.name().to_string(),
            accuracy_us: self.accuracy_us,
            ppm: self.discipline.ppm,
            pps_valid: self.discipline.pps_valid,
            cal_valid: self.discipline.cal_valid,
            pps_count: self.discipline.pps_count,
            pps_age_ms: self.discipline.pps_age_ms(now_ms),
            clock_resets: self.clock_resets,
            wraparounds: self.vclock.wrap_count(),
            reference_updates: self.scheduler.rebase_count(),
            buffer_overflows: self.backpressure.overflows(),
            samples_skipped: self.backpressure.skipped_samples(),
            sequence_gaps: self.seq_validator.gaps_detected(),
            sequence_resets: self.seq_validator.resets_detected(),
            boot_id: self.boot_id,
            stream_id: self.stream_id,
            sample_index: self.scheduler.sample_index(),
            samples_generated: self.samples_generated,
            adc_deadline_misses: self.sampler.monitor.deadline_misses,
        }
    }

    fn now_virtual(&mut self) -> u64 {
        let raw_us = self.clock.raw_micros();
        self.vclock.now(raw_us)
    }

    // ------------------------------------------------------------------
    // Clock reset recovery
    // ------------------------------------------------------------------

    fn handle_clock_reset(&mut self, anomaly: Anomaly) {
        match anomaly {
            Anomaly::MicrosReset { backward_us } => {
                self.link.write_line(&format!(
                    "WARNING:Large backward micros() jump detected: {}us - MCU reset suspected",
                    backward_us
                ));
            }
            Anomaly::MillisReset { backward_ms } => {
                self.link.write_line(&format!(
                    "WARNING:millis() went backward by {}ms - MCU reset detected",
                    backward_ms
                ));
            }
            Anomaly::PowerOnReset => {
                self.link
                    .write_line("WARNING:Clock values suggest recent MCU reset");
            }
            Anomaly::Wrap { .. } => return,
        }

        self.link
            .write_line("DEBUG:Handling clock reset - attempting to maintain timing continuity");

        let raw_us = self.clock.raw_micros();
        let raw_ms = self.clock.raw_millis();

        self.reset_detected = true;
        self.reset_detection_ms = raw_ms;
        self.clock_resets += 1;

        self.vclock.absorb_reset(raw_us, raw_ms);
        self.discipline.invalidate_for_reset();
        self.quality = TimingQuality::InternalRaw;
        self.accuracy_us = 1000.0;

        if self.scheduler.is_established() && self.streaming {
            let now = self.now_virtual();
            let index = self.scheduler.resync_index(now);
            self.link.write_line(&format!(
                "DEBUG:Timing continuity maintained - adjusted to sample index {}",
                index
            ));
        }

        self.link
            .write_line(&format!("DEBUG:Clock reset #{} handled", self.clock_resets));
    }

    // ------------------------------------------------------------------
    // PPS handling
    // ------------------------------------------------------------------

    fn process_pps(&mut self, edge: PpsEdge) {
        let now_ms = self.clock.raw_millis();

        // An armed PPS start consumes its countdown before anything else
        if self.sync_on_pps && self.pps_countdown > 0 {
            self.pps_countdown -= 1;
            if self.pps_countdown == 0 {
                self.discipline.pps_count += 1;
                let base = self.vclock.virtualize(edge.raw_micros);
                self.scheduler.establish_at(base);
                self.sync_on_pps = false;
                self.waiting_for_sync_start = false;
                self.started_on_pps = true;
                self.phase_nudge_applied = false;
                self.sequence = 0;
                self.samples_generated = 0;
                self.streaming = true;
                self.send_session_header();
                self.link.write_line(&format!(
                    "OK:Streaming started at PPS with {:.2}Hz",
                    self.stream_rate
                ));
                self.discipline.last_pps_ms = edge.captured_at_ms;
                return;
            }
            // Remaining countdown edges still feed the discipline loop
        }

        let blackout = self.reset_detected
            && now_ms.wrapping_sub(self.reset_detection_ms) < self.config.timing.reset_pps_blackout_ms;
        let temp_c = self.temp.read_celsius();
        let pps_virtual = self.vclock.virtualize(edge.raw_micros);

        let outcome =
            self.discipline
                .on_pps(pps_virtual, edge.captured_at_ms, blackout, temp_c);

        match outcome {
            PpsOutcome::IgnoredResetRecovery => {
                self.link
                    .write_line("DEBUG:Ignoring PPS during reset recovery period");
            }
            PpsOutcome::IgnoredBadCadence { interval_ms } => {
                self.link.write_line(&format!(
                    "WARNING:Invalid PPS interval: {}ms - ignoring",
                    interval_ms
                ));
            }
            PpsOutcome::Accepted {
                estimate,
                reacquired,
            } => {
                if reacquired {
                    self.link.write_line(&format!(
                        "DEBUG:GPS PPS acquired - count: {}",
                        self.discipline.pps_count
                    ));
                }
                self.report_estimate(estimate);
                self.maybe_plan_phase_alignment(pps_virtual);

                if self.reset_detected {
                    self.link
                        .write_line("DEBUG:PPS reacquired after reset - timing stabilizing");
                }
            }
        }
    }

    fn report_estimate(&mut self, estimate: EstimateResult) {
        match estimate {
            EstimateResult::NotReady => {}
            EstimateResult::Rejected { error_ppm } => {
                self.link.write_line(&format!(
                    "WARNING:PPS calibration error too large: {:.1}ppm - ignoring",
                    error_ppm
                ));
            }
            EstimateResult::Updated {
                interval_us,
                clamped_from,
                tempco_learned,
                ..
            } => {
                if let Some(before) = clamped_from {
                    self.link.write_line(&format!(
                        "WARNING:Oscillator calibration clamped from {:.2} ppm to {:.0} ppm",
                        before, self.discipline.ppm
                    ));
                }

                self.persist_calibration();

                if let Some(tempco) = tempco_learned {
                    self.link.write_line(&format!(
                        "DEBUG:Learned temperature coefficient: {:.3} ppm/C",
                        tempco
                    ));
                }

                if self.discipline.pps_count % 10 == 0 {
                    self.link.write_line(&format!(
                        "DEBUG:Oscillator cal: {:.2}ppm, interval: {}us",
                        self.discipline.ppm, interval_us
                    ));
                }
            }
        }
    }

    fn persist_calibration(&mut self) {
        match calstore::save(&mut self.eeprom, self.discipline.ppm) {
            Ok(()) => {
                self.link.write_line(&format!(
                    "DEBUG:Saved oscillator calibration to EEPROM: {:.2} ppm",
                    self.discipline.ppm
                ));
            }
            Err(e) => warn!("Calibration save failed: {}", e),
        }
    }

    /// Install a phase-alignment plan toward the PPS grid. One mechanism,
    /// latest plan wins: the one-shot nudge covers the first PPS acquisition
    /// in a free-running stream, the continuous lock everything after.
    fn maybe_plan_phase_alignment(&mut self, pps_virtual: u64) {
        if !(self.streaming && self.scheduler.is_established()) {
            return;
        }
        let interval = self.scheduler.nominal_interval_us();
        if interval == 0 {
            return;
        }

        let phase = signed_phase_error(pps_virtual, self.scheduler.base_virtual_us(), interval);
        let one_shot_pending = !self.started_on_pps && !self.phase_nudge_applied;

        if one_shot_pending && phase.abs() > NUDGE_IGNORE_US {
            let plan = PhasePlan::spread(phase as f64, NUDGE_MAX_SAMPLES);
            let samples = plan.samples_remaining();
            self.link.write_line(&format!(
                "DEBUG:Applying phase nudge to PPS: error={}us over {} samples (~{:.1} ms)",
                phase,
                samples,
                samples as f64 * interval as f64 / 1000.0
            ));
            self.phase_plan = plan;
            self.phase_nudge_applied = true;
        } else if self.pps_phase_lock_enabled && phase.abs() > LOCK_HYSTERESIS_US {
            let samples_per_second = ((self.stream_rate + 0.5) as u32).max(1);
            let plan = PhasePlan::spread(phase as f64, samples_per_second);
            self.link.write_line(&format!(
                "DEBUG:PPS lock adjust: phase={}us over {} samples",
                phase,
                plan.samples_remaining()
            ));
            self.phase_plan = plan;
        }
    }

    // ------------------------------------------------------------------
    // Quality + telemetry
    // ------------------------------------------------------------------

    fn update_quality(&mut self) {
        let now_ms = self.clock.raw_millis();
        let since_reset = now_ms.wrapping_sub(self.reset_detection_ms);
        let recent_reset = self.reset_detected && since_reset < self.config.timing.reset_recovery_ms;
        let age = self.discipline.pps_age_ms(now_ms);

        let (q, accuracy) = quality::classify(
            &QualityInputs {
                pps_valid: self.discipline.pps_valid,
                cal_valid: self.discipline.cal_valid,
                pps_age_ms: age,
                recent_reset,
            },
            &self.config.timing,
        );
        self.quality = q;
        self.accuracy_us = accuracy;

        match q {
            TimingQuality::PpsActive => self.discipline.pps_miss_count = 0,
            TimingQuality::PpsHoldover => self.discipline.note_degraded(age),
            _ => {}
        }

        if q == TimingQuality::InternalRaw {
            if let Some(warning) =
                self.latches
                    .on_raw_entry(self.discipline.pps_valid, recent_reset, age)
            {
                match warning {
                    DegradationWarning::RawAfterReset => {
                        self.link
                            .write_line("WARNING:Using raw timing due to recent clock reset");
                    }
                    DegradationWarning::PpsLost { age_s } => {
                        self.link.write_line(&format!(
                            "WARNING:GPS PPS lost for {}s - timing accuracy degraded",
                            age_s
                        ));
                        self.discipline.pps_valid = false;
                    }
                }
            }
        }

        if self.reset_detected && since_reset > self.config.timing.reset_recovery_ms {
            self.reset_detected = false;
            self.link
                .write_line("DEBUG:Clock reset recovery period completed");
        }
    }

    fn send_stat_beacon(&mut self) {
        let now_ms = self.clock.raw_millis();
        if now_ms.wrapping_sub(self.last_stat_ms) < self.config.timing.stat_interval_ms {
            return;
        }
        self.last_stat_ms = now_ms;

        let line = output::stat_line(&StatFields {
            quality_name: self.quality.name(),
            accuracy_us: self.accuracy_us,
            ppm: self.discipline.ppm,
            pps_valid: self.discipline.pps_valid,
            pps_age_ms: self.discipline.pps_age_ms(now_ms),
            wraparounds: self.vclock.wrap_count(),
            overflows: self.backpressure.overflows(),
            skipped_samples: self.backpressure.skipped_samples(),
            boot_id: self.boot_id,
            stream_id: self.stream_id,
            adc_deadline_misses: self.sampler.monitor.deadline_misses,
        });
        self.link.write_line(&line);
    }

    fn update_temperature_compensation(&mut self) {
        let now_ms = self.clock.raw_millis();
        if now_ms.wrapping_sub(self.last_temp_comp_ms) < 1000 {
            return;
        }
        self.last_temp_comp_ms = now_ms;

        let temp_c = self.temp.read_celsius();
        let in_internal_cal = self.quality == TimingQuality::InternalCal;
        if let Some(correction) = self
            .discipline
            .apply_temp_compensation(temp_c, in_internal_cal)
        {
            let change = temp_c - self.discipline.reference_temp_c;
            self.link.write_line(&format!(
                "DEBUG:Temperature compensation applied: {:.1}C, correction: {:.2} ppm",
                change, correction
            ));
        }
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn poll_commands(&mut self) {
        while let Some(byte) = self.link.read_byte() {
            match byte {
                b'\n' => {
                    let line = std::mem::take(&mut self.cmd_buffer);
                    self.handle_line(&line);
                }
                b'\r' => {}
                other => self.cmd_buffer.push(other as char),
            }
        }
    }

    pub fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match command::parse_line(line) {
            Ok(cmd) => self.dispatch(cmd),
            Err(e) => self.link.write_line(&format!("ERROR:{}", e)),
        }
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::StartStream { rate_hz } => self.cmd_start_stream(rate_hz),
            Command::StartStreamSync { rate_hz, delay_ms } => {
                self.cmd_start_stream_sync(rate_hz, delay_ms)
            }
            Command::StartStreamPps { rate_hz, edges } => {
                self.cmd_start_stream_pps(rate_hz, edges)
            }
            Command::StopStream => self.cmd_stop_stream(),
            Command::SetAdcRate { index } => self.cmd_set_adc_rate(index),
            Command::SetGain { index } => self.cmd_set_gain(index),
            Command::SetFilter { index } => self.cmd_set_filter(index),
            Command::SetDithering { count } => self.cmd_set_dithering(count),
            Command::SetChannels { count } => self.cmd_set_channels(count),
            Command::SetPreciseInterval { interval_us } => {
                self.cmd_set_precise_interval(interval_us)
            }
            Command::SetOutputFormat { format } => {
                self.compact_output = format == OutputFormat::Compact;
                let name = if self.compact_output { "COMPACT" } else { "FULL" };
                self.link
                    .write_line(&format!("OK:Output format set to {}", name));
            }
            Command::SetSequenceValidation { enabled } => {
                self.seq_validator.set_enabled(enabled);
                let verb = if enabled { "enabled" } else { "disabled" };
                self.link
                    .write_line(&format!("OK:Sequence validation {}", verb));
            }
            Command::SetCalPpm { ppm } => self.cmd_set_cal_ppm(ppm),
            Command::GetStatus => self.cmd_get_status(),
            Command::GetTimingStatus => self.cmd_get_timing_status(),
            Command::GetFilter => {
                let f = self.sampler.filter;
                self.link
                    .write_line(&format!("FILTER:{},{}", f.index(), f.name()));
            }
            Command::GetDithering => {
                let d = self.sampler.dithering;
                let desc = if d == 0 {
                    "OFF".to_string()
                } else {
                    format!("{}x oversampling", d)
                };
                self.link.write_line(&format!("DITHERING:{},{}", d, desc));
            }
            Command::GetOutputFormat => {
                let (name, bytes) = if self.compact_output {
                    ("COMPACT", 25)
                } else {
                    ("FULL", 40)
                };
                self.link.write_line(&format!(
                    "OUTPUT_FORMAT:{},bytes_per_sample={}",
                    name, bytes
                ));
            }
            Command::GetSequenceValidation => {
                let state = if self.seq_validator.is_enabled() {
                    "ON"
                } else {
                    "OFF"
                };
                self.link.write_line(&format!(
                    "SEQUENCE_VALIDATION:{},gaps_detected={},resets_detected={},expected_seq={}",
                    state,
                    self.seq_validator.gaps_detected(),
                    self.seq_validator.resets_detected(),
                    self.seq_validator.expected()
                ));
            }
            Command::Reset => self.cmd_reset(),
        }
    }

    fn cmd_start_stream(&mut self, rate_hz: Option<f64>) {
        if self.streaming {
            self.link.write_line("ERROR:Already streaming");
            return;
        }
        if let Some(rate) = rate_hz {
            if !self.rate_change_allowed(rate) {
                return;
            }
            self.stream_rate = rate;
            self.scheduler.set_rate(rate);
        }

        self.sequence = 0;
        self.samples_generated = 0;
        self.started_on_pps = false;
        self.phase_nudge_applied = false;

        let now = self.now_virtual();
        self.scheduler.establish(now);
        self.link.write_line(&format!(
            "DEBUG:Sampling established at {:.2}Hz with {} timing (~{:.1}us)",
            self.stream_rate,
            self.quality.name(),
            self.accuracy_us
        ));

        self.streaming = true;
        self.send_session_header();
        self.link.write_line(&format!(
            "OK:Streaming started at {:.2}Hz with {} timing",
            self.stream_rate,
            self.quality.name()
        ));
    }

    fn cmd_start_stream_sync(&mut self, rate_hz: f64, delay_ms: u32) {
        if self.streaming {
            self.link.write_line("ERROR:Already streaming");
            return;
        }
        self.stream_rate = rate_hz;
        self.scheduler.set_rate(rate_hz);
        self.sync_start_target_us = self.now_virtual() + delay_ms as u64 * 1000;
        self.sync_on_pps = false;
        self.waiting_for_sync_start = true;
        self.started_on_pps = false;
        self.phase_nudge_applied = false;

        self.sequence = 0;
        self.samples_generated = 0;
        self.streaming = true;
        self.send_session_header();

        self.link.write_line(&format!(
            "OK:Synchronized streaming prepared at {:.2}Hz, delay: {}ms",
            self.stream_rate, delay_ms
        ));
    }

    fn cmd_start_stream_pps(&mut self, rate_hz: f64, edges: u8) {
        if self.streaming {
            self.link.write_line("ERROR:Already streaming");
            return;
        }
        self.stream_rate = rate_hz;
        self.scheduler.set_rate(rate_hz);
        self.sync_on_pps = true;
        self.pps_countdown = edges;
        self.waiting_for_sync_start = true;

        self.link.write_line(&format!(
            "OK:Waiting for {} PPS edges to start",
            edges
        ));
    }

    fn cmd_stop_stream(&mut self) {
        self.streaming = false;
        self.scheduler.teardown();
        self.sync_on_pps = false;
        self.pps_countdown = 0;
        self.waiting_for_sync_start = false;
        // A stop mid-alignment discards whatever correction budget remained
        self.phase_plan.clear();
        self.header_sent = false;

        self.link.write_line(&format!(
            "DEBUG:Generated {} samples",
            self.samples_generated
        ));
        self.link.write_line("OK:Streaming stopped");
    }

    fn cmd_set_adc_rate(&mut self, index: u8) {
        if self.streaming {
            self.link.write_line("ERROR:Cannot change while streaming");
            return;
        }
        let Some(rate) = AdcRate::from_index(index) else {
            self.link.write_line("ERROR:Invalid rate index");
            return;
        };
        if self.adc.set_rate(rate).is_err() {
            self.link.write_line("ERROR:Failed to set ADC rate");
            return;
        }
        self.sampler.rate = rate;
        self.link.write_line("OK:ADC rate set");
    }

    fn cmd_set_gain(&mut self, index: u8) {
        if self.streaming {
            self.link.write_line("ERROR:Cannot change while streaming");
            return;
        }
        let Some(gain) = AdcGain::from_index(index) else {
            self.link.write_line("ERROR:Invalid gain index");
            return;
        };
        if self.adc.set_gain(gain).is_err() {
            self.link.write_line("ERROR:Failed to set gain");
            return;
        }
        self.sampler.gain = gain;
        self.link.write_line("OK:Gain set");
    }

    fn cmd_set_filter(&mut self, index: u8) {
        if self.streaming {
            self.link.write_line("ERROR:Cannot change while streaming");
            return;
        }
        let Some(filter) = AdcFilter::from_index(index) else {
            self.link.write_line("ERROR:Invalid filter index (1-5)");
            return;
        };
        if self.adc.set_filter(filter).is_err() {
            self.link.write_line("ERROR:Failed to set filter");
            return;
        }
        self.sampler.filter = filter;
        self.link
            .write_line(&format!("OK:Filter set to {}", filter.name()));
    }

    fn cmd_set_dithering(&mut self, count: u8) {
        if self.streaming {
            self.link.write_line("ERROR:Cannot change while streaming");
            return;
        }
        self.sampler.dithering = count;
        if count == 0 {
            self.link.write_line("OK:Dithering set to OFF");
        } else {
            self.link
                .write_line(&format!("OK:Dithering set to {}x oversampling", count));
        }
    }

    fn cmd_set_channels(&mut self, count: u8) {
        if self.streaming {
            self.link.write_line("ERROR:Cannot change while streaming");
            return;
        }
        self.sampler.channels = count as usize;
        self.link.write_line("OK:Channels set");
    }

    fn cmd_set_precise_interval(&mut self, interval_us: u64) {
        let new_rate = 1_000_000.0 / interval_us as f64;
        if !self.rate_change_allowed(new_rate) {
            return;
        }
        self.scheduler.set_nominal_interval(interval_us);
        self.stream_rate = new_rate;
        self.link.write_line(&format!(
            "OK:Precise interval set to {}us ({:.3}Hz)",
            interval_us, new_rate
        ));
    }

    fn cmd_set_cal_ppm(&mut self, ppm: f32) {
        if let Some(before) = self.discipline.set_manual_ppm(ppm) {
            self.link.write_line(&format!(
                "WARNING:Oscillator calibration clamped from {:.2} ppm to {:.0} ppm",
                before, self.discipline.ppm
            ));
        }
        self.persist_calibration();
        self.link.write_line(&format!(
            "OK:Manual calibration set to {:.2} ppm",
            self.discipline.ppm
        ));
    }

    fn cmd_get_status(&mut self) {
        let line = format!(
            "STATUS:streaming={},samples_generated={},stream_rate={:.2},channels={},filter={},sequence={},timing_source={},timing_accuracy_us={:.1},pps_valid={},pps_count={},clock_resets={},wraparounds={},ref_updates={},buffer_overflows={},samples_skipped={},buffer_available={},seq_gaps={},seq_resets={}",
            self.streaming as u8,
            self.samples_generated,
            self.stream_rate,
            self.sampler.channels,
            self.sampler.filter.index(),
            self.sequence,
            self.quality.code(),
            self.accuracy_us,
            self.discipline.pps_valid as u8,
            self.discipline.pps_count,
            self.clock_resets,
            self.vclock.wrap_count(),
            self.scheduler.rebase_count(),
            self.backpressure.overflows(),
            self.backpressure.skipped_samples(),
            self.link.tx_available(),
            self.seq_validator.gaps_detected(),
            self.seq_validator.resets_detected(),
        );
        self.link.write_line(&line);
    }

    fn cmd_get_timing_status(&mut self) {
        let line = format!(
            "TIMING:source={},accuracy_us={:.1},pps_valid={},pps_count={},calibration_ppm={:.3},calibration_valid={},clock_resets={},wraparounds={},virtual_offset={},reset_detected={},ref_updates={},sample_index={},pps_phase_lock={}",
            self.quality.name(),
            self.accuracy_us,
            self.discipline.pps_valid as u8,
            self.discipline.pps_count,
            self.discipline.ppm,
            self.discipline.cal_valid as u8,
            self.clock_resets,
            self.vclock.wrap_count(),
            self.vclock.offset_us() >> 20,
            self.reset_detected as u8,
            self.scheduler.rebase_count(),
            self.scheduler.sample_index(),
            self.pps_phase_lock_enabled as u8,
        );
        self.link.write_line(&line);
    }

    fn cmd_reset(&mut self) {
        self.streaming = false;
        self.scheduler.teardown();
        self.sync_on_pps = false;
        self.pps_countdown = 0;
        self.waiting_for_sync_start = false;
        self.phase_plan.clear();
        self.sequence = 0;
        self.header_sent = false;
        self.link.write_line("OK:Device reset");
    }

    /// Bounded host nudges: while PPS locked, reject rate changes above the
    /// gate; large changes draw a warning in any state.
    fn rate_change_allowed(&mut self, new_rate: f64) -> bool {
        let change_ppm = ((new_rate - self.stream_rate) / self.stream_rate).abs() * 1e6;

        if self.quality == TimingQuality::PpsActive
            && change_ppm > self.config.timing.rate_gate_ppm as f64
        {
            self.link.write_line(&format!(
                "ERROR:Rate change too large while PPS locked ({:.1} ppm > {:.0} ppm limit)",
                change_ppm, self.config.timing.rate_gate_ppm
            ));
            return false;
        }

        if change_ppm > self.config.timing.rate_warn_ppm as f64 {
            self.link.write_line(&format!(
                "WARNING:Large rate change detected ({:.1} ppm)",
                change_ppm
            ));
        }

        true
    }

    // ------------------------------------------------------------------
    // Start modes + sampling
    // ------------------------------------------------------------------

    fn await_sync_start(&mut self) {
        if self.sync_on_pps {
            // The PPS handler performs the start; just yield
            self.clock.delay_micros(200);
            return;
        }

        let now = self.now_virtual();
        if now >= self.sync_start_target_us {
            self.scheduler.establish_at(now);
            self.waiting_for_sync_start = false;
            self.samples_generated = 0;
            self.link.write_line(&format!(
                "OK:Streaming started at {:.2}Hz with {} timing (strict target)",
                self.stream_rate,
                self.quality.name()
            ));
        } else {
            let early = self.sync_start_target_us - now;
            if early > 3000 {
                self.clock.delay_micros(200);
            } else if early > 50 {
                self.clock.delay_micros((early - 50) as u32);
            }
        }
    }

    fn emit_sample(&mut self, now_virtual: u64) {
        if self.scheduler.needs_rebase() {
            let closed = self.scheduler.rebase(now_virtual);
            self.link.write_line(&format!(
                "DEBUG:Timing reference updated (#{}) after {} samples",
                self.scheduler.rebase_count(),
                closed
            ));
        }

        let required = self.sampler.required_sps(self.stream_rate);
        let available = self.sampler.rate.sps();
        if let Some((req, avail)) = self.sampler.monitor.verify(required, available) {
            self.link.write_line(&format!(
                "WARNING:ADC throughput inadequate - required: {} sps, available: {} sps",
                req, avail
            ));
        }

        let timestamp = self.precise_timestamp(now_virtual);
        let values = self.sampler.acquire(&mut self.clock, &mut self.adc);

        if let Some(issue) = self.seq_validator.validate(self.sequence) {
            self.link.write_line(&issue.to_line());
        }

        let line = if self.compact_output {
            output::sample_line_compact(self.sequence, timestamp, &values)
        } else {
            output::sample_line_full(
                self.sequence,
                timestamp,
                self.quality.code(),
                self.accuracy_us,
                &values,
            )
        };

        let now_ms = self.clock.raw_millis();
        self.backpressure.try_emit(&mut self.link, now_ms, &line);

        self.sequence = self.sequence.wrapping_add(1);
        self.samples_generated += 1;
        self.scheduler.note_sample_emitted();
    }

    /// Timestamps follow the quality state: any calibrated state maps counter
    /// ticks through the ppm correction, raw mode reports virtual time as-is.
    fn precise_timestamp(&self, now_virtual: u64) -> u64 {
        match self.quality {
            TimingQuality::InternalRaw => now_virtual,
            _ => self.discipline.calibrated_timestamp(now_virtual),
        }
    }

    fn send_session_header(&mut self) {
        if self.header_sent {
            return;
        }
        self.stream_id = self.clock.raw_millis();
        let line = output::session_line(
            self.boot_id,
            self.stream_id,
            self.stream_rate,
            self.sampler.channels,
            self.sampler.filter.index(),
            self.sampler.gain.index(),
            self.sampler.dithering,
            self.quality.name(),
            self.discipline.ppm,
        );
        self.link.write_line(&line);
        self.header_sent = true;
    }
}
