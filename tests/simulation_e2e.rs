use anyhow::Result;
use ppstream::config::SystemConfig;
use ppstream::controller::Controller;
use ppstream::pps::PpsLatch;
use ppstream::quality::TimingQuality;
use ppstream::sampler::{AdcFilter, AdcGain, AdcRate};
use ppstream::traits::{Adc, BoardClock, Eeprom, HostLink, TempSensor};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

// ============================================================================
// PHYSICS-IN-THE-LOOP E2E TESTS
// ============================================================================
// The simulation owns true time and an oscillator with a configurable drift
// in ppm. The controller only ever sees the 32-bit truncated counters the
// oscillator produces, plus PPS edges captured at true-second boundaries,
// exactly like the firmware on real hardware. Counter resets and wraps are
// injected by shifting the counter base.
// ============================================================================

struct Physics {
    real_us: f64,    // true elapsed simulation time
    drift_ppm: f64,  // oscillator error; positive = counter runs fast
    start_counter_us: u64,
    reset_base_us: u64,
}

impl Physics {
    fn new(drift_ppm: f64, start_counter_us: u64) -> Self {
        Physics {
            real_us: 0.0,
            drift_ppm,
            start_counter_us,
            reset_base_us: 0,
        }
    }

    /// Microseconds the oscillator has counted since simulation start.
    fn counted_us(&self) -> u64 {
        let drifted = self.real_us + self.real_us * self.drift_ppm / 1e6;
        self.start_counter_us + drifted.round() as u64
    }

    fn raw_micros(&self) -> u32 {
        (self.counted_us() - self.reset_base_us) as u32
    }

    fn raw_millis(&self) -> u32 {
        (((self.counted_us() - self.reset_base_us) / 1000) & 0xFFFF_FFFF) as u32
    }

    /// Model an MCU reset: both counters restart from zero.
    fn inject_reset(&mut self) {
        self.reset_base_us = self.counted_us();
    }
}

#[derive(Clone)]
struct SimClock {
    phys: Rc<RefCell<Physics>>,
}

impl BoardClock for SimClock {
    fn raw_micros(&mut self) -> u32 {
        self.phys.borrow().raw_micros()
    }
    fn raw_millis(&mut self) -> u32 {
        self.phys.borrow().raw_millis()
    }
    fn delay_micros(&mut self, _us: u32) {
        // Simulated time is advanced by the rig, not by busy-waits
    }
}

#[derive(Clone)]
struct SimLink {
    lines: Rc<RefCell<Vec<String>>>,
    rx: Rc<RefCell<VecDeque<u8>>>,
    tx_free: Rc<RefCell<usize>>,
}

impl SimLink {
    fn new() -> Self {
        SimLink {
            lines: Rc::new(RefCell::new(Vec::new())),
            rx: Rc::new(RefCell::new(VecDeque::new())),
            tx_free: Rc::new(RefCell::new(4096)),
        }
    }

    fn set_tx_free(&self, bytes: usize) {
        *self.tx_free.borrow_mut() = bytes;
    }
}

impl HostLink for SimLink {
    fn write_line(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.borrow_mut().pop_front()
    }
    fn tx_available(&mut self) -> usize {
        *self.tx_free.borrow()
    }
}

struct SimAdc;

impl Adc for SimAdc {
    fn set_rate(&mut self, _rate: AdcRate) -> Result<()> {
        Ok(())
    }
    fn set_gain(&mut self, _gain: AdcGain) -> Result<()> {
        Ok(())
    }
    fn set_filter(&mut self, _filter: AdcFilter) -> Result<()> {
        Ok(())
    }
    fn select_input(&mut self, _pos: u8, _neg: u8) {}
    fn data_ready(&mut self) -> bool {
        true
    }
    fn read_conversion(&mut self) -> i64 {
        // Mid-scale with a little noise; nothing asserts on values
        5_000 + (rand::random::<u8>() % 10) as i64
    }
}

#[derive(Clone)]
struct SimEeprom {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl SimEeprom {
    fn new() -> Self {
        SimEeprom {
            bytes: Rc::new(RefCell::new(vec![0xFF; 16])),
        }
    }
}

impl Eeprom for SimEeprom {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.borrow();
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }
    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.borrow_mut();
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

struct SimTemp;

impl TempSensor for SimTemp {
    fn read_celsius(&mut self) -> f32 {
        25.0
    }
}

type SimController = Controller<SimClock, SimAdc, SimLink, SimEeprom, SimTemp>;

struct SimRig {
    phys: Rc<RefCell<Physics>>,
    link: SimLink,
    latch: Arc<PpsLatch>,
    controller: SimController,
    step_us: u64,
    step_index: u64,
    pps_enabled: bool,
}

impl SimRig {
    fn new(drift_ppm: f64, step_us: u64) -> Self {
        Self::with_eeprom(drift_ppm, step_us, SimEeprom::new())
    }

    fn with_eeprom(drift_ppm: f64, step_us: u64, eeprom: SimEeprom) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let phys = Rc::new(RefCell::new(Physics::new(drift_ppm, 1_000_000)));
        let link = SimLink::new();
        let latch = Arc::new(PpsLatch::new());

        let controller = Controller::new(
            SimClock { phys: phys.clone() },
            SimAdc,
            link.clone(),
            eeprom,
            SimTemp,
            latch.clone(),
            SystemConfig::default(),
        )
        .expect("controller init");

        link.lines.borrow_mut().clear();
        SimRig {
            phys,
            link,
            latch,
            controller,
            step_us,
            step_index: 0,
            pps_enabled: false,
        }
    }

    fn step(&mut self) {
        self.step_index += 1;
        let real_us = self.step_index * self.step_us;
        self.phys.borrow_mut().real_us = real_us as f64;

        if self.pps_enabled && real_us % 1_000_000 == 0 {
            let (raw_us, raw_ms) = {
                let phys = self.phys.borrow();
                (phys.raw_micros(), phys.raw_millis())
            };
            self.latch.publish(raw_us, raw_ms);
        }

        self.controller.tick().expect("tick");
    }

    fn run_ms(&mut self, ms: u64) {
        let steps = ms * 1000 / self.step_us;
        for _ in 0..steps {
            self.step();
        }
    }

    /// Advance simulated time without running the main loop (a stalled loop).
    fn stall_ms(&mut self, ms: u64) {
        self.step_index += ms * 1000 / self.step_us;
        let real_us = self.step_index * self.step_us;
        self.phys.borrow_mut().real_us = real_us as f64;
    }

    fn cmd(&mut self, line: &str) {
        self.controller.handle_line(line);
    }

    fn lines(&self) -> Vec<String> {
        self.link.lines.borrow().clone()
    }

    fn clear_lines(&self) {
        self.link.lines.borrow_mut().clear();
    }

    fn sample_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .collect()
    }

    fn has_line_starting(&self, prefix: &str) -> bool {
        self.lines().iter().any(|l| l.starts_with(prefix))
    }

    fn sample_timestamps(&self) -> Vec<u64> {
        self.sample_lines()
            .iter()
            .map(|l| l.split(',').nth(1).unwrap().parse().unwrap())
            .collect()
    }

    fn sample_sequences(&self) -> Vec<u16> {
        self.sample_lines()
            .iter()
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect()
    }
}

/// Scenario: cold start without GPS. Records must carry raw quality and the
/// grid must hold 10 ms spacing to the microsecond.
#[test]
fn test_cold_start_no_pps_full_format() {
    let mut rig = SimRig::new(0.0, 100);

    rig.cmd("START_STREAM:100");
    let session = rig
        .lines()
        .into_iter()
        .find(|l| l.starts_with("SESSION:"))
        .expect("session header");
    assert!(session.contains("INTERNAL_RAW"));
    assert!(session.ends_with(",0.00"));

    rig.clear_lines();
    rig.run_ms(1000);

    let samples = rig.sample_lines();
    assert!(
        (99..=101).contains(&samples.len()),
        "expected ~100 samples, got {}",
        samples.len()
    );

    for line in &samples {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 7, "FULL record: {}", line);
        assert_eq!(fields[2], "3", "quality code: {}", line);
        assert_eq!(fields[3], "1000.0", "accuracy: {}", line);
    }

    let ts = rig.sample_timestamps();
    for pair in ts.windows(2) {
        let delta = pair[1] - pair[0];
        assert!(
            (9_999..=10_001).contains(&delta),
            "inter-sample spacing {} µs",
            delta
        );
    }
}

/// Scenario: PPS appears while a free-running stream is up. The discipline
/// must learn the oscillator error, a one-shot nudge must slew the grid, and
/// spacing must stay bounded by the per-sample clamp throughout.
#[test]
fn test_pps_acquisition_mid_stream() {
    let mut rig = SimRig::new(50.0, 100);

    rig.cmd("START_STREAM:100");
    rig.run_ms(500);
    assert_eq!(rig.controller.quality(), TimingQuality::InternalRaw);

    rig.pps_enabled = true;
    rig.run_ms(12_000);

    assert_eq!(rig.controller.quality(), TimingQuality::PpsActive);
    // Counter runs 50 ppm fast, so the learned correction is -50
    assert!(
        (rig.controller.ppm() + 50.0).abs() < 1.0,
        "ppm = {}",
        rig.controller.ppm()
    );
    assert!(rig.has_line_starting("DEBUG:Applying phase nudge"));

    // Steady state: real-time spacing within the nudge clamp around 10 ms
    let ts = rig.sample_timestamps();
    let tail = &ts[ts.len() - 200..];
    for pair in tail.windows(2) {
        let delta = pair[1] - pair[0];
        assert!(
            (9_978..=10_022).contains(&delta),
            "spacing {} µs outside clamp bounds",
            delta
        );
    }
}

/// Scenario: PPS loss walks quality down through holdover and calibrated
/// states to raw, and a returning PPS restores active immediately.
#[test]
fn test_pps_loss_and_recovery_state_walk() {
    let mut rig = SimRig::new(20.0, 1000);

    rig.pps_enabled = true;
    rig.run_ms(5_000);
    assert_eq!(rig.controller.quality(), TimingQuality::PpsActive);

    rig.pps_enabled = false;

    rig.run_ms(1_600);
    assert_eq!(rig.controller.quality(), TimingQuality::PpsHoldover);

    rig.run_ms(60_000);
    assert_eq!(rig.controller.quality(), TimingQuality::InternalCal);

    rig.run_ms(240_000);
    assert_eq!(rig.controller.quality(), TimingQuality::InternalRaw);
    assert!(rig.has_line_starting("WARNING:GPS PPS lost"));

    rig.clear_lines();
    rig.pps_enabled = true;
    rig.run_ms(2_100);
    assert_eq!(rig.controller.quality(), TimingQuality::PpsActive);
    assert!(rig.has_line_starting("DEBUG:GPS PPS acquired"));
}

/// Scenario: the 32-bit counter resets mid-stream. Virtual time and sample
/// indexing must continue; sequence numbers must not repeat or gap.
#[test]
fn test_clock_reset_during_stream() {
    let mut rig = SimRig::new(0.0, 100);

    rig.cmd("START_STREAM:100");
    rig.run_ms(2_000);

    rig.phys.borrow_mut().inject_reset();
    rig.run_ms(1_000);

    assert!(rig.has_line_starting("WARNING:Large backward micros() jump"));
    assert!(rig.has_line_starting("DEBUG:Timing continuity maintained"));
    assert!(rig.has_line_starting("WARNING:Using raw timing due to recent clock reset"));
    assert_eq!(rig.controller.quality(), TimingQuality::InternalRaw);

    let status = rig.controller.status();
    assert_eq!(status.clock_resets, 1);
    assert!((status.accuracy_us - 2000.0).abs() < f32::EPSILON);

    // Sequences advance one by one with no duplicates across the reset
    let seqs = rig.sample_sequences();
    for (i, seq) in seqs.iter().enumerate() {
        assert_eq!(*seq as usize, i, "sequence discontinuity at {}", i);
    }

    // Virtual timestamps never step backward
    let ts = rig.sample_timestamps();
    for pair in ts.windows(2) {
        assert!(pair[1] > pair[0], "timestamp went backward: {:?}", pair);
    }
}

/// Scenario: the 32-bit counter wraps mid-stream; the stream must not notice
/// beyond a single DEBUG line.
#[test]
fn test_counter_wrap_during_stream() {
    let mut rig = SimRig::new(0.0, 100);
    // Start the counter 3 s below the 32-bit ceiling
    rig.phys.borrow_mut().start_counter_us = u32::MAX as u64 - 3_000_000;

    rig.cmd("START_STREAM:100");
    rig.run_ms(6_000);

    assert!(rig.has_line_starting("DEBUG:micros() wraparound detected"));
    assert_eq!(rig.controller.status().wraparounds, 1);
    assert_eq!(rig.controller.status().clock_resets, 0);

    let ts = rig.sample_timestamps();
    assert!((595..=605).contains(&ts.len()), "got {} samples", ts.len());
    for pair in ts.windows(2) {
        let delta = pair[1] - pair[0];
        assert!(
            (9_999..=10_001).contains(&delta),
            "spacing {} µs across wrap",
            delta
        );
    }
}

/// Scenario: the host stops draining the TX buffer for two seconds. Samples
/// are dropped, OFLOW is rate-limited to 1 Hz, and every firing is accounted
/// for as either an emitted record or a skip.
#[test]
fn test_tx_backpressure_window() {
    let mut rig = SimRig::new(0.0, 100);

    rig.cmd("START_STREAM:100");
    rig.run_ms(500);
    let before_throttle = rig.sample_lines().len();

    rig.link.set_tx_free(15);
    rig.run_ms(2_000);
    // Nothing was emitted while starved
    assert_eq!(rig.sample_lines().len(), before_throttle);

    rig.link.set_tx_free(4096);
    rig.run_ms(500);
    let total_emitted = rig.sample_lines().len();
    assert!(
        total_emitted > before_throttle,
        "stream should resume after recovery"
    );

    let oflow: Vec<String> = rig
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("OFLOW:"))
        .collect();
    assert_eq!(oflow.len(), 2, "OFLOW lines: {:?}", oflow);
    assert!(!rig.has_line_starting("SEQUENCE_RESET:"));

    // Budget: every firing is either an emitted record or a counted skip
    let status = rig.controller.status();
    assert_eq!(
        status.samples_generated,
        total_emitted as u64 + status.samples_skipped as u64
    );
    assert!((195..=205).contains(&status.samples_skipped), "skipped {}", status.samples_skipped);
}

/// Scenario: rate micro-tuning is ppm-gated while PPS locked.
#[test]
fn test_rate_change_gated_while_locked() {
    let mut rig = SimRig::new(0.0, 100);

    rig.pps_enabled = true;
    rig.run_ms(3_000);
    assert_eq!(rig.controller.quality(), TimingQuality::PpsActive);

    rig.cmd("START_STREAM:100");
    rig.run_ms(500);
    rig.clear_lines();

    rig.cmd("SET_PRECISE_INTERVAL:10099");
    assert!(rig.has_line_starting("ERROR:Rate change too large while PPS locked"));

    // Grid spacing is unchanged by the rejected command
    rig.clear_lines();
    rig.run_ms(500);
    let ts = rig.sample_timestamps();
    for pair in ts.windows(2) {
        let delta = pair[1] - pair[0];
        assert!((9_995..=10_005).contains(&delta), "spacing {} µs", delta);
    }

    rig.cmd("SET_PRECISE_INTERVAL:10000");
    assert!(rig.has_line_starting("OK:Precise interval set to 10000us"));
}

/// Property: a stalled main loop produces exactly one late sample and the
/// grid jumps over the missed slots instead of bursting.
#[test]
fn test_no_burst_after_loop_stall() {
    let mut rig = SimRig::new(0.0, 100);

    rig.cmd("START_STREAM:100");
    rig.run_ms(500);
    rig.clear_lines();

    // Loop freezes for 55 ms; the late fire consumes one slot, four are jumped
    rig.stall_ms(55);
    rig.step();

    let after_stall = rig.sample_lines().len();
    assert_eq!(after_stall, 1, "exactly one sample after the stall");
    assert!(rig.has_line_starting("DEBUG:Skipped 4 missed slots"));

    // Cadence resumes at the nominal interval
    rig.clear_lines();
    rig.run_ms(200);
    let ts = rig.sample_timestamps();
    assert!((19..=21).contains(&ts.len()));
    for pair in ts.windows(2) {
        let delta = pair[1] - pair[0];
        assert!((9_999..=10_001).contains(&delta), "spacing {} µs", delta);
    }
}

/// Scenario: PPS-locked start anchors the grid exactly on a PPS edge.
#[test]
fn test_pps_locked_start_aligns_to_edge() {
    let mut rig = SimRig::new(0.0, 100);

    rig.pps_enabled = true;
    rig.run_ms(1_500);

    rig.cmd("START_STREAM_PPS:100,2");
    assert!(rig.has_line_starting("OK:Waiting for 2 PPS edges to start"));
    rig.clear_lines();

    rig.run_ms(2_100);
    assert!(rig.has_line_starting("OK:Streaming started at PPS with 100.00Hz"));

    // Counter has zero drift, so edges land on whole counted seconds and the
    // first sample must sit exactly on one
    let ts = rig.sample_timestamps();
    assert!(!ts.is_empty());
    assert_eq!(ts[0] % 1_000_000, 0, "first sample at {}", ts[0]);
}

/// Property: calibration written by one boot is read back by the next.
#[test]
fn test_calibration_survives_reboot() {
    let eeprom = SimEeprom::new();

    let mut rig = SimRig::with_eeprom(0.0, 100, eeprom.clone());
    rig.cmd("SET_CAL_PPM:-123.4");
    assert!((rig.controller.ppm() + 123.4).abs() < 1e-3);
    drop(rig);

    let rig = SimRig::with_eeprom(0.0, 100, eeprom);
    assert!(
        (rig.controller.ppm() + 123.4).abs() < 1e-3,
        "stored ppm should load at boot, got {}",
        rig.controller.ppm()
    );
}

/// Property: continuous PPS phase lock keeps the sampling grid within the
/// per-sample clamp of the PPS grid over a long run.
#[test]
fn test_phase_lock_adjustments_stay_clamped() {
    let mut rig = SimRig::new(35.0, 100);

    rig.cmd("START_STREAM:100");
    rig.run_ms(300);
    rig.pps_enabled = true;
    rig.run_ms(20_000);

    let ts = rig.sample_timestamps();
    for pair in ts[200..].windows(2) {
        let delta = pair[1] - pair[0];
        // nominal 10 ms, phase corrections hard-capped at ±20 µs, ±1 rounding
        assert!(
            (9_979..=10_021).contains(&delta),
            "per-sample adjustment exceeded clamp: {} µs",
            delta
        );
    }
}
