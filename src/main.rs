use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod calstore;
mod command;
mod config;
mod controller;
mod discipline;
mod output;
mod pps;
mod quality;
mod sampler;
mod scheduler;
mod status;
mod traits;
mod vclock;

use config::SystemConfig;
use controller::Controller;
use pps::PpsLatch;
use traits::{Adc, BoardClock, Eeprom, HostLink, TempSensor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Default stream rate in Hz
    #[arg(long, default_value_t = 100.0)]
    rate: f64,

    /// JSON config file overriding the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration store backing file
    #[arg(long, default_value = "ppstream_cal.bin")]
    eeprom: PathBuf,

    /// Publish a synthetic PPS edge once per second (no GPS hardware needed)
    #[arg(long, default_value_t = false)]
    sim_pps: bool,
}

// Host-side board implementations. The raw counters are deliberately
// truncated to u32 so the virtual clock's wrap handling runs for real.

#[derive(Clone)]
struct HostBoardClock {
    epoch: Instant,
}

impl HostBoardClock {
    fn new() -> Self {
        HostBoardClock {
            epoch: Instant::now(),
        }
    }
}

impl BoardClock for HostBoardClock {
    fn raw_micros(&mut self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    fn raw_millis(&mut self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn delay_micros(&mut self, us: u32) {
        let deadline = self.epoch.elapsed() + Duration::from_micros(us as u64);
        while self.epoch.elapsed() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// stdin/stdout as the serial link. A reader thread feeds bytes through a
/// channel so `read_byte` never blocks the main loop.
struct StdioLink {
    rx: Receiver<u8>,
}

impl StdioLink {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            use std::io::Read;
            let stdin = std::io::stdin();
            for byte in stdin.lock().bytes().map_while(|b| b.ok()) {
                if tx.send(byte).is_err() {
                    break;
                }
            }
        });
        StdioLink { rx }
    }
}

impl HostLink for StdioLink {
    fn write_line(&mut self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }

    fn read_byte(&mut self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(byte) => Some(byte),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn tx_available(&mut self) -> usize {
        // stdout is effectively unbounded on a host
        4096
    }
}

struct FileEeprom {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FileEeprom {
    fn open(path: PathBuf) -> Result<Self> {
        let bytes = match fs::read(&path) {
            Ok(data) if data.len() >= 8 => data,
            _ => vec![0xFF; 16],
        };
        Ok(FileEeprom { path, bytes })
    }
}

impl Eeprom for FileEeprom {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(anyhow!("eeprom read past end ({} > {})", end, self.bytes.len()));
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(anyhow!("eeprom write past end ({} > {})", end, self.bytes.len()));
        }
        self.bytes[offset..end].copy_from_slice(buf);
        fs::write(&self.path, &self.bytes)?;
        Ok(())
    }
}

/// A host has no ADS126x; this source produces a stable mid-scale reading
/// with a slow ramp so streamed records are distinguishable.
struct BenchAdc {
    counter: u64,
}

impl Adc for BenchAdc {
    fn set_rate(&mut self, _rate: sampler::AdcRate) -> Result<()> {
        Ok(())
    }
    fn set_gain(&mut self, _gain: sampler::AdcGain) -> Result<()> {
        Ok(())
    }
    fn set_filter(&mut self, _filter: sampler::AdcFilter) -> Result<()> {
        Ok(())
    }
    fn select_input(&mut self, _pos: u8, _neg: u8) {}
    fn data_ready(&mut self) -> bool {
        true
    }
    fn read_conversion(&mut self) -> i64 {
        self.counter += 1;
        1_000_000 + (self.counter % 1000) as i64
    }
}

struct FixedTemp;

impl TempSensor for FixedTemp {
    fn read_celsius(&mut self) -> f32 {
        25.0
    }
}

fn spawn_sim_pps(latch: Arc<PpsLatch>, clock: HostBoardClock) {
    thread::spawn(move || {
        let mut clock = clock;
        loop {
            let now = clock.epoch.elapsed();
            let next_second = Duration::from_secs(now.as_secs() + 1);
            thread::sleep(next_second - now);
            latch.publish(clock.raw_micros(), clock.raw_millis());
        }
    });
}

fn load_config(args: &Args) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        }
        None => SystemConfig::default(),
    };
    config.stream.rate_hz = args.rate;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let config = load_config(&args)?;
    info!(
        "Starting bench streamer: rate={}Hz, eeprom={:?}, sim_pps={}",
        config.stream.rate_hz, args.eeprom, args.sim_pps
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let clock = HostBoardClock::new();
    let latch = Arc::new(PpsLatch::new());

    if args.sim_pps {
        info!("Simulated PPS enabled (1 Hz host timer)");
        spawn_sim_pps(latch.clone(), clock.clone());
    }

    let eeprom = FileEeprom::open(args.eeprom)?;
    let mut controller = Controller::new(
        clock,
        BenchAdc { counter: 0 },
        StdioLink::new(),
        eeprom,
        FixedTemp,
        latch,
        config,
    )?;

    while running.load(Ordering::SeqCst) {
        if let Err(e) = controller.tick() {
            warn!("Error in loop: {}", e);
        }

        if !controller.is_streaming() {
            thread::sleep(Duration::from_micros(100));
        }
    }

    info!("Exiting.");
    Ok(())
}
