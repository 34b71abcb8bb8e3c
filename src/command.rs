//! Textual command parsing. A line is `TAG` or `TAG:params`; parsing
//! validates syntax and static ranges, while state-dependent rules (streaming
//! guards, ppm-gated rate changes) stay with the controller.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Full,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    StartStream { rate_hz: Option<f64> },
    StartStreamSync { rate_hz: f64, delay_ms: u32 },
    StartStreamPps { rate_hz: f64, edges: u8 },
    StopStream,
    SetAdcRate { index: u8 },
    SetGain { index: u8 },
    SetFilter { index: u8 },
    SetDithering { count: u8 },
    SetChannels { count: u8 },
    SetPreciseInterval { interval_us: u64 },
    SetOutputFormat { format: OutputFormat },
    SetSequenceValidation { enabled: bool },
    SetCalPpm { ppm: f32 },
    GetStatus,
    GetTimingStatus,
    GetFilter,
    GetDithering,
    GetOutputFormat,
    GetSequenceValidation,
    Reset,
}

pub fn parse_line(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Err(anyhow!("Invalid command format"));
    }

    let (tag, params) = match line.find(':') {
        Some(0) => return Err(anyhow!("Invalid command format")),
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, ""),
    };

    match tag {
        "START_STREAM" => {
            if params.is_empty() {
                return Ok(Command::StartStream { rate_hz: None });
            }
            let rate = parse_rate(params)?;
            Ok(Command::StartStream { rate_hz: Some(rate) })
        }
        "START_STREAM_SYNC" => {
            let (rate_str, delay_str) = split_pair(params)
                .ok_or_else(|| anyhow!("Invalid sync parameters"))?;
            let rate: f64 = rate_str.parse().map_err(|_| anyhow!("Invalid rate or delay"))?;
            let delay_ms: u32 = delay_str.parse().map_err(|_| anyhow!("Invalid rate or delay"))?;
            if rate <= 0.0 || rate > 1000.0 || delay_ms >= 10_000 {
                return Err(anyhow!("Invalid rate or delay"));
            }
            Ok(Command::StartStreamSync { rate_hz: rate, delay_ms })
        }
        "START_STREAM_PPS" => {
            let (rate_str, edges_str) = split_pair(params)
                .ok_or_else(|| anyhow!("Invalid PPS start parameters"))?;
            let rate: f64 = rate_str
                .parse()
                .map_err(|_| anyhow!("Invalid rate or PPS wait count (1-5)"))?;
            let edges: u8 = edges_str
                .parse()
                .map_err(|_| anyhow!("Invalid rate or PPS wait count (1-5)"))?;
            if rate <= 0.0 || rate > 1000.0 || !(1..=5).contains(&edges) {
                return Err(anyhow!("Invalid rate or PPS wait count (1-5)"));
            }
            Ok(Command::StartStreamPps { rate_hz: rate, edges })
        }
        "STOP_STREAM" => Ok(Command::StopStream),
        "SET_ADC_RATE" => {
            let index: u8 = params.parse().map_err(|_| anyhow!("Invalid rate index"))?;
            if !(1..=16).contains(&index) {
                return Err(anyhow!("Invalid rate index"));
            }
            Ok(Command::SetAdcRate { index })
        }
        "SET_GAIN" => {
            let index: u8 = params.parse().map_err(|_| anyhow!("Invalid gain index"))?;
            if !(1..=6).contains(&index) {
                return Err(anyhow!("Invalid gain index"));
            }
            Ok(Command::SetGain { index })
        }
        "SET_FILTER" => {
            let index: u8 = params
                .parse()
                .map_err(|_| anyhow!("Invalid filter index (1-5)"))?;
            if !(1..=5).contains(&index) {
                return Err(anyhow!("Invalid filter index (1-5)"));
            }
            Ok(Command::SetFilter { index })
        }
        "SET_DITHERING" => {
            let count: u8 = params
                .parse()
                .map_err(|_| anyhow!("Invalid dithering value (0, 2, 3, or 4)"))?;
            if !matches!(count, 0 | 2 | 3 | 4) {
                return Err(anyhow!("Invalid dithering value (0, 2, 3, or 4)"));
            }
            Ok(Command::SetDithering { count })
        }
        "SET_CHANNELS" => {
            let count: u8 = params.parse().map_err(|_| anyhow!("Invalid channel count"))?;
            if !(1..=3).contains(&count) {
                return Err(anyhow!("Invalid channel count"));
            }
            Ok(Command::SetChannels { count })
        }
        "SET_PRECISE_INTERVAL" => {
            let interval_us: u64 = params
                .parse()
                .map_err(|_| anyhow!("Invalid interval (9900-10100 us)"))?;
            if !(9_900..=10_100).contains(&interval_us) {
                return Err(anyhow!("Invalid interval (9900-10100 us)"));
            }
            Ok(Command::SetPreciseInterval { interval_us })
        }
        "SET_OUTPUT_FORMAT" => match params {
            "COMPACT" => Ok(Command::SetOutputFormat {
                format: OutputFormat::Compact,
            }),
            "FULL" => Ok(Command::SetOutputFormat {
                format: OutputFormat::Full,
            }),
            _ => Err(anyhow!("Invalid format (COMPACT or FULL)")),
        },
        "SET_SEQUENCE_VALIDATION" => match params {
            "ON" => Ok(Command::SetSequenceValidation { enabled: true }),
            "OFF" => Ok(Command::SetSequenceValidation { enabled: false }),
            _ => Err(anyhow!("Invalid parameter (ON or OFF)")),
        },
        "SET_CAL_PPM" => {
            let ppm: f32 = params.parse().map_err(|_| anyhow!("Invalid ppm value"))?;
            if !ppm.is_finite() {
                return Err(anyhow!("Invalid ppm value"));
            }
            Ok(Command::SetCalPpm { ppm })
        }
        "GET_STATUS" => Ok(Command::GetStatus),
        "GET_TIMING_STATUS" => Ok(Command::GetTimingStatus),
        "GET_FILTER" => Ok(Command::GetFilter),
        "GET_DITHERING" => Ok(Command::GetDithering),
        "GET_OUTPUT_FORMAT" => Ok(Command::GetOutputFormat),
        "GET_SEQUENCE_VALIDATION" => Ok(Command::GetSequenceValidation),
        "RESET" => Ok(Command::Reset),
        _ => Err(anyhow!("Unknown command")),
    }
}

fn parse_rate(params: &str) -> Result<f64> {
    let rate: f64 = params.parse().map_err(|_| anyhow!("Invalid rate (0-1000 Hz)"))?;
    if rate <= 0.0 || rate > 1000.0 {
        return Err(anyhow!("Invalid rate (0-1000 Hz)"));
    }
    Ok(rate)
}

fn split_pair(params: &str) -> Option<(&str, &str)> {
    let idx = params.find(',')?;
    if idx == 0 {
        return None;
    }
    Some((&params[..idx], &params[idx + 1..]))
}

// ============================================================================
// TESTS
// ============================================================================
