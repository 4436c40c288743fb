//! Simulated radio and zone units for running without hardware.
//!
//! Models the command-mode radio closely enough to exercise every recovery
//! path of the link manager and poller:
//! - `$$$` drops into command mode, `---` leaves it
//! - `c<id>` connects; occasionally it fails and echoes `%%DISCONNECT%`,
//!   leaving the radio in command mode
//! - anything sent while in command mode is answered with the `CMD>` prompt
//!
//! Each unit carries a soil-moisture random walk with drying drift, mean
//! reversion, noise, occasional faulted sensors (reported as the firmware's
//! out-of-range sentinel), and a closed-loop response to its valve.

use std::collections::{BTreeMap, VecDeque};
use std::io;

use fastrand::Rng;

use super::{Transport, COMMAND_MODE_MARKER, DISCONNECT_MARKER};
use crate::config::ZoneId;

/// Value reported by a faulted sensor channel.
const FAULT_READING: f64 = 9999.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

fn gaussian(rng: &mut Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Zone unit
// ---------------------------------------------------------------------------

struct SimUnit {
    /// Current "true" soil moisture in percent. Evolves every poll.
    moisture: f64,
    temperature: f64,
    humidity: f64,
    valve_on: bool,
}

impl SimUnit {
    const DRIFT_PER_POLL: f64 = -0.4;
    const MEAN_REVERSION: f64 = 0.01;
    const CENTER: f64 = 35.0;
    const WET_RATE: f64 = 4.0;

    fn new(rng: &mut Rng) -> Self {
        Self {
            moisture: gaussian(rng, 32.0, 4.0).clamp(5.0, 60.0),
            temperature: gaussian(rng, 24.0, 3.0),
            humidity: gaussian(rng, 55.0, 8.0).clamp(0.0, 100.0),
            valve_on: false,
        }
    }

    fn step(&mut self, rng: &mut Rng) {
        let pull = Self::MEAN_REVERSION * (Self::CENTER - self.moisture);
        let wet = if self.valve_on { Self::WET_RATE } else { 0.0 };
        self.moisture = (self.moisture + Self::DRIFT_PER_POLL + pull + wet + gaussian(rng, 0.0, 0.5))
            .clamp(0.0, 100.0);
        self.temperature += gaussian(rng, 0.0, 0.2);
        self.humidity = (self.humidity + gaussian(rng, 0.0, 0.5)).clamp(0.0, 100.0);
    }

    fn channel(&self, rng: &mut Rng, base: f64, sigma: f64, fault_prob: f32) -> f64 {
        if rng.f32() < fault_prob {
            FAULT_READING
        } else {
            (gaussian(rng, base, sigma) * 10.0).round() / 10.0
        }
    }

    /// One 14-token poll reply, newline terminated.
    fn frame(&mut self, zone: ZoneId, rng: &mut Rng, fault_prob: f32) -> String {
        self.step(rng);
        let mut fields = vec![format!("hardware_id={zone}")];
        for suffix in ["a", "b", "c"] {
            let v = self.channel(rng, self.temperature, 0.3, fault_prob);
            fields.push(format!("temperature_{suffix}={v}"));
        }
        for suffix in ["a", "b", "c"] {
            let v = self.channel(rng, self.humidity, 1.0, fault_prob);
            fields.push(format!("humidity_{suffix}={v}"));
        }
        for suffix in ["a", "b", "c", "d"] {
            let v = self.channel(rng, self.moisture, 1.5, fault_prob);
            fields.push(format!("soil_moisture_{suffix}={v}"));
        }
        let flow = if self.valve_on { 6.5 } else { 0.0 };
        for suffix in ["a", "b"] {
            let v = self.channel(rng, flow, 0.1, fault_prob).max(0.0);
            fields.push(format!("flow_rate_{suffix}={v}"));
        }
        fields.push(format!("water_on={}", u8::from(self.valve_on)));
        format!("{}\r\n", fields.join(","))
    }
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

/// Stateful stand-in for the radio module and every unit behind it.
pub struct SimRadio {
    units: BTreeMap<ZoneId, SimUnit>,
    command_mode: bool,
    connected: Option<ZoneId>,
    pending: VecDeque<u8>,
    rng: Rng,
    connect_failure_prob: f32,
    fault_prob: f32,
}

impl SimRadio {
    pub fn new(zones: &[ZoneId], seed: u64) -> Self {
        let mut rng = Rng::with_seed(seed);
        let units = zones.iter().map(|&z| (z, SimUnit::new(&mut rng))).collect();
        Self {
            units,
            command_mode: false,
            connected: None,
            pending: VecDeque::new(),
            rng,
            connect_failure_prob: 0.05,
            fault_prob: 0.02,
        }
    }

    pub fn with_connect_failure_prob(mut self, p: f32) -> Self {
        self.connect_failure_prob = p;
        self
    }

    pub fn with_fault_prob(mut self, p: f32) -> Self {
        self.fault_prob = p;
        self
    }

    pub fn valve_on(&self, zone: ZoneId) -> bool {
        self.units.get(&zone).is_some_and(|u| u.valve_on)
    }

    fn reply(&mut self, text: &str) {
        self.pending.extend(text.bytes());
    }

    fn handle_command(&mut self, line: &str) {
        if line == "---" {
            self.command_mode = false;
            self.reply("END\r\n");
        } else if line == "k,1" {
            self.connected = None;
            self.reply("AOK\r\n");
        } else if let Some(zone) = line.strip_prefix('c').and_then(|id| id.parse::<ZoneId>().ok()) {
            if self.units.contains_key(&zone) && self.rng.f32() >= self.connect_failure_prob {
                self.connected = Some(zone);
                self.command_mode = false;
                self.reply("Trying\r\n%CONNECT%\r\n");
            } else {
                self.reply(&format!("Trying\r\n{DISCONNECT_MARKER}\r\n"));
            }
        } else if !line.is_empty() {
            self.reply(&format!("{COMMAND_MODE_MARKER}> ?\r\n"));
        }
    }

    fn handle_data(&mut self, line: &str) {
        let Some(zone) = self.connected else {
            return;
        };
        let Some((verb, arg)) = line.split_once('=') else {
            return;
        };
        if arg.trim().parse::<ZoneId>().ok() != Some(zone) && verb != "poll" {
            // Actuation addressed to another unit is ignored by this one.
            return;
        }
        let fault_prob = self.fault_prob;
        let Some(unit) = self.units.get_mut(&zone) else {
            return;
        };
        match verb {
            "poll" => {
                let frame = unit.frame(zone, &mut self.rng, fault_prob);
                self.reply(&frame);
            }
            "water_on" => unit.valve_on = true,
            "water_off" => unit.valve_on = false,
            _ => {}
        }
    }
}

impl Transport for SimRadio {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        if text == "$$$" {
            self.command_mode = true;
            self.reply(&format!("{COMMAND_MODE_MARKER}\r\n"));
            return Ok(bytes.len());
        }
        let line = text.trim();
        if self.command_mode {
            self.handle_command(line);
        } else {
            self.handle_data(line);
        }
        Ok(bytes.len())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
