//! TOML config file loading and validation: system settings, link timing,
//! schedule tuning, collaborators, and the static zone list.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::link::LinkTimings;
use crate::scheduler::ScheduleTimings;

/// Numeric address of a zone unit on the shared link. Zero is reserved for
/// the detached state.
pub type ZoneId = u32;

/// `serial.port` value that selects the built-in simulated radio.
pub const SIM_PORT: &str = "sim";

/// Upper bound for any configured schedule duration (one week).
const MAX_SCHEDULE_SEC: u64 = 7 * 24 * 3600;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Moisture breaches schedule watering on their own.
    Automatic,
    /// Moisture breaches only surface as warnings.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoilType {
    Clay,
    Sand,
    Loam,
}

impl SoilType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clay => "clay",
            Self::Sand => "sand",
            Self::Loam => "loam",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub soil_type: SoilType,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_remote_interval_sec")]
    pub remote_interval_sec: u64,
    #[serde(default = "default_weather_interval_sec")]
    pub weather_interval_sec: u64,
    #[serde(default = "default_tick_sec")]
    pub tick_sec: u64,
    pub serial: SerialConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub weather: Option<WeatherConfig>,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_escape_settle_ms")]
    pub escape_settle_ms: u64,
    #[serde(default = "default_disconnect_settle_ms")]
    pub disconnect_settle_ms: u64,
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,
    #[serde(default = "default_probe_window_ms")]
    pub probe_window_ms: u64,
    #[serde(default = "default_poll_settle_ms")]
    pub poll_settle_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub delay_sec: u64,
    pub watering_sec: u64,
    pub moisture_threshold: f64,
    pub override_delay_min: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub db_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub url: String,
    pub token: String,
    pub latitude: f64,
    pub longitude: f64,
}

fn default_mode() -> Mode {
    Mode::Automatic
}
fn default_remote_interval_sec() -> u64 {
    60
}
fn default_weather_interval_sec() -> u64 {
    3600
}
fn default_tick_sec() -> u64 {
    5
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_timeout_sec() -> u64 {
    5
}
fn default_escape_settle_ms() -> u64 {
    500
}
fn default_disconnect_settle_ms() -> u64 {
    1000
}
fn default_connect_settle_ms() -> u64 {
    3000
}
fn default_probe_window_ms() -> u64 {
    500
}
fn default_poll_settle_ms() -> u64 {
    100
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            delay_sec: 20 * 60,
            watering_sec: 30,
            moisture_threshold: 25.0,
            override_delay_min: 60,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:irrigation.db?mode=rwc".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Derived runtime settings
// ---------------------------------------------------------------------------

impl SerialConfig {
    pub fn timings(&self) -> LinkTimings {
        LinkTimings {
            escape_settle: Duration::from_millis(self.escape_settle_ms),
            disconnect_settle: Duration::from_millis(self.disconnect_settle_ms),
            connect_settle: Duration::from_millis(self.connect_settle_ms),
            probe_window: Duration::from_millis(self.probe_window_ms),
            poll_settle: Duration::from_millis(self.poll_settle_ms),
            read_timeout: Duration::from_secs(self.timeout_sec),
        }
    }
}

impl ScheduleConfig {
    pub fn timings(&self) -> ScheduleTimings {
        ScheduleTimings {
            delay: Duration::from_secs(self.delay_sec),
            watering: Duration::from_secs(self.watering_sec),
            moisture_threshold: self.moisture_threshold,
        }
    }

    pub fn override_delay(&self) -> Duration {
        Duration::from_secs(self.override_delay_min.saturating_mul(60))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_system(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_system(&self, errors: &mut Vec<String>) {
        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }

        // ── Intervals ───────────────────────────────────────
        for (field, value) in [
            ("remote_interval_sec", self.remote_interval_sec),
            ("weather_interval_sec", self.weather_interval_sec),
            ("tick_sec", self.tick_sec),
            ("serial.timeout_sec", self.serial.timeout_sec),
            ("schedule.watering_sec", self.schedule.watering_sec),
            ("schedule.override_delay_min", self.schedule.override_delay_min),
        ] {
            if value == 0 {
                errors.push(format!("{field} must be positive"));
            }
        }

        // ── Serial link ─────────────────────────────────────
        if self.serial.port.trim().is_empty() {
            errors.push("serial.port is empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            errors.push("serial.baud_rate must be positive".to_string());
        }

        // ── Schedule ────────────────────────────────────────
        for (field, secs) in [
            ("schedule.delay_sec", self.schedule.delay_sec),
            ("schedule.watering_sec", self.schedule.watering_sec),
            (
                "schedule.override_delay_min",
                self.schedule.override_delay_min.saturating_mul(60),
            ),
        ] {
            if secs > MAX_SCHEDULE_SEC {
                errors.push(format!("{field} exceeds one week"));
            }
        }
        let threshold = self.schedule.moisture_threshold;
        if !(threshold > 0.0 && threshold <= 100.0) {
            errors.push(format!(
                "schedule.moisture_threshold {threshold} out of range (0, 100]"
            ));
        }

        // ── Collaborators ───────────────────────────────────
        if self.metrics.db_url.trim().is_empty() {
            errors.push("metrics.db_url is empty".to_string());
        }
        if let Some(w) = &self.weather {
            if w.url.trim().is_empty() {
                errors.push("weather.url is empty".to_string());
            }
            if !(-90.0..=90.0).contains(&w.latitude) {
                errors.push(format!("weather.latitude {} out of range", w.latitude));
            }
            if !(-180.0..=180.0).contains(&w.longitude) {
                errors.push(format!("weather.longitude {} out of range", w.longitude));
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<ZoneId> = HashSet::new();
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.name.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.name)
                }
            };

            if z.id == 0 {
                errors.push(format!("{}: id 0 is reserved for the detached link", ctx()));
            } else if !seen_ids.insert(z.id) {
                errors.push(format!("{}: duplicate id {}", ctx(), z.id));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&z.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + example
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// A complete config with every section filled in, printed by the
/// `example` subcommand.
pub fn example() -> Config {
    let soil = [SoilType::Loam, SoilType::Clay, SoilType::Sand];
    Config {
        name: "example_system".to_string(),
        mode: Mode::Automatic,
        remote_interval_sec: default_remote_interval_sec(),
        weather_interval_sec: default_weather_interval_sec(),
        tick_sec: default_tick_sec(),
        serial: SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            timeout_sec: default_timeout_sec(),
            escape_settle_ms: default_escape_settle_ms(),
            disconnect_settle_ms: default_disconnect_settle_ms(),
            connect_settle_ms: default_connect_settle_ms(),
            probe_window_ms: default_probe_window_ms(),
            poll_settle_ms: default_poll_settle_ms(),
        },
        schedule: ScheduleConfig::default(),
        metrics: MetricsConfig::default(),
        web: WebConfig::default(),
        weather: Some(WeatherConfig {
            url: "http://api.openweathermap.org".to_string(),
            token: "my_open_weather_map_token".to_string(),
            latitude: -19.2569391,
            longitude: 146.8239537,
        }),
        zones: (1..=3)
            .zip(soil)
            .map(|(id, soil_type)| Zone {
                id,
                name: format!("unit_{id}"),
                soil_type,
            })
            .collect(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        example()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config_fills_defaults() {
        let toml_str = r#"
name = "garden"

[serial]
port = "/dev/ttyUSB0"

[[zones]]
id = 1
name = "beds"
soil_type = "loam"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mode, Mode::Automatic);
        assert_eq!(config.remote_interval_sec, 60);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.serial.connect_settle_ms, 3000);
        assert_eq!(config.schedule.moisture_threshold, 25.0);
        assert_eq!(config.schedule.override_delay_min, 60);
        assert!(config.weather.is_none());
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].soil_type, SoilType::Loam);
        config.validate().unwrap();
    }

    #[test]
    fn parse_manual_mode() {
        let toml_str = r#"
name = "garden"
mode = "manual"

[serial]
port = "sim"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mode, Mode::Manual);
        assert_eq!(config.serial.port, SIM_PORT);
    }

    #[test]
    fn parse_unknown_soil_type_fails() {
        let toml_str = r#"
name = "garden"

[serial]
port = "sim"

[[zones]]
id = 1
name = "beds"
soil_type = "gravel"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn example_round_trips_through_toml() {
        let text = toml::to_string_pretty(&example()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.zones, example().zones);
        assert!(parsed.weather.is_some());
        parsed.validate().unwrap();
    }

    #[test]
    fn serial_timings_convert_units() {
        let t = valid_config().serial.timings();
        assert_eq!(t.escape_settle, Duration::from_millis(500));
        assert_eq!(t.connect_settle, Duration::from_secs(3));
        assert_eq!(t.read_timeout, Duration::from_secs(5));
    }

    #[test]
    fn override_delay_is_in_minutes() {
        assert_eq!(
            ScheduleConfig::default().override_delay(),
            Duration::from_secs(3600)
        );
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.name = " ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.remote_interval_sec = 0;
        assert_validation_err(&cfg, "remote_interval_sec must be positive");
    }

    #[test]
    fn zero_watering_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.watering_sec = 0;
        assert_validation_err(&cfg, "schedule.watering_sec must be positive");
    }

    #[test]
    fn schedule_durations_are_bounded() {
        let mut cfg = valid_config();
        cfg.schedule.delay_sec = MAX_SCHEDULE_SEC + 1;
        assert_validation_err(&cfg, "schedule.delay_sec exceeds one week");

        let mut cfg = valid_config();
        cfg.schedule.override_delay_min = u64::MAX;
        assert_validation_err(&cfg, "schedule.override_delay_min exceeds one week");
        assert_eq!(cfg.schedule.override_delay(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn empty_serial_port_rejected() {
        let mut cfg = valid_config();
        cfg.serial.port = "".into();
        assert_validation_err(&cfg, "serial.port is empty");
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.moisture_threshold = 120.0;
        assert_validation_err(&cfg, "moisture_threshold 120 out of range");
    }

    #[test]
    fn bad_latitude_rejected() {
        let mut cfg = valid_config();
        if let Some(w) = cfg.weather.as_mut() {
            w.latitude = 95.0;
        }
        assert_validation_err(&cfg, "weather.latitude 95 out of range");
    }

    #[test]
    fn zone_id_zero_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].id = 0;
        assert_validation_err(&cfg, "id 0 is reserved");
    }

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones[1].id = cfg.zones[0].id;
        assert_validation_err(&cfg, "duplicate id 1");
    }

    #[test]
    fn zone_duplicate_name_rejected() {
        let mut cfg = valid_config();
        cfg.zones[1].name = cfg.zones[0].name.clone();
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn zone_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].name = "".into();
        assert_validation_err(&cfg, "zones[0]: name is empty");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.name = "".into();
        cfg.tick_sec = 0;
        cfg.zones[0].id = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("name is empty"), "got: {msg}");
        assert!(msg.contains("tick_sec"), "got: {msg}");
        assert!(msg.contains("reserved"), "got: {msg}");
    }

    #[test]
    fn load_missing_file_fails_with_path() {
        let err = load("/nonexistent/irrigation.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/irrigation.toml"));
    }
}
