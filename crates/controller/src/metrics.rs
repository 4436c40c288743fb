//! Metrics Aggregator: reduces one poll frame to per-zone averages.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::IntegrityWarning;
use crate::poller::Reading;

/// Firmware convention for a faulted or absent sensor channel. Any value at
/// or above it is dropped from averaging.
///
/// A protocol revision should replace this with a per-channel fault bit.
pub const FAULT_SENTINEL: f64 = 9000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    HardwareId,
    Temperature,
    Humidity,
    SoilMoisture,
    FlowRate,
    WaterOn,
}

impl ReadingKind {
    const PATTERNS: [(&'static str, ReadingKind); 6] = [
        ("hardware_id", ReadingKind::HardwareId),
        ("temperature", ReadingKind::Temperature),
        ("humidity", ReadingKind::Humidity),
        ("soil_moisture", ReadingKind::SoilMoisture),
        ("flow_rate", ReadingKind::FlowRate),
        ("water_on", ReadingKind::WaterOn),
    ];

    /// Case-insensitive substring match against the known field names.
    pub fn classify(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        Self::PATTERNS
            .iter()
            .find(|(pattern, _)| name.contains(pattern))
            .map(|&(_, kind)| kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneAverages {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub flow_rate: Option<f64>,
    /// Raw valve state as reported by the unit.
    pub water_on: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub averages: ZoneAverages,
    pub warnings: Vec<IntegrityWarning>,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: u32,
}

impl Mean {
    fn push(&mut self, value: f64) {
        if value >= FAULT_SENTINEL {
            return;
        }
        self.sum += value;
        self.count += 1;
    }

    fn get(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / f64::from(self.count))
    }
}

/// Average every measurement kind in `readings`. A kind with no
/// contributing values is `None`, never zero.
pub fn aggregate(readings: &[Reading], at: OffsetDateTime) -> Aggregate {
    let mut temperature = Mean::default();
    let mut humidity = Mean::default();
    let mut soil_moisture = Mean::default();
    let mut flow_rate = Mean::default();
    let mut water_on = None;
    let mut warnings = Vec::new();

    for reading in readings {
        match ReadingKind::classify(&reading.name) {
            Some(ReadingKind::HardwareId) => {}
            Some(ReadingKind::Temperature) => temperature.push(reading.value),
            Some(ReadingKind::Humidity) => humidity.push(reading.value),
            Some(ReadingKind::SoilMoisture) => soil_moisture.push(reading.value),
            Some(ReadingKind::FlowRate) => flow_rate.push(reading.value),
            Some(ReadingKind::WaterOn) => water_on = Some(reading.value),
            None => {
                warnings.push(IntegrityWarning::UnclassifiedReading {
                    name: reading.name.clone(),
                });
                water_on = Some(reading.value);
            }
        }
    }

    Aggregate {
        averages: ZoneAverages {
            temperature: temperature.get(),
            humidity: humidity.get(),
            soil_moisture: soil_moisture.get(),
            flow_rate: flow_rate.get(),
            water_on,
            updated_at: at,
        },
        warnings,
    }
}
