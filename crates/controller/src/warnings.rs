//! Warning Generator: stateless threshold checks over the latest zone
//! averages and weather snapshot. Re-evaluated on every query.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{Mode, Zone, ZoneId};
use crate::metrics::ZoneAverages;
use crate::weather::WeatherSnapshot;

const TEMPERATURE_HIGH: f64 = 35.0;
const TEMPERATURE_LOW: f64 = 12.0;
const HUMIDITY_HIGH: f64 = 90.0;
const HUMIDITY_LOW: f64 = 20.0;
const CLOUD_COVER_HIGH: f64 = 90.0;
/// m/s; close to cyclonic.
const WIND_SPEED_HIGH: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub name: String,
    pub value: f64,
    pub message: String,
}

impl Warning {
    fn new(name: &str, value: f64, message: String) -> Self {
        Self {
            name: name.to_string(),
            value,
            message,
        }
    }
}

/// Inputs for one evaluation.
pub struct Conditions<'a> {
    pub zones: &'a [Zone],
    pub averages: &'a BTreeMap<ZoneId, ZoneAverages>,
    pub weather: Option<&'a WeatherSnapshot>,
    pub mode: Mode,
    pub moisture_threshold: f64,
}

/// Zone warnings in configured zone order, then weather warnings.
pub fn evaluate(c: &Conditions<'_>) -> Vec<Warning> {
    let mut out = Vec::new();

    for zone in c.zones {
        let Some(avg) = c.averages.get(&zone.id) else {
            continue;
        };
        let id = zone.id;

        match avg.temperature {
            Some(t) if t > TEMPERATURE_HIGH => out.push(Warning::new(
                &zone.name,
                t,
                format!("Temperature is high, zone {id} should be monitored"),
            )),
            Some(t) if t < TEMPERATURE_LOW => out.push(Warning::new(
                &zone.name,
                t,
                format!("Temperature is low, zone {id} should be monitored"),
            )),
            _ => {}
        }

        match avg.humidity {
            Some(h) if h > HUMIDITY_HIGH => out.push(Warning::new(
                &zone.name,
                h,
                format!("Humidity is very high, zone {id} should be monitored"),
            )),
            Some(h) if h < HUMIDITY_LOW => out.push(Warning::new(
                &zone.name,
                h,
                format!("Humidity is very low, zone {id} should be monitored"),
            )),
            _ => {}
        }

        // Automatic mode schedules watering itself; manual mode relies on
        // the operator noticing this.
        if c.mode == Mode::Manual {
            if let Some(m) = avg.soil_moisture.filter(|&m| m < c.moisture_threshold) {
                out.push(Warning::new(
                    &zone.name,
                    m,
                    format!("Soil moisture is low, zone {id} needs watering"),
                ));
            }
        }
    }

    if let Some(w) = c.weather {
        if w.cloud_cover > CLOUD_COVER_HIGH {
            out.push(Warning::new(
                "Cloud cover",
                w.cloud_cover,
                "It is very cloudy, plants may not receive optimal sunlight".to_string(),
            ));
        }
        if w.wind_speed > WIND_SPEED_HIGH {
            out.push(Warning::new(
                "High wind speed",
                w.wind_speed,
                "The current wind speed is very high, ensure plants are sheltered".to_string(),
            ));
        }
    }

    out
}
