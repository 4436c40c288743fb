//! Current-weather source backed by the OpenWeatherMap HTTP API.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::WeatherConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub temperature_k: f64,
    /// Percent.
    pub humidity: f64,
    /// Percent.
    pub cloud_cover: f64,
    /// Metres per second.
    pub wind_speed: f64,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

pub trait WeatherSource: Send + Sync {
    fn current_weather(&self) -> impl Future<Output = Result<WeatherSnapshot>> + Send;
}

// ---------------------------------------------------------------------------
// Response document (only the fields we use)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    #[serde(default)]
    weather: Vec<Condition>,
    main: Main,
    #[serde(default)]
    wind: Wind,
    #[serde(default)]
    clouds: Clouds,
}

#[derive(Debug, Deserialize)]
struct Condition {
    description: String,
}

#[derive(Debug, Deserialize)]
struct Main {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Wind {
    speed: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Clouds {
    all: f64,
}

impl CurrentWeather {
    fn into_snapshot(self, fetched_at: OffsetDateTime) -> WeatherSnapshot {
        WeatherSnapshot {
            temperature_k: self.main.temp,
            humidity: self.main.humidity,
            cloud_cover: self.clouds.all,
            wind_speed: self.wind.speed,
            description: self
                .weather
                .into_iter()
                .next()
                .map(|c| c.description)
                .unwrap_or_default(),
            fetched_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenWeatherMap {
    http: reqwest::Client,
    base_url: String,
    token: String,
    latitude: f64,
    longitude: f64,
}

impl OpenWeatherMap {
    pub fn new(cfg: &WeatherConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("irrigation-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            latitude: cfg.latitude,
            longitude: cfg.longitude,
        })
    }
}

impl WeatherSource for OpenWeatherMap {
    async fn current_weather(&self) -> Result<WeatherSnapshot> {
        let url = format!("{}/data/2.5/weather", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("lat", self.latitude.to_string()),
                ("lon", self.longitude.to_string()),
                ("appid", self.token.clone()),
            ])
            .send()
            .await
            .with_context(|| format!("weather request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("weather API returned {status}");
        }

        let doc: CurrentWeather = resp
            .json()
            .await
            .context("failed to decode weather response")?;
        let snapshot = doc.into_snapshot(OffsetDateTime::now_utc());
        debug!(
            temperature_k = snapshot.temperature_k,
            cloud_cover = snapshot.cloud_cover,
            wind_speed = snapshot.wind_speed,
            "weather fetched"
        );
        Ok(snapshot)
    }
}
