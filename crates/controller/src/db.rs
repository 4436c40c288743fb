use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::future::Future;
use std::str::FromStr;

use crate::config::{SoilType, ZoneId};
use crate::metrics::ZoneAverages;
use crate::weather::WeatherSnapshot;

/// Labels stored alongside every zone sample.
#[derive(Debug, Clone)]
pub struct Tags {
    pub system_name: String,
    pub zone_id: ZoneId,
    pub soil_type: SoilType,
}

/// Destination for aggregated samples. Write failures are reported to the
/// caller, which logs them and carries on.
pub trait MetricsSink: Send + Sync {
    fn write_zone_metrics(
        &self,
        zone_name: &str,
        averages: &ZoneAverages,
        tags: &Tags,
    ) -> impl Future<Output = Result<()>> + Send;

    fn write_weather_metrics(&self, snapshot: &WeatherSnapshot) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ZoneMetricsRow {
    pub ts: i64,
    pub system_name: String,
    pub zone_id: i64,
    pub zone_name: String,
    pub soil_type: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub flow_rate: Option<f64>,
    pub water_on: Option<f64>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Read-back
    // ----------------------------

    pub async fn latest_zone_metrics(&self, zone_name: &str) -> Result<Option<ZoneMetricsRow>> {
        sqlx::query_as::<_, ZoneMetricsRow>(
            r#"
            SELECT ts, system_name, zone_id, zone_name, soil_type,
                   temperature, humidity, soil_moisture, flow_rate, water_on
            FROM zone_metrics
            WHERE zone_name = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(zone_name)
        .fetch_optional(&self.pool)
        .await
        .context("latest_zone_metrics failed")
    }

    pub async fn count_weather_metrics(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM weather_metrics")
            .fetch_one(&self.pool)
            .await
            .context("count_weather_metrics failed")
    }
}

impl MetricsSink for Db {
    async fn write_zone_metrics(&self, zone_name: &str, averages: &ZoneAverages, tags: &Tags) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zone_metrics (
              ts, system_name, zone_id, zone_name, soil_type,
              temperature, humidity, soil_moisture, flow_rate, water_on
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(averages.updated_at.unix_timestamp())
        .bind(&tags.system_name)
        .bind(i64::from(tags.zone_id))
        .bind(zone_name)
        .bind(tags.soil_type.as_str())
        .bind(averages.temperature)
        .bind(averages.humidity)
        .bind(averages.soil_moisture)
        .bind(averages.flow_rate)
        .bind(averages.water_on)
        .execute(&self.pool)
        .await
        .with_context(|| format!("write_zone_metrics failed zone={zone_name}"))?;
        Ok(())
    }

    async fn write_weather_metrics(&self, w: &WeatherSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO weather_metrics (ts, temperature_k, humidity, cloud_cover, wind_speed, description)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(w.fetched_at.unix_timestamp())
        .bind(w.temperature_k)
        .bind(w.humidity)
        .bind(w.cloud_cover)
        .bind(w.wind_speed)
        .bind(&w.description)
        .execute(&self.pool)
        .await
        .context("write_weather_metrics failed")?;
        Ok(())
    }
}
