#![cfg(feature = "db")]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{AlertRecord, ModelAccuracy, Store};
use crate::domain::{
    ActuatorState, CorrectedForecast, EnergyDelta, Forecast, GreenhouseState, Override,
    PowerReading, Setpoints,
};
use crate::simulation::Trajectory;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS startups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        version TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS heartbeat (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_beat TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sensor_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        indoor_temp_f REAL,
        indoor_humidity REAL,
        outdoor_temp_f REAL,
        outdoor_humidity REAL,
        solar_irradiance_wm2 REAL,
        wind_speed_mph REAL,
        shades_east TEXT NOT NULL,
        shades_west TEXT NOT NULL,
        fan_on INTEGER NOT NULL,
        circ_fans_on INTEGER NOT NULL,
        hvac_mode TEXT NOT NULL,
        hvac_setpoint_f REAL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS forecasts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fetched_at TEXT NOT NULL,
        raw TEXT NOT NULL,
        corrected TEXT NOT NULL,
        deltas TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trajectories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        label TEXT NOT NULL,
        step_seconds INTEGER NOT NULL,
        points TEXT NOT NULL,
        params TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS power (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        phase_a_kw REAL,
        phase_b_kw REAL,
        total_kw REAL NOT NULL,
        phase_a_total_kwh REAL,
        phase_b_total_kwh REAL,
        phase_a_delta_kwh REAL,
        phase_b_delta_kwh REAL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS model_accuracy (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        predicted_temp_f REAL NOT NULL,
        actual_temp_f REAL NOT NULL,
        error_f REAL NOT NULL,
        horizon_minutes INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        device TEXT NOT NULL,
        consecutive_failures INTEGER NOT NULL,
        hours_since_success REAL,
        message TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS overrides (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        actuator TEXT NOT NULL,
        command TEXT NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        cancelled_at TEXT,
        source TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS setpoints (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        heat_f REAL NOT NULL,
        cool_f REAL NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and its tables.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open {path}"))?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database, one connection so every query sees it.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("schema creation failed")?;
        }
        Ok(Self { pool })
    }
}

fn parse_enum<T: std::str::FromStr>(column: &str, value: String) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("bad {column} value {value:?}"))
}

#[async_trait]
impl Store for SqliteStore {
    async fn record_startup(&self, at: DateTime<Utc>, version: &str) -> Result<()> {
        sqlx::query("INSERT INTO startups (started_at, version) VALUES (?, ?)")
            .bind(at)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_heartbeat(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO heartbeat (id, last_beat) VALUES (1, ?) \
             ON CONFLICT(id) DO UPDATE SET last_beat = excluded.last_beat",
        )
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_sensor_state(&self, s: &GreenhouseState) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sensor_state (
                timestamp, indoor_temp_f, indoor_humidity, outdoor_temp_f, outdoor_humidity,
                solar_irradiance_wm2, wind_speed_mph, shades_east, shades_west,
                fan_on, circ_fans_on, hvac_mode, hvac_setpoint_f
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(s.timestamp)
        .bind(s.indoor_temp_f)
        .bind(s.indoor_humidity)
        .bind(s.outdoor_temp_f)
        .bind(s.outdoor_humidity)
        .bind(s.solar_irradiance_wm2)
        .bind(s.wind_speed_mph)
        .bind(s.shades_east.to_string())
        .bind(s.shades_west.to_string())
        .bind(s.fan_on)
        .bind(s.circ_fans_on)
        .bind(s.hvac_mode.to_string())
        .bind(s.hvac_setpoint_f)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_forecast(
        &self,
        fetched_at: DateTime<Utc>,
        raw: &Forecast,
        corrected: &CorrectedForecast,
    ) -> Result<()> {
        sqlx::query("INSERT INTO forecasts (fetched_at, raw, corrected, deltas) VALUES (?, ?, ?, ?)")
            .bind(fetched_at)
            .bind(serde_json::to_string(raw)?)
            .bind(serde_json::to_string(&corrected.forecast)?)
            .bind(serde_json::to_string(&corrected.deltas)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_trajectory(
        &self,
        created_at: DateTime<Utc>,
        label: &str,
        trajectory: &Trajectory,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO trajectories (created_at, label, step_seconds, points, params) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(created_at)
        .bind(label)
        .bind(trajectory.step_seconds as i64)
        .bind(serde_json::to_string(&trajectory.points)?)
        .bind(serde_json::to_string(&trajectory.params)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_power(
        &self,
        at: DateTime<Utc>,
        reading: &PowerReading,
        delta: &EnergyDelta,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO power (
                timestamp, phase_a_kw, phase_b_kw, total_kw,
                phase_a_total_kwh, phase_b_total_kwh, phase_a_delta_kwh, phase_b_delta_kwh
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(at)
        .bind(reading.phase_a.power_kw)
        .bind(reading.phase_b.power_kw)
        .bind(reading.total_power_kw)
        .bind(reading.phase_a.total_kwh)
        .bind(reading.phase_b.total_kwh)
        .bind(delta.phase_a_kwh)
        .bind(delta.phase_b_kwh)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_model_accuracy(&self, r: &ModelAccuracy) -> Result<()> {
        sqlx::query(
            "INSERT INTO model_accuracy (timestamp, predicted_temp_f, actual_temp_f, error_f, horizon_minutes) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(r.timestamp)
        .bind(r.predicted_temp_f)
        .bind(r.actual_temp_f)
        .bind(r.error_f)
        .bind(r.horizon_minutes as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_alert(&self, a: &AlertRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (timestamp, device, consecutive_failures, hours_since_success, message) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(a.timestamp)
        .bind(&a.device)
        .bind(a.consecutive_failures as i64)
        .bind(a.hours_since_success)
        .bind(&a.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_actuator_state(&self) -> Result<Option<ActuatorState>> {
        let row = sqlx::query(
            "SELECT shades_east, shades_west, fan_on, hvac_mode FROM sensor_state \
             ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ActuatorState> {
            Ok(ActuatorState {
                shades_east: parse_enum("shades_east", row.try_get("shades_east")?)?,
                shades_west: parse_enum("shades_west", row.try_get("shades_west")?)?,
                fan_on: row.try_get("fan_on")?,
                hvac_mode: parse_enum("hvac_mode", row.try_get("hvac_mode")?)?,
            })
        })
        .transpose()
    }

    async fn active_overrides(&self, now: DateTime<Utc>) -> Result<Vec<Override>> {
        let rows = sqlx::query(
            "SELECT actuator, command, created_at, expires_at, cancelled_at, source \
             FROM overrides WHERE cancelled_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut active = Vec::new();
        for row in rows {
            let command: String = row.try_get("command")?;
            let entry = Override {
                actuator: row.try_get("actuator")?,
                command: serde_json::from_str(&command).context("override command is not JSON")?,
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
                cancelled_at: row.try_get("cancelled_at")?,
                source: row.try_get("source")?,
            };
            if entry.is_active(now) {
                active.push(entry);
            }
        }
        Ok(active)
    }

    async fn setpoints(&self) -> Result<Option<Setpoints>> {
        let row = sqlx::query("SELECT heat_f, cool_f FROM setpoints WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Setpoints> {
            Ok(Setpoints {
                heat_f: row.try_get("heat_f")?,
                cool_f: row.try_get("cool_f")?,
            })
        })
        .transpose()
    }

    async fn insert_override(&self, o: &Override) -> Result<()> {
        sqlx::query(
            "INSERT INTO overrides (actuator, command, created_at, expires_at, cancelled_at, source) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&o.actuator)
        .bind(o.command.to_string())
        .bind(o.created_at)
        .bind(o.expires_at)
        .bind(o.cancelled_at)
        .bind(&o.source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_setpoints(&self, sp: Setpoints, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO setpoints (id, heat_f, cool_f, updated_at) VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET heat_f = excluded.heat_f, cool_f = excluded.cool_f, \
             updated_at = excluded.updated_at",
        )
        .bind(sp.heat_f)
        .bind(sp.cool_f)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
