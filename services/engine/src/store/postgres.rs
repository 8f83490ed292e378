//! Postgres-backed `MetadataStore`.
//!
//! Uses runtime-checked `sqlx::query`/`query_as` (not the `query!` macros)
//! so the crate doesn't need an offline query cache checked into the
//! repo — rows are built by hand and mapped with `sqlx::Row::try_get`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_proto::{
    Connection, Dataset, DatasetFormat, Device, DeviceDatasetLink, DeviceStatus, DeviceType, Direction,
    LogStatus, Protocol, TransmissionConfig, TransmissionLogRecord,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{DeviceProgressUpdate, MetadataStore, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn device_from_row(row: &sqlx::postgres::PgRow) -> Result<Device, StoreError> {
    let device_type_raw: String = row.try_get("device_type")?;
    let device_type = DeviceType::parse(&device_type_raw)
        .ok_or_else(|| StoreError::Database(format!("unknown device_type '{device_type_raw}'")))?;
    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.as_str() {
        "idle" => DeviceStatus::Idle,
        "transmitting" => DeviceStatus::Transmitting,
        "paused" => DeviceStatus::Paused,
        _ => DeviceStatus::Error,
    };
    let config_json: serde_json::Value = row.try_get("transmission_config")?;
    let transmission_config: TransmissionConfig =
        serde_json::from_value(config_json).unwrap_or_default();
    let current_row_index: i64 = row.try_get("current_row_index")?;
    let frequency: i32 = row.try_get("transmission_frequency")?;

    Ok(Device {
        id: row.try_get("id")?,
        device_ref: row.try_get("device_ref")?,
        device_type,
        connection_id: row.try_get("connection_id")?,
        project_id: row.try_get("project_id")?,
        transmission_enabled: row.try_get("transmission_enabled")?,
        transmission_frequency_seconds: frequency.max(0) as u32,
        transmission_config,
        current_row_index: current_row_index.max(0) as u64,
        status,
        last_transmission_at: row.try_get("last_transmission_at")?,
        is_active: row.try_get("is_active")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn fetch_active_devices(&self, limit: u64) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, device_ref, device_type, connection_id, project_id, \
             transmission_enabled, transmission_frequency, transmission_config, \
             current_row_index, status, last_transmission_at, is_active, is_deleted \
             FROM devices \
             WHERE is_deleted = false AND is_active = true AND transmission_enabled = true \
               AND connection_id IS NOT NULL \
             ORDER BY id \
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(device_from_row).collect()
    }

    async fn fetch_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query(
            "SELECT id, device_ref, device_type, connection_id, project_id, \
             transmission_enabled, transmission_frequency, transmission_config, \
             current_row_index, status, last_transmission_at, is_active, is_deleted \
             FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(device_from_row).transpose()
    }

    async fn fetch_connection(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        let row = sqlx::query(
            "SELECT id, protocol, config, is_deleted FROM connections WHERE id = $1 AND is_deleted = false",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let protocol_raw: String = row.try_get("protocol")?;
        let protocol = Protocol::parse(&protocol_raw)
            .ok_or_else(|| StoreError::Database(format!("unknown protocol '{protocol_raw}'")))?;
        Ok(Some(Connection {
            id: row.try_get("id")?,
            protocol,
            config: row.try_get("config")?,
            is_deleted: row.try_get("is_deleted")?,
        }))
    }

    async fn fetch_dataset_links(&self, device_id: &str) -> Result<Vec<DeviceDatasetLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT device_id, dataset_id, config, linked_at FROM device_datasets \
             WHERE device_id = $1 ORDER BY linked_at ASC, dataset_id ASC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeviceDatasetLink {
                    device_id: row.try_get("device_id")?,
                    dataset_id: row.try_get("dataset_id")?,
                    config: row.try_get("config")?,
                    linked_at: row.try_get::<DateTime<Utc>, _>("linked_at")?,
                })
            })
            .collect()
    }

    async fn fetch_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>, StoreError> {
        let row = sqlx::query(
            "SELECT id, file_path, file_format, row_count, status FROM datasets \
             WHERE id = $1 AND is_deleted = false",
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let format_raw: String = row.try_get("file_format")?;
        let file_format = DatasetFormat::parse(&format_raw)
            .ok_or_else(|| StoreError::Database(format!("unknown file_format '{format_raw}'")))?;
        let row_count: i64 = row.try_get("row_count")?;
        Ok(Some(Dataset {
            id: row.try_get("id")?,
            file_path: row.try_get("file_path")?,
            file_format,
            row_count: row_count.max(0) as u64,
            status: row.try_get("status")?,
        }))
    }

    async fn commit_dispatch(
        &self,
        update: DeviceProgressUpdate,
        logs: &[TransmissionLogRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if update.current_row_index.is_some()
            || update.status.is_some()
            || update.last_transmission_at.is_some()
            || update.transmission_enabled.is_some()
        {
            sqlx::query(
                "UPDATE devices SET \
                   current_row_index = COALESCE($2, current_row_index), \
                   status = COALESCE($3, status), \
                   last_transmission_at = COALESCE($4, last_transmission_at), \
                   transmission_enabled = COALESCE($5, transmission_enabled) \
                 WHERE id = $1",
            )
            .bind(&update.device_id)
            .bind(update.current_row_index.map(|v| v as i64))
            .bind(update.status.map(|s| s.as_str().to_owned()))
            .bind(update.last_transmission_at)
            .bind(update.transmission_enabled)
            .execute(&mut *tx)
            .await?;
        }

        for log in logs {
            let direction = match log.direction {
                Direction::Sent => "sent",
                Direction::Failed => "failed",
            };
            let status = match log.status {
                LogStatus::Success => "success",
                LogStatus::Failed => "failed",
            };
            sqlx::query(
                "INSERT INTO transmission_logs \
                 (timestamp, project_id, device_id, connection_id, message_type, direction, \
                  payload_size, message_content, protocol, topic, status, latency_ms, \
                  retry_count, is_simulated, metadata) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
            )
            .bind(log.timestamp)
            .bind(&log.project_id)
            .bind(&log.device_id)
            .bind(&log.connection_id)
            .bind(&log.message_type)
            .bind(direction)
            .bind(log.payload_size as i64)
            .bind(&log.message_content)
            .bind(log.protocol.as_str())
            .bind(&log.topic)
            .bind(status)
            .bind(log.latency_ms as i64)
            .bind(log.retry_count as i32)
            .bind(log.is_simulated)
            .bind(serde_json::to_value(&log.metadata).unwrap_or(serde_json::Value::Null))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pause_device(&self, device_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE devices SET transmission_enabled = false, status = 'idle' WHERE id = $1",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stop_device(&self, device_id: &str, reset_row_index: bool) -> Result<(), StoreError> {
        if reset_row_index {
            sqlx::query("UPDATE devices SET status = 'idle', current_row_index = 0 WHERE id = $1")
                .bind(device_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE devices SET status = 'idle' WHERE id = $1")
                .bind(device_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}
