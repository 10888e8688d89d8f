use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use dbi_core::domain::request::{
    LogLevel, Request, RequestId, RequestLog, RequestMeta, RequestResult, RequestStatus,
};

use super::{RepositoryError, RequestRepository};
use crate::DbPool;

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn create(&self, request: Request) -> Result<bool, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO request (
                id,
                kind,
                status,
                error_text,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(request.id.as_str())
        .bind(&request.kind)
        .bind(request.status.as_str())
        .bind(request.error_text.as_deref())
        .bind(request.created_at.to_rfc3339())
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                "INSERT INTO request_meta (request_id, progress, stats_json, updated_at)
                 VALUES (?, 0, 'null', ?)
                 ON CONFLICT(request_id) DO NOTHING",
            )
            .bind(request.id.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn find(&self, id: &RequestId) -> Result<Option<Request>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                kind,
                status,
                error_text,
                created_at
             FROM request
             WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(request_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: &RequestId,
        status: RequestStatus,
        error_text: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let updated = sqlx::query(
            "UPDATE request
             SET status = ?, error_text = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_text)
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("request `{id}`")));
        }
        Ok(())
    }

    async fn find_meta(&self, id: &RequestId) -> Result<Option<RequestMeta>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                request_id,
                progress,
                stats_json
             FROM request_meta
             WHERE request_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(meta_from_row).transpose()
    }

    async fn upsert_meta(&self, meta: RequestMeta) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO request_meta (
                request_id,
                progress,
                stats_json,
                updated_at
             ) VALUES (?, ?, ?, ?)
             ON CONFLICT(request_id) DO UPDATE SET
                progress = MAX(request_meta.progress, excluded.progress),
                stats_json = excluded.stats_json,
                updated_at = excluded.updated_at",
        )
        .bind(meta.request_id.as_str())
        .bind(meta.progress)
        .bind(encode_json("stats_json", &meta.stats)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_log(&self, log: RequestLog) -> Result<(), RepositoryError> {
        let data_json = log.data.as_ref().map(|data| encode_json("data_json", data)).transpose()?;

        sqlx::query(
            "INSERT INTO request_log (
                request_id,
                level,
                message,
                data_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(log.request_id.as_str())
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(data_json)
        .bind(log.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(&self, id: &RequestId) -> Result<Vec<RequestLog>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                request_id,
                level,
                message,
                data_json,
                created_at
             FROM request_log
             WHERE request_id = ?
             ORDER BY id ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_from_row).collect()
    }

    async fn append_result(&self, result: RequestResult) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO request_result (
                request_id,
                entity,
                source,
                canonical_key,
                row_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(result.request_id.as_str())
        .bind(&result.entity)
        .bind(result.source.as_deref())
        .bind(result.canonical_key.as_deref())
        .bind(encode_json("row_json", &result.row)?)
        .bind(result.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_results(&self, id: &RequestId) -> Result<Vec<RequestResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                request_id,
                entity,
                source,
                canonical_key,
                row_json,
                created_at
             FROM request_result
             WHERE request_id = ?
             ORDER BY id ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(result_from_row).collect()
    }

    async fn count_results(&self, id: &RequestId) -> Result<u64, RepositoryError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM request_result WHERE request_id = ?")
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?
                .try_get("count")?;

        u64::try_from(count)
            .map_err(|_| RepositoryError::Decode(format!("negative result count: {count}")))
    }
}

fn request_from_row(row: SqliteRow) -> Result<Request, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status_raw}`")))?;

    Ok(Request {
        id: RequestId(row.try_get("id")?),
        kind: row.try_get("kind")?,
        status,
        error_text: row.try_get("error_text")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn meta_from_row(row: SqliteRow) -> Result<RequestMeta, RepositoryError> {
    Ok(RequestMeta {
        request_id: RequestId(row.try_get("request_id")?),
        progress: row.try_get("progress")?,
        stats: decode_json("stats_json", &row.try_get::<String, _>("stats_json")?)?,
    })
}

fn log_from_row(row: SqliteRow) -> Result<RequestLog, RepositoryError> {
    let level_raw = row.try_get::<String, _>("level")?;
    let level = LogLevel::parse(&level_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown log level `{level_raw}`")))?;

    Ok(RequestLog {
        request_id: RequestId(row.try_get("request_id")?),
        level,
        message: row.try_get("message")?,
        data: row
            .try_get::<Option<String>, _>("data_json")?
            .map(|raw| decode_json("data_json", &raw))
            .transpose()?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn result_from_row(row: SqliteRow) -> Result<RequestResult, RepositoryError> {
    Ok(RequestResult {
        request_id: RequestId(row.try_get("request_id")?),
        entity: row.try_get("entity")?,
        source: row.try_get("source")?,
        canonical_key: row.try_get("canonical_key")?,
        row: decode_json("row_json", &row.try_get::<String, _>("row_json")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

pub(crate) fn encode_json(column: &str, value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode `{column}`: {error}")))
}

pub(crate) fn decode_json(column: &str, raw: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
