use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use super::request::{decode_json, encode_json};
use super::{ActorStateRepository, RepositoryError};
use crate::DbPool;

pub struct SqlActorStateRepository {
    pool: DbPool,
}

impl SqlActorStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ActorStateRepository for SqlActorStateRepository {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query(
            "SELECT state_json
             FROM actor_state
             WHERE namespace = ? AND actor_key = ?",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_json("state_json", &row.try_get::<String, _>("state_json")?))
            .transpose()
    }

    async fn save(&self, namespace: &str, key: &str, state: Value) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO actor_state (
                namespace,
                actor_key,
                state_json,
                updated_at
             ) VALUES (?, ?, ?, ?)
             ON CONFLICT(namespace, actor_key) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(encode_json("state_json", &state)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
