use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use dbi_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Probe {
    pub ready: bool,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub status: &'static str,
    pub database: Probe,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

/// Ready only while the database answers a trivial query.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<Readiness>) {
    let database = probe_database(&state.db_pool).await;
    let (status_code, status) =
        if database.ready { (StatusCode::OK, "ready") } else { (StatusCode::SERVICE_UNAVAILABLE, "degraded") };

    (status_code, Json(Readiness { status, database, checked_at: Utc::now().to_rfc3339() }))
}

async fn probe_database(pool: &DbPool) -> Probe {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM request").fetch_one(pool).await {
        Ok(requests) => Probe { ready: true, detail: format!("{requests} requests recorded") },
        Err(error) => Probe { ready: false, detail: format!("database query failed: {error}") },
    }
}
