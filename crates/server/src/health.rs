use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use demandplan_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    workers: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub queue: HealthCheck,
    pub scheduler: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, workers: usize) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, workers })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let queue = queue_check(&state.db_pool).await;
    let ready = database.status == "ready" && queue.status == "ready";

    let scheduler = if state.workers == 0 {
        HealthCheck { status: "disabled", detail: "no job workers configured".to_string() }
    } else {
        HealthCheck { status: "ready", detail: format!("{} job workers polling", state.workers) }
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        queue,
        scheduler,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn queue_check(pool: &DbPool) -> HealthCheck {
    let backlog = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schedule_job WHERE status = 'unprocessed'",
    )
    .fetch_one(pool)
    .await;
    match backlog {
        Ok(count) => HealthCheck { status: "ready", detail: format!("{count} jobs waiting") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("job queue query failed: {error}") }
        }
    }
}
