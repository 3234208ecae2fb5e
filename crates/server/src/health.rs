use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use noteflow_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub database: ComponentHealth,
    pub job_store: ComponentHealth,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

/// Ready only when the pool answers and the job table is queryable.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let database = ping(&state.db_pool).await;
    let job_store = if database.status == "ready" {
        jobs_in_flight(&state.db_pool).await
    } else {
        ComponentHealth { status: "degraded", detail: "skipped: database unreachable".to_string() }
    };
    let ready = database.status == "ready" && job_store.status == "ready";

    let report = HealthReport {
        status: if ready { "ready" } else { "degraded" },
        database,
        job_store,
        checked_at: Utc::now().to_rfc3339(),
    };
    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(report))
}

async fn ping(pool: &DbPool) -> ComponentHealth {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => ComponentHealth { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => ComponentHealth {
            status: "degraded",
            detail: format!("database query failed: {error}"),
        },
    }
}

async fn jobs_in_flight(pool: &DbPool) -> ComponentHealth {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM ai_operation_job WHERE status IN ('queued', 'running')",
    )
    .fetch_one(pool)
    .await;
    match count {
        Ok(count) => ComponentHealth { status: "ready", detail: format!("{count} jobs in flight") },
        Err(error) => ComponentHealth {
            status: "degraded",
            detail: format!("job table unavailable: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use noteflow_db::{connect_with_settings, migrations};

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn ready_when_schema_is_migrated() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");

        let (status, Json(report)) = health(State(HealthState { db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.status, "ready");
        assert_eq!(report.job_store.detail, "0 jobs in flight");

        pool.close().await;
    }

    #[tokio::test]
    async fn degraded_without_job_table() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");

        let (status, Json(report)) = health(State(HealthState { db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.database.status, "ready");
        assert_eq!(report.job_store.status, "degraded");

        pool.close().await;
    }

    #[tokio::test]
    async fn degraded_when_pool_is_closed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        pool.close().await;

        let (status, Json(report)) = health(State(HealthState { db_pool: pool })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.database.status, "degraded");
    }
}
