use chrono::{Duration, Utc};
use noteflow_core::domain::quota::UserId;
use noteflow_db::{SqlUsageRepository, UsageRepository};

use crate::commands::{open_store, run_with_config, storage_failure, CommandResult};

/// Aggregates the last `days` of usage, optionally for one user.
pub fn report(days: u32, user_id: Option<String>) -> CommandResult {
    if days == 0 {
        return CommandResult::failure(
            "usage-report",
            "invalid_argument",
            "--days must be at least 1",
            2,
        );
    }

    run_with_config("usage-report", |config| async move {
        let pool = open_store(&config).await?;
        let until = Utc::now();
        let since = until - Duration::days(i64::from(days));
        let user_id = user_id.map(UserId);
        let summary = SqlUsageRepository::new(pool.clone())
            .summarize(since, until, user_id.as_ref())
            .await
            .map_err(storage_failure)?;
        pool.close().await;

        let scope = user_id.map_or_else(|| "all users".to_string(), |user| user.0);
        Ok(CommandResult::success_with_data(
            "usage-report",
            format!(
                "{scope}, last {days} day(s): {} requests ({} succeeded), {} tokens, cost {}, avg latency {}ms, {} distinct users",
                summary.total_requests,
                summary.successful_requests,
                summary.total_tokens,
                summary.total_cost,
                summary.avg_latency_ms,
                summary.unique_users,
            ),
            summary,
        ))
    })
}

/// Deletes usage records older than the retention window.
pub fn cleanup(retention_days: Option<u32>) -> CommandResult {
    run_with_config("cleanup-usage", |config| async move {
        let retention_days = retention_days.unwrap_or(config.quota.usage_retention_days);
        if retention_days == 0 {
            return Err(("invalid_argument", "retention must be at least 1 day".to_string(), 2));
        }

        let pool = open_store(&config).await?;
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let purged = SqlUsageRepository::new(pool.clone())
            .purge_before(cutoff)
            .await
            .map_err(storage_failure)?;
        pool.close().await;

        Ok(CommandResult::success_with_data(
            "cleanup-usage",
            format!("purged {purged} usage record(s) older than {retention_days} day(s)"),
            serde_json::json!({ "purged": purged, "cutoff": cutoff.to_rfc3339() }),
        ))
    })
}
