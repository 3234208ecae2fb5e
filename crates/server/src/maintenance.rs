//! Periodic housekeeping: quota period resets, usage retention and the
//! daily usage report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use noteflow_core::domain::usage::UsageSummary;
use noteflow_core::errors::ApplicationError;
use noteflow_db::{QuotaLedger, UsageRepository};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub quotas_reset: u64,
    pub usage_purged: u64,
    pub last_day: UsageSummary,
}

pub struct Maintenance {
    ledger: Arc<dyn QuotaLedger>,
    usage: Arc<dyn UsageRepository>,
    retention_days: u32,
}

impl Maintenance {
    pub fn new(
        ledger: Arc<dyn QuotaLedger>,
        usage: Arc<dyn UsageRepository>,
        retention_days: u32,
    ) -> Self {
        Self { ledger, usage, retention_days }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, ApplicationError> {
        let quotas_reset = self.ledger.reset_due(now).await?;

        let cutoff = now - chrono::Duration::days(i64::from(self.retention_days.max(1)));
        let usage_purged = self.usage.purge_before(cutoff).await?;

        let last_day = self.usage.summarize(now - chrono::Duration::days(1), now, None).await?;

        info!(
            event_name = "system.maintenance.completed",
            quotas_reset,
            usage_purged,
            total_requests = last_day.total_requests,
            successful_requests = last_day.successful_requests,
            total_tokens = last_day.total_tokens,
            total_cost = %last_day.total_cost,
            avg_latency_ms = last_day.avg_latency_ms,
            unique_users = last_day.unique_users,
            "maintenance sweep completed"
        );

        Ok(MaintenanceReport { quotas_reset, usage_purged, last_day })
    }

    /// Runs a sweep every `interval` until `shutdown` flips to true.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = self.run_once(Utc::now()).await {
                            warn!(
                                event_name = "system.maintenance.failed",
                                error = %error,
                                "maintenance sweep failed"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use noteflow_core::domain::job::JobId;
    use noteflow_core::domain::operation::OperationType;
    use noteflow_core::domain::provider::ModelId;
    use noteflow_core::domain::quota::UserId;
    use noteflow_core::domain::usage::{UsageOutcome, UsageRecord, UsageRecordId};
    use noteflow_core::quota::QuotaDefaults;
    use noteflow_db::{InMemoryQuotaLedger, InMemoryUsageRepository, QuotaLedger, UsageRepository};
    use rust_decimal::Decimal;

    use super::Maintenance;

    fn record(id: &str, user: &str, recorded_at: chrono::DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            id: UsageRecordId(id.to_string()),
            user_id: UserId(user.to_string()),
            model_id: ModelId("llama3.1".to_string()),
            operation: OperationType::Summarize,
            job_id: JobId(format!("job-{id}")),
            tokens_consumed: 40,
            tokens_charged: 40,
            cost: Decimal::new(2, 3),
            latency_ms: 120,
            outcome: UsageOutcome::Success,
            error_kind: None,
            recorded_at,
        }
    }

    #[tokio::test]
    async fn sweep_resets_quotas_purges_old_usage_and_reports_last_day() {
        let ledger = Arc::new(InMemoryQuotaLedger::default());
        let usage = Arc::new(InMemoryUsageRepository::default());
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().expect("time");

        let reservation = ledger
            .check_and_reserve(&UserId("u-1".to_string()), 50, QuotaDefaults::default(), start)
            .await
            .expect("reserve");
        ledger.commit(&reservation.id, 40, start).await.expect("commit");

        let now = start + Duration::days(40);
        usage.append(record("old", "u-1", now - Duration::days(120))).await.expect("append");
        usage.append(record("recent-1", "u-1", now - Duration::hours(2))).await.expect("append");
        usage.append(record("recent-2", "u-2", now - Duration::hours(1))).await.expect("append");

        let report = Maintenance::new(ledger.clone(), usage.clone(), 90)
            .run_once(now)
            .await
            .expect("sweep");

        assert_eq!(report.quotas_reset, 1);
        assert_eq!(report.usage_purged, 1);
        assert_eq!(report.last_day.total_requests, 2);
        assert_eq!(report.last_day.total_tokens, 80);
        assert_eq!(report.last_day.unique_users, 2);

        let quota = ledger
            .get_quota_state(&UserId("u-1".to_string()), QuotaDefaults::default(), now)
            .await
            .expect("quota");
        assert_eq!(quota.used_tokens, 0);
    }
}
