use chrono::Utc;
use noteflow_core::domain::quota::{QuotaState, UserId};
use noteflow_db::{QuotaLedger, SqlQuotaLedger};
use serde::Serialize;

use crate::commands::{open_store, run_with_config, storage_failure, CommandResult};

#[derive(Debug, Serialize)]
struct QuotaView {
    user_id: String,
    max_requests: u32,
    max_tokens: u32,
    used_requests: u32,
    used_tokens: u32,
    reserved_requests: u32,
    reserved_tokens: u32,
    requests_remaining: u32,
    tokens_remaining: u32,
    reset_at: String,
}

impl From<&QuotaState> for QuotaView {
    fn from(state: &QuotaState) -> Self {
        Self {
            user_id: state.user_id.0.clone(),
            max_requests: state.max_requests,
            max_tokens: state.max_tokens,
            used_requests: state.used_requests,
            used_tokens: state.used_tokens,
            reserved_requests: state.reserved_requests,
            reserved_tokens: state.reserved_tokens,
            requests_remaining: state.requests_remaining(),
            tokens_remaining: state.tokens_remaining(),
            reset_at: state.reset_at.to_rfc3339(),
        }
    }
}

pub fn show(user_id: &str) -> CommandResult {
    let user_id = UserId(user_id.trim().to_string());
    if user_id.0.is_empty() {
        return CommandResult::failure("quota show", "invalid_argument", "user id is required", 2);
    }

    run_with_config("quota show", |config| async move {
        let pool = open_store(&config).await?;
        let ledger = SqlQuotaLedger::new(pool.clone());
        let state = ledger
            .get_quota_state(&user_id, config.quota.defaults(), Utc::now())
            .await
            .map_err(storage_failure)?;
        pool.close().await;

        Ok(CommandResult::success_with_data(
            "quota show",
            summary_line(&state),
            QuotaView::from(&state),
        ))
    })
}

pub fn set_limits(user_id: &str, max_requests: u32, max_tokens: u32) -> CommandResult {
    let user_id = UserId(user_id.trim().to_string());
    if user_id.0.is_empty() {
        return CommandResult::failure(
            "quota set-limits",
            "invalid_argument",
            "user id is required",
            2,
        );
    }

    run_with_config("quota set-limits", |config| async move {
        let pool = open_store(&config).await?;
        let ledger = SqlQuotaLedger::new(pool.clone());
        let state = ledger
            .set_limits(&user_id, max_requests, max_tokens, config.quota.defaults(), Utc::now())
            .await
            .map_err(storage_failure)?;
        pool.close().await;

        Ok(CommandResult::success_with_data(
            "quota set-limits",
            format!("limits updated: {}", summary_line(&state)),
            QuotaView::from(&state),
        ))
    })
}

pub fn reset_due() -> CommandResult {
    run_with_config("quota reset-due", |config| async move {
        let pool = open_store(&config).await?;
        let reset = SqlQuotaLedger::new(pool.clone())
            .reset_due(Utc::now())
            .await
            .map_err(storage_failure)?;
        pool.close().await;

        Ok(CommandResult::success_with_data(
            "quota reset-due",
            format!("reset {reset} quota period(s)"),
            serde_json::json!({ "reset": reset }),
        ))
    })
}

fn summary_line(state: &QuotaState) -> String {
    format!(
        "{}: {}/{} requests, {}/{} tokens used ({} requests reserved), resets {}",
        state.user_id.0,
        state.used_requests,
        state.max_requests,
        state.used_tokens,
        state.max_tokens,
        state.reserved_requests,
        state.reset_at.to_rfc3339(),
    )
}
