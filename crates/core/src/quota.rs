//! Quota Ledger arithmetic.
//!
//! Storage backends own atomicity; the rules for admission, settlement and
//! monthly reset live here so the SQL and in-memory ledgers agree.

use chrono::{DateTime, Months, Utc};

use crate::domain::quota::{QuotaState, UserId};
use crate::errors::DispatchError;

/// Limits applied to users that have no quota row yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaDefaults {
    pub max_requests: u32,
    pub max_tokens: u32,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self { max_requests: 100, max_tokens: 10_000 }
    }
}

pub fn new_quota_state(user_id: UserId, defaults: QuotaDefaults, now: DateTime<Utc>) -> QuotaState {
    QuotaState {
        user_id,
        max_requests: defaults.max_requests,
        max_tokens: defaults.max_tokens,
        used_requests: 0,
        used_tokens: 0,
        reserved_requests: 0,
        reserved_tokens: 0,
        reset_at: next_reset_after(now, now),
        active: true,
        updated_at: now,
    }
}

/// First whole-month step from `anchor` that lies strictly after `now`.
pub fn next_reset_after(anchor: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut months = 1u32;
    loop {
        match anchor.checked_add_months(Months::new(months)) {
            Some(candidate) if candidate > now => return candidate,
            Some(_) => months += 1,
            None => return now,
        }
    }
}

/// Zeroes used counters when the period has elapsed. Reservations survive.
pub fn reset_if_due(state: &mut QuotaState, now: DateTime<Utc>) -> bool {
    if now < state.reset_at {
        return false;
    }
    state.used_requests = 0;
    state.used_tokens = 0;
    state.reset_at = next_reset_after(state.reset_at, now);
    state.updated_at = now;
    true
}

pub fn admits(state: &QuotaState, estimated_tokens: u32) -> bool {
    let requests = u64::from(state.used_requests) + u64::from(state.reserved_requests) + 1;
    let tokens = u64::from(state.used_tokens)
        + u64::from(state.reserved_tokens)
        + u64::from(estimated_tokens);
    state.active && requests <= u64::from(state.max_requests) && tokens <= u64::from(state.max_tokens)
}

pub fn reserve(
    state: &mut QuotaState,
    estimated_tokens: u32,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    if !admits(state, estimated_tokens) {
        return Err(quota_exceeded(state, estimated_tokens));
    }
    state.reserved_requests += 1;
    state.reserved_tokens += estimated_tokens;
    state.updated_at = now;
    Ok(())
}

pub fn quota_exceeded(state: &QuotaState, estimated_tokens: u32) -> DispatchError {
    DispatchError::QuotaExceeded {
        user_id: state.user_id.0.clone(),
        requests_remaining: if state.active { state.requests_remaining() } else { 0 },
        tokens_remaining: if state.active { state.tokens_remaining() } else { 0 },
        estimated_tokens,
    }
}

/// Tokens committed for a reservation: never more than was reserved.
pub fn charged_tokens(estimated_tokens: u32, actual_tokens: u32) -> u32 {
    estimated_tokens.min(actual_tokens)
}

/// Moves a reservation into used counters and returns the tokens charged.
pub fn commit(
    state: &mut QuotaState,
    estimated_tokens: u32,
    actual_tokens: u32,
    now: DateTime<Utc>,
) -> u32 {
    let charged = charged_tokens(estimated_tokens, actual_tokens);
    state.reserved_requests = state.reserved_requests.saturating_sub(1);
    state.reserved_tokens = state.reserved_tokens.saturating_sub(estimated_tokens);
    state.used_requests = state.used_requests.saturating_add(1);
    state.used_tokens = state.used_tokens.saturating_add(charged);
    state.updated_at = now;
    charged
}

pub fn release(state: &mut QuotaState, estimated_tokens: u32, now: DateTime<Utc>) {
    state.reserved_requests = state.reserved_requests.saturating_sub(1);
    state.reserved_tokens = state.reserved_tokens.saturating_sub(estimated_tokens);
    state.updated_at = now;
}

/// Word-count based token estimate for a rendered request.
pub fn estimate_tokens(text: &str, factor: f64, completion_budget: u32) -> u32 {
    let words = text.split_whitespace().count() as f64;
    let prompt_tokens = (words * factor).ceil();
    let prompt_tokens = if prompt_tokens >= f64::from(u32::MAX) { u32::MAX } else { prompt_tokens as u32 };
    prompt_tokens.saturating_add(completion_budget)
}
