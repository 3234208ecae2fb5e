use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub user_id: UserId,
    pub max_requests: u32,
    pub max_tokens: u32,
    pub used_requests: u32,
    pub used_tokens: u32,
    pub reserved_requests: u32,
    pub reserved_tokens: u32,
    pub reset_at: DateTime<Utc>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl QuotaState {
    pub fn requests_remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.used_requests.saturating_add(self.reserved_requests))
    }

    pub fn tokens_remaining(&self) -> u32 {
        self.max_tokens.saturating_sub(self.used_tokens.saturating_add(self.reserved_tokens))
    }
}

/// Provisional hold of one request and `estimated_tokens` against a user's quota.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub estimated_tokens: u32,
    pub created_at: DateTime<Utc>,
}
