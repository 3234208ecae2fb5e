use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use noteflow_core::domain::quota::{QuotaReservation, QuotaState, ReservationId, UserId};
use noteflow_core::errors::DispatchError;
use noteflow_core::quota::{self as rules, QuotaDefaults};

use super::{
    encode_timestamp, parse_timestamp, parse_u32, LedgerError, QuotaLedger, RepositoryError,
};
use crate::DbPool;

const QUOTA_COLUMNS: &str = "user_id, max_requests, max_tokens, used_requests, used_tokens,
    reserved_requests, reserved_tokens, reset_at, active, updated_at";

pub struct SqlQuotaLedger {
    pool: DbPool,
}

impl SqlQuotaLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_state(&self, user_id: &UserId) -> Result<Option<QuotaState>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {QUOTA_COLUMNS} FROM quota_state WHERE user_id = ?"))
            .bind(&user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(quota_from_row).transpose()?)
    }

    /// Loads the row, creating it from defaults and applying a due reset.
    async fn current_state(
        &self,
        user_id: &UserId,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError> {
        let fresh = rules::new_quota_state(user_id.clone(), defaults, now);
        sqlx::query(
            "INSERT INTO quota_state (
                user_id, max_requests, max_tokens, used_requests, used_tokens,
                reserved_requests, reserved_tokens, reset_at, active, updated_at
             ) VALUES (?, ?, ?, 0, 0, 0, 0, ?, 1, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(&fresh.user_id.0)
        .bind(i64::from(fresh.max_requests))
        .bind(i64::from(fresh.max_tokens))
        .bind(encode_timestamp(fresh.reset_at))
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?;

        let mut state = self.find_state(user_id).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("quota row for `{}` vanished after insert", user_id.0))
        })?;

        let due = state.reset_at <= now;
        self.apply_reset(&state, now).await?;
        if due {
            state = self.find_state(user_id).await?.ok_or_else(|| {
                RepositoryError::Decode(format!("quota row for `{}` vanished after reset", user_id.0))
            })?;
        }
        Ok(state)
    }

    /// Compare-and-set on `reset_at` so concurrent resets apply once.
    async fn apply_reset(&self, state: &QuotaState, now: DateTime<Utc>) -> Result<bool, LedgerError> {
        let mut next = state.clone();
        if !rules::reset_if_due(&mut next, now) {
            return Ok(false);
        }

        let updated = sqlx::query(
            "UPDATE quota_state
             SET used_requests = 0, used_tokens = 0, reset_at = ?, updated_at = ?
             WHERE user_id = ? AND reset_at = ?",
        )
        .bind(encode_timestamp(next.reset_at))
        .bind(encode_timestamp(now))
        .bind(&state.user_id.0)
        .bind(encode_timestamp(state.reset_at))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn settle(
        &self,
        reservation_id: &ReservationId,
        actual_tokens: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<u32, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "DELETE FROM quota_reservation WHERE id = ? RETURNING user_id, estimated_tokens",
        )
        .bind(&reservation_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DispatchError::ReservationNotFound(reservation_id.0.clone()))?;

        let user_id: String = row.try_get("user_id")?;
        let estimated = parse_u32("estimated_tokens", row.try_get("estimated_tokens")?)?;

        let charged = match actual_tokens {
            Some(actual) => {
                let charged = rules::charged_tokens(estimated, actual);
                sqlx::query(
                    "UPDATE quota_state
                     SET reserved_requests = MAX(reserved_requests - 1, 0),
                         reserved_tokens = MAX(reserved_tokens - ?, 0),
                         used_requests = used_requests + 1,
                         used_tokens = used_tokens + ?,
                         updated_at = ?
                     WHERE user_id = ?",
                )
                .bind(i64::from(estimated))
                .bind(i64::from(charged))
                .bind(encode_timestamp(now))
                .bind(&user_id)
                .execute(&mut *tx)
                .await?;
                charged
            }
            None => {
                sqlx::query(
                    "UPDATE quota_state
                     SET reserved_requests = MAX(reserved_requests - 1, 0),
                         reserved_tokens = MAX(reserved_tokens - ?, 0),
                         updated_at = ?
                     WHERE user_id = ?",
                )
                .bind(i64::from(estimated))
                .bind(encode_timestamp(now))
                .bind(&user_id)
                .execute(&mut *tx)
                .await?;
                0
            }
        };

        tx.commit().await?;
        Ok(charged)
    }
}

#[async_trait::async_trait]
impl QuotaLedger for SqlQuotaLedger {
    async fn get_quota_state(
        &self,
        user_id: &UserId,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError> {
        self.current_state(user_id, defaults, now).await
    }

    async fn check_and_reserve(
        &self,
        user_id: &UserId,
        estimated_tokens: u32,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaReservation, LedgerError> {
        self.current_state(user_id, defaults, now).await?;

        let reservation = QuotaReservation {
            id: ReservationId(format!("res-{}", uuid::Uuid::new_v4())),
            user_id: user_id.clone(),
            estimated_tokens,
            created_at: now,
        };

        let mut tx = self.pool.begin().await?;
        let admitted = sqlx::query(
            "UPDATE quota_state
             SET reserved_requests = reserved_requests + 1,
                 reserved_tokens = reserved_tokens + ?,
                 updated_at = ?
             WHERE user_id = ?
               AND active = 1
               AND used_requests + reserved_requests + 1 <= max_requests
               AND used_tokens + reserved_tokens + ? <= max_tokens",
        )
        .bind(i64::from(estimated_tokens))
        .bind(encode_timestamp(now))
        .bind(&user_id.0)
        .bind(i64::from(estimated_tokens))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if admitted == 0 {
            tx.rollback().await?;
            let state = self.find_state(user_id).await?.ok_or_else(|| {
                RepositoryError::Decode(format!("quota row for `{}` is missing", user_id.0))
            })?;
            return Err(rules::quota_exceeded(&state, estimated_tokens).into());
        }

        sqlx::query(
            "INSERT INTO quota_reservation (id, user_id, estimated_tokens, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&reservation.id.0)
        .bind(&reservation.user_id.0)
        .bind(i64::from(reservation.estimated_tokens))
        .bind(encode_timestamp(reservation.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reservation)
    }

    async fn commit(
        &self,
        reservation_id: &ReservationId,
        actual_tokens: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, LedgerError> {
        self.settle(reservation_id, Some(actual_tokens), now).await
    }

    async fn release(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.settle(reservation_id, None, now).await.map(|_| ())
    }

    async fn set_limits(
        &self,
        user_id: &UserId,
        max_requests: u32,
        max_tokens: u32,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError> {
        self.current_state(user_id, defaults, now).await?;
        sqlx::query(
            "UPDATE quota_state SET max_requests = ?, max_tokens = ?, updated_at = ?
             WHERE user_id = ?",
        )
        .bind(i64::from(max_requests))
        .bind(i64::from(max_tokens))
        .bind(encode_timestamp(now))
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;

        self.find_state(user_id).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("quota row for `{}` is missing", user_id.0)).into()
        })
    }

    async fn reset_due(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let rows =
            sqlx::query(&format!("SELECT {QUOTA_COLUMNS} FROM quota_state WHERE reset_at <= ?"))
                .bind(encode_timestamp(now))
                .fetch_all(&self.pool)
                .await?;

        let mut reset = 0;
        for row in rows {
            let state = quota_from_row(row)?;
            if self.apply_reset(&state, now).await? {
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn outstanding_reservations(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<QuotaReservation>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, user_id, estimated_tokens, created_at
             FROM quota_reservation
             WHERE user_id = ?
             ORDER BY created_at ASC",
        )
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| reservation_from_row(row).map_err(LedgerError::from))
            .collect()
    }
}

fn quota_from_row(row: SqliteRow) -> Result<QuotaState, RepositoryError> {
    Ok(QuotaState {
        user_id: UserId(row.try_get("user_id")?),
        max_requests: parse_u32("max_requests", row.try_get("max_requests")?)?,
        max_tokens: parse_u32("max_tokens", row.try_get("max_tokens")?)?,
        used_requests: parse_u32("used_requests", row.try_get("used_requests")?)?,
        used_tokens: parse_u32("used_tokens", row.try_get("used_tokens")?)?,
        reserved_requests: parse_u32("reserved_requests", row.try_get("reserved_requests")?)?,
        reserved_tokens: parse_u32("reserved_tokens", row.try_get("reserved_tokens")?)?,
        reset_at: parse_timestamp("reset_at", row.try_get("reset_at")?)?,
        active: row.try_get::<i64, _>("active")? != 0,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn reservation_from_row(row: SqliteRow) -> Result<QuotaReservation, RepositoryError> {
    Ok(QuotaReservation {
        id: ReservationId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        estimated_tokens: parse_u32("estimated_tokens", row.try_get("estimated_tokens")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
