use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

/// Why a ledger row exists. Corrections are new `Adjustment` rows; existing
/// rows are never edited or removed, which keeps replay deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerReason {
    Earn,
    Redeem,
    Refund,
    Adjustment,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::Earn => "earn",
            LedgerReason::Redeem => "redeem",
            LedgerReason::Refund => "refund",
            LedgerReason::Adjustment => "adjustment",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub delta_points: i64,
    pub reason: String,
    pub related_order_id: Option<String>,
    pub related_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("delta_points must be non-zero")]
    ZeroDelta,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const ENTRY_COLUMNS: &str =
    "id, account_id, delta_points, reason, related_order_id, related_payment_id, created_at";

/// Append is the only mutation primitive for the ledger.
pub async fn append_entry(
    db: &PgPool,
    account_id: Uuid,
    delta_points: i64,
    reason: LedgerReason,
    related_order_id: Option<&str>,
    related_payment_id: Option<&str>,
) -> Result<LedgerEntry, LedgerError> {
    if delta_points == 0 {
        return Err(LedgerError::ZeroDelta);
    }
    let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
        r#"INSERT INTO loyalty_ledger (id, account_id, delta_points, reason, related_order_id, related_payment_id)
           VALUES ($1, $2, $3, $4, $5, $6)
           RETURNING {ENTRY_COLUMNS}"#,
    ))
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(delta_points)
    .bind(reason.as_str())
    .bind(related_order_id)
    .bind(related_payment_id)
    .fetch_one(db)
    .await?;
    Ok(entry)
}

/// Earn entry keyed by the external payment id. A retried webhook delivery
/// for the same payment inserts nothing and returns `None`.
pub async fn append_earn_once(
    db: &PgPool,
    account_id: Uuid,
    delta_points: i64,
    related_order_id: &str,
    related_payment_id: &str,
) -> Result<Option<LedgerEntry>, LedgerError> {
    if delta_points == 0 {
        return Err(LedgerError::ZeroDelta);
    }
    let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
        r#"INSERT INTO loyalty_ledger (id, account_id, delta_points, reason, related_order_id, related_payment_id)
           VALUES ($1, $2, $3, 'earn', $4, $5)
           ON CONFLICT (related_payment_id) WHERE reason = 'earn' DO NOTHING
           RETURNING {ENTRY_COLUMNS}"#,
    ))
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(delta_points)
    .bind(related_order_id)
    .bind(related_payment_id)
    .fetch_optional(db)
    .await?;
    Ok(entry)
}

/// Balance is always a read: the sum of all deltas for the account.
pub async fn get_balance(db: &PgPool, account_id: Uuid) -> Result<i64, LedgerError> {
    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta_points), 0)::BIGINT FROM loyalty_ledger WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_one(db)
    .await?;
    Ok(balance)
}
