use crate::ledger::LedgerError;
use crate::rewards::{Discount, RewardCatalog};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

pub const CODE_LEN: usize = 10;
pub const CODE_TTL_DAYS: i64 = 14;
/// Window inside which a repeated redeem request returns the existing
/// PENDING code instead of debiting twice.
pub const REDEEM_IDEMPOTENCY_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeStatus {
    Pending,
    Used,
    Void,
    Expired,
}

impl CodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Pending => "PENDING",
            CodeStatus::Used => "USED",
            CodeStatus::Void => "VOID",
            CodeStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<CodeStatus> {
        match s {
            "PENDING" => Some(CodeStatus::Pending),
            "USED" => Some(CodeStatus::Used),
            "VOID" => Some(CodeStatus::Void),
            "EXPIRED" => Some(CodeStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct RedemptionCode {
    pub id: Uuid,
    pub account_id: Uuid,
    pub reward_key: String,
    pub points_cost: i64,
    pub code: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub related_payment_id: Option<String>,
    pub related_order_id: Option<String>,
    pub note: Option<String>,
}

impl RedemptionCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Serialize)]
pub struct IssuedCode {
    pub code: String,
    pub reward_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ValidatedCoupon {
    pub code: String,
    pub reward_key: String,
    #[serde(flatten)]
    pub discount: Discount,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RedemptionError {
    #[error("unknown reward key: {0}")]
    UnknownReward(String),
    #[error("not enough points: need {needed}, have {balance}")]
    InsufficientPoints { needed: i64, balance: i64 },
    #[error("no matching reward code")]
    NotFound,
    #[error("code already redeemed")]
    AlreadyRedeemed,
    #[error("code expired")]
    Expired,
    #[error("code is not pending: {0}")]
    Conflict(&'static str),
    #[error("failed to allocate a unique code")]
    CodeAllocation,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const CODE_COLUMNS: &str = "id, account_id, reward_key, points_cost, code, status, created_at, \
     expires_at, used_at, related_payment_id, related_order_id, note";

fn generate_code(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Convert sufficient balance into a single-use PENDING code paired with its
/// debit entry. The pair commits or rolls back as one unit; the debit insert
/// re-checks the balance at write time, and the per-account advisory lock
/// serializes concurrent redeem attempts so the balance can never go
/// negative.
pub async fn request_redemption(
    db: &PgPool,
    catalog: &RewardCatalog,
    account_id: Uuid,
    reward_key: &str,
) -> Result<IssuedCode, RedemptionError> {
    let def = catalog
        .resolve(reward_key)
        .ok_or_else(|| RedemptionError::UnknownReward(reward_key.to_string()))?;

    let mut tx = db.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(account_id.to_string())
        .execute(&mut *tx)
        .await?;

    // Idempotency window: a double-click retry gets the existing code back.
    let recent = sqlx::query_as::<_, RedemptionCode>(&format!(
        r#"SELECT {CODE_COLUMNS} FROM pending_rewards
           WHERE account_id = $1 AND reward_key = $2 AND status = 'PENDING'
             AND created_at >= now() - make_interval(secs => $3)
           ORDER BY created_at DESC
           LIMIT 1"#,
    ))
    .bind(account_id)
    .bind(reward_key)
    .bind(REDEEM_IDEMPOTENCY_WINDOW_SECS as f64)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(existing) = recent {
        tx.commit().await?;
        return Ok(IssuedCode {
            code: existing.code,
            reward_key: existing.reward_key,
            expires_at: existing.expires_at,
        });
    }

    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta_points), 0)::BIGINT FROM loyalty_ledger WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_one(&mut *tx)
    .await?;
    if balance < def.points_cost {
        return Err(RedemptionError::InsufficientPoints {
            needed: def.points_cost,
            balance,
        });
    }

    let expires_at = Utc::now() + Duration::days(CODE_TTL_DAYS);
    let mut issued: Option<RedemptionCode> = None;
    // Collision-checked insert: regenerate on the rare duplicate token.
    for _ in 0..5 {
        let code = generate_code(CODE_LEN);
        let inserted = sqlx::query_as::<_, RedemptionCode>(&format!(
            r#"INSERT INTO pending_rewards (id, account_id, reward_key, points_cost, code, status, expires_at)
               VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)
               ON CONFLICT (code) DO NOTHING
               RETURNING {CODE_COLUMNS}"#,
        ))
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(reward_key)
        .bind(def.points_cost)
        .bind(&code)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = inserted {
            issued = Some(row);
            break;
        }
    }
    let issued = issued.ok_or(RedemptionError::CodeAllocation)?;

    // Paired debit, conditional on a fresh balance read at write time. No
    // row means another writer drained the balance: drop the transaction and
    // the PENDING code above rolls back with it.
    let debited: Option<Uuid> = sqlx::query_scalar(
        r#"INSERT INTO loyalty_ledger (id, account_id, delta_points, reason)
           SELECT $1, $2, $3, 'redeem'
           WHERE (SELECT COALESCE(SUM(delta_points), 0) FROM loyalty_ledger WHERE account_id = $2) >= $4
           RETURNING id"#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(-def.points_cost)
    .bind(def.points_cost)
    .fetch_optional(&mut *tx)
    .await?;

    if debited.is_none() {
        return Err(RedemptionError::InsufficientPoints {
            needed: def.points_cost,
            balance,
        });
    }

    tx.commit().await?;
    Ok(IssuedCode {
        code: issued.code,
        reward_key: issued.reward_key,
        expires_at: issued.expires_at,
    })
}

/// Read-only lookup for checkout. Expiry is detected by comparing
/// `expires_at` to now; the stored status is left untouched.
pub async fn validate_code(
    db: &PgPool,
    catalog: &RewardCatalog,
    code: &str,
) -> Result<ValidatedCoupon, RedemptionError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(RedemptionError::NotFound);
    }

    let row = find_by_code(db, code).await?.ok_or(RedemptionError::NotFound)?;
    coupon_from_row(catalog, &row, Utc::now())
}

/// Status checks shared by the HTTP validator and the webhook reconciler.
pub fn coupon_from_row(
    catalog: &RewardCatalog,
    row: &RedemptionCode,
    now: DateTime<Utc>,
) -> Result<ValidatedCoupon, RedemptionError> {
    match CodeStatus::from_str(&row.status) {
        Some(CodeStatus::Used) | Some(CodeStatus::Void) => {
            return Err(RedemptionError::AlreadyRedeemed)
        }
        Some(CodeStatus::Expired) => return Err(RedemptionError::Expired),
        Some(CodeStatus::Pending) => {}
        None => return Err(RedemptionError::Conflict("unknown_status")),
    }
    if row.is_expired_at(now) {
        return Err(RedemptionError::Expired);
    }
    let def = catalog
        .resolve(&row.reward_key)
        .ok_or_else(|| RedemptionError::UnknownReward(row.reward_key.clone()))?;
    Ok(ValidatedCoupon {
        code: row.code.clone(),
        reward_key: row.reward_key.clone(),
        discount: def.discount,
        expires_at: row.expires_at,
    })
}

/// PENDING -> USED as a single conditional update; the first writer wins.
/// A repeat call carrying the same payment id is an idempotent success, so
/// the orchestrator/webhook race is harmless. When `account_id` is given
/// the transition only touches that account's code; callers handling raw
/// client input must pass it.
pub async fn mark_used(
    db: &PgPool,
    code: &str,
    account_id: Option<Uuid>,
    related_payment_id: Option<&str>,
    related_order_id: Option<&str>,
    note: Option<&str>,
) -> Result<RedemptionCode, RedemptionError> {
    let code = code.trim();
    let updated = sqlx::query_as::<_, RedemptionCode>(&format!(
        r#"UPDATE pending_rewards
           SET status = 'USED',
               used_at = now(),
               related_payment_id = COALESCE($3, related_payment_id),
               related_order_id = COALESCE($4, related_order_id),
               note = COALESCE($5, note)
           WHERE upper(code) = upper($1)
             AND ($2::uuid IS NULL OR account_id = $2)
             AND status = 'PENDING'
           RETURNING {CODE_COLUMNS}"#,
    ))
    .bind(code)
    .bind(account_id)
    .bind(related_payment_id)
    .bind(related_order_id)
    .bind(note)
    .fetch_optional(db)
    .await?;

    if let Some(row) = updated {
        return Ok(row);
    }

    // Lost the conditional update: decide between idempotent success and a
    // real conflict from the row that is actually there.
    let row = find_by_code(db, code).await?.ok_or(RedemptionError::NotFound)?;
    if account_id.is_some_and(|id| id != row.account_id) {
        return Err(RedemptionError::NotFound);
    }
    match CodeStatus::from_str(&row.status) {
        Some(CodeStatus::Used) => match (related_payment_id, row.related_payment_id.as_deref()) {
            (Some(given), Some(stored)) if given == stored => Ok(row),
            _ => Err(RedemptionError::Conflict("code_not_pending")),
        },
        _ => Err(RedemptionError::Conflict("code_not_pending")),
    }
}

pub async fn find_by_code(db: &PgPool, code: &str) -> Result<Option<RedemptionCode>, sqlx::Error> {
    // upper() on both sides keeps the case-insensitive match the storefront
    // has always accepted while treating the token as a literal, so `%` and
    // `_` in client input never act as wildcards.
    sqlx::query_as::<_, RedemptionCode>(&format!(
        "SELECT {CODE_COLUMNS} FROM pending_rewards WHERE upper(code) = upper($1) LIMIT 1",
    ))
    .bind(code.trim())
    .fetch_optional(db)
    .await
}

/// First unexpired PENDING code among the webhook's correlation candidates.
pub async fn find_pending_by_candidates(
    db: &PgPool,
    candidates: &[String],
) -> Result<Option<RedemptionCode>, sqlx::Error> {
    if candidates.is_empty() {
        return Ok(None);
    }
    sqlx::query_as::<_, RedemptionCode>(&format!(
        r#"SELECT {CODE_COLUMNS} FROM pending_rewards
           WHERE code = ANY($1) AND status = 'PENDING' AND expires_at >= now()
           ORDER BY created_at DESC
           LIMIT 1"#,
    ))
    .bind(candidates)
    .fetch_optional(db)
    .await
}
