//! End-to-end lifecycle tests against a real Postgres. Run with:
//!   DATABASE_URL=... cargo test -p storefront-service -- --ignored

use chrono::{Duration, Utc};
use common_money::Money;
use sqlx::{Executor, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use storefront_service::checkout::{checkout, CheckoutRequest};
use storefront_service::gateway::{CartItem, ExternalOrder, StubGateway};
use storefront_service::ledger::{self, LedgerError, LedgerReason};
use storefront_service::redemption::{self, RedemptionError};
use storefront_service::rewards::RewardCatalog;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS loyalty_ledger (
    id UUID PRIMARY KEY,
    account_id UUID NOT NULL,
    delta_points BIGINT NOT NULL CHECK (delta_points <> 0),
    reason TEXT NOT NULL,
    related_order_id TEXT NULL,
    related_payment_id TEXT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS loyalty_ledger_account_idx ON loyalty_ledger (account_id);
CREATE UNIQUE INDEX IF NOT EXISTS loyalty_ledger_earn_payment_uniq
    ON loyalty_ledger (related_payment_id) WHERE reason = 'earn';

CREATE TABLE IF NOT EXISTS pending_rewards (
    id UUID PRIMARY KEY,
    account_id UUID NOT NULL,
    reward_key TEXT NOT NULL,
    points_cost BIGINT NOT NULL,
    code TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at TIMESTAMPTZ NOT NULL,
    used_at TIMESTAMPTZ NULL,
    related_payment_id TEXT NULL,
    related_order_id TEXT NULL,
    note TEXT NULL
);
CREATE INDEX IF NOT EXISTS pending_rewards_account_idx ON pending_rewards (account_id);
"#;

async fn pool() -> PgPool {
    let dsn = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this ignored test");
    let pool = PgPool::connect(&dsn).await.unwrap();
    pool.execute(SCHEMA).await.unwrap();
    pool
}

async fn seed_points(db: &PgPool, account_id: Uuid, points: i64) {
    ledger::append_entry(db, account_id, points, LedgerReason::Adjustment, None, None)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn balance_is_the_sum_of_ledger_entries() {
    let db = pool().await;
    let account = Uuid::new_v4();

    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 0);
    ledger::append_entry(&db, account, 120, LedgerReason::Earn, Some("ord-1"), None)
        .await
        .unwrap();
    ledger::append_entry(&db, account, -50, LedgerReason::Redeem, None, None)
        .await
        .unwrap();
    ledger::append_entry(&db, account, 5, LedgerReason::Adjustment, None, None)
        .await
        .unwrap();
    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 75);

    let err = ledger::append_entry(&db, account, 0, LedgerReason::Earn, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ZeroDelta));
}

#[tokio::test]
#[ignore]
async fn redemption_pairs_code_with_debit() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    seed_points(&db, account, 50).await;

    let issued = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap();
    assert_eq!(issued.reward_key, "ESPRESSO_2OZ");
    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 0);

    let coupon = redemption::validate_code(&db, &catalog, &issued.code).await.unwrap();
    assert_eq!(coupon.reward_key, "ESPRESSO_2OZ");

    // Case-insensitive token match.
    let lower = issued.code.to_lowercase();
    assert!(redemption::validate_code(&db, &catalog, &lower).await.is_ok());
}

#[tokio::test]
#[ignore]
async fn unknown_reward_and_insufficient_points_are_distinct_failures() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    seed_points(&db, account, 10).await;

    let err = redemption::request_redemption(&db, &catalog, account, "MOON_DUST")
        .await
        .unwrap_err();
    assert!(matches!(err, RedemptionError::UnknownReward(_)));

    let err = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RedemptionError::InsufficientPoints { needed: 50, balance: 10 }
    ));
    // Failed redemption leaves no code and no debit behind.
    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 10);
}

#[tokio::test]
#[ignore]
async fn retry_within_window_reuses_the_pending_code() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    seed_points(&db, account, 200).await;

    let first = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap();
    let second = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap();
    assert_eq!(first.code, second.code);
    // One debit, not two.
    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 150);
}

#[tokio::test]
#[ignore]
async fn parallel_redemptions_never_overdraw_the_balance() {
    let db = pool().await;
    let catalog = Arc::new(RewardCatalog::builtin());
    let account = Uuid::new_v4();
    // Enough for either reward alone, not for both.
    seed_points(&db, account, 100).await;

    let mut handles = Vec::new();
    for reward_key in ["ESPRESSO_2OZ", "BREWED_COFFEE"] {
        let db = db.clone();
        let catalog = catalog.clone();
        handles.push(tokio::spawn(async move {
            redemption::request_redemption(&db, &catalog, account, reward_key).await
        }));
    }
    let results: Vec<_> = futures_join(handles).await;
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of the competing redemptions may win");

    let balance = ledger::get_balance(&db, account).await.unwrap();
    assert!(balance >= 0, "balance went negative: {balance}");
}

async fn futures_join(
    handles: Vec<tokio::task::JoinHandle<Result<redemption::IssuedCode, RedemptionError>>>,
) -> Vec<Result<redemption::IssuedCode, RedemptionError>> {
    let mut out = Vec::new();
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}

#[tokio::test]
#[ignore]
async fn mark_used_is_first_writer_wins_and_idempotent_per_payment() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    seed_points(&db, account, 50).await;
    let issued = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap();

    let used = redemption::mark_used(&db, &issued.code, Some(account), Some("pay-1"), Some("ord-1"), None)
        .await
        .unwrap();
    assert_eq!(used.status, "USED");
    assert!(used.used_at.is_some());

    // Same payment id again: idempotent success, same terminal state.
    let again = redemption::mark_used(&db, &issued.code, Some(account), Some("pay-1"), Some("ord-1"), None)
        .await
        .unwrap();
    assert_eq!(again.id, used.id);
    assert_eq!(again.status, "USED");

    // Different payment id loses the race.
    let err = redemption::mark_used(&db, &issued.code, Some(account), Some("pay-2"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RedemptionError::Conflict(_)));

    // Validation now reports it as redeemed.
    let err = redemption::validate_code(&db, &catalog, &issued.code).await.unwrap_err();
    assert!(matches!(err, RedemptionError::AlreadyRedeemed));
}

#[tokio::test]
#[ignore]
async fn wildcard_tokens_never_match_stored_codes() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let mut issued = Vec::new();
    for _ in 0..2 {
        let account = Uuid::new_v4();
        seed_points(&db, account, 50).await;
        issued.push(
            redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
                .await
                .unwrap(),
        );
    }

    // SQL pattern characters in the token must be inert: neither a bare
    // `%` nor a run of `_` placeholders may touch anyone's code.
    let err = redemption::mark_used(&db, "%", None, Some("rogue-pay"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RedemptionError::NotFound));
    let err = redemption::validate_code(&db, &catalog, "__________").await.unwrap_err();
    assert!(matches!(err, RedemptionError::NotFound));

    for code in &issued {
        let status: String =
            sqlx::query_scalar("SELECT status FROM pending_rewards WHERE code = $1")
                .bind(&code.code)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(status, "PENDING");
    }
}

#[tokio::test]
#[ignore]
async fn mark_used_is_scoped_to_the_owning_account() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let owner = Uuid::new_v4();
    seed_points(&db, owner, 50).await;
    let issued = redemption::request_redemption(&db, &catalog, owner, "ESPRESSO_2OZ")
        .await
        .unwrap();

    let stranger = Uuid::new_v4();
    let err = redemption::mark_used(&db, &issued.code, Some(stranger), Some("pay-x"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RedemptionError::NotFound));

    let status: String = sqlx::query_scalar("SELECT status FROM pending_rewards WHERE code = $1")
        .bind(&issued.code)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(status, "PENDING");

    // The owner still can.
    let used = redemption::mark_used(&db, &issued.code, Some(owner), Some("pay-x"), None, None)
        .await
        .unwrap();
    assert_eq!(used.status, "USED");
}

#[tokio::test]
#[ignore]
async fn expired_code_is_rejected_without_a_status_write() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    let code = format!("EXP{}", &Uuid::new_v4().simple().to_string()[..7].to_uppercase());
    sqlx::query(
        r#"INSERT INTO pending_rewards (id, account_id, reward_key, points_cost, code, status, expires_at)
           VALUES ($1, $2, 'ESPRESSO_2OZ', 50, $3, 'PENDING', $4)"#,
    )
    .bind(Uuid::new_v4())
    .bind(account)
    .bind(&code)
    .bind(Utc::now() - Duration::days(1))
    .execute(&db)
    .await
    .unwrap();

    let err = redemption::validate_code(&db, &catalog, &code).await.unwrap_err();
    assert!(matches!(err, RedemptionError::Expired));

    let stored: String =
        sqlx::query_scalar("SELECT status FROM pending_rewards WHERE code = $1")
            .bind(&code)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(stored, "PENDING", "expiry must be a view, not a write");
}

#[tokio::test]
#[ignore]
async fn earn_credit_is_deduped_by_payment_id() {
    let db = pool().await;
    let account = Uuid::new_v4();
    let payment_id = format!("pay-{}", Uuid::new_v4());

    let first = ledger::append_earn_once(&db, account, 10, "ord-1", &payment_id)
        .await
        .unwrap();
    assert!(first.is_some());
    let replay = ledger::append_earn_once(&db, account, 10, "ord-1", &payment_id)
        .await
        .unwrap();
    assert!(replay.is_none(), "replayed webhook delivery must not credit twice");
    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 10);
}

#[tokio::test]
#[ignore]
async fn round_trip_redeem_validate_checkout_marks_code_used() {
    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    seed_points(&db, account, 50).await;

    // Redeem the 50-point tier: balance 50 -> 0, $2.00 off.
    let issued = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap();
    assert_eq!(ledger::get_balance(&db, account).await.unwrap(), 0);

    let gateway = StubGateway::new();
    let req = CheckoutRequest {
        items: vec![CartItem {
            name: "Bag of Beans".into(),
            quantity: 1,
            unit_price_minor: Money::from_cents(500),
            modifiers: vec![],
        }],
        applied_code: Some(issued.code.clone()),
        tip_minor: Money::ZERO,
        pickup_time: None,
        notes: None,
        source_id: Some("cnon:card-nonce".into()),
        idempotency_key: Some(format!("idem-{}", Uuid::new_v4())),
    };
    let receipt = checkout(&db, &gateway, &catalog, &req).await.unwrap();
    // $5.00 cart minus $2.00 reward (stub applies no tax).
    assert_eq!(receipt.final_amount, Money::from_cents(300));

    let status: String = sqlx::query_scalar("SELECT status FROM pending_rewards WHERE code = $1")
        .bind(&issued.code)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(status, "USED");
}

#[tokio::test]
#[ignore]
async fn webhook_reconciles_before_checkout_and_tolerates_replay() {
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use storefront_service::config::{AppConfig, SquareConfig, WebhookConfig};
    use storefront_service::{build_router, AppState};
    use tower::ServiceExt;

    let db = pool().await;
    let catalog = RewardCatalog::builtin();
    let account = Uuid::new_v4();
    seed_points(&db, account, 50).await;
    let issued = redemption::request_redemption(&db, &catalog, account, "ESPRESSO_2OZ")
        .await
        .unwrap();

    let order_id = format!("ord-{}", Uuid::new_v4());
    let payment_id = format!("pay-{}", Uuid::new_v4());
    let order = ExternalOrder {
        id: order_id.clone(),
        total_minor: Money::from_cents(300),
        subtotal_minor: Money::from_cents(500),
        reference_id: Some(issued.code.clone()),
        metadata: HashMap::from([
            ("loyalty_code".to_string(), issued.code.clone()),
            ("account_id".to_string(), account.to_string()),
        ]),
        discount_names: vec![issued.code.clone()],
    };
    let gateway = StubGateway::new().with_order(order);

    let signature_key = "whsec_lifecycle";
    let notification_url = "https://cafe.example/webhooks/square";
    let state = AppState {
        db: db.clone(),
        gateway: Arc::new(gateway),
        catalog: Arc::new(catalog),
        config: Arc::new(AppConfig {
            square: SquareConfig {
                base_url: "https://connect.squareupsandbox.com".into(),
                access_token: "test".into(),
                location_id: "L1".into(),
                timeout_secs: 5,
            },
            webhook: WebhookConfig {
                signature_key: signature_key.into(),
                notification_url: notification_url.into(),
            },
        }),
    };
    let app = build_router(state);

    let body = serde_json::json!({
        "type": "payment.updated",
        "data": { "object": { "payment": {
            "id": payment_id,
            "status": "COMPLETED",
            "order_id": order_id
        }}}
    })
    .to_string();
    let mut mac = Hmac::<Sha256>::new_from_slice(signature_key.as_bytes()).unwrap();
    mac.update(notification_url.as_bytes());
    mac.update(body.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    // Deliver twice: the platform retries, and ordering against checkout's
    // own mark-used call is not guaranteed.
    for _ in 0..2 {
        let req = Request::builder()
            .uri("/webhooks/square")
            .method("POST")
            .header("x-square-hmacsha256-signature", signature.clone())
            .body(axum::body::Body::from(body.clone()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    let status: String = sqlx::query_scalar("SELECT status FROM pending_rewards WHERE code = $1")
        .bind(&issued.code)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(status, "USED");

    // Earn credit: floor(500 / 100) = 5 points, exactly once.
    let earned: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta_points), 0)::BIGINT FROM loyalty_ledger
         WHERE account_id = $1 AND reason = 'earn'",
    )
    .bind(account)
    .fetch_one(&db)
    .await
    .unwrap();
    assert_eq!(earned, 5);
}
