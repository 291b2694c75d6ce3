use crate::checkout::{self, CheckoutError, CheckoutRequest};
use crate::gateway::{CartItem, ExternalOrder, ExternalPayment, GatewayError, OrderDiscount, OrderRequest};
use crate::ledger::{self, LedgerError};
use crate::redemption::{self, RedemptionError};
use crate::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use common_http_errors::{ApiError, ApiResult};
use common_money::Money;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

impl From<RedemptionError> for ApiError {
    fn from(err: RedemptionError) -> Self {
        match err {
            RedemptionError::UnknownReward(reward_key) => {
                ApiError::UnknownReward { reward_key, trace_id: None }
            }
            RedemptionError::InsufficientPoints { needed, balance } => {
                ApiError::InsufficientPoints { needed, balance, trace_id: None }
            }
            RedemptionError::NotFound => ApiError::NotFound { code: "invalid_coupon", trace_id: None },
            RedemptionError::AlreadyRedeemed => ApiError::AlreadyRedeemed { trace_id: None },
            RedemptionError::Expired => ApiError::Expired { trace_id: None },
            RedemptionError::Conflict(code) => ApiError::Conflict { code, trace_id: None, message: None },
            RedemptionError::CodeAllocation => {
                ApiError::internal("failed to allocate a unique code", None)
            }
            RedemptionError::Ledger(inner) => inner.into(),
            RedemptionError::Db(inner) => ApiError::internal(inner, None),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::ZeroDelta => ApiError::bad_request("zero_delta", None),
            LedgerError::Db(inner) => ApiError::internal(inner, None),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::gateway(err, None)
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Validation(message) => ApiError::BadRequest {
                code: "invalid_checkout",
                trace_id: None,
                message: Some(message.to_string()),
            },
            CheckoutError::Redemption(inner) => inner.into(),
            CheckoutError::Gateway(inner) => inner.into(),
        }
    }
}

// --- Coupon validate ---

#[derive(Deserialize)]
pub struct CouponValidateRequest {
    pub code: Option<String>,
}

#[derive(Serialize)]
pub struct CouponValidateResponse {
    pub ok: bool,
    pub code: String,
    #[serde(flatten)]
    pub discount: crate::rewards::Discount,
    pub expires_at: DateTime<Utc>,
    pub message: &'static str,
}

pub async fn coupon_validate(
    State(state): State<AppState>,
    Json(req): Json<CouponValidateRequest>,
) -> ApiResult<Json<CouponValidateResponse>> {
    let code = req
        .code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(ApiError::BadRequest {
            code: "missing_code",
            trace_id: None,
            message: Some("Coupon code is required".into()),
        })?;
    let coupon = redemption::validate_code(&state.db, &state.catalog, code).await?;
    Ok(Json(CouponValidateResponse {
        ok: true,
        code: coupon.code,
        discount: coupon.discount,
        expires_at: coupon.expires_at,
        message: "Coupon valid",
    }))
}

// --- Redeem: generate code ---

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub account_id: Uuid,
    pub reward_key: String,
}

pub async fn redeem_reward(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> ApiResult<Json<redemption::IssuedCode>> {
    if req.reward_key.trim().is_empty() {
        return Err(ApiError::bad_request("missing_reward_key", None));
    }
    let issued =
        redemption::request_redemption(&state.db, &state.catalog, req.account_id, &req.reward_key)
            .await?;
    Ok(Json(issued))
}

// --- Mark used ---

#[derive(Deserialize)]
pub struct MarkUsedRequest {
    pub code: String,
    /// Owning account; the transition only touches this account's codes.
    pub account_id: Uuid,
    #[serde(default)]
    pub related_payment_id: Option<String>,
    #[serde(default)]
    pub related_order_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Serialize)]
pub struct MarkUsedResponse {
    pub ok: bool,
    pub updated: MarkUsedRow,
}

#[derive(Serialize)]
pub struct MarkUsedRow {
    pub id: Uuid,
    pub code: String,
    pub status: String,
    pub used_at: Option<DateTime<Utc>>,
}

pub async fn mark_reward_used(
    State(state): State<AppState>,
    Json(req): Json<MarkUsedRequest>,
) -> ApiResult<Json<MarkUsedResponse>> {
    if req.code.trim().is_empty() {
        return Err(ApiError::bad_request("missing_code", None));
    }
    let row = redemption::mark_used(
        &state.db,
        &req.code,
        Some(req.account_id),
        req.related_payment_id.as_deref(),
        req.related_order_id.as_deref(),
        req.note.as_deref(),
    )
    .await?;
    Ok(Json(MarkUsedResponse {
        ok: true,
        updated: MarkUsedRow {
            id: row.id,
            code: row.code,
            status: row.status,
            used_at: row.used_at,
        },
    }))
}

// --- Checkout: create order (client-driven flow) ---

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub applied_code: Option<String>,
    #[serde(default)]
    pub tip_minor: Money,
    #[serde(default)]
    pub pickup_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Serialize)]
pub struct CreateOrderResponse {
    pub ok: bool,
    pub order: ExternalOrder,
}

pub async fn create_checkout_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<Json<CreateOrderResponse>> {
    checkout::validate_items(&req.items).map_err(ApiError::from)?;
    let subtotal = checkout::cart_subtotal(&req.items);

    let mut discount = None;
    let mut reference_id = None;
    if let Some(code) = req.applied_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        let coupon = redemption::validate_code(&state.db, &state.catalog, code).await?;
        discount = Some(OrderDiscount {
            name: coupon.code.clone(),
            amount_minor: coupon.discount.discount_cents(subtotal),
        });
        reference_id = Some(coupon.code);
    }

    let note = checkout::order_note(req.pickup_time.as_deref(), req.notes.as_deref());
    let order_req = OrderRequest {
        items: req.items,
        discount,
        tip_minor: req.tip_minor,
        reference_id,
        note,
        idempotency_key: req
            .idempotency_key
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    };
    let order = state.gateway.create_order(&order_req).await?;
    Ok(Json(CreateOrderResponse { ok: true, order }))
}

// --- Checkout: pay order (client-driven flow) ---

#[derive(Deserialize)]
pub struct PayOrderRequest {
    pub order_id: String,
    pub amount_minor: Money,
    #[serde(default)]
    pub source_id: Option<String>,
    pub idempotency_key: String,
}

#[derive(Serialize)]
pub struct PayOrderResponse {
    pub payment: ExternalPayment,
}

pub async fn pay_checkout_order(
    State(state): State<AppState>,
    Json(req): Json<PayOrderRequest>,
) -> ApiResult<Json<PayOrderResponse>> {
    if req.order_id.trim().is_empty() || req.idempotency_key.trim().is_empty() {
        return Err(ApiError::bad_request("missing_order_or_key", None));
    }
    if req.amount_minor.is_negative() {
        return Err(ApiError::bad_request("negative_amount", None));
    }

    // Fully comped orders skip tokenization and the charge entirely.
    if req.amount_minor.is_zero() {
        return Ok(Json(PayOrderResponse {
            payment: checkout::zero_dollar_payment(&req.order_id),
        }));
    }

    let source_id = req.source_id.as_deref().ok_or(ApiError::BadRequest {
        code: "missing_source_id",
        trace_id: None,
        message: Some("Missing source_id for non-zero payment".into()),
    })?;
    let payment = state
        .gateway
        .create_payment(&req.order_id, req.amount_minor, source_id, &req.idempotency_key)
        .await?;
    Ok(Json(PayOrderResponse { payment }))
}

// --- Checkout: full orchestration ---

pub async fn full_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<checkout::CheckoutReceipt>> {
    let receipt =
        checkout::checkout(&state.db, state.gateway.as_ref(), &state.catalog, &req).await?;
    Ok(Json(receipt))
}

// --- Loyalty balance ---

#[derive(Serialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub balance: i64,
}

pub async fn get_balance(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<BalanceResponse>> {
    let account_id = params
        .get("account_id")
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(ApiError::BadRequest {
            code: "missing_account_id",
            trace_id: None,
            message: Some("account_id required".into()),
        })?;
    let balance = ledger::get_balance(&state.db, account_id).await?;
    Ok(Json(BalanceResponse { account_id, balance }))
}

// --- Reward catalog listing ---

pub async fn list_rewards(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "rewards": state.catalog.rewards() }))
}
