use crate::gateway::{
    CartItem, ExternalPayment, GatewayError, OrderDiscount, OrderRequest, PaymentGateway,
};
use crate::redemption::{self, RedemptionError};
use crate::rewards::RewardCatalog;
use common_money::Money;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub applied_code: Option<String>,
    #[serde(default)]
    pub tip_minor: Money,
    #[serde(default)]
    pub pickup_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Web Payments SDK token; optional because a fully discounted order
    /// never charges a card.
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutReceipt {
    pub order_ref: String,
    pub payment_ref: String,
    pub final_amount: Money,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("invalid checkout request: {0}")]
    Validation(&'static str),
    #[error(transparent)]
    Redemption(#[from] RedemptionError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub fn cart_subtotal(items: &[CartItem]) -> Money {
    items.iter().map(CartItem::line_total).sum()
}

/// Line items must price to something chargeable before the gateway ever
/// sees them: no zero quantities, no non-positive unit prices, no negative
/// modifiers that could drive the subtotal (and the discount cap) negative.
pub fn validate_items(items: &[CartItem]) -> Result<(), CheckoutError> {
    if items.is_empty() {
        return Err(CheckoutError::Validation("no items in order"));
    }
    for item in items {
        if item.quantity == 0 {
            return Err(CheckoutError::Validation("item quantity must be at least 1"));
        }
        if item.unit_price_minor <= Money::ZERO {
            return Err(CheckoutError::Validation("item price must be positive"));
        }
        if item.modifiers.iter().any(|m| m.price_minor.is_negative()) {
            return Err(CheckoutError::Validation("modifier price must not be negative"));
        }
    }
    Ok(())
}

pub fn order_note(pickup_time: Option<&str>, notes: Option<&str>) -> Option<String> {
    match (pickup_time, notes) {
        (Some(pickup), Some(notes)) => Some(format!("Pickup {pickup} | {notes}")),
        (Some(pickup), None) => Some(format!("Pickup {pickup}")),
        (None, Some(notes)) => Some(notes.to_string()),
        (None, None) => None,
    }
}

/// Synthetic completed payment for orders fully covered by a discount; no
/// tokenization or charge happens for these.
pub fn zero_dollar_payment(order_id: &str) -> ExternalPayment {
    ExternalPayment {
        id: format!("ZERO_DOLLAR_{order_id}"),
        status: "COMPLETED".into(),
        amount_minor: Money::ZERO,
        order_id: order_id.to_string(),
    }
}

/// Full checkout: price the cart, apply the coupon, create the external
/// order, charge the platform-confirmed total, then mark the code used.
///
/// The platform recomputes tax and rounding, so the amount we charge is
/// always the order's own total, never our local figure. Payment failure
/// leaves the code PENDING and the debit in place; the code stays usable
/// until it expires.
pub async fn checkout(
    db: &PgPool,
    gateway: &dyn PaymentGateway,
    catalog: &RewardCatalog,
    req: &CheckoutRequest,
) -> Result<CheckoutReceipt, CheckoutError> {
    validate_items(&req.items)?;
    if req.tip_minor.is_negative() {
        return Err(CheckoutError::Validation("tip must not be negative"));
    }

    let subtotal = cart_subtotal(&req.items);

    let mut discount = None;
    let mut applied_code = None;
    if let Some(code) = req.applied_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        let coupon = redemption::validate_code(db, catalog, code).await?;
        let amount = coupon.discount.discount_cents(subtotal);
        discount = Some(OrderDiscount {
            name: coupon.code.clone(),
            amount_minor: amount,
        });
        applied_code = Some(coupon.code);
    }

    let idempotency_key = req
        .idempotency_key
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let order_req = OrderRequest {
        items: req.items.clone(),
        discount,
        tip_minor: req.tip_minor,
        reference_id: applied_code.clone(),
        note: order_note(req.pickup_time.as_deref(), req.notes.as_deref()),
        idempotency_key: idempotency_key.clone(),
    };

    let order = gateway.create_order(&order_req).await?;
    let charge = order.total_minor;

    let payment = if charge.is_zero() {
        zero_dollar_payment(&order.id)
    } else {
        let source_id = req
            .source_id
            .as_deref()
            .ok_or(CheckoutError::Validation("missing source_id for non-zero payment"))?;
        gateway
            .create_payment(&order.id, charge, source_id, &format!("{idempotency_key}-pay"))
            .await?
    };

    if let Some(code) = &applied_code {
        // Best effort: the webhook reconciler is the backstop if this loses
        // a race or the request dies here.
        match redemption::mark_used(db, code, None, Some(&payment.id), Some(&order.id), None).await {
            Ok(_) => info!(code, order_id = %order.id, "marked reward code used"),
            Err(err) => warn!(error = %err, code, order_id = %order.id, "failed to mark reward code used"),
        }
    }

    Ok(CheckoutReceipt {
        order_ref: order.id,
        payment_ref: payment.id,
        final_amount: charge,
    })
}
