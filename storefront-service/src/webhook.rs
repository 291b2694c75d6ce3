use crate::gateway::ExternalOrder;
use crate::ledger;
use crate::redemption;
use crate::{AppState, WEBHOOK_EVENTS_TOTAL};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";
const METADATA_CODE_KEY: &str = "loyalty_code";
const METADATA_ACCOUNT_KEY: &str = "account_id";

/// Square signs base64(HMAC-SHA256(key, notification_url + raw_body)).
/// This check is the only authentication on the channel, so the compare is
/// constant-time.
pub fn verify_signature(
    signature_key: &str,
    notification_url: &str,
    body: &[u8],
    provided: &str,
) -> bool {
    if signature_key.is_empty() || provided.is_empty() {
        return false;
    }
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(signature_key.as_bytes()) else {
        return false;
    };
    mac.update(notification_url.as_bytes());
    mac.update(body);
    let expected = BASE64.encode(mac.finalize().into_bytes());
    ConstantTimeEq::ct_eq(expected.as_bytes(), provided.as_bytes()).into()
}

#[derive(Deserialize)]
struct SquareEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    data: Option<EventData>,
}

#[derive(Deserialize)]
struct EventData {
    object: Option<EventObject>,
}

#[derive(Deserialize)]
struct EventObject {
    payment: Option<WebhookPayment>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayment {
    pub id: String,
    pub status: Option<String>,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
}

/// The payment from a `payment.updated` event, but only once COMPLETED.
/// Anything else (other event types, earlier statuses, junk) is `None`.
pub fn parse_completed_payment(body: &[u8]) -> Option<WebhookPayment> {
    let event: SquareEvent = serde_json::from_slice(body).ok()?;
    if event.event_type.as_deref() != Some("payment.updated") {
        return None;
    }
    let payment = event.data?.object?.payment?;
    if payment.status.as_deref() != Some("COMPLETED") {
        return None;
    }
    Some(payment)
}

/// Correlation candidates for the reward code, in lookup order: explicit
/// order metadata, the order reference id, then discount names.
pub fn candidate_codes(order: &ExternalOrder) -> Vec<String> {
    let mut seen = Vec::new();
    let mut push = |raw: &str| {
        let code = raw.trim();
        if !code.is_empty() && !seen.iter().any(|c| c == code) {
            seen.push(code.to_string());
        }
    };
    if let Some(code) = order.metadata.get(METADATA_CODE_KEY) {
        push(code);
    }
    if let Some(reference_id) = &order.reference_id {
        push(reference_id);
    }
    for name in &order.discount_names {
        push(name);
    }
    seen
}

fn earn_points(subtotal_cents: i64) -> i64 {
    // 1 point per dollar spent.
    subtotal_cents / 100
}

fn resolve_account(order: &ExternalOrder, payment: &WebhookPayment) -> Option<Uuid> {
    if let Some(id) = order.metadata.get(METADATA_ACCOUNT_KEY) {
        if let Ok(parsed) = Uuid::parse_str(id.trim()) {
            return Some(parsed);
        }
    }
    payment
        .customer_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Inbound payment-completed reconciliation. After the signature check
/// passes, every sub-step failure is logged and swallowed: the platform
/// always gets 200 so it does not retry-storm, and `mark_used` plus the
/// payment-id dedupe make double delivery harmless.
pub async fn handle_square_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(
        &state.config.webhook.signature_key,
        &state.config.webhook.notification_url,
        &body,
        provided,
    ) {
        warn!("webhook signature mismatch");
        WEBHOOK_EVENTS_TOTAL.with_label_values(&["signature_rejected"]).inc();
        return StatusCode::UNAUTHORIZED;
    }

    let Some(payment) = parse_completed_payment(&body) else {
        WEBHOOK_EVENTS_TOTAL.with_label_values(&["ignored"]).inc();
        return StatusCode::OK;
    };
    let Some(order_id) = payment.order_id.clone() else {
        WEBHOOK_EVENTS_TOTAL.with_label_values(&["ignored"]).inc();
        return StatusCode::OK;
    };

    let order = match state.gateway.retrieve_order(&order_id).await {
        Ok(order) => order,
        Err(err) => {
            warn!(error = %err, order_id, "webhook could not retrieve order");
            WEBHOOK_EVENTS_TOTAL.with_label_values(&["order_lookup_failed"]).inc();
            return StatusCode::OK;
        }
    };

    let points = earn_points(order.subtotal_minor.cents());
    if points > 0 {
        match resolve_account(&order, &payment) {
            Some(account_id) => {
                match ledger::append_earn_once(&state.db, account_id, points, &order_id, &payment.id)
                    .await
                {
                    Ok(Some(_)) => {
                        info!(%account_id, points, order_id, "awarded earn points");
                    }
                    Ok(None) => {
                        info!(%account_id, order_id, payment_id = %payment.id, "earn already credited for payment");
                    }
                    Err(err) => {
                        warn!(error = %err, %account_id, order_id, "failed to award earn points");
                    }
                }
            }
            None => {
                warn!(order_id, payment_id = %payment.id, "no loyalty account resolved, skipping earn award");
            }
        }
    }

    let candidates = candidate_codes(&order);
    match redemption::find_pending_by_candidates(&state.db, &candidates).await {
        Ok(Some(row)) => {
            match redemption::mark_used(
                &state.db,
                &row.code,
                Some(row.account_id),
                Some(&payment.id),
                Some(&order_id),
                None,
            )
            .await
            {
                Ok(_) => info!(code = %row.code, order_id, "webhook marked reward code used"),
                Err(err) => {
                    // Conflict here usually means checkout already won the race.
                    info!(error = %err, code = %row.code, order_id, "webhook mark-used skipped");
                }
            }
        }
        Ok(None) => {
            if !candidates.is_empty() {
                info!(?candidates, order_id, "no matching pending reward for webhook candidates");
            }
        }
        Err(err) => warn!(error = %err, order_id, "webhook reward lookup failed"),
    }

    WEBHOOK_EVENTS_TOTAL.with_label_values(&["reconciled"]).inc();
    StatusCode::OK
}
