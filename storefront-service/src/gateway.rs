use crate::config::SquareConfig;
use common_money::Money;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartModifier {
    pub name: String,
    pub price_minor: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price_minor: Money,
    #[serde(default)]
    pub modifiers: Vec<CartModifier>,
}

impl CartItem {
    /// Line total: (base + modifiers) x quantity.
    pub fn line_total(&self) -> Money {
        let per_unit = self.unit_price_minor
            + self.modifiers.iter().map(|m| m.price_minor).sum::<Money>();
        Money::from_cents(per_unit.cents() * i64::from(self.quantity))
    }
}

/// Order-level fixed discount, already capped by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDiscount {
    pub name: String,
    pub amount_minor: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub items: Vec<CartItem>,
    pub discount: Option<OrderDiscount>,
    pub tip_minor: Money,
    pub reference_id: Option<String>,
    pub note: Option<String>,
    pub idempotency_key: String,
}

/// Platform-owned order; we hold its id and the totals the platform
/// recomputed. Those totals are authoritative, not our local math.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalOrder {
    pub id: String,
    pub total_minor: Money,
    pub subtotal_minor: Money,
    pub reference_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub discount_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalPayment {
    pub id: String,
    pub status: String,
    pub amount_minor: Money,
    pub order_id: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("gateway response missing {0}")]
    MalformedResponse(&'static str),
}

#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, req: &OrderRequest) -> Result<ExternalOrder, GatewayError>;
    async fn create_payment(
        &self,
        order_id: &str,
        amount: Money,
        source_id: &str,
        idempotency_key: &str,
    ) -> Result<ExternalPayment, GatewayError>;
    async fn retrieve_order(&self, order_id: &str) -> Result<ExternalOrder, GatewayError>;
}

// --- Square wire shapes (response side) ---

#[derive(Deserialize)]
struct MoneyJson {
    amount: Option<i64>,
}

#[derive(Deserialize)]
struct NetAmountsJson {
    subtotal_money: Option<MoneyJson>,
}

#[derive(Deserialize)]
struct DiscountJson {
    name: Option<String>,
}

#[derive(Deserialize)]
struct OrderJson {
    id: String,
    reference_id: Option<String>,
    metadata: Option<HashMap<String, String>>,
    total_money: Option<MoneyJson>,
    net_amounts: Option<NetAmountsJson>,
    discounts: Option<Vec<DiscountJson>>,
}

#[derive(Deserialize)]
struct OrderEnvelope {
    order: Option<OrderJson>,
}

#[derive(Deserialize)]
struct PaymentJson {
    id: String,
    status: Option<String>,
    order_id: Option<String>,
    amount_money: Option<MoneyJson>,
}

#[derive(Deserialize)]
struct PaymentEnvelope {
    payment: Option<PaymentJson>,
}

impl From<OrderJson> for ExternalOrder {
    fn from(o: OrderJson) -> Self {
        ExternalOrder {
            id: o.id,
            total_minor: Money::from_cents(o.total_money.and_then(|m| m.amount).unwrap_or(0)),
            subtotal_minor: Money::from_cents(
                o.net_amounts
                    .and_then(|n| n.subtotal_money)
                    .and_then(|m| m.amount)
                    .unwrap_or(0),
            ),
            reference_id: o.reference_id,
            metadata: o.metadata.unwrap_or_default(),
            discount_names: o
                .discounts
                .unwrap_or_default()
                .into_iter()
                .filter_map(|d| d.name)
                .collect(),
        }
    }
}

/// Square Orders/Payments client. Calls carry a bounded timeout; a timed-out
/// call is treated as failed and left for the webhook to reconcile.
pub struct SquareGateway {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    location_id: String,
}

impl SquareGateway {
    pub fn new(config: &SquareConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(SquareGateway {
            client,
            base_url: config.base_url.clone(),
            access_token: config.access_token.clone(),
            location_id: config.location_id.clone(),
        })
    }

    fn order_body(&self, req: &OrderRequest) -> serde_json::Value {
        let line_items: Vec<serde_json::Value> = req
            .items
            .iter()
            .map(|item| {
                json!({
                    "name": item.name,
                    "quantity": item.quantity.to_string(),
                    "base_price_money": { "amount": item.unit_price_minor.cents(), "currency": "USD" },
                    "modifiers": item.modifiers.iter().map(|m| json!({
                        "name": m.name,
                        "base_price_money": { "amount": m.price_minor.cents(), "currency": "USD" },
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut order = json!({
            "location_id": self.location_id,
            "line_items": line_items,
            "source": { "name": "Cafe Storefront Checkout" },
        });
        if req.tip_minor > Money::ZERO {
            order["service_charges"] = json!([{
                "name": "Tip",
                "amount_money": { "amount": req.tip_minor.cents(), "currency": "USD" },
                "calculation_phase": "TOTAL_PHASE",
            }]);
        }
        if let Some(discount) = &req.discount {
            order["discounts"] = json!([{
                "name": discount.name,
                "amount_money": { "amount": discount.amount_minor.cents(), "currency": "USD" },
                "scope": "ORDER",
            }]);
        }
        if let Some(reference_id) = &req.reference_id {
            order["reference_id"] = json!(reference_id);
            order["metadata"] = json!({ "loyalty_code": reference_id });
        }
        if let Some(note) = &req.note {
            order["note"] = json!(note);
        }

        json!({ "idempotency_key": req.idempotency_key, "order": order })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl PaymentGateway for SquareGateway {
    async fn create_order(&self, req: &OrderRequest) -> Result<ExternalOrder, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/v2/orders", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&self.order_body(req))
            .send()
            .await?;
        let envelope: OrderEnvelope = Self::read_json(resp).await?;
        let order = envelope
            .order
            .ok_or(GatewayError::MalformedResponse("order"))?;
        Ok(order.into())
    }

    async fn create_payment(
        &self,
        order_id: &str,
        amount: Money,
        source_id: &str,
        idempotency_key: &str,
    ) -> Result<ExternalPayment, GatewayError> {
        let body = json!({
            "source_id": source_id,
            "idempotency_key": idempotency_key,
            "order_id": order_id,
            "location_id": self.location_id,
            "amount_money": { "amount": amount.cents(), "currency": "USD" },
        });
        let resp = self
            .client
            .post(format!("{}/v2/payments", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        let envelope: PaymentEnvelope = Self::read_json(resp).await?;
        let payment = envelope
            .payment
            .ok_or(GatewayError::MalformedResponse("payment"))?;
        Ok(ExternalPayment {
            id: payment.id,
            status: payment.status.unwrap_or_default(),
            amount_minor: Money::from_cents(payment.amount_money.and_then(|m| m.amount).unwrap_or(0)),
            order_id: payment.order_id.unwrap_or_else(|| order_id.to_string()),
        })
    }

    async fn retrieve_order(&self, order_id: &str) -> Result<ExternalOrder, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/v2/orders/{order_id}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let envelope: OrderEnvelope = Self::read_json(resp).await?;
        let order = envelope
            .order
            .ok_or(GatewayError::MalformedResponse("order"))?;
        Ok(order.into())
    }
}

/// In-memory gateway for tests: records requests and answers with a
/// configurable platform total so tests can make it disagree with the local
/// subtotal.
pub struct StubGateway {
    pub total_override: Option<Money>,
    pub fail_payments: bool,
    pub stored_orders: std::sync::Mutex<HashMap<String, ExternalOrder>>,
    pub order_requests: std::sync::Mutex<Vec<OrderRequest>>,
    pub payment_requests: std::sync::Mutex<Vec<(String, Money, String)>>,
}

impl StubGateway {
    pub fn new() -> Self {
        StubGateway {
            total_override: None,
            fail_payments: false,
            stored_orders: std::sync::Mutex::new(HashMap::new()),
            order_requests: std::sync::Mutex::new(Vec::new()),
            payment_requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_total(total: Money) -> Self {
        StubGateway {
            total_override: Some(total),
            ..Self::new()
        }
    }

    pub fn with_order(self, order: ExternalOrder) -> Self {
        self.stored_orders
            .lock()
            .unwrap()
            .insert(order.id.clone(), order);
        self
    }
}

impl Default for StubGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PaymentGateway for StubGateway {
    async fn create_order(&self, req: &OrderRequest) -> Result<ExternalOrder, GatewayError> {
        let subtotal: Money = req.items.iter().map(CartItem::line_total).sum();
        let discount = req
            .discount
            .as_ref()
            .map(|d| d.amount_minor)
            .unwrap_or(Money::ZERO);
        let total = self
            .total_override
            .unwrap_or((subtotal - discount + req.tip_minor).clamp_non_negative());
        let order = ExternalOrder {
            id: format!("stub-order-{}", req.idempotency_key),
            total_minor: total,
            subtotal_minor: subtotal,
            reference_id: req.reference_id.clone(),
            metadata: req
                .reference_id
                .iter()
                .map(|code| ("loyalty_code".to_string(), code.clone()))
                .collect(),
            discount_names: req.discount.iter().map(|d| d.name.clone()).collect(),
        };
        self.stored_orders
            .lock()
            .unwrap()
            .insert(order.id.clone(), order.clone());
        self.order_requests.lock().unwrap().push(req.clone());
        Ok(order)
    }

    async fn create_payment(
        &self,
        order_id: &str,
        amount: Money,
        source_id: &str,
        _idempotency_key: &str,
    ) -> Result<ExternalPayment, GatewayError> {
        if self.fail_payments {
            return Err(GatewayError::Rejected {
                status: 402,
                body: "card declined".into(),
            });
        }
        self.payment_requests.lock().unwrap().push((
            order_id.to_string(),
            amount,
            source_id.to_string(),
        ));
        Ok(ExternalPayment {
            id: format!("stub-payment-{order_id}"),
            status: "COMPLETED".into(),
            amount_minor: amount,
            order_id: order_id.to_string(),
        })
    }

    async fn retrieve_order(&self, order_id: &str) -> Result<ExternalOrder, GatewayError> {
        self.stored_orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or(GatewayError::MalformedResponse("order"))
    }
}
