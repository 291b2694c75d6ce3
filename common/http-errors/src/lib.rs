use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub ok: bool,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// HTTP-facing error taxonomy for the storefront. Every variant maps to a
/// distinct status so the client can render precise messaging; nothing here
/// collapses to a generic 500 except `Internal` itself.
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    UnknownReward { reward_key: String, trace_id: Option<Uuid> },
    InsufficientPoints { needed: i64, balance: i64, trace_id: Option<Uuid> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    AlreadyRedeemed { trace_id: Option<Uuid> },
    Expired { trace_id: Option<Uuid> },
    Conflict { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    Gateway { trace_id: Option<Uuid>, message: Option<String> },
    SignatureInvalid { trace_id: Option<Uuid> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self {
        Self::Internal { trace_id, message: Some(e.to_string()) }
    }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self {
        Self::BadRequest { code, trace_id, message: None }
    }
    pub fn gateway<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self {
        Self::Gateway { trace_id, message: Some(e.to_string()) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { ok: false, code: code.into(), trace_id, message },
                code,
            ),
            ApiError::UnknownReward { reward_key, trace_id } => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    ok: false,
                    code: "unknown_reward".into(),
                    trace_id,
                    message: Some(format!("Unknown reward key: {reward_key}")),
                },
                "unknown_reward",
            ),
            ApiError::InsufficientPoints { needed, balance, trace_id } => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    ok: false,
                    code: "insufficient_points".into(),
                    trace_id,
                    message: Some(format!("Not enough points. Need {needed}, have {balance}")),
                },
                "insufficient_points",
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                ErrorBody { ok: false, code: code.into(), trace_id, message: None },
                code,
            ),
            ApiError::AlreadyRedeemed { trace_id } => (
                StatusCode::CONFLICT,
                ErrorBody {
                    ok: false,
                    code: "already_redeemed".into(),
                    trace_id,
                    message: Some("Coupon already redeemed".into()),
                },
                "already_redeemed",
            ),
            ApiError::Expired { trace_id } => (
                StatusCode::GONE,
                ErrorBody {
                    ok: false,
                    code: "expired".into(),
                    trace_id,
                    message: Some("Coupon expired".into()),
                },
                "expired",
            ),
            ApiError::Conflict { code, trace_id, message } => (
                StatusCode::CONFLICT,
                ErrorBody { ok: false, code: code.into(), trace_id, message },
                code,
            ),
            ApiError::Gateway { trace_id, message } => (
                StatusCode::BAD_GATEWAY,
                ErrorBody { ok: false, code: "gateway_error".into(), trace_id, message },
                "gateway_error",
            ),
            ApiError::SignatureInvalid { trace_id } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody { ok: false, code: "signature_invalid".into(), trace_id, message: None },
                "signature_invalid",
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { ok: false, code: "internal_error".into(), trace_id, message },
                "internal_error",
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
