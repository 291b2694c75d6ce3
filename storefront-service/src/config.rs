use anyhow::{Context, Result};
use std::env;

const SANDBOX_BASE_URL: &str = "https://connect.squareupsandbox.com";
const PRODUCTION_BASE_URL: &str = "https://connect.squareup.com";

#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub base_url: String,
    pub access_token: String,
    pub location_id: String,
    pub timeout_secs: u64,
}

impl SquareConfig {
    pub fn from_env() -> Result<Self> {
        let env_name = env::var("SQUARE_ENV").unwrap_or_else(|_| "sandbox".to_string());
        let base_url = env::var("SQUARE_BASE_URL").unwrap_or_else(|_| {
            if env_name.eq_ignore_ascii_case("production") {
                PRODUCTION_BASE_URL.to_string()
            } else {
                SANDBOX_BASE_URL.to_string()
            }
        });
        let access_token =
            env::var("SQUARE_ACCESS_TOKEN").context("SQUARE_ACCESS_TOKEN must be set")?;
        let location_id =
            env::var("SQUARE_LOCATION_ID").context("SQUARE_LOCATION_ID must be set")?;
        let timeout_secs = env::var("SQUARE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(10)
            .max(1);
        Ok(SquareConfig {
            base_url,
            access_token,
            location_id,
            timeout_secs,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared secret Square signs notifications with.
    pub signature_key: String,
    /// Exact URL Square signed over; must match the registered subscription.
    pub notification_url: String,
}

impl WebhookConfig {
    pub fn from_env() -> Result<Self> {
        let signature_key = env::var("SQUARE_WEBHOOK_SIGNATURE_KEY")
            .context("SQUARE_WEBHOOK_SIGNATURE_KEY must be set")?;
        let site_url = env::var("SITE_URL").context("SITE_URL must be set")?;
        let notification_url = env::var("SQUARE_WEBHOOK_URL")
            .unwrap_or_else(|_| format!("{}/webhooks/square", site_url.trim_end_matches('/')));
        Ok(WebhookConfig {
            signature_key,
            notification_url,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub square: SquareConfig,
    pub webhook: WebhookConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(AppConfig {
            square: SquareConfig::from_env()?,
            webhook: WebhookConfig::from_env()?,
        })
    }
}
