use common_money::Money;
use serde::{Deserialize, Serialize};
use std::env;

/// Discount a reward translates into at checkout. Amounts are minor units;
/// percentages are whole percent (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "discount_type", content = "discount_value", rename_all = "snake_case")]
pub enum Discount {
    Amount(i64),
    Percent(i64),
}

impl Discount {
    /// Discount in cents for the given subtotal, capped so it can never push
    /// the order negative.
    pub fn discount_cents(&self, subtotal: Money) -> Money {
        let raw = match *self {
            Discount::Amount(cents) => Money::from_cents(cents),
            Discount::Percent(pct) => subtotal.percent(pct),
        };
        raw.clamp_non_negative().min(subtotal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardDefinition {
    pub reward_key: String,
    pub points_cost: i64,
    pub name: String,
    #[serde(flatten)]
    pub discount: Discount,
}

/// Static reward-key -> cost/discount mapping. The ladder below ships as the
/// default; deployments finalize it through `REWARD_CATALOG_JSON`.
#[derive(Debug, Clone)]
pub struct RewardCatalog {
    rewards: Vec<RewardDefinition>,
}

fn tier(reward_key: &str, points_cost: i64, name: &str, discount: Discount) -> RewardDefinition {
    RewardDefinition {
        reward_key: reward_key.to_string(),
        points_cost,
        name: name.to_string(),
        discount,
    }
}

impl RewardCatalog {
    pub fn builtin() -> Self {
        let rewards = vec![
            tier("ESPRESSO_2OZ", 50, "2oz Espresso", Discount::Amount(200)),
            tier("BREWED_COFFEE", 100, "Brewed Coffee", Discount::Amount(300)),
            tier("BAKERY", 150, "Bakery Item", Discount::Amount(400)),
            tier("LATTE", 200, "Latte/Specialty", Discount::Amount(550)),
            tier("COFFEE_BAGEL", 300, "Coffee + Bagel", Discount::Amount(800)),
            tier("DRINK_PASTRY", 400, "Drink + Pastry Combo", Discount::Amount(1100)),
            tier("MERCH_15_OFF", 700, "Merch Discount", Discount::Percent(15)),
            tier("ULTIMATE_LATTE", 800, "Ultimate: Free Latte", Discount::Amount(1200)),
        ];
        RewardCatalog { rewards }
    }

    /// Builtin ladder unless `REWARD_CATALOG_JSON` replaces it wholesale.
    /// A malformed override is rejected rather than silently ignored.
    pub fn from_env() -> anyhow::Result<Self> {
        match env::var("REWARD_CATALOG_JSON") {
            Ok(raw) => {
                let rewards: Vec<RewardDefinition> = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid REWARD_CATALOG_JSON: {e}"))?;
                if rewards.is_empty() {
                    anyhow::bail!("REWARD_CATALOG_JSON must define at least one reward");
                }
                Ok(RewardCatalog { rewards })
            }
            Err(_) => Ok(Self::builtin()),
        }
    }

    pub fn resolve(&self, reward_key: &str) -> Option<&RewardDefinition> {
        self.rewards.iter().find(|r| r.reward_key == reward_key)
    }

    pub fn rewards(&self) -> &[RewardDefinition] {
        &self.rewards
    }
}
