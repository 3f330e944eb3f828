//! Payment application
//!
//! A charge id is applied at most once: `has_processed` short-circuits known
//! charges, and the unique key on the purchases table settles a race between
//! two deliveries of the same charge.

use crate::db::PurchaseStatus;
use crate::ledger::Ledger;
use crate::runtime::traits::{AccountStore, PaymentValidator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Gem packs: product payload to gems credited
const GEM_PACKS: &[(&str, u64)] = &[
    ("gems_50", 45),
    ("gems_100", 95),
    ("gems_250", 250),
    ("gems_500", 525),
    ("gems_1000", 1100),
    ("gems_2500", 3000),
    ("gems_5000", 6500),
    ("gems_10000", 15000),
];

/// Subscription tiers: product payload to (tier, monthly gems)
const SUBSCRIPTIONS: &[(&str, &str, u64)] = &[
    ("sub_essential", "essential", 450),
    ("sub_plus", "plus", 1200),
    ("sub_premium", "premium", 2500),
];

const SUBSCRIPTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Gems(u64),
    Subscription { tier: &'static str, gems: u64 },
}

impl Product {
    pub fn from_payload(payload: &str) -> Option<Self> {
        if let Some(&(_, gems)) = GEM_PACKS.iter().find(|(p, _)| *p == payload) {
            return Some(Product::Gems(gems));
        }
        SUBSCRIPTIONS
            .iter()
            .find(|(p, _, _)| *p == payload)
            .map(|&(_, tier, gems)| Product::Subscription { tier, gems })
    }

    pub fn gems(self) -> u64 {
        match self {
            Product::Gems(gems) | Product::Subscription { gems, .. } => gems,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Credited {
        gems: u64,
        balance: u64,
    },
    Subscribed {
        tier: String,
        until: DateTime<Utc>,
        gems: u64,
        balance: u64,
    },
    /// Charge already applied; nothing changed
    Duplicate,
    UnknownProduct,
}

pub struct PaymentProcessor {
    payments: Arc<dyn PaymentValidator>,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<Ledger>,
    welcome_bonus: u64,
}

impl PaymentProcessor {
    pub fn new(
        payments: Arc<dyn PaymentValidator>,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<Ledger>,
        welcome_bonus: u64,
    ) -> Self {
        Self {
            payments,
            accounts,
            ledger,
            welcome_bonus,
        }
    }

    pub async fn apply(
        &self,
        charge_id: &str,
        user_id: &str,
        payload: &str,
    ) -> Result<PaymentOutcome, String> {
        if self.payments.has_processed(charge_id).await? {
            tracing::info!(charge_id = %charge_id, "Charge already applied");
            return Ok(PaymentOutcome::Duplicate);
        }

        let Some(product) = Product::from_payload(payload) else {
            tracing::warn!(charge_id = %charge_id, payload = %payload, "Unknown product");
            self.payments
                .record_purchase(charge_id, user_id, payload, 0, PurchaseStatus::Rejected)
                .await?;
            return Ok(PaymentOutcome::UnknownProduct);
        };

        self.accounts
            .ensure_account(user_id, self.welcome_bonus)
            .await?;

        // Claim the charge id before crediting
        let claimed = self
            .payments
            .record_purchase(charge_id, user_id, payload, product.gems(), PurchaseStatus::Applied)
            .await?;
        if !claimed {
            tracing::info!(charge_id = %charge_id, "Charge applied concurrently");
            return Ok(PaymentOutcome::Duplicate);
        }

        let balance = match self.ledger.credit(user_id, product.gems()).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(charge_id = %charge_id, error = %e, "Failed to credit purchase");
                self.payments
                    .mark_processed(charge_id, PurchaseStatus::Rejected)
                    .await?;
                return Err(e.to_string());
            }
        };

        let outcome = match product {
            Product::Gems(gems) => PaymentOutcome::Credited { gems, balance },
            Product::Subscription { tier, gems } => {
                let until = self.extended_until(user_id).await;
                self.accounts.grant_subscription(user_id, tier, until).await?;
                PaymentOutcome::Subscribed {
                    tier: tier.to_string(),
                    until,
                    gems,
                    balance,
                }
            }
        };
        tracing::info!(charge_id = %charge_id, user_id = %user_id, ?outcome, "Payment applied");
        Ok(outcome)
    }

    /// Renewals stack on an unexpired subscription
    async fn extended_until(&self, user_id: &str) -> DateTime<Utc> {
        let now = Utc::now();
        let base = match self.accounts.get_account(user_id).await {
            Ok(account) => account
                .subscription_expires_at
                .filter(|until| *until > now)
                .unwrap_or(now),
            Err(_) => now,
        };
        base + chrono::Duration::days(SUBSCRIPTION_DAYS)
    }
}
