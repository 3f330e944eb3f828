//! Database schema and row types

use chrono::{DateTime, Utc};
use serde::Serialize;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    user_id TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    revision INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

CREATE TABLE IF NOT EXISTS accounts (
    user_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    reservation_snapshot INTEGER,
    display_name TEXT,
    turns_today INTEGER NOT NULL DEFAULT 0,
    turn_day TEXT,
    subscription_tier TEXT,
    subscription_expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS purchases (
    charge_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    product TEXT NOT NULL,
    gems INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_purchases_user ON purchases(user_id);

CREATE TABLE IF NOT EXISTS calls (
    call_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    phone_number TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_secs INTEGER,
    cost INTEGER,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    persona_id TEXT,
    role TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversation_log_user ON conversation_log(user_id, id);
";

/// Per-user account row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub user_id: String,
    pub balance: u64,
    pub reservation_snapshot: Option<u64>,
    pub display_name: Option<String>,
    pub turns_today: u32,
    pub turn_day: Option<String>,
    pub subscription_tier: Option<String>,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Whether an unexpired subscription is attached
    pub fn is_subscribed(&self, now: DateTime<Utc>) -> bool {
        self.subscription_expires_at.is_some_and(|until| until > now)
    }
}

/// Status of an applied purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Applied,
    Rejected,
}

impl PurchaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseStatus::Applied => "applied",
            PurchaseStatus::Rejected => "rejected",
        }
    }
}

/// Row of the call log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub call_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub phone_number: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub cost: Option<u64>,
    pub status: String,
}
