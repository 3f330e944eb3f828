//! Database module for the relay
//!
//! Provides persistence for session documents, accounts, purchases, the call
//! log and the conversation transcript.

mod schema;

pub use schema::*;

use crate::state_machine::Session;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Charge already recorded: {0}")]
    DuplicateCharge(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    pub fn get_session(&self, user_id: &str) -> DbResult<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM sessions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Write a session document unless a newer revision is already stored.
    /// Returns whether the write landed.
    pub fn put_session(&self, session: &Session) -> DbResult<bool> {
        let doc = serde_json::to_string(session)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO sessions (user_id, document, revision, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                document = excluded.document,
                revision = excluded.revision,
                updated_at = excluded.updated_at
             WHERE excluded.revision >= sessions.revision",
            params![
                session.user_id,
                doc,
                to_sql_int(session.revision),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete durable session documents not written since `older_than`
    pub fn prune_sessions(&self, older_than: DateTime<Utc>) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM sessions WHERE updated_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(removed)
    }

    // ==================== Account Operations ====================

    /// Create the account with `welcome_bonus` gems on first contact.
    /// Returns the account and whether it was just created.
    pub fn ensure_account(&self, user_id: &str, welcome_bonus: u64) -> DbResult<(Account, bool)> {
        let created = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO accounts (user_id, balance, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, to_sql_int(welcome_bonus), Utc::now().to_rfc3339()],
            )? > 0
        };
        Ok((self.get_account(user_id)?, created))
    }

    pub fn get_account(&self, user_id: &str) -> DbResult<Account> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, balance, reservation_snapshot, display_name, turns_today, turn_day,
                    subscription_tier, subscription_expires_at, created_at
             FROM accounts WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(Account {
                    user_id: row.get(0)?,
                    balance: from_sql_int(row.get(1)?),
                    reservation_snapshot: row.get::<_, Option<i64>>(2)?.map(from_sql_int),
                    display_name: row.get(3)?,
                    turns_today: u32::try_from(row.get::<_, i64>(4)?).unwrap_or(u32::MAX),
                    turn_day: row.get(5)?,
                    subscription_tier: row.get(6)?,
                    subscription_expires_at: row
                        .get::<_, Option<String>>(7)?
                        .map(|s| parse_datetime(&s)),
                    created_at: parse_datetime(&row.get::<_, String>(8)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::AccountNotFound(user_id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    pub fn get_balance(&self, user_id: &str) -> DbResult<u64> {
        let conn = self.conn.lock().unwrap();
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM accounts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        balance
            .map(from_sql_int)
            .ok_or_else(|| DbError::AccountNotFound(user_id.to_string()))
    }

    pub fn update_balance(&self, user_id: &str, new_balance: u64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE accounts SET balance = ?2 WHERE user_id = ?1",
            params![user_id, to_sql_int(new_balance)],
        )?;
        if changed == 0 {
            return Err(DbError::AccountNotFound(user_id.to_string()));
        }
        Ok(())
    }

    pub fn get_reservation(&self, user_id: &str) -> DbResult<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let snapshot: Option<Option<i64>> = conn
            .query_row(
                "SELECT reservation_snapshot FROM accounts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(snapshot.flatten().map(from_sql_int))
    }

    pub fn set_reservation(&self, user_id: &str, snapshot: Option<u64>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET reservation_snapshot = ?2 WHERE user_id = ?1",
            params![user_id, snapshot.map(to_sql_int)],
        )?;
        Ok(())
    }

    /// Consume one turn of today's quota in a single statement.
    /// Returns false, without consuming anything, once the quota is used up.
    pub fn try_consume_daily_turn(&self, user_id: &str, quota: u32, today: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE accounts SET
                turns_today = CASE WHEN turn_day = ?2 THEN turns_today + 1 ELSE 1 END,
                turn_day = ?2
             WHERE user_id = ?1 AND (turn_day IS NOT ?2 OR turns_today < ?3) AND ?3 > 0",
            params![user_id, today, quota],
        )?;
        Ok(changed > 0)
    }

    pub fn set_display_name(&self, user_id: &str, name: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET display_name = ?2 WHERE user_id = ?1",
            params![user_id, name],
        )?;
        Ok(())
    }

    pub fn grant_subscription(
        &self,
        user_id: &str,
        tier: &str,
        until: DateTime<Utc>,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET subscription_tier = ?2, subscription_expires_at = ?3
             WHERE user_id = ?1",
            params![user_id, tier, until.to_rfc3339()],
        )?;
        Ok(())
    }

    // ==================== Purchase Operations ====================

    pub fn has_processed(&self, charge_id: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM purchases WHERE charge_id = ?1",
                params![charge_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert the purchase row. The primary key on `charge_id` rejects a second
    /// application of the same charge with `DbError::DuplicateCharge`.
    pub fn record_purchase(
        &self,
        charge_id: &str,
        user_id: &str,
        product: &str,
        gems: u64,
        status: PurchaseStatus,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO purchases (charge_id, user_id, product, gems, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                charge_id,
                user_id,
                product,
                to_sql_int(gems),
                status.as_str(),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                DbError::DuplicateCharge(charge_id.to_string())
            }
            other => DbError::Sqlite(other),
        })?;
        Ok(())
    }

    pub fn mark_processed(&self, charge_id: &str, status: PurchaseStatus) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE purchases SET status = ?2 WHERE charge_id = ?1",
            params![charge_id, status.as_str()],
        )?;
        Ok(())
    }

    // ==================== Call Log ====================

    pub fn record_call_start(
        &self,
        call_id: &str,
        user_id: &str,
        agent_id: &str,
        phone_number: &str,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO calls
                 (call_id, user_id, agent_id, phone_number, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active')",
            params![call_id, user_id, agent_id, phone_number, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn finish_call(
        &self,
        call_id: &str,
        duration_secs: u64,
        cost: u64,
        status: &str,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE calls SET ended_at = ?2, duration_secs = ?3, cost = ?4, status = ?5
             WHERE call_id = ?1",
            params![
                call_id,
                Utc::now().to_rfc3339(),
                to_sql_int(duration_secs),
                to_sql_int(cost),
                status
            ],
        )?;
        Ok(())
    }

    #[allow(dead_code)] // Used in tests
    pub fn get_call(&self, call_id: &str) -> DbResult<Option<CallRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT call_id, user_id, agent_id, phone_number, started_at, ended_at,
                    duration_secs, cost, status
             FROM calls WHERE call_id = ?1",
            params![call_id],
            |row| {
                Ok(CallRecord {
                    call_id: row.get(0)?,
                    user_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    phone_number: row.get(3)?,
                    started_at: parse_datetime(&row.get::<_, String>(4)?),
                    ended_at: row.get::<_, Option<String>>(5)?.map(|s| parse_datetime(&s)),
                    duration_secs: row.get::<_, Option<i64>>(6)?.map(from_sql_int),
                    cost: row.get::<_, Option<i64>>(7)?.map(from_sql_int),
                    status: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    // ==================== Conversation Log ====================

    pub fn log_turn(
        &self,
        user_id: &str,
        persona_id: Option<&str>,
        role: &str,
        text: &str,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_log (user_id, persona_id, role, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, persona_id, role, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    #[allow(dead_code)] // Used in tests
    pub fn count_logged_turns(&self, user_id: &str) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversation_log WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_int(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}
