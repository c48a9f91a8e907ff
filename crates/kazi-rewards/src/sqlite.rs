//! SQLite-backed settlement store.
//!
//! One connection behind an async mutex. Every batch runs in an IMMEDIATE
//! transaction, so balances read while planning a debit cannot change before
//! the write. Pair uniqueness and the non-negative wallet are also enforced by
//! the schema, which guards writers in other processes.

use crate::storage::{
    amount_to_delta, check_transition, plan_debit, AppliedBatch, BatchOp, RewardLedger,
    SettlementBatch, SettlementStore, StoreError, StoreResult, UserDirectory, WalletChange,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kazi_types::{
    Amount, InvitationCode, Level, ReversalRecord, RewardEvent, RewardEventId, RewardStatus,
    User, UserId,
};
use rusqlite::{
    ffi, params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY,
    invitation_code TEXT UNIQUE,
    level           INTEGER NOT NULL CHECK (level >= 0),
    wallet_balance  INTEGER NOT NULL DEFAULT 0 CHECK (wallet_balance >= 0),
    invited_by      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_users_invited_by ON users (invited_by);

CREATE TABLE IF NOT EXISTS reward_events (
    id            TEXT PRIMARY KEY,
    inviter_id    INTEGER NOT NULL,
    invitee_id    INTEGER NOT NULL,
    invitee_level INTEGER NOT NULL,
    amount        INTEGER NOT NULL CHECK (amount > 0),
    status        TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'reversed')),
    created_at    TEXT NOT NULL,
    processed_at  TEXT,
    UNIQUE (inviter_id, invitee_id)
);
CREATE INDEX IF NOT EXISTS idx_reward_events_inviter ON reward_events (inviter_id, status);

CREATE TABLE IF NOT EXISTS reward_reversals (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT NOT NULL REFERENCES reward_events (id),
    inviter_id  INTEGER NOT NULL,
    actor       TEXT NOT NULL,
    reason      TEXT NOT NULL,
    amount      INTEGER NOT NULL,
    debited     INTEGER NOT NULL,
    shortfall   INTEGER NOT NULL,
    reversed_at TEXT NOT NULL
);
";

const EVENT_COLUMNS: &str =
    "id, inviter_id, invitee_id, invitee_level, amount, status, created_at, processed_at";
const USER_COLUMNS: &str = "id, invitation_code, level, wallet_balance, invited_by";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(backend)?;
        let store = Self::init(conn, busy_timeout)?;
        info!(path = %path.display(), storage_type = "sqlite", "📂 Settlement store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn, Duration::from_secs(5))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> StoreResult<Self> {
        conn.busy_timeout(busy_timeout).map_err(backend)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a user record, or refreshes the code and level of an existing
    /// one. An existing row keeps its wallet balance, which only the ledger
    /// moves, and its referral link, which is set at most once.
    pub async fn upsert_user(&self, user: &User) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        if let Some(existing) = load_user(&conn, user.id)? {
            if let (Some(linked), Some(requested)) = (existing.invited_by, user.invited_by) {
                if linked != requested {
                    return Err(StoreError::AlreadyLinked {
                        invitee: user.id,
                        inviter: linked,
                    });
                }
            }
        }
        conn.execute(
            "INSERT INTO users (id, invitation_code, level, wallet_balance, invited_by)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET
                invitation_code = excluded.invitation_code,
                level = excluded.level,
                invited_by = COALESCE(users.invited_by, excluded.invited_by)",
            params![
                user_key(user.id)?,
                user.invitation_code.as_ref().map(|c| c.as_str()),
                i64::from(user.level.get()),
                amount_to_delta(user.wallet_balance)?,
                user.invited_by.map(user_key).transpose()?,
            ],
        )
        .map_err(write_error)?;
        debug!(user = %user.id, level = %user.level, storage_type = "sqlite", "User stored");
        Ok(())
    }

    /// Returns the previous level.
    pub async fn set_level(&self, id: UserId, level: Level) -> StoreResult<Level> {
        let conn = self.conn.lock().await;
        let previous = load_user(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .level;
        conn.execute(
            "UPDATE users SET level = ?2 WHERE id = ?1",
            params![user_key(id)?, i64::from(level.get())],
        )
        .map_err(write_error)?;
        Ok(previous)
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        let conn = self.conn.lock().await;
        load_user(&conn, id)
    }

    async fn increment_wallet(&self, id: UserId, delta: i64) -> StoreResult<Amount> {
        let amount = Amount::from_base_units(delta.unsigned_abs());
        let batch = if delta >= 0 {
            SettlementBatch::new().credit(id, amount)
        } else {
            SettlementBatch::new().debit(id, amount, false)
        };
        let applied = self.apply(batch).await?;
        applied
            .wallet_change_for(id)
            .map(|c| c.after)
            .ok_or_else(|| StoreError::Backend("wallet change missing from batch".into()))
    }

    async fn get_users_referred_by(&self, inviter: UserId) -> StoreResult<Vec<User>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE invited_by = ?1 ORDER BY id"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![user_key(inviter)?], UserRow::read)
            .map_err(backend)?;
        collect(rows, UserRow::into_user)
    }

    async fn find_by_invitation_code(&self, code: &InvitationCode) -> StoreResult<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE invitation_code = ?1"),
            params![code.as_str()],
            UserRow::read,
        )
        .optional()
        .map_err(backend)?
        .map(UserRow::into_user)
        .transpose()
    }

    async fn set_invited_by(&self, invitee: UserId, inviter: UserId) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE users SET invited_by = ?2 WHERE id = ?1 AND invited_by IS NULL",
                params![user_key(invitee)?, user_key(inviter)?],
            )
            .map_err(write_error)?;
        if updated == 1 {
            return Ok(());
        }
        match load_user(&conn, invitee)? {
            None => Err(StoreError::NotFound(invitee.to_string())),
            Some(user) => Err(StoreError::AlreadyLinked {
                invitee,
                inviter: user.invited_by.unwrap_or(inviter),
            }),
        }
    }

    async fn list_user_ids(&self) -> StoreResult<Vec<UserId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM users ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(backend)?;
        collect(rows, user_from_key)
    }
}

#[async_trait]
impl RewardLedger for SqliteStore {
    async fn find_by_pair(
        &self,
        inviter: UserId,
        invitee: UserId,
    ) -> StoreResult<Option<RewardEvent>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM reward_events WHERE inviter_id = ?1 AND invitee_id = ?2"
            ),
            params![user_key(inviter)?, user_key(invitee)?],
            EventRow::read,
        )
        .optional()
        .map_err(backend)?
        .map(EventRow::into_event)
        .transpose()
    }

    async fn get_event(&self, id: RewardEventId) -> StoreResult<Option<RewardEvent>> {
        let conn = self.conn.lock().await;
        load_event(&conn, id)
    }

    async fn insert(&self, event: RewardEvent) -> StoreResult<RewardEvent> {
        let id = event.id;
        let applied = self.apply(SettlementBatch::new().insert(event)).await?;
        applied
            .event(id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("inserted event missing from batch".into()))
    }

    async fn find_pending_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>> {
        self.query_events(
            "WHERE inviter_id = ?1 AND status = 'pending'",
            Some(inviter),
        )
        .await
    }

    async fn find_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>> {
        self.query_events("WHERE inviter_id = ?1", Some(inviter)).await
    }

    async fn update_status(
        &self,
        id: RewardEventId,
        expected: RewardStatus,
        status: RewardStatus,
        processed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<RewardEvent> {
        let at = processed_at.unwrap_or_else(Utc::now);
        let applied = self
            .apply(SettlementBatch::new().transition(id, expected, status, at))
            .await?;
        applied
            .event(id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("updated event missing from batch".into()))
    }

    async fn list_events(&self) -> StoreResult<Vec<RewardEvent>> {
        self.query_events("", None).await
    }

    async fn list_reversals(&self) -> StoreResult<Vec<ReversalRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, inviter_id, actor, reason, amount, debited, shortfall, reversed_at
                 FROM reward_reversals ORDER BY seq",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(backend)?;
        collect(
            rows,
            |(event_id, inviter, actor, reason, amount, debited, shortfall, at)| {
                Ok(ReversalRecord {
                    event_id: event_from_key(&event_id)?,
                    inviter_id: user_from_key(inviter)?,
                    actor,
                    reason,
                    amount: amount_from_column(amount)?,
                    debited: amount_from_column(debited)?,
                    shortfall: amount_from_column(shortfall)?,
                    reversed_at: parse_time(&at)?,
                })
            },
        )
    }
}

impl SqliteStore {
    async fn query_events(
        &self,
        filter: &str,
        inviter: Option<UserId>,
    ) -> StoreResult<Vec<RewardEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM reward_events {filter} ORDER BY created_at, id"
            ))
            .map_err(backend)?;
        let rows = match inviter {
            Some(inviter) => stmt.query_map(params![user_key(inviter)?], EventRow::read),
            None => stmt.query_map([], EventRow::read),
        }
        .map_err(backend)?;
        collect(rows, EventRow::into_event)
    }
}

#[async_trait]
impl SettlementStore for SqliteStore {
    async fn apply(&self, batch: SettlementBatch) -> StoreResult<AppliedBatch> {
        let mut conn = self.conn.lock().await;
        let op_count = batch.len();

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;
        let mut applied = AppliedBatch::default();
        for op in batch.ops {
            // Dropping `tx` on the error path rolls everything back.
            if let Err(e) = apply_op(&tx, op, &mut applied) {
                debug!(
                    ops = op_count,
                    error = %e,
                    storage_type = "sqlite",
                    "Settlement batch rolled back"
                );
                return Err(e);
            }
        }
        tx.commit().map_err(write_error)?;

        info!(
            ops = op_count,
            wallet_changes = applied.wallet_changes.len(),
            events = applied.events.len(),
            storage_type = "sqlite",
            "💾 Settlement batch committed"
        );
        Ok(applied)
    }
}

fn apply_op(conn: &Connection, op: BatchOp, applied: &mut AppliedBatch) -> StoreResult<()> {
    match op {
        BatchOp::InsertEvent(event) => {
            conn.execute(
                &format!(
                    "INSERT INTO reward_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    event.id.to_hex(),
                    user_key(event.inviter_id)?,
                    user_key(event.invitee_id)?,
                    i64::from(event.invitee_level_at_trigger.get()),
                    amount_to_delta(event.amount)?,
                    event.status.as_str(),
                    format_time(&event.created_at),
                    event.processed_at.as_ref().map(format_time),
                ],
            )
            .map_err(write_error)?;
            applied.events.push(event);
        }
        BatchOp::Transition { id, from, to, at } => {
            let event = set_status(conn, id, from, to, Some(at))?;
            applied.events.push(event);
        }
        BatchOp::Credit { user, amount } => {
            let before = load_balance(conn, user)?;
            let after = before
                .checked_add(amount)
                .filter(|a| amount_to_delta(*a).is_ok())
                .ok_or(StoreError::Overflow(user))?;
            shift_balance(conn, user, amount_to_delta(amount)?)?;
            applied.wallet_changes.push(WalletChange {
                user,
                before,
                after,
                shortfall: Amount::ZERO,
            });
        }
        BatchOp::Debit {
            user,
            amount,
            floor_at_zero,
        } => {
            let before = load_balance(conn, user)?;
            let change = plan_debit(user, before, amount, floor_at_zero)?;
            let taken = change.before.saturating_sub(change.after);
            shift_balance(conn, user, -amount_to_delta(taken)?)?;
            applied.wallet_changes.push(change);
        }
        BatchOp::Reverse {
            id,
            actor,
            reason,
            at,
            floor_at_zero,
        } => {
            let event = load_event(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("reward event {}", id)))?;
            check_transition(&event, RewardStatus::Completed, RewardStatus::Reversed)?;

            let before = load_balance(conn, event.inviter_id)?;
            let change = plan_debit(event.inviter_id, before, event.amount, floor_at_zero)?;
            let taken = change.before.saturating_sub(change.after);
            shift_balance(conn, event.inviter_id, -amount_to_delta(taken)?)?;

            let event = set_status(conn, id, RewardStatus::Completed, RewardStatus::Reversed, None)?;

            let record = ReversalRecord {
                event_id: id,
                inviter_id: event.inviter_id,
                actor,
                reason,
                amount: event.amount,
                debited: taken,
                shortfall: change.shortfall,
                reversed_at: at,
            };
            conn.execute(
                "INSERT INTO reward_reversals
                    (event_id, inviter_id, actor, reason, amount, debited, shortfall, reversed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_hex(),
                    user_key(record.inviter_id)?,
                    record.actor,
                    record.reason,
                    amount_to_delta(record.amount)?,
                    amount_to_delta(record.debited)?,
                    amount_to_delta(record.shortfall)?,
                    format_time(&record.reversed_at),
                ],
            )
            .map_err(write_error)?;

            applied.wallet_changes.push(change);
            applied.events.push(event);
            applied.reversals.push(record);
        }
    }
    Ok(())
}

/// Conditional status update; `processed_at` is only written when given.
fn set_status(
    conn: &Connection,
    id: RewardEventId,
    from: RewardStatus,
    to: RewardStatus,
    processed_at: Option<DateTime<Utc>>,
) -> StoreResult<RewardEvent> {
    let event =
        load_event(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("reward event {}", id)))?;
    check_transition(&event, from, to)?;

    let processed_at = processed_at.filter(|_| to == RewardStatus::Completed);
    let updated = conn
        .execute(
            "UPDATE reward_events
             SET status = ?3, processed_at = COALESCE(?4, processed_at)
             WHERE id = ?1 AND status = ?2",
            params![
                id.to_hex(),
                from.as_str(),
                to.as_str(),
                processed_at.as_ref().map(format_time),
            ],
        )
        .map_err(write_error)?;
    if updated != 1 {
        return Err(StoreError::InvalidTransition {
            event: id,
            expected: from,
            actual: event.status,
        });
    }

    let mut event = event;
    event.status = to;
    if processed_at.is_some() {
        event.processed_at = processed_at;
    }
    Ok(event)
}

fn shift_balance(conn: &Connection, user: UserId, delta: i64) -> StoreResult<()> {
    let updated = conn
        .execute(
            "UPDATE users SET wallet_balance = wallet_balance + ?2 WHERE id = ?1",
            params![user_key(user)?, delta],
        )
        .map_err(write_error)?;
    if updated == 0 {
        return Err(StoreError::NotFound(user.to_string()));
    }
    Ok(())
}

fn load_balance(conn: &Connection, user: UserId) -> StoreResult<Amount> {
    let balance = conn
        .query_row(
            "SELECT wallet_balance FROM users WHERE id = ?1",
            params![user_key(user)?],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(user.to_string()))?;
    amount_from_column(balance)
}

fn load_user(conn: &Connection, id: UserId) -> StoreResult<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![user_key(id)?],
        UserRow::read,
    )
    .optional()
    .map_err(backend)?
    .map(UserRow::into_user)
    .transpose()
}

fn load_event(conn: &Connection, id: RewardEventId) -> StoreResult<Option<RewardEvent>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM reward_events WHERE id = ?1"),
        params![id.to_hex()],
        EventRow::read,
    )
    .optional()
    .map_err(backend)?
    .map(EventRow::into_event)
    .transpose()
}

struct UserRow {
    id: i64,
    code: Option<String>,
    level: i64,
    balance: i64,
    invited_by: Option<i64>,
}

impl UserRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            code: row.get(1)?,
            level: row.get(2)?,
            balance: row.get(3)?,
            invited_by: row.get(4)?,
        })
    }

    fn into_user(self) -> StoreResult<User> {
        Ok(User {
            id: user_from_key(self.id)?,
            invitation_code: self
                .code
                .map(|c| InvitationCode::parse(&c))
                .transpose()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            level: level_from_column(self.level)?,
            wallet_balance: amount_from_column(self.balance)?,
            invited_by: self.invited_by.map(user_from_key).transpose()?,
        })
    }
}

struct EventRow {
    id: String,
    inviter: i64,
    invitee: i64,
    level: i64,
    amount: i64,
    status: String,
    created_at: String,
    processed_at: Option<String>,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            inviter: row.get(1)?,
            invitee: row.get(2)?,
            level: row.get(3)?,
            amount: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            processed_at: row.get(7)?,
        })
    }

    fn into_event(self) -> StoreResult<RewardEvent> {
        Ok(RewardEvent {
            id: event_from_key(&self.id)?,
            inviter_id: user_from_key(self.inviter)?,
            invitee_id: user_from_key(self.invitee)?,
            invitee_level_at_trigger: level_from_column(self.level)?,
            amount: amount_from_column(self.amount)?,
            status: self
                .status
                .parse()
                .map_err(|e: kazi_types::KaziError| StoreError::Serialization(e.to_string()))?,
            created_at: parse_time(&self.created_at)?,
            processed_at: self.processed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn collect<R, T>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
    convert: impl Fn(R) -> StoreResult<T>,
) -> StoreResult<Vec<T>> {
    rows.map(|row| row.map_err(backend).and_then(&convert))
        .collect()
}

fn user_key(id: UserId) -> StoreResult<i64> {
    i64::try_from(id.get())
        .map_err(|_| StoreError::Serialization(format!("{} does not fit an SQLite integer", id)))
}

fn user_from_key(key: i64) -> StoreResult<UserId> {
    u64::try_from(key)
        .map(UserId::new)
        .map_err(|_| StoreError::Serialization(format!("negative user id {}", key)))
}

fn event_from_key(key: &str) -> StoreResult<RewardEventId> {
    RewardEventId::from_hex(key).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn amount_from_column(units: i64) -> StoreResult<Amount> {
    u64::try_from(units)
        .map(Amount::from_base_units)
        .map_err(|_| StoreError::Serialization(format!("negative amount {}", units)))
}

fn level_from_column(level: i64) -> StoreResult<Level> {
    u8::try_from(level)
        .map(Level::new)
        .map_err(|_| StoreError::Serialization(format!("level {} out of range", level)))
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {:?}: {}", raw, e)))
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Uniqueness violations become `Conflict` so callers can re-read; any other
/// constraint failure is a rejected write that retrying cannot fix.
fn write_error(e: rusqlite::Error) -> StoreError {
    let extended = match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Some(failure.extended_code)
        }
        _ => None,
    };
    match extended {
        Some(ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => {
            StoreError::Conflict(e.to_string())
        }
        Some(_) => StoreError::Rejected(e.to_string()),
        None => backend(e),
    }
}
