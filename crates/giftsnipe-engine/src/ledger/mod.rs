/*
[INPUT]:  schema.sql, trade attempts from the account loop, fills reported by the venue
[OUTPUT]: SQLite-backed Ledger with idempotent upserts, status transitions and PnL folding
[POS]:    Persistence layer - durable audit trail of every submission
[UPDATE]: When schema.sql or TradeRecord shape changes
*/

mod pnl;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use giftsnipe_adapter::{Fill, Intent, IntentKind, Side};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

pub use pnl::{PnLSnapshot, fold_pnl};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_SIZE: u32 = 4;

const SELECT_COLUMNS: &str = "trade_key, market, account_id, action, side, item_id, collection, price, fee, external_order_id, reason, status, created_at, updated_at";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("create ledger directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("trade not found: {key}")]
    NotFound { key: String },

    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("corrupt ledger row {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Confirmed => "confirmed",
            TradeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TradeStatus::Pending),
            "confirmed" => Ok(TradeStatus::Confirmed),
            "failed" => Ok(TradeStatus::Failed),
            other => Err(format!("unknown status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    List,
    Cancel,
    Reprice,
    Fill,
}

impl TradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::List => "list",
            TradeAction::Cancel => "cancel",
            TradeAction::Reprice => "reprice",
            TradeAction::Fill => "fill",
        }
    }
}

impl From<IntentKind> for TradeAction {
    fn from(kind: IntentKind) -> Self {
        match kind {
            IntentKind::Buy => TradeAction::Buy,
            IntentKind::List => TradeAction::List,
            IntentKind::Cancel => TradeAction::Cancel,
            IntentKind::Reprice => TradeAction::Reprice,
        }
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "buy" => Ok(TradeAction::Buy),
            "list" => Ok(TradeAction::List),
            "cancel" => Ok(TradeAction::Cancel),
            "reprice" => Ok(TradeAction::Reprice),
            "fill" => Ok(TradeAction::Fill),
            other => Err(format!("unknown action {other}")),
        }
    }
}

/// A submission about to be sent, recorded as Pending first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeAttempt {
    pub key: String,
    pub market: String,
    pub account_id: String,
    pub action: TradeAction,
    pub side: Side,
    pub item_id: String,
    pub collection: String,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl TradeAttempt {
    pub fn from_intent(market: &str, intent: &Intent, now: DateTime<Utc>) -> Self {
        Self {
            key: intent.idempotency_key.clone(),
            market: market.to_string(),
            account_id: intent.account_id.clone(),
            action: intent.kind.into(),
            side: intent.side,
            item_id: intent.item_id.clone(),
            collection: intent.collection.clone(),
            price: intent.price,
            created_at: now,
        }
    }
}

/// What the venue reported for an accepted submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeOutcome {
    pub external_order_id: Option<String>,
    pub fee: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeRecord {
    pub key: String,
    pub market: String,
    pub account_id: String,
    pub action: TradeAction,
    pub side: Side,
    pub item_id: String,
    pub collection: String,
    pub price: Decimal,
    pub fee: Decimal,
    pub external_order_id: Option<String>,
    pub reason: Option<String>,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trade ledger. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Ledger {
    pool: r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let manager = r2d2_sqlite::SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        });
        let pool = r2d2::Pool::builder()
            .max_size(FILE_POOL_SIZE)
            .build(manager)?;
        Self::with_pool(pool)
    }

    /// Private in-memory ledger. Single connection, since every
    /// `:memory:` connection is its own database.
    pub fn in_memory() -> LedgerResult<Self> {
        let manager = r2d2_sqlite::SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>) -> LedgerResult<Self> {
        let ledger = Self { pool };
        ledger.run_migrations()?;
        Ok(ledger)
    }

    fn run_migrations(&self) -> LedgerResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Insert a Pending row unless the key already exists; returns the stored row.
    pub fn record(&self, attempt: &TradeAttempt) -> LedgerResult<TradeRecord> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created_at = encode_time(attempt.created_at);
        tx.execute(
            "INSERT INTO trades (trade_key, market, account_id, action, side, item_id, collection, price, fee, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '0', ?9, ?10, ?10) \
             ON CONFLICT(trade_key) DO NOTHING",
            params![
                attempt.key,
                attempt.market,
                attempt.account_id,
                attempt.action.as_str(),
                attempt.side.as_str(),
                attempt.item_id,
                attempt.collection,
                attempt.price.to_string(),
                TradeStatus::Pending.as_str(),
                created_at,
            ],
        )?;
        let record = fetch(&tx, &attempt.key)?.ok_or_else(|| LedgerError::NotFound {
            key: attempt.key.clone(),
        })?;
        tx.commit()?;
        Ok(record)
    }

    pub fn confirm(&self, key: &str, outcome: &TradeOutcome) -> LedgerResult<TradeRecord> {
        self.finish(
            key,
            TradeStatus::Confirmed,
            outcome.external_order_id.as_deref(),
            Some(outcome.fee),
            None,
        )
    }

    pub fn fail(&self, key: &str, reason: &str) -> LedgerResult<TradeRecord> {
        self.finish(key, TradeStatus::Failed, None, None, Some(reason))
    }

    fn finish(
        &self,
        key: &str,
        to: TradeStatus,
        external_order_id: Option<&str>,
        fee: Option<Decimal>,
        reason: Option<&str>,
    ) -> LedgerResult<TradeRecord> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch(&tx, key)?.ok_or_else(|| LedgerError::NotFound {
            key: key.to_string(),
        })?;

        match current.status {
            TradeStatus::Pending => {}
            status if status == to => return Ok(current),
            status => {
                return Err(LedgerError::InvalidTransition {
                    key: key.to_string(),
                    from: status,
                    to,
                });
            }
        }

        tx.execute(
            "UPDATE trades SET status = ?1, \
             external_order_id = COALESCE(?2, external_order_id), \
             fee = COALESCE(?3, fee), \
             reason = COALESCE(?4, reason), \
             updated_at = ?5 \
             WHERE trade_key = ?6 AND status = 'pending'",
            params![
                to.as_str(),
                external_order_id,
                fee.map(|fee| fee.to_string()),
                reason,
                encode_time(Utc::now()),
                key,
            ],
        )?;
        let updated = fetch(&tx, key)?.ok_or_else(|| LedgerError::NotFound {
            key: key.to_string(),
        })?;
        tx.commit()?;
        Ok(updated)
    }

    /// Store a fill as a Confirmed record. Returns false when already known.
    pub fn record_fill(&self, market: &str, account_id: &str, fill: &Fill) -> LedgerResult<bool> {
        let conn = self.pool.get()?;
        let key = Intent::fill_key(market, account_id, &fill.fill_id);
        let at = encode_time(fill.filled_at);
        let inserted = conn.execute(
            "INSERT INTO trades (trade_key, market, account_id, action, side, item_id, collection, price, fee, external_order_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) \
             ON CONFLICT(trade_key) DO NOTHING",
            params![
                key,
                market,
                account_id,
                TradeAction::Fill.as_str(),
                fill.side.as_str(),
                fill.item_id,
                fill.collection,
                fill.price.to_string(),
                fill.fee.to_string(),
                fill.fill_id,
                TradeStatus::Confirmed.as_str(),
                at,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get(&self, key: &str) -> LedgerResult<Option<TradeRecord>> {
        let conn = self.pool.get()?;
        fetch(&conn, key)
    }

    /// Pending records of an account, oldest first.
    pub fn pending(&self, account_id: &str) -> LedgerResult<Vec<TradeRecord>> {
        let conn = self.pool.get()?;
        query_records(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM trades WHERE account_id = ?1 AND status = 'pending' \
                 ORDER BY created_at, trade_key"
            ),
            params![account_id],
        )
    }

    /// Most recently updated records of an account.
    pub fn recent(&self, account_id: &str, limit: usize) -> LedgerResult<Vec<TradeRecord>> {
        let conn = self.pool.get()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        query_records(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM trades WHERE account_id = ?1 \
                 ORDER BY updated_at DESC, trade_key DESC LIMIT ?2"
            ),
            params![account_id, limit],
        )
    }

    pub fn compute_pnl(&self, account_id: &str) -> LedgerResult<PnLSnapshot> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let records = query_records(
            &tx,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM trades WHERE account_id = ?1 AND status = 'confirmed' \
                 AND action IN ('buy', 'fill') ORDER BY created_at, trade_key"
            ),
            params![account_id],
        )?;
        tx.commit()?;
        Ok(fold_pnl(account_id, &records))
    }
}

fn fetch(conn: &Connection, key: &str) -> LedgerResult<Option<TradeRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM trades WHERE trade_key = ?1"),
            params![key],
            TradeRow::from_row,
        )
        .optional()?;
    row.map(TradeRecord::try_from).transpose()
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> LedgerResult<Vec<TradeRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, TradeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TradeRecord::try_from).collect()
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct TradeRow {
    key: String,
    market: String,
    account_id: String,
    action: String,
    side: String,
    item_id: String,
    collection: String,
    price: String,
    fee: String,
    external_order_id: Option<String>,
    reason: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TradeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            market: row.get(1)?,
            account_id: row.get(2)?,
            action: row.get(3)?,
            side: row.get(4)?,
            item_id: row.get(5)?,
            collection: row.get(6)?,
            price: row.get(7)?,
            fee: row.get(8)?,
            external_order_id: row.get(9)?,
            reason: row.get(10)?,
            status: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = LedgerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let key = row.key.clone();
        let corrupt = |reason: String| LedgerError::Corrupt {
            key: key.clone(),
            reason,
        };
        let decimal = |field: &str, value: &str| {
            Decimal::from_str(value).map_err(|err| corrupt(format!("{field}: {err}")))
        };
        let time = |field: &str, value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|err| corrupt(format!("{field}: {err}")))
        };

        Ok(TradeRecord {
            action: row.action.parse().map_err(corrupt)?,
            side: row.side.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            price: decimal("price", &row.price)?,
            fee: decimal("fee", &row.fee)?,
            created_at: time("created_at", &row.created_at)?,
            updated_at: time("updated_at", &row.updated_at)?,
            key: row.key,
            market: row.market,
            account_id: row.account_id,
            item_id: row.item_id,
            collection: row.collection,
            external_order_id: row.external_order_id,
            reason: row.reason,
        })
    }
}
