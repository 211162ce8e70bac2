use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use super::units::{Mass, Money};
use crate::errors::MarketError;

pub type DbResult<T> = Result<T, MarketError>;

/// Async-safe handle to the marketplace database.
///
/// Wraps `MarketDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. The mutex also serializes every
/// transaction, which is what makes the check-then-write sequences in the
/// pickup and ledger code safe.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MarketDb>>,
}

impl DbHandle {
    pub fn new(db: MarketDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(&MarketDb) -> DbResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| MarketError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used for start-up
    /// bootstrapping and tests; never from a request handler.
    pub fn lock_sync(&self) -> DbResult<std::sync::MutexGuard<'_, MarketDb>> {
        self.inner.lock().map_err(|_| MarketError::LockPoisoned)
    }
}

pub struct MarketDb {
    pub(super) conn: Connection,
}

impl MarketDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> DbResult<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> DbResult<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        super::rewards::seed_core_badges(&self.conn)?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    phone TEXT NOT NULL DEFAULT '',
                    address TEXT NOT NULL DEFAULT '',
                    map_url TEXT NOT NULL DEFAULT '',
                    facebook TEXT NOT NULL DEFAULT '',
                    instagram TEXT NOT NULL DEFAULT '',
                    twitter TEXT NOT NULL DEFAULT '',
                    collector_product TEXT,
                    is_staff INTEGER NOT NULL DEFAULT 0,
                    is_superuser INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    is_approved INTEGER NOT NULL DEFAULT 0,
                    approved_at TEXT,
                    approved_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    points INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
                    total_pickups INTEGER NOT NULL DEFAULT 0,
                    total_co2_saved_g INTEGER NOT NULL DEFAULT 0,
                    date_joined TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS products (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    weight_g INTEGER NOT NULL CHECK (weight_g >= 0),
                    price_cents INTEGER NOT NULL DEFAULT 0 CHECK (price_cents >= 0),
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS pickup_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    requester_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    collector_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE RESTRICT,
                    kind TEXT NOT NULL,
                    weight_g INTEGER NOT NULL DEFAULT 0,
                    price_cents INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(requester_id, collector_id, product_id)
                );

                CREATE TABLE IF NOT EXISTS activities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE RESTRICT,
                    pickup_id INTEGER REFERENCES pickup_requests(id) ON DELETE SET NULL,
                    weight_g INTEGER NOT NULL CHECK (weight_g >= 0),
                    co2_saved_g INTEGER NOT NULL DEFAULT 0,
                    points_awarded INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(pickup_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS badges (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL UNIQUE,
                    description TEXT NOT NULL DEFAULT '',
                    emoji TEXT NOT NULL DEFAULT '',
                    rarity TEXT NOT NULL DEFAULT 'Common',
                    points_bonus INTEGER NOT NULL DEFAULT 0 CHECK (points_bonus >= 0),
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS user_badges (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    badge_id INTEGER NOT NULL REFERENCES badges(id) ON DELETE CASCADE,
                    awarded_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(user_id, badge_id)
                );

                CREATE TABLE IF NOT EXISTS reward_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    cost_points INTEGER NOT NULL CHECK (cost_points >= 0),
                    stock INTEGER CHECK (stock IS NULL OR stock >= 0),
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS redemptions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    reward_id INTEGER NOT NULL REFERENCES reward_items(id) ON DELETE RESTRICT,
                    points_spent INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS listings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    seller_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    product_type TEXT NOT NULL,
                    grade INTEGER NOT NULL,
                    is_available INTEGER NOT NULL DEFAULT 1,
                    description TEXT NOT NULL DEFAULT '',
                    location TEXT NOT NULL DEFAULT '',
                    weight_g INTEGER NOT NULL CHECK (weight_g >= 0),
                    price_cents INTEGER NOT NULL CHECK (price_cents >= 0),
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS listing_tags (
                    listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
                    tag TEXT NOT NULL,
                    PRIMARY KEY (listing_id, tag)
                );

                CREATE TABLE IF NOT EXISTS market_orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_no TEXT NOT NULL UNIQUE,
                    buyer_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    collector_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE RESTRICT,
                    product_name TEXT NOT NULL,
                    weight_g INTEGER NOT NULL,
                    unit_price_cents INTEGER NOT NULL,
                    total_price_cents INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS collector_ratings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    rater_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    collector_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    stars INTEGER NOT NULL CHECK (stars BETWEEN 1 AND 5),
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(rater_id, collector_id)
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    category TEXT NOT NULL DEFAULT 'general',
                    link_url TEXT NOT NULL DEFAULT '',
                    payload TEXT NOT NULL DEFAULT '{}',
                    is_read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS guides (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    category TEXT,
                    description TEXT,
                    read_time INTEGER NOT NULL CHECK (read_time >= 0),
                    downloads INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_pickup_single_acceptance
                    ON pickup_requests(product_id) WHERE status IN ('accepted', 'completed');
                CREATE INDEX IF NOT EXISTS idx_pickup_requester ON pickup_requests(requester_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_pickup_collector ON pickup_requests(collector_id, status);
                CREATE INDEX IF NOT EXISTS idx_activities_user ON activities(user_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_user_badges_user ON user_badges(user_id, awarded_at);
                CREATE INDEX IF NOT EXISTS idx_orders_buyer ON market_orders(buyer_id);
                CREATE INDEX IF NOT EXISTS idx_orders_collector ON market_orders(collector_id);
                CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, is_read, created_at);
                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

/// Read a text column and parse it with the model's `FromStr`.
pub(super) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

pub(super) fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        T::from_str(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    })
    .transpose()
}

pub(super) fn mass_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Mass> {
    Ok(Mass::from_grams(row.get(idx)?))
}

pub(super) fn money_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Money> {
    Ok(Money::from_cents(row.get(idx)?))
}

pub(super) const USER_COLUMNS: &str = "id, email, role, name, phone, address, map_url, facebook, instagram, twitter, collector_product, is_staff, is_superuser, is_active, is_approved, approved_at, approved_by, points, total_pickups, total_co2_saved_g, date_joined";

pub(super) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        role: parse_col(row, 2)?,
        name: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
        map_url: row.get(6)?,
        facebook: row.get(7)?,
        instagram: row.get(8)?,
        twitter: row.get(9)?,
        collector_product: parse_opt_col(row, 10)?,
        is_staff: row.get(11)?,
        is_superuser: row.get(12)?,
        is_active: row.get(13)?,
        is_approved: row.get(14)?,
        approved_at: row.get(15)?,
        approved_by: row.get(16)?,
        points: row.get(17)?,
        total_pickups: row.get(18)?,
        total_co2_saved_kg: mass_col(row, 19)?,
        date_joined: row.get(20)?,
    })
}

pub(super) fn fetch_user(conn: &Connection, id: i64) -> DbResult<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, params![id], user_from_row).optional()?)
}

pub(super) fn require_user(conn: &Connection, id: i64) -> DbResult<User> {
    fetch_user(conn, id)?.ok_or(MarketError::UserNotFound { id })
}

pub(super) const PRODUCT_COLUMNS: &str = "id, kind, weight_g, price_cents, created_at";

pub(super) fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        kind: parse_col(row, 1)?,
        weight_kg: mass_col(row, 2)?,
        price: money_col(row, 3)?,
        created_at: row.get(4)?,
    })
}

pub(super) fn fetch_product(conn: &Connection, id: i64) -> DbResult<Option<Product>> {
    let sql = format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], product_from_row).optional()?)
}

pub(super) fn insert_product(
    conn: &Connection,
    kind: ProductKind,
    weight: Mass,
    price: Money,
) -> DbResult<Product> {
    conn.execute(
        "INSERT INTO products (kind, weight_g, price_cents) VALUES (?1, ?2, ?3)",
        params![kind.as_str(), weight.grams(), price.cents()],
    )?;
    let id = conn.last_insert_rowid();
    fetch_product(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("Product not found after insert").into())
}

/// True when `err` is a UNIQUE or PRIMARY KEY constraint failure.
pub(super) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Collect every row of a prepared query into a `Vec`.
pub(super) fn collect_rows<T, P, F>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: F,
) -> DbResult<Vec<T>>
where
    P: rusqlite::Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
