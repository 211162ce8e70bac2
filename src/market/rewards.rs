//! Points/CO₂ ledger, badge engine and reward redemption.
//!
//! ## Ledger
//!
//! Every completed pickup writes one `activities` row per credited user. The
//! row is the idempotency key: `(pickup_id, user_id)` is unique, and
//! [`log_activity`] returns `None` without touching the totals when the row
//! already exists. Totals only ever grow through this path.
//!
//! ## Badges
//!
//! A badge's `code` doubles as its rule (see [`BadgeRule::from_code`]).
//! Evaluation ([`badges_to_award`]) is a pure function of a user's
//! [`Standing`]; the database only supplies the candidate badges and the set
//! already held. `UNIQUE(user_id, badge_id)` makes every award at-most-once.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::accounts::require_admin;
use super::db::{
    DbResult, MarketDb, collect_rows, is_unique_violation, mass_col, parse_col, require_user,
};
use super::models::*;
use super::notifications::{NewNotification, push_notification};
use super::units::Mass;
use crate::errors::MarketError;

pub const FIRST_RECYCLER: &str = "first_recycler";

/// How many users the leaderboard returns.
pub const LEADERBOARD_LIMIT: i64 = 100;

/// How many recent badges the overview shows.
const RECENT_BADGES: i64 = 6;

struct CoreBadge {
    code: &'static str,
    name: &'static str,
    description: &'static str,
    emoji: &'static str,
    rarity: Rarity,
    points_bonus: i64,
}

const CORE_BADGES: [CoreBadge; 4] = [
    CoreBadge {
        code: FIRST_RECYCLER,
        name: "Eco Starter",
        description: "First Recycler of Recyconnect",
        emoji: "💚",
        rarity: Rarity::Exclusive,
        points_bonus: 250,
    },
    CoreBadge {
        code: "first_timer",
        name: "First Timer",
        description: "Completed First Pickup",
        emoji: "🌟",
        rarity: Rarity::Common,
        points_bonus: 100,
    },
    CoreBadge {
        code: "pickups_20",
        name: "Eco Warrior",
        description: "Completed 20+ successful pickups",
        emoji: "♻️",
        rarity: Rarity::Rare,
        points_bonus: 300,
    },
    CoreBadge {
        code: "CO2_50",
        name: "Planet Protector",
        description: "Saved 50 KG+ CO2 Emission",
        emoji: "🌍",
        rarity: Rarity::Epic,
        points_bonus: 500,
    },
];

pub(super) fn seed_core_badges(conn: &Connection) -> DbResult<()> {
    for b in &CORE_BADGES {
        conn.execute(
            "INSERT OR IGNORE INTO badges (code, name, description, emoji, rarity, points_bonus)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                b.code,
                b.name,
                b.description,
                b.emoji,
                b.rarity.as_str(),
                b.points_bonus
            ],
        )?;
    }
    Ok(())
}

// ── Badge rules ───────────────────────────────────────────────────────

static THRESHOLD_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(pickups|co2)_([0-9]+)$").expect("valid badge regex"));

/// The condition a badge code encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeRule {
    /// Platform-wide unique; a household's first activity.
    FirstRecycler,
    /// At least `n` completed pickups.
    Pickups(i64),
    /// At least `n` kg of CO₂ saved.
    Co2Kg(i64),
}

impl BadgeRule {
    /// Badges whose code encodes no rule are only ever awarded by hand.
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        if code == FIRST_RECYCLER {
            return Some(Self::FirstRecycler);
        }
        if code == "first_timer" {
            return Some(Self::Pickups(1));
        }
        let caps = THRESHOLD_CODE.captures(code)?;
        let n: i64 = caps[2].parse().ok()?;
        if caps[1].eq_ignore_ascii_case("pickups") {
            Some(Self::Pickups(n))
        } else {
            Some(Self::Co2Kg(n))
        }
    }

    fn sort_key(&self) -> (u8, i64) {
        match self {
            Self::FirstRecycler => (0, 0),
            Self::Pickups(n) | Self::Co2Kg(n) => (1, *n),
        }
    }

    pub fn is_met(&self, standing: &Standing) -> bool {
        match self {
            Self::FirstRecycler => {
                standing.role == Role::Household
                    && standing.first_activity
                    && !standing.first_recycler_taken
            }
            Self::Pickups(n) => standing.total_pickups >= *n,
            Self::Co2Kg(n) => n
                .checked_mul(1000)
                .is_some_and(|grams| standing.total_co2.grams() >= grams),
        }
    }
}

/// Everything badge evaluation looks at.
#[derive(Debug, Clone)]
pub struct Standing {
    pub role: Role,
    pub total_pickups: i64,
    pub total_co2: Mass,
    /// The activity being evaluated is the user's first.
    pub first_activity: bool,
    /// Somebody already holds `first_recycler`.
    pub first_recycler_taken: bool,
}

/// Badges from `candidates` the user qualifies for and does not hold yet,
/// special badges first, then by ascending threshold.
pub fn badges_to_award<'a>(
    standing: &Standing,
    candidates: &'a [Badge],
    held: &HashSet<i64>,
) -> Vec<&'a Badge> {
    let mut ruled: Vec<(BadgeRule, &Badge)> = candidates
        .iter()
        .filter(|b| !held.contains(&b.id))
        .filter_map(|b| BadgeRule::from_code(&b.code).map(|rule| (rule, b)))
        .collect();
    ruled.sort_by_key(|(rule, b)| (rule.sort_key(), b.id));
    ruled
        .into_iter()
        .filter(|(rule, _)| rule.is_met(standing))
        .map(|(_, b)| b)
        .collect()
}

// ── Row mapping ───────────────────────────────────────────────────────

const BADGE_COLUMNS: &str = "id, code, name, description, emoji, rarity, points_bonus, created_at";

fn badge_from_row(row: &Row<'_>) -> rusqlite::Result<Badge> {
    Ok(Badge {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        emoji: row.get(4)?,
        rarity: parse_col(row, 5)?,
        points_bonus: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const ACTIVITY_COLUMNS: &str =
    "id, user_id, product_id, pickup_id, weight_g, co2_saved_g, points_awarded, created_at";

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        product_id: row.get(2)?,
        pickup_id: row.get(3)?,
        weight_kg: mass_col(row, 4)?,
        co2_saved_kg: mass_col(row, 5)?,
        points_awarded: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const REWARD_COLUMNS: &str = "id, title, cost_points, stock, is_active, created_at";

fn reward_from_row(row: &Row<'_>) -> rusqlite::Result<RewardItem> {
    Ok(RewardItem {
        id: row.get(0)?,
        title: row.get(1)?,
        cost_points: row.get(2)?,
        stock: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn fetch_badge(conn: &Connection, id: i64) -> DbResult<Option<Badge>> {
    let sql = format!("SELECT {} FROM badges WHERE id = ?1", BADGE_COLUMNS);
    Ok(conn.query_row(&sql, params![id], badge_from_row).optional()?)
}

fn fetch_reward(conn: &Connection, id: i64) -> DbResult<Option<RewardItem>> {
    let sql = format!("SELECT {} FROM reward_items WHERE id = ?1", REWARD_COLUMNS);
    Ok(conn.query_row(&sql, params![id], reward_from_row).optional()?)
}

// ── Ledger ────────────────────────────────────────────────────────────

/// What one credited activity produced.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityOutcome {
    pub activity: Activity,
    pub new_badges: Vec<Badge>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

/// Points earned for saving `co2`: two per whole kilogram.
pub fn points_for_co2(co2: Mass) -> i64 {
    co2.whole_kg() * 2
}

/// Record an activity, update the user's totals and run the badge engine.
///
/// Must run inside the caller's transaction. Returns `None` when an activity
/// for `(pickup_id, user_id)` already exists, leaving everything untouched.
pub(super) fn log_activity(
    conn: &Connection,
    user_id: i64,
    product: &Product,
    weight: Mass,
    pickup_id: Option<i64>,
) -> DbResult<Option<ActivityOutcome>> {
    if let Some(pid) = pickup_id {
        let already: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM activities WHERE pickup_id = ?1 AND user_id = ?2",
            params![pid, user_id],
            |row| row.get(0),
        )?;
        if already {
            tracing::debug!(user_id, pickup_id = pid, "activity already credited");
            return Ok(None);
        }
    }

    let first_activity: bool = conn.query_row(
        "SELECT COUNT(*) = 0 FROM activities WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;

    let co2 = product
        .kind
        .co2_saved(weight)
        .ok_or_else(|| MarketError::bad_request("Weight is out of range"))?;
    let points = points_for_co2(co2);

    conn.execute(
        "INSERT INTO activities (user_id, product_id, pickup_id, weight_g, co2_saved_g, points_awarded)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![user_id, product.id, pickup_id, weight.grams(), co2.grams(), points],
    )?;
    let activity_id = conn.last_insert_rowid();
    conn.execute(
        "UPDATE users SET total_co2_saved_g = total_co2_saved_g + ?1,
             total_pickups = total_pickups + 1,
             points = points + ?2
         WHERE id = ?3",
        params![co2.grams(), points, user_id],
    )?;

    let sql = format!("SELECT {} FROM activities WHERE id = ?1", ACTIVITY_COLUMNS);
    let activity = conn.query_row(&sql, params![activity_id], activity_from_row)?;

    let mut notifications = Vec::new();
    if points > 0 {
        notifications.push(push_notification(
            conn,
            NewNotification {
                user_id,
                title: "⭐ Points Added".to_string(),
                message: format!("You received +{} points.", points),
                category: NotificationCategory::Points,
                link_url: String::new(),
                payload: serde_json::json!({
                    "activity_id": activity.id,
                    "reason": "pickup_completed",
                    "points_delta": points,
                }),
            },
        )?);
    }

    let (new_badges, badge_notes) = evaluate_badges(conn, user_id, first_activity)?;
    notifications.extend(badge_notes);

    tracing::info!(
        user_id,
        activity_id = activity.id,
        co2_g = co2.grams(),
        points,
        badges = new_badges.len(),
        "activity credited"
    );
    Ok(Some(ActivityOutcome {
        activity,
        new_badges,
        notifications,
    }))
}

fn evaluate_badges(
    conn: &Connection,
    user_id: i64,
    first_activity: bool,
) -> DbResult<(Vec<Badge>, Vec<Notification>)> {
    let user = require_user(conn, user_id)?;
    let sql = format!("SELECT {} FROM badges ORDER BY id", BADGE_COLUMNS);
    let candidates = collect_rows(conn, &sql, [], badge_from_row)?;
    let held: HashSet<i64> = collect_rows(
        conn,
        "SELECT badge_id FROM user_badges WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?
    .into_iter()
    .collect();
    let first_recycler_taken: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM user_badges ub JOIN badges b ON b.id = ub.badge_id WHERE b.code = ?1",
        params![FIRST_RECYCLER],
        |row| row.get(0),
    )?;

    let standing = Standing {
        role: user.role,
        total_pickups: user.total_pickups,
        total_co2: user.total_co2_saved_kg,
        first_activity,
        first_recycler_taken,
    };

    let mut awarded = Vec::new();
    let mut notifications = Vec::new();
    for badge in badges_to_award(&standing, &candidates, &held) {
        if let Some(note) = award_badge(conn, user_id, badge)? {
            notifications.push(note);
            awarded.push(badge.clone());
        }
    }
    Ok((awarded, notifications))
}

/// Award `badge` unless already held; credits the bonus exactly once.
fn award_badge(conn: &Connection, user_id: i64, badge: &Badge) -> DbResult<Option<Notification>> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO user_badges (user_id, badge_id) VALUES (?1, ?2)",
        params![user_id, badge.id],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    if badge.points_bonus > 0 {
        conn.execute(
            "UPDATE users SET points = points + ?1 WHERE id = ?2",
            params![badge.points_bonus, user_id],
        )?;
    }
    let mut message = format!("You earned {}", badge.name);
    if badge.points_bonus > 0 {
        message.push_str(&format!(" (+{} pts)", badge.points_bonus));
    }
    tracing::info!(user_id, badge = %badge.code, bonus = badge.points_bonus, "badge awarded");
    let note = push_notification(
        conn,
        NewNotification {
            user_id,
            title: "🎉 New Badge Earned!".to_string(),
            message,
            category: NotificationCategory::Badge,
            link_url: String::new(),
            payload: serde_json::json!({
                "badge_id": badge.id,
                "badge_name": badge.name,
                "points_bonus": badge.points_bonus,
            }),
        },
    )?;
    Ok(Some(note))
}

// ── Admin inputs and views ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BadgeInput {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub emoji: String,
    pub rarity: Option<Rarity>,
    #[serde(default)]
    pub points_bonus: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardInput {
    pub title: String,
    pub cost_points: i64,
    pub stock: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct BadgeStatus {
    #[serde(flatten)]
    pub badge: Badge,
    pub earned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardsOverview {
    pub points: i64,
    pub total_co2_kg: Mass,
    pub total_pickups: i64,
    pub recent_badges: Vec<UserBadge>,
    pub badges: Vec<BadgeStatus>,
    pub items: Vec<RewardItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub points: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedemptionOutcome {
    pub redemption: Redemption,
    pub remaining_points: i64,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

fn validate_badge_code(code: &str) -> DbResult<()> {
    let ok = !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(MarketError::bad_request(format!("Invalid badge code: {:?}", code)))
    }
}

impl MarketDb {
    pub fn list_badges(&self) -> DbResult<Vec<Badge>> {
        let sql = format!("SELECT {} FROM badges ORDER BY points_bonus, name", BADGE_COLUMNS);
        collect_rows(&self.conn, &sql, [], badge_from_row)
    }

    pub fn user_badges(&self, user_id: i64, limit: i64) -> DbResult<Vec<UserBadge>> {
        let sql = format!(
            "SELECT ub.id, ub.user_id, ub.awarded_at, {}
             FROM user_badges ub JOIN badges b ON b.id = ub.badge_id
             WHERE ub.user_id = ?1 ORDER BY ub.awarded_at DESC, ub.id DESC LIMIT ?2",
            BADGE_COLUMNS
                .split(", ")
                .map(|c| format!("b.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        collect_rows(&self.conn, &sql, params![user_id, limit], |row| {
            let badge = Badge {
                id: row.get(3)?,
                code: row.get(4)?,
                name: row.get(5)?,
                description: row.get(6)?,
                emoji: row.get(7)?,
                rarity: parse_col(row, 8)?,
                points_bonus: row.get(9)?,
                created_at: row.get(10)?,
            };
            Ok(UserBadge {
                id: row.get(0)?,
                user_id: row.get(1)?,
                awarded_at: row.get(2)?,
                badge,
            })
        })
    }

    pub fn activity_history(&self, user_id: i64) -> DbResult<Vec<Activity>> {
        let sql = format!(
            "SELECT {} FROM activities WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            ACTIVITY_COLUMNS
        );
        collect_rows(&self.conn, &sql, params![user_id], activity_from_row)
    }

    /// Credit an activity outside the pickup flow (admin corrections, imports).
    pub fn log_manual_activity(
        &self,
        actor_id: i64,
        user_id: i64,
        kind: ProductKind,
        weight: Mass,
    ) -> DbResult<ActivityOutcome> {
        if !weight.is_valid_quantity() {
            return Err(MarketError::bad_request(format!(
                "Weight must be greater than zero and at most {} kg",
                Mass::MAX
            )));
        }
        let tx = self.conn.unchecked_transaction()?;
        require_admin(&tx, actor_id)?;
        require_user(&tx, user_id)?;
        let product = super::db::insert_product(&tx, kind, weight, super::units::Money::ZERO)?;
        let outcome = log_activity(&tx, user_id, &product, weight, None)?
            .ok_or_else(|| anyhow::anyhow!("manual activity unexpectedly deduplicated"))?;
        tx.commit()?;
        Ok(outcome)
    }

    pub fn list_rewards(&self, include_inactive: bool) -> DbResult<Vec<RewardItem>> {
        let sql = if include_inactive {
            format!(
                "SELECT {} FROM reward_items ORDER BY is_active DESC, cost_points, id",
                REWARD_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM reward_items WHERE is_active = 1 ORDER BY cost_points, id",
                REWARD_COLUMNS
            )
        };
        collect_rows(&self.conn, &sql, [], reward_from_row)
    }

    pub fn rewards_overview(&self, user_id: i64) -> DbResult<RewardsOverview> {
        let user = require_user(&self.conn, user_id)?;
        let earned: HashSet<i64> = collect_rows(
            &self.conn,
            "SELECT badge_id FROM user_badges WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?
        .into_iter()
        .collect();
        let badges = self
            .list_badges()?
            .into_iter()
            .map(|badge| BadgeStatus {
                earned: earned.contains(&badge.id),
                badge,
            })
            .collect();
        Ok(RewardsOverview {
            points: user.points,
            total_co2_kg: user.total_co2_saved_kg,
            total_pickups: user.total_pickups,
            recent_badges: self.user_badges(user_id, RECENT_BADGES)?,
            badges,
            items: self.list_rewards(false)?,
        })
    }

    pub fn leaderboard(&self) -> DbResult<Vec<LeaderboardEntry>> {
        collect_rows(
            &self.conn,
            "SELECT id, name, email, role, points FROM users WHERE points > 0
             ORDER BY points DESC, id LIMIT ?1",
            params![LEADERBOARD_LIMIT],
            |row| {
                Ok(LeaderboardEntry {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    role: parse_col(row, 3)?,
                    points: row.get(4)?,
                })
            },
        )
    }

    /// Spend points on a reward item. Checks and writes happen in one
    /// transaction so points and stock cannot go negative.
    pub fn redeem_reward(&self, user_id: i64, reward_id: i64) -> DbResult<RedemptionOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let user = require_user(&tx, user_id)?;
        let reward = fetch_reward(&tx, reward_id)?
            .filter(|r| r.is_active)
            .ok_or(MarketError::RewardNotFound { id: reward_id })?;

        if user.points < reward.cost_points {
            return Err(MarketError::bad_request("Not enough points to redeem."));
        }
        if !reward.is_in_stock() {
            return Err(MarketError::conflict("Reward out of stock."));
        }

        tx.execute(
            "UPDATE users SET points = points - ?1 WHERE id = ?2",
            params![reward.cost_points, user_id],
        )?;
        if reward.stock.is_some() {
            tx.execute(
                "UPDATE reward_items SET stock = stock - 1 WHERE id = ?1",
                params![reward_id],
            )?;
        }
        tx.execute(
            "INSERT INTO redemptions (user_id, reward_id, points_spent) VALUES (?1, ?2, ?3)",
            params![user_id, reward_id, reward.cost_points],
        )?;
        let redemption_id = tx.last_insert_rowid();
        let redemption = tx.query_row(
            "SELECT id, user_id, reward_id, points_spent, created_at FROM redemptions WHERE id = ?1",
            params![redemption_id],
            |row| {
                Ok(Redemption {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    reward_id: row.get(2)?,
                    points_spent: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )?;
        let note = push_notification(
            &tx,
            NewNotification {
                user_id,
                title: "Reward redeemed".to_string(),
                message: format!("You will get your reward soon: {}.", reward.title),
                category: NotificationCategory::Points,
                link_url: String::new(),
                payload: serde_json::json!({
                    "reward_id": reward.id,
                    "points_spent": reward.cost_points,
                }),
            },
        )?;
        let remaining_points = require_user(&tx, user_id)?.points;
        tx.commit()?;
        tracing::info!(user_id, reward_id, cost = reward.cost_points, "reward redeemed");
        Ok(RedemptionOutcome {
            redemption,
            remaining_points,
            notifications: vec![note],
        })
    }

    /// Create (`id == None`) or update a badge. Blank code or name keep the
    /// current value on update.
    pub fn save_badge(&self, actor_id: i64, id: Option<i64>, input: BadgeInput) -> DbResult<Badge> {
        require_admin(&self.conn, actor_id)?;
        let code = input.code.trim().to_string();
        let name = input.name.trim().to_string();
        let rarity = input.rarity.unwrap_or(Rarity::Common);
        if input.points_bonus < 0 {
            return Err(MarketError::bad_request("points_bonus must not be negative"));
        }

        let result = match id {
            Some(id) => {
                let current = fetch_badge(&self.conn, id)?.ok_or(MarketError::BadgeNotFound { id })?;
                let code = if code.is_empty() { current.code } else { code };
                let name = if name.is_empty() { current.name } else { name };
                validate_badge_code(&code)?;
                self.conn
                    .execute(
                        "UPDATE badges SET code = ?1, name = ?2, description = ?3, emoji = ?4,
                             rarity = ?5, points_bonus = ?6
                         WHERE id = ?7",
                        params![
                            code,
                            name,
                            input.description,
                            input.emoji,
                            rarity.as_str(),
                            input.points_bonus,
                            id
                        ],
                    )
                    .map(|_| id)
            }
            None => {
                validate_badge_code(&code)?;
                if name.is_empty() {
                    return Err(MarketError::bad_request("Badge name is required"));
                }
                self.conn
                    .execute(
                        "INSERT INTO badges (code, name, description, emoji, rarity, points_bonus)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            code,
                            name,
                            input.description,
                            input.emoji,
                            rarity.as_str(),
                            input.points_bonus
                        ],
                    )
                    .map(|_| self.conn.last_insert_rowid())
            }
        };

        let badge_id = match result {
            Ok(badge_id) => badge_id,
            Err(e) if is_unique_violation(&e) => {
                return Err(MarketError::conflict("Badge code or name must be unique."));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(actor_id, badge_id, "badge saved");
        fetch_badge(&self.conn, badge_id)?.ok_or(MarketError::BadgeNotFound { id: badge_id })
    }

    pub fn save_reward(
        &self,
        actor_id: i64,
        id: Option<i64>,
        input: RewardInput,
    ) -> DbResult<RewardItem> {
        require_admin(&self.conn, actor_id)?;
        if input.cost_points < 0 {
            return Err(MarketError::bad_request("cost_points must not be negative"));
        }
        if input.stock.is_some_and(|s| s < 0) {
            return Err(MarketError::bad_request("stock must not be negative"));
        }
        let title = input.title.trim().to_string();

        let reward_id = match id {
            Some(id) => {
                let current = fetch_reward(&self.conn, id)?.ok_or(MarketError::RewardNotFound { id })?;
                let title = if title.is_empty() { current.title } else { title };
                self.conn.execute(
                    "UPDATE reward_items SET title = ?1, cost_points = ?2, stock = ?3, is_active = ?4
                     WHERE id = ?5",
                    params![title, input.cost_points, input.stock, input.is_active, id],
                )?;
                id
            }
            None => {
                if title.is_empty() {
                    return Err(MarketError::bad_request("Reward title is required"));
                }
                self.conn.execute(
                    "INSERT INTO reward_items (title, cost_points, stock, is_active) VALUES (?1, ?2, ?3, ?4)",
                    params![title, input.cost_points, input.stock, input.is_active],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        tracing::info!(actor_id, reward_id, "reward item saved");
        fetch_reward(&self.conn, reward_id)?.ok_or(MarketError::RewardNotFound { id: reward_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::db::{insert_product, test_support};
    use crate::market::units::Money;

    fn badge(id: i64, code: &str) -> Badge {
        Badge {
            id,
            code: code.to_string(),
            name: code.to_string(),
            description: String::new(),
            emoji: String::new(),
            rarity: Rarity::Common,
            points_bonus: 0,
            created_at: String::new(),
        }
    }

    fn standing(pickups: i64, co2_kg: i64) -> Standing {
        Standing {
            role: Role::Buyer,
            total_pickups: pickups,
            total_co2: Mass::from_kg(co2_kg),
            first_activity: false,
            first_recycler_taken: false,
        }
    }

    fn credit(db: &MarketDb, user_id: i64, kind: ProductKind, grams: i64, pickup: Option<i64>) -> Option<ActivityOutcome> {
        let tx = db.conn.unchecked_transaction().unwrap();
        let product = insert_product(&tx, kind, Mass::from_grams(grams), Money::ZERO).unwrap();
        let out = log_activity(&tx, user_id, &product, Mass::from_grams(grams), pickup).unwrap();
        tx.commit().unwrap();
        out
    }

    #[test]
    fn test_rule_parsing() {
        assert_eq!(BadgeRule::from_code("first_recycler"), Some(BadgeRule::FirstRecycler));
        assert_eq!(BadgeRule::from_code("first_timer"), Some(BadgeRule::Pickups(1)));
        assert_eq!(BadgeRule::from_code("pickups_20"), Some(BadgeRule::Pickups(20)));
        assert_eq!(BadgeRule::from_code("PICKUPS_5"), Some(BadgeRule::Pickups(5)));
        assert_eq!(BadgeRule::from_code("CO2_50"), Some(BadgeRule::Co2Kg(50)));
        assert_eq!(BadgeRule::from_code("co2_200"), Some(BadgeRule::Co2Kg(200)));
        assert_eq!(BadgeRule::from_code("co2_"), None);
        assert_eq!(BadgeRule::from_code("pickups_x"), None);
        assert_eq!(BadgeRule::from_code("community_hero"), None);
    }

    #[test]
    fn test_badges_to_award_is_threshold_ordered_and_skips_held() {
        let candidates = vec![
            badge(1, "pickups_20"),
            badge(2, "co2_10"),
            badge(3, "pickups_5"),
            badge(4, "handpicked"),
            badge(5, "first_timer"),
        ];
        let held: HashSet<i64> = [5].into_iter().collect();
        let got: Vec<&str> = badges_to_award(&standing(6, 12), &candidates, &held)
            .into_iter()
            .map(|b| b.code.as_str())
            .collect();
        assert_eq!(got, vec!["pickups_5", "co2_10"]);
    }

    #[test]
    fn test_first_recycler_rule() {
        let mut s = standing(1, 0);
        s.first_activity = true;
        assert!(!BadgeRule::FirstRecycler.is_met(&s), "households only");
        s.role = Role::Household;
        assert!(BadgeRule::FirstRecycler.is_met(&s));
        s.first_recycler_taken = true;
        assert!(!BadgeRule::FirstRecycler.is_met(&s));
        s.first_recycler_taken = false;
        s.first_activity = false;
        assert!(!BadgeRule::FirstRecycler.is_met(&s));
    }

    #[test]
    fn test_co2_rule_compares_exact_grams() {
        let mut s = standing(0, 0);
        s.total_co2 = Mass::from_grams(49_999);
        assert!(!BadgeRule::Co2Kg(50).is_met(&s));
        s.total_co2 = Mass::from_grams(50_000);
        assert!(BadgeRule::Co2Kg(50).is_met(&s));
        assert!(!BadgeRule::Co2Kg(i64::MAX).is_met(&s));
    }

    #[test]
    fn test_points_for_co2_floors_kilograms() {
        assert_eq!(points_for_co2(Mass::from_grams(3_750)), 6);
        assert_eq!(points_for_co2(Mass::from_grams(999)), 0);
    }

    #[test]
    fn test_log_activity_updates_totals_and_awards_first_timer() -> DbResult<()> {
        let db = test_support::db();
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);

        // 2.5 kg metal → 5.000 kg CO₂ → 10 points, plus first_timer (+100)
        let out = credit(&db, buyer.id, ProductKind::Metal, 2500, None).expect("credited");
        assert_eq!(out.activity.co2_saved_kg.grams(), 5000);
        assert_eq!(out.activity.points_awarded, 10);
        let codes: Vec<&str> = out.new_badges.iter().map(|b| b.code.as_str()).collect();
        assert_eq!(codes, vec!["first_timer"]);
        assert_eq!(out.notifications.len(), 2);

        let reloaded = test_support::reload(&db, buyer.id);
        assert_eq!(reloaded.total_pickups, 1);
        assert_eq!(reloaded.total_co2_saved_kg.grams(), 5000);
        assert_eq!(reloaded.points, 110);
        Ok(())
    }

    #[test]
    fn test_log_activity_is_idempotent_per_pickup_and_user() -> DbResult<()> {
        let db = test_support::db();
        let household = test_support::user(&db, "h@example.com", Role::Household);
        let collector = test_support::collector(&db, "c@example.com", ProductKind::Paper);
        let product = insert_product(&db.conn, ProductKind::Paper, Mass::from_kg(1), Money::ZERO)?;
        db.conn.execute(
            "INSERT INTO pickup_requests (requester_id, collector_id, product_id, kind, weight_g, status)
             VALUES (?1, ?2, ?3, 'paper', 1000, 'completed')",
            params![household.id, collector.id, product.id],
        )?;
        let pickup_id = db.conn.last_insert_rowid();

        let first = log_activity(&db.conn, household.id, &product, Mass::from_kg(1), Some(pickup_id))?;
        assert!(first.is_some());
        let points_after_first = test_support::reload(&db, household.id).points;

        let replay = log_activity(&db.conn, household.id, &product, Mass::from_kg(1), Some(pickup_id))?;
        assert!(replay.is_none());
        let after = test_support::reload(&db, household.id);
        assert_eq!(after.total_pickups, 1);
        assert_eq!(after.points, points_after_first);

        // Same pickup, different user, is a separate credit.
        assert!(log_activity(&db.conn, collector.id, &product, Mass::from_kg(1), Some(pickup_id))?.is_some());
        Ok(())
    }

    #[test]
    fn test_first_recycler_is_platform_unique() -> DbResult<()> {
        let db = test_support::db();
        let h1 = test_support::user(&db, "h1@example.com", Role::Household);
        let h2 = test_support::user(&db, "h2@example.com", Role::Household);

        let out1 = credit(&db, h1.id, ProductKind::Glass, 1000, None).unwrap();
        assert!(out1.new_badges.iter().any(|b| b.code == FIRST_RECYCLER));
        let out2 = credit(&db, h2.id, ProductKind::Glass, 1000, None).unwrap();
        assert!(out2.new_badges.iter().all(|b| b.code != FIRST_RECYCLER));

        // Eco Starter (+250) and First Timer (+100); 0.3 kg CO₂ earns no points.
        assert_eq!(test_support::reload(&db, h1.id).points, 350);
        assert_eq!(test_support::reload(&db, h2.id).points, 100);
        Ok(())
    }

    #[test]
    fn test_dynamic_badges_from_db_are_awarded_once() -> DbResult<()> {
        let db = test_support::db();
        let admin = test_support::user(&db, "admin@example.com", Role::Admin);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        db.save_badge(
            admin.id,
            None,
            BadgeInput {
                code: "co2_10".into(),
                name: "Ten Kilos".into(),
                description: String::new(),
                emoji: String::new(),
                rarity: Some(Rarity::Rare),
                points_bonus: 40,
            },
        )?;

        // 6 kg e-waste → 30 kg CO₂ → 60 points
        let out = credit(&db, buyer.id, ProductKind::EWaste, 6000, None).unwrap();
        let codes: Vec<&str> = out.new_badges.iter().map(|b| b.code.as_str()).collect();
        assert_eq!(codes, vec!["first_timer", "co2_10"]);

        let out = credit(&db, buyer.id, ProductKind::EWaste, 6000, None).unwrap();
        assert!(out.new_badges.iter().any(|b| b.code == "CO2_50"));
        assert!(out.new_badges.iter().all(|b| b.code != "co2_10"));

        let held: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM user_badges WHERE user_id = ?1",
            params![buyer.id],
            |row| row.get(0),
        )?;
        assert_eq!(held, 3);
        assert_eq!(test_support::reload(&db, buyer.id).points, 60 + 100 + 40 + 60 + 500);
        Ok(())
    }

    #[test]
    fn test_redeem_reward_checks_points_and_stock() -> DbResult<()> {
        let db = test_support::db();
        let admin = test_support::user(&db, "admin@example.com", Role::Admin);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let bag = db.save_reward(
            admin.id,
            None,
            RewardInput {
                title: "Tote bag".into(),
                cost_points: 100,
                stock: Some(1),
                is_active: true,
            },
        )?;

        assert!(matches!(
            db.redeem_reward(buyer.id, bag.id),
            Err(MarketError::BadRequest(_))
        ));

        credit(&db, buyer.id, ProductKind::Metal, 2500, None);
        let out = db.redeem_reward(buyer.id, bag.id)?;
        assert_eq!(out.redemption.points_spent, 100);
        assert_eq!(out.remaining_points, 10);

        let other = test_support::user(&db, "o@example.com", Role::Buyer);
        credit(&db, other.id, ProductKind::Metal, 2500, None);
        assert!(matches!(
            db.redeem_reward(other.id, bag.id),
            Err(MarketError::Conflict(_))
        ));
        assert_eq!(test_support::reload(&db, other.id).points, 110, "failed redemption spends nothing");
        Ok(())
    }

    #[test]
    fn test_inactive_reward_cannot_be_redeemed() -> DbResult<()> {
        let db = test_support::db();
        let admin = test_support::user(&db, "admin@example.com", Role::Admin);
        let item = db.save_reward(
            admin.id,
            None,
            RewardInput {
                title: "Mug".into(),
                cost_points: 0,
                stock: None,
                is_active: false,
            },
        )?;
        assert!(matches!(
            db.redeem_reward(admin.id, item.id),
            Err(MarketError::RewardNotFound { .. })
        ));
        assert!(db.list_rewards(false)?.is_empty());
        assert_eq!(db.list_rewards(true)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_save_badge_enforces_uniqueness_and_admin() -> DbResult<()> {
        let db = test_support::db();
        let admin = test_support::user(&db, "admin@example.com", Role::Admin);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let input = BadgeInput {
            code: "pickups_50".into(),
            name: "Fifty".into(),
            description: String::new(),
            emoji: String::new(),
            rarity: None,
            points_bonus: 0,
        };
        assert!(matches!(
            db.save_badge(buyer.id, None, input.clone()),
            Err(MarketError::Forbidden(_))
        ));
        let created = db.save_badge(admin.id, None, input.clone())?;
        assert_eq!(created.rarity, Rarity::Common);
        assert!(matches!(
            db.save_badge(admin.id, None, input),
            Err(MarketError::Conflict(_))
        ));

        let renamed = db.save_badge(
            admin.id,
            Some(created.id),
            BadgeInput {
                code: String::new(),
                name: "Fifty Pickups".into(),
                description: "d".into(),
                emoji: String::new(),
                rarity: Some(Rarity::Legendary),
                points_bonus: 5,
            },
        )?;
        assert_eq!(renamed.code, "pickups_50");
        assert_eq!(renamed.name, "Fifty Pickups");
        Ok(())
    }

    #[test]
    fn test_overview_and_leaderboard() -> DbResult<()> {
        let db = test_support::db();
        let a = test_support::user(&db, "a@example.com", Role::Buyer);
        let b = test_support::user(&db, "b@example.com", Role::Buyer);
        test_support::user(&db, "idle@example.com", Role::Buyer);
        credit(&db, a.id, ProductKind::Metal, 1000, None);
        credit(&db, b.id, ProductKind::EWaste, 2000, None);

        let board = db.leaderboard()?;
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].user_id, b.id);

        let overview = db.rewards_overview(a.id)?;
        assert_eq!(overview.total_pickups, 1);
        assert_eq!(overview.recent_badges.len(), 1);
        assert_eq!(overview.badges.iter().filter(|s| s.earned).count(), 1);
        assert_eq!(overview.badges.len(), 4);
        Ok(())
    }

    #[test]
    fn test_manual_activity_requires_admin() -> DbResult<()> {
        let db = test_support::db();
        let admin = test_support::user(&db, "admin@example.com", Role::Admin);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        assert!(matches!(
            db.log_manual_activity(buyer.id, buyer.id, ProductKind::Paper, Mass::from_kg(1)),
            Err(MarketError::Forbidden(_))
        ));
        let out = db.log_manual_activity(admin.id, buyer.id, ProductKind::Paper, Mass::from_kg(1))?;
        assert_eq!(out.activity.co2_saved_kg.grams(), 1800);
        assert_eq!(db.activity_history(buyer.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_manual_activity_rejects_weight_above_bound() -> DbResult<()> {
        let db = test_support::db();
        let admin = test_support::user(&db, "admin@example.com", Role::Admin);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let huge = Mass::from_kg(9_000_000_000_000_000);
        assert!(matches!(
            db.log_manual_activity(admin.id, buyer.id, ProductKind::EWaste, huge),
            Err(MarketError::BadRequest(_))
        ));
        assert!(db.activity_history(buyer.id)?.is_empty());

        let out = db.log_manual_activity(admin.id, buyer.id, ProductKind::EWaste, Mass::MAX)?;
        assert_eq!(out.activity.co2_saved_kg.grams(), 499_999_995);
        Ok(())
    }
}
