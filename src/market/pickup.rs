//! Pickup requests and their state machine.
//!
//! A requester's offer becomes a product snapshot plus one `pending` request
//! per matching collector. The first collector to accept wins: the sibling
//! requests are declined in the same transaction and the partial unique index
//! `idx_pickup_single_acceptance` backs the rule at the storage layer.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::db::{
    DbResult, MarketDb, collect_rows, fetch_product, insert_product, is_unique_violation,
    mass_col, money_col, parse_col, require_user,
};
use super::models::*;
use super::notifications::{NewNotification, push_notification};
use super::rewards::{ActivityOutcome, log_activity};
use super::units::{Mass, Money};
use crate::errors::MarketError;

#[derive(Debug, Clone, Deserialize)]
pub struct PickupOrder {
    pub kind: ProductKind,
    pub weight_kg: Mass,
    #[serde(default)]
    pub price: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct PickupFanout {
    pub product: Product,
    pub collectors_reached: usize,
    pub pickups: Vec<PickupRequest>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub pickup: PickupRequest,
    /// Sibling requests declined because this one was accepted.
    pub declined_siblings: usize,
    /// Ledger entries written on completion.
    pub activities: Vec<ActivityOutcome>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

const PICKUP_COLUMNS: &str = "p.id, p.requester_id, p.collector_id, p.product_id, p.kind, \
     p.weight_g, p.price_cents, p.status, p.created_at, p.updated_at";

fn pickup_from_row(row: &Row<'_>) -> rusqlite::Result<PickupRequest> {
    Ok(PickupRequest {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        collector_id: row.get(2)?,
        product_id: row.get(3)?,
        kind: parse_col(row, 4)?,
        weight_kg: mass_col(row, 5)?,
        price: money_col(row, 6)?,
        status: parse_col(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn pickup_view_from_row(row: &Row<'_>) -> rusqlite::Result<PickupView> {
    Ok(PickupView {
        pickup: pickup_from_row(row)?,
        requester_name: row.get(10)?,
        requester_email: row.get(11)?,
        collector_name: row.get(12)?,
    })
}

pub(super) fn fetch_pickup(conn: &Connection, id: i64) -> DbResult<Option<PickupRequest>> {
    let sql = format!("SELECT {} FROM pickup_requests p WHERE p.id = ?1", PICKUP_COLUMNS);
    Ok(conn.query_row(&sql, params![id], pickup_from_row).optional()?)
}

/// Pickups joined with party names, filtered by `filter` (a WHERE clause
/// fragment over alias `p`).
pub(super) fn pickup_views<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
    limit: Option<i64>,
) -> DbResult<Vec<PickupView>> {
    let mut sql = format!(
        "SELECT {}, r.name, r.email, c.name
         FROM pickup_requests p
         JOIN users r ON r.id = p.requester_id
         JOIN users c ON c.id = p.collector_id
         WHERE {}
         ORDER BY p.created_at DESC, p.id DESC",
        PICKUP_COLUMNS, filter
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    collect_rows(conn, &sql, params, pickup_view_from_row)
}

/// Load a pickup owned by `collector_id` and check the move to `next`.
fn collector_pickup(
    conn: &Connection,
    collector_id: i64,
    id: i64,
    next: PickupStatus,
) -> DbResult<PickupRequest> {
    let pickup = fetch_pickup(conn, id)?
        .filter(|p| p.collector_id == collector_id)
        .ok_or(MarketError::PickupNotFound { id })?;
    if !pickup.status.can_transition_to(next) {
        return Err(MarketError::InvalidTransition {
            id,
            from: pickup.status.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }
    Ok(pickup)
}

fn set_status(conn: &Connection, id: i64, status: PickupStatus) -> DbResult<()> {
    conn.execute(
        "UPDATE pickup_requests SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![status.as_str(), id],
    )?;
    Ok(())
}

fn requester_notice(
    conn: &Connection,
    pickup: &PickupRequest,
    title: &str,
    message: String,
) -> DbResult<Notification> {
    push_notification(
        conn,
        NewNotification {
            user_id: pickup.requester_id,
            title: title.to_string(),
            message,
            category: NotificationCategory::General,
            link_url: String::new(),
            payload: serde_json::json!({
                "pickup_id": pickup.id,
                "collector_id": pickup.collector_id,
            }),
        },
    )
}

impl MarketDb {
    /// Offer material for pickup to every matching collector.
    pub fn request_pickup(&self, requester_id: i64, order: PickupOrder) -> DbResult<PickupFanout> {
        if !order.weight_kg.is_valid_quantity() {
            return Err(MarketError::bad_request(format!(
                "Weight must be greater than zero and at most {} kg",
                Mass::MAX
            )));
        }
        if order.price.cents() < 0 || order.price > Money::MAX {
            return Err(MarketError::bad_request("Price must not be negative"));
        }

        let tx = self.conn.unchecked_transaction()?;
        let requester = require_user(&tx, requester_id)?;
        if !requester.role.can_request_pickup() || !requester.is_active {
            return Err(MarketError::forbidden("Only households and buyers can request pickups"));
        }

        let product = insert_product(&tx, order.kind, order.weight_kg, order.price)?;
        let collectors: Vec<(i64, String)> = collect_rows(
            &tx,
            "SELECT id, name FROM users
             WHERE role = 'collector' AND is_approved = 1 AND is_active = 1
               AND collector_product = ?1 AND id != ?2
             ORDER BY id",
            params![order.kind.as_str(), requester_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut pickups = Vec::with_capacity(collectors.len());
        let mut notifications = Vec::with_capacity(collectors.len());
        for (collector_id, _) in &collectors {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO pickup_requests
                     (requester_id, collector_id, product_id, kind, weight_g, price_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    requester_id,
                    collector_id,
                    product.id,
                    order.kind.as_str(),
                    order.weight_kg.grams(),
                    order.price.cents()
                ],
            )?;
            if inserted == 0 {
                continue;
            }
            let pickup = fetch_pickup(&tx, tx.last_insert_rowid())?
                .ok_or_else(|| anyhow::anyhow!("Pickup not found after insert"))?;
            notifications.push(push_notification(
                &tx,
                NewNotification {
                    user_id: *collector_id,
                    title: "New pickup request".to_string(),
                    message: format!(
                        "{} offers {} kg of {}.",
                        requester.name,
                        order.weight_kg,
                        order.kind.label()
                    ),
                    category: NotificationCategory::General,
                    link_url: String::new(),
                    payload: serde_json::json!({
                        "pickup_id": pickup.id,
                        "product_id": product.id,
                    }),
                },
            )?);
            pickups.push(pickup);
        }
        tx.commit()?;

        tracing::info!(
            requester_id,
            product_id = product.id,
            kind = order.kind.as_str(),
            collectors = pickups.len(),
            "pickup requested"
        );
        Ok(PickupFanout {
            product,
            collectors_reached: pickups.len(),
            pickups,
            notifications,
        })
    }

    /// Accept a pending request and decline every other pending request for
    /// the same product.
    pub fn accept_pickup(&self, collector_id: i64, id: i64) -> DbResult<TransitionOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let pickup = collector_pickup(&tx, collector_id, id, PickupStatus::Accepted)?;

        let declined_ids: Vec<(i64, i64)> = collect_rows(
            &tx,
            "SELECT id, requester_id FROM pickup_requests
             WHERE product_id = ?1 AND status = 'pending' AND id != ?2",
            params![pickup.product_id, id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.execute(
            "UPDATE pickup_requests SET status = 'declined', updated_at = datetime('now')
             WHERE product_id = ?1 AND status = 'pending' AND id != ?2",
            params![pickup.product_id, id],
        )?;

        match tx.execute(
            "UPDATE pickup_requests SET status = 'accepted', updated_at = datetime('now') WHERE id = ?1",
            params![id],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(MarketError::conflict("Product already accepted by another collector"));
            }
            Err(e) => return Err(e.into()),
        }

        let pickup = fetch_pickup(&tx, id)?.ok_or(MarketError::PickupNotFound { id })?;
        let collector = require_user(&tx, collector_id)?;
        let note = requester_notice(
            &tx,
            &pickup,
            "Pickup accepted",
            format!("{} accepted your pickup request.", collector.name),
        )?;
        tx.commit()?;

        tracing::info!(
            pickup_id = id,
            collector_id,
            declined = declined_ids.len(),
            "pickup accepted"
        );
        Ok(TransitionOutcome {
            pickup,
            declined_siblings: declined_ids.len(),
            activities: Vec::new(),
            notifications: vec![note],
        })
    }

    pub fn decline_pickup(&self, collector_id: i64, id: i64) -> DbResult<TransitionOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        collector_pickup(&tx, collector_id, id, PickupStatus::Declined)?;
        set_status(&tx, id, PickupStatus::Declined)?;
        let pickup = fetch_pickup(&tx, id)?.ok_or(MarketError::PickupNotFound { id })?;
        let note = requester_notice(
            &tx,
            &pickup,
            "Pickup declined",
            "A collector declined your pickup request.".to_string(),
        )?;
        tx.commit()?;

        tracing::info!(pickup_id = id, collector_id, "pickup declined");
        Ok(TransitionOutcome {
            pickup,
            declined_siblings: 0,
            activities: Vec::new(),
            notifications: vec![note],
        })
    }

    /// Complete an accepted pickup and credit the requester and the collector.
    pub fn complete_pickup(&self, collector_id: i64, id: i64) -> DbResult<TransitionOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        collector_pickup(&tx, collector_id, id, PickupStatus::Completed)?;
        set_status(&tx, id, PickupStatus::Completed)?;
        let pickup = fetch_pickup(&tx, id)?.ok_or(MarketError::PickupNotFound { id })?;
        let product = fetch_product(&tx, pickup.product_id)?
            .ok_or_else(|| anyhow::anyhow!("Product {} missing for pickup {}", pickup.product_id, id))?;

        let mut notifications = vec![requester_notice(
            &tx,
            &pickup,
            "Pickup completed",
            format!("Your {} pickup is complete.", pickup.kind.label()),
        )?];
        let mut activities = Vec::new();
        for user_id in [pickup.requester_id, pickup.collector_id] {
            if let Some(mut outcome) = log_activity(&tx, user_id, &product, pickup.weight_kg, Some(id))? {
                notifications.append(&mut outcome.notifications);
                activities.push(outcome);
            }
        }
        tx.commit()?;

        tracing::info!(pickup_id = id, collector_id, credited = activities.len(), "pickup completed");
        Ok(TransitionOutcome {
            pickup,
            declined_siblings: 0,
            activities,
            notifications,
        })
    }

    pub fn get_pickup(&self, id: i64) -> DbResult<PickupRequest> {
        fetch_pickup(&self.conn, id)?.ok_or(MarketError::PickupNotFound { id })
    }

    /// Everything a requester has asked for, newest first.
    pub fn requester_pickups(&self, requester_id: i64) -> DbResult<Vec<PickupView>> {
        pickup_views(&self.conn, "p.requester_id = ?1", params![requester_id], None)
    }

    /// A collector's queue, optionally restricted to one status.
    pub fn collector_pickups(
        &self,
        collector_id: i64,
        status: Option<PickupStatus>,
    ) -> DbResult<Vec<PickupView>> {
        match status {
            Some(status) => pickup_views(
                &self.conn,
                "p.collector_id = ?1 AND p.status = ?2",
                params![collector_id, status.as_str()],
                None,
            ),
            None => pickup_views(&self.conn, "p.collector_id = ?1", params![collector_id], None),
        }
    }
}
