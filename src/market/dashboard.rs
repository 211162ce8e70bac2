//! Read-only dashboard aggregates for collectors and requesters.

use rusqlite::{Connection, params};
use serde::Serialize;

use super::db::{DbResult, MarketDb, collect_rows, parse_col, require_user};
use super::listings::orders_where;
use super::models::*;
use super::pickup::pickup_views;
use super::units::{Mass, Money};
use crate::errors::MarketError;

const PICKUPS_PER_STATUS: i64 = 20;
const ORDERS_PER_STATUS: i64 = 10;
const RECENT_ITEMS: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ImpactStats {
    pub points: i64,
    pub total_pickups: i64,
    pub total_weight_kg: Mass,
    pub total_co2_kg: Mass,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStats {
    pub total_orders: i64,
    pub pending: i64,
    pub delivered: i64,
    /// Revenue for sellers, spend for buyers.
    pub total_amount: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorDashboard {
    pub stats: ImpactStats,
    pub pending_pickups: Vec<PickupView>,
    pub accepted_pickups: Vec<PickupView>,
    pub completed_pickups: Vec<PickupView>,
    pub pending_orders: Vec<MarketOrder>,
    pub delivered_orders: Vec<MarketOrder>,
    pub order_stats: OrderStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequesterDashboard {
    pub stats: ImpactStats,
    pub recent_pickups: Vec<PickupView>,
    pub recent_orders: Vec<MarketOrder>,
    pub order_stats: OrderStats,
}

fn order_stats(conn: &Connection, party_column: &str, user_id: i64) -> DbResult<OrderStats> {
    let sql = format!(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(total_price_cents), 0)
         FROM market_orders WHERE {} = ?1",
        party_column
    );
    Ok(conn.query_row(&sql, params![user_id], |row| {
        Ok(OrderStats {
            total_orders: row.get(0)?,
            pending: row.get(1)?,
            delivered: row.get(2)?,
            total_amount: Money::from_cents(row.get(3)?),
        })
    })?)
}

impl MarketDb {
    pub fn collector_dashboard(&self, collector_id: i64) -> DbResult<CollectorDashboard> {
        let user = require_user(&self.conn, collector_id)?;
        if user.role != Role::Collector {
            return Err(MarketError::forbidden(
                "Collector dashboard is only for Collector accounts.",
            ));
        }

        // Estimated from completed pickups, not from the collector's ledger.
        let completed: Vec<(ProductKind, i64)> = collect_rows(
            &self.conn,
            "SELECT kind, weight_g FROM pickup_requests WHERE collector_id = ?1 AND status = 'completed'",
            params![collector_id],
            |row| Ok((parse_col(row, 0)?, row.get(1)?)),
        )?;
        let mut total_weight = Mass::ZERO;
        let mut total_co2 = Mass::ZERO;
        for (kind, grams) in &completed {
            let weight = Mass::from_grams(*grams);
            total_weight += weight;
            total_co2 += kind
                .co2_saved(weight)
                .ok_or_else(|| anyhow::anyhow!("CO2 estimate overflow for {} g", grams))?;
        }

        let by_status = |status: &str| {
            pickup_views(
                &self.conn,
                "p.collector_id = ?1 AND p.status = ?2",
                params![collector_id, status],
                Some(PICKUPS_PER_STATUS),
            )
        };
        let orders_by_status = |status: &str| {
            orders_where(
                &self.conn,
                "collector_id = ?1 AND status = ?2",
                params![collector_id, status],
                Some(ORDERS_PER_STATUS),
            )
        };

        Ok(CollectorDashboard {
            stats: ImpactStats {
                points: user.points,
                total_pickups: completed.len() as i64,
                total_weight_kg: total_weight,
                total_co2_kg: total_co2,
            },
            pending_pickups: by_status(PickupStatus::Pending.as_str())?,
            accepted_pickups: by_status(PickupStatus::Accepted.as_str())?,
            completed_pickups: by_status(PickupStatus::Completed.as_str())?,
            pending_orders: orders_by_status(OrderStatus::Pending.as_str())?,
            delivered_orders: orders_by_status(OrderStatus::Delivered.as_str())?,
            order_stats: order_stats(&self.conn, "collector_id", collector_id)?,
        })
    }

    /// Dashboard for households, buyers and recyclers.
    pub fn requester_dashboard(&self, user_id: i64) -> DbResult<RequesterDashboard> {
        let user = require_user(&self.conn, user_id)?;
        if !user.role.can_request_pickup() {
            return Err(MarketError::forbidden(
                "This dashboard is for households, buyers and recyclers.",
            ));
        }
        let weight_g: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(weight_g), 0) FROM activities WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        Ok(RequesterDashboard {
            stats: ImpactStats {
                points: user.points,
                total_pickups: user.total_pickups,
                total_weight_kg: Mass::from_grams(weight_g),
                total_co2_kg: user.total_co2_saved_kg,
            },
            recent_pickups: pickup_views(
                &self.conn,
                "p.requester_id = ?1",
                params![user_id],
                Some(RECENT_ITEMS),
            )?,
            recent_orders: orders_where(
                &self.conn,
                "buyer_id = ?1",
                params![user_id],
                Some(RECENT_ITEMS),
            )?,
            order_stats: order_stats(&self.conn, "buyer_id", user_id)?,
        })
    }
}
