use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use super::db::{DbResult, MarketDb, USER_COLUMNS, collect_rows, require_user, user_from_row};
use super::models::{Role, User};
use crate::errors::MarketError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RatingSummary {
    pub average: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommunityMember {
    #[serde(flatten)]
    pub user: User,
    /// Present for collectors only.
    pub rating: Option<RatingSummary>,
    /// The viewer's own rating of this collector, if any.
    pub my_rating: Option<i64>,
}

fn rating_summary(conn: &rusqlite::Connection, collector_id: i64) -> DbResult<RatingSummary> {
    let (average, count): (f64, i64) = conn.query_row(
        "SELECT COALESCE(AVG(stars), 0.0), COUNT(*) FROM collector_ratings WHERE collector_id = ?1",
        params![collector_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(RatingSummary {
        average: (average * 100.0).round() / 100.0,
        count,
    })
}

impl MarketDb {
    /// Rate a collector 1–5 stars. Rating again replaces the earlier score.
    pub fn rate_collector(&self, rater_id: i64, collector_id: i64, stars: i64) -> DbResult<RatingSummary> {
        if !(1..=5).contains(&stars) {
            return Err(MarketError::bad_request("Stars must be between 1 and 5"));
        }
        if rater_id == collector_id {
            return Err(MarketError::forbidden("You cannot rate yourself"));
        }
        let tx = self.conn.unchecked_transaction()?;
        require_user(&tx, rater_id)?;
        let collector = require_user(&tx, collector_id)?;
        if collector.role != Role::Collector {
            return Err(MarketError::bad_request("Only collectors can be rated"));
        }
        tx.execute(
            "INSERT INTO collector_ratings (rater_id, collector_id, stars) VALUES (?1, ?2, ?3)
             ON CONFLICT(rater_id, collector_id)
             DO UPDATE SET stars = excluded.stars, updated_at = datetime('now')",
            params![rater_id, collector_id, stars],
        )?;
        let summary = rating_summary(&tx, collector_id)?;
        tx.commit()?;
        tracing::debug!(rater_id, collector_id, stars, average = summary.average, "collector rated");
        Ok(summary)
    }

    pub fn collector_rating(&self, collector_id: i64) -> DbResult<RatingSummary> {
        rating_summary(&self.conn, collector_id)
    }

    /// Everyone but admins and the viewer, collectors with their rating.
    pub fn community(&self, viewer_id: i64) -> DbResult<Vec<CommunityMember>> {
        let sql = format!(
            "SELECT {} FROM users
             WHERE id != ?1 AND role != 'admin' AND is_staff = 0 AND is_superuser = 0 AND is_active = 1
             ORDER BY role, name, id",
            USER_COLUMNS
        );
        let users = collect_rows(&self.conn, &sql, params![viewer_id], user_from_row)?;
        let mut members = Vec::with_capacity(users.len());
        for user in users {
            let (rating, my_rating) = if user.role == Role::Collector {
                let mine: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT stars FROM collector_ratings WHERE rater_id = ?1 AND collector_id = ?2",
                        params![viewer_id, user.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                (Some(rating_summary(&self.conn, user.id)?), mine)
            } else {
                (None, None)
            };
            members.push(CommunityMember {
                user,
                rating,
                my_rating,
            });
        }
        Ok(members)
    }
}
