use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use super::db::{DbResult, MarketDb, collect_rows, parse_col};
use super::models::{Notification, NotificationCategory};
use crate::errors::MarketError;

/// How many notifications the inbox returns.
pub const INBOX_LIMIT: i64 = 100;

pub struct NewNotification {
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
    pub link_url: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Inbox {
    pub items: Vec<Notification>,
    pub total_count: i64,
    pub unread_count: i64,
}

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, title, message, category, link_url, payload, is_read, created_at";

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let payload: String = row.get(6)?;
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        category: parse_col(row, 4)?,
        link_url: row.get(5)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        is_read: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Insert a notification on `conn`, which is usually the open transaction of
/// the action that caused it, so a rollback discards the notification too.
pub(super) fn push_notification(conn: &Connection, new: NewNotification) -> DbResult<Notification> {
    conn.execute(
        "INSERT INTO notifications (user_id, title, message, category, link_url, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.user_id,
            new.title,
            new.message,
            new.category.as_str(),
            new.link_url,
            new.payload.to_string(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    let sql = format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS);
    Ok(conn.query_row(&sql, params![id], notification_from_row)?)
}

impl MarketDb {
    pub fn inbox(&self, user_id: i64) -> DbResult<Inbox> {
        let sql = format!(
            "SELECT {} FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            NOTIFICATION_COLUMNS
        );
        let items = collect_rows(&self.conn, &sql, params![user_id, INBOX_LIMIT], notification_from_row)?;
        let (total_count, unread_count): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0)
             FROM notifications WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Inbox {
            items,
            total_count,
            unread_count,
        })
    }

    pub fn mark_notification_read(&self, user_id: i64, id: i64) -> DbResult<Notification> {
        let count = self.conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if count == 0 {
            return Err(MarketError::NotificationNotFound { id });
        }
        let sql = format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS);
        self.conn
            .query_row(&sql, params![id], notification_from_row)
            .optional()?
            .ok_or(MarketError::NotificationNotFound { id })
    }

    pub fn mark_all_notifications_read(&self, user_id: i64) -> DbResult<usize> {
        Ok(self.conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
            params![user_id],
        )?)
    }

    /// Delete one of the user's notifications. Someone else's id is reported
    /// as not found.
    pub fn delete_notification(&self, user_id: i64, id: i64) -> DbResult<()> {
        let count = self.conn.execute(
            "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if count == 0 {
            return Err(MarketError::NotificationNotFound { id });
        }
        Ok(())
    }

    pub fn delete_all_notifications(&self, user_id: i64) -> DbResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM notifications WHERE user_id = ?1", params![user_id])?)
    }
}
