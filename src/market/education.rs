use rusqlite::{OptionalExtension, Row, params};
use serde::Deserialize;

use super::accounts::require_admin;
use super::db::{DbResult, MarketDb, collect_rows};
use super::models::Guide;
use crate::errors::MarketError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewGuide {
    pub title: String,
    pub category: Option<String>,
    pub description: Option<String>,
    /// Minutes.
    pub read_time: i64,
}

const GUIDE_COLUMNS: &str = "id, title, category, description, read_time, downloads, created_at";

fn guide_from_row(row: &Row<'_>) -> rusqlite::Result<Guide> {
    Ok(Guide {
        id: row.get(0)?,
        title: row.get(1)?,
        category: row.get(2)?,
        description: row.get(3)?,
        read_time: row.get(4)?,
        downloads: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl MarketDb {
    pub fn list_guides(&self, category: Option<&str>) -> DbResult<Vec<Guide>> {
        match category.map(str::trim).filter(|c| !c.is_empty()) {
            Some(category) => {
                let sql = format!(
                    "SELECT {} FROM guides WHERE LOWER(category) = LOWER(?1) ORDER BY created_at DESC, id DESC",
                    GUIDE_COLUMNS
                );
                collect_rows(&self.conn, &sql, params![category], guide_from_row)
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM guides ORDER BY created_at DESC, id DESC",
                    GUIDE_COLUMNS
                );
                collect_rows(&self.conn, &sql, [], guide_from_row)
            }
        }
    }

    pub fn get_guide(&self, id: i64) -> DbResult<Guide> {
        let sql = format!("SELECT {} FROM guides WHERE id = ?1", GUIDE_COLUMNS);
        self.conn
            .query_row(&sql, params![id], guide_from_row)
            .optional()?
            .ok_or(MarketError::GuideNotFound { id })
    }

    pub fn create_guide(&self, actor_id: i64, new: NewGuide) -> DbResult<Guide> {
        require_admin(&self.conn, actor_id)?;
        let title = new.title.trim();
        if title.is_empty() {
            return Err(MarketError::bad_request("Guide title is required"));
        }
        if new.read_time < 0 {
            return Err(MarketError::bad_request("read_time must not be negative"));
        }
        self.conn.execute(
            "INSERT INTO guides (title, category, description, read_time) VALUES (?1, ?2, ?3, ?4)",
            params![
                title,
                non_blank(new.category),
                non_blank(new.description),
                new.read_time
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(guide_id = id, actor_id, "guide created");
        self.get_guide(id)
    }

    /// Count a download (or view) and return the updated guide.
    pub fn record_download(&self, id: i64) -> DbResult<Guide> {
        let count = self.conn.execute(
            "UPDATE guides SET downloads = downloads + 1 WHERE id = ?1",
            params![id],
        )?;
        if count == 0 {
            return Err(MarketError::GuideNotFound { id });
        }
        self.get_guide(id)
    }
}
