//! Marketplace listings and cash-on-delivery orders.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use super::db::{DbResult, MarketDb, collect_rows, mass_col, money_col, parse_col, require_user};
use super::models::*;
use super::notifications::{NewNotification, push_notification};
use super::units::{Mass, Money};
use crate::errors::MarketError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
    pub name: String,
    pub product_type: ProductKind,
    pub grade: i64,
    #[serde(default = "default_available")]
    pub is_available: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    pub weight_kg: Mass,
    pub price: Money,
    #[serde(default)]
    pub tags: Vec<MarketTag>,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrder {
    PriceAsc,
    PriceDesc,
    Newest,
}

impl ListingOrder {
    /// Unknown values fall back to newest first.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("price_asc") => Self::PriceAsc,
            Some("price_desc") => Self::PriceDesc,
            _ => Self::Newest,
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            Self::PriceAsc => "l.price_cents ASC, l.id DESC",
            Self::PriceDesc => "l.price_cents DESC, l.id DESC",
            Self::Newest => "l.id DESC",
        }
    }
}

/// Marketplace search parameters, as they arrive on the query string.
/// Values that do not parse are ignored rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingFilter {
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub product_type: Option<String>,
    pub min_rating: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOutcome {
    pub order: MarketOrder,
    pub listing: Listing,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub order: MarketOrder,
    pub already_delivered: bool,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

const LISTING_COLUMNS: &str = "l.id, l.seller_id, l.name, l.product_type, l.grade, l.is_available, \
     l.description, l.location, l.weight_g, l.price_cents, l.created_at";

const SELLER_AVERAGE: &str =
    "COALESCE((SELECT AVG(stars) FROM collector_ratings WHERE collector_id = l.seller_id), 0.0)";

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<Listing> {
    Ok(Listing {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        name: row.get(2)?,
        product_type: parse_col(row, 3)?,
        grade: row.get(4)?,
        is_available: row.get(5)?,
        description: row.get(6)?,
        location: row.get(7)?,
        weight_kg: mass_col(row, 8)?,
        price: money_col(row, 9)?,
        tags: Vec::new(),
        created_at: row.get(10)?,
    })
}

fn listing_view_from_row(row: &Row<'_>) -> rusqlite::Result<ListingView> {
    let average: f64 = row.get(12)?;
    Ok(ListingView {
        listing: listing_from_row(row)?,
        seller_name: row.get(11)?,
        seller_average_rating: (average * 100.0).round() / 100.0,
        seller_ratings_count: row.get(13)?,
    })
}

fn listing_tags(conn: &Connection, listing_id: i64) -> DbResult<Vec<MarketTag>> {
    collect_rows(
        conn,
        "SELECT tag FROM listing_tags WHERE listing_id = ?1 ORDER BY tag",
        params![listing_id],
        |row| parse_col(row, 0),
    )
}

fn fetch_listing(conn: &Connection, id: i64) -> DbResult<Option<Listing>> {
    let sql = format!("SELECT {} FROM listings l WHERE l.id = ?1", LISTING_COLUMNS);
    let Some(mut listing) = conn.query_row(&sql, params![id], listing_from_row).optional()? else {
        return Ok(None);
    };
    listing.tags = listing_tags(conn, id)?;
    Ok(Some(listing))
}

const ORDER_COLUMNS: &str = "id, order_no, buyer_id, collector_id, listing_id, product_name, \
     weight_g, unit_price_cents, total_price_cents, status, created_at, updated_at";

pub(super) fn order_from_row(row: &Row<'_>) -> rusqlite::Result<MarketOrder> {
    Ok(MarketOrder {
        id: row.get(0)?,
        order_no: row.get(1)?,
        buyer_id: row.get(2)?,
        collector_id: row.get(3)?,
        listing_id: row.get(4)?,
        product_name: row.get(5)?,
        weight_kg: mass_col(row, 6)?,
        unit_price: money_col(row, 7)?,
        total_price: money_col(row, 8)?,
        status: parse_col(row, 9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub(super) fn orders_where<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
    limit: Option<i64>,
) -> DbResult<Vec<MarketOrder>> {
    let mut sql = format!(
        "SELECT {} FROM market_orders WHERE {} ORDER BY created_at DESC, id DESC",
        ORDER_COLUMNS, filter
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    collect_rows(conn, &sql, params, order_from_row)
}

fn fetch_order(conn: &Connection, id: i64) -> DbResult<Option<MarketOrder>> {
    let sql = format!("SELECT {} FROM market_orders WHERE id = ?1", ORDER_COLUMNS);
    Ok(conn.query_row(&sql, params![id], order_from_row).optional()?)
}

/// `RC-<yyyymmdd>-<8 hex>`; the UNIQUE column catches the improbable clash.
fn generate_order_no() -> String {
    let date = chrono::Utc::now().format("%Y%m%d");
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("RC-{}-{}", date, suffix)
}

/// Escape `%`, `_` and `\` so user text matches literally under `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl MarketDb {
    /// List a lot for sale. Only approved, active collectors can sell.
    pub fn create_listing(&self, seller_id: i64, new: NewListing) -> DbResult<Listing> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(MarketError::bad_request("name: Name is required."));
        }
        if !new.weight_kg.is_valid_quantity() {
            return Err(MarketError::bad_request(format!(
                "weight: Weight must be > 0 and at most {} kg.",
                Mass::MAX
            )));
        }
        if new.price.cents() < 0 || new.price > Money::MAX {
            return Err(MarketError::bad_request("price: Price must be ≥ 0."));
        }

        let tx = self.conn.unchecked_transaction()?;
        let seller = require_user(&tx, seller_id)?;
        if seller.role != Role::Collector || !seller.is_approved || !seller.is_active {
            return Err(MarketError::forbidden("Only approved Collector can add products."));
        }
        tx.execute(
            "INSERT INTO listings (seller_id, name, product_type, grade, is_available, description, location, weight_g, price_cents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                seller_id,
                name,
                new.product_type.as_str(),
                new.grade,
                new.is_available,
                new.description.trim(),
                new.location.trim(),
                new.weight_kg.grams(),
                new.price.cents()
            ],
        )?;
        let id = tx.last_insert_rowid();
        for tag in &new.tags {
            tx.execute(
                "INSERT OR IGNORE INTO listing_tags (listing_id, tag) VALUES (?1, ?2)",
                params![id, tag.as_str()],
            )?;
        }
        let listing = fetch_listing(&tx, id)?.ok_or(MarketError::ListingNotFound { id })?;
        tx.commit()?;
        tracing::info!(listing_id = id, seller_id, "listing created");
        Ok(listing)
    }

    /// Search the marketplace. Admins also see unavailable listings.
    pub fn list_listings(&self, viewer: &User, filter: &ListingFilter) -> DbResult<Vec<ListingView>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !viewer.is_admin() {
            clauses.push("l.is_available = 1".to_string());
        }
        if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let n = values.len() + 1;
            clauses.push(format!(
                "(LOWER(l.name) LIKE ?{n} ESCAPE '\\' OR LOWER(l.description) LIKE ?{n} ESCAPE '\\' \
                 OR LOWER(l.location) LIKE ?{n} ESCAPE '\\')"
            ));
            values.push(Value::Text(format!("%{}%", escape_like(&q.to_lowercase()))));
        }
        if let Some(kind) = filter
            .product_type
            .as_deref()
            .and_then(|t| t.trim().parse::<ProductKind>().ok())
        {
            clauses.push(format!("l.product_type = ?{}", values.len() + 1));
            values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(min) = filter
            .min_rating
            .as_deref()
            .and_then(|r| r.trim().parse::<f64>().ok())
        {
            clauses.push(format!("{} >= ?{}", SELLER_AVERAGE, values.len() + 1));
            values.push(Value::Real(min));
        }

        let where_sql = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        let sql = format!(
            "SELECT {}, u.name, {}, (SELECT COUNT(*) FROM collector_ratings WHERE collector_id = l.seller_id)
             FROM listings l JOIN users u ON u.id = l.seller_id
             WHERE {}
             ORDER BY {}",
            LISTING_COLUMNS,
            SELLER_AVERAGE,
            where_sql,
            ListingOrder::parse(filter.order.as_deref()).sql()
        );
        let mut views = collect_rows(&self.conn, &sql, params_from_iter(values), listing_view_from_row)?;
        for view in &mut views {
            view.listing.tags = listing_tags(&self.conn, view.listing.id)?;
        }
        Ok(views)
    }

    pub fn listing_detail(&self, id: i64) -> DbResult<ListingView> {
        let sql = format!(
            "SELECT {}, u.name, {}, (SELECT COUNT(*) FROM collector_ratings WHERE collector_id = l.seller_id)
             FROM listings l JOIN users u ON u.id = l.seller_id
             WHERE l.id = ?1",
            LISTING_COLUMNS, SELLER_AVERAGE
        );
        let mut view = self
            .conn
            .query_row(&sql, params![id], listing_view_from_row)
            .optional()?
            .ok_or(MarketError::ListingNotFound { id })?;
        view.listing.tags = listing_tags(&self.conn, id)?;
        Ok(view)
    }

    /// Buy `weight` of a listing. Orders are cash on delivery and cannot be
    /// cancelled once placed.
    pub fn buy_listing(&self, buyer_id: i64, listing_id: i64, weight: Mass) -> DbResult<PurchaseOutcome> {
        let weight = weight.round_to_centikg();
        if !weight.is_valid_quantity() {
            return Err(MarketError::bad_request("Enter a valid weight (> 0)."));
        }

        let tx = self.conn.unchecked_transaction()?;
        let buyer = require_user(&tx, buyer_id)?;
        if !buyer.is_active {
            return Err(MarketError::AccountInactive);
        }
        let listing = fetch_listing(&tx, listing_id)?
            .filter(|l| l.is_available)
            .ok_or(MarketError::ListingNotFound { id: listing_id })?;
        if listing.seller_id == buyer_id {
            return Err(MarketError::forbidden("You cannot buy your own listing."));
        }
        if listing.weight_kg < weight {
            return Err(MarketError::bad_request(format!(
                "Only {} kg available.",
                listing.weight_kg
            )));
        }

        let total = listing
            .price
            .per_kg_times(weight)
            .ok_or_else(|| MarketError::bad_request("Order total is out of range."))?;
        tx.execute(
            "UPDATE listings SET weight_g = weight_g - ?1,
                 is_available = CASE WHEN weight_g - ?1 <= 0 THEN 0 ELSE is_available END
             WHERE id = ?2",
            params![weight.grams(), listing_id],
        )?;

        let order_no = generate_order_no();
        tx.execute(
            "INSERT INTO market_orders (order_no, buyer_id, collector_id, listing_id, product_name, weight_g, unit_price_cents, total_price_cents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                order_no,
                buyer_id,
                listing.seller_id,
                listing_id,
                listing.name,
                weight.grams(),
                listing.price.cents(),
                total.cents()
            ],
        )?;
        let order_id = tx.last_insert_rowid();
        let order = fetch_order(&tx, order_id)?.ok_or(MarketError::OrderNotFound { id: order_id })?;
        let listing = fetch_listing(&tx, listing_id)?.ok_or(MarketError::ListingNotFound { id: listing_id })?;

        let payload = serde_json::json!({
            "order_id": order.id,
            "order_no": order.order_no,
            "listing_id": listing_id,
        });
        let notifications = vec![
            push_notification(
                &tx,
                NewNotification {
                    user_id: buyer_id,
                    title: "Order placed".to_string(),
                    message: format!(
                        "Your order {} for {} kg of {} has been placed. Total amount: {}. \
                         Please pay cash on delivery.",
                        order.order_no, weight, listing.name, total
                    ),
                    category: NotificationCategory::Order,
                    link_url: String::new(),
                    payload: payload.clone(),
                },
            )?,
            push_notification(
                &tx,
                NewNotification {
                    user_id: listing.seller_id,
                    title: "New order".to_string(),
                    message: format!(
                        "{} ordered {} kg of {} ({}).",
                        buyer.name, weight, listing.name, order.order_no
                    ),
                    category: NotificationCategory::Order,
                    link_url: String::new(),
                    payload,
                },
            )?,
        ];
        tx.commit()?;

        tracing::info!(
            order_no = %order.order_no,
            listing_id,
            buyer_id,
            weight_g = weight.grams(),
            total_cents = total.cents(),
            "order placed"
        );
        Ok(PurchaseOutcome {
            order,
            listing,
            notifications,
        })
    }

    /// Seller marks an order delivered. Repeating is a no-op.
    pub fn deliver_order(&self, collector_id: i64, order_id: i64) -> DbResult<DeliveryOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let order = fetch_order(&tx, order_id)?
            .filter(|o| o.collector_id == collector_id)
            .ok_or(MarketError::OrderNotFound { id: order_id })?;
        if order.status == OrderStatus::Delivered {
            return Ok(DeliveryOutcome {
                order,
                already_delivered: true,
                notifications: Vec::new(),
            });
        }

        tx.execute(
            "UPDATE market_orders SET status = 'delivered', updated_at = datetime('now') WHERE id = ?1",
            params![order_id],
        )?;
        let order = fetch_order(&tx, order_id)?.ok_or(MarketError::OrderNotFound { id: order_id })?;
        let note = push_notification(
            &tx,
            NewNotification {
                user_id: order.buyer_id,
                title: "Order delivered".to_string(),
                message: format!("Order {} has been delivered.", order.order_no),
                category: NotificationCategory::Order,
                link_url: String::new(),
                payload: serde_json::json!({"order_id": order.id, "order_no": order.order_no}),
            },
        )?;
        tx.commit()?;
        tracing::info!(order_id, collector_id, "order delivered");
        Ok(DeliveryOutcome {
            order,
            already_delivered: false,
            notifications: vec![note],
        })
    }

    pub fn buyer_orders(&self, buyer_id: i64) -> DbResult<Vec<MarketOrder>> {
        orders_where(&self.conn, "buyer_id = ?1", params![buyer_id], None)
    }

    pub fn collector_orders(&self, collector_id: i64) -> DbResult<Vec<MarketOrder>> {
        orders_where(&self.conn, "collector_id = ?1", params![collector_id], None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::db::test_support;

    fn lot(kg: i64, price_cents: i64) -> NewListing {
        NewListing {
            name: "Clean PET flakes".into(),
            product_type: ProductKind::Plastic,
            grade: 1,
            is_available: true,
            description: "Washed and sorted".into(),
            location: "Dhaka".into(),
            weight_kg: Mass::from_kg(kg),
            price: Money::from_cents(price_cents),
            tags: vec![MarketTag::Clean, MarketTag::Sorted, MarketTag::Clean],
        }
    }

    #[test]
    fn test_only_approved_collectors_can_list() -> DbResult<()> {
        let db = test_support::db();
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        assert!(matches!(
            db.create_listing(buyer.id, lot(10, 100)),
            Err(MarketError::Forbidden(_))
        ));

        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let listing = db.create_listing(c.id, lot(10, 100))?;
        assert_eq!(listing.tags, vec![MarketTag::Clean, MarketTag::Sorted]);
        assert!(matches!(
            db.create_listing(c.id, lot(0, 100)),
            Err(MarketError::BadRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_buy_decrements_stock_and_closes_listing() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let listing = db.create_listing(c.id, lot(3, 1250))?;

        // 1.254 kg rounds to 1.25 kg; 12.50 × 1.25 = 15.625 → 15.63
        let first = db.buy_listing(buyer.id, listing.id, Mass::from_grams(1254))?;
        assert_eq!(first.order.weight_kg, Mass::from_grams(1250));
        assert_eq!(first.order.total_price.cents(), 1563);
        assert_eq!(first.order.status, OrderStatus::Pending);
        assert!(first.order.order_no.starts_with("RC-"));
        assert_eq!(first.listing.weight_kg, Mass::from_grams(1750));
        assert!(first.listing.is_available);
        assert_eq!(first.notifications.len(), 2);

        assert!(matches!(
            db.buy_listing(buyer.id, listing.id, Mass::from_kg(2)),
            Err(MarketError::BadRequest(_))
        ));

        let last = db.buy_listing(buyer.id, listing.id, Mass::from_grams(1750))?;
        assert_eq!(last.listing.weight_kg, Mass::ZERO);
        assert!(!last.listing.is_available);
        assert_ne!(first.order.order_no, last.order.order_no);

        assert!(matches!(
            db.buy_listing(buyer.id, listing.id, Mass::from_kg(1)),
            Err(MarketError::ListingNotFound { .. })
        ));
        assert_eq!(db.buyer_orders(buyer.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_buy_rejects_own_listing_and_tiny_weights() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let listing = db.create_listing(c.id, lot(3, 100))?;
        assert!(matches!(
            db.buy_listing(c.id, listing.id, Mass::from_kg(1)),
            Err(MarketError::Forbidden(_))
        ));
        assert!(matches!(
            db.buy_listing(buyer.id, listing.id, Mass::from_grams(4)),
            Err(MarketError::BadRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_weights_above_bound_are_rejected() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let mut heavy = lot(1, 100);
        heavy.weight_kg = Mass::from_grams(Mass::MAX.grams() + 1);
        assert!(matches!(
            db.create_listing(c.id, heavy),
            Err(MarketError::BadRequest(_))
        ));

        let mut biggest = lot(1, 0);
        biggest.weight_kg = Mass::MAX;
        biggest.price = Money::MAX;
        let listing = db.create_listing(c.id, biggest)?;
        assert!(matches!(
            db.buy_listing(buyer.id, listing.id, Mass::from_kg(9_000_000_000_000_000)),
            Err(MarketError::BadRequest(_))
        ));
        let order = db.buy_listing(buyer.id, listing.id, Mass::from_kg(1))?.order;
        assert_eq!(order.total_price, Money::MAX);
        Ok(())
    }

    #[test]
    fn test_deliver_is_idempotent_and_scoped_to_seller() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let other = test_support::collector(&db, "o@example.com", ProductKind::Plastic);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        let listing = db.create_listing(c.id, lot(3, 100))?;
        let order = db.buy_listing(buyer.id, listing.id, Mass::from_kg(1))?.order;

        assert!(matches!(
            db.deliver_order(other.id, order.id),
            Err(MarketError::OrderNotFound { .. })
        ));
        let first = db.deliver_order(c.id, order.id)?;
        assert!(!first.already_delivered);
        assert_eq!(first.order.status, OrderStatus::Delivered);
        assert_eq!(first.notifications.len(), 1);

        let again = db.deliver_order(c.id, order.id)?;
        assert!(again.already_delivered);
        assert!(again.notifications.is_empty());
        assert_eq!(db.collector_orders(c.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_list_filters_and_ordering() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let admin = test_support::user(&db, "a@example.com", Role::Admin);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);

        let cheap = db.create_listing(c.id, lot(1, 100))?;
        let mut glass = lot(1, 900);
        glass.name = "Green bottles".into();
        glass.product_type = ProductKind::Glass;
        glass.location = "Chittagong".into();
        db.create_listing(c.id, glass)?;
        let mut hidden = lot(1, 500);
        hidden.is_available = false;
        db.create_listing(c.id, hidden)?;

        assert_eq!(db.list_listings(&buyer, &ListingFilter::default())?.len(), 2);
        assert_eq!(db.list_listings(&admin, &ListingFilter::default())?.len(), 3);

        let by_location = ListingFilter {
            q: Some("chittagong".into()),
            ..Default::default()
        };
        let found = db.list_listings(&buyer, &by_location)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].listing.product_type, ProductKind::Glass);

        let bad_type = ListingFilter {
            product_type: Some("wood".into()),
            order: Some("price_asc".into()),
            ..Default::default()
        };
        let sorted = db.list_listings(&buyer, &bad_type)?;
        assert_eq!(sorted[0].listing.id, cheap.id, "unknown type is ignored");

        let picky = ListingFilter {
            min_rating: Some("4".into()),
            ..Default::default()
        };
        assert!(db.list_listings(&buyer, &picky)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_search_treats_wildcards_literally() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let buyer = test_support::user(&db, "b@example.com", Role::Buyer);
        db.create_listing(c.id, lot(1, 100))?;
        let mut marked = lot(1, 100);
        marked.name = "100% PET_grade".into();
        let marked = db.create_listing(c.id, marked)?;

        let search = |q: &str| {
            let filter = ListingFilter {
                q: Some(q.into()),
                ..Default::default()
            };
            db.list_listings(&buyer, &filter)
        };
        for q in ["%", "_", "pet_", "100%"] {
            let found = search(q)?;
            assert_eq!(found.len(), 1, "query {q:?}");
            assert_eq!(found[0].listing.id, marked.id);
        }
        assert!(search("\\")?.is_empty());
        assert_eq!(search("flakes")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_detail_includes_seller_rating() -> DbResult<()> {
        let db = test_support::db();
        let c = test_support::collector(&db, "c@example.com", ProductKind::Plastic);
        let b1 = test_support::user(&db, "b1@example.com", Role::Buyer);
        let b2 = test_support::user(&db, "b2@example.com", Role::Buyer);
        let listing = db.create_listing(c.id, lot(1, 100))?;
        db.rate_collector(b1.id, c.id, 5)?;
        db.rate_collector(b2.id, c.id, 4)?;

        let view = db.listing_detail(listing.id)?;
        assert_eq!(view.seller_name, "c");
        assert_eq!(view.seller_ratings_count, 2);
        assert!((view.seller_average_rating - 4.5).abs() < f64::EPSILON);
        assert_eq!(view.listing.tags.len(), 2);
        assert!(matches!(
            db.listing_detail(999),
            Err(MarketError::ListingNotFound { .. })
        ));
        Ok(())
    }
}
