use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::units::{Mass, Money};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Household,
    Collector,
    Buyer,
    Recycler,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Household => "household",
            Self::Collector => "collector",
            Self::Buyer => "buyer",
            Self::Recycler => "recycler",
            Self::Admin => "admin",
        }
    }

    /// Roles allowed to ask collectors for a pickup.
    pub fn can_request_pickup(&self) -> bool {
        matches!(self, Self::Household | Self::Buyer | Self::Recycler)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "household" => Ok(Self::Household),
            "collector" => Ok(Self::Collector),
            "buyer" => Ok(Self::Buyer),
            "recycler" => Ok(Self::Recycler),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Material kind of a recyclable product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Plastic,
    Paper,
    Glass,
    Metal,
    #[serde(alias = "ewaste")]
    EWaste,
}

impl ProductKind {
    pub const ALL: [ProductKind; 5] = [
        Self::Plastic,
        Self::Paper,
        Self::Glass,
        Self::Metal,
        Self::EWaste,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plastic => "plastic",
            Self::Paper => "paper",
            Self::Glass => "glass",
            Self::Metal => "metal",
            Self::EWaste => "e_waste",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Plastic => "Plastic",
            Self::Paper => "Paper",
            Self::Glass => "Glass",
            Self::Metal => "Metal",
            Self::EWaste => "E-waste",
        }
    }

    /// Grams of CO₂ saved per kilogram recycled.
    pub fn co2_grams_per_kg(&self) -> i64 {
        match self {
            Self::Plastic => 1500,
            Self::Glass => 300,
            Self::Metal => 2000,
            Self::Paper => 1800,
            Self::EWaste => 5000,
        }
    }

    /// CO₂ saved by recycling `weight` of this kind, rounded half-up to the gram.
    /// `None` when the result does not fit.
    pub fn co2_saved(&self, weight: Mass) -> Option<Mass> {
        let raw = i128::from(weight.grams()) * i128::from(self.co2_grams_per_kg());
        i64::try_from((raw + 500).div_euclid(1000))
            .ok()
            .map(Mass::from_grams)
    }
}

impl FromStr for ProductKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plastic" => Ok(Self::Plastic),
            "paper" => Ok(Self::Paper),
            "glass" => Ok(Self::Glass),
            "metal" => Ok(Self::Metal),
            "e_waste" | "ewaste" => Ok(Self::EWaste),
            _ => Err(format!("Invalid product kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub name: String,
    pub phone: String,
    pub address: String,
    pub map_url: String,
    pub facebook: String,
    pub instagram: String,
    pub twitter: String,
    pub collector_product: Option<ProductKind>,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub is_active: bool,
    pub is_approved: bool,
    pub approved_at: Option<String>,
    pub approved_by: Option<i64>,
    pub points: i64,
    pub total_pickups: i64,
    pub total_co2_saved_kg: Mass,
    pub date_joined: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.is_staff || self.is_superuser
    }
}

/// Snapshot of what a requester offered for pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub kind: ProductKind,
    pub weight_kg: Mass,
    pub price: Money,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PickupStatus {
    Pending,
    Accepted,
    Declined,
    Completed,
}

impl PickupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Completed => "completed",
        }
    }

    /// `pending → {accepted, declined}`, `accepted → completed`.
    pub fn can_transition_to(&self, next: PickupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted)
                | (Self::Pending, Self::Declined)
                | (Self::Accepted, Self::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Completed)
    }
}

impl FromStr for PickupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid pickup status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupRequest {
    pub id: i64,
    pub requester_id: i64,
    pub collector_id: i64,
    pub product_id: i64,
    pub kind: ProductKind,
    pub weight_kg: Mass,
    pub price: Money,
    pub status: PickupStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// A pickup joined with the display names of both parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupView {
    #[serde(flatten)]
    pub pickup: PickupRequest,
    pub requester_name: String,
    pub requester_email: String,
    pub collector_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub pickup_id: Option<i64>,
    pub weight_kg: Mass,
    pub co2_saved_kg: Mass,
    pub points_awarded: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Rarity {
    Common,
    Rare,
    Epic,
    Legendary,
    Exclusive,
}

impl Rarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "Common",
            Self::Rare => "Rare",
            Self::Epic => "Epic",
            Self::Legendary => "Legendary",
            Self::Exclusive => "Exclusive",
        }
    }
}

impl FromStr for Rarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Common" => Ok(Self::Common),
            "Rare" => Ok(Self::Rare),
            "Epic" => Ok(Self::Epic),
            "Legendary" => Ok(Self::Legendary),
            "Exclusive" => Ok(Self::Exclusive),
            _ => Err(format!("Invalid rarity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Badge {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub description: String,
    pub emoji: String,
    pub rarity: Rarity,
    pub points_bonus: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBadge {
    pub id: i64,
    pub user_id: i64,
    pub badge: Badge,
    pub awarded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardItem {
    pub id: i64,
    pub title: String,
    pub cost_points: i64,
    /// `None` means unlimited.
    pub stock: Option<i64>,
    pub is_active: bool,
    pub created_at: String,
}

impl RewardItem {
    pub fn is_in_stock(&self) -> bool {
        self.stock.is_none_or(|s| s > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redemption {
    pub id: i64,
    pub user_id: i64,
    pub reward_id: i64,
    pub points_spent: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketTag {
    Clean,
    Dry,
    Sorted,
    NoForeignMaterials,
    NoBattery,
    NoLiquid,
    Broken,
    Nonfunctional,
    MetalOnly,
}

impl MarketTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dry => "dry",
            Self::Sorted => "sorted",
            Self::NoForeignMaterials => "no_foreign_materials",
            Self::NoBattery => "no_battery",
            Self::NoLiquid => "no_liquid",
            Self::Broken => "broken",
            Self::Nonfunctional => "nonfunctional",
            Self::MetalOnly => "metal_only",
        }
    }
}

impl FromStr for MarketTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(Self::Clean),
            "dry" => Ok(Self::Dry),
            "sorted" => Ok(Self::Sorted),
            "no_foreign_materials" => Ok(Self::NoForeignMaterials),
            "no_battery" => Ok(Self::NoBattery),
            "no_liquid" => Ok(Self::NoLiquid),
            "broken" => Ok(Self::Broken),
            "nonfunctional" => Ok(Self::Nonfunctional),
            "metal_only" => Ok(Self::MetalOnly),
            _ => Err(format!("Invalid market tag: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub seller_id: i64,
    pub name: String,
    pub product_type: ProductKind,
    pub grade: i64,
    pub is_available: bool,
    pub description: String,
    pub location: String,
    /// Remaining stock.
    pub weight_kg: Mass,
    /// Price per kilogram.
    pub price: Money,
    pub tags: Vec<MarketTag>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingView {
    #[serde(flatten)]
    pub listing: Listing,
    pub seller_name: String,
    pub seller_average_rating: f64,
    pub seller_ratings_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrder {
    pub id: i64,
    pub order_no: String,
    pub buyer_id: i64,
    pub collector_id: i64,
    pub listing_id: i64,
    pub product_name: String,
    pub weight_kg: Mass,
    pub unit_price: Money,
    pub total_price: Money,
    pub status: OrderStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    General,
    Badge,
    Points,
    Order,
    System,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Badge => "badge",
            Self::Points => "points",
            Self::Order => "order",
            Self::System => "system",
        }
    }
}

impl FromStr for NotificationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Self::General),
            "badge" => Ok(Self::Badge),
            "points" => Ok(Self::Points),
            "order" => Ok(Self::Order),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid notification category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
    pub link_url: String,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guide {
    pub id: i64,
    pub title: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub read_time: i64,
    pub downloads: i64,
    pub created_at: String,
}

impl Guide {
    /// First 100 characters of the description, with an ellipsis when cut.
    pub fn short_description(&self) -> Option<String> {
        self.description.as_ref().map(|d| {
            if d.chars().count() > 100 {
                let cut: String = d.chars().take(100).collect();
                format!("{}...", cut)
            } else {
                d.clone()
            }
        })
    }
}
