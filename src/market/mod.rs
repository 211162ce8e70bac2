//! RecyConnect marketplace back-end.
//!
//! ## Overview
//!
//! Households, buyers and recyclers ask approved collectors to pick up
//! recyclable material. A completed pickup credits both parties in the
//! rewards ledger (points, CO₂ saved, pickup count) and runs the badge
//! engine. Collectors also sell graded material on a marketplace, buyers
//! rate collectors, and every state change lands in the owner's
//! notification inbox and is pushed over a WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs   (route handlers, AppState)        │
//! └──────────┘ WebSocket│    ├─ auth.rs  (CurrentUser / AdminUser)         │
//!                       │    └─ ws.rs    (per-user notification push)      │
//!                       │         │                                        │
//!                       │         │ DbHandle::call(|db| ...)               │
//!                       │         v                                        │
//!                       │  db.rs  (MarketDb, migrations, row mapping)      │
//!                       │    ├─ accounts.rs       sessions, approval       │
//!                       │    ├─ pickup.rs         request state machine    │
//!                       │    ├─ rewards.rs        ledger + badge engine    │
//!                       │    ├─ listings.rs       listings and orders      │
//!                       │    ├─ community.rs      collector ratings        │
//!                       │    ├─ dashboard.rs      aggregates               │
//!                       │    ├─ notifications.rs  inbox                    │
//!                       │    └─ education.rs      guides                   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Typical Request Flow (collector completes a pickup)
//!
//! 1. `POST /api/pickups/{id}/complete` → `api::complete_pickup()`
//! 2. `MarketDb::complete_pickup` checks ownership and the `accepted` state,
//!    marks the request `completed` and logs one activity for the requester
//!    and one for the collector, all in a single transaction.
//! 3. Each activity updates the user's totals and evaluates badge rules;
//!    new badges add their bonus points.
//! 4. After commit the handler pushes the created notifications and a
//!    `PickupUpdated` message to both parties' sockets.

pub mod accounts;
pub mod api;
pub mod auth;
pub mod community;
pub mod dashboard;
pub mod db;
pub mod education;
pub mod listings;
pub mod models;
pub mod notifications;
pub mod pickup;
pub mod rewards;
pub mod server;
pub mod units;
pub mod ws;
