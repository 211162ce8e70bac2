use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use super::accounts::{AccountPolicy, PasswordChange, ProfileUpdate, Registration};
use super::auth::{AdminUser, CurrentUser, clear_session_cookie, session_cookie};
use super::db::DbHandle;
#[cfg(test)]
use super::db::MarketDb;
use super::education::NewGuide;
use super::listings::{ListingFilter, NewListing};
use super::models::{Notification, PickupRequest, PickupStatus, ProductKind};
use super::pickup::PickupOrder;
use super::rewards::{BadgeInput, RewardInput};
use super::units::Mass;
use super::ws::{WsEnvelope, WsMessage, push_notifications, send_to_user};
use crate::errors::MarketError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<WsEnvelope>,
    pub policy: AccountPolicy,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, policy: AccountPolicy) -> Self {
        let (ws_tx, _rx) = broadcast::channel(256);
        Self { db, ws_tx, policy }
    }

    /// Push committed notifications to connected clients.
    fn publish(&self, notifications: Vec<Notification>) {
        push_notifications(&self.ws_tx, notifications);
    }

    fn publish_pickup(&self, pickup: &PickupRequest) {
        for user_id in [pickup.requester_id, pickup.collector_id] {
            send_to_user(
                &self.ws_tx,
                user_id,
                &WsMessage::PickupUpdated {
                    pickup: pickup.clone(),
                },
            );
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct CreateAdminRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub superuser: bool,
}

#[derive(Deserialize)]
pub struct RateRequest {
    pub stars: i64,
}

#[derive(Deserialize)]
pub struct BuyRequest {
    pub weight_kg: Mass,
}

#[derive(Deserialize)]
pub struct ManualActivityRequest {
    pub user_id: i64,
    pub kind: ProductKind,
    pub weight_kg: Mass,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct GuideQuery {
    pub category: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        let msg = err.to_string();
        match err {
            e if e.is_not_found() => ApiError::NotFound(msg),
            MarketError::InvalidTransition { .. } | MarketError::Conflict(_) => ApiError::Conflict(msg),
            MarketError::InvalidCredentials | MarketError::SessionInvalid => ApiError::Unauthorized(msg),
            MarketError::AccountInactive | MarketError::Forbidden(_) => ApiError::Forbidden(msg),
            MarketError::BadRequest(_) => ApiError::BadRequest(msg),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal("Internal server error".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// `Json<T>` whose rejection is a JSON 400 like every other API error.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok(ApiJson(value))
    }
}

fn parse_status(raw: Option<String>) -> Result<Option<PickupStatus>, ApiError> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<PickupStatus>().map_err(ApiError::BadRequest))
        .transpose()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        // accounts
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/profile", put(update_profile))
        .route("/api/profile/password", post(change_password))
        .route("/api/admin/users/pending", get(pending_users))
        .route("/api/admin/users/{id}/approve", post(approve_user))
        .route("/api/admin/users/{id}/decline", post(decline_user))
        .route("/api/admin/admins", post(create_admin))
        // pickups
        .route("/api/pickups", get(my_pickups).post(request_pickup))
        .route("/api/pickups/{id}/accept", post(accept_pickup))
        .route("/api/pickups/{id}/decline", post(decline_pickup))
        .route("/api/pickups/{id}/complete", post(complete_pickup))
        .route("/api/collector/pickups", get(collector_pickups))
        // rewards
        .route("/api/rewards", get(rewards_overview))
        .route("/api/rewards/leaderboard", get(leaderboard))
        .route("/api/rewards/activities", get(activity_history))
        .route("/api/rewards/items/{id}/redeem", post(redeem_reward))
        .route("/api/admin/badges", get(list_badges).post(create_badge))
        .route("/api/admin/badges/{id}", put(update_badge))
        .route("/api/admin/rewards", get(list_all_rewards).post(create_reward))
        .route("/api/admin/rewards/{id}", put(update_reward))
        .route("/api/admin/activities", post(log_manual_activity))
        // marketplace
        .route("/api/listings", get(list_listings).post(create_listing))
        .route("/api/listings/{id}", get(listing_detail))
        .route("/api/listings/{id}/buy", post(buy_listing))
        .route("/api/orders", get(my_orders))
        .route("/api/orders/{id}/deliver", post(deliver_order))
        .route("/api/collector/orders", get(collector_orders))
        // community and dashboards
        .route("/api/community", get(community))
        .route("/api/collectors/{id}/rate", post(rate_collector))
        .route("/api/dashboard/collector", get(collector_dashboard))
        .route("/api/dashboard/requester", get(requester_dashboard))
        // notifications
        .route(
            "/api/notifications",
            get(inbox).delete(delete_all_notifications),
        )
        .route("/api/notifications/read-all", post(mark_all_read))
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/notifications/{id}", delete(delete_notification))
        // education
        .route("/api/guides", get(list_guides).post(create_guide))
        .route("/api/guides/{id}/download", post(record_download))
        .route("/health", get(health_check))
}

// ── Handlers: accounts ────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn register(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<Registration>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = state.policy.clone();
    let user = state.db.call(move |db| db.register(req, &policy)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = state.policy.clone();
    let session = state
        .db
        .call(move |db| db.login(&req.email, &req.password, &policy))
        .await?;
    let cookie = session_cookie(&session.token, state.policy.session_ttl_hours);
    Ok(([(header::SET_COOKIE, cookie)], Json(session)))
}

async fn logout(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let token = current.token;
    state.db.call(move |db| db.logout(&token)).await?;
    Ok((
        [(header::SET_COOKIE, clear_session_cookie())],
        StatusCode::NO_CONTENT,
    ))
}

async fn me(current: CurrentUser) -> impl IntoResponse {
    Json(current.user)
}

async fn update_profile(
    State(state): State<SharedState>,
    current: CurrentUser,
    ApiJson(req): ApiJson<ProfileUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let user = state.db.call(move |db| db.update_profile(user_id, req)).await?;
    Ok(Json(user))
}

async fn change_password(
    State(state): State<SharedState>,
    current: CurrentUser,
    ApiJson(req): ApiJson<PasswordChange>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let token = current.token;
    state
        .db
        .call(move |db| db.change_password(user_id, req, &token))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pending_users(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
) -> Result<impl IntoResponse, ApiError> {
    let users = state.db.call(move |db| db.pending_users(admin.id)).await?;
    Ok(Json(users))
}

async fn approve_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let mut outcome = state.db.call(move |db| db.approve_user(admin.id, id)).await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    Ok(Json(outcome))
}

async fn decline_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.db.call(move |db| db.decline_user(admin.id, id)).await?;
    Ok(Json(user))
}

async fn create_admin(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    ApiJson(req): ApiJson<CreateAdminRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state
        .db
        .call(move |db| db.create_admin(admin.id, &req.email, &req.name, req.superuser))
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

// ── Handlers: pickups ─────────────────────────────────────────────────

async fn request_pickup(
    State(state): State<SharedState>,
    current: CurrentUser,
    ApiJson(req): ApiJson<PickupOrder>,
) -> Result<impl IntoResponse, ApiError> {
    let requester_id = current.user.id;
    let mut fanout = state
        .db
        .call(move |db| db.request_pickup(requester_id, req))
        .await?;
    state.publish(std::mem::take(&mut fanout.notifications));
    Ok((StatusCode::CREATED, Json(fanout)))
}

async fn my_pickups(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let pickups = state.db.call(move |db| db.requester_pickups(user_id)).await?;
    Ok(Json(pickups))
}

async fn collector_pickups(
    State(state): State<SharedState>,
    current: CurrentUser,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_status(query.status)?;
    let collector_id = current.user.id;
    let pickups = state
        .db
        .call(move |db| db.collector_pickups(collector_id, status))
        .await?;
    Ok(Json(pickups))
}

async fn accept_pickup(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let collector_id = current.user.id;
    let mut outcome = state.db.call(move |db| db.accept_pickup(collector_id, id)).await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    state.publish_pickup(&outcome.pickup);
    Ok(Json(outcome))
}

async fn decline_pickup(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let collector_id = current.user.id;
    let mut outcome = state.db.call(move |db| db.decline_pickup(collector_id, id)).await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    state.publish_pickup(&outcome.pickup);
    Ok(Json(outcome))
}

async fn complete_pickup(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let collector_id = current.user.id;
    let mut outcome = state.db.call(move |db| db.complete_pickup(collector_id, id)).await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    state.publish_pickup(&outcome.pickup);
    Ok(Json(outcome))
}

// ── Handlers: rewards ─────────────────────────────────────────────────

async fn rewards_overview(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let overview = state.db.call(move |db| db.rewards_overview(user_id)).await?;
    Ok(Json(overview))
}

async fn leaderboard(
    State(state): State<SharedState>,
    _current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let board = state.db.call(|db| db.leaderboard()).await?;
    Ok(Json(board))
}

async fn activity_history(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let activities = state.db.call(move |db| db.activity_history(user_id)).await?;
    Ok(Json(activities))
}

async fn redeem_reward(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let mut outcome = state.db.call(move |db| db.redeem_reward(user_id, id)).await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    Ok(Json(outcome))
}

async fn list_badges(
    State(state): State<SharedState>,
    _admin: AdminUser,
) -> Result<impl IntoResponse, ApiError> {
    let badges = state.db.call(|db| db.list_badges()).await?;
    Ok(Json(badges))
}

async fn create_badge(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    ApiJson(req): ApiJson<BadgeInput>,
) -> Result<impl IntoResponse, ApiError> {
    let badge = state.db.call(move |db| db.save_badge(admin.id, None, req)).await?;
    Ok((StatusCode::CREATED, Json(badge)))
}

async fn update_badge(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<BadgeInput>,
) -> Result<impl IntoResponse, ApiError> {
    let badge = state.db.call(move |db| db.save_badge(admin.id, Some(id), req)).await?;
    Ok(Json(badge))
}

async fn list_all_rewards(
    State(state): State<SharedState>,
    _admin: AdminUser,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.db.call(|db| db.list_rewards(true)).await?;
    Ok(Json(items))
}

async fn create_reward(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    ApiJson(req): ApiJson<RewardInput>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.db.call(move |db| db.save_reward(admin.id, None, req)).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update_reward(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<RewardInput>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.db.call(move |db| db.save_reward(admin.id, Some(id), req)).await?;
    Ok(Json(item))
}

async fn log_manual_activity(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    ApiJson(req): ApiJson<ManualActivityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut outcome = state
        .db
        .call(move |db| db.log_manual_activity(admin.id, req.user_id, req.kind, req.weight_kg))
        .await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    Ok((StatusCode::CREATED, Json(outcome)))
}

// ── Handlers: marketplace ─────────────────────────────────────────────

async fn list_listings(
    State(state): State<SharedState>,
    current: CurrentUser,
    Query(filter): Query<ListingFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = current.user;
    let listings = state.db.call(move |db| db.list_listings(&viewer, &filter)).await?;
    Ok(Json(listings))
}

async fn create_listing(
    State(state): State<SharedState>,
    current: CurrentUser,
    ApiJson(req): ApiJson<NewListing>,
) -> Result<impl IntoResponse, ApiError> {
    let seller_id = current.user.id;
    let listing = state.db.call(move |db| db.create_listing(seller_id, req)).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

async fn listing_detail(
    State(state): State<SharedState>,
    _current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.db.call(move |db| db.listing_detail(id)).await?;
    Ok(Json(view))
}

async fn buy_listing(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<BuyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let buyer_id = current.user.id;
    let mut outcome = state
        .db
        .call(move |db| db.buy_listing(buyer_id, id, req.weight_kg))
        .await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn my_orders(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let buyer_id = current.user.id;
    let orders = state.db.call(move |db| db.buyer_orders(buyer_id)).await?;
    Ok(Json(orders))
}

async fn collector_orders(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let collector_id = current.user.id;
    let orders = state.db.call(move |db| db.collector_orders(collector_id)).await?;
    Ok(Json(orders))
}

async fn deliver_order(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let collector_id = current.user.id;
    let mut outcome = state.db.call(move |db| db.deliver_order(collector_id, id)).await?;
    state.publish(std::mem::take(&mut outcome.notifications));
    if !outcome.already_delivered {
        send_to_user(
            &state.ws_tx,
            outcome.order.buyer_id,
            &WsMessage::OrderUpdated {
                order: outcome.order.clone(),
            },
        );
    }
    Ok(Json(outcome))
}

// ── Handlers: community and dashboards ────────────────────────────────

async fn community(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let viewer_id = current.user.id;
    let members = state.db.call(move |db| db.community(viewer_id)).await?;
    Ok(Json(members))
}

async fn rate_collector(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<RateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rater_id = current.user.id;
    let summary = state
        .db
        .call(move |db| db.rate_collector(rater_id, id, req.stars))
        .await?;
    Ok(Json(summary))
}

async fn collector_dashboard(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let dash = state.db.call(move |db| db.collector_dashboard(user_id)).await?;
    Ok(Json(dash))
}

async fn requester_dashboard(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let dash = state.db.call(move |db| db.requester_dashboard(user_id)).await?;
    Ok(Json(dash))
}

// ── Handlers: notifications ───────────────────────────────────────────

async fn inbox(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let inbox = state.db.call(move |db| db.inbox(user_id)).await?;
    Ok(Json(inbox))
}

async fn mark_read(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let notification = state
        .db
        .call(move |db| db.mark_notification_read(user_id, id))
        .await?;
    Ok(Json(notification))
}

async fn mark_all_read(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let updated = state
        .db
        .call(move |db| db.mark_all_notifications_read(user_id))
        .await?;
    Ok(Json(serde_json::json!({"updated": updated})))
}

async fn delete_notification(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    state
        .db
        .call(move |db| db.delete_notification(user_id, id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_notifications(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = current.user.id;
    let deleted = state
        .db
        .call(move |db| db.delete_all_notifications(user_id))
        .await?;
    Ok(Json(serde_json::json!({"deleted": deleted})))
}

// ── Handlers: education ───────────────────────────────────────────────

async fn list_guides(
    State(state): State<SharedState>,
    Query(query): Query<GuideQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let guides = state
        .db
        .call(move |db| db.list_guides(query.category.as_deref()))
        .await?;
    Ok(Json(guides))
}

async fn create_guide(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    ApiJson(req): ApiJson<NewGuide>,
) -> Result<impl IntoResponse, ApiError> {
    let guide = state.db.call(move |db| db.create_guide(admin.id, req)).await?;
    Ok((StatusCode::CREATED, Json(guide)))
}

async fn record_download(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let guide = state.db.call(move |db| db.record_download(id)).await?;
    Ok(Json(guide))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::accounts::NewUser;
    use crate::market::models::Role;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const PASSWORD: &str = "correct-horse";

    fn test_state() -> SharedState {
        let db = MarketDb::new_in_memory().unwrap();
        Arc::new(AppState::new(DbHandle::new(db), AccountPolicy::default()))
    }

    fn seed_user(state: &SharedState, email: &str, role: Role, kind: Option<ProductKind>) -> i64 {
        let db = state.db.lock_sync().unwrap();
        let user = db
            .create_user(NewUser {
                email: email.to_string(),
                password: PASSWORD.to_string(),
                role,
                name: email.split('@').next().unwrap().to_string(),
                approved: true,
                is_staff: role == Role::Admin,
                is_superuser: false,
            })
            .unwrap();
        if kind.is_some() {
            db.update_profile(
                user.id,
                ProfileUpdate {
                    collector_product: kind,
                    ..Default::default()
                },
            )
            .unwrap();
        }
        user.id
    }

    async fn send(
        state: &SharedState,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = api_router()
            .with_state(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn login(state: &SharedState, email: &str) -> String {
        let (status, body) = send(
            state,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": email, "password": PASSWORD})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "login failed: {}", body);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state();
        let response = api_router()
            .with_state(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_register_login_and_me() {
        let state = test_state();
        let (status, user) = send(
            &state,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({
                "email": "  Rina@Example.com ",
                "password": PASSWORD,
                "confirm_password": PASSWORD,
                "role": "household",
                "name": "Rina"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(user["email"], "rina@example.com");
        assert_eq!(user["is_approved"], true);
        assert!(user.get("password_hash").is_none());

        let token = login(&state, "rina@example.com").await;
        let (status, me) = send(&state, "GET", "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["name"], "Rina");

        let (status, _) = send(&state, "POST", "/api/auth/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&state, "GET", "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_missing_session_and_bad_credentials_are_401() {
        let state = test_state();
        seed_user(&state, "h@example.com", Role::Household, None);
        let (status, body) = send(&state, "GET", "/api/rewards", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authentication required");

        let (status, _) = send(
            &state,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": "h@example.com", "password": "wrong-password"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_json_400() {
        let state = test_state();
        let response = api_router()
            .with_state(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_admin_routes_reject_non_admins() {
        let state = test_state();
        seed_user(&state, "h@example.com", Role::Household, None);
        let token = login(&state, "h@example.com").await;
        let (status, _) = send(&state, "GET", "/api/admin/users/pending", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_pickup_flow_credits_ledger_and_pushes_notifications() {
        let state = test_state();
        let household_id = seed_user(&state, "h@example.com", Role::Household, None);
        seed_user(&state, "c@example.com", Role::Collector, Some(ProductKind::Metal));
        let household = login(&state, "h@example.com").await;
        let collector = login(&state, "c@example.com").await;
        let mut rx = state.ws_tx.subscribe();

        let (status, fanout) = send(
            &state,
            "POST",
            "/api/pickups",
            Some(&household),
            Some(json!({"kind": "metal", "weight_kg": "5", "price": "0"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(fanout["collectors_reached"], 1);
        let pickup_id = fanout["pickups"][0]["id"].as_i64().unwrap();

        let uri = format!("/api/pickups/{}/complete", pickup_id);
        let (status, _) = send(&state, "POST", &uri, Some(&collector), None).await;
        assert_eq!(status, StatusCode::CONFLICT, "pending cannot complete");

        let accept = format!("/api/pickups/{}/accept", pickup_id);
        let (status, _) = send(&state, "POST", &accept, Some(&collector), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, done) = send(&state, "POST", &uri, Some(&collector), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["pickup"]["status"], "completed");

        let (_, overview) = send(&state, "GET", "/api/rewards", Some(&household), None).await;
        assert_eq!(overview["total_co2_kg"], "10.000");
        assert_eq!(overview["points"], 20 + 250 + 100);

        let mut household_pushes = 0;
        while let Ok(envelope) = rx.try_recv() {
            if envelope.user_id == household_id && envelope.payload.contains("NotificationCreated") {
                household_pushes += 1;
            }
        }
        // accepted, completed, points, two badges
        assert_eq!(household_pushes, 5);
    }

    #[tokio::test]
    async fn test_marketplace_buy_and_deliver() {
        let state = test_state();
        seed_user(&state, "c@example.com", Role::Collector, Some(ProductKind::Paper));
        seed_user(&state, "b@example.com", Role::Buyer, None);
        let collector = login(&state, "c@example.com").await;
        let buyer = login(&state, "b@example.com").await;

        let (status, listing) = send(
            &state,
            "POST",
            "/api/listings",
            Some(&collector),
            Some(json!({
                "name": "Office paper",
                "product_type": "paper",
                "grade": 1,
                "weight_kg": "4.5",
                "price": 12.5,
                "tags": ["dry", "sorted"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", listing);
        let listing_id = listing["id"].as_i64().unwrap();

        let (status, bought) = send(
            &state,
            "POST",
            &format!("/api/listings/{}/buy", listing_id),
            Some(&buyer),
            Some(json!({"weight_kg": "2"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(bought["order"]["total_price"], "25.00");
        assert_eq!(bought["listing"]["weight_kg"], "2.500");
        let order_id = bought["order"]["id"].as_i64().unwrap();

        let deliver = format!("/api/orders/{}/deliver", order_id);
        let (status, _) = send(&state, "POST", &deliver, Some(&buyer), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "only the seller delivers");
        let (_, first) = send(&state, "POST", &deliver, Some(&collector), None).await;
        assert_eq!(first["already_delivered"], false);
        let (_, again) = send(&state, "POST", &deliver, Some(&collector), None).await;
        assert_eq!(again["already_delivered"], true);

        let (_, inbox) = send(&state, "GET", "/api/notifications", Some(&buyer), None).await;
        assert_eq!(inbox["total_count"], 2);
        assert_eq!(inbox["unread_count"], 2);
    }

    #[tokio::test]
    async fn test_collector_pickups_rejects_unknown_status() {
        let state = test_state();
        seed_user(&state, "c@example.com", Role::Collector, Some(ProductKind::Glass));
        let collector = login(&state, "c@example.com").await;
        let (status, _) = send(
            &state,
            "GET",
            "/api/collector/pickups?status=lost",
            Some(&collector),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, list) = send(
            &state,
            "GET",
            "/api/collector/pickups?status=pending",
            Some(&collector),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list, json!([]));
    }

    #[test]
    fn test_market_errors_map_to_status_codes() {
        let cases = [
            (MarketError::PickupNotFound { id: 1 }, StatusCode::NOT_FOUND),
            (MarketError::conflict("taken"), StatusCode::CONFLICT),
            (
                MarketError::InvalidTransition {
                    id: 1,
                    from: "pending".into(),
                    to: "completed".into(),
                },
                StatusCode::CONFLICT,
            ),
            (MarketError::SessionInvalid, StatusCode::UNAUTHORIZED),
            (MarketError::AccountInactive, StatusCode::FORBIDDEN),
            (MarketError::bad_request("no"), StatusCode::BAD_REQUEST),
            (MarketError::LockPoisoned, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
