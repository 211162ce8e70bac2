//! Accounts, sessions and the admin approval workflow.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{Algorithm, Params, Pbkdf2};

use super::db::{DbResult, MarketDb, USER_COLUMNS, collect_rows, require_user, user_from_row};
use super::models::{NotificationCategory, Notification, ProductKind, Role, User};
use super::notifications::{NewNotification, push_notification};
use crate::errors::MarketError;

pub const MIN_PASSWORD_LEN: usize = 8;

/// PBKDF2-SHA256 rounds for new hashes. Existing hashes keep their own count.
#[cfg(not(test))]
const HASH_ROUNDS: u32 = 600_000;
#[cfg(test)]
const HASH_ROUNDS: u32 = 1_000;

/// Registration and session rules taken from the `[accounts]` config section.
#[derive(Debug, Clone)]
pub struct AccountPolicy {
    pub session_ttl_hours: i64,
    pub auto_approve_roles: Vec<Role>,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            session_ttl_hours: 24 * 14,
            auto_approve_roles: vec![Role::Household, Role::Buyer, Role::Recycler],
        }
    }
}

/// Fields for inserting a user row directly (registration, admin creation, bootstrap).
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub name: String,
    pub approved: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub role: Role,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub user: User,
    pub expires_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub map_url: Option<String>,
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub twitter: Option<String>,
    pub collector_product: Option<ProductKind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// Result of creating an admin: the account plus its one-time password.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedAdmin {
    pub user: User,
    pub temporary_password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub user: User,
    pub changed: bool,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> DbResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(MarketError::bad_request(format!("Invalid email address: {}", email)))
    }
}

fn validate_new_password(password: &str, confirm: &str) -> DbResult<()> {
    if password != confirm {
        return Err(MarketError::bad_request("Passwords do not match"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(MarketError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn validate_link(field: &str, value: &str) -> DbResult<()> {
    if value.is_empty() || value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(MarketError::bad_request(format!("{}: Enter a valid URL.", field)))
    }
}

/// Hash a password into a PHC string (`$pbkdf2-sha256$i=...`), so the
/// algorithm and round count travel with the stored value.
pub(crate) fn hash_password(password: &str) -> DbResult<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to encode password salt: {}", e))?;
    let params = Params {
        rounds: HASH_ROUNDS,
        output_length: 32,
    };
    let hash = Pbkdf2
        .hash_password_customized(
            password.as_bytes(),
            Some(Algorithm::Pbkdf2Sha256.ident()),
            None,
            params,
            &salt,
        )
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC string. Malformed hashes never verify.
fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "stored password hash is malformed");
            false
        }
    }
}

fn generate_temporary_password() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..14].to_string()
}

fn insert_user(conn: &Connection, new: &NewUser) -> DbResult<User> {
    let email = normalize_email(&new.email);
    validate_email(&email)?;
    let taken: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE email = ?1",
        params![email],
        |row| row.get(0),
    )?;
    if taken {
        return Err(MarketError::conflict("Email already registered"));
    }

    let hash = hash_password(&new.password)?;
    conn.execute(
        "INSERT INTO users (email, password_hash, role, name, is_staff, is_superuser, is_approved, approved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CASE WHEN ?7 THEN datetime('now') END)",
        params![
            email,
            hash,
            new.role.as_str(),
            new.name.trim(),
            new.is_staff,
            new.is_superuser,
            new.approved,
        ],
    )?;
    require_user(conn, conn.last_insert_rowid())
}

fn session_user(conn: &Connection, token: &str) -> DbResult<Option<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE id = (
             SELECT user_id FROM sessions WHERE token = ?1 AND expires_at > datetime('now')
         )",
        USER_COLUMNS
    );
    Ok(conn.query_row(&sql, params![token], user_from_row).optional()?)
}

pub(super) fn require_admin(conn: &Connection, actor_id: i64) -> DbResult<User> {
    let actor = require_user(conn, actor_id)?;
    if !actor.is_admin() {
        return Err(MarketError::forbidden("Admin access required"));
    }
    Ok(actor)
}

impl MarketDb {
    /// Insert a user without the registration checks (used by admins and bootstrap).
    pub fn create_user(&self, new: NewUser) -> DbResult<User> {
        insert_user(&self.conn, &new)
    }

    pub fn register(&self, reg: Registration, policy: &AccountPolicy) -> DbResult<User> {
        if reg.role == Role::Admin {
            return Err(MarketError::bad_request("Admin accounts cannot self-register"));
        }
        validate_new_password(&reg.password, &reg.confirm_password)?;
        let approved = policy.auto_approve_roles.contains(&reg.role);
        let user = insert_user(
            &self.conn,
            &NewUser {
                email: reg.email,
                password: reg.password,
                role: reg.role,
                name: reg.name,
                approved,
                is_staff: false,
                is_superuser: false,
            },
        )?;
        tracing::info!(user_id = user.id, role = user.role.as_str(), approved, "user registered");
        Ok(user)
    }

    pub fn login(&self, email: &str, password: &str, policy: &AccountPolicy) -> DbResult<Session> {
        let email = normalize_email(email);
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE email = ?1",
                params![email],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (user_id, hash) = row.ok_or(MarketError::InvalidCredentials)?;
        if !verify_password(password, &hash) {
            tracing::warn!(user_id, "failed login attempt");
            return Err(MarketError::InvalidCredentials);
        }
        let user = require_user(&self.conn, user_id)?;
        if !user.is_active {
            return Err(MarketError::AccountInactive);
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let ttl = format!("{:+} hours", policy.session_ttl_hours);
        self.conn.execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, datetime('now', ?3))",
            params![token, user_id, ttl],
        )?;
        let expires_at: String = self.conn.query_row(
            "SELECT expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )?;
        tracing::info!(user_id, "session opened");
        Ok(Session {
            token,
            user,
            expires_at,
        })
    }

    pub fn logout(&self, token: &str) -> DbResult<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(count > 0)
    }

    /// Resolve a session token to an active user.
    pub fn authenticate(&self, token: &str) -> DbResult<User> {
        let user = session_user(&self.conn, token)?.ok_or(MarketError::SessionInvalid)?;
        if !user.is_active {
            return Err(MarketError::AccountInactive);
        }
        Ok(user)
    }

    pub fn purge_expired_sessions(&self) -> DbResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM sessions WHERE expires_at <= datetime('now')", [])?)
    }

    pub fn update_profile(&self, user_id: i64, update: ProfileUpdate) -> DbResult<User> {
        let user = require_user(&self.conn, user_id)?;
        let pick = |new: Option<String>, old: &str| new.map(|v| v.trim().to_string()).unwrap_or_else(|| old.to_string());
        let name = pick(update.name, &user.name);
        let phone = pick(update.phone, &user.phone);
        let address = pick(update.address, &user.address);
        let map_url = pick(update.map_url, &user.map_url);
        let facebook = pick(update.facebook, &user.facebook);
        let instagram = pick(update.instagram, &user.instagram);
        let twitter = pick(update.twitter, &user.twitter);

        validate_link("map_url", &map_url)?;
        validate_link("facebook", &facebook)?;
        validate_link("instagram", &instagram)?;
        validate_link("twitter", &twitter)?;

        let collector_product = match update.collector_product {
            Some(_) if user.role != Role::Collector => {
                return Err(MarketError::bad_request(
                    "Only collectors choose a collected product",
                ));
            }
            Some(kind) => Some(kind),
            None => user.collector_product,
        };

        self.conn.execute(
            "UPDATE users SET name = ?1, phone = ?2, address = ?3, map_url = ?4, facebook = ?5,
                 instagram = ?6, twitter = ?7, collector_product = ?8
             WHERE id = ?9",
            params![
                name,
                phone,
                address,
                map_url,
                facebook,
                instagram,
                twitter,
                collector_product.map(|k| k.as_str()),
                user_id
            ],
        )?;
        require_user(&self.conn, user_id)
    }

    /// Change the password and revoke every other session of the user.
    pub fn change_password(
        &self,
        user_id: i64,
        change: PasswordChange,
        current_token: &str,
    ) -> DbResult<()> {
        let hash: String = self
            .conn
            .query_row(
                "SELECT password_hash FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(MarketError::UserNotFound { id: user_id })?;
        if !verify_password(&change.old_password, &hash) {
            return Err(MarketError::bad_request("Current password is incorrect"));
        }
        validate_new_password(&change.new_password, &change.confirm_password)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![hash_password(&change.new_password)?, user_id],
        )?;
        tx.execute(
            "DELETE FROM sessions WHERE user_id = ?1 AND token != ?2",
            params![user_id, current_token],
        )?;
        tx.commit()?;
        tracing::info!(user_id, "password changed");
        Ok(())
    }

    // ── Admin approval workflow ───────────────────────────────────────

    pub fn pending_users(&self, actor_id: i64) -> DbResult<Vec<User>> {
        require_admin(&self.conn, actor_id)?;
        let sql = format!(
            "SELECT {} FROM users WHERE is_approved = 0 ORDER BY date_joined DESC, id DESC",
            USER_COLUMNS
        );
        collect_rows(&self.conn, &sql, [], user_from_row)
    }

    /// Approve and activate `target_id`. Approving twice is a no-op that
    /// reports `changed: false`.
    pub fn approve_user(&self, actor_id: i64, target_id: i64) -> DbResult<ApprovalOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        require_admin(&tx, actor_id)?;
        let target = require_user(&tx, target_id)?;
        if target.is_approved {
            return Ok(ApprovalOutcome {
                user: target,
                changed: false,
                notifications: Vec::new(),
            });
        }
        tx.execute(
            "UPDATE users SET is_approved = 1, is_active = 1, approved_at = datetime('now'), approved_by = ?1
             WHERE id = ?2",
            params![actor_id, target_id],
        )?;
        let notification = push_notification(
            &tx,
            NewNotification {
                user_id: target_id,
                title: "Account approved".to_string(),
                message: "Your RecyConnect account has been approved. You can now use every feature of your portal.".to_string(),
                category: NotificationCategory::System,
                link_url: String::new(),
                payload: serde_json::json!({ "approved_by": actor_id }),
            },
        )?;
        let user = require_user(&tx, target_id)?;
        tx.commit()?;
        tracing::info!(actor_id, target_id, "account approved");
        Ok(ApprovalOutcome {
            user,
            changed: true,
            notifications: vec![notification],
        })
    }

    pub fn decline_user(&self, actor_id: i64, target_id: i64) -> DbResult<User> {
        let tx = self.conn.unchecked_transaction()?;
        require_admin(&tx, actor_id)?;
        require_user(&tx, target_id)?;
        if actor_id == target_id {
            return Err(MarketError::bad_request("Admins cannot decline themselves"));
        }
        tx.execute(
            "UPDATE users SET is_active = 0, is_approved = 0 WHERE id = ?1",
            params![target_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![target_id])?;
        let user = require_user(&tx, target_id)?;
        tx.commit()?;
        tracing::info!(actor_id, target_id, "account declined");
        Ok(user)
    }

    pub fn create_admin(
        &self,
        actor_id: i64,
        email: &str,
        name: &str,
        superuser: bool,
    ) -> DbResult<CreatedAdmin> {
        let tx = self.conn.unchecked_transaction()?;
        let actor = require_admin(&tx, actor_id)?;
        if superuser && !actor.is_superuser {
            return Err(MarketError::forbidden("Only superusers can create superusers"));
        }
        if email.trim().is_empty() {
            return Err(MarketError::bad_request("Email is required"));
        }
        let temporary_password = generate_temporary_password();
        let user = insert_user(
            &tx,
            &NewUser {
                email: email.to_string(),
                password: temporary_password.clone(),
                role: Role::Admin,
                name: name.to_string(),
                approved: true,
                is_staff: true,
                is_superuser: superuser,
            },
        )?;
        tx.commit()?;
        tracing::info!(actor_id, admin_id = user.id, superuser, "admin account created");
        Ok(CreatedAdmin {
            user,
            temporary_password,
        })
    }

    /// Create the default superuser unless one already exists.
    /// Returns `None` when nothing was created.
    pub fn ensure_superuser(&self, email: &str, password: &str) -> DbResult<Option<User>> {
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM users WHERE is_superuser = 1",
            [],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(None);
        }
        let user = insert_user(
            &self.conn,
            &NewUser {
                email: email.to_string(),
                password: password.to_string(),
                role: Role::Admin,
                name: "Super Admin".to_string(),
                approved: true,
                is_staff: true,
                is_superuser: true,
            },
        )?;
        tracing::info!(email = %user.email, "default superuser created");
        Ok(Some(user))
    }
}
