//! Typed error hierarchy for RecyConnect.
//!
//! Two enums cover the two layers:
//! - `MarketError`: domain and persistence failures raised by `market::*`
//! - `ConfigError`: configuration loading failures

use thiserror::Error;

/// Errors from the marketplace domain and its database.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("User {id} not found")]
    UserNotFound { id: i64 },

    #[error("Pickup request {id} not found")]
    PickupNotFound { id: i64 },

    #[error("Listing {id} not found")]
    ListingNotFound { id: i64 },

    #[error("Order {id} not found")]
    OrderNotFound { id: i64 },

    #[error("Reward item {id} not found")]
    RewardNotFound { id: i64 },

    #[error("Badge {id} not found")]
    BadgeNotFound { id: i64 },

    #[error("Notification {id} not found")]
    NotificationNotFound { id: i64 },

    #[error("Guide {id} not found")]
    GuideNotFound { id: i64 },

    #[error("Cannot move pickup {id} from {from} to {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Session expired or invalid")]
    SessionInvalid,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MarketError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound { .. }
                | Self::PickupNotFound { .. }
                | Self::ListingNotFound { .. }
                | Self::OrderNotFound { .. }
                | Self::RewardNotFound { .. }
                | Self::BadgeNotFound { .. }
                | Self::NotificationNotFound { .. }
                | Self::GuideNotFound { .. }
        )
    }
}

/// Errors from loading `recyconnect.toml` and the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load environment file at {path}: {source}")]
    EnvFile {
        path: std::path::PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_error_not_found_carries_id() {
        let err = MarketError::PickupNotFound { id: 42 };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn market_error_transition_message_names_both_states() {
        let err = MarketError::InvalidTransition {
            id: 7,
            from: "pending".into(),
            to: "completed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("completed"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn market_error_converts_from_rusqlite() {
        let err: MarketError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, MarketError::Sqlite(_)));
    }

    #[test]
    fn config_error_invalid_value_is_matchable() {
        let err = ConfigError::InvalidValue {
            key: "server.port".into(),
            message: "not a number".into(),
        };
        match &err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "server.port"),
            _ => panic!("Expected InvalidValue"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&MarketError::LockPoisoned);
        assert_std_error(&ConfigError::InvalidValue {
            key: "x".into(),
            message: "y".into(),
        });
    }
}
