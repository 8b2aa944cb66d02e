use std::fmt;

use serde::Deserialize;

use crate::error::AuthError;

pub const DEFAULT_TOKEN_EXPIRY_MINUTES: i64 = 60;
pub const DEFAULT_STORE_NAME: &str = "users";
pub const DEFAULT_MONGO_DATABASE: &str = "authcore";

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub secret: String,
    #[serde(default)]
    pub token_expiry_minutes: i64,
    #[serde(default)]
    pub store_name: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_expiry_minutes", &self.token_expiry_minutes)
            .field("store_name", &self.store_name)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token_expiry_minutes: DEFAULT_TOKEN_EXPIRY_MINUTES,
            store_name: DEFAULT_STORE_NAME.to_string(),
        }
    }

    /// Fills unset fields with defaults. A missing secret is fatal.
    pub fn normalized(mut self) -> Result<Self, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::Configuration("auth secret is required".into()));
        }
        if self.token_expiry_minutes <= 0 {
            self.token_expiry_minutes = DEFAULT_TOKEN_EXPIRY_MINUTES;
        }
        if self.store_name.is_empty() {
            self.store_name = DEFAULT_STORE_NAME.to_string();
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    Mongo { url: String, database: String },
    Postgres { url: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AuthError> {
        let get = |key: &str| get(key).filter(|v| !v.is_empty());

        let auth = AuthConfig {
            secret: get("AUTH_SECRET").unwrap_or_default(),
            token_expiry_minutes: get("AUTH_TOKEN_EXPIRY_MINUTES")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(DEFAULT_TOKEN_EXPIRY_MINUTES),
            store_name: get("AUTH_STORE_NAME").unwrap_or_default(),
        }
        .normalized()?;

        let database = match (get("MONGODB_CONNECTION_URL"), get("POSTGRES_CONNECTION_URL")) {
            (Some(url), _) => DatabaseConfig::Mongo {
                url,
                database: get("MONGODB_DATABASE").unwrap_or_else(|| DEFAULT_MONGO_DATABASE.into()),
            },
            (None, Some(url)) => DatabaseConfig::Postgres { url },
            (None, None) => {
                return Err(AuthError::Configuration(
                    "MONGODB_CONNECTION_URL or POSTGRES_CONNECTION_URL is required".into(),
                ))
            }
        };

        let port = match get("APP_PORT") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|_| AuthError::Configuration(format!("invalid APP_PORT `{v}`")))?,
            None => 8080,
        };

        Ok(Self {
            auth,
            database,
            host: get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
        })
    }
}
