use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::store::{Record, StoreError, Value, ID_FIELD};

/// Caller-defined profile data, stored and returned verbatim.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

pub(crate) const EMAIL: &str = "email";
pub(crate) const PASSWORD_HASH: &str = "password_hash";
pub(crate) const CUSTOM: &str = "custom";
pub(crate) const CREATED_AT: &str = "created_at";

/// Relational column definitions for a user table of any name. Email
/// uniqueness is installed separately by `AuthManager::prepare`.
pub const USER_COLUMNS: &str = "\"id\" UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
     \"email\" TEXT NOT NULL, \
     \"password_hash\" TEXT NOT NULL, \
     \"custom\" JSONB NOT NULL DEFAULT '{}'::jsonb, \
     \"created_at\" TIMESTAMPTZ NOT NULL DEFAULT now()";

/// User record as persisted by any store backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct User {
    pub id: String,      // backend key as an opaque string
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 hash, not exposed in JSON
    pub custom: Attributes,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Current instant truncated to milliseconds, the coarsest precision any
/// backend stores.
pub(crate) fn creation_time() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap_or(now)
}

fn malformed(field: &str) -> StoreError {
    StoreError::Persistence(format!("malformed user record: `{field}`"))
}

fn text(record: &mut Record, field: &str) -> Result<String, StoreError> {
    match record.remove(field) {
        Some(Value::Text(s)) => Ok(s),
        _ => Err(malformed(field)),
    }
}

impl User {
    /// Persisted shape, without the identifier (the store assigns it).
    pub(crate) fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(EMAIL.into(), Value::Text(self.email.clone()));
        record.insert(PASSWORD_HASH.into(), Value::Text(self.password_hash.clone()));
        record.insert(CUSTOM.into(), Value::Json(self.custom.clone().into()));
        record.insert(CREATED_AT.into(), Value::Timestamp(self.created_at));
        record
    }

    pub(crate) fn from_record(mut record: Record) -> Result<Self, StoreError> {
        let id = text(&mut record, ID_FIELD)?;
        let email = text(&mut record, EMAIL)?;
        let password_hash = text(&mut record, PASSWORD_HASH)?;
        let custom = match record.remove(CUSTOM) {
            Some(Value::Json(serde_json::Value::Object(map))) => map,
            None | Some(Value::Null) | Some(Value::Json(serde_json::Value::Null)) => Attributes::new(),
            Some(_) => return Err(malformed(CUSTOM)),
        };
        let created_at = match record.remove(CREATED_AT) {
            Some(Value::Timestamp(t)) => t,
            Some(Value::Text(s)) => {
                OffsetDateTime::parse(&s, &Rfc3339).map_err(|_| malformed(CREATED_AT))?
            }
            _ => return Err(malformed(CREATED_AT)),
        };
        Ok(Self {
            id,
            email,
            password_hash,
            custom,
            created_at,
        })
    }
}
