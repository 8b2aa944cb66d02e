//! Document-store backend over MongoDB.
//!
//! Native `_id` keys are ObjectIds; they cross the facade boundary only as
//! 24-character hex strings under [`ID_FIELD`].

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, Bson, DateTime as BsonDateTime, Document},
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions},
    Client, Collection, IndexModel,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::{
    with_deadline, Change, Filter, Op, Patch, Record, Store, StoreError, Value, CONNECT_TIMEOUT,
    ID_FIELD, OP_TIMEOUT,
};

const NATIVE_ID: &str = "_id";
const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: String,
}

/// Converts an opaque identifier into a native ObjectId.
pub fn parse_object_id(id: &str) -> Result<ObjectId, StoreError> {
    ObjectId::parse_str(id).map_err(|_| StoreError::InvalidId(id.to_string()))
}

fn map_err(e: mongodb::error::Error) -> StoreError {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY => {
            StoreError::Conflict
        }
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Persistence(e.to_string()),
    }
}

pub(crate) fn to_bson(value: &Value) -> Result<Bson, StoreError> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::Text(s) => Bson::String(s.clone()),
        Value::Timestamp(t) => {
            Bson::DateTime(BsonDateTime::from_millis((t.unix_timestamp_nanos() / 1_000_000) as i64))
        }
        Value::Json(j) => {
            mongodb::bson::to_bson(j).map_err(|e| StoreError::Persistence(e.to_string()))?
        }
    })
}

pub(crate) fn from_bson(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i as i64),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Float(f),
        Bson::String(s) => Value::Text(s),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(dt) => {
            OffsetDateTime::from_unix_timestamp_nanos(dt.timestamp_millis() as i128 * 1_000_000)
                .map(Value::Timestamp)
                .unwrap_or(Value::Null)
        }
        other => Value::Json(other.into_relaxed_extjson()),
    }
}

pub(crate) fn to_document(record: Record) -> Result<Document, StoreError> {
    let mut out = Document::new();
    for (key, value) in record.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
        out.insert(key.clone(), to_bson(value)?);
    }
    Ok(out)
}

pub(crate) fn to_record(document: Document) -> Record {
    document
        .into_iter()
        .map(|(key, value)| {
            let key = if key == NATIVE_ID { ID_FIELD.to_string() } else { key };
            (key, from_bson(value))
        })
        .collect()
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Eq => "$eq",
        Op::Ne => "$ne",
        Op::Gt => "$gt",
        Op::Gte => "$gte",
        Op::Lt => "$lt",
        Op::Lte => "$lte",
    }
}

/// Builds a query document; conditions on the same field share one
/// operator sub-document.
pub(crate) fn filter_document(filter: &Filter) -> Result<Document, StoreError> {
    let mut out = Document::new();
    for c in &filter.conditions {
        let (field, value) = if c.field == ID_FIELD {
            let raw = c
                .value
                .as_text()
                .ok_or_else(|| StoreError::InvalidId("identifier must be a string".into()))?;
            (NATIVE_ID.to_string(), Bson::ObjectId(parse_object_id(raw)?))
        } else {
            (c.field.clone(), to_bson(&c.value)?)
        };
        match out.get_mut(&field) {
            Some(Bson::Document(ops)) => {
                ops.insert(op_name(c.op), value);
            }
            _ => {
                let mut ops = Document::new();
                ops.insert(op_name(c.op), value);
                out.insert(field, ops);
            }
        }
    }
    Ok(out)
}

pub(crate) fn update_document(patch: &Patch) -> Result<Document, StoreError> {
    let mut set = Document::new();
    let mut unset = Document::new();
    for change in &patch.changes {
        match change {
            Change::Set(field, _) | Change::Unset(field) if field == ID_FIELD => {}
            Change::Set(field, value) => {
                set.insert(field.clone(), to_bson(value)?);
            }
            Change::Unset(field) => {
                unset.insert(field.clone(), "");
            }
        }
    }
    let mut out = Document::new();
    if !set.is_empty() {
        out.insert("$set", set);
    }
    if !unset.is_empty() {
        out.insert("$unset", unset);
    }
    if out.is_empty() {
        return Err(StoreError::Unsupported("empty patch".into()));
    }
    Ok(out)
}

impl MongoStore {
    pub async fn connect(url: &str, database: &str) -> Result<Self, StoreError> {
        let unavailable = |e: mongodb::error::Error| StoreError::Unavailable(e.to_string());
        let store = with_deadline(CONNECT_TIMEOUT, async {
            let mut options = ClientOptions::parse(url).await.map_err(unavailable)?;
            options.app_name = Some("authcore".to_string());
            options.server_selection_timeout = Some(CONNECT_TIMEOUT);
            let client = Client::with_options(options).map_err(unavailable)?;
            client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .map_err(unavailable)?;
            Ok(Self {
                client,
                database: database.to_string(),
            })
        })
        .await?;
        info!(database = %store.database, "connected to mongodb");
        Ok(store)
    }

    pub async fn disconnect(&self) -> Result<(), StoreError> {
        let client = self.client.clone();
        with_deadline(CONNECT_TIMEOUT, async move {
            client.shutdown().await;
            Ok(())
        })
        .await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Raw access for queries the facade does not express.
    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.database).collection(name)
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn create_one(&self, name: &str, record: Record) -> Result<String, StoreError> {
        let document = to_document(record)?;
        let result = with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .insert_one(document, None)
                .await
                .map_err(map_err)
        })
        .await?;
        let id = result
            .inserted_id
            .as_object_id()
            .map(|oid| oid.to_hex())
            .ok_or_else(|| StoreError::Persistence("inserted key is not an ObjectId".into()))?;
        debug!(collection = name, %id, "document inserted");
        Ok(id)
    }

    async fn find_one(&self, name: &str, filter: &Filter) -> Result<Record, StoreError> {
        let query = filter_document(filter)?;
        let found = with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .find_one(query, None)
                .await
                .map_err(map_err)
        })
        .await?;
        found.map(to_record).ok_or(StoreError::NotFound)
    }

    async fn find_many(&self, name: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let query = filter_document(filter)?;
        let documents: Vec<Document> = with_deadline(OP_TIMEOUT, async {
            let cursor = self
                .collection(name)
                .find(query, None)
                .await
                .map_err(map_err)?;
            cursor.try_collect().await.map_err(map_err)
        })
        .await?;
        Ok(documents.into_iter().map(to_record).collect())
    }

    async fn update_one(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<(), StoreError> {
        let query = filter_document(filter)?;
        let update = update_document(patch)?;
        let result = with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .update_one(query, update, None)
                .await
                .map_err(map_err)
        })
        .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_many(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<u64, StoreError> {
        let query = filter_document(filter)?;
        let update = update_document(patch)?;
        let result = with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .update_many(query, update, None)
                .await
                .map_err(map_err)
        })
        .await?;
        Ok(result.matched_count)
    }

    async fn delete_one(&self, name: &str, filter: &Filter) -> Result<(), StoreError> {
        let query = filter_document(filter)?;
        let result = with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .delete_one(query, None)
                .await
                .map_err(map_err)
        })
        .await?;
        if result.deleted_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_many(&self, name: &str, filter: &Filter) -> Result<u64, StoreError> {
        let query = filter_document(filter)?;
        let result = with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .delete_many(query, None)
                .await
                .map_err(map_err)
        })
        .await?;
        Ok(result.deleted_count)
    }

    async fn ensure_unique(&self, name: &str, field: &str) -> Result<(), StoreError> {
        let mut keys = Document::new();
        keys.insert(field, 1);
        let model = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();
        with_deadline(OP_TIMEOUT, async {
            self.collection(name)
                .create_index(model, None)
                .await
                .map_err(map_err)
        })
        .await?;
        info!(collection = name, field, "unique index ensured");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        with_deadline(OP_TIMEOUT, async {
            self.client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .map_err(map_err)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_filters_become_native_object_ids() {
        let oid = ObjectId::new();
        let query = filter_document(&Filter::by_id(oid.to_hex())).unwrap();
        assert_eq!(query, doc! { "_id": { "$eq": oid } });
    }

    #[test]
    fn malformed_ids_fail_before_reaching_the_server() {
        let err = filter_document(&Filter::by_id("xyz")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(ref s) if s == "xyz"));
        assert!(parse_object_id("0123456789abcdef0123456").is_err());
    }

    #[test]
    fn conditions_on_one_field_are_merged() {
        let f = Filter::new()
            .with("age", Op::Gte, 18i64)
            .with("age", Op::Lt, 65i64)
            .eq("custom.city", "Oslo");
        let query = filter_document(&f).unwrap();
        assert_eq!(
            query,
            doc! {
                "age": { "$gte": 18i64, "$lt": 65i64 },
                "custom.city": { "$eq": "Oslo" },
            }
        );
    }

    #[test]
    fn patches_split_into_set_and_unset() {
        let patch = Patch::new()
            .set("custom", json!({"bio": "x"}))
            .unset("legacy")
            .set(ID_FIELD, "ignored");
        let update = update_document(&patch).unwrap();
        assert_eq!(
            update,
            doc! { "$set": { "custom": { "bio": "x" } }, "$unset": { "legacy": "" } }
        );
        assert!(update_document(&Patch::new()).is_err());
    }

    #[test]
    fn documents_map_native_keys_to_string_ids() {
        let oid = ObjectId::new();
        let created = BsonDateTime::from_millis(1_700_000_000_000);
        let record = to_record(doc! {
            "_id": oid,
            "email": "a@x.com",
            "custom": { "n": 1, "tags": ["t"] },
            "created_at": created,
        });
        assert_eq!(record.get(ID_FIELD), Some(&Value::Text(oid.to_hex())));
        assert_eq!(record.get("custom"), Some(&Value::Json(json!({"n": 1, "tags": ["t"]}))));
        assert_eq!(
            record.get("created_at"),
            Some(&Value::Timestamp(
                OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
            ))
        );

        let back = to_document(record).unwrap();
        assert!(back.get("_id").is_none());
        assert_eq!(back.get_str("email").unwrap(), "a@x.com");
        assert_eq!(back.get_datetime("created_at").unwrap(), &created);
    }
}
