use std::{cmp::Ordering, collections::HashMap};

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use tokio::sync::RwLock;

use super::{Change, Condition, Filter, Op, Patch, Record, Store, StoreError, Value, ID_FIELD};

#[derive(Default)]
struct Collection {
    rows: Vec<Record>,
    unique: Vec<String>,
}

impl Collection {
    fn violates_unique(&self, candidate: &Record, skip: Option<usize>) -> bool {
        self.unique.iter().any(|field| {
            let Some(value) = lookup(candidate, field) else {
                return false;
            };
            self.rows
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .any(|(_, row)| lookup(row, field).as_ref() == Some(&value))
        })
    }
}

/// In-process [`Store`] with document-store semantics. Identifiers are
/// ObjectId-style 24-character hex strings.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`Store::ensure_unique`], usable before the store is shared.
    pub fn with_unique(mut self, name: &str, field: &str) -> Self {
        let coll = self.collections.get_mut().entry(name.to_string()).or_default();
        if !coll.unique.iter().any(|f| f == field) {
            coll.unique.push(field.to_string());
        }
        self
    }
}

fn check_id(filter: &Filter) -> Result<(), StoreError> {
    for c in filter.conditions.iter().filter(|c| c.field == ID_FIELD) {
        let raw = c
            .value
            .as_text()
            .ok_or_else(|| StoreError::InvalidId("identifier must be a string".into()))?;
        ObjectId::parse_str(raw).map_err(|_| StoreError::InvalidId(raw.to_string()))?;
    }
    Ok(())
}

fn reject_empty(patch: &Patch) -> Result<(), StoreError> {
    if patch.is_empty() {
        return Err(StoreError::Unsupported("empty patch".into()));
    }
    Ok(())
}

fn scalar(j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Json(other.clone()),
    }
}

/// Resolves a possibly dotted path; nested values come back as scalars when
/// they are scalars so they compare against plain filter values.
fn lookup(record: &Record, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let head = record.get(parts.next()?)?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        return Some(match head {
            Value::Json(j) => scalar(j),
            other => other.clone(),
        });
    }
    let Value::Json(mut cur) = head.clone() else {
        return None;
    };
    for key in rest {
        cur = cur.get(key)?.clone();
    }
    Some(scalar(&cur))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (x, y) if x.to_json() == y.to_json() => Some(Ordering::Equal),
        _ => None,
    }
}

fn matches_condition(record: &Record, c: &Condition) -> bool {
    let actual = lookup(record, &c.field).unwrap_or(Value::Null);
    let ord = compare(&actual, &c.value);
    match c.op {
        Op::Eq => ord == Some(Ordering::Equal),
        Op::Ne => ord != Some(Ordering::Equal),
        Op::Gt => ord == Some(Ordering::Greater),
        Op::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        Op::Lt => ord == Some(Ordering::Less),
        Op::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
    }
}

fn matches(record: &Record, filter: &Filter) -> bool {
    filter.conditions.iter().all(|c| matches_condition(record, c))
}

fn set_path(record: &mut Record, path: &str, value: Value) {
    let Some((head, rest)) = path.split_once('.') else {
        record.insert(path.to_string(), value);
        return;
    };
    let slot = record
        .entry(head.to_string())
        .or_insert_with(|| Value::Json(serde_json::json!({})));
    if !matches!(slot, Value::Json(serde_json::Value::Object(_))) {
        *slot = Value::Json(serde_json::json!({}));
    }
    let Value::Json(root) = slot else { return };
    let mut cur = root;
    let keys: Vec<&str> = rest.split('.').collect();
    for (i, key) in keys.iter().enumerate() {
        let serde_json::Value::Object(map) = cur else { return };
        if i == keys.len() - 1 {
            map.insert(key.to_string(), value.to_json());
            return;
        }
        cur = map
            .entry(key.to_string())
            .or_insert_with(|| serde_json::json!({}));
        if !cur.is_object() {
            *cur = serde_json::json!({});
        }
    }
}

fn unset_path(record: &mut Record, path: &str) {
    let Some((head, rest)) = path.split_once('.') else {
        record.remove(path);
        return;
    };
    let Some(Value::Json(root)) = record.get_mut(head) else {
        return;
    };
    let mut keys: Vec<&str> = rest.split('.').collect();
    let Some(last) = keys.pop() else { return };
    let mut node = root;
    for key in keys {
        match node.get_mut(key) {
            Some(next) => node = next,
            None => return,
        }
    }
    if let serde_json::Value::Object(map) = node {
        map.remove(last);
    }
}

fn apply(record: &mut Record, patch: &Patch) {
    for change in &patch.changes {
        match change {
            Change::Set(field, _) | Change::Unset(field) if field == ID_FIELD => {}
            Change::Set(field, value) => set_path(record, field, value.clone()),
            Change::Unset(field) => unset_path(record, field),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_one(&self, name: &str, mut record: Record) -> Result<String, StoreError> {
        let mut guard = self.collections.write().await;
        let coll = guard.entry(name.to_string()).or_default();
        if coll.violates_unique(&record, None) {
            return Err(StoreError::Conflict);
        }
        let id = ObjectId::new().to_hex();
        record.insert(ID_FIELD.to_string(), Value::Text(id.clone()));
        coll.rows.push(record);
        Ok(id)
    }

    async fn find_one(&self, name: &str, filter: &Filter) -> Result<Record, StoreError> {
        check_id(filter)?;
        let guard = self.collections.read().await;
        guard
            .get(name)
            .and_then(|c| c.rows.iter().find(|r| matches(r, filter)))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_many(&self, name: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        check_id(filter)?;
        let guard = self.collections.read().await;
        Ok(guard
            .get(name)
            .map(|c| c.rows.iter().filter(|r| matches(r, filter)).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_one(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<(), StoreError> {
        check_id(filter)?;
        reject_empty(patch)?;
        let mut guard = self.collections.write().await;
        let coll = guard.get_mut(name).ok_or(StoreError::NotFound)?;
        let idx = coll
            .rows
            .iter()
            .position(|r| matches(r, filter))
            .ok_or(StoreError::NotFound)?;
        let mut updated = coll.rows[idx].clone();
        apply(&mut updated, patch);
        if coll.violates_unique(&updated, Some(idx)) {
            return Err(StoreError::Conflict);
        }
        coll.rows[idx] = updated;
        Ok(())
    }

    async fn update_many(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<u64, StoreError> {
        check_id(filter)?;
        reject_empty(patch)?;
        let mut guard = self.collections.write().await;
        let Some(coll) = guard.get_mut(name) else {
            return Ok(0);
        };
        let targets: Vec<usize> = coll
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| matches(r, filter))
            .map(|(i, _)| i)
            .collect();
        for &idx in &targets {
            let mut updated = coll.rows[idx].clone();
            apply(&mut updated, patch);
            if coll.violates_unique(&updated, Some(idx)) {
                return Err(StoreError::Conflict);
            }
            coll.rows[idx] = updated;
        }
        Ok(targets.len() as u64)
    }

    async fn delete_one(&self, name: &str, filter: &Filter) -> Result<(), StoreError> {
        check_id(filter)?;
        let mut guard = self.collections.write().await;
        let coll = guard.get_mut(name).ok_or(StoreError::NotFound)?;
        let idx = coll
            .rows
            .iter()
            .position(|r| matches(r, filter))
            .ok_or(StoreError::NotFound)?;
        coll.rows.remove(idx);
        Ok(())
    }

    async fn delete_many(&self, name: &str, filter: &Filter) -> Result<u64, StoreError> {
        check_id(filter)?;
        let mut guard = self.collections.write().await;
        let Some(coll) = guard.get_mut(name) else {
            return Ok(0);
        };
        let before = coll.rows.len();
        coll.rows.retain(|r| !matches(r, filter));
        Ok((before - coll.rows.len()) as u64)
    }

    async fn ensure_unique(&self, name: &str, field: &str) -> Result<(), StoreError> {
        let mut guard = self.collections.write().await;
        let coll = guard.entry(name.to_string()).or_default();
        if !coll.unique.iter().any(|f| f == field) {
            coll.unique.push(field.to_string());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
