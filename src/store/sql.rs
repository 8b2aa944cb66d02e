//! Compiles facade filters and patches into parameterized Postgres SQL.
//!
//! Identifiers are never bound, so every table, column and nested key is
//! checked against a strict pattern before it is quoted into the text.

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use super::{Change, Condition, Filter, Op, Patch, Record, StoreError, Value, ID_FIELD};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Param {
    Value(Value),
    Uuid(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    fn push(&mut self, param: Param) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

fn is_identifier(name: &str) -> bool {
    lazy_static! {
        static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    }
    IDENT_RE.is_match(name)
}

pub(crate) fn ident(name: &str) -> Result<String, StoreError> {
    if !is_identifier(name) {
        return Err(StoreError::Unsupported(format!("invalid identifier `{name}`")));
    }
    Ok(format!("\"{name}\""))
}

/// Splits `custom.a.b` into the quoted column and a text-array path literal.
fn split_path(field: &str) -> Result<(String, Option<String>), StoreError> {
    let mut parts = field.split('.');
    let column = ident(parts.next().unwrap_or_default())?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        return Ok((column, None));
    }
    for key in &rest {
        if !is_identifier(key) {
            return Err(StoreError::Unsupported(format!("invalid path segment `{key}`")));
        }
    }
    Ok((column, Some(format!("'{{{}}}'", rest.join(",")))))
}

pub(crate) fn parse_uuid(id: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(id).map_err(|_| StoreError::InvalidId(id.to_string()))
}

fn id_param(value: &Value) -> Result<Param, StoreError> {
    let raw = value
        .as_text()
        .ok_or_else(|| StoreError::InvalidId("identifier must be a string".into()))?;
    Ok(Param::Uuid(parse_uuid(raw)?))
}

fn op_sql(op: Op) -> &'static str {
    match op {
        Op::Eq => "=",
        Op::Ne => "<>",
        Op::Gt => ">",
        Op::Gte => ">=",
        Op::Lt => "<",
        Op::Lte => "<=",
    }
}

fn condition(stmt: &mut Statement, c: &Condition) -> Result<String, StoreError> {
    if c.field == ID_FIELD {
        let param = id_param(&c.value)?;
        let placeholder = stmt.push(param);
        return Ok(format!("\"{ID_FIELD}\" {} {placeholder}", op_sql(c.op)));
    }
    let (column, path) = split_path(&c.field)?;
    match (path, &c.value) {
        (None, Value::Null) => Ok(match c.op {
            Op::Ne => format!("{column} IS NOT NULL"),
            _ => format!("{column} IS NULL"),
        }),
        (None, value) => {
            let placeholder = stmt.push(Param::Value(value.clone()));
            Ok(format!("{column} {} {placeholder}", op_sql(c.op)))
        }
        (Some(path), value) => {
            let placeholder = stmt.push(Param::Value(Value::Json(value.to_json())));
            Ok(format!("{column} #> {path} {} {placeholder}", op_sql(c.op)))
        }
    }
}

fn where_clause(stmt: &mut Statement, filter: &Filter) -> Result<String, StoreError> {
    if filter.conditions.is_empty() {
        return Ok(String::new());
    }
    let parts = filter
        .conditions
        .iter()
        .map(|c| condition(stmt, c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

/// Narrows a statement to the first matching row. An `id` equality already
/// names at most one row; anything else is pinned by primary key under a row
/// lock so a concurrent writer cannot invalidate the match.
fn single_row(table: &str, filter: &Filter, clause: String) -> String {
    let by_id = filter
        .conditions
        .iter()
        .any(|c| c.field == ID_FIELD && c.op == Op::Eq);
    if by_id {
        return clause;
    }
    format!(" WHERE \"{ID_FIELD}\" = (SELECT \"{ID_FIELD}\" FROM {table}{clause} LIMIT 1 FOR UPDATE)")
}

pub(crate) fn insert(table: &str, record: &Record) -> Result<Statement, StoreError> {
    let table = ident(table)?;
    let mut stmt = Statement { sql: String::new(), params: Vec::new() };
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for (key, value) in record.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
        columns.push(ident(key)?);
        values.push(stmt.push(Param::Value(value.clone())));
    }
    stmt.sql = if columns.is_empty() {
        format!("INSERT INTO {table} DEFAULT VALUES RETURNING \"{ID_FIELD}\"::text AS \"{ID_FIELD}\"")
    } else {
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) RETURNING \"{ID_FIELD}\"::text AS \"{ID_FIELD}\"",
            columns.join(", "),
            values.join(", ")
        )
    };
    Ok(stmt)
}

pub(crate) fn select(table: &str, filter: &Filter, limit_one: bool) -> Result<Statement, StoreError> {
    let table = ident(table)?;
    let mut stmt = Statement { sql: String::new(), params: Vec::new() };
    let clause = where_clause(&mut stmt, filter)?;
    stmt.sql = format!(
        "SELECT * FROM {table}{clause}{}",
        if limit_one { " LIMIT 1" } else { "" }
    );
    Ok(stmt)
}

pub(crate) fn update(
    table: &str,
    filter: &Filter,
    patch: &Patch,
    single: bool,
) -> Result<Statement, StoreError> {
    let table = ident(table)?;
    let mut stmt = Statement { sql: String::new(), params: Vec::new() };

    // Each column gets one assignment; nested changes fold into it in order.
    let mut assignments: Vec<(String, String)> = Vec::new();
    for change in &patch.changes {
        let field = match change {
            Change::Set(f, _) | Change::Unset(f) => f,
        };
        if field == ID_FIELD {
            continue;
        }
        let (column, path) = split_path(field)?;
        let current = assignments
            .iter()
            .position(|(c, _)| *c == column)
            .map(|i| assignments[i].1.clone())
            .unwrap_or_else(|| column.clone());
        let expr = match (change, path) {
            (Change::Set(_, value), None) => stmt.push(Param::Value(value.clone())),
            (Change::Unset(_), None) => "NULL".to_string(),
            (Change::Set(_, value), Some(path)) => {
                let placeholder = stmt.push(Param::Value(Value::Json(value.to_json())));
                format!("jsonb_set(COALESCE({current}, '{{}}'::jsonb), {path}, {placeholder}, true)")
            }
            (Change::Unset(_), Some(path)) => format!("({current} #- {path})"),
        };
        match assignments.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = expr,
            None => assignments.push((column, expr)),
        }
    }
    if assignments.is_empty() {
        return Err(StoreError::Unsupported("empty patch".into()));
    }

    let set = assignments
        .iter()
        .map(|(c, e)| format!("{c} = {e}"))
        .collect::<Vec<_>>()
        .join(", ");
    let clause = where_clause(&mut stmt, filter)?;
    let scope = if single { single_row(&table, filter, clause) } else { clause };
    stmt.sql = format!("UPDATE {table} SET {set}{scope}");
    Ok(stmt)
}

pub(crate) fn delete(table: &str, filter: &Filter, single: bool) -> Result<Statement, StoreError> {
    let table = ident(table)?;
    let mut stmt = Statement { sql: String::new(), params: Vec::new() };
    let clause = where_clause(&mut stmt, filter)?;
    let scope = if single { single_row(&table, filter, clause) } else { clause };
    stmt.sql = format!("DELETE FROM {table}{scope}");
    Ok(stmt)
}

pub(crate) fn create_table(table: &str, columns: &str) -> Result<String, StoreError> {
    Ok(format!("CREATE TABLE IF NOT EXISTS {} ({columns})", ident(table)?))
}

pub(crate) fn unique_index(table: &str, field: &str) -> Result<String, StoreError> {
    if !is_identifier(table) || !is_identifier(field) {
        return Err(StoreError::Unsupported(format!("invalid identifier `{table}.{field}`")));
    }
    Ok(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS \"{table}_{field}_key\" ON \"{table}\" (\"{field}\")"
    ))
}
