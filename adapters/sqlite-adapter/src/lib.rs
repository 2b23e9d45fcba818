//! sqlite-adapter: SQLite implementation of the `Store` port.
//!
//! Purpose
//! - Run the member/team query model against a real SQL engine, file-based
//!   for local runs or in-memory for tests.
//! - Queries are rendered by [`render`] into parameterised SQL; identities
//!   come from a `counters` table, one row per entity table.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Foreign keys are enforced (`PRAGMA foreign_keys = ON`), so deleting a
//!   team that still has members is a constraint violation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use domain::schema::EntityKind;
use domain::{CoreError, DeleteClause, Query, Store, Tuple, UpdateClause, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ffi, params, params_from_iter, Connection, ErrorCode};
use tracing::{debug, trace};

pub mod render;

use render::Statement;

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(map_sqerr)?;
        Self::with_connection(conn)
    }

    /// A private in-memory database; gone when the store is dropped.
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqerr)?;
        Self::with_connection(conn)
    }

    /// Construct from env var `DB_PATH` (defaults to `./data/members.db`).
    pub fn from_env() -> Result<Self, CoreError> {
        let path = std::env::var("DB_PATH").unwrap_or_else(|_| "./data/members.db".to_string());
        // Ensure directory exists
        if let Some(dir) = Path::new(&path).parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        Self::new(path)
    }

    fn with_connection(conn: Connection) -> Result<Self, CoreError> {
        init_schema(&conn)?;
        debug!("sqlite schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS team (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS member (
            id INTEGER PRIMARY KEY,
            username TEXT,
            age INTEGER NOT NULL,
            team_id INTEGER REFERENCES team(id)
        );
        CREATE INDEX IF NOT EXISTS idx_member_team_id ON member(team_id);
        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        "#,
    )
    .map_err(map_sqerr)
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

/// Constraint failures become domain errors; everything else is a
/// repository error.
fn map_write_err(e: rusqlite::Error) -> CoreError {
    if let rusqlite::Error::SqliteFailure(err, msg) = &e {
        if err.code == ErrorCode::ConstraintViolation {
            if err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
            {
                return CoreError::AlreadyExists;
            }
            let detail = msg.clone().unwrap_or_else(|| err.to_string());
            return CoreError::ConstraintViolation(detail);
        }
    }
    map_sqerr(e)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Result<Value, CoreError> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(v) => Ok(Value::Int(v)),
        ValueRef::Real(v) => Ok(Value::Real(v)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|s| Value::Text(s.to_string()))
            .map_err(|e| CoreError::Mapping(format!("non-utf8 text column: {e}"))),
        ValueRef::Blob(_) => Err(CoreError::Mapping("unexpected blob column".into())),
    }
}

fn sql_params(stmt: &Statement) -> Vec<SqlValue> {
    stmt.params.iter().map(to_sql).collect()
}

/// Run a select and collect `width` columns per row.
fn select_tuples(conn: &Connection, query: &Query) -> Result<Vec<Tuple>, CoreError> {
    let stmt = render::select(query);
    let labels = query.labels();
    query_rows(conn, &stmt, labels.len())?
        .into_iter()
        .map(|values| Tuple::new(labels.clone(), values))
        .collect()
}

fn count_rows(conn: &Connection, query: &Query) -> Result<u64, CoreError> {
    let stmt = render::count(query);
    let rows = query_rows(conn, &stmt, 1)?;
    let total = rows
        .first()
        .and_then(|r| r.first())
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::Mapping("count returned no rows".into()))?;
    Ok(total as u64)
}

fn query_rows(conn: &Connection, stmt: &Statement, width: usize) -> Result<Vec<Vec<Value>>, CoreError> {
    trace!(sql = %stmt.sql, params = stmt.params.len(), "sqlite select");
    let mut prepared = conn.prepare(&stmt.sql).map_err(map_sqerr)?;
    let mut rows = prepared
        .query(params_from_iter(sql_params(stmt)))
        .map_err(map_sqerr)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqerr)? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_sql(row.get_ref(i).map_err(map_sqerr)?)?);
        }
        out.push(values);
    }
    Ok(out)
}

fn execute(conn: &Connection, stmt: &Statement) -> Result<u64, CoreError> {
    trace!(sql = %stmt.sql, params = stmt.params.len(), "sqlite execute");
    let changed = conn
        .execute(&stmt.sql, params_from_iter(sql_params(stmt)))
        .map_err(map_write_err)?;
    Ok(changed as u64)
}

fn column_list(kind: EntityKind) -> String {
    kind.descriptor()
        .fields
        .iter()
        .map(|f| format!("\"{}\"", f.column))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store for SqliteStore {
    /// Atomically advance the entity's counter past any identity already in
    /// the table and return it.
    fn next_id(&self, entity: EntityKind) -> Result<i64, CoreError> {
        let table = entity.descriptor().table;
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqerr)?;
        // Ensure counter row exists
        tx.execute(
            "INSERT OR IGNORE INTO counters(name, value) VALUES(?1, 0)",
            params![table],
        )
        .map_err(map_sqerr)?;
        tx.execute(
            &format!(
                "UPDATE counters SET value = MAX(value, (SELECT COALESCE(MAX(id), 0) FROM \"{table}\")) + 1 WHERE name = ?1"
            ),
            params![table],
        )
        .map_err(map_sqerr)?;
        let val: i64 = tx
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(map_sqerr)?;
        tx.commit().map_err(map_sqerr)?;
        Ok(val)
    }

    fn insert(&self, entity: EntityKind, row: &[Value]) -> Result<(), CoreError> {
        let desc = entity.descriptor();
        if row.len() != desc.width() {
            return Err(CoreError::Mapping(format!(
                "{} row has {} columns, expected {}",
                desc.name,
                row.len(),
                desc.width()
            )));
        }
        let placeholders = (1..=row.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let stmt = Statement {
            sql: format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                desc.table,
                column_list(entity),
                placeholders
            ),
            params: row.to_vec(),
        };
        let conn = self.lock()?;
        execute(&conn, &stmt)?;
        Ok(())
    }

    fn find_row(&self, entity: EntityKind, id: i64) -> Result<Option<Vec<Value>>, CoreError> {
        let desc = entity.descriptor();
        let stmt = Statement {
            sql: format!(
                "SELECT {} FROM \"{}\" WHERE \"{}\" = ?1",
                column_list(entity),
                desc.table,
                desc.id_field().column
            ),
            params: vec![Value::Int(id)],
        };
        let conn = self.lock()?;
        Ok(query_rows(&conn, &stmt, desc.width())?.into_iter().next())
    }

    fn fetch(&self, query: &Query) -> Result<Vec<Tuple>, CoreError> {
        let conn = self.lock()?;
        select_tuples(&conn, query)
    }

    fn count(&self, query: &Query) -> Result<u64, CoreError> {
        let conn = self.lock()?;
        count_rows(&conn, query)
    }

    fn fetch_page(&self, query: &Query) -> Result<(Vec<Tuple>, u64), CoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqerr)?;
        let items = select_tuples(&tx, query)?;
        let total = count_rows(&tx, query)?;
        tx.commit().map_err(map_sqerr)?;
        Ok((items, total))
    }

    fn execute_update(&self, update: &UpdateClause) -> Result<u64, CoreError> {
        let stmt = render::update(update);
        let conn = self.lock()?;
        execute(&conn, &stmt)
    }

    fn execute_delete(&self, delete: &DeleteClause) -> Result<u64, CoreError> {
        let stmt = render::delete(delete);
        let conn = self.lock()?;
        execute(&conn, &stmt)
    }
}
