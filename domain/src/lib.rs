//! Domain library for the member/team query workspace.
//!
//! Holds the entities, the hand-written schema descriptors, the expression
//! and query model, the predicate composer, projections, the storage port
//! and the unit-of-work session. Storage engines live behind [`Store`]; the
//! only one shipped here is the in-memory adapter used by tests and demos.

use thiserror::Error;

pub mod adapters;
pub mod compose;
pub mod dto;
pub mod expr;
pub mod fixtures;
pub mod path;
pub mod projection;
pub mod query;
pub mod schema;
pub mod service;
pub mod session;
pub mod value;

pub use compose::{compose, Conjunction, Criteria, SearchTemplate};
pub use expr::{CaseBuilder, Expr, Predicate};
pub use path::{QMember, QTeam, Source};
pub use projection::Tuple;
pub use query::{DeleteClause, OrderSpecifier, Query, UpdateClause};
pub use schema::EntityKind;
pub use session::Session;
pub use value::{FromValue, Value};

/// A team. Members point at teams; teams know nothing about their members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
}

impl Team {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

/// A member, optionally belonging to one team.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: Option<i64>,
    /// Display name; may be absent.
    pub username: Option<String>,
    pub age: i32,
    /// Many-to-one reference to [`Team::id`].
    pub team_id: Option<i64>,
}

impl Member {
    pub fn new<S: Into<String>>(username: S, age: i32, team: Option<&Team>) -> Self {
        Self {
            id: None,
            username: Some(username.into()),
            age,
            team_id: team.and_then(|t| t.id),
        }
    }

    /// A member without a display name.
    pub fn anonymous(age: i32) -> Self {
        Self {
            id: None,
            username: None,
            age,
            team_id: None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

/// A persistable record described by a [`schema::EntityDescriptor`].
///
/// Rows are exchanged with stores as plain value vectors in descriptor
/// field order, identity first.
pub trait Entity: Clone + Sized {
    const KIND: EntityKind;

    fn id(&self) -> Option<i64>;
    fn set_id(&mut self, id: i64);
    fn to_row(&self) -> Vec<Value>;
    fn from_row(row: &[Value]) -> Result<Self, CoreError>;
}

fn column<'a>(row: &'a [Value], idx: usize, kind: EntityKind) -> Result<&'a Value, CoreError> {
    row.get(idx).ok_or_else(|| {
        CoreError::Mapping(format!(
            "{} row has {} columns, expected at least {}",
            kind.name(),
            row.len(),
            idx + 1
        ))
    })
}

impl Entity for Team {
    const KIND: EntityKind = EntityKind::Team;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Vec<Value> {
        vec![Value::from(self.id), Value::from(self.name.as_str())]
    }

    fn from_row(row: &[Value]) -> Result<Self, CoreError> {
        Ok(Self {
            id: Option::<i64>::from_value(column(row, 0, Self::KIND)?)?,
            name: String::from_value(column(row, 1, Self::KIND)?)?,
        })
    }
}

impl Entity for Member {
    const KIND: EntityKind = EntityKind::Member;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.id),
            Value::from(self.username.clone()),
            Value::from(self.age),
            Value::from(self.team_id),
        ]
    }

    fn from_row(row: &[Value]) -> Result<Self, CoreError> {
        Ok(Self {
            id: Option::<i64>::from_value(column(row, 0, Self::KIND)?)?,
            username: Option::<String>::from_value(column(row, 1, Self::KIND)?)?,
            age: i32::from_value(column(row, 2, Self::KIND)?)?,
            team_id: Option::<i64>::from_value(column(row, 3, Self::KIND)?)?,
        })
    }
}

/// Result of a count-aware fetch: one page of items plus the total number
/// of matching rows regardless of the page window.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResults<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl<T> QueryResults<T> {
    pub fn has_more(&self) -> bool {
        ((self.offset + self.items.len()) as u64) < self.total
    }
}

/// Storage port consumed by [`Session`].
///
/// Implementations own query execution: they receive the validated query
/// model and return raw rows. Bulk mutations run directly against storage
/// and never touch any session's identity map.
pub trait Store: Send + Sync {
    /// Reserve the next identity for the given entity.
    fn next_id(&self, entity: EntityKind) -> Result<i64, CoreError>;
    /// Insert a full row (descriptor field order, identity included).
    fn insert(&self, entity: EntityKind, row: &[Value]) -> Result<(), CoreError>;
    fn find_row(&self, entity: EntityKind, id: i64) -> Result<Option<Vec<Value>>, CoreError>;
    /// Execute a select and return its rows, honoring order, offset and limit.
    fn fetch(&self, query: &Query) -> Result<Vec<Tuple>, CoreError>;
    /// Count the rows the query matches, ignoring order, offset and limit.
    fn count(&self, query: &Query) -> Result<u64, CoreError>;
    /// The query's window of rows plus its unwindowed count, read from one
    /// snapshot so the two always agree.
    fn fetch_page(&self, query: &Query) -> Result<(Vec<Tuple>, u64), CoreError>;
    fn execute_update(&self, update: &UpdateClause) -> Result<u64, CoreError>;
    fn execute_delete(&self, delete: &DeleteClause) -> Result<u64, CoreError>;
}

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A single-result fetch matched more than one row.
    #[error("query returned {0} rows where at most one was expected")]
    NotUniqueResult(usize),
    /// Malformed criteria or templates; a program error, never recovered.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("row mapping error: {0}")]
    Mapping(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("resource already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("repository error: {0}")]
    Repository(String),
}

/// Return a short about/version line for the binary to print.
pub fn about() -> String {
    let pkg = env!("CARGO_PKG_NAME");
    let ver = env!("CARGO_PKG_VERSION");
    format!("{} v{} - member query library loaded", pkg, ver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_row_roundtrip_keeps_null_username() {
        let mut m = Member::anonymous(100);
        m.set_id(7);
        let back = Member::from_row(&m.to_row()).unwrap();
        assert_eq!(back, m);
        assert!(back.username().is_none());
    }

    #[test]
    fn member_takes_team_reference_from_persisted_team() {
        let mut team = Team::new("teamA");
        team.set_id(3);
        let m = Member::new("member1", 10, Some(&team));
        assert_eq!(m.team_id, Some(3));
    }

    #[test]
    fn short_row_is_a_mapping_error() {
        let err = Team::from_row(&[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, CoreError::Mapping(_)));
    }

    #[test]
    fn has_more_reflects_window() {
        let page = QueryResults {
            items: vec![1, 2],
            total: 4,
            offset: 1,
            limit: Some(2),
        };
        assert!(page.has_more());
        let last = QueryResults {
            items: vec![4],
            total: 4,
            offset: 3,
            limit: Some(2),
        };
        assert!(!last.has_more());
        let past_end: QueryResults<i32> = QueryResults {
            items: Vec::new(),
            total: 4,
            offset: 10,
            limit: Some(2),
        };
        assert!(!past_end.has_more());
    }
}
