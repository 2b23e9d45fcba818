use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use super::eval::{Evaluator, Tables};
use crate::projection::Tuple;
use crate::query::{DeleteClause, Query, UpdateClause};
use crate::schema::{EntityDescriptor, EntityKind};
use crate::value::Value;
use crate::{CoreError, Store};

#[derive(Default)]
struct State {
    tables: Tables,
    sequences: BTreeMap<EntityKind, i64>,
}

/// In-memory store for tests and demos.
///
/// Enforces the same constraints as the SQLite schema: primary keys,
/// not-null columns and many-to-one references, including refusing to
/// delete a row that is still referenced.
pub struct MemoryStore {
    inner: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }

    /// Number of stored rows for an entity.
    pub fn len(&self, entity: EntityKind) -> Result<usize, CoreError> {
        let state = self.lock()?;
        Ok(state.tables.get(&entity).map_or(0, BTreeMap::len))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Not-null and reference checks for a full row.
fn check_row(tables: &Tables, desc: &EntityDescriptor, row: &[Value]) -> Result<(), CoreError> {
    if row.len() != desc.width() {
        return Err(CoreError::Mapping(format!(
            "{} row has {} columns, expected {}",
            desc.name,
            row.len(),
            desc.width()
        )));
    }
    for (field, value) in desc.fields.iter().zip(row) {
        if value.is_null() {
            if !field.nullable {
                return Err(CoreError::ConstraintViolation(format!(
                    "NOT NULL constraint failed: {}.{}",
                    desc.table, field.column
                )));
            }
            continue;
        }
        if let Some(target) = field.references {
            let exists = value
                .as_i64()
                .is_some_and(|id| tables.get(&target).is_some_and(|rows| rows.contains_key(&id)));
            if !exists {
                return Err(CoreError::ConstraintViolation(
                    "FOREIGN KEY constraint failed".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Fail when any row of another entity still references one of `ids`.
fn check_unreferenced(tables: &Tables, target: EntityKind, ids: &[i64]) -> Result<(), CoreError> {
    for (kind, rows) in tables {
        for (idx, field) in kind.descriptor().fields.iter().enumerate() {
            if field.references != Some(target) {
                continue;
            }
            let referenced = rows.values().any(|row| {
                row.get(idx)
                    .and_then(Value::as_i64)
                    .is_some_and(|id| ids.contains(&id))
            });
            if referenced {
                return Err(CoreError::ConstraintViolation(
                    "FOREIGN KEY constraint failed".into(),
                ));
            }
        }
    }
    Ok(())
}

impl Store for MemoryStore {
    fn next_id(&self, entity: EntityKind) -> Result<i64, CoreError> {
        let mut state = self.lock()?;
        let highest = state
            .tables
            .get(&entity)
            .and_then(|rows| rows.keys().next_back().copied())
            .unwrap_or(0);
        let seq = state.sequences.entry(entity).or_insert(0);
        *seq = (*seq).max(highest) + 1;
        Ok(*seq)
    }

    fn insert(&self, entity: EntityKind, row: &[Value]) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        let desc = entity.descriptor();
        check_row(&state.tables, desc, row)?;
        let id = row
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::ConstraintViolation("identity must be an integer".into()))?;
        let rows = state.tables.entry(entity).or_default();
        if rows.contains_key(&id) {
            return Err(CoreError::AlreadyExists);
        }
        rows.insert(id, row.to_vec());
        trace!(entity = desc.name, id, "inserted row");
        Ok(())
    }

    fn find_row(&self, entity: EntityKind, id: i64) -> Result<Option<Vec<Value>>, CoreError> {
        let state = self.lock()?;
        Ok(state
            .tables
            .get(&entity)
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    fn fetch(&self, query: &Query) -> Result<Vec<Tuple>, CoreError> {
        let state = self.lock()?;
        trace!(%query, "memory fetch");
        Evaluator::new(&state.tables).fetch(query)
    }

    fn count(&self, query: &Query) -> Result<u64, CoreError> {
        let state = self.lock()?;
        trace!(%query, "memory count");
        Evaluator::new(&state.tables).count(query)
    }

    fn fetch_page(&self, query: &Query) -> Result<(Vec<Tuple>, u64), CoreError> {
        let state = self.lock()?;
        trace!(%query, "memory page");
        let eval = Evaluator::new(&state.tables);
        Ok((eval.fetch(query)?, eval.count(query)?))
    }

    fn execute_update(&self, update: &UpdateClause) -> Result<u64, CoreError> {
        let mut state = self.lock()?;
        trace!(%update, "memory update");
        let desc = update.target.descriptor();
        let changes = {
            let eval = Evaluator::new(&state.tables);
            let mut changes = Vec::new();
            for (id, row) in eval.matching(update.target, &update.predicate)? {
                let updated = eval.assign(update.target, row, &update.assignments)?;
                check_row(&state.tables, desc, &updated)?;
                changes.push((id, updated));
            }
            changes
        };
        let affected = changes.len() as u64;
        let rows = state.tables.entry(update.target.entity).or_default();
        for (id, row) in changes {
            rows.insert(id, row);
        }
        Ok(affected)
    }

    fn execute_delete(&self, delete: &DeleteClause) -> Result<u64, CoreError> {
        let mut state = self.lock()?;
        trace!(%delete, "memory delete");
        let ids: Vec<i64> = Evaluator::new(&state.tables)
            .matching(delete.target, &delete.predicate)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        check_unreferenced(&state.tables, delete.target.entity, &ids)?;
        if let Some(rows) = state.tables.get_mut(&delete.target.entity) {
            for id in &ids {
                rows.remove(id);
            }
        }
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{QMember, QTeam};
    use crate::{Entity, Member, Team};

    fn store_with_fixtures() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, name) in [(1, "teamA"), (2, "teamB")] {
            let mut t = Team::new(name);
            t.set_id(id);
            store.insert(EntityKind::Team, &t.to_row()).unwrap();
        }
        for (i, (name, age, team)) in [
            ("member1", 10, 1),
            ("member2", 20, 1),
            ("member3", 30, 2),
            ("member4", 40, 2),
        ]
        .into_iter()
        .enumerate()
        {
            let row = vec![
                Value::Int(i as i64 + 1),
                Value::from(name),
                Value::Int(age),
                Value::Int(team),
            ];
            store.insert(EntityKind::Member, &row).unwrap();
        }
        store
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let store = store_with_fixtures();
        let mut t = Team::new("again");
        t.set_id(1);
        let err = store.insert(EntityKind::Team, &t.to_row()).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists));
    }

    #[test]
    fn next_id_skips_explicit_ids() {
        let store = store_with_fixtures();
        assert_eq!(store.next_id(EntityKind::Member).unwrap(), 5);
        assert_eq!(store.next_id(EntityKind::Member).unwrap(), 6);
        assert_eq!(store.next_id(EntityKind::Team).unwrap(), 3);
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let store = store_with_fixtures();
        let mut m = Member::anonymous(5);
        m.set_id(9);
        m.team_id = Some(99);
        let err = store.insert(EntityKind::Member, &m.to_row()).unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation(_)));
    }

    #[test]
    fn fetch_filters_and_orders() {
        let store = store_with_fixtures();
        let m = QMember::new("m");
        let q = Query::select([m.username()])
            .from(&m)
            .filter(m.age().goe(20))
            .order_by([m.age().desc()]);
        let rows = store.fetch(&q).unwrap();
        let names: Vec<String> = rows.iter().map(|t| t.get_as(0).unwrap()).collect();
        assert_eq!(names, vec!["member4", "member3", "member2"]);
        let (page, total) = store.fetch_page(&q.clone().offset(1).limit(1)).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].get_as::<String>(0).unwrap(), "member3");
        assert_eq!(store.count(&q.limit(1)).unwrap(), 3);
    }

    #[test]
    fn update_is_all_or_nothing() {
        let store = store_with_fixtures();
        let m = QMember::new("m");
        let bad = UpdateClause::new(&m).set(m.team_id(), 99).filter(m.age().gt(15));
        assert!(store.execute_update(&bad).is_err());
        let q = Query::select([m.team_id()]).from(&m).filter(m.team_id().eq(99));
        assert!(store.fetch(&q).unwrap().is_empty());
    }

    #[test]
    fn referenced_team_cannot_be_deleted() {
        let store = store_with_fixtures();
        let t = QTeam::new("t");
        let err = store
            .execute_delete(&DeleteClause::new(&t).filter(t.name().eq("teamA")))
            .unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation(_)));

        let m = QMember::new("m");
        let removed = store.execute_delete(&DeleteClause::new(&m)).unwrap();
        assert_eq!(removed, 4);
        let removed = store
            .execute_delete(&DeleteClause::new(&t).filter(t.name().eq("teamA")))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(EntityKind::Team).unwrap(), 1);
    }
}
