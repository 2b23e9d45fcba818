//! Unit of work over a [`Store`].
//!
//! A session tracks the entities it has persisted or loaded in an identity
//! map keyed by `(entity, id)`. Entity-returning reads resolve through that
//! map, so a managed instance always wins over the row just read. Pending
//! inserts are written on [`Session::flush`], which every query runs first.
//!
//! Bulk updates and deletes go straight to the store and do not touch the
//! identity map. After one, the session is stale: reads that resolve through
//! the map log a warning until the caller runs [`Session::clear`].

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::projection::{Projection, Tuple};
use crate::query::{DeleteClause, Query, Selection, UpdateClause};
use crate::schema::EntityKind;
use crate::value::Value;
use crate::{CoreError, Entity, QueryResults, Store};

pub struct Session<'s, S: Store + ?Sized> {
    store: &'s S,
    managed: HashMap<(EntityKind, i64), Vec<Value>>,
    pending: Vec<(EntityKind, i64)>,
    stale: bool,
}

impl<'s, S: Store + ?Sized> Session<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self {
            store,
            managed: HashMap::new(),
            pending: Vec::new(),
            stale: false,
        }
    }

    pub fn store(&self) -> &'s S {
        self.store
    }

    /// Assign an identity and queue the insert. Persisting a managed entity
    /// again is a no-op; an entity carrying an identity this session does
    /// not manage is rejected.
    pub fn persist<E: Entity>(&mut self, entity: &mut E) -> Result<i64, CoreError> {
        if let Some(id) = entity.id() {
            if self.managed.contains_key(&(E::KIND, id)) {
                return Ok(id);
            }
            return Err(CoreError::AlreadyExists);
        }
        let id = self.store.next_id(E::KIND)?;
        entity.set_id(id);
        self.managed.insert((E::KIND, id), entity.to_row());
        self.pending.push((E::KIND, id));
        Ok(id)
    }

    /// Write pending inserts in persist order. On failure the failed insert
    /// and everything after it stay pending.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let total = self.pending.len();
        let mut written = 0;
        let result = self.pending.iter().try_for_each(|key| {
            let row = self
                .managed
                .get(key)
                .ok_or_else(|| CoreError::Repository("pending entity is not managed".into()))?;
            self.store.insert(key.0, row)?;
            written += 1;
            Ok(())
        });
        self.pending.drain(..written);
        debug!(written, remaining = total - written, "session flush");
        result
    }

    /// Detach every entity and drop pending inserts.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                discarded = self.pending.len(),
                "session cleared with unflushed inserts"
            );
        }
        debug!(detached = self.managed.len(), "session clear");
        self.managed.clear();
        self.pending.clear();
        self.stale = false;
    }

    /// Whether a bulk mutation ran since the last [`Session::clear`].
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Whether the entity is in the identity map.
    pub fn is_loaded(&self, kind: EntityKind, id: i64) -> bool {
        self.managed.contains_key(&(kind, id))
    }

    fn warn_if_stale(&self, what: &str) {
        if self.stale {
            warn!(
                read = what,
                "reading through the identity map after a bulk mutation; clear the session to observe it"
            );
        }
    }

    /// Resolve a row through the identity map, managing it if new.
    fn resolve<E: Entity>(&mut self, row: &[Value]) -> Result<E, CoreError> {
        let id = match row.first() {
            Some(Value::Int(id)) => *id,
            _ => return E::from_row(row),
        };
        match self.managed.get(&(E::KIND, id)) {
            Some(managed) => {
                self.warn_if_stale(E::KIND.name());
                E::from_row(managed)
            }
            None => {
                let entity = E::from_row(row)?;
                self.managed.insert((E::KIND, id), row.to_vec());
                Ok(entity)
            }
        }
    }

    /// Load by identity, identity map first.
    pub fn find<E: Entity>(&mut self, id: i64) -> Result<Option<E>, CoreError> {
        if let Some(row) = self.managed.get(&(E::KIND, id)) {
            self.warn_if_stale(E::KIND.name());
            return E::from_row(row).map(Some);
        }
        match self.store.find_row(E::KIND, id)? {
            Some(row) => self.resolve(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Flush, validate and run the query, returning raw rows.
    pub fn fetch_tuples(&mut self, query: &Query) -> Result<Vec<Tuple>, CoreError> {
        query.validate()?;
        self.flush()?;
        self.store.fetch(query)
    }

    /// Number of rows the query matches, ignoring its window.
    pub fn fetch_count(&mut self, query: &Query) -> Result<u64, CoreError> {
        query.validate()?;
        self.flush()?;
        self.store.count(query)
    }

    /// Entities selected by a query whose first selection is `E`'s source.
    ///
    /// Fetch joins add the joined entity to the select list; those rows are
    /// loaded into the identity map alongside the roots.
    pub fn fetch<E: Entity>(&mut self, query: &Query) -> Result<Vec<E>, CoreError> {
        let plan = EntityPlan::for_query::<E>(query)?;
        let tuples = self.fetch_tuples(&plan.query)?;
        self.load(&plan, tuples)
    }

    fn load<E: Entity>(
        &mut self,
        plan: &EntityPlan,
        tuples: Vec<Tuple>,
    ) -> Result<Vec<E>, CoreError> {
        let mut out = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let values = tuple.values();
            for (kind, start) in &plan.eager {
                let width = kind.descriptor().width();
                let row = &values[*start..start + width];
                if let Some(Value::Int(id)) = row.first() {
                    self.managed.entry((*kind, *id)).or_insert_with(|| row.to_vec());
                }
            }
            out.push(self.resolve(&values[..plan.root_width])?);
        }
        Ok(out)
    }

    /// Validate, flush and read one window plus its total in a single store
    /// call.
    fn fetch_page(&mut self, query: &Query) -> Result<(Vec<Tuple>, u64), CoreError> {
        query.validate()?;
        self.flush()?;
        self.store.fetch_page(query)
    }

    /// Pairs of a root entity and a joined entity, in select order. The
    /// second entity is `None` when an outer join found no match.
    pub fn fetch_pairs<A: Entity, B: Entity>(
        &mut self,
        query: &Query,
    ) -> Result<Vec<(A, Option<B>)>, CoreError> {
        let (a, b) = match query.selections.as_slice() {
            [Selection::Entity(a), Selection::Entity(b)]
                if a.entity == A::KIND && b.entity == B::KIND =>
            {
                (a.descriptor().width(), b.descriptor().width())
            }
            _ => {
                return Err(CoreError::InvalidQuery(format!(
                    "query does not select ({}, {})",
                    A::KIND.name(),
                    B::KIND.name()
                )))
            }
        };
        let tuples = self.fetch_tuples(query)?;
        let mut out = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let values = tuple.values();
            let first = self.resolve(&values[..a])?;
            let second = &values[a..a + b];
            let second = if second.first().is_some_and(Value::is_null) {
                None
            } else {
                Some(self.resolve(second)?)
            };
            out.push((first, second));
        }
        Ok(out)
    }

    /// Exactly zero or one entity; more is `NotUniqueResult`.
    pub fn fetch_one<E: Entity>(&mut self, query: &Query) -> Result<Option<E>, CoreError> {
        let mut rows = self.fetch::<E>(query)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(CoreError::NotUniqueResult(n)),
        }
    }

    /// The first entity of the query's window, if any.
    pub fn fetch_first<E: Entity>(&mut self, query: &Query) -> Result<Option<E>, CoreError> {
        let first = query.clone().limit(1);
        Ok(self.fetch::<E>(&first)?.into_iter().next())
    }

    /// One window of entities plus the total match count.
    pub fn fetch_results<E: Entity>(
        &mut self,
        query: &Query,
    ) -> Result<QueryResults<E>, CoreError> {
        let plan = EntityPlan::for_query::<E>(query)?;
        let (tuples, total) = self.fetch_page(&plan.query)?;
        let items = self.load(&plan, tuples)?;
        Ok(QueryResults {
            items,
            total,
            offset: query.offset,
            limit: query.limit,
        })
    }

    /// Rows mapped through a projection strategy.
    pub fn project<T, P>(&mut self, query: &Query, projection: &P) -> Result<Vec<T>, CoreError>
    where
        P: Projection<T> + ?Sized,
    {
        self.fetch_tuples(query)?
            .iter()
            .map(|t| projection.project(t))
            .collect()
    }

    /// One projected window plus the total match count.
    pub fn project_results<T, P>(
        &mut self,
        query: &Query,
        projection: &P,
    ) -> Result<QueryResults<T>, CoreError>
    where
        P: Projection<T> + ?Sized,
    {
        let (tuples, total) = self.fetch_page(query)?;
        let items = tuples
            .iter()
            .map(|t| projection.project(t))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResults {
            items,
            total,
            offset: query.offset,
            limit: query.limit,
        })
    }

    /// Run a bulk update against the store. Managed entities keep their old
    /// state until [`Session::clear`].
    pub fn execute_update(&mut self, update: &UpdateClause) -> Result<u64, CoreError> {
        update.validate()?;
        self.flush()?;
        let affected = self.store.execute_update(update)?;
        self.stale = true;
        debug!(%update, affected, "bulk update");
        Ok(affected)
    }

    /// Run a bulk delete against the store. Deleted entities stay managed
    /// until [`Session::clear`].
    pub fn execute_delete(&mut self, delete: &DeleteClause) -> Result<u64, CoreError> {
        delete.validate()?;
        self.flush()?;
        let affected = self.store.execute_delete(delete)?;
        self.stale = true;
        debug!(%delete, affected, "bulk delete");
        Ok(affected)
    }
}

/// An entity query widened with its fetch-joined entities.
struct EntityPlan {
    query: Query,
    root_width: usize,
    /// Fetch-joined entities and the column each starts at.
    eager: Vec<(EntityKind, usize)>,
}

impl EntityPlan {
    fn for_query<E: Entity>(query: &Query) -> Result<Self, CoreError> {
        let root_width = match query.selections.first() {
            Some(Selection::Entity(src)) if src.entity == E::KIND => src.descriptor().width(),
            _ => {
                return Err(CoreError::InvalidQuery(format!(
                    "query does not select {} first",
                    E::KIND.name()
                )))
            }
        };
        let mut effective = query.clone();
        let mut eager = Vec::new();
        for join in query.joins.iter().filter(|j| j.fetch) {
            eager.push((join.target.entity, effective.width()));
            effective.selections.push(Selection::Entity(join.target));
        }
        Ok(Self {
            query: effective,
            root_width,
            eager,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::adapters::MemoryStore;
    use crate::path::{QMember, QTeam};
    use crate::projection::constructor_fn;
    use crate::{Member, Team};

    #[test]
    fn persist_assigns_ids_and_flushes_in_order() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let mut team = Team::new("teamA");
        let team_id = session.persist(&mut team).unwrap();
        let mut member = Member::new("member1", 10, Some(&team));
        session.persist(&mut member).unwrap();
        assert_eq!(member.team_id, Some(team_id));
        assert_eq!(store.len(EntityKind::Member).unwrap(), 0);

        session.flush().unwrap();
        assert_eq!(store.len(EntityKind::Team).unwrap(), 1);
        assert_eq!(store.len(EntityKind::Member).unwrap(), 1);
    }

    #[test]
    fn persisting_a_detached_entity_is_rejected() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let mut team = Team::new("teamA");
        session.persist(&mut team).unwrap();
        assert!(session.persist(&mut team).is_ok());
        session.flush().unwrap();
        session.clear();
        assert!(matches!(
            session.persist(&mut team),
            Err(CoreError::AlreadyExists)
        ));
    }

    #[test]
    fn queries_flush_first() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        session.persist(&mut Team::new("teamA")).unwrap();
        let t = QTeam::new("t");
        let teams: Vec<Team> = session.fetch(&Query::select_from(&t)).unwrap();
        assert_eq!(teams.len(), 1);
    }

    #[test]
    fn failed_flush_keeps_remaining_inserts() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let mut ghost = Team::new("ghost");
        ghost.set_id(42);
        let mut bad = Member::new("member1", 10, Some(&ghost));
        let mut good = Member::anonymous(20);
        session.persist(&mut bad).unwrap();
        session.persist(&mut good).unwrap();
        assert!(session.flush().is_err());
        assert_eq!(store.len(EntityKind::Member).unwrap(), 0);
        session.clear();
        session.flush().unwrap();
    }

    #[test]
    fn find_prefers_identity_map() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let mut team = Team::new("teamA");
        let id = session.persist(&mut team).unwrap();
        let found: Team = session.find(id).unwrap().unwrap();
        assert_eq!(found, team);
        assert_eq!(store.len(EntityKind::Team).unwrap(), 0);
        assert!(session.find::<Team>(id + 1).unwrap().is_none());
    }

    #[test]
    fn fetch_one_rejects_multiple_rows() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        session.persist(&mut Member::anonymous(10)).unwrap();
        session.persist(&mut Member::anonymous(10)).unwrap();
        let m = QMember::new("m");
        let q = Query::select_from(&m).filter(m.age().eq(10));
        assert!(matches!(
            session.fetch_one::<Member>(&q),
            Err(CoreError::NotUniqueResult(2))
        ));
        let none = Query::select_from(&m).filter(m.age().eq(11));
        assert!(session.fetch_one::<Member>(&none).unwrap().is_none());
        assert!(session.fetch_first::<Member>(&q).unwrap().is_some());
    }

    #[test]
    fn fetch_requires_matching_root() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let m = QMember::new("m");
        let err = session.fetch::<Team>(&Query::select_from(&m)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery(_)));
    }

    #[test]
    fn bulk_update_leaves_managed_entities_stale_until_clear() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        for age in [10, 20, 30, 40] {
            session
                .persist(&mut Member::new(format!("member{}", age / 10), age, None))
                .unwrap();
        }
        let m = QMember::new("m");
        let affected = session
            .execute_update(
                &UpdateClause::new(&m)
                    .set(m.username(), "non-member")
                    .filter(m.age().lt(28)),
            )
            .unwrap();
        assert_eq!(affected, 2);
        assert!(session.is_stale());

        let q = Query::select_from(&m).order_by([m.age().asc()]);
        let before: Vec<Member> = session.fetch(&q).unwrap();
        assert_eq!(before[0].username(), Some("member1"));

        session.clear();
        assert!(!session.is_stale());
        let after: Vec<Member> = session.fetch(&q).unwrap();
        let names: Vec<_> = after.iter().map(|m| m.username().unwrap_or("")).collect();
        assert_eq!(names, vec!["non-member", "non-member", "member3", "member4"]);
    }

    #[test]
    fn fetch_join_loads_team() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let mut team = Team::new("teamA");
        let team_id = session.persist(&mut team).unwrap();
        session.persist(&mut Member::new("member1", 10, Some(&team))).unwrap();
        session.flush().unwrap();
        session.clear();

        let m = QMember::new("m");
        let t = QTeam::new("t");
        let plain = Query::select_from(&m).join(m.team(), &t);
        let _: Vec<Member> = session.fetch(&plain).unwrap();
        assert!(!session.is_loaded(EntityKind::Team, team_id));

        session.clear();
        let eager = Query::select_from(&m).join(m.team(), &t).fetch_join();
        let members: Vec<Member> = session.fetch(&eager).unwrap();
        assert_eq!(members.len(), 1);
        assert!(session.is_loaded(EntityKind::Team, team_id));
    }

    #[test]
    fn fetch_results_reports_total_beyond_window() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        for age in [10, 20, 30, 40] {
            session.persist(&mut Member::anonymous(age)).unwrap();
        }
        let m = QMember::new("m");
        let q = Query::select_from(&m)
            .order_by([m.age().desc()])
            .offset(1)
            .limit(2);
        let page: QueryResults<Member> = session.fetch_results(&q).unwrap();
        assert_eq!(page.total, 4);
        let ages: Vec<i32> = page.items.iter().map(|m| m.age).collect();
        assert_eq!(ages, vec![30, 20]);
        assert!(page.has_more());
    }

    /// Counts read calls on the way to an in-memory store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        reads: AtomicUsize,
    }

    impl CountingStore {
        fn reads(&self) -> usize {
            self.reads.load(AtomicOrdering::SeqCst)
        }
    }

    impl Store for CountingStore {
        fn next_id(&self, entity: EntityKind) -> Result<i64, CoreError> {
            self.inner.next_id(entity)
        }

        fn insert(&self, entity: EntityKind, row: &[Value]) -> Result<(), CoreError> {
            self.inner.insert(entity, row)
        }

        fn find_row(&self, entity: EntityKind, id: i64) -> Result<Option<Vec<Value>>, CoreError> {
            self.inner.find_row(entity, id)
        }

        fn fetch(&self, query: &Query) -> Result<Vec<Tuple>, CoreError> {
            self.reads.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.fetch(query)
        }

        fn count(&self, query: &Query) -> Result<u64, CoreError> {
            self.reads.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.count(query)
        }

        fn fetch_page(&self, query: &Query) -> Result<(Vec<Tuple>, u64), CoreError> {
            self.reads.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.fetch_page(query)
        }

        fn execute_update(&self, update: &UpdateClause) -> Result<u64, CoreError> {
            self.inner.execute_update(update)
        }

        fn execute_delete(&self, delete: &DeleteClause) -> Result<u64, CoreError> {
            self.inner.execute_delete(delete)
        }
    }

    #[test]
    fn paged_reads_take_one_store_call() {
        let store = CountingStore::default();
        let mut session = Session::new(&store);
        let mut team = Team::new("teamA");
        session.persist(&mut team).unwrap();
        for age in [10, 20, 30] {
            session.persist(&mut Member::new("member", age, Some(&team))).unwrap();
        }

        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select_from(&m)
            .join(m.team(), &t)
            .fetch_join()
            .order_by([m.age().asc()])
            .limit(2);
        let page: QueryResults<Member> = session.fetch_results(&q).unwrap();
        assert_eq!(store.reads(), 1);
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);

        let ages = Query::select([m.age()]).from(&m).offset(2);
        let projected: QueryResults<i32> = session
            .project_results(&ages, &constructor_fn(|(age,): (i32,)| age))
            .unwrap();
        assert_eq!(store.reads(), 2);
        assert_eq!(projected.total, 3);
        assert_eq!(projected.items, vec![30]);
    }

    #[test]
    fn left_join_pairs_have_optional_team() {
        let store = MemoryStore::new();
        let mut session = Session::new(&store);
        let mut team = Team::new("teamA");
        session.persist(&mut team).unwrap();
        session.persist(&mut Member::new("member1", 10, Some(&team))).unwrap();
        session.persist(&mut Member::anonymous(20)).unwrap();

        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select([Selection::from(&m), Selection::from(&t)])
            .from(&m)
            .left_join(m.team(), &t)
            .order_by([m.age().asc()]);
        let pairs: Vec<(Member, Option<Team>)> = session.fetch_pairs(&q).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1.as_ref().map(|t| t.name.as_str()), Some("teamA"));
        assert!(pairs[1].1.is_none());
    }
}
