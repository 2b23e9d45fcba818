use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compose::SearchTemplate;
use crate::dto::{MemberTeamDto, TeamStats};
use crate::expr::{Expr, Predicate};
use crate::path::{QMember, QTeam};
use crate::projection::{constructor, fields};
use crate::query::{DeleteClause, NullOrdering, OrderSpecifier, Query, UpdateClause};
use crate::session::Session;
use crate::value::Value;
use crate::{CoreError, Member, QueryResults, Store, Team};

/// Optional member search criteria. Absent fields do not constrain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberSearchCondition {
    pub username: Option<String>,
    pub team_name: Option<String>,
    pub age: Option<i32>,
    pub age_goe: Option<i32>,
    pub age_loe: Option<i32>,
}

impl MemberSearchCondition {
    fn bindings(&self) -> [(&'static str, Option<Value>); 5] {
        [
            ("username", self.username.clone().map(Value::from)),
            ("team_name", self.team_name.clone().map(Value::from)),
            ("age", self.age.map(Value::from)),
            ("age_goe", self.age_goe.map(Value::from)),
            ("age_loe", self.age_loe.map(Value::from)),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberSortField {
    Id,
    Username,
    Age,
    TeamName,
}

impl MemberSortField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "id" => Some(Self::Id),
            "username" => Some(Self::Username),
            "age" => Some(Self::Age),
            "team_name" => Some(Self::TeamName),
            _ => None,
        }
    }

    fn expr(self, m: &QMember, t: &QTeam) -> Expr {
        match self {
            Self::Id => m.id(),
            Self::Username => m.username(),
            Self::Age => m.age(),
            Self::TeamName => t.name(),
        }
    }
}

/// One sort key of a member search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberSort {
    pub field: MemberSortField,
    pub descending: bool,
    pub nulls: NullOrdering,
}

impl MemberSort {
    pub fn asc(field: MemberSortField) -> Self {
        Self {
            field,
            descending: false,
            nulls: NullOrdering::Default,
        }
    }

    pub fn desc(field: MemberSortField) -> Self {
        Self {
            descending: true,
            ..Self::asc(field)
        }
    }

    fn to_order(self, m: &QMember, t: &QTeam) -> OrderSpecifier {
        let expr = self.field.expr(m, t);
        let spec = if self.descending {
            OrderSpecifier::desc(expr)
        } else {
            OrderSpecifier::asc(expr)
        };
        match self.nulls {
            NullOrdering::Default => spec,
            NullOrdering::First => spec.nulls_first(),
            NullOrdering::Last => spec.nulls_last(),
        }
    }
}

/// Application service for member registration, search and bulk edits.
///
/// Every call runs in its own [`Session`] over the shared store, so bulk
/// mutations never leave a stale identity map behind.
pub struct MemberService<S: Store> {
    store: S,
    criteria: SearchTemplate<Predicate>,
    m: QMember,
    t: QTeam,
}

impl<S: Store> MemberService<S> {
    pub fn new(store: S) -> Result<Self, CoreError> {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let criteria = SearchTemplate::builder()
            .declare("username")
            .declare("team_name")
            .declare("age")
            .declare("age_goe")
            .declare("age_loe")
            .compare("username", move |v| m.username().eq(v))
            .compare("team_name", move |v| t.name().eq(v))
            .compare("age", move |v| m.age().eq(v))
            .compare("age_goe", move |v| m.age().goe(v))
            .compare("age_loe", move |v| m.age().loe(v))
            .build()?;
        Ok(Self {
            store,
            criteria,
            m,
            t,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn session(&self) -> Session<'_, S> {
        Session::new(&self.store)
    }

    pub fn register_team(&self, name: &str) -> Result<Team, CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidQuery("team name must not be empty".into()));
        }
        let mut session = self.session();
        let mut team = Team::new(name);
        session.persist(&mut team)?;
        session.flush()?;
        Ok(team)
    }

    pub fn register_member(
        &self,
        username: Option<String>,
        age: i32,
        team_id: Option<i64>,
    ) -> Result<Member, CoreError> {
        if age < 0 {
            return Err(CoreError::InvalidQuery("age must not be negative".into()));
        }
        let mut session = self.session();
        let team = match team_id {
            Some(id) => Some(session.find::<Team>(id)?.ok_or(CoreError::NotFound)?),
            None => None,
        };
        let mut member = Member {
            id: None,
            username,
            age,
            team_id: team.and_then(|t| t.id),
        };
        session.persist(&mut member)?;
        session.flush()?;
        Ok(member)
    }

    /// Members with their team, filtered by the present criteria. Without
    /// sort keys the result is ordered by member id.
    pub fn search(
        &self,
        condition: &MemberSearchCondition,
        offset: usize,
        limit: Option<usize>,
        sort: &[MemberSort],
    ) -> Result<QueryResults<MemberTeamDto>, CoreError> {
        let (m, t) = (&self.m, &self.t);
        let predicate = self.criteria.bind(&condition.bindings())?;
        let order: Vec<OrderSpecifier> = if sort.is_empty() {
            vec![m.id().asc()]
        } else {
            sort.iter().map(|s| s.to_order(m, t)).collect()
        };
        let mut query = Query::select([m.id(), m.username(), m.age(), t.id(), t.name()])
            .from(m)
            .left_join(m.team(), t)
            .filter(predicate)
            .order_by(order)
            .offset(offset);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        debug!(%query, "member search");
        self.session()
            .project_results(&query, &constructor::<MemberTeamDto>())
    }

    /// Member count, average and maximum age per team, by team name.
    /// Teams without members report a count of zero.
    pub fn team_stats(&self) -> Result<Vec<TeamStats>, CoreError> {
        let (m, t) = (&self.m, &self.t);
        let query = Query::select([
            t.name().as_("team_name"),
            m.id().count().as_("member_count"),
            m.age().avg().as_("average_age"),
            m.age().max().as_("max_age"),
        ])
        .from(t)
        .left_join_unrelated(m)
        .on(m.team_id().eq(t.id()))
        .group_by([t.id(), t.name()])
        .order_by([t.name().asc()]);
        self.session().project(&query, &fields::<TeamStats>())
    }

    /// Rename every member younger than `age`. Returns the affected count.
    pub fn rename_younger_than(&self, age: i32, username: &str) -> Result<u64, CoreError> {
        let m = &self.m;
        let update = UpdateClause::new(m)
            .set(m.username(), username)
            .filter(m.age().lt(age));
        self.session().execute_update(&update)
    }

    /// Delete every member older than `age`. Returns the affected count.
    pub fn delete_older_than(&self, age: i32) -> Result<u64, CoreError> {
        let m = &self.m;
        self.session()
            .execute_delete(&DeleteClause::new(m).filter(m.age().gt(age)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::fixtures::seed_basic;

    fn service() -> MemberService<MemoryStore> {
        let svc = MemberService::new(MemoryStore::new()).unwrap();
        seed_basic(&mut Session::new(svc.store())).unwrap();
        svc
    }

    fn usernames(page: &QueryResults<MemberTeamDto>) -> Vec<&str> {
        page.items
            .iter()
            .map(|m| m.username.as_deref().unwrap_or(""))
            .collect()
    }

    #[test]
    fn empty_condition_returns_everyone() {
        let svc = service();
        let page = svc
            .search(&MemberSearchCondition::default(), 0, None, &[])
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(usernames(&page), vec!["member1", "member2", "member3", "member4"]);
        assert_eq!(page.items[0].team_name.as_deref(), Some("teamA"));
    }

    #[test]
    fn conditions_intersect() {
        let svc = service();
        let cond = MemberSearchCondition {
            team_name: Some("teamB".into()),
            age_goe: Some(35),
            age_loe: Some(40),
            ..Default::default()
        };
        let page = svc.search(&cond, 0, None, &[]).unwrap();
        assert_eq!(usernames(&page), vec!["member4"]);
    }

    #[test]
    fn window_and_sort() {
        let svc = service();
        let page = svc
            .search(
                &MemberSearchCondition::default(),
                1,
                Some(2),
                &[MemberSort::desc(MemberSortField::Age)],
            )
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(usernames(&page), vec!["member3", "member2"]);
        assert!(page.has_more());
    }

    #[test]
    fn members_without_team_are_listed() {
        let svc = service();
        svc.register_member(None, 50, None).unwrap();
        let cond = MemberSearchCondition {
            age: Some(50),
            ..Default::default()
        };
        let page = svc.search(&cond, 0, None, &[]).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].team_id, None);
        assert_eq!(page.items[0].username, None);
    }

    #[test]
    fn register_member_requires_existing_team() {
        let svc = service();
        let err = svc
            .register_member(Some("ghost".into()), 20, Some(99))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
        assert!(svc.register_team("  ").is_err());
    }

    #[test]
    fn stats_cover_empty_teams() {
        let svc = service();
        svc.register_team("teamC").unwrap();
        let stats = svc.team_stats().unwrap();
        let names: Vec<&str> = stats.iter().map(|s| s.team_name.as_str()).collect();
        assert_eq!(names, vec!["teamA", "teamB", "teamC"]);
        assert_eq!(stats[0].member_count, 2);
        assert_eq!(stats[0].average_age, Some(15.0));
        assert_eq!(stats[1].max_age, Some(40));
        assert_eq!(stats[2].member_count, 0);
        assert_eq!(stats[2].average_age, None);
    }

    #[test]
    fn bulk_operations_are_visible_to_the_next_call() {
        let svc = service();
        assert_eq!(svc.rename_younger_than(28, "non-member").unwrap(), 2);
        let cond = MemberSearchCondition {
            username: Some("non-member".into()),
            ..Default::default()
        };
        assert_eq!(svc.search(&cond, 0, None, &[]).unwrap().total, 2);

        assert_eq!(svc.delete_older_than(18).unwrap(), 3);
        let all = svc
            .search(&MemberSearchCondition::default(), 0, None, &[])
            .unwrap();
        assert_eq!(all.total, 1);
    }

    #[test]
    fn sort_field_names() {
        assert_eq!(MemberSortField::from_name("team_name"), Some(MemberSortField::TeamName));
        assert_eq!(MemberSortField::from_name("nickname"), None);
    }
}
