//! Query model: selections, sources, joins, filters, grouping, ordering and
//! the page window, plus bulk update/delete clauses.
//!
//! Building is infallible; structural problems (a dangling `on`, an alias
//! out of scope, a pattern match on a number) are collected and reported by
//! [`Query::validate`], which every session operation runs before handing
//! the query to a store.

use std::fmt::{self, Display, Formatter};

use crate::compose::compose;
use crate::expr::{Expr, Predicate};
use crate::path::{Association, FieldRef, Source};
use crate::schema::{FieldKind, OperatorClass};
use crate::CoreError;

/// One item in the select list.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// Every field of the source, in descriptor order.
    Entity(Source),
    Expr(Expr),
}

impl Selection {
    pub fn width(&self) -> usize {
        match self {
            Selection::Entity(s) => s.descriptor().width(),
            Selection::Expr(_) => 1,
        }
    }
}

impl From<Expr> for Selection {
    fn from(e: Expr) -> Self {
        Selection::Expr(e)
    }
}

impl From<Source> for Selection {
    fn from(s: Source) -> Self {
        Selection::Entity(s)
    }
}

impl From<&crate::path::QMember> for Selection {
    fn from(q: &crate::path::QMember) -> Self {
        Selection::Entity(q.source())
    }
}

impl From<&crate::path::QTeam> for Selection {
    fn from(q: &crate::path::QTeam) -> Self {
        Selection::Entity(q.source())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub target: Source,
    /// Equi-join key `(fk, target.id)` for association joins.
    pub key: Option<(FieldRef, FieldRef)>,
    /// Extra clause evaluated as part of the join condition, before
    /// unmatched left rows are null-extended.
    pub on: Predicate,
    /// Load the joined entity together with the root.
    pub fetch: bool,
}

impl Join {
    /// Full join condition: key equality followed by the extra clause.
    pub fn condition(&self) -> Predicate {
        let key = self
            .key
            .map(|(fk, pk)| Expr::Field(fk).eq(Expr::Field(pk)));
        compose([key, Some(self.on.clone())])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Where nulls go. `Default` follows the store: nulls compare lowest, so
/// they lead ascending sorts and trail descending ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullOrdering {
    Default,
    First,
    Last,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderSpecifier {
    pub expr: Expr,
    pub direction: Direction,
    pub nulls: NullOrdering,
}

impl OrderSpecifier {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: Direction::Asc,
            nulls: NullOrdering::Default,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: Direction::Desc,
            nulls: NullOrdering::Default,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = NullOrdering::First;
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = NullOrdering::Last;
        self
    }

    /// Whether nulls sort before non-null values once defaults are resolved.
    pub fn nulls_lead(&self) -> bool {
        match self.nulls {
            NullOrdering::First => true,
            NullOrdering::Last => false,
            NullOrdering::Default => self.direction == Direction::Asc,
        }
    }
}

impl Display for OrderSpecifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        write!(f, "{} {dir}", self.expr)?;
        match self.nulls {
            NullOrdering::Default => Ok(()),
            NullOrdering::First => write!(f, " nulls first"),
            NullOrdering::Last => write!(f, " nulls last"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub selections: Vec<Selection>,
    pub from: Source,
    pub joins: Vec<Join>,
    pub predicate: Predicate,
    pub group_by: Vec<Expr>,
    pub having: Predicate,
    pub order_by: Vec<OrderSpecifier>,
    pub offset: usize,
    pub limit: Option<usize>,
    issues: Vec<String>,
}

/// `Query::select(..)` waiting for its `from`.
#[derive(Clone, Debug)]
pub struct SelectBuilder {
    selections: Vec<Selection>,
}

impl SelectBuilder {
    pub fn from(self, source: impl Into<Source>) -> Query {
        let mut q = Query::select_from(source);
        q.selections = self.selections;
        q
    }
}

impl Query {
    /// Select the root entity itself.
    pub fn select_from(source: impl Into<Source>) -> Query {
        let from = source.into();
        Query {
            selections: vec![Selection::Entity(from)],
            from,
            joins: Vec::new(),
            predicate: Predicate::True,
            group_by: Vec::new(),
            having: Predicate::True,
            order_by: Vec::new(),
            offset: 0,
            limit: None,
            issues: Vec::new(),
        }
    }

    pub fn select<I, S>(items: I) -> SelectBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<Selection>,
    {
        SelectBuilder {
            selections: items.into_iter().map(Into::into).collect(),
        }
    }

    fn push_join(
        mut self,
        kind: JoinKind,
        assoc: Option<Association>,
        target: Source,
    ) -> Query {
        let key = match assoc {
            Some(a) if a.target != target.entity => {
                self.issues.push(format!(
                    "association {} targets {}, not {}",
                    a.fk,
                    a.target.name(),
                    target.entity.name()
                ));
                None
            }
            Some(a) => Some((a.fk, target.id())),
            None => None,
        };
        self.joins.push(Join {
            kind,
            target,
            key,
            on: Predicate::True,
            fetch: false,
        });
        self
    }

    /// Inner equi-join along an association.
    pub fn join(self, assoc: Association, target: impl Into<Source>) -> Query {
        self.push_join(JoinKind::Inner, Some(assoc), target.into())
    }

    /// Left outer equi-join along an association.
    pub fn left_join(self, assoc: Association, target: impl Into<Source>) -> Query {
        self.push_join(JoinKind::Left, Some(assoc), target.into())
    }

    /// Inner join with no association; the condition comes from `on`.
    pub fn join_unrelated(self, target: impl Into<Source>) -> Query {
        self.push_join(JoinKind::Inner, None, target.into())
    }

    /// Left outer join with no association; the condition comes from `on`.
    pub fn left_join_unrelated(self, target: impl Into<Source>) -> Query {
        self.push_join(JoinKind::Left, None, target.into())
    }

    /// Add a clause to the most recent join's condition.
    pub fn on(mut self, condition: Predicate) -> Query {
        match self.joins.last_mut() {
            Some(join) => {
                let current = std::mem::replace(&mut join.on, Predicate::True);
                join.on = current.and(condition);
            }
            None => self.issues.push("`on` without a preceding join".into()),
        }
        self
    }

    /// Mark the most recent join as eager.
    pub fn fetch_join(mut self) -> Query {
        match self.joins.last_mut() {
            Some(join) => join.fetch = true,
            None => self.issues.push("`fetch_join` without a preceding join".into()),
        }
        self
    }

    /// AND a clause into the post-join filter.
    pub fn filter(mut self, condition: Predicate) -> Query {
        let current = std::mem::replace(&mut self.predicate, Predicate::True);
        self.predicate = current.and(condition);
        self
    }

    /// AND every present clause into the filter; absent ones are skipped.
    pub fn filter_all<I>(self, conditions: I) -> Query
    where
        I: IntoIterator<Item = Option<Predicate>>,
    {
        self.filter(compose(conditions))
    }

    pub fn group_by<I: IntoIterator<Item = Expr>>(mut self, exprs: I) -> Query {
        self.group_by.extend(exprs);
        self
    }

    pub fn having(mut self, condition: Predicate) -> Query {
        let current = std::mem::replace(&mut self.having, Predicate::True);
        self.having = current.and(condition);
        self
    }

    pub fn order_by<I: IntoIterator<Item = OrderSpecifier>>(mut self, specs: I) -> Query {
        self.order_by.extend(specs);
        self
    }

    pub fn offset(mut self, offset: usize) -> Query {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Query {
        self.limit = Some(limit);
        self
    }

    /// Copy of this query without ordering or page window, for counting.
    pub fn unpaged(&self) -> Query {
        let mut q = self.clone();
        q.order_by.clear();
        q.offset = 0;
        q.limit = None;
        q
    }

    /// Whether rows collapse into groups (explicit grouping or aggregates).
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.selections.iter().any(|s| match s {
                Selection::Expr(e) => e.contains_aggregate(),
                Selection::Entity(_) => false,
            })
    }

    /// All sources in scope, root first then joins in order.
    pub fn sources(&self) -> Vec<Source> {
        std::iter::once(self.from)
            .chain(self.joins.iter().map(|j| j.target))
            .collect()
    }

    /// Number of columns each result row carries.
    pub fn width(&self) -> usize {
        self.selections.iter().map(Selection::width).sum()
    }

    /// Column labels in select-list order.
    pub fn labels(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.width());
        for sel in &self.selections {
            match sel {
                Selection::Entity(s) => {
                    out.extend(s.descriptor().fields.iter().map(|f| f.name.to_string()));
                }
                Selection::Expr(e) => out.push(e.label()),
            }
        }
        out
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.validate_in(&[])
    }

    fn validate_in(&self, outer: &[Source]) -> Result<(), CoreError> {
        if let Some(issue) = self.issues.first() {
            return Err(CoreError::InvalidQuery(issue.clone()));
        }
        if self.selections.is_empty() {
            return Err(CoreError::InvalidQuery("empty select list".into()));
        }
        let mut scope: Vec<Source> = outer.to_vec();
        for source in self.sources() {
            check_alias(source.alias)?;
            if scope.iter().any(|s| s.alias == source.alias) {
                return Err(CoreError::InvalidQuery(format!(
                    "alias `{}` is used twice",
                    source.alias
                )));
            }
            scope.push(source);
        }
        for sel in &self.selections {
            match sel {
                Selection::Entity(s) if !scope.contains(s) => {
                    return Err(CoreError::InvalidQuery(format!("`{}` is not in scope", s.alias)))
                }
                Selection::Entity(_) => {}
                Selection::Expr(e) => check_expr(e, &scope)?,
            }
        }
        for join in &self.joins {
            check_predicate(&join.condition(), &scope)?;
        }
        check_predicate(&self.predicate, &scope)?;
        if self.predicate.contains_aggregate() {
            return Err(CoreError::InvalidQuery(
                "aggregates belong in `having`, not in the filter".into(),
            ));
        }
        for e in &self.group_by {
            check_expr(e, &scope)?;
        }
        check_predicate(&self.having, &scope)?;
        if !self.having.is_true() && !self.is_aggregate() {
            return Err(CoreError::InvalidQuery(
                "`having` needs grouping or an aggregate in the select list".into(),
            ));
        }
        for spec in &self.order_by {
            check_expr(&spec.expr, &scope)?;
        }
        Ok(())
    }
}

fn check_alias(alias: &str) -> Result<(), CoreError> {
    let mut chars = alias.chars();
    let ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidQuery(format!("`{alias}` is not a valid alias")))
    }
}

/// Best-effort static kind of an expression; `None` when unknown (null
/// literals, subqueries, mixed case branches).
pub fn kind_of(expr: &Expr) -> Option<FieldKind> {
    use crate::expr::AggFn;
    match expr {
        Expr::Field(f) => Some(f.field.kind),
        Expr::Literal(v) => v.kind(),
        Expr::Arith { lhs, rhs, .. } => match (kind_of(lhs), kind_of(rhs)) {
            (Some(FieldKind::Real), _) | (_, Some(FieldKind::Real)) => Some(FieldKind::Real),
            _ => Some(FieldKind::Integer),
        },
        Expr::Concat(..) | Expr::Func { .. } => Some(FieldKind::Text),
        Expr::Case { otherwise, .. } => kind_of(otherwise),
        Expr::Agg { func, arg } => match func {
            AggFn::Count => Some(FieldKind::Integer),
            AggFn::Avg => Some(FieldKind::Real),
            _ => arg.as_deref().and_then(kind_of),
        },
        Expr::Subquery(q) => match q.selections.first() {
            Some(Selection::Expr(e)) => kind_of(e),
            _ => None,
        },
        Expr::Aliased { expr, .. } => kind_of(expr),
    }
}

fn require(expr: &Expr, class: OperatorClass, what: &str) -> Result<(), CoreError> {
    match kind_of(expr) {
        Some(kind) if !kind.supports(class) => Err(CoreError::InvalidQuery(format!(
            "{what} is not supported on {kind} expression `{expr}`"
        ))),
        _ => Ok(()),
    }
}

/// Text operands only meet text operands in a comparison.
fn require_comparable(lhs: &Expr, rhs: &Expr) -> Result<(), CoreError> {
    match (kind_of(lhs), kind_of(rhs)) {
        (Some(l), Some(r)) if (l == FieldKind::Text) != (r == FieldKind::Text) => {
            Err(CoreError::InvalidQuery(format!(
                "cannot compare {l} expression `{lhs}` with {r} expression `{rhs}`"
            )))
        }
        _ => Ok(()),
    }
}

fn check_expr(expr: &Expr, scope: &[Source]) -> Result<(), CoreError> {
    use crate::expr::AggFn;
    match expr {
        Expr::Field(f) => {
            if scope.contains(&f.source) {
                Ok(())
            } else {
                Err(CoreError::InvalidQuery(format!(
                    "`{}` is not in scope for `{f}`",
                    f.source.alias
                )))
            }
        }
        Expr::Literal(_) => Ok(()),
        Expr::Arith { lhs, rhs, .. } => {
            check_expr(lhs, scope)?;
            check_expr(rhs, scope)?;
            require(lhs, OperatorClass::Arithmetic, "arithmetic")?;
            require(rhs, OperatorClass::Arithmetic, "arithmetic")
        }
        Expr::Concat(lhs, rhs) => {
            check_expr(lhs, scope)?;
            check_expr(rhs, scope)
        }
        Expr::Func { args, .. } => args.iter().try_for_each(|a| check_expr(a, scope)),
        Expr::Case {
            branches,
            otherwise,
        } => {
            for (cond, result) in branches {
                check_predicate(cond, scope)?;
                check_expr(result, scope)?;
            }
            check_expr(otherwise, scope)
        }
        Expr::Agg { func, arg } => match arg {
            None => Ok(()),
            Some(arg) => {
                check_expr(arg, scope)?;
                if arg.contains_aggregate() {
                    return Err(CoreError::InvalidQuery(format!("nested aggregate in `{expr}`")));
                }
                match func {
                    AggFn::Sum | AggFn::Avg => require(arg, OperatorClass::Arithmetic, func.name()),
                    _ => Ok(()),
                }
            }
        },
        Expr::Subquery(q) => {
            q.validate_in(scope)?;
            if q.width() != 1 {
                return Err(CoreError::InvalidQuery(
                    "scalar subquery must select exactly one column".into(),
                ));
            }
            Ok(())
        }
        Expr::Aliased { expr, .. } => check_expr(expr, scope),
    }
}

fn check_predicate(pred: &Predicate, scope: &[Source]) -> Result<(), CoreError> {
    match pred {
        Predicate::True => Ok(()),
        Predicate::Compare { lhs, rhs, .. } => {
            check_expr(lhs, scope)?;
            check_expr(rhs, scope)?;
            require_comparable(lhs, rhs)
        }
        Predicate::Between { expr, low, high } => {
            check_expr(expr, scope)?;
            check_expr(low, scope)?;
            check_expr(high, scope)?;
            require_comparable(expr, low)?;
            require_comparable(expr, high)
        }
        Predicate::InList { expr, list } => {
            check_expr(expr, scope)?;
            list.iter().try_for_each(|e| {
                check_expr(e, scope)?;
                require_comparable(expr, e)
            })
        }
        Predicate::InQuery { expr, query } => {
            check_expr(expr, scope)?;
            query.validate_in(scope)?;
            if query.width() != 1 {
                return Err(CoreError::InvalidQuery(
                    "`in` subquery must select exactly one column".into(),
                ));
            }
            match query.selections.first() {
                Some(Selection::Expr(column)) => require_comparable(expr, column),
                _ => Ok(()),
            }
        }
        Predicate::IsNull { expr, .. } => check_expr(expr, scope),
        Predicate::Like { expr, .. } => {
            check_expr(expr, scope)?;
            require(expr, OperatorClass::Pattern, "like")
        }
        Predicate::And(items) | Predicate::Or(items) => {
            items.iter().try_for_each(|p| check_predicate(p, scope))
        }
        Predicate::Not(inner) => check_predicate(inner, scope),
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "select ")?;
        for (i, sel) in self.selections.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match sel {
                Selection::Entity(s) => write!(f, "{}", s.alias)?,
                Selection::Expr(e) => write!(f, "{e}")?,
            }
        }
        write!(f, " from {}", self.from)?;
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "inner join",
                JoinKind::Left => "left join",
            };
            let fetch = if join.fetch { " fetch" } else { "" };
            match join.key {
                Some((fk, _)) => write!(f, " {kind}{fetch} {fk} {}", join.target.alias)?,
                None => write!(f, " {kind}{fetch} {}", join.target)?,
            }
            if !join.on.is_true() {
                write!(f, " on {}", join.on)?;
            }
        }
        if !self.predicate.is_true() {
            write!(f, " where {}", self.predicate)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " group by ")?;
            for (i, e) in self.group_by.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{e}")?;
            }
        }
        if !self.having.is_true() {
            write!(f, " having {}", self.having)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " order by ")?;
            for (i, spec) in self.order_by.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{spec}")?;
            }
        }
        if self.offset > 0 {
            write!(f, " offset {}", self.offset)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

/// Bulk update: `update Member m set .. where ..`.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateClause {
    pub target: Source,
    pub assignments: Vec<(FieldRef, Expr)>,
    pub predicate: Predicate,
    issues: Vec<String>,
}

impl UpdateClause {
    pub fn new(target: impl Into<Source>) -> Self {
        Self {
            target: target.into(),
            assignments: Vec::new(),
            predicate: Predicate::True,
            issues: Vec::new(),
        }
    }

    /// Assign `value` to `field`. `field` must be a plain field expression of
    /// the target; anything else fails validation.
    pub fn set(mut self, field: Expr, value: impl Into<Expr>) -> Self {
        match field.unaliased() {
            Expr::Field(f) => self.assignments.push((*f, value.into())),
            other => self.issues.push(format!("`{other}` is not an assignable field")),
        }
        self
    }

    pub fn filter(mut self, condition: Predicate) -> Self {
        let current = std::mem::replace(&mut self.predicate, Predicate::True);
        self.predicate = current.and(condition);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(issue) = self.issues.first() {
            return Err(CoreError::InvalidQuery(issue.clone()));
        }
        check_alias(self.target.alias)?;
        if self.assignments.is_empty() {
            return Err(CoreError::InvalidQuery("update without assignments".into()));
        }
        let scope = [self.target];
        for (field, value) in &self.assignments {
            if field.source != self.target {
                return Err(CoreError::InvalidQuery(format!(
                    "`{field}` does not belong to the update target"
                )));
            }
            if field.field.kind == FieldKind::Id && field.field.references.is_none() {
                return Err(CoreError::InvalidQuery("identity cannot be updated".into()));
            }
            check_expr(value, &scope)?;
            if value.contains_aggregate() {
                return Err(CoreError::InvalidQuery(format!(
                    "aggregate in assignment to `{field}`"
                )));
            }
        }
        check_predicate(&self.predicate, &scope)
    }
}

impl Display for UpdateClause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "update {} set ", self.target)?;
        for (i, (field, value)) in self.assignments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field} = {value}")?;
        }
        if !self.predicate.is_true() {
            write!(f, " where {}", self.predicate)?;
        }
        Ok(())
    }
}

/// Bulk delete: `delete from Member m where ..`.
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteClause {
    pub target: Source,
    pub predicate: Predicate,
}

impl DeleteClause {
    pub fn new(target: impl Into<Source>) -> Self {
        Self {
            target: target.into(),
            predicate: Predicate::True,
        }
    }

    pub fn filter(mut self, condition: Predicate) -> Self {
        let current = std::mem::replace(&mut self.predicate, Predicate::True);
        self.predicate = current.and(condition);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        check_alias(self.target.alias)?;
        check_predicate(&self.predicate, &[self.target])
    }
}

impl Display for DeleteClause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "delete from {}", self.target)?;
        if !self.predicate.is_true() {
            write!(f, " where {}", self.predicate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{QMember, QTeam};
    use crate::value::Value;

    #[test]
    fn association_join_renders_key_and_extra_clause() {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select([Selection::from(&m), Selection::from(&t)])
            .from(&m)
            .left_join(m.team(), &t)
            .on(t.name().eq("teamA"));
        assert_eq!(
            q.to_string(),
            "select m, t from Member m left join m.team_id t on t.name = 'teamA'"
        );
        assert_eq!(
            q.joins[0].condition().to_string(),
            "m.team_id = t.id and t.name = 'teamA'"
        );
        q.validate().unwrap();
    }

    #[test]
    fn on_without_join_fails_validation() {
        let m = QMember::new("m");
        let q = Query::select_from(&m).on(m.age().eq(1));
        assert!(matches!(q.validate(), Err(CoreError::InvalidQuery(_))));
    }

    #[test]
    fn filter_all_skips_absent_clauses() {
        let m = QMember::new("m");
        let q = Query::select_from(&m).filter_all([None, Some(m.age().eq(10))]);
        assert_eq!(q.to_string(), "select m from Member m where m.age = 10");
        let all = Query::select_from(&m).filter_all([None, None]);
        assert!(all.predicate.is_true());
    }

    #[test]
    fn out_of_scope_alias_is_rejected() {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select_from(&m).filter(t.name().eq("teamA"));
        assert!(matches!(q.validate(), Err(CoreError::InvalidQuery(_))));
    }

    #[test]
    fn subquery_may_reference_outer_alias() {
        let m = QMember::new("m");
        let ms = QMember::new("ms");
        let sub = Query::select([ms.age().max()])
            .from(&ms)
            .filter(ms.team_id().eq(m.team_id()));
        let q = Query::select_from(&m).filter(m.age().eq(sub));
        q.validate().unwrap();
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let m = QMember::new("m");
        let other = QMember::new("m");
        let sub = Query::select([other.age().max()]).from(&other);
        let q = Query::select_from(&m).filter(m.age().eq(sub));
        assert!(q.validate().is_err());
    }

    #[test]
    fn like_on_number_is_rejected() {
        let m = QMember::new("m");
        let q = Query::select_from(&m).filter(m.age().like("1%"));
        assert!(q.validate().is_err());
        let ok = Query::select_from(&m).filter(m.age().string_value().like("1%"));
        ok.validate().unwrap();
    }

    #[test]
    fn aggregate_in_filter_is_rejected() {
        let m = QMember::new("m");
        let q = Query::select_from(&m).filter(m.age().avg().gt(10));
        assert!(q.validate().is_err());
    }

    #[test]
    fn labels_expand_entities() {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select([Selection::from(&m), t.name().into()])
            .from(&m)
            .join(m.team(), &t);
        assert_eq!(q.labels(), vec!["id", "username", "age", "team_id", "name"]);
        assert_eq!(q.width(), 5);
    }

    #[test]
    fn order_and_window_render() {
        let m = QMember::new("m");
        let q = Query::select_from(&m)
            .order_by([m.age().desc(), m.username().asc().nulls_last()])
            .offset(1)
            .limit(2);
        assert_eq!(
            q.to_string(),
            "select m from Member m order by m.age desc, m.username asc nulls last offset 1 limit 2"
        );
        let unpaged = q.unpaged();
        assert!(unpaged.order_by.is_empty());
        assert_eq!(unpaged.limit, None);
    }

    #[test]
    fn default_null_ordering_follows_direction() {
        let m = QMember::new("m");
        assert!(m.username().asc().nulls_lead());
        assert!(!m.username().desc().nulls_lead());
        assert!(!m.username().asc().nulls_last().nulls_lead());
    }

    #[test]
    fn update_clause_validation() {
        let m = QMember::new("m");
        let ok = UpdateClause::new(&m)
            .set(m.username(), "renamed")
            .filter(m.age().lt(28));
        ok.validate().unwrap();
        assert_eq!(
            ok.to_string(),
            "update Member m set m.username = 'renamed' where m.age < 28"
        );

        let id = UpdateClause::new(&m).set(m.id(), 5);
        assert!(id.validate().is_err());

        let t = QTeam::new("t");
        let foreign = UpdateClause::new(&m).set(t.name(), "x");
        assert!(foreign.validate().is_err());
    }

    #[test]
    fn having_requires_an_aggregate_query() {
        let m = QMember::new("m");
        let plain = Query::select([m.age()])
            .from(&m)
            .having(m.count().gt(10));
        assert!(matches!(plain.validate(), Err(CoreError::InvalidQuery(_))));

        let grouped = Query::select([m.age()])
            .from(&m)
            .group_by([m.age()])
            .having(m.count().gt(10));
        grouped.validate().unwrap();

        let totals = Query::select([m.count()])
            .from(&m)
            .having(m.count().gt(10));
        totals.validate().unwrap();
    }

    #[test]
    fn text_and_numbers_do_not_compare() {
        let m = QMember::new("m");
        let cases = [
            m.age().eq("10"),
            m.username().gt(10),
            m.id().ne("1"),
            m.age().between("10", 20),
            m.age().in_list([Value::from("10")]),
        ];
        for pred in cases {
            let q = Query::select_from(&m).filter(pred);
            assert!(
                matches!(q.validate(), Err(CoreError::InvalidQuery(_))),
                "{q} should be rejected"
            );
        }

        let ms = QMember::new("ms");
        let names = Query::select([ms.username()]).from(&ms);
        let q = Query::select_from(&m).filter(m.age().in_query(names));
        assert!(q.validate().is_err());

        let mixed = Query::select_from(&m)
            .filter(m.age().goe(10.5))
            .filter(m.age().string_value().eq("10"))
            .filter(m.username().eq(Value::Null));
        mixed.validate().unwrap();
    }

    #[test]
    fn delete_clause_renders() {
        let m = QMember::new("m");
        let d = DeleteClause::new(&m).filter(m.age().gt(18));
        d.validate().unwrap();
        assert_eq!(d.to_string(), "delete from Member m where m.age > 18");
    }
}
