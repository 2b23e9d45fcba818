//! Query evaluation over in-memory tables.
//!
//! Semantics follow SQLite, so the memory and SQLite stores agree on every
//! query the model can express: three-valued logic, nulls lowest in sort
//! order, integer arithmetic falling back to real on overflow, `avg` always
//! real, ASCII case-insensitive `like` with `\` as escape, groups emitted in
//! key order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::expr::{AggFn, ArithOp, CompareOp, Expr, Predicate, ScalarFn};
use crate::path::{FieldRef, Source};
use crate::projection::Tuple;
use crate::query::{Direction, JoinKind, OrderSpecifier, Query, Selection};
use crate::schema::EntityKind;
use crate::value::Value;
use crate::CoreError;

/// Rows per entity, keyed by identity.
pub(crate) type Tables = BTreeMap<EntityKind, BTreeMap<i64, Vec<Value>>>;

/// Alias bindings for one candidate row, chained to the enclosing query's
/// bindings for correlated subqueries. `None` is a null-extended outer join.
#[derive(Clone)]
struct Scope<'p, 'a> {
    bindings: Vec<(Source, Option<&'a [Value]>)>,
    parent: Option<&'p Scope<'p, 'a>>,
}

impl<'p, 'a> Scope<'p, 'a> {
    /// Every source of `query` bound to null; stands in for the empty
    /// implicit group of an aggregate over no rows.
    fn nulls(query: &Query, parent: Option<&'p Scope<'p, 'a>>) -> Self {
        Scope {
            bindings: query.sources().into_iter().map(|s| (s, None)).collect(),
            parent,
        }
    }

    fn binding(&self, source: &Source) -> Result<Option<&'a [Value]>, CoreError> {
        let mut scope = Some(self);
        while let Some(s) = scope {
            if let Some((_, row)) = s.bindings.iter().find(|(src, _)| src == source) {
                return Ok(*row);
            }
            scope = s.parent;
        }
        Err(CoreError::InvalidQuery(format!("`{}` is not bound", source.alias)))
    }

    fn lookup(&self, field: &FieldRef) -> Result<Value, CoreError> {
        let Some(row) = self.binding(&field.source)? else {
            return Ok(Value::Null);
        };
        let idx = field
            .source
            .descriptor()
            .index_of(field.field.name)
            .ok_or_else(|| CoreError::InvalidQuery(format!("unknown field `{field}`")))?;
        Ok(row.get(idx).cloned().unwrap_or(Value::Null))
    }

    fn entity(&self, source: &Source) -> Result<Vec<Value>, CoreError> {
        Ok(match self.binding(source)? {
            Some(row) => row.to_vec(),
            None => vec![Value::Null; source.descriptor().width()],
        })
    }
}

pub(crate) struct Evaluator<'a> {
    tables: &'a Tables,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(tables: &'a Tables) -> Self {
        Self { tables }
    }

    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &'a [Value]> + 'a {
        let tables: &'a Tables = self.tables;
        tables
            .get(&kind)
            .into_iter()
            .flat_map(|rows| rows.values().map(Vec::as_slice))
    }

    pub(crate) fn fetch(&self, query: &Query) -> Result<Vec<Tuple>, CoreError> {
        let labels = query.labels();
        self.run(query, None)?
            .into_iter()
            .map(|values| Tuple::new(labels.clone(), values))
            .collect()
    }

    pub(crate) fn count(&self, query: &Query) -> Result<u64, CoreError> {
        let rows = self.run(&query.unpaged(), None)?;
        Ok(rows.len() as u64)
    }

    /// Rows of `target` matching `predicate`, as `(id, row)` pairs.
    pub(crate) fn matching(
        &self,
        target: Source,
        predicate: &Predicate,
    ) -> Result<Vec<(i64, &'a [Value])>, CoreError> {
        let mut out = Vec::new();
        for row in self.table(target.entity) {
            let scope = Scope {
                bindings: vec![(target, Some(row))],
                parent: None,
            };
            if self.predicate(predicate, &scope, None)? == Some(true) {
                let id = row
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| CoreError::Repository("row without identity".into()))?;
                out.push((id, row));
            }
        }
        Ok(out)
    }

    /// Evaluate assignments against the current values of `row`.
    pub(crate) fn assign(
        &self,
        target: Source,
        row: &'a [Value],
        assignments: &[(FieldRef, Expr)],
    ) -> Result<Vec<Value>, CoreError> {
        let scope = Scope {
            bindings: vec![(target, Some(row))],
            parent: None,
        };
        let mut updated = row.to_vec();
        for (field, value) in assignments {
            let idx = target
                .descriptor()
                .index_of(field.field.name)
                .ok_or_else(|| CoreError::InvalidQuery(format!("unknown field `{field}`")))?;
            updated[idx] = self.expr(value, &scope, None)?;
        }
        Ok(updated)
    }

    fn run(
        &self,
        query: &Query,
        parent: Option<&Scope<'_, 'a>>,
    ) -> Result<Vec<Vec<Value>>, CoreError> {
        let mut kept = Vec::new();
        for scope in self.product(query, parent)? {
            if self.predicate(&query.predicate, &scope, None)? == Some(true) {
                kept.push(scope);
            }
        }

        let mut rows: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
        if query.is_aggregate() {
            for members in self.groups(query, kept)? {
                let rep = match members.first() {
                    Some(first) => first.clone(),
                    None => Scope::nulls(query, parent),
                };
                let group = Some(members.as_slice());
                if self.predicate(&query.having, &rep, group)? != Some(true) {
                    continue;
                }
                let keys = self.order_keys(&query.order_by, &rep, group)?;
                rows.push((keys, self.select(query, &rep, group)?));
            }
        } else {
            for scope in &kept {
                let keys = self.order_keys(&query.order_by, scope, None)?;
                rows.push((keys, self.select(query, scope, None)?));
            }
        }

        if !query.order_by.is_empty() {
            rows.sort_by(|a, b| compare_keys(&query.order_by, &a.0, &b.0));
        }
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(_, row)| row)
            .collect())
    }

    fn product<'p>(
        &self,
        query: &Query,
        parent: Option<&'p Scope<'p, 'a>>,
    ) -> Result<Vec<Scope<'p, 'a>>, CoreError> {
        let mut scopes: Vec<Scope<'p, 'a>> = self
            .table(query.from.entity)
            .map(|row| Scope {
                bindings: vec![(query.from, Some(row))],
                parent,
            })
            .collect();
        for join in &query.joins {
            let condition = join.condition();
            let mut next = Vec::with_capacity(scopes.len());
            for scope in scopes {
                let mut matched = false;
                for row in self.table(join.target.entity) {
                    let mut candidate = scope.clone();
                    candidate.bindings.push((join.target, Some(row)));
                    if self.predicate(&condition, &candidate, None)? == Some(true) {
                        matched = true;
                        next.push(candidate);
                    }
                }
                if !matched && join.kind == JoinKind::Left {
                    let mut candidate = scope;
                    candidate.bindings.push((join.target, None));
                    next.push(candidate);
                }
            }
            scopes = next;
        }
        Ok(scopes)
    }

    /// Partition rows by the grouping key, groups sorted by key. Without
    /// grouping expressions the whole input is one group, even when empty.
    fn groups<'p>(
        &self,
        query: &Query,
        rows: Vec<Scope<'p, 'a>>,
    ) -> Result<Vec<Vec<Scope<'p, 'a>>>, CoreError> {
        if query.group_by.is_empty() {
            return Ok(vec![rows]);
        }
        let mut groups: Vec<(Vec<Value>, Vec<Scope<'p, 'a>>)> = Vec::new();
        for scope in rows {
            let key = query
                .group_by
                .iter()
                .map(|e| self.expr(e, &scope, None))
                .collect::<Result<Vec<_>, _>>()?;
            match groups
                .iter_mut()
                .find(|(k, _)| cmp_values(k, &key) == Ordering::Equal)
            {
                Some((_, members)) => members.push(scope),
                None => groups.push((key, vec![scope])),
            }
        }
        groups.sort_by(|a, b| cmp_values(&a.0, &b.0));
        Ok(groups.into_iter().map(|(_, members)| members).collect())
    }

    fn select(
        &self,
        query: &Query,
        scope: &Scope<'_, 'a>,
        group: Option<&[Scope<'_, 'a>]>,
    ) -> Result<Vec<Value>, CoreError> {
        let mut out = Vec::with_capacity(query.width());
        for sel in &query.selections {
            match sel {
                Selection::Entity(source) => out.extend(scope.entity(source)?),
                Selection::Expr(e) => out.push(self.expr(e, scope, group)?),
            }
        }
        Ok(out)
    }

    fn order_keys(
        &self,
        specs: &[OrderSpecifier],
        scope: &Scope<'_, 'a>,
        group: Option<&[Scope<'_, 'a>]>,
    ) -> Result<Vec<Value>, CoreError> {
        specs
            .iter()
            .map(|spec| self.expr(&spec.expr, scope, group))
            .collect()
    }

    fn expr(
        &self,
        expr: &Expr,
        scope: &Scope<'_, 'a>,
        group: Option<&[Scope<'_, 'a>]>,
    ) -> Result<Value, CoreError> {
        match expr {
            Expr::Field(field) => scope.lookup(field),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Arith { op, lhs, rhs } => {
                let l = self.expr(lhs, scope, group)?;
                let r = self.expr(rhs, scope, group)?;
                Ok(arith(*op, &l, &r))
            }
            Expr::Concat(lhs, rhs) => {
                let l = self.expr(lhs, scope, group)?;
                let r = self.expr(rhs, scope, group)?;
                Ok(match (l.to_text(), r.to_text()) {
                    (Some(a), Some(b)) => Value::Text(a + &b),
                    _ => Value::Null,
                })
            }
            Expr::Func { func, args } => {
                let args = args
                    .iter()
                    .map(|a| self.expr(a, scope, group))
                    .collect::<Result<Vec<_>, _>>()?;
                scalar(*func, &args)
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                for (cond, result) in branches {
                    if self.predicate(cond, scope, group)? == Some(true) {
                        return self.expr(result, scope, group);
                    }
                }
                self.expr(otherwise, scope, group)
            }
            Expr::Agg { func, arg } => {
                let rows = group.ok_or_else(|| {
                    CoreError::InvalidQuery(format!("aggregate `{expr}` outside a grouped query"))
                })?;
                let mut values = Vec::with_capacity(rows.len());
                if let Some(arg) = arg {
                    for row in rows {
                        let v = self.expr(arg, row, None)?;
                        if !v.is_null() {
                            values.push(v);
                        }
                    }
                }
                Ok(aggregate(*func, arg.is_none(), rows.len(), values))
            }
            Expr::Subquery(q) => {
                let rows = self.run(q, Some(scope))?;
                Ok(rows
                    .into_iter()
                    .next()
                    .and_then(|r| r.into_iter().next())
                    .unwrap_or(Value::Null))
            }
            Expr::Aliased { expr, .. } => self.expr(expr, scope, group),
        }
    }

    fn predicate(
        &self,
        pred: &Predicate,
        scope: &Scope<'_, 'a>,
        group: Option<&[Scope<'_, 'a>]>,
    ) -> Result<Option<bool>, CoreError> {
        Ok(match pred {
            Predicate::True => Some(true),
            Predicate::Compare { lhs, op, rhs } => {
                let l = self.expr(lhs, scope, group)?;
                let r = self.expr(rhs, scope, group)?;
                compare(*op, &l, &r)
            }
            Predicate::Between { expr, low, high } => {
                let v = self.expr(expr, scope, group)?;
                let lo = self.expr(low, scope, group)?;
                let hi = self.expr(high, scope, group)?;
                and3(compare(CompareOp::Ge, &v, &lo), compare(CompareOp::Le, &v, &hi))
            }
            Predicate::InList { expr, list } => {
                let v = self.expr(expr, scope, group)?;
                let candidates = list
                    .iter()
                    .map(|e| self.expr(e, scope, group))
                    .collect::<Result<Vec<_>, _>>()?;
                membership(&v, candidates)
            }
            Predicate::InQuery { expr, query } => {
                let v = self.expr(expr, scope, group)?;
                let rows = self.run(query, Some(scope))?;
                membership(&v, rows.into_iter().filter_map(|r| r.into_iter().next()))
            }
            Predicate::IsNull { expr, negated } => {
                let v = self.expr(expr, scope, group)?;
                Some(v.is_null() != *negated)
            }
            Predicate::Like { expr, pattern } => {
                let v = self.expr(expr, scope, group)?;
                v.to_text().map(|text| like_matches(pattern, &text))
            }
            Predicate::And(items) => {
                let mut acc = Some(true);
                for item in items {
                    acc = and3(acc, self.predicate(item, scope, group)?);
                    if acc == Some(false) {
                        break;
                    }
                }
                acc
            }
            Predicate::Or(items) => {
                let mut acc = Some(false);
                for item in items {
                    acc = or3(acc, self.predicate(item, scope, group)?);
                    if acc == Some(true) {
                        break;
                    }
                }
                acc
            }
            Predicate::Not(inner) => self.predicate(inner, scope, group)?.map(|b| !b),
        })
    }
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Option<bool> {
    let o = l.sql_cmp(r)?;
    Some(match op {
        CompareOp::Eq => o == Ordering::Equal,
        CompareOp::Ne => o != Ordering::Equal,
        CompareOp::Lt => o == Ordering::Less,
        CompareOp::Le => o != Ordering::Greater,
        CompareOp::Gt => o == Ordering::Greater,
        CompareOp::Ge => o != Ordering::Less,
    })
}

/// `v in (candidates)`: unknown when `v` is null, or when nothing matched
/// and some candidate was null.
fn membership<I: IntoIterator<Item = Value>>(v: &Value, candidates: I) -> Option<bool> {
    if v.is_null() {
        return None;
    }
    let mut saw_null = false;
    for c in candidates {
        match v.sql_cmp(&c) {
            Some(Ordering::Equal) => return Some(true),
            None => saw_null = true,
            Some(_) => {}
        }
    }
    if saw_null {
        None
    } else {
        Some(false)
    }
}

fn cmp_values(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.sort_cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn compare_keys(specs: &[OrderSpecifier], a: &[Value], b: &[Value]) -> Ordering {
    for (spec, (x, y)) in specs.iter().zip(a.iter().zip(b)) {
        let lead = spec.nulls_lead();
        let o = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if lead => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if lead => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match spec.direction {
                Direction::Asc => x.sort_cmp(y),
                Direction::Desc => x.sort_cmp(y).reverse(),
            },
        };
        if o != Ordering::Equal {
            return o;
        }
    }
    Ordering::Equal
}

/// Numeric reading of a value; text that does not parse reads as zero.
fn numeric(v: &Value) -> Value {
    match v {
        Value::Text(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(Value::Int)
                .or_else(|_| s.parse::<f64>().map(Value::Real))
                .unwrap_or(Value::Int(0))
        }
        other => other.clone(),
    }
}

fn arith(op: ArithOp, l: &Value, r: &Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    let (l, r) = (numeric(l), numeric(r));
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let exact = match op {
            ArithOp::Add => a.checked_add(*b),
            ArithOp::Sub => a.checked_sub(*b),
            ArithOp::Mul => a.checked_mul(*b),
        };
        if let Some(v) = exact {
            return Value::Int(v);
        }
    }
    let (a, b) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
    Value::Real(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
    })
}

fn scalar(func: ScalarFn, args: &[Value]) -> Result<Value, CoreError> {
    let arity = if func == ScalarFn::Replace { 3 } else { 1 };
    if args.len() != arity {
        return Err(CoreError::InvalidQuery(format!(
            "{} takes {arity} arguments, got {}",
            func.name(),
            args.len()
        )));
    }
    let texts: Vec<Option<String>> = args.iter().map(Value::to_text).collect();
    Ok(match (func, texts.as_slice()) {
        (_, t) if t.iter().any(Option::is_none) => Value::Null,
        (ScalarFn::Lower, [Some(s)]) => Value::Text(s.to_ascii_lowercase()),
        (ScalarFn::Upper, [Some(s)]) => Value::Text(s.to_ascii_uppercase()),
        (ScalarFn::Str, [Some(s)]) => Value::Text(s.clone()),
        (ScalarFn::Replace, [Some(s), Some(from), Some(to)]) => {
            if from.is_empty() {
                Value::Text(s.clone())
            } else {
                Value::Text(s.replace(from.as_str(), to))
            }
        }
        _ => Value::Null,
    })
}

fn aggregate(func: AggFn, star: bool, rows: usize, values: Vec<Value>) -> Value {
    match func {
        AggFn::Count => {
            let n = if star { rows } else { values.len() };
            Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
        }
        AggFn::Sum => {
            if values.is_empty() {
                return Value::Null;
            }
            let nums: Vec<Value> = values.iter().map(numeric).collect();
            let mut exact = Some(0i64);
            for v in &nums {
                exact = match (exact, v) {
                    (Some(acc), Value::Int(i)) => acc.checked_add(*i),
                    _ => None,
                };
            }
            match exact {
                Some(total) => Value::Int(total),
                None => Value::Real(nums.iter().filter_map(Value::as_f64).sum()),
            }
        }
        AggFn::Avg => {
            if values.is_empty() {
                return Value::Null;
            }
            let total: f64 = values.iter().map(numeric).filter_map(|v| v.as_f64()).sum();
            Value::Real(total / values.len() as f64)
        }
        AggFn::Max => values
            .into_iter()
            .max_by(Value::sort_cmp)
            .unwrap_or(Value::Null),
        AggFn::Min => values
            .into_iter()
            .min_by(Value::sort_cmp)
            .unwrap_or(Value::Null),
    }
}

/// SQL `like` with `%`, `_` and `\` as escape; ASCII letters match
/// case-insensitively.
pub(crate) fn like_matches(pattern: &str, text: &str) -> bool {
    enum Tok {
        Many,
        One,
        Lit(char),
    }
    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        toks.push(match c {
            '\\' => Tok::Lit(chars.next().unwrap_or('\\')),
            '%' => Tok::Many,
            '_' => Tok::One,
            c => Tok::Lit(c),
        });
    }
    let text: Vec<char> = text.chars().collect();
    let n = text.len();
    let mut reach = vec![false; n + 1];
    reach[0] = true;
    for tok in &toks {
        let mut next = vec![false; n + 1];
        match tok {
            Tok::Many => {
                let mut seen = false;
                for i in 0..=n {
                    seen |= reach[i];
                    next[i] = seen;
                }
            }
            Tok::One => {
                for i in 1..=n {
                    next[i] = reach[i - 1];
                }
            }
            Tok::Lit(c) => {
                for i in 1..=n {
                    next[i] = reach[i - 1] && text[i - 1].eq_ignore_ascii_case(c);
                }
            }
        }
        reach = next;
    }
    reach[n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_and_escape() {
        assert!(like_matches("member%", "member1"));
        assert!(like_matches("MEM_ER1", "member1"));
        assert!(!like_matches("member_", "member10"));
        assert!(like_matches("50\\%", "50%"));
        assert!(!like_matches("50\\%", "500"));
        assert!(like_matches("%", ""));
    }

    #[test]
    fn kleene_logic() {
        assert_eq!(and3(None, Some(false)), Some(false));
        assert_eq!(and3(None, Some(true)), None);
        assert_eq!(or3(None, Some(true)), Some(true));
        assert_eq!(or3(None, Some(false)), None);
    }

    #[test]
    fn in_list_with_null_candidate_is_unknown() {
        assert_eq!(membership(&Value::Int(1), vec![Value::Int(2), Value::Null]), None);
        assert_eq!(membership(&Value::Int(2), vec![Value::Int(2), Value::Null]), Some(true));
        assert_eq!(membership(&Value::Int(3), vec![Value::Int(2)]), Some(false));
    }

    #[test]
    fn integer_arithmetic_overflows_to_real() {
        assert_eq!(arith(ArithOp::Add, &Value::Int(1), &Value::Int(2)), Value::Int(3));
        assert!(matches!(
            arith(ArithOp::Add, &Value::Int(i64::MAX), &Value::Int(1)),
            Value::Real(_)
        ));
        assert_eq!(arith(ArithOp::Mul, &Value::Int(2), &Value::Null), Value::Null);
    }

    #[test]
    fn aggregates_over_values() {
        let vals = vec![Value::Int(10), Value::Int(20)];
        assert_eq!(aggregate(AggFn::Sum, false, 2, vals.clone()), Value::Int(30));
        assert_eq!(aggregate(AggFn::Avg, false, 2, vals.clone()), Value::Real(15.0));
        assert_eq!(aggregate(AggFn::Max, false, 2, vals.clone()), Value::Int(20));
        assert_eq!(aggregate(AggFn::Count, true, 3, vals), Value::Int(3));
        assert_eq!(aggregate(AggFn::Sum, false, 0, Vec::new()), Value::Null);
    }

    #[test]
    fn replace_with_empty_needle_is_identity() {
        let out = scalar(
            ScalarFn::Replace,
            &[Value::from("member1"), Value::from(""), Value::from("x")],
        )
        .unwrap();
        assert_eq!(out, Value::from("member1"));
    }
}
