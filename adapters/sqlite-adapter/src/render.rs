//! Render the domain query model to SQLite SQL.
//!
//! Identifiers are double-quoted, literals become positional `?N`
//! parameters and top-level select columns are labelled `c0`, `c1`, ... so
//! a select can be wrapped for counting without column name clashes.

use domain::expr::{AggFn, ScalarFn};
use domain::path::{FieldRef, Source};
use domain::query::{Direction, JoinKind, NullOrdering, Selection};
use domain::{DeleteClause, Expr, Predicate, Query, UpdateClause, Value};

/// SQL text plus its positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

pub fn select(query: &Query) -> Statement {
    let mut r = Renderer::default();
    r.select(query, true);
    r.finish()
}

/// `SELECT COUNT(*)` over the unpaged query.
pub fn count(query: &Query) -> Statement {
    let mut r = Renderer::default();
    r.push("SELECT COUNT(*) FROM (");
    r.select(&query.unpaged(), true);
    r.push(")");
    r.finish()
}

pub fn update(update: &UpdateClause) -> Statement {
    let mut r = Renderer::default();
    r.push("UPDATE ");
    r.source(&update.target);
    r.push(" SET ");
    for (i, (field, value)) in update.assignments.iter().enumerate() {
        if i > 0 {
            r.push(", ");
        }
        r.ident(field.field.column);
        r.push(" = ");
        r.expr(value);
    }
    r.filter(" WHERE ", &update.predicate);
    r.finish()
}

pub fn delete(delete: &DeleteClause) -> Statement {
    let mut r = Renderer::default();
    r.push("DELETE FROM ");
    r.source(&delete.target);
    r.filter(" WHERE ", &delete.predicate);
    r.finish()
}

#[derive(Default)]
struct Renderer {
    sql: String,
    params: Vec<Value>,
}

impl Renderer {
    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }

    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn ident(&mut self, name: &str) {
        self.sql.push('"');
        self.sql.push_str(&name.replace('"', "\"\""));
        self.sql.push('"');
    }

    fn param(&mut self, value: &Value) {
        if value.is_null() {
            self.push("NULL");
            return;
        }
        self.params.push(value.clone());
        let n = self.params.len();
        self.push(&format!("?{n}"));
    }

    fn source(&mut self, source: &Source) {
        self.ident(source.descriptor().table);
        self.push(" AS ");
        self.ident(source.alias);
    }

    fn field(&mut self, field: &FieldRef) {
        self.ident(field.source.alias);
        self.push(".");
        self.ident(field.field.column);
    }

    fn filter(&mut self, keyword: &str, predicate: &Predicate) {
        if !predicate.is_true() {
            self.push(keyword);
            self.predicate(predicate);
        }
    }

    fn select(&mut self, query: &Query, labelled: bool) {
        self.push("SELECT ");
        let mut col = 0;
        for sel in &query.selections {
            match sel {
                Selection::Entity(source) => {
                    for fd in source.descriptor().fields {
                        let field = FieldRef {
                            source: *source,
                            field: fd,
                        };
                        self.column(col, labelled, |r| r.field(&field));
                        col += 1;
                    }
                }
                Selection::Expr(e) => {
                    self.column(col, labelled, |r| r.expr(e));
                    col += 1;
                }
            }
        }
        self.push(" FROM ");
        self.source(&query.from);
        for join in &query.joins {
            self.push(match join.kind {
                JoinKind::Inner => " INNER JOIN ",
                JoinKind::Left => " LEFT JOIN ",
            });
            self.source(&join.target);
            self.push(" ON ");
            self.predicate(&join.condition());
        }
        self.filter(" WHERE ", &query.predicate);
        if !query.group_by.is_empty() {
            self.push(" GROUP BY ");
            self.list(&query.group_by);
        }
        self.filter(" HAVING ", &query.having);
        if !query.order_by.is_empty() {
            self.push(" ORDER BY ");
            for (i, spec) in query.order_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.expr(&spec.expr);
                self.push(match spec.direction {
                    Direction::Asc => " ASC",
                    Direction::Desc => " DESC",
                });
                self.push(match spec.nulls {
                    NullOrdering::Default => "",
                    NullOrdering::First => " NULLS FIRST",
                    NullOrdering::Last => " NULLS LAST",
                });
            }
        }
        match (query.limit, query.offset) {
            (Some(limit), 0) => self.push(&format!(" LIMIT {limit}")),
            (Some(limit), offset) => self.push(&format!(" LIMIT {limit} OFFSET {offset}")),
            (None, 0) => {}
            (None, offset) => self.push(&format!(" LIMIT -1 OFFSET {offset}")),
        }
    }

    fn column(&mut self, idx: usize, labelled: bool, body: impl FnOnce(&mut Self)) {
        if idx > 0 {
            self.push(", ");
        }
        body(self);
        if labelled {
            self.push(&format!(" AS c{idx}"));
        }
    }

    fn list(&mut self, exprs: &[Expr]) {
        for (i, e) in exprs.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(e);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Field(f) => self.field(f),
            Expr::Literal(v) => self.param(v),
            Expr::Arith { op, lhs, rhs } => {
                self.push("(");
                self.expr(lhs);
                self.push(&format!(" {} ", op.symbol()));
                self.expr(rhs);
                self.push(")");
            }
            Expr::Concat(lhs, rhs) => {
                self.push("(");
                self.expr(lhs);
                self.push(" || ");
                self.expr(rhs);
                self.push(")");
            }
            Expr::Func {
                func: ScalarFn::Str,
                args,
            } => {
                self.push("CAST(");
                self.list(args);
                self.push(" AS TEXT)");
            }
            Expr::Func { func, args } => {
                self.push(&func.name().to_ascii_uppercase());
                self.push("(");
                self.list(args);
                self.push(")");
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                self.push("CASE");
                for (cond, result) in branches {
                    self.push(" WHEN ");
                    self.predicate(cond);
                    self.push(" THEN ");
                    self.expr(result);
                }
                self.push(" ELSE ");
                self.expr(otherwise);
                self.push(" END");
            }
            Expr::Agg { func, arg } => {
                self.push(match func {
                    AggFn::Count => "COUNT(",
                    AggFn::Sum => "SUM(",
                    AggFn::Avg => "AVG(",
                    AggFn::Max => "MAX(",
                    AggFn::Min => "MIN(",
                });
                match arg {
                    Some(arg) => self.expr(arg),
                    None => self.push("*"),
                }
                self.push(")");
            }
            Expr::Subquery(q) => {
                self.push("(");
                self.select(q, false);
                self.push(")");
            }
            Expr::Aliased { expr, .. } => self.expr(expr),
        }
    }

    fn nested(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::And(_) | Predicate::Or(_) => {
                self.push("(");
                self.predicate(predicate);
                self.push(")");
            }
            other => self.predicate(other),
        }
    }

    fn predicate(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::True => self.push("1"),
            Predicate::Compare { lhs, op, rhs } => {
                self.expr(lhs);
                self.push(&format!(" {} ", op.symbol()));
                self.expr(rhs);
            }
            Predicate::Between { expr, low, high } => {
                self.expr(expr);
                self.push(" BETWEEN ");
                self.expr(low);
                self.push(" AND ");
                self.expr(high);
            }
            Predicate::InList { expr, list } => {
                self.expr(expr);
                self.push(" IN (");
                self.list(list);
                self.push(")");
            }
            Predicate::InQuery { expr, query } => {
                self.expr(expr);
                self.push(" IN (");
                self.select(query, false);
                self.push(")");
            }
            Predicate::IsNull { expr, negated } => {
                self.expr(expr);
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Predicate::Like { expr, pattern } => {
                self.expr(expr);
                self.push(" LIKE ");
                self.param(&Value::from(pattern.as_str()));
                self.push(" ESCAPE '\\'");
            }
            Predicate::And(items) | Predicate::Or(items) => {
                let sep = if matches!(predicate, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.push(sep);
                    }
                    self.nested(item);
                }
            }
            Predicate::Not(inner) => {
                self.push("NOT (");
                self.predicate(inner);
                self.push(")");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{QMember, QTeam};

    #[test]
    fn entity_select_expands_columns() {
        let m = QMember::new("m");
        let stmt = select(&Query::select_from(&m).filter(m.age().goe(20)));
        assert_eq!(
            stmt.sql,
            "SELECT \"m\".\"id\" AS c0, \"m\".\"username\" AS c1, \"m\".\"age\" AS c2, \"m\".\"team_id\" AS c3 \
             FROM \"member\" AS \"m\" WHERE \"m\".\"age\" >= ?1"
        );
        assert_eq!(stmt.params, vec![Value::Int(20)]);
    }

    #[test]
    fn association_join_carries_key_and_on_clause() {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select([m.username(), t.name()])
            .from(&m)
            .left_join(m.team(), &t)
            .on(t.name().eq("teamA"));
        let stmt = select(&q);
        assert!(stmt.sql.contains(
            "LEFT JOIN \"team\" AS \"t\" ON \"m\".\"team_id\" = \"t\".\"id\" AND \"t\".\"name\" = ?1"
        ));
        assert_eq!(stmt.params, vec![Value::from("teamA")]);
    }

    #[test]
    fn theta_join_without_condition() {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select([m.username()])
            .from(&m)
            .join_unrelated(&t)
            .filter(m.username().eq(t.name()));
        let stmt = select(&q);
        assert!(stmt.sql.contains("INNER JOIN \"team\" AS \"t\" ON 1 WHERE"));
    }

    #[test]
    fn offset_without_limit_uses_open_window() {
        let m = QMember::new("m");
        let q = Query::select([m.username()]).from(&m).offset(2);
        assert!(select(&q).sql.ends_with(" LIMIT -1 OFFSET 2"));
        let q = Query::select([m.username()]).from(&m).offset(1).limit(2);
        assert!(select(&q).sql.ends_with(" LIMIT 2 OFFSET 1"));
    }

    #[test]
    fn explicit_null_ordering() {
        let m = QMember::new("m");
        let q = Query::select([m.username()])
            .from(&m)
            .order_by([m.age().desc(), m.username().asc().nulls_last()]);
        assert!(select(&q)
            .sql
            .ends_with("ORDER BY \"m\".\"age\" DESC, \"m\".\"username\" ASC NULLS LAST"));
    }

    #[test]
    fn count_wraps_unpaged_select() {
        let m = QMember::new("m");
        let q = Query::select([m.username()])
            .from(&m)
            .order_by([m.age().asc()])
            .offset(1)
            .limit(1);
        let stmt = count(&q);
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) FROM (SELECT \"m\".\"username\" AS c0 FROM \"member\" AS \"m\")"
        );
    }

    #[test]
    fn like_escapes_with_backslash() {
        let m = QMember::new("m");
        let stmt = select(&Query::select([m.age()]).from(&m).filter(m.username().contains("1")));
        assert!(stmt.sql.ends_with("\"m\".\"username\" LIKE ?1 ESCAPE '\\'"));
        assert_eq!(stmt.params, vec![Value::from("%1%")]);
    }

    #[test]
    fn functions_and_concat() {
        let m = QMember::new("m");
        let q = Query::select([
            m.username().concat("_").concat(m.age().string_value()),
            m.username().replace("member", "M"),
            m.username().lower(),
        ])
        .from(&m);
        let sql = select(&q).sql;
        assert!(sql.contains("((\"m\".\"username\" || ?1) || CAST(\"m\".\"age\" AS TEXT)) AS c0"));
        assert!(sql.contains("REPLACE(\"m\".\"username\", ?2, ?3) AS c1"));
        assert!(sql.contains("LOWER(\"m\".\"username\") AS c2"));
    }

    #[test]
    fn subqueries_are_unlabelled() {
        let m = QMember::new("m");
        let sub = QMember::new("ms");
        let q = Query::select_from(&m).filter(m.age().eq(Query::select([sub.age().max()]).from(&sub)));
        let sql = select(&q).sql;
        assert!(sql.ends_with("WHERE \"m\".\"age\" = (SELECT MAX(\"ms\".\"age\") FROM \"member\" AS \"ms\")"));
    }

    #[test]
    fn null_literal_is_inlined() {
        let m = QMember::new("m");
        let stmt = update(&UpdateClause::new(&m).set(m.username(), Value::Null));
        assert_eq!(stmt.sql, "UPDATE \"member\" AS \"m\" SET \"username\" = NULL");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn bulk_statements() {
        let m = QMember::new("m");
        let upd = UpdateClause::new(&m)
            .set(m.age(), m.age().add(1))
            .filter(m.age().lt(28).or(m.username().is_null()));
        assert_eq!(
            update(&upd).sql,
            "UPDATE \"member\" AS \"m\" SET \"age\" = (\"m\".\"age\" + ?1) \
             WHERE \"m\".\"age\" < ?2 OR \"m\".\"username\" IS NULL"
        );
        let del = DeleteClause::new(&m).filter(m.age().gt(18));
        assert_eq!(
            delete(&del).sql,
            "DELETE FROM \"member\" AS \"m\" WHERE \"m\".\"age\" > ?1"
        );
    }

    #[test]
    fn grouped_select_with_having() {
        let m = QMember::new("m");
        let t = QTeam::new("t");
        let q = Query::select([t.name(), m.age().avg()])
            .from(&m)
            .join(m.team(), &t)
            .group_by([t.name()])
            .having(m.age().avg().gt(20))
            .order_by([t.name().asc()]);
        let sql = select(&q).sql;
        assert!(sql.contains(
            "GROUP BY \"t\".\"name\" HAVING AVG(\"m\".\"age\") > ?1 ORDER BY \"t\".\"name\" ASC"
        ));
    }
}
