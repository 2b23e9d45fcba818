//! Expression and predicate model.
//!
//! Expressions are plain data: building one never touches a store. Every
//! node renders to a deterministic, JPQL-like text through `Display`, which
//! is what tests and logs compare against.

use std::fmt::{self, Display, Formatter};

use crate::path::FieldRef;
use crate::query::{OrderSpecifier, Query};
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarFn {
    Lower,
    Upper,
    /// `replace(text, from, to)`
    Replace,
    /// Cast to text.
    Str,
}

impl ScalarFn {
    pub fn name(self) -> &'static str {
        match self {
            ScalarFn::Lower => "lower",
            ScalarFn::Upper => "upper",
            ScalarFn::Replace => "replace",
            ScalarFn::Str => "str",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFn {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggFn {
    pub fn name(self) -> &'static str {
        match self {
            AggFn::Count => "count",
            AggFn::Sum => "sum",
            AggFn::Avg => "avg",
            AggFn::Max => "max",
            AggFn::Min => "min",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Field(FieldRef),
    Literal(Value),
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Concat(Box<Expr>, Box<Expr>),
    Func {
        func: ScalarFn,
        args: Vec<Expr>,
    },
    /// Searched case; simple cases are lowered to equality branches.
    Case {
        branches: Vec<(Predicate, Expr)>,
        otherwise: Box<Expr>,
    },
    /// `arg: None` is `count(*)`.
    Agg {
        func: AggFn,
        arg: Option<Box<Expr>>,
    },
    /// Scalar subquery: first column of the first row, null when empty.
    Subquery(Box<Query>),
    /// Expression with an explicit label for named projections.
    Aliased {
        expr: Box<Expr>,
        alias: &'static str,
    },
}

impl Expr {
    pub fn literal<V: Into<Value>>(v: V) -> Self {
        Expr::Literal(v.into())
    }

    pub fn count_all() -> Self {
        Expr::Agg {
            func: AggFn::Count,
            arg: None,
        }
    }

    /// Strip any alias wrapper.
    pub fn unaliased(&self) -> &Expr {
        match self {
            Expr::Aliased { expr, .. } => expr.unaliased(),
            other => other,
        }
    }

    /// Label used for tuple columns and named projections.
    pub fn label(&self) -> String {
        match self {
            Expr::Aliased { alias, .. } => (*alias).to_string(),
            Expr::Field(f) => f.field.name.to_string(),
            other => other.to_string(),
        }
    }

    /// Whether an aggregate appears outside any subquery.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Agg { .. } => true,
            Expr::Field(_) | Expr::Literal(_) | Expr::Subquery(_) => false,
            Expr::Arith { lhs, rhs, .. } | Expr::Concat(lhs, rhs) => {
                lhs.contains_aggregate() || rhs.contains_aggregate()
            }
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
            Expr::Case {
                branches,
                otherwise,
            } => {
                otherwise.contains_aggregate()
                    || branches
                        .iter()
                        .any(|(p, e)| p.contains_aggregate() || e.contains_aggregate())
            }
            Expr::Aliased { expr, .. } => expr.contains_aggregate(),
        }
    }

    fn compare(self, op: CompareOp, rhs: impl Into<Expr>) -> Predicate {
        Predicate::Compare {
            lhs: self,
            op,
            rhs: rhs.into(),
        }
    }

    pub fn eq(self, rhs: impl Into<Expr>) -> Predicate {
        self.compare(CompareOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<Expr>) -> Predicate {
        self.compare(CompareOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Predicate {
        self.compare(CompareOp::Lt, rhs)
    }

    pub fn loe(self, rhs: impl Into<Expr>) -> Predicate {
        self.compare(CompareOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Predicate {
        self.compare(CompareOp::Gt, rhs)
    }

    pub fn goe(self, rhs: impl Into<Expr>) -> Predicate {
        self.compare(CompareOp::Ge, rhs)
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Predicate {
        Predicate::Between {
            expr: self,
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn in_list<I, V>(self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Predicate::InList {
            expr: self,
            list: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn in_query(self, query: Query) -> Predicate {
        Predicate::InQuery {
            expr: self,
            query: Box::new(query),
        }
    }

    pub fn is_null(self) -> Predicate {
        Predicate::IsNull {
            expr: self,
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Predicate {
        Predicate::IsNull {
            expr: self,
            negated: true,
        }
    }

    /// Raw pattern: `%` and `_` are wildcards, `\` escapes.
    pub fn like(self, pattern: impl Into<String>) -> Predicate {
        Predicate::Like {
            expr: self,
            pattern: pattern.into(),
        }
    }

    pub fn contains(self, needle: &str) -> Predicate {
        self.like(format!("%{}%", escape_like(needle)))
    }

    pub fn starts_with(self, prefix: &str) -> Predicate {
        self.like(format!("{}%", escape_like(prefix)))
    }

    fn arith(self, op: ArithOp, rhs: impl Into<Expr>) -> Expr {
        Expr::Arith {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs.into()),
        }
    }

    pub fn add(self, rhs: impl Into<Expr>) -> Expr {
        self.arith(ArithOp::Add, rhs)
    }

    pub fn subtract(self, rhs: impl Into<Expr>) -> Expr {
        self.arith(ArithOp::Sub, rhs)
    }

    pub fn multiply(self, rhs: impl Into<Expr>) -> Expr {
        self.arith(ArithOp::Mul, rhs)
    }

    pub fn concat(self, rhs: impl Into<Expr>) -> Expr {
        Expr::Concat(Box::new(self), Box::new(rhs.into()))
    }

    pub fn lower(self) -> Expr {
        Expr::Func {
            func: ScalarFn::Lower,
            args: vec![self],
        }
    }

    pub fn upper(self) -> Expr {
        Expr::Func {
            func: ScalarFn::Upper,
            args: vec![self],
        }
    }

    pub fn replace(self, from: impl Into<Expr>, to: impl Into<Expr>) -> Expr {
        Expr::Func {
            func: ScalarFn::Replace,
            args: vec![self, from.into(), to.into()],
        }
    }

    pub fn string_value(self) -> Expr {
        Expr::Func {
            func: ScalarFn::Str,
            args: vec![self],
        }
    }

    fn agg(self, func: AggFn) -> Expr {
        Expr::Agg {
            func,
            arg: Some(Box::new(self)),
        }
    }

    pub fn count(self) -> Expr {
        self.agg(AggFn::Count)
    }

    pub fn sum(self) -> Expr {
        self.agg(AggFn::Sum)
    }

    pub fn avg(self) -> Expr {
        self.agg(AggFn::Avg)
    }

    pub fn max(self) -> Expr {
        self.agg(AggFn::Max)
    }

    pub fn min(self) -> Expr {
        self.agg(AggFn::Min)
    }

    pub fn as_(self, alias: &'static str) -> Expr {
        Expr::Aliased {
            expr: Box::new(self),
            alias,
        }
    }

    pub fn asc(self) -> OrderSpecifier {
        OrderSpecifier::asc(self)
    }

    pub fn desc(self) -> OrderSpecifier {
        OrderSpecifier::desc(self)
    }

    /// Start a simple case over this expression.
    pub fn when(self, value: impl Into<Expr>) -> SimpleCaseWhen {
        SimpleCaseWhen {
            case: SimpleCase {
                operand: self,
                branches: Vec::new(),
            },
            value: value.into(),
        }
    }
}

/// Escape `%`, `_` and `\` for use inside a like pattern.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Literal(v.into())
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Literal(v.into())
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Literal(v.into())
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Expr::Literal(v.into())
    }
}

impl From<String> for Expr {
    fn from(v: String) -> Self {
        Expr::Literal(v.into())
    }
}

impl From<FieldRef> for Expr {
    fn from(f: FieldRef) -> Self {
        Expr::Field(f)
    }
}

impl From<Query> for Expr {
    fn from(q: Query) -> Self {
        Expr::Subquery(Box::new(q))
    }
}

/// `expr.when(v)` awaiting its `then`.
#[derive(Clone, Debug)]
pub struct SimpleCaseWhen {
    case: SimpleCase,
    value: Expr,
}

impl SimpleCaseWhen {
    pub fn then(mut self, result: impl Into<Expr>) -> SimpleCase {
        let cond = self.case.operand.clone().eq(self.value);
        self.case.branches.push((cond, result.into()));
        self.case
    }
}

#[derive(Clone, Debug)]
pub struct SimpleCase {
    operand: Expr,
    branches: Vec<(Predicate, Expr)>,
}

impl SimpleCase {
    pub fn when(self, value: impl Into<Expr>) -> SimpleCaseWhen {
        SimpleCaseWhen {
            case: self,
            value: value.into(),
        }
    }

    pub fn otherwise(self, fallback: impl Into<Expr>) -> Expr {
        Expr::Case {
            branches: self.branches,
            otherwise: Box::new(fallback.into()),
        }
    }
}

/// Searched case: `CaseBuilder::new().when(p).then(x).otherwise(y)`.
#[derive(Clone, Debug, Default)]
pub struct CaseBuilder {
    branches: Vec<(Predicate, Expr)>,
}

impl CaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(self, condition: Predicate) -> CaseWhen {
        CaseWhen {
            builder: self,
            condition,
        }
    }

    pub fn otherwise(self, fallback: impl Into<Expr>) -> Expr {
        Expr::Case {
            branches: self.branches,
            otherwise: Box::new(fallback.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaseWhen {
    builder: CaseBuilder,
    condition: Predicate,
}

impl CaseWhen {
    pub fn then(mut self, result: impl Into<Expr>) -> CaseBuilder {
        self.builder.branches.push((self.condition, result.into()));
        self.builder
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    True,
    Compare {
        lhs: Expr,
        op: CompareOp,
        rhs: Expr,
    },
    Between {
        expr: Expr,
        low: Expr,
        high: Expr,
    },
    InList {
        expr: Expr,
        list: Vec<Expr>,
    },
    InQuery {
        expr: Expr,
        query: Box<Query>,
    },
    IsNull {
        expr: Expr,
        negated: bool,
    },
    Like {
        expr: Expr,
        pattern: String,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Conjunction keeping operand order; `True` operands vanish and nested
    /// conjunctions are flattened.
    pub fn all<I: IntoIterator<Item = Predicate>>(items: I) -> Predicate {
        let mut parts = Vec::new();
        for p in items {
            match p {
                Predicate::True => {}
                Predicate::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Predicate::True,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }

    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::all([self, other])
    }

    /// `True or x` is `True`.
    pub fn or(self, other: Predicate) -> Predicate {
        if self.is_true() || other.is_true() {
            return Predicate::True;
        }
        let mut parts = Vec::new();
        for p in [self, other] {
            match p {
                Predicate::Or(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        Predicate::Or(parts)
    }

    pub fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            Predicate::True | Predicate::InQuery { .. } => false,
            Predicate::Compare { lhs, rhs, .. } => {
                lhs.contains_aggregate() || rhs.contains_aggregate()
            }
            Predicate::Between { expr, low, high } => {
                expr.contains_aggregate() || low.contains_aggregate() || high.contains_aggregate()
            }
            Predicate::InList { expr, list } => {
                expr.contains_aggregate() || list.iter().any(Expr::contains_aggregate)
            }
            Predicate::IsNull { expr, .. } | Predicate::Like { expr, .. } => {
                expr.contains_aggregate()
            }
            Predicate::And(items) | Predicate::Or(items) => {
                items.iter().any(Predicate::contains_aggregate)
            }
            Predicate::Not(inner) => inner.contains_aggregate(),
        }
    }
}

fn write_list<T: Display>(f: &mut Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(field) => write!(f, "{field}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Arith { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Concat(lhs, rhs) => write!(f, "concat({lhs}, {rhs})"),
            Expr::Func { func, args } => {
                write!(f, "{}(", func.name())?;
                write_list(f, args, ", ")?;
                write!(f, ")")
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                write!(f, "case")?;
                for (cond, result) in branches {
                    write!(f, " when {cond} then {result}")?;
                }
                write!(f, " else {otherwise} end")
            }
            Expr::Agg { func, arg: None } => write!(f, "{}(*)", func.name()),
            Expr::Agg {
                func,
                arg: Some(arg),
            } => write!(f, "{}({arg})", func.name()),
            Expr::Subquery(q) => write!(f, "({q})"),
            Expr::Aliased { expr, .. } => write!(f, "{expr}"),
        }
    }
}

fn write_nested(f: &mut Formatter<'_>, p: &Predicate) -> fmt::Result {
    match p {
        Predicate::And(_) | Predicate::Or(_) => write!(f, "({p})"),
        other => write!(f, "{other}"),
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => write!(f, "true"),
            Predicate::Compare { lhs, op, rhs } => write!(f, "{lhs} {} {rhs}", op.symbol()),
            Predicate::Between { expr, low, high } => {
                write!(f, "{expr} between {low} and {high}")
            }
            Predicate::InList { expr, list } => {
                write!(f, "{expr} in (")?;
                write_list(f, list, ", ")?;
                write!(f, ")")
            }
            Predicate::InQuery { expr, query } => write!(f, "{expr} in ({query})"),
            Predicate::IsNull {
                expr,
                negated: false,
            } => write!(f, "{expr} is null"),
            Predicate::IsNull {
                expr,
                negated: true,
            } => write!(f, "{expr} is not null"),
            Predicate::Like { expr, pattern } => {
                write!(f, "{expr} like {}", Value::from(pattern.as_str()))
            }
            Predicate::And(items) | Predicate::Or(items) => {
                let sep = if matches!(self, Predicate::And(_)) {
                    " and "
                } else {
                    " or "
                };
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write_nested(f, item)?;
                }
                Ok(())
            }
            Predicate::Not(inner) => write!(f, "not ({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::QMember;

    #[test]
    fn conjunction_renders_in_input_order() {
        let m = QMember::new("m");
        let p = m.username().eq("member1").and(m.age().eq(10));
        assert_eq!(p.to_string(), "m.username = 'member1' and m.age = 10");
    }

    #[test]
    fn all_drops_true_and_flattens() {
        let m = QMember::new("m");
        let p = Predicate::all([
            Predicate::True,
            m.age().gt(1).and(m.age().lt(5)),
            m.username().is_null(),
        ]);
        match &p {
            Predicate::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
        assert!(Predicate::all(Vec::new()).is_true());
    }

    #[test]
    fn single_clause_is_not_wrapped() {
        let m = QMember::new("m");
        let p = Predicate::all([m.age().eq(10)]);
        assert_eq!(p, m.age().eq(10));
    }

    #[test]
    fn or_inside_and_gets_parentheses() {
        let m = QMember::new("m");
        let p = m
            .age()
            .eq(10)
            .or(m.age().eq(20))
            .and(m.username().is_not_null());
        assert_eq!(
            p.to_string(),
            "(m.age = 10 or m.age = 20) and m.username is not null"
        );
    }

    #[test]
    fn simple_case_lowers_to_equality_branches() {
        let m = QMember::new("m");
        let e = m.age().when(10).then("ten").when(20).then("twenty").otherwise("other");
        assert_eq!(
            e.to_string(),
            "case when m.age = 10 then 'ten' when m.age = 20 then 'twenty' else 'other' end"
        );
    }

    #[test]
    fn searched_case_renders() {
        let m = QMember::new("m");
        let e = CaseBuilder::new()
            .when(m.age().between(0, 20))
            .then("0-20")
            .otherwise("other");
        assert_eq!(
            e.to_string(),
            "case when m.age between 0 and 20 then '0-20' else 'other' end"
        );
    }

    #[test]
    fn labels_prefer_alias_then_field_name() {
        let m = QMember::new("m");
        assert_eq!(m.username().label(), "username");
        assert_eq!(m.username().as_("name").label(), "name");
        assert_eq!(m.age().avg().label(), "avg(m.age)");
    }

    #[test]
    fn contains_escapes_wildcards() {
        let m = QMember::new("m");
        assert_eq!(
            m.username().contains("50%_off").to_string(),
            "m.username like '%50\\%\\_off%'"
        );
    }

    #[test]
    fn aggregate_detection_skips_subqueries() {
        let m = QMember::new("m");
        assert!(m.age().avg().contains_aggregate());
        assert!(m.age().max().add(1).contains_aggregate());
        assert!(!m.age().concat("x").contains_aggregate());
    }
}
