//! Predicate composition for optional search criteria.
//!
//! Three styles share one rule: absent criteria contribute nothing, present
//! ones are ANDed in the order they were given, and an empty result matches
//! every row.
//!
//! * [`compose`] folds an iterator of optional clauses.
//! * [`Criteria`] pairs each optional input with the closure that turns it
//!   into a clause.
//! * [`SearchTemplate`] declares the criteria once and binds inputs per
//!   request, which is what services keep around.

use std::fmt;
use std::sync::Arc;

use crate::expr::Predicate;
use crate::value::Value;
use crate::CoreError;

/// Something that can be conjoined and has an always-true identity.
pub trait Conjunction: Sized {
    fn always_true() -> Self;
    /// AND the parts together, preserving their order.
    fn and_all(parts: Vec<Self>) -> Self;
}

impl Conjunction for Predicate {
    fn always_true() -> Self {
        Predicate::True
    }

    fn and_all(parts: Vec<Self>) -> Self {
        Predicate::all(parts)
    }
}

/// AND together every present clause. No clauses yields the always-true
/// predicate.
pub fn compose<C, I>(clauses: I) -> C
where
    C: Conjunction,
    I: IntoIterator<Item = Option<C>>,
{
    let parts: Vec<C> = clauses.into_iter().flatten().collect();
    if parts.is_empty() {
        C::always_true()
    } else {
        C::and_all(parts)
    }
}

/// Builder pairing optional inputs with their clause constructors.
///
/// ```
/// use domain::{Criteria, Predicate, QMember};
///
/// let m = QMember::new("m");
/// let username: Option<&str> = Some("member1");
/// let age: Option<i32> = None;
/// let p: Predicate = Criteria::new()
///     .with(username, |v| m.username().eq(v))
///     .with(age, |v| m.age().eq(v))
///     .compose();
/// assert_eq!(p.to_string(), "m.username = 'member1'");
/// ```
pub struct Criteria<C> {
    parts: Vec<C>,
}

impl<C: Conjunction> Criteria<C> {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    /// Add `clause(value)` when `value` is present.
    pub fn with<V, F>(mut self, value: Option<V>, clause: F) -> Self
    where
        F: FnOnce(V) -> C,
    {
        if let Some(v) = value {
            self.parts.push(clause(v));
        }
        self
    }

    /// Add a clause that is already optional.
    pub fn with_clause(mut self, clause: Option<C>) -> Self {
        self.parts.extend(clause);
        self
    }

    pub fn compose(self) -> C {
        compose(self.parts.into_iter().map(Some))
    }
}

impl<C: Conjunction> Default for Criteria<C> {
    fn default() -> Self {
        Self::new()
    }
}

type Comparison<C> = Arc<dyn Fn(Value) -> C + Send + Sync>;

/// A reusable set of named criteria.
///
/// Built once through [`SearchTemplate::builder`]; every declared name must
/// have a comparison and every comparison must name a declared criterion.
/// Binding is strict about names and lenient about values: an unknown name
/// is an error, a missing or null value simply drops the clause.
pub struct SearchTemplate<C> {
    criteria: Vec<(String, Comparison<C>)>,
}

impl<C> Clone for SearchTemplate<C> {
    fn clone(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
        }
    }
}

impl<C> SearchTemplate<C> {
    /// Criterion names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.criteria.iter().map(|(name, _)| name.as_str())
    }
}

impl<C> fmt::Debug for SearchTemplate<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchTemplate")
            .field("criteria", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl<C: Conjunction> SearchTemplate<C> {
    pub fn builder() -> SearchTemplateBuilder<C> {
        SearchTemplateBuilder {
            declared: Vec::new(),
            comparisons: Vec::new(),
        }
    }

    /// Compose the clauses for the given inputs, in declaration order.
    ///
    /// Inputs that are absent or `Value::Null` contribute nothing.
    pub fn bind(&self, inputs: &[(&str, Option<Value>)]) -> Result<C, CoreError> {
        for (name, _) in inputs {
            if !self.criteria.iter().any(|(n, _)| n == name) {
                return Err(CoreError::Configuration(format!(
                    "unknown search criterion `{name}`"
                )));
            }
        }
        let clauses = self.criteria.iter().map(|(name, compare)| {
            inputs
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .and_then(|(_, v)| v.clone())
                .filter(|v| !v.is_null())
                .map(|v| compare(v))
        });
        Ok(compose(clauses))
    }
}

pub struct SearchTemplateBuilder<C> {
    declared: Vec<String>,
    comparisons: Vec<(String, Comparison<C>)>,
}

impl<C: Conjunction> SearchTemplateBuilder<C> {
    /// Declare a criterion. Declaration order is composition order.
    pub fn declare(mut self, name: &str) -> Self {
        self.declared.push(name.to_string());
        self
    }

    /// Attach the comparison for a criterion.
    pub fn compare<F>(mut self, name: &str, comparison: F) -> Self
    where
        F: Fn(Value) -> C + Send + Sync + 'static,
    {
        self.comparisons.push((name.to_string(), Arc::new(comparison)));
        self
    }

    pub fn build(mut self) -> Result<SearchTemplate<C>, CoreError> {
        for (i, name) in self.declared.iter().enumerate() {
            if self.declared[..i].contains(name) {
                return Err(CoreError::Configuration(format!(
                    "criterion `{name}` is declared twice"
                )));
            }
        }
        if let Some((name, _)) = self
            .comparisons
            .iter()
            .find(|(n, _)| !self.declared.contains(n))
        {
            return Err(CoreError::Configuration(format!(
                "comparison for undeclared criterion `{name}`"
            )));
        }
        let mut criteria = Vec::with_capacity(self.declared.len());
        for name in self.declared {
            let idx = self
                .comparisons
                .iter()
                .position(|(n, _)| *n == name)
                .ok_or_else(|| {
                    CoreError::Configuration(format!("criterion `{name}` has no comparison"))
                })?;
            let (_, compare) = self.comparisons.swap_remove(idx);
            criteria.push((name, compare));
        }
        if let Some((name, _)) = self.comparisons.first() {
            return Err(CoreError::Configuration(format!(
                "criterion `{name}` has more than one comparison"
            )));
        }
        Ok(SearchTemplate { criteria })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::QMember;

    fn template() -> SearchTemplate<Predicate> {
        let m = QMember::new("m");
        SearchTemplate::builder()
            .declare("username")
            .declare("age")
            .compare("age", move |v| m.age().eq(v))
            .compare("username", move |v| m.username().eq(v))
            .build()
            .unwrap()
    }

    #[test]
    fn compose_of_nothing_is_true() {
        let p: Predicate = compose(Vec::<Option<Predicate>>::new());
        assert!(p.is_true());
        let p: Predicate = compose([None, None]);
        assert!(p.is_true());
    }

    #[test]
    fn compose_keeps_input_order() {
        let m = QMember::new("m");
        let p: Predicate = compose([Some(m.age().eq(10)), None, Some(m.username().eq("a"))]);
        assert_eq!(p.to_string(), "m.age = 10 and m.username = 'a'");
    }

    #[test]
    fn criteria_builder_skips_absent_values() {
        let m = QMember::new("m");
        let p: Predicate = Criteria::new()
            .with(Some("member1"), |v| m.username().eq(v))
            .with(Some(10), |v| m.age().eq(v))
            .compose();
        assert_eq!(p.to_string(), "m.username = 'member1' and m.age = 10");

        let none: Predicate = Criteria::new()
            .with(None::<i32>, |v| m.age().eq(v))
            .with_clause(None)
            .compose();
        assert!(none.is_true());
    }

    #[test]
    fn template_binds_in_declaration_order() {
        let t = template();
        let p = t
            .bind(&[("age", Some(Value::Int(10))), ("username", Some("member1".into()))])
            .unwrap();
        assert_eq!(p.to_string(), "m.username = 'member1' and m.age = 10");
    }

    #[test]
    fn template_drops_absent_and_null_inputs() {
        let t = template();
        let p = t
            .bind(&[("username", None), ("age", Some(Value::Null))])
            .unwrap();
        assert!(p.is_true());
        let p = t.bind(&[("age", Some(Value::Int(20)))]).unwrap();
        assert_eq!(p.to_string(), "m.age = 20");
    }

    #[test]
    fn template_rejects_unknown_name() {
        let err = template().bind(&[("nickname", Some("x".into()))]).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn builder_requires_matching_declarations() {
        let m = QMember::new("m");
        let missing = SearchTemplate::<Predicate>::builder().declare("age").build();
        assert!(matches!(missing, Err(CoreError::Configuration(_))));

        let undeclared = SearchTemplate::builder()
            .compare("age", move |v| m.age().eq(v))
            .build();
        assert!(matches!(undeclared, Err(CoreError::Configuration(_))));

        let twice = SearchTemplate::builder()
            .declare("age")
            .compare("age", move |v| m.age().eq(v))
            .compare("age", move |v| m.age().ne(v))
            .build();
        assert!(matches!(twice, Err(CoreError::Configuration(_))));
    }
}
