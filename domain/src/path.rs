//! Typed query handles over the schema descriptors.
//!
//! `QMember::new("m")` plays the role a generated query type would play in
//! a code-generating ORM: it names an aliased source and hands out field
//! expressions checked against the descriptor.

use std::fmt::{self, Display, Formatter};

use crate::expr::Expr;
use crate::schema::{EntityDescriptor, EntityKind, FieldDescriptor};

/// An aliased entity source in a `from` or `join` clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Source {
    pub entity: EntityKind,
    pub alias: &'static str,
}

impl Source {
    pub fn new(entity: EntityKind, alias: &'static str) -> Self {
        Self { entity, alias }
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.entity.descriptor()
    }

    /// Field reference by name. Returns `None` for unknown fields.
    pub fn field(&self, name: &str) -> Option<FieldRef> {
        self.descriptor().field(name).map(|field| FieldRef {
            source: *self,
            field,
        })
    }

    pub fn id(&self) -> FieldRef {
        FieldRef {
            source: *self,
            field: self.descriptor().id_field(),
        }
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity.name(), self.alias)
    }
}

/// A field of an aliased source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub source: Source,
    pub field: &'static FieldDescriptor,
}

impl Display for FieldRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source.alias, self.field.name)
    }
}

/// A navigable many-to-one association: `fk` on the owning side points at
/// the identity of `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Association {
    pub fk: FieldRef,
    pub target: EntityKind,
}

fn field_of(source: &Source, idx: usize) -> Expr {
    Expr::Field(FieldRef {
        source: *source,
        field: &source.descriptor().fields[idx],
    })
}

/// Query handle for [`crate::Member`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QMember {
    source: Source,
}

impl QMember {
    pub fn new(alias: &'static str) -> Self {
        Self {
            source: Source::new(EntityKind::Member, alias),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn id(&self) -> Expr {
        field_of(&self.source, 0)
    }

    pub fn username(&self) -> Expr {
        field_of(&self.source, 1)
    }

    pub fn age(&self) -> Expr {
        field_of(&self.source, 2)
    }

    pub fn team_id(&self) -> Expr {
        field_of(&self.source, 3)
    }

    /// The member → team association, for `join(m.team(), &t)`.
    pub fn team(&self) -> Association {
        Association {
            fk: FieldRef {
                source: self.source,
                field: &self.source.descriptor().fields[3],
            },
            target: EntityKind::Team,
        }
    }

    /// `count(m.id)`, the number of members in scope.
    pub fn count(&self) -> Expr {
        self.id().count()
    }
}

impl Default for QMember {
    fn default() -> Self {
        Self::new("member")
    }
}

/// Query handle for [`crate::Team`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QTeam {
    source: Source,
}

impl QTeam {
    pub fn new(alias: &'static str) -> Self {
        Self {
            source: Source::new(EntityKind::Team, alias),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn id(&self) -> Expr {
        field_of(&self.source, 0)
    }

    pub fn name(&self) -> Expr {
        field_of(&self.source, 1)
    }

    pub fn count(&self) -> Expr {
        self.id().count()
    }
}

impl Default for QTeam {
    fn default() -> Self {
        Self::new("team")
    }
}

impl From<&QMember> for Source {
    fn from(q: &QMember) -> Self {
        q.source
    }
}

impl From<QMember> for Source {
    fn from(q: QMember) -> Self {
        q.source
    }
}

impl From<&QTeam> for Source {
    fn from(q: &QTeam) -> Self {
        q.source
    }
}

impl From<QTeam> for Source {
    fn from(q: QTeam) -> Self {
        q.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_render_with_alias() {
        let m = QMember::new("m");
        assert_eq!(m.username().to_string(), "m.username");
        assert_eq!(QTeam::default().name().to_string(), "team.name");
    }

    #[test]
    fn association_points_at_team() {
        let m = QMember::new("m");
        let assoc = m.team();
        assert_eq!(assoc.fk.field.name, "team_id");
        assert_eq!(assoc.target, EntityKind::Team);
    }

    #[test]
    fn source_field_lookup() {
        let s = QTeam::new("t").source();
        assert!(s.field("name").is_some());
        assert!(s.field("age").is_none());
        assert_eq!(s.id().to_string(), "t.id");
    }
}
