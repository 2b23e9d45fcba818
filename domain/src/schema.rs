//! Hand-written schema descriptors for the persisted entities.
//!
//! Each entity lists its fields in storage order (identity first) together
//! with the field's logical kind. Query validation consults the kind to
//! decide which operators a field accepts.

use std::fmt::{self, Display, Formatter};

/// Logical field types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Id,
    Integer,
    Real,
    Text,
}

/// Families of operators a field kind may or may not accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorClass {
    /// `=`, `<>`, `in`, null checks.
    Equality,
    /// `<`, `<=`, `>`, `>=`, `between`, sorting, `min`/`max`.
    Ordering,
    /// `like` and friends.
    Pattern,
    /// `+`, `-`, `*`, `sum`, `avg`.
    Arithmetic,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Real)
    }

    pub fn supports(self, class: OperatorClass) -> bool {
        match class {
            OperatorClass::Equality | OperatorClass::Ordering => true,
            OperatorClass::Pattern => self == FieldKind::Text,
            OperatorClass::Arithmetic => self.is_numeric(),
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Id => write!(f, "Id"),
            FieldKind::Integer => write!(f, "Integer"),
            FieldKind::Real => write!(f, "Real"),
            FieldKind::Text => write!(f, "Text"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Name used in query text and named projections.
    pub name: &'static str,
    /// Storage column.
    pub column: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Target entity for many-to-one references.
    pub references: Option<EntityKind>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub kind: EntityKind,
    pub name: &'static str,
    pub table: &'static str,
    pub fields: &'static [FieldDescriptor],
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn id_field(&self) -> &'static FieldDescriptor {
        &self.fields[0]
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Member,
    Team,
}

impl EntityKind {
    pub fn descriptor(self) -> &'static EntityDescriptor {
        match self {
            EntityKind::Member => &MEMBER,
            EntityKind::Team => &TEAM,
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

pub static MEMBER_FIELDS: [FieldDescriptor; 4] = [
    FieldDescriptor {
        name: "id",
        column: "id",
        kind: FieldKind::Id,
        nullable: false,
        references: None,
    },
    FieldDescriptor {
        name: "username",
        column: "username",
        kind: FieldKind::Text,
        nullable: true,
        references: None,
    },
    FieldDescriptor {
        name: "age",
        column: "age",
        kind: FieldKind::Integer,
        nullable: false,
        references: None,
    },
    FieldDescriptor {
        name: "team_id",
        column: "team_id",
        kind: FieldKind::Id,
        nullable: true,
        references: Some(EntityKind::Team),
    },
];

pub static TEAM_FIELDS: [FieldDescriptor; 2] = [
    FieldDescriptor {
        name: "id",
        column: "id",
        kind: FieldKind::Id,
        nullable: false,
        references: None,
    },
    FieldDescriptor {
        name: "name",
        column: "name",
        kind: FieldKind::Text,
        nullable: false,
        references: None,
    },
];

pub static MEMBER: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Member,
    name: "Member",
    table: "member",
    fields: &MEMBER_FIELDS,
};

pub static TEAM: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Team,
    name: "Team",
    table: "team",
    fields: &TEAM_FIELDS,
};
