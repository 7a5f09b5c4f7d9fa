/// Cardinality of a relation, seen from the entity that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Which persistence operations follow a relation to the related entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cascade {
    pub insert: bool,
    pub update: bool,
    pub remove: bool,
}

impl Default for Cascade {
    fn default() -> Self {
        Self {
            insert: true,
            update: true,
            remove: false,
        }
    }
}

impl Cascade {
    pub fn all() -> Self {
        Self {
            insert: true,
            update: true,
            remove: true,
        }
    }

    pub fn none() -> Self {
        Self {
            insert: false,
            update: false,
            remove: false,
        }
    }
}

/// Junction table backing the owning side of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub name: String,
    /// Column referencing the owning entity.
    pub owner_column: String,
    /// Column referencing the related entity.
    pub inverse_column: String,
}

impl JoinTable {
    pub fn new(
        name: impl Into<String>,
        owner_column: impl Into<String>,
        inverse_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner_column: owner_column.into(),
            inverse_column: inverse_column.into(),
        }
    }
}

/// A relation declared on an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMetadata {
    pub property: String,
    pub kind: RelationKind,
    /// Name of the related entity.
    pub target: String,
    /// Property on the related entity pointing back, if bidirectional.
    pub inverse_property: Option<String>,
    /// The side that holds the foreign key or the junction table.
    pub owning: bool,
    /// Foreign key column in this entity's table (owning to-one sides).
    pub join_column: Option<String>,
    /// Property of the related entity the foreign key references.
    ///
    /// Defaults to the related entity's first identity property.
    pub referenced_property: Option<String>,
    pub join_table: Option<JoinTable>,
    pub lazy: bool,
    /// Marks the many-to-one relation to the parent node of a closure-table tree.
    pub tree_parent: bool,
    pub cascade: Cascade,
}

impl RelationMetadata {
    fn base(property: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            kind,
            target: target.into(),
            inverse_property: None,
            owning: false,
            join_column: None,
            referenced_property: None,
            join_table: None,
            lazy: false,
            tree_parent: false,
            cascade: Cascade::default(),
        }
    }

    /// Owning many-to-one side holding `join_column`.
    pub fn many_to_one(
        property: impl Into<String>,
        target: impl Into<String>,
        join_column: impl Into<String>,
    ) -> Self {
        Self {
            owning: true,
            join_column: Some(join_column.into()),
            ..Self::base(property, RelationKind::ManyToOne, target)
        }
    }

    /// Inverse collection side; `inverse_property` is the many-to-one on the target.
    pub fn one_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        inverse_property: impl Into<String>,
    ) -> Self {
        Self {
            inverse_property: Some(inverse_property.into()),
            ..Self::base(property, RelationKind::OneToMany, target)
        }
    }

    /// Owning one-to-one side holding `join_column`.
    pub fn one_to_one(
        property: impl Into<String>,
        target: impl Into<String>,
        join_column: impl Into<String>,
    ) -> Self {
        Self {
            owning: true,
            join_column: Some(join_column.into()),
            ..Self::base(property, RelationKind::OneToOne, target)
        }
    }

    /// Inverse one-to-one side; the foreign key lives on the target.
    pub fn one_to_one_inverse(
        property: impl Into<String>,
        target: impl Into<String>,
        inverse_property: impl Into<String>,
    ) -> Self {
        Self {
            inverse_property: Some(inverse_property.into()),
            ..Self::base(property, RelationKind::OneToOne, target)
        }
    }

    /// Owning many-to-many side.
    pub fn many_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        join_table: JoinTable,
    ) -> Self {
        Self {
            owning: true,
            join_table: Some(join_table),
            ..Self::base(property, RelationKind::ManyToMany, target)
        }
    }

    /// Inverse many-to-many side; the junction table is declared on the target.
    pub fn many_to_many_inverse(
        property: impl Into<String>,
        target: impl Into<String>,
        inverse_property: impl Into<String>,
    ) -> Self {
        Self {
            inverse_property: Some(inverse_property.into()),
            ..Self::base(property, RelationKind::ManyToMany, target)
        }
    }

    pub fn inverse(mut self, property: impl Into<String>) -> Self {
        self.inverse_property = Some(property.into());
        self
    }

    pub fn references(mut self, property: impl Into<String>) -> Self {
        self.referenced_property = Some(property.into());
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn tree_parent(mut self) -> Self {
        self.tree_parent = true;
        self
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn cascade_remove(mut self) -> Self {
        self.cascade.remove = true;
        self
    }

    pub fn is_to_one(&self) -> bool {
        matches!(self.kind, RelationKind::OneToOne | RelationKind::ManyToOne)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany | RelationKind::ManyToMany)
    }

    pub fn is_many_to_many(&self) -> bool {
        self.kind == RelationKind::ManyToMany
    }

    /// To-one side that stores the foreign key in its own table.
    pub fn is_owning_to_one(&self) -> bool {
        self.is_to_one() && self.owning
    }

    /// One-to-many or inverse one-to-one: the foreign key lives on the related rows.
    pub fn is_inverse_side_fk(&self) -> bool {
        match self.kind {
            RelationKind::OneToMany => true,
            RelationKind::OneToOne => !self.owning,
            _ => false,
        }
    }
}
