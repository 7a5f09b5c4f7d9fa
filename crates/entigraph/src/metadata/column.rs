/// Special meaning attached to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Regular,
    /// Set to the operation timestamp on insert.
    CreateDate,
    /// Set to the operation timestamp on insert and update.
    UpdateDate,
    /// Starts at 1 and is bumped by one on every update.
    Version,
    /// Holds the concrete entity name of a class-table hierarchy row.
    Discriminator,
    /// Depth of a node in a closure-table tree, root is 1.
    TreeLevel,
}

/// One mapped column of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Property name on the entity record.
    pub property: String,
    /// Physical column name.
    pub name: String,
    pub kind: ColumnKind,
    pub primary: bool,
    /// Value is produced by the database on insert.
    pub generated: bool,
    pub nullable: bool,
}

impl ColumnMetadata {
    /// A regular column whose physical name equals the property name.
    pub fn new(property: impl Into<String>) -> Self {
        let property = property.into();
        Self {
            name: property.clone(),
            property,
            kind: ColumnKind::Regular,
            primary: false,
            generated: false,
            nullable: true,
        }
    }

    /// A user-assigned primary column.
    pub fn primary(property: impl Into<String>) -> Self {
        Self {
            primary: true,
            nullable: false,
            ..Self::new(property)
        }
    }

    /// A database-generated primary column (serial / identity).
    pub fn generated_primary(property: impl Into<String>) -> Self {
        Self {
            generated: true,
            ..Self::primary(property)
        }
    }

    pub fn create_date(property: impl Into<String>) -> Self {
        Self::new(property).kind(ColumnKind::CreateDate)
    }

    pub fn update_date(property: impl Into<String>) -> Self {
        Self::new(property).kind(ColumnKind::UpdateDate)
    }

    pub fn version(property: impl Into<String>) -> Self {
        Self::new(property).kind(ColumnKind::Version)
    }

    pub fn discriminator(property: impl Into<String>) -> Self {
        Self::new(property).kind(ColumnKind::Discriminator)
    }

    pub fn tree_level(property: impl Into<String>) -> Self {
        Self::new(property).kind(ColumnKind::TreeLevel)
    }

    /// Override the physical column name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(mut self, kind: ColumnKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Columns maintained by the executor rather than diffed.
    pub fn is_special(&self) -> bool {
        !matches!(self.kind, ColumnKind::Regular)
    }
}
