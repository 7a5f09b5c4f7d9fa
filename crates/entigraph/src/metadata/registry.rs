use super::{EntityMetadata, RelationKind, RelationMetadata, TableKind};
use crate::error::{OrmError, OrmResult};
use crate::sql::is_valid_ident;
use std::collections::HashMap;
use std::sync::Arc;

/// Validated set of entity metadata, keyed by entity name.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

/// Collects entity declarations; see [`MetadataRegistry::builder`].
#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityMetadata>,
}

/// Both ends of a many-to-many relation, normalised to the side that declares
/// the junction table.
#[derive(Debug, Clone, Copy)]
pub struct JunctionSide<'a> {
    pub owner: &'a Arc<EntityMetadata>,
    pub relation: &'a RelationMetadata,
    pub inverse: &'a Arc<EntityMetadata>,
    /// The relation being inspected was declared on the inverse entity.
    pub swapped: bool,
}

impl MetadataRegistryBuilder {
    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.entities.push(metadata);
        self
    }

    /// Validate all declarations and resolve class-table parents.
    pub fn build(self) -> OrmResult<MetadataRegistry> {
        let mut pending: HashMap<String, EntityMetadata> = HashMap::new();
        let mut order = Vec::new();
        for metadata in self.entities {
            check_names(&metadata)?;
            if pending.contains_key(&metadata.name) {
                return Err(OrmError::invalid_metadata(format!(
                    "entity '{}' is registered twice",
                    metadata.name
                )));
            }
            order.push(metadata.name.clone());
            pending.insert(metadata.name.clone(), metadata);
        }

        let mut entities = HashMap::new();

        // Plain entities first so children can borrow their parent's identity.
        for name in &order {
            let Some(metadata) = pending.get(name) else {
                continue;
            };
            if matches!(metadata.kind, TableKind::ClassTableChild { .. }) {
                continue;
            }
            let mut metadata = metadata.clone();
            metadata.identity = metadata
                .own_primary_columns()
                .map(|c| c.property.clone())
                .collect();
            if metadata.identity.is_empty() {
                return Err(OrmError::invalid_metadata(format!(
                    "entity '{}' has no primary column",
                    metadata.name
                )));
            }
            entities.insert(name.clone(), Arc::new(metadata));
        }

        for name in &order {
            let Some(metadata) = pending.get(name) else {
                continue;
            };
            let TableKind::ClassTableChild { parent, .. } = &metadata.kind else {
                continue;
            };
            let parent = entities.get(parent).cloned().ok_or_else(|| {
                OrmError::invalid_metadata(format!(
                    "entity '{}' inherits from '{}', which is not a registered root entity",
                    metadata.name, parent
                ))
            })?;
            let mut metadata = metadata.clone();
            let mut identity = parent.identity.clone();
            identity.extend(metadata.own_primary_columns().map(|c| c.property.clone()));
            metadata.identity = identity;
            metadata.parent = Some(parent);
            entities.insert(name.clone(), Arc::new(metadata));
        }

        let registry = MetadataRegistry { entities };
        for metadata in registry.entities.values() {
            registry.check_relations(metadata)?;
            if metadata.is_closure() && metadata.identity.len() != 1 {
                return Err(OrmError::invalid_metadata(format!(
                    "closure entity '{}' must have exactly one primary column",
                    metadata.name
                )));
            }
        }
        Ok(registry)
    }
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    /// Look up metadata by entity name.
    pub fn get(&self, name: &str) -> OrmResult<&Arc<EntityMetadata>> {
        self.entities
            .get(name)
            .ok_or_else(|| OrmError::MetadataNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }

    /// Property on the related entity that a relation's foreign key points at.
    pub fn referenced_property<'a>(&'a self, relation: &'a RelationMetadata) -> OrmResult<&'a str> {
        if let Some(property) = &relation.referenced_property {
            return Ok(property);
        }
        let target = self.get(&relation.target)?;
        target
            .identity
            .first()
            .map(String::as_str)
            .ok_or_else(|| OrmError::invalid_metadata(format!("'{}' has no identity", target.name)))
    }

    /// The owning to-one relation on the related entity behind an inverse
    /// one-to-many / one-to-one side.
    pub fn inverse_relation<'a>(
        &'a self,
        relation: &RelationMetadata,
    ) -> OrmResult<(&'a Arc<EntityMetadata>, &'a RelationMetadata)> {
        let target = self.get(&relation.target)?;
        let property = relation.inverse_property.as_deref().ok_or_else(|| {
            OrmError::invalid_metadata(format!(
                "relation '{}' has no inverse property",
                relation.property
            ))
        })?;
        let inverse = target.find_relation(property).ok_or_else(|| {
            OrmError::invalid_metadata(format!(
                "'{}' has no relation '{}'",
                target.name, property
            ))
        })?;
        Ok((target, inverse))
    }

    /// Normalise a many-to-many relation declared on `metadata` to its owning side.
    pub fn junction<'a>(
        &'a self,
        metadata: &str,
        relation: &'a RelationMetadata,
    ) -> OrmResult<JunctionSide<'a>> {
        let this = self.get(metadata)?;
        let target = self.get(&relation.target)?;
        if relation.owning {
            return Ok(JunctionSide {
                owner: this,
                relation,
                inverse: target,
                swapped: false,
            });
        }
        let (_, owner_relation) = self.inverse_relation(relation)?;
        Ok(JunctionSide {
            owner: target,
            relation: owner_relation,
            inverse: this,
            swapped: true,
        })
    }

    fn check_relations(&self, metadata: &EntityMetadata) -> OrmResult<()> {
        let fail = |relation: &RelationMetadata, message: &str| {
            Err(OrmError::invalid_metadata(format!(
                "{}.{}: {}",
                metadata.name, relation.property, message
            )))
        };

        for relation in &metadata.relations {
            let Ok(target) = self.get(&relation.target) else {
                return fail(relation, &format!("unknown target '{}'", relation.target));
            };

            if let Some(property) = &relation.referenced_property {
                if target.find_column(property).is_none() {
                    return fail(relation, &format!("'{}' has no column '{property}'", target.name));
                }
            } else if target.identity.len() != 1 && (relation.owning || relation.is_many_to_many()) {
                return fail(relation, "composite foreign keys are not supported");
            }

            if relation.tree_parent
                && (!metadata.is_closure()
                    || relation.kind != RelationKind::ManyToOne
                    || relation.target != metadata.name)
            {
                return fail(
                    relation,
                    "tree parent must be a many-to-one to the same closure entity",
                );
            }

            match (relation.kind, relation.owning) {
                (RelationKind::ManyToOne | RelationKind::OneToOne, true) => {
                    if relation.join_column.is_none() {
                        return fail(relation, "owning to-one relation needs a join column");
                    }
                }
                (RelationKind::ManyToMany, true) => {
                    if relation.join_table.is_none() {
                        return fail(relation, "owning many-to-many relation needs a join table");
                    }
                    if metadata.identity.len() != 1 {
                        return fail(relation, "composite foreign keys are not supported");
                    }
                }
                (RelationKind::ManyToOne, false) => {
                    return fail(relation, "many-to-one relations are always owning");
                }
                (kind, false) => {
                    let (_, inverse) = self.inverse_relation(relation)?;
                    let expected_owner = match kind {
                        RelationKind::ManyToMany => inverse.is_many_to_many(),
                        _ => inverse.is_owning_to_one(),
                    };
                    if !expected_owner || !inverse.owning || inverse.target != metadata.name {
                        return fail(
                            relation,
                            &format!(
                                "inverse '{}.{}' must be the owning side pointing back",
                                target.name, inverse.property
                            ),
                        );
                    }
                    if kind != RelationKind::ManyToMany
                        && inverse.referenced_property.is_none()
                        && metadata.identity.len() != 1
                    {
                        return fail(relation, "composite foreign keys are not supported");
                    }
                }
                (RelationKind::OneToMany, true) => {
                    return fail(relation, "one-to-many relations are never owning");
                }
            }
        }
        Ok(())
    }
}

fn check_names(metadata: &EntityMetadata) -> OrmResult<()> {
    let mut names: Vec<&str> = vec![&metadata.table];
    names.extend(metadata.columns.iter().map(|c| c.name.as_str()));
    for relation in &metadata.relations {
        names.extend(relation.join_column.as_deref());
        if let Some(join_table) = &relation.join_table {
            names.push(&join_table.name);
            names.push(&join_table.owner_column);
            names.push(&join_table.inverse_column);
        }
    }
    match &metadata.kind {
        TableKind::Closure { closure_table } => names.push(closure_table),
        TableKind::ClassTableChild {
            parent_id_column, ..
        } => names.push(parent_id_column),
        TableKind::Regular => {}
    }

    match names.into_iter().find(|n| !is_valid_ident(n)) {
        Some(bad) => Err(OrmError::invalid_metadata(format!(
            "entity '{}' uses invalid SQL identifier '{bad}'",
            metadata.name
        ))),
        None => Ok(()),
    }
}
