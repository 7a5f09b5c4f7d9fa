//! Loading db-side entity graphs.
//!
//! [`EntityLoader`] is the narrow read contract the persistence engine needs:
//! load one entity by identity together with an explicit list of relation
//! paths, and load a single relation for lazy slots. [`GraphLoader`]
//! implements it over any [`QueryRunner`] using point selects.

use crate::entity::{Entity, EntityId, RelationValue};
use crate::error::{OrmError, OrmResult};
use crate::metadata::{EntityMetadata, MetadataRegistry, RelationMetadata};
use crate::runner::QueryRunner;
use crate::value::{Value, ValueMap};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// Dotted relation path such as `"comments.author"`.
pub type RelationPath = String;

#[async_trait]
pub trait EntityLoader: Send + Sync {
    /// Load the row identified by `id`, eagerly joining `relations`.
    async fn find_by_id(
        &self,
        metadata: &EntityMetadata,
        id: &EntityId,
        relations: &[RelationPath],
    ) -> OrmResult<Option<Entity>>;

    /// Load one relation of the entity identified by `id`.
    async fn load_relation(
        &self,
        metadata: &EntityMetadata,
        id: &EntityId,
        relation: &str,
    ) -> OrmResult<RelationValue>;
}

struct Condition {
    table: String,
    column: String,
    value: Value,
}

/// A loaded entity with the raw rows it was built from.
struct Fetched {
    entity: Entity,
    row: ValueMap,
    parent_row: Option<ValueMap>,
}

#[derive(Default)]
struct PathTree(BTreeMap<String, PathTree>);

impl PathTree {
    fn from_paths(paths: &[RelationPath]) -> Self {
        let mut root = PathTree::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        root
    }
}

/// [`EntityLoader`] over a [`QueryRunner`] with a per-loader identity map.
///
/// The same row always yields the same [`Entity`] handle, so graphs loaded
/// through one `GraphLoader` keep their cycles.
pub struct GraphLoader<'a, R> {
    runner: &'a R,
    registry: &'a MetadataRegistry,
    identity_map: Mutex<HashMap<(String, String), Entity>>,
}

impl<'a, R: QueryRunner> GraphLoader<'a, R> {
    pub fn new(runner: &'a R, registry: &'a MetadataRegistry) -> Self {
        Self {
            runner,
            registry,
            identity_map: Mutex::new(HashMap::new()),
        }
    }

    fn identity_conditions(&self, metadata: &EntityMetadata, id: &EntityId) -> OrmResult<Vec<Condition>> {
        metadata
            .identity_properties()
            .iter()
            .map(|property| {
                let value = id.get(property).filter(|v| v.is_set()).ok_or_else(|| {
                    OrmError::planning(format!(
                        "'{}' id is missing property '{property}'",
                        metadata.name
                    ))
                })?;
                property_condition(metadata, property, value.clone())
            })
            .collect()
    }

    fn intern(&self, metadata: &EntityMetadata, entity: Entity) -> Entity {
        let id = entity.id_of(metadata.identity_properties());
        if id.len() != metadata.identity_properties().len() {
            return entity;
        }
        let key = (metadata.name.clone(), format!("{id:?}"));
        let mut map = self
            .identity_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match map.get(&key) {
            Some(existing) => {
                for (property, value) in entity.values() {
                    existing.set(property, value);
                }
                existing.clone()
            }
            None => {
                map.insert(key, entity.clone());
                entity
            }
        }
    }

    fn build(&self, metadata: &EntityMetadata, row: &ValueMap, parent_row: Option<&ValueMap>) -> Entity {
        let entity = Entity::new(metadata.name.clone());
        if let (Some(parent), Some(parent_row)) = (metadata.parent(), parent_row) {
            for column in &parent.columns {
                if let Some(value) = parent_row.get(&column.name) {
                    entity.set(column.property.clone(), value.clone());
                }
            }
        }
        for column in &metadata.columns {
            if let Some(value) = row.get(&column.name) {
                entity.set(column.property.clone(), value.clone());
            }
        }
        for relation in metadata.all_relations() {
            if relation.lazy {
                entity.mark_unloaded(relation.property.clone());
            }
        }
        self.intern(metadata, entity)
    }

    async fn fetch(&self, metadata: &EntityMetadata, conditions: Vec<Condition>) -> OrmResult<Vec<Fetched>> {
        let (own, inherited): (Vec<_>, Vec<_>) =
            conditions.into_iter().partition(|c| c.table == metadata.table);
        let to_map = |conds: &[Condition]| -> ValueMap {
            conds.iter().map(|c| (c.column.clone(), c.value.clone())).collect()
        };

        let Some(parent) = metadata.parent() else {
            let rows = self.runner.select(&metadata.table, &to_map(&own)).await?;
            return Ok(rows
                .into_iter()
                .map(|row| Fetched {
                    entity: self.build(metadata, &row, None),
                    row,
                    parent_row: None,
                })
                .collect());
        };

        let parent_id_column = metadata
            .parent_id_column()
            .ok_or_else(|| OrmError::invalid_metadata(format!("'{}' has no parent id column", metadata.name)))?;
        let parent_key = parent_key_column(parent)?;
        let mut out = Vec::new();

        if inherited.is_empty() {
            for row in self.runner.select(&metadata.table, &to_map(&own)).await? {
                let Some(key) = row.get(parent_id_column).cloned() else {
                    continue;
                };
                let mut cond = ValueMap::new();
                cond.insert(parent_key.to_string(), key);
                let parent_row = self.runner.select(&parent.table, &cond).await?.into_iter().next();
                out.push(Fetched {
                    entity: self.build(metadata, &row, parent_row.as_ref()),
                    row,
                    parent_row,
                });
            }
        } else {
            for parent_row in self.runner.select(&parent.table, &to_map(&inherited)).await? {
                let Some(key) = parent_row.get(parent_key).cloned() else {
                    continue;
                };
                let mut cond = to_map(&own);
                cond.insert(parent_id_column.to_string(), key);
                for row in self.runner.select(&metadata.table, &cond).await? {
                    out.push(Fetched {
                        entity: self.build(metadata, &row, Some(&parent_row)),
                        row,
                        parent_row: Some(parent_row.clone()),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Raw value of a column belonging to `property`'s table.
    fn raw<'f>(&self, fetched: &'f Fetched, metadata: &EntityMetadata, property: &str, column: &str) -> Option<&'f Value> {
        if metadata.table_of(property) == metadata.table {
            fetched.row.get(column)
        } else {
            fetched.parent_row.as_ref()?.get(column)
        }
    }

    async fn related(
        &self,
        fetched: &Fetched,
        metadata: &EntityMetadata,
        relation: &RelationMetadata,
    ) -> OrmResult<Vec<Fetched>> {
        let target = self.registry.get(&relation.target)?;

        if relation.is_many_to_many() {
            let side = self.registry.junction(&metadata.name, relation)?;
            let Some(join_table) = &side.relation.join_table else {
                return Err(OrmError::invalid_metadata(format!(
                    "'{}' has no join table",
                    side.relation.property
                )));
            };
            let (this_column, other_column) = if side.swapped {
                (&join_table.inverse_column, &join_table.owner_column)
            } else {
                (&join_table.owner_column, &join_table.inverse_column)
            };
            let Some(key) = first_identity_value(&fetched.entity, metadata) else {
                return Ok(Vec::new());
            };
            let mut cond = ValueMap::new();
            cond.insert(this_column.clone(), key);

            let mut out = Vec::new();
            for link in self.runner.select(&join_table.name, &cond).await? {
                let Some(other) = link.get(other_column).filter(|v| v.is_set()) else {
                    continue;
                };
                let property = first_identity_property(target)?;
                let conditions = vec![property_condition(target, property, other.clone())?];
                out.extend(self.fetch(target, conditions).await?);
            }
            return Ok(out);
        }

        if relation.is_owning_to_one() {
            let column = relation.join_column.as_deref().unwrap_or_default();
            let Some(fk) = self
                .raw(fetched, metadata, &relation.property, column)
                .filter(|v| v.is_set())
                .cloned()
            else {
                return Ok(Vec::new());
            };
            let referenced = self.registry.referenced_property(relation)?;
            let conditions = vec![property_condition(target, referenced, fk)?];
            return Ok(self.fetch(target, conditions).await?.into_iter().take(1).collect());
        }

        // Inverse side: the foreign key lives on the target rows.
        let (_, inverse) = self.registry.inverse_relation(relation)?;
        let referenced = match &inverse.referenced_property {
            Some(p) => p.as_str(),
            None => first_identity_property(self.registry.get(&metadata.name)?)?,
        };
        let Some(key) = fetched.entity.get(referenced).filter(|v| v.is_set()) else {
            return Ok(Vec::new());
        };
        let column = inverse.join_column.clone().unwrap_or_default();
        let conditions = vec![Condition {
            table: target.table_of(&inverse.property).to_string(),
            column,
            value: key,
        }];
        let mut rows = self.fetch(target, conditions).await?;
        if relation.is_to_one() {
            rows.truncate(1);
        }
        Ok(rows)
    }

    fn load_paths<'b>(
        &'b self,
        fetched: Fetched,
        metadata: Arc<EntityMetadata>,
        tree: &'b PathTree,
    ) -> BoxFuture<'b, OrmResult<()>> {
        async move {
            for (property, subtree) in &tree.0 {
                let relation = metadata.find_relation(property).ok_or_else(|| {
                    OrmError::invalid_metadata(format!(
                        "'{}' has no relation '{property}'",
                        metadata.name
                    ))
                })?;
                let related = self.related(&fetched, &metadata, relation).await?;
                let entities: Vec<Entity> = related.iter().map(|f| f.entity.clone()).collect();
                if relation.is_to_one() {
                    fetched
                        .entity
                        .set_one(property.clone(), entities.into_iter().next());
                } else {
                    fetched.entity.set_many(property.clone(), entities);
                }

                if !subtree.0.is_empty() {
                    let target = self.registry.get(&relation.target)?.clone();
                    for child in related {
                        self.load_paths(child, target.clone(), subtree).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }
}

#[async_trait]
impl<R: QueryRunner> EntityLoader for GraphLoader<'_, R> {
    async fn find_by_id(
        &self,
        metadata: &EntityMetadata,
        id: &EntityId,
        relations: &[RelationPath],
    ) -> OrmResult<Option<Entity>> {
        let metadata = self.registry.get(&metadata.name)?.clone();
        let conditions = self.identity_conditions(&metadata, id)?;
        let Some(fetched) = self.fetch(&metadata, conditions).await?.into_iter().next() else {
            return Ok(None);
        };
        let entity = fetched.entity.clone();
        let tree = PathTree::from_paths(relations);
        self.load_paths(fetched, metadata, &tree).await?;
        Ok(Some(entity))
    }

    async fn load_relation(
        &self,
        metadata: &EntityMetadata,
        id: &EntityId,
        relation: &str,
    ) -> OrmResult<RelationValue> {
        let metadata = self.registry.get(&metadata.name)?.clone();
        let relation = metadata.find_relation(relation).ok_or_else(|| {
            OrmError::invalid_metadata(format!("'{}' has no relation '{relation}'", metadata.name))
        })?;
        let conditions = self.identity_conditions(&metadata, id)?;
        let Some(fetched) = self.fetch(&metadata, conditions).await?.into_iter().next() else {
            return Err(OrmError::not_found(format!("{} {id:?}", metadata.name)));
        };
        let entities: Vec<Entity> = self
            .related(&fetched, &metadata, relation)
            .await?
            .into_iter()
            .map(|f| f.entity)
            .collect();
        Ok(if relation.is_to_one() {
            RelationValue::One(entities.into_iter().next())
        } else {
            RelationValue::Many(entities)
        })
    }
}

fn property_condition(metadata: &EntityMetadata, property: &str, value: Value) -> OrmResult<Condition> {
    let column = metadata.find_column(property).ok_or_else(|| {
        OrmError::invalid_metadata(format!("'{}' has no column '{property}'", metadata.name))
    })?;
    Ok(Condition {
        table: metadata.table_of(property).to_string(),
        column: column.name.clone(),
        value,
    })
}

fn first_identity_property(metadata: &EntityMetadata) -> OrmResult<&str> {
    metadata
        .identity_properties()
        .first()
        .map(String::as_str)
        .ok_or_else(|| OrmError::invalid_metadata(format!("'{}' has no identity", metadata.name)))
}

fn first_identity_value(entity: &Entity, metadata: &EntityMetadata) -> Option<Value> {
    let property = metadata.identity_properties().first()?;
    entity.get(property).filter(|v| v.is_set())
}

/// Physical column of the parent's first primary property.
fn parent_key_column(parent: &EntityMetadata) -> OrmResult<&str> {
    let property = first_identity_property(parent)?;
    parent
        .find_column(property)
        .map(|c| c.name.as_str())
        .ok_or_else(|| OrmError::invalid_metadata(format!("'{}' has no column '{property}'", parent.name)))
}
