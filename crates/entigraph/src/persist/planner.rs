//! Diffing a new-side entity graph against its db-side counterpart.
//!
//! The planner never touches the database. It compares two flattened graphs
//! and records what has to happen; ordering is left to the executor, apart
//! from inserts (kept in discovery order) and deletions (referencing rows
//! first).

use super::operate::EntityRef;
use super::operation::{
    InsertOperation, InverseUpdateKind, JunctionEnd, JunctionInsert, JunctionRemove,
    PersistOperation, RemoveCause, RemoveKind, RemoveOperation, UpdateByInverseRelation,
    UpdateByRelation, UpdateOperation,
};
use crate::entity::{Entity, RelationValue};
use crate::error::{OrmError, OrmResult};
use crate::metadata::{ColumnKind, EntityMetadata, MetadataRegistry, RelationMetadata};
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type RowKey = (String, String);

fn row_key(entity: &EntityRef) -> Option<RowKey> {
    entity
        .has_identity()
        .then(|| (entity.target().to_string(), format!("{:?}", entity.identity())))
}

fn first_identity(metadata: &EntityMetadata) -> OrmResult<&str> {
    metadata
        .identity_properties()
        .first()
        .map(String::as_str)
        .ok_or_else(|| OrmError::planning(format!("'{}' has no identity", metadata.name)))
}

fn key_of(entity: &Entity, property: &str) -> Option<Value> {
    entity.get(property).filter(Value::is_set)
}

/// Which cascades led to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reach {
    insert: bool,
    update: bool,
}

impl Reach {
    const ROOT: Reach = Reach {
        insert: true,
        update: true,
    };

    fn union(self, other: Reach) -> Reach {
        Reach {
            insert: self.insert || other.insert,
            update: self.update || other.update,
        }
    }
}

/// Builds [`PersistOperation`]s.
#[derive(Debug, Clone)]
pub struct OperationPlanner<'a> {
    registry: &'a MetadataRegistry,
    date: DateTime<Utc>,
    insert_unmatched: bool,
}

impl<'a> OperationPlanner<'a> {
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self {
            registry,
            date: Utc::now(),
            insert_unmatched: true,
        }
    }

    /// Timestamp written to create/update date columns.
    pub fn at(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    /// Whether identified new-side entities without a db row are inserted
    /// (the default) or assumed to exist and left alone.
    pub fn insert_unmatched(mut self, enabled: bool) -> Self {
        self.insert_unmatched = enabled;
        self
    }

    /// Plan inserts, updates, junction changes, foreign key fix-ups and
    /// removals that turn the db-side graph into the new-side graph.
    pub fn build_full_persistment(
        &self,
        db_root: Option<&EntityRef>,
        new_root: &EntityRef,
        all_db: &[EntityRef],
        all_new: &[EntityRef],
    ) -> OrmResult<PersistOperation> {
        if let Some(db_root) = db_root
            && !db_root.same_row(new_root)
        {
            return Err(OrmError::planning(format!(
                "db-side root {:?} is not the row of the persisted '{}'",
                db_root.identity(),
                new_root.target()
            )));
        }

        let mut diff = Diff::new(self, all_db, all_new, false);
        diff.reach_from(new_root)?;
        diff.plan_inserts();
        diff.plan_updates()?;
        diff.plan_junctions()?;
        diff.plan_relation_fixups()?;
        diff.plan_removals()?;
        Ok(diff.finish())
    }

    /// Plan the deletion of `db_root` and whatever its cascades reach.
    ///
    /// `new_root` must already have its identity cleared.
    pub fn build_only_removement(
        &self,
        metadata: &Arc<EntityMetadata>,
        db_root: &EntityRef,
        new_root: &EntityRef,
        all_db: &[EntityRef],
        all_new: &[EntityRef],
    ) -> OrmResult<PersistOperation> {
        if db_root.target() != metadata.name {
            return Err(OrmError::planning(format!(
                "cannot remove a '{}' as '{}'",
                db_root.target(),
                metadata.name
            )));
        }
        if new_root.has_identity() {
            return Err(OrmError::planning(format!(
                "the '{}' being removed still carries its identity",
                metadata.name
            )));
        }

        let mut diff = Diff::new(self, all_db, all_new, true);
        diff.delete(db_root, None)?;
        Ok(diff.finish())
    }
}

/// Working state of one planning run.
struct Diff<'p> {
    registry: &'p MetadataRegistry,
    date: DateTime<Utc>,
    insert_unmatched: bool,
    /// The new-side graph is being removed; nothing in it survives.
    removal: bool,
    db: &'p [EntityRef],
    new: &'p [EntityRef],
    db_by_instance: HashMap<usize, usize>,
    db_by_row: HashMap<RowKey, usize>,
    new_by_instance: HashMap<usize, usize>,
    new_by_row: HashMap<RowKey, usize>,
    reach: HashMap<usize, Reach>,
    inserted: HashSet<usize>,
    plan: PersistOperation,
    cuts: Vec<RemoveOperation>,
    deletes: Vec<RemoveOperation>,
    deleted: HashMap<RowKey, usize>,
    /// `(first, then)` pairs between deletions.
    delete_edges: Vec<(usize, usize)>,
    junction_inserts: HashSet<(String, usize, usize)>,
    junction_removes: HashSet<(String, String, String)>,
    inverse_nulls: HashSet<(RowKey, String)>,
}

impl<'p> Diff<'p> {
    fn new(planner: &OperationPlanner<'p>, db: &'p [EntityRef], new: &'p [EntityRef], removal: bool) -> Self {
        fn index(refs: &[EntityRef]) -> (HashMap<usize, usize>, HashMap<RowKey, usize>) {
            let mut by_instance = HashMap::new();
            let mut by_row = HashMap::new();
            for (i, entity) in refs.iter().enumerate() {
                by_instance.entry(entity.entity().instance_key()).or_insert(i);
                if let Some(key) = row_key(entity) {
                    by_row.entry(key).or_insert(i);
                }
            }
            (by_instance, by_row)
        }

        let (db_by_instance, db_by_row) = index(db);
        let (new_by_instance, new_by_row) = index(new);
        Self {
            registry: planner.registry,
            date: planner.date,
            insert_unmatched: planner.insert_unmatched,
            removal,
            db,
            new,
            db_by_instance,
            db_by_row,
            new_by_instance,
            new_by_row,
            reach: HashMap::new(),
            inserted: HashSet::new(),
            plan: PersistOperation::default(),
            cuts: Vec::new(),
            deletes: Vec::new(),
            deleted: HashMap::new(),
            delete_edges: Vec::new(),
            junction_inserts: HashSet::new(),
            junction_removes: HashSet::new(),
            inverse_nulls: HashSet::new(),
        }
    }

    fn describe(&self, entity: &Entity) -> OrmResult<EntityRef> {
        Ok(EntityRef::new(
            self.registry.get(&entity.target())?.clone(),
            entity.clone(),
        ))
    }

    fn new_ref(&self, entity: &Entity) -> OrmResult<EntityRef> {
        match self.new_by_instance.get(&entity.instance_key()) {
            Some(&i) => Ok(self.new[i].clone()),
            None => self.describe(entity),
        }
    }

    fn db_ref(&self, entity: &Entity) -> OrmResult<EntityRef> {
        match self.db_by_instance.get(&entity.instance_key()) {
            Some(&i) => Ok(self.db[i].clone()),
            None => self.describe(entity),
        }
    }

    fn db_counterpart(&self, entity: &EntityRef) -> Option<&'p EntityRef> {
        let db = self.db;
        let i = *self.db_by_row.get(&row_key(entity)?)?;
        db.get(i)
    }

    fn new_counterpart(&self, entity: &EntityRef) -> Option<&'p EntityRef> {
        if self.removal {
            return None;
        }
        let new = self.new;
        let i = *self.new_by_row.get(&row_key(entity)?)?;
        new.get(i)
    }

    fn participates(&self, entity: &EntityRef) -> bool {
        self.reach.contains_key(&entity.entity().instance_key())
    }

    fn is_inserted(&self, entity: &Entity) -> bool {
        self.inserted.contains(&entity.instance_key())
    }

    fn contains_row(&self, items: &[Entity], entity: &EntityRef) -> OrmResult<bool> {
        for item in items {
            if item.ptr_eq(entity.entity()) || self.describe(item)?.same_row(entity) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Walk the new-side graph, following only relations that cascade.
    fn reach_from(&mut self, root: &EntityRef) -> OrmResult<()> {
        let mut work = vec![(root.clone(), Reach::ROOT)];
        while let Some((node, reach)) = work.pop() {
            let key = node.entity().instance_key();
            let previous = self.reach.get(&key).copied();
            let merged = previous.map_or(reach, |p| p.union(reach));
            if previous == Some(merged) {
                continue;
            }
            self.reach.insert(key, merged);

            for relation in node.metadata().all_relations() {
                let next = Reach {
                    insert: relation.cascade.insert,
                    update: relation.cascade.update,
                };
                if !next.insert && !next.update {
                    continue;
                }
                let Some(value) = node.entity().relation(&relation.property) else {
                    continue;
                };
                for related in value.entities() {
                    work.push((self.new_ref(&related)?, next));
                }
            }
        }
        Ok(())
    }

    fn plan_inserts(&mut self) {
        let new = self.new;
        for entity in new {
            let key = entity.entity().instance_key();
            if !self.reach.get(&key).is_some_and(|r| r.insert) || self.db_counterpart(entity).is_some() {
                continue;
            }
            if entity.has_identity() && !self.insert_unmatched {
                continue;
            }
            if self.inserted.insert(key) {
                self.plan.inserts.push(InsertOperation::new(
                    entity.entity().clone(),
                    entity.target(),
                    self.date,
                ));
            }
        }
    }

    fn plan_updates(&mut self) -> OrmResult<()> {
        let new = self.new;
        for entity in new {
            if !self
                .reach
                .get(&entity.entity().instance_key())
                .is_some_and(|r| r.update)
            {
                continue;
            }
            let Some(db) = self.db_counterpart(entity) else {
                continue;
            };
            if let Some(update) = self.diff_update(entity, db)? {
                self.plan.updates.push(update);
            }
        }
        Ok(())
    }

    fn survives(&self, db_entity: &Entity) -> OrmResult<bool> {
        Ok(self.new_counterpart(&self.db_ref(db_entity)?).is_some())
    }

    fn diff_update(&self, new: &EntityRef, db: &EntityRef) -> OrmResult<Option<UpdateOperation>> {
        let metadata = new.metadata();
        let columns: Vec<String> = metadata
            .all_columns()
            .into_iter()
            .filter(|c| !c.is_special() && !c.generated && !c.primary)
            .filter(|c| match new.entity().get(&c.property) {
                Some(value) => db.entity().get(&c.property).as_ref() != Some(&value),
                None => false,
            })
            .map(|c| c.property.clone())
            .collect();

        let mut relations = Vec::new();
        for relation in metadata.all_relations() {
            if !relation.is_owning_to_one() {
                continue;
            }
            let Some(RelationValue::One(target)) = new.entity().relation(&relation.property) else {
                continue;
            };
            // Not loaded on the db side: the stored key is unknown, not changed.
            let Some(RelationValue::One(db_target)) = db.entity().relation(&relation.property) else {
                continue;
            };
            let key_property = self.registry.referenced_property(relation)?;
            let changed = match target {
                // Without a key the target is new; a fix-up sets the column.
                Some(target) => match key_of(&target, key_property) {
                    Some(key) => db_target
                        .is_none_or(|current| current.get(key_property).as_ref() != Some(&key)),
                    None => false,
                },
                // A vanished target without cascade is nulled by its cut.
                None => match db_target {
                    Some(current) => relation.cascade.remove || self.survives(&current)?,
                    None => false,
                },
            };
            if changed {
                relations.push(relation.property.clone());
            }
        }

        if columns.is_empty() && relations.is_empty() {
            return Ok(None);
        }

        let version = metadata.special_column(ColumnKind::Version).and_then(|column| {
            new.entity()
                .get(&column.property)
                .and_then(|v| v.as_i64())
                .or_else(|| db.entity().get(&column.property).and_then(|v| v.as_i64()))
        });

        Ok(Some(UpdateOperation {
            entity: new.entity().clone(),
            target: new.target().to_string(),
            entity_id: db.identity(),
            columns,
            relations,
            date: self.date,
            version,
        }))
    }

    fn plan_junctions(&mut self) -> OrmResult<()> {
        let new = self.new;
        for entity in new {
            if !self.participates(entity) {
                continue;
            }
            let db = self.db_counterpart(entity);
            for relation in entity.metadata().all_relations() {
                if !relation.is_many_to_many() {
                    continue;
                }
                let Some(value) = entity.entity().relation(&relation.property) else {
                    continue;
                };
                let new_items = value.entities();
                let db_items = db
                    .and_then(|d| d.entity().relation(&relation.property))
                    .map(|v| v.entities())
                    .unwrap_or_default();

                for item in &new_items {
                    if !self.contains_row(&db_items, &self.new_ref(item)?)? {
                        self.junction_insert(entity, relation, item)?;
                    }
                }
                if let Some(db) = db {
                    for item in &db_items {
                        if !self.contains_row(&new_items, &self.db_ref(item)?)? {
                            self.junction_remove(db, relation, item)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn junction_insert(&mut self, source: &EntityRef, relation: &RelationMetadata, item: &Entity) -> OrmResult<()> {
        let registry = self.registry;
        let side = registry.junction(source.target(), relation)?;
        let join = side.relation.join_table.as_ref().ok_or_else(|| {
            OrmError::planning(format!("relation '{}' has no junction table", relation.property))
        })?;
        let (owner, inverse) = if side.swapped {
            (item, source.entity())
        } else {
            (source.entity(), item)
        };
        let seen = (join.name.clone(), owner.instance_key(), inverse.instance_key());
        if !self.junction_inserts.insert(seen) {
            return Ok(());
        }
        self.plan.junction_inserts.push(JunctionInsert {
            table: join.name.clone(),
            owner_column: join.owner_column.clone(),
            inverse_column: join.inverse_column.clone(),
            owner: JunctionEnd {
                entity: owner.clone(),
                target: owner.target(),
                key_property: first_identity(side.owner)?.to_string(),
            },
            inverse: JunctionEnd {
                entity: inverse.clone(),
                target: inverse.target(),
                key_property: first_identity(side.inverse)?.to_string(),
            },
        });
        Ok(())
    }

    fn junction_remove(&mut self, source: &EntityRef, relation: &RelationMetadata, item: &Entity) -> OrmResult<()> {
        let registry = self.registry;
        let side = registry.junction(source.target(), relation)?;
        let join = side.relation.join_table.as_ref().ok_or_else(|| {
            OrmError::planning(format!("relation '{}' has no junction table", relation.property))
        })?;
        let (owner, inverse) = if side.swapped {
            (item, source.entity())
        } else {
            (source.entity(), item)
        };
        let key = |entity: &Entity, metadata: &EntityMetadata| -> OrmResult<Value> {
            let property = first_identity(metadata)?;
            key_of(entity, property).ok_or_else(|| {
                OrmError::planning(format!(
                    "junction row of '{}' references a '{}' without '{property}'",
                    join.name, metadata.name
                ))
            })
        };
        let owner_id = key(owner, side.owner)?;
        let inverse_id = key(inverse, side.inverse)?;
        let seen = (join.name.clone(), format!("{owner_id:?}"), format!("{inverse_id:?}"));
        if !self.junction_removes.insert(seen) {
            return Ok(());
        }
        self.plan.junction_removes.push(JunctionRemove {
            table: join.name.clone(),
            owner_column: join.owner_column.clone(),
            inverse_column: join.inverse_column.clone(),
            owner_id,
            inverse_id,
        });
        Ok(())
    }

    /// The row of `entity` will exist once the plan's inserts ran.
    fn require_row(&self, entity: &EntityRef) -> OrmResult<()> {
        if entity.has_identity() || self.is_inserted(entity.entity()) {
            return Ok(());
        }
        Err(OrmError::planning(format!(
            "'{}' has no identity and is not being inserted",
            entity.target()
        )))
    }

    fn plan_relation_fixups(&mut self) -> OrmResult<()> {
        let new = self.new;
        for entity in new {
            if !self.participates(entity) {
                continue;
            }
            for relation in entity.metadata().all_relations() {
                if relation.is_owning_to_one() {
                    self.owning_fixup(entity, relation)?;
                } else if relation.is_inverse_side_fk() {
                    self.collection_fixups(entity, relation)?;
                }
            }
        }
        Ok(())
    }

    fn owning_fixup(&mut self, source: &EntityRef, relation: &RelationMetadata) -> OrmResult<()> {
        let Some(target) = source.entity().related_one(&relation.property) else {
            return Ok(());
        };
        let registry = self.registry;
        let key_property = registry.referenced_property(relation)?;
        if key_of(&target, key_property).is_some() {
            return Ok(());
        }
        if !self.is_inserted(&target) {
            return Err(OrmError::planning(format!(
                "{}.{} references a '{}' without '{key_property}' that is not being inserted",
                source.target(),
                relation.property,
                target.target()
            )));
        }
        self.require_row(source)?;
        self.plan.updates_by_relations.push(UpdateByRelation {
            entity: source.entity().clone(),
            target: source.target().to_string(),
            relation: relation.property.clone(),
            related_target: target.target(),
            related: target,
        });
        Ok(())
    }

    fn collection_fixups(&mut self, parent: &EntityRef, relation: &RelationMetadata) -> OrmResult<()> {
        let Some(value) = parent.entity().relation(&relation.property) else {
            return Ok(());
        };
        let registry = self.registry;
        let (_, inverse) = registry.inverse_relation(relation)?;
        let key_property = registry.referenced_property(inverse)?;
        let parent_key_known = key_of(parent.entity(), key_property).is_some();
        let db_children = self
            .db_counterpart(parent)
            .and_then(|d| d.entity().relation(&relation.property))
            .map(|v| v.entities())
            .unwrap_or_default();

        for child in value.entities() {
            // A loaded owning side on the child decides its foreign key.
            if child.relation(&inverse.property).is_some() {
                continue;
            }
            let child_ref = self.new_ref(&child)?;

            if self.is_inserted(&child) {
                if parent_key_known {
                    if let Some(insert) = self.plan.inserts.iter_mut().find(|op| op.entity.ptr_eq(&child)) {
                        insert.links.push((inverse.property.clone(), parent.entity().clone()));
                    }
                } else {
                    self.require_row(parent)?;
                    self.push_fixup(&child_ref, &inverse.property, parent);
                }
                continue;
            }

            self.require_row(&child_ref)?;
            if self.contains_row(&db_children, &child_ref)? {
                continue;
            }
            if parent_key_known {
                self.plan.updates_by_inverse_relations.push(UpdateByInverseRelation {
                    kind: InverseUpdateKind::Update,
                    entity: child.clone(),
                    target: child_ref.target().to_string(),
                    relation: inverse.property.clone(),
                    related: Some(parent.entity().clone()),
                    related_target: Some(parent.target().to_string()),
                });
            } else {
                self.require_row(parent)?;
                self.push_fixup(&child_ref, &inverse.property, parent);
            }
        }
        Ok(())
    }

    fn push_fixup(&mut self, entity: &EntityRef, relation: &str, related: &EntityRef) {
        self.plan.updates_by_relations.push(UpdateByRelation {
            entity: entity.entity().clone(),
            target: entity.target().to_string(),
            relation: relation.to_string(),
            related: related.entity().clone(),
            related_target: related.target().to_string(),
        });
    }

    /// Relation removals on rows present on both sides.
    fn plan_removals(&mut self) -> OrmResult<()> {
        let new = self.new;
        for entity in new {
            if !self.participates(entity) {
                continue;
            }
            let Some(db) = self.db_counterpart(entity) else {
                continue;
            };
            for relation in db.metadata().all_relations() {
                let Some(new_value) = entity.entity().relation(&relation.property) else {
                    continue;
                };
                let Some(db_value) = db.entity().relation(&relation.property) else {
                    continue;
                };
                let new_items = new_value.entities();
                for item in db_value.entities() {
                    let item = self.db_ref(&item)?;
                    if !self.contains_row(&new_items, &item)? {
                        self.detach(db, relation, &item)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn cause(owner: &EntityRef, relation: &RelationMetadata) -> RemoveCause {
        RemoveCause {
            target: owner.target().to_string(),
            relation: relation.property.clone(),
            entity_id: owner.identity(),
        }
    }

    /// `item` is no longer related to `owner` through `relation`.
    fn detach(&mut self, owner: &EntityRef, relation: &RelationMetadata, item: &EntityRef) -> OrmResult<()> {
        let survives = self.new_counterpart(item).is_some();
        if relation.cascade.remove && !survives {
            self.delete(item, Some(Self::cause(owner, relation)))?;
            return Ok(());
        }
        if relation.is_many_to_many() {
            return Ok(());
        }
        if relation.is_owning_to_one() {
            // A new target is written by the owner's update.
            let replaced = self
                .new_counterpart(owner)
                .and_then(|n| n.entity().related_one(&relation.property))
                .is_some();
            if !survives && !replaced {
                self.cuts.push(RemoveOperation {
                    entity: item.entity().clone(),
                    target: item.target().to_string(),
                    entity_id: item.identity(),
                    kind: RemoveKind::CutRelation,
                    cause: Some(Self::cause(owner, relation)),
                });
            }
            return Ok(());
        }
        self.null_inverse(item, relation)
    }

    /// Schedule the deletion of `target` and follow its relations.
    fn delete(&mut self, target: &EntityRef, cause: Option<RemoveCause>) -> OrmResult<usize> {
        let key = row_key(target).ok_or_else(|| {
            OrmError::planning(format!("cannot remove a '{}' without identity", target.target()))
        })?;
        if let Some(&index) = self.deleted.get(&key) {
            return Ok(index);
        }
        let index = self.deletes.len();
        self.deleted.insert(key, index);
        self.deletes.push(RemoveOperation {
            entity: target.entity().clone(),
            target: target.target().to_string(),
            entity_id: target.identity(),
            kind: RemoveKind::Delete,
            cause,
        });

        for relation in target.metadata().all_relations() {
            let Some(value) = target.entity().relation(&relation.property) else {
                continue;
            };
            for item in value.entities() {
                let item_ref = self.db_ref(&item)?;
                let cascade = relation.cascade.remove && self.new_counterpart(&item_ref).is_none();
                if relation.is_many_to_many() {
                    self.junction_remove(target, relation, &item)?;
                    if cascade {
                        self.delete(&item_ref, Some(Self::cause(target, relation)))?;
                    }
                } else if relation.is_owning_to_one() {
                    if cascade {
                        let referenced = self.delete(&item_ref, Some(Self::cause(target, relation)))?;
                        self.delete_edges.push((index, referenced));
                    }
                } else if cascade {
                    let child = self.delete(&item_ref, Some(Self::cause(target, relation)))?;
                    self.delete_edges.push((child, index));
                } else {
                    self.null_inverse(&item_ref, relation)?;
                }
            }
        }
        Ok(index)
    }

    /// Null the foreign key `child` holds for the inverse side `relation`.
    fn null_inverse(&mut self, child: &EntityRef, relation: &RelationMetadata) -> OrmResult<()> {
        let registry = self.registry;
        let (_, inverse) = registry.inverse_relation(relation)?;
        if self.reassigned(child, relation, &inverse.property) {
            return Ok(());
        }
        let key = row_key(child).ok_or_else(|| {
            OrmError::planning(format!("db-side '{}' has no identity", child.target()))
        })?;
        if !self.inverse_nulls.insert((key, inverse.property.clone())) {
            return Ok(());
        }
        self.plan.updates_by_inverse_relations.push(UpdateByInverseRelation {
            kind: InverseUpdateKind::Remove,
            entity: child.entity().clone(),
            target: child.target().to_string(),
            relation: inverse.property.clone(),
            related: None,
            related_target: None,
        });
        Ok(())
    }

    /// The new-side graph gives `child` a parent of its own.
    fn reassigned(&self, child: &EntityRef, relation: &RelationMetadata, inverse_property: &str) -> bool {
        let Some(current) = self.new_counterpart(child) else {
            return false;
        };
        if current.entity().relation(inverse_property).is_some() {
            return true;
        }
        self.new.iter().filter(|p| self.participates(p)).any(|parent| {
            parent.metadata().all_relations().into_iter().any(|r| {
                r.is_inverse_side_fk()
                    && r.target == relation.target
                    && r.inverse_property.as_deref() == Some(inverse_property)
                    && parent
                        .entity()
                        .relation(&r.property)
                        .is_some_and(|v| v.entities().iter().any(|e| e.ptr_eq(current.entity())))
            })
        })
    }

    fn finish(mut self) -> PersistOperation {
        let order = delete_order(self.deletes.len(), &self.delete_edges);
        let mut deletes: Vec<Option<RemoveOperation>> = self.deletes.into_iter().map(Some).collect();
        self.plan.removes = self.cuts;
        self.plan
            .removes
            .extend(order.into_iter().filter_map(|i| deletes.get_mut(i).and_then(Option::take)));
        self.plan
    }
}

/// Execution order of deletions: a row goes before the rows it references,
/// otherwise the latest discovered goes first, also when edges form a cycle.
pub(super) fn delete_order(count: usize, edges: &[(usize, usize)]) -> Vec<usize> {
    let mut placed = vec![false; count];
    let mut order = Vec::with_capacity(count);
    while order.len() < count {
        let ready = (0..count).rev().find(|&i| {
            !placed[i]
                && edges
                    .iter()
                    .all(|&(first, then)| then != i || first == i || placed[first])
        });
        let Some(next) = ready.or_else(|| (0..count).rev().find(|&i| !placed[i])) else {
            break;
        };
        placed[next] = true;
        order.push(next);
    }
    order
}
