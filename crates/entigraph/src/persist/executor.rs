//! Running a [`PersistOperation`] against a [`QueryRunner`].
//!
//! Phases run strictly one after another; statements inside a phase are
//! issued concurrently. In-memory entities are only touched after the
//! transaction committed.

use super::operation::{
    InsertOperation, JunctionInsert, JunctionRemove, PersistOperation, RemoveOperation,
    UpdateByInverseRelation, UpdateByRelation, UpdateOperation,
};
use crate::broadcaster::Broadcaster;
use crate::entity::{Entity, EntityId, RelationValue};
use crate::error::{OrmError, OrmResult};
use crate::metadata::{ColumnKind, EntityMetadata, MetadataRegistry, RelationMetadata};
use crate::runner::QueryRunner;
use crate::value::{Value, ValueMap};
use futures_util::future::try_join_all;
use std::collections::BTreeMap;

fn key_of(entity: &Entity, property: &str) -> Option<Value> {
    entity.get(property).filter(Value::is_set)
}

/// Key of `entity`, from the live instance or from its insert in this plan.
fn resolve_key(entity: &Entity, property: &str, inserts: &[InsertOperation]) -> OrmResult<Value> {
    if let Some(value) = key_of(entity, property) {
        return Ok(value);
    }
    inserts
        .iter()
        .find(|op| op.entity.ptr_eq(entity))
        .and_then(|op| op.entity_id.as_ref()?.get(property).cloned())
        .filter(Value::is_set)
        .ok_or_else(|| {
            OrmError::unresolved_id(format!(
                "'{}' has no '{property}' and was not inserted by this operation",
                entity.target()
            ))
        })
}

fn resolve_identity(
    entity: &Entity,
    metadata: &EntityMetadata,
    inserts: &[InsertOperation],
) -> OrmResult<EntityId> {
    metadata
        .identity_properties()
        .iter()
        .map(|property| Ok((property.clone(), resolve_key(entity, property, inserts)?)))
        .collect()
}

fn id_value(id: &EntityId, property: &str, metadata: &EntityMetadata) -> OrmResult<Value> {
    id.get(property).filter(|v| v.is_set()).cloned().ok_or_else(|| {
        OrmError::unresolved_id(format!("'{}' id is missing '{property}'", metadata.name))
    })
}

fn column_name<'m>(metadata: &'m EntityMetadata, property: &str) -> OrmResult<&'m str> {
    metadata
        .find_column(property)
        .map(|c| c.name.as_str())
        .ok_or_else(|| OrmError::invalid_metadata(format!("'{}' has no column '{property}'", metadata.name)))
}

/// Equality conditions selecting the row of `id` in `table`, one of the
/// physical tables of `metadata`.
fn row_conditions(metadata: &EntityMetadata, table: &str, id: &EntityId) -> OrmResult<ValueMap> {
    let mut conditions = ValueMap::new();
    match (metadata.parent(), metadata.parent_id_column()) {
        (Some(parent), _) if table != metadata.table => {
            for property in parent.identity_properties() {
                conditions.insert(
                    column_name(parent, property)?.to_string(),
                    id_value(id, property, metadata)?,
                );
            }
        }
        (Some(parent), Some(parent_id_column)) => {
            let first = parent.identity_properties().first().ok_or_else(|| {
                OrmError::invalid_metadata(format!("'{}' has no identity", parent.name))
            })?;
            conditions.insert(parent_id_column.to_string(), id_value(id, first, metadata)?);
            for column in metadata.own_primary_columns() {
                conditions.insert(column.name.clone(), id_value(id, &column.property, metadata)?);
            }
        }
        _ => {
            for property in metadata.identity_properties() {
                conditions.insert(
                    column_name(metadata, property)?.to_string(),
                    id_value(id, property, metadata)?,
                );
            }
        }
    }
    Ok(conditions)
}

fn join_column<'m>(relation: &'m RelationMetadata) -> OrmResult<&'m str> {
    relation.join_column.as_deref().ok_or_else(|| {
        OrmError::invalid_metadata(format!("relation '{}' has no join column", relation.property))
    })
}

fn find_relation<'m>(metadata: &'m EntityMetadata, property: &str) -> OrmResult<&'m RelationMetadata> {
    metadata.find_relation(property).ok_or_else(|| {
        OrmError::invalid_metadata(format!("'{}' has no relation '{property}'", metadata.name))
    })
}

/// Parent of a new tree node: its own relation slot, else the parent whose
/// collection placed it there (an insert link or a foreign key fix-up).
fn tree_parent_of(op: &InsertOperation, relation: &RelationMetadata, fixups: &[UpdateByRelation]) -> Option<Entity> {
    if let Some(parent) = op.entity.related_one(&relation.property) {
        return Some(parent);
    }
    if let Some((_, parent)) = op.links.iter().find(|(property, _)| *property == relation.property) {
        return Some(parent.clone());
    }
    fixups
        .iter()
        .find(|fixup| fixup.entity.ptr_eq(&op.entity) && fixup.relation == relation.property)
        .map(|fixup| fixup.related.clone())
}

fn discriminator(metadata: &EntityMetadata) -> Value {
    Value::Text(
        metadata
            .discriminator_value
            .clone()
            .unwrap_or_else(|| metadata.name.clone()),
    )
}

/// Executes persist plans on one runner.
pub struct OperationExecutor<'a, R> {
    runner: &'a R,
    registry: &'a MetadataRegistry,
    broadcaster: &'a Broadcaster,
}

impl<'a, R: QueryRunner> OperationExecutor<'a, R> {
    pub fn new(runner: &'a R, registry: &'a MetadataRegistry, broadcaster: &'a Broadcaster) -> Self {
        Self {
            runner,
            registry,
            broadcaster,
        }
    }

    /// Run `plan`, committing only a transaction this call opened.
    ///
    /// On failure an owned transaction is rolled back and the original error
    /// is returned; entities are left without written-back values.
    pub async fn execute(&self, plan: &mut PersistOperation) -> OrmResult<()> {
        self.broadcast_before(plan).await?;

        let owns_transaction = !self.runner.is_transaction_active();
        if owns_transaction {
            self.runner.begin_transaction().await?;
        }
        tracing::debug!(target: "entigraph.persist", owns_transaction, "executing persist plan");

        let result = match self.execute_statements(plan).await {
            Ok(()) if owns_transaction => self.runner.commit_transaction().await,
            other => other,
        };
        if let Err(err) = result {
            if owns_transaction && self.runner.is_transaction_active() {
                if let Err(rollback_err) = self.runner.rollback_transaction().await {
                    tracing::warn!(
                        target: "entigraph.persist",
                        error = %rollback_err,
                        "rollback after failed persist failed"
                    );
                }
            }
            tracing::debug!(target: "entigraph.persist", error = %err, owns_transaction, "persist plan failed");
            return Err(err);
        }

        self.write_back(plan);
        self.broadcast_after(plan).await
    }

    async fn execute_statements(&self, plan: &mut PersistOperation) -> OrmResult<()> {
        try_join_all(plan.inserts.iter_mut().map(|op| self.execute_insert(op))).await?;
        self.execute_closure_inserts(&mut plan.inserts, &plan.updates_by_relations)
            .await?;
        self.execute_tree_levels(&plan.inserts).await?;

        let inserts = plan.inserts.as_slice();
        try_join_all(
            plan.junction_inserts
                .iter()
                .map(|junction| self.execute_junction_insert(junction, inserts)),
        )
        .await?;
        try_join_all(plan.junction_removes.iter().map(|junction| self.execute_junction_remove(junction)))
            .await?;
        try_join_all(plan.cuts().map(|cut| self.execute_cut(cut))).await?;
        try_join_all(
            plan.updates_by_relations
                .iter()
                .map(|fixup| self.execute_relation_fixup(fixup, inserts)),
        )
        .await?;
        try_join_all(
            plan.updates_by_inverse_relations
                .iter()
                .map(|fixup| self.execute_inverse_fixup(fixup, inserts)),
        )
        .await?;
        try_join_all(plan.updates.iter().map(|update| self.execute_update(update, inserts))).await?;

        // Sequential: the planner ordered referencing rows first.
        for remove in plan.deletes() {
            self.execute_delete(remove).await?;
        }
        Ok(())
    }

    /// Column values of the rows `metadata` declares itself (not inherited).
    fn row_values(
        &self,
        metadata: &EntityMetadata,
        owner: &EntityMetadata,
        op: &InsertOperation,
    ) -> OrmResult<ValueMap> {
        let mut values = ValueMap::new();
        for column in &metadata.columns {
            let value = match column.kind {
                ColumnKind::CreateDate | ColumnKind::UpdateDate => Some(Value::Timestamp(op.date)),
                ColumnKind::Version => Some(Value::Int(1)),
                ColumnKind::Discriminator => Some(discriminator(owner)),
                ColumnKind::TreeLevel => None,
                ColumnKind::Regular => op
                    .entity
                    .get(&column.property)
                    .filter(|v| !column.generated || v.is_set()),
            };
            if let Some(value) = value {
                values.insert(column.name.clone(), value);
            }
        }

        for relation in metadata.relations.iter().filter(|r| r.is_owning_to_one()) {
            let Some(RelationValue::One(target)) = op.entity.relation(&relation.property) else {
                continue;
            };
            let column = join_column(relation)?;
            match target {
                None => {
                    values.insert(column.to_string(), Value::Null);
                }
                Some(target) => {
                    let key_property = self.registry.referenced_property(relation)?;
                    if let Some(key) = key_of(&target, key_property) {
                        values.insert(column.to_string(), key);
                    }
                }
            }
        }

        for (property, parent) in &op.links {
            let Some(relation) = metadata.relations.iter().find(|r| &r.property == property) else {
                continue;
            };
            let key_property = self.registry.referenced_property(relation)?;
            if let Some(key) = key_of(parent, key_property) {
                values.insert(join_column(relation)?.to_string(), key);
            }
        }
        Ok(values)
    }

    async fn execute_insert(&self, op: &mut InsertOperation) -> OrmResult<()> {
        let metadata = self.registry.get(&op.target)?;
        let mut id = op.entity.id_of(metadata.identity_properties());

        if let Some(parent) = metadata.parent() {
            let values = self.row_values(parent, metadata, op)?;
            let generated = parent.generated_column();
            let value = self
                .runner
                .insert(&parent.table, &values, generated.map(|c| c.name.as_str()))
                .await?;
            if let (Some(column), Some(value)) = (generated, value) {
                id.insert(column.property.clone(), value);
            }

            let mut values = self.row_values(metadata, metadata, op)?;
            if let Some(parent_id_column) = metadata.parent_id_column() {
                let first = parent.identity_properties().first().ok_or_else(|| {
                    OrmError::invalid_metadata(format!("'{}' has no identity", parent.name))
                })?;
                values.insert(parent_id_column.to_string(), id_value(&id, first, parent)?);
            }
            let generated = metadata.generated_column();
            let value = self
                .runner
                .insert(&metadata.table, &values, generated.map(|c| c.name.as_str()))
                .await?;
            if let (Some(column), Some(value)) = (generated, value) {
                id.insert(column.property.clone(), value);
            }
        } else {
            let values = self.row_values(metadata, metadata, op)?;
            let generated = metadata.generated_column();
            let value = self
                .runner
                .insert(&metadata.table, &values, generated.map(|c| c.name.as_str()))
                .await?;
            if let (Some(column), Some(value)) = (generated, value) {
                id.insert(column.property.clone(), value);
            }
        }

        op.entity_id = Some(id);
        Ok(())
    }

    /// Closure rows for new tree nodes, in rounds so a parent inserted by
    /// this plan gets its rows before its children.
    async fn execute_closure_inserts(
        &self,
        inserts: &mut [InsertOperation],
        fixups: &[UpdateByRelation],
    ) -> OrmResult<()> {
        let mut pending = Vec::new();
        for (i, op) in inserts.iter().enumerate() {
            if self.registry.get(&op.target)?.is_closure() {
                pending.push(i);
            }
        }

        while !pending.is_empty() {
            let mut jobs = Vec::new();
            let mut waiting = Vec::new();
            for &i in &pending {
                let op = &inserts[i];
                let metadata = self.registry.get(&op.target)?;
                let tree_parent = metadata
                    .tree_parent_relation()
                    .and_then(|r| Some((r, tree_parent_of(op, r, fixups)?)));
                let parent_pending = tree_parent.as_ref().is_some_and(|(_, parent)| {
                    pending
                        .iter()
                        .any(|&j| j != i && inserts[j].entity.ptr_eq(parent))
                });
                if parent_pending {
                    waiting.push(i);
                    continue;
                }

                let closure_table = metadata.closure_table().unwrap_or_default().to_string();
                let key_property = metadata.identity_properties().first().ok_or_else(|| {
                    OrmError::invalid_metadata(format!("'{}' has no identity", metadata.name))
                })?;
                let descendant = resolve_key(&op.entity, key_property, inserts)?;
                let ancestor = match &tree_parent {
                    Some((relation, parent)) => Some(resolve_key(
                        parent,
                        self.registry.referenced_property(relation)?,
                        inserts,
                    )?),
                    None => None,
                };
                let has_level = metadata.special_column(ColumnKind::TreeLevel).is_some();
                jobs.push((i, closure_table, descendant, ancestor, has_level));
            }

            if jobs.is_empty() {
                return Err(OrmError::unresolved_id(
                    "tree parents of the inserted entities form a cycle",
                ));
            }

            let levels = try_join_all(jobs.iter().map(
                |(i, table, descendant, ancestor, has_level)| async move {
                    let level = self
                        .runner
                        .insert_into_closure_table(table, descendant, ancestor.as_ref(), *has_level)
                        .await?;
                    Ok::<_, OrmError>((*i, level))
                },
            ))
            .await?;
            for (i, level) in levels {
                if let Some(op) = inserts.get_mut(i) {
                    op.tree_level = Some(level);
                }
            }
            pending = waiting;
        }
        Ok(())
    }

    async fn execute_tree_levels(&self, inserts: &[InsertOperation]) -> OrmResult<()> {
        let mut jobs = Vec::new();
        for op in inserts {
            let Some(level) = op.tree_level else {
                continue;
            };
            let metadata = self.registry.get(&op.target)?;
            let Some(column) = metadata.special_column(ColumnKind::TreeLevel) else {
                continue;
            };
            let table = metadata.table_of(&column.property);
            let id = op.entity_id.clone().unwrap_or_default();
            let conditions = row_conditions(metadata, table, &id)?;
            let mut values = ValueMap::new();
            values.insert(column.name.clone(), Value::Int(level));
            jobs.push((table, values, conditions));
        }
        try_join_all(
            jobs.iter()
                .map(|(table, values, conditions)| self.runner.update(table, values, conditions)),
        )
        .await?;
        Ok(())
    }

    async fn execute_junction_insert(&self, junction: &JunctionInsert, inserts: &[InsertOperation]) -> OrmResult<()> {
        let mut values = ValueMap::new();
        values.insert(
            junction.owner_column.clone(),
            resolve_key(&junction.owner.entity, &junction.owner.key_property, inserts)?,
        );
        values.insert(
            junction.inverse_column.clone(),
            resolve_key(&junction.inverse.entity, &junction.inverse.key_property, inserts)?,
        );
        self.runner.insert(&junction.table, &values, None).await?;
        Ok(())
    }

    async fn execute_junction_remove(&self, junction: &JunctionRemove) -> OrmResult<()> {
        let mut conditions = ValueMap::new();
        conditions.insert(junction.owner_column.clone(), junction.owner_id.clone());
        conditions.insert(junction.inverse_column.clone(), junction.inverse_id.clone());
        self.runner.delete(&junction.table, &conditions).await?;
        Ok(())
    }

    /// Null the owner's foreign key to a row that left the graph.
    async fn execute_cut(&self, cut: &RemoveOperation) -> OrmResult<()> {
        let Some(cause) = &cut.cause else {
            return Ok(());
        };
        let owner = self.registry.get(&cause.target)?;
        let relation = find_relation(owner, &cause.relation)?;
        let table = owner.table_of(&relation.property);
        let mut values = ValueMap::new();
        values.insert(join_column(relation)?.to_string(), Value::Null);
        let conditions = row_conditions(owner, table, &cause.entity_id)?;
        self.runner.update(table, &values, &conditions).await?;
        Ok(())
    }

    async fn set_foreign_key(
        &self,
        entity: &Entity,
        target: &str,
        relation: &str,
        key: Option<Value>,
        inserts: &[InsertOperation],
    ) -> OrmResult<()> {
        let metadata = self.registry.get(target)?;
        let relation = find_relation(metadata, relation)?;
        let table = metadata.table_of(&relation.property);
        let id = resolve_identity(entity, metadata, inserts)?;
        let mut values = ValueMap::new();
        values.insert(join_column(relation)?.to_string(), key.unwrap_or(Value::Null));
        self.runner
            .update(table, &values, &row_conditions(metadata, table, &id)?)
            .await?;
        Ok(())
    }

    async fn execute_relation_fixup(&self, fixup: &UpdateByRelation, inserts: &[InsertOperation]) -> OrmResult<()> {
        let metadata = self.registry.get(&fixup.target)?;
        let relation = find_relation(metadata, &fixup.relation)?;
        let key = resolve_key(
            &fixup.related,
            self.registry.referenced_property(relation)?,
            inserts,
        )?;
        self.set_foreign_key(&fixup.entity, &fixup.target, &fixup.relation, Some(key), inserts)
            .await
    }

    async fn execute_inverse_fixup(
        &self,
        fixup: &UpdateByInverseRelation,
        inserts: &[InsertOperation],
    ) -> OrmResult<()> {
        let key = match &fixup.related {
            Some(related) => {
                let metadata = self.registry.get(&fixup.target)?;
                let relation = find_relation(metadata, &fixup.relation)?;
                Some(resolve_key(
                    related,
                    self.registry.referenced_property(relation)?,
                    inserts,
                )?)
            }
            None => None,
        };
        self.set_foreign_key(&fixup.entity, &fixup.target, &fixup.relation, key, inserts)
            .await
    }

    async fn execute_update(&self, update: &UpdateOperation, inserts: &[InsertOperation]) -> OrmResult<()> {
        let metadata = self.registry.get(&update.target)?;
        let mut tables: BTreeMap<&str, ValueMap> = BTreeMap::new();

        for property in &update.columns {
            let value = update.entity.get(property).unwrap_or(Value::Null);
            tables
                .entry(metadata.table_of(property))
                .or_default()
                .insert(column_name(metadata, property)?.to_string(), value);
        }
        for property in &update.relations {
            let relation = find_relation(metadata, property)?;
            let value = match update.entity.related_one(property) {
                Some(target) => resolve_key(&target, self.registry.referenced_property(relation)?, inserts)?,
                None => Value::Null,
            };
            tables
                .entry(metadata.table_of(property))
                .or_default()
                .insert(join_column(relation)?.to_string(), value);
        }
        if let Some(column) = metadata.special_column(ColumnKind::UpdateDate) {
            tables
                .entry(metadata.table_of(&column.property))
                .or_default()
                .insert(column.name.clone(), Value::Timestamp(update.date));
        }
        let mut expected = None;
        if let Some(column) = metadata.special_column(ColumnKind::Version) {
            let table = metadata.table_of(&column.property);
            tables
                .entry(table)
                .or_default()
                .insert(column.name.clone(), Value::Int(update.version.map_or(1, |v| v + 1)));
            expected = update.version.map(|v| (table, column.name.as_str(), v));
        }

        try_join_all(tables.iter().map(|(&table, values)| async move {
            let mut conditions = row_conditions(metadata, table, &update.entity_id)?;
            let version = expected.filter(|(t, _, _)| *t == table);
            if let Some((_, column, version)) = version {
                conditions.insert(column.to_string(), Value::Int(version));
            }
            let affected = self.runner.update(table, values, &conditions).await?;
            match version {
                Some((_, _, expected_version)) if affected == 0 => Err(OrmError::StaleRecord {
                    table: table.to_string(),
                    expected_version,
                }),
                _ => Ok::<(), OrmError>(()),
            }
        }))
        .await?;
        Ok(())
    }

    async fn execute_delete(&self, remove: &RemoveOperation) -> OrmResult<()> {
        let metadata = self.registry.get(&remove.target)?;
        self.runner
            .delete(
                &metadata.table,
                &row_conditions(metadata, &metadata.table, &remove.entity_id)?,
            )
            .await?;
        // Child row first, then the parent row it references.
        if let Some(parent) = metadata.parent() {
            self.runner
                .delete(
                    &parent.table,
                    &row_conditions(metadata, &parent.table, &remove.entity_id)?,
                )
                .await?;
        }
        Ok(())
    }

    fn write_back(&self, plan: &PersistOperation) {
        for op in &plan.inserts {
            let Ok(metadata) = self.registry.get(&op.target) else {
                continue;
            };
            for (property, value) in op.entity_id.iter().flatten() {
                op.entity.set(property.clone(), value.clone());
            }
            for column in metadata.all_columns() {
                match column.kind {
                    ColumnKind::CreateDate | ColumnKind::UpdateDate => {
                        op.entity.set(&column.property, Value::Timestamp(op.date))
                    }
                    ColumnKind::Version => op.entity.set(&column.property, Value::Int(1)),
                    ColumnKind::Discriminator => op.entity.set(&column.property, discriminator(metadata)),
                    ColumnKind::TreeLevel => {
                        if let Some(level) = op.tree_level {
                            op.entity.set(&column.property, Value::Int(level));
                        }
                    }
                    ColumnKind::Regular => {}
                }
            }
        }

        for op in &plan.updates {
            let Ok(metadata) = self.registry.get(&op.target) else {
                continue;
            };
            if let Some(column) = metadata.special_column(ColumnKind::UpdateDate) {
                op.entity.set(&column.property, Value::Timestamp(op.date));
            }
            if let Some(column) = metadata.special_column(ColumnKind::Version) {
                op.entity
                    .set(&column.property, Value::Int(op.version.map_or(1, |v| v + 1)));
            }
        }

        for op in plan.deletes() {
            let Ok(metadata) = self.registry.get(&op.target) else {
                continue;
            };
            for property in metadata.identity_properties() {
                op.entity.unset(property);
            }
        }
    }

    async fn broadcast_before(&self, plan: &PersistOperation) -> OrmResult<()> {
        let inserts = try_join_all(plan.inserts.iter().map(|op| async move {
            let metadata = self.registry.get(&op.target)?;
            self.broadcaster.before_insert(metadata, &op.entity).await
        }));
        let updates = try_join_all(plan.updates.iter().map(|op| async move {
            let metadata = self.registry.get(&op.target)?;
            self.broadcaster
                .before_update(metadata, &op.entity, &op.changed())
                .await
        }));
        let removes = try_join_all(plan.removes.iter().map(|op| async move {
            let metadata = self.registry.get(&op.target)?;
            self.broadcaster
                .before_remove(metadata, &op.entity, &op.entity_id, op.is_delete())
                .await
        }));
        futures_util::try_join!(inserts, updates, removes)?;
        Ok(())
    }

    async fn broadcast_after(&self, plan: &PersistOperation) -> OrmResult<()> {
        let inserts = try_join_all(plan.inserts.iter().map(|op| async move {
            let metadata = self.registry.get(&op.target)?;
            self.broadcaster.after_insert(metadata, &op.entity).await
        }));
        let updates = try_join_all(plan.updates.iter().map(|op| async move {
            let metadata = self.registry.get(&op.target)?;
            self.broadcaster
                .after_update(metadata, &op.entity, &op.changed())
                .await
        }));
        let removes = try_join_all(plan.removes.iter().map(|op| async move {
            let metadata = self.registry.get(&op.target)?;
            self.broadcaster
                .after_remove(metadata, &op.entity, &op.entity_id, op.is_delete())
                .await
        }));
        futures_util::try_join!(inserts, updates, removes)?;
        Ok(())
    }
}
