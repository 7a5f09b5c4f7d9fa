use super::executor::OperationExecutor;
use super::flatten::GraphFlattener;
use super::missing::MissingEntityLoader;
use super::operate::EntityRef;
use super::operation::PersistOperation;
use super::planner::OperationPlanner;
use crate::broadcaster::Broadcaster;
use crate::entity::{Entity, EntityId, RelationValue};
use crate::error::{OrmError, OrmResult};
use crate::loader::{EntityLoader, RelationPath};
use crate::metadata::{EntityMetadata, MetadataRegistry};
use crate::runner::QueryRunner;
use futures_util::future::try_join_all;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Persists and removes entity graphs on one runner.
///
/// Transactions are only opened when the runner has none active, so a
/// persister can run inside a caller's transaction.
pub struct EntityPersister<'a, R> {
    registry: &'a MetadataRegistry,
    broadcaster: &'a Broadcaster,
    runner: &'a R,
    loader: &'a dyn EntityLoader,
    load_missing: bool,
}

impl<'a, R: QueryRunner> EntityPersister<'a, R> {
    pub fn new(
        registry: &'a MetadataRegistry,
        broadcaster: &'a Broadcaster,
        runner: &'a R,
        loader: &'a dyn EntityLoader,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            runner,
            loader,
            load_missing: true,
        }
    }

    /// Look up db rows for identified entities the root graph did not reach.
    pub fn load_missing(mut self, enabled: bool) -> Self {
        self.load_missing = enabled;
        self
    }

    /// Insert or update `entity` and everything its cascades reach.
    pub async fn persist(&self, entity: &Entity) -> OrmResult<Entity> {
        let metadata = self.registry.get(&entity.target())?.clone();
        let flattener = GraphFlattener::new(self.registry);
        let new_root = EntityRef::new(metadata.clone(), entity.clone());
        let new_refs = flattener.flatten(entity, &metadata)?;

        let mut db_root = None;
        let mut db_refs = Vec::new();
        if new_root.has_identity() {
            let paths = self.relation_paths(entity, &metadata)?;
            if let Some(db) = self.loader.find_by_id(&metadata, &new_root.identity(), &paths).await? {
                db_refs = flattener.flatten(&db, &metadata)?;
                db_root = Some(EntityRef::new(metadata.clone(), db));
            }
        }
        if self.load_missing {
            db_refs = MissingEntityLoader::new(self.registry, self.loader)
                .fill(&new_refs, db_refs)
                .await?;
        }
        db_refs = self.complete_db_side(&new_refs, db_refs).await?;

        let mut plan = OperationPlanner::new(self.registry)
            .insert_unmatched(self.load_missing)
            .build_full_persistment(db_root.as_ref(), &new_root, &db_refs, &new_refs)?;
        self.run(&mut plan, &new_refs, new_root.target()).await?;
        Ok(entity.clone())
    }

    /// Delete `entity`'s row and whatever its remove cascades reach.
    ///
    /// The identity of `entity` is cleared before the plan runs.
    pub async fn remove(&self, entity: &Entity) -> OrmResult<Entity> {
        let metadata = self.registry.get(&entity.target())?.clone();
        let new_root = EntityRef::new(metadata.clone(), entity.clone());
        if !new_root.has_identity() {
            return Err(OrmError::planning(format!(
                "cannot remove a '{}' without identity",
                metadata.name
            )));
        }
        let id = new_root.identity();
        let db = self
            .load_removal_graph(&metadata, &id)
            .await?
            .ok_or_else(|| OrmError::not_found(format!("{} {id:?}", metadata.name)))?;

        for property in metadata.identity_properties() {
            entity.unset(property);
        }

        let flattener = GraphFlattener::new(self.registry);
        let db_refs = flattener.flatten(&db, &metadata)?;
        let new_refs = flattener.flatten(entity, &metadata)?;
        let db_root = EntityRef::new(metadata.clone(), db);
        let mut plan = OperationPlanner::new(self.registry).build_only_removement(
            &metadata,
            &db_root,
            &new_root,
            &db_refs,
            &new_refs,
        )?;
        self.run(&mut plan, &new_refs, &metadata.name).await?;
        Ok(entity.clone())
    }

    async fn run(&self, plan: &mut PersistOperation, new_refs: &[EntityRef], target: &str) -> OrmResult<()> {
        let summary = plan.summary();
        if plan.is_empty() {
            tracing::debug!(target: "entigraph.persist", entity = target, "nothing to persist");
            return Ok(());
        }
        tracing::debug!(target: "entigraph.persist", entity = target, %summary, "persist plan built");

        OperationExecutor::new(self.runner, self.registry, self.broadcaster)
            .execute(plan)
            .await?;
        detach_removed(plan, new_refs);
        Ok(())
    }

    /// Relation paths loaded on the new-side graph, at any depth.
    ///
    /// Instances are expanded once, at the shortest path reaching them, so
    /// cycles through self-referencing relations end.
    fn relation_paths(&self, entity: &Entity, metadata: &Arc<EntityMetadata>) -> OrmResult<Vec<RelationPath>> {
        let mut out = BTreeSet::new();
        let mut visited = HashSet::from([entity.instance_key()]);
        let mut work = VecDeque::from([(entity.clone(), metadata.clone(), String::new())]);

        while let Some((entity, metadata, prefix)) = work.pop_front() {
            for relation in metadata.all_relations() {
                let Some(value) = entity.relation(&relation.property) else {
                    continue;
                };
                let path = if prefix.is_empty() {
                    relation.property.clone()
                } else {
                    format!("{prefix}.{}", relation.property)
                };
                out.insert(path.clone());

                let target = self.registry.get(&relation.target)?;
                for related in value.entities() {
                    if visited.insert(related.instance_key()) {
                        work.push_back((related, target.clone(), path.clone()));
                    }
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Load db-side relations that are loaded on the matching new-side
    /// instance but were not reached by the path walk.
    ///
    /// Newly loaded rows join `db_refs` and are checked in turn.
    async fn complete_db_side(
        &self,
        new_refs: &[EntityRef],
        mut db_refs: Vec<EntityRef>,
    ) -> OrmResult<Vec<EntityRef>> {
        let flattener = GraphFlattener::new(self.registry);
        loop {
            let mut by_row: HashMap<(String, String), usize> = HashMap::new();
            for (i, db) in db_refs.iter().enumerate() {
                if db.has_identity() {
                    by_row
                        .entry((db.target().to_string(), format!("{:?}", db.identity())))
                        .or_insert(i);
                }
            }

            let mut seen = HashSet::new();
            let mut pending = Vec::new();
            for new in new_refs.iter().filter(|n| n.has_identity()) {
                let Some(&i) = by_row.get(&(new.target().to_string(), format!("{:?}", new.identity()))) else {
                    continue;
                };
                let db = &db_refs[i];
                for relation in db.metadata().all_relations() {
                    if new.entity().relation(&relation.property).is_some()
                        && db.entity().relation(&relation.property).is_none()
                        && seen.insert((db.entity().instance_key(), relation.property.clone()))
                    {
                        pending.push((db.clone(), relation.property.clone()));
                    }
                }
            }
            if pending.is_empty() {
                return Ok(db_refs);
            }

            tracing::debug!(
                target: "entigraph.persist",
                count = pending.len(),
                "loading db-side relations missing from the loaded graph"
            );
            let loaded = try_join_all(pending.iter().map(|(db, property)| async move {
                let id = db.identity();
                self.loader.load_relation(db.metadata(), &id, property).await
            }))
            .await?;

            let mut known: HashSet<usize> = db_refs.iter().map(|d| d.entity().instance_key()).collect();
            for ((db, property), value) in pending.iter().zip(loaded) {
                let related = value.entities();
                match value {
                    RelationValue::One(one) => db.entity().set_one(property.clone(), one),
                    RelationValue::Many(many) => db.entity().set_many(property.clone(), many),
                }
                for entity in related {
                    let metadata = self.registry.get(&entity.target())?.clone();
                    for db_ref in flattener.flatten(&entity, &metadata)? {
                        if known.insert(db_ref.entity().instance_key()) {
                            db_refs.push(db_ref);
                        }
                    }
                }
            }
        }
    }

    /// Load the row with every relation, following remove cascades to any depth.
    async fn load_removal_graph(&self, metadata: &Arc<EntityMetadata>, id: &EntityId) -> OrmResult<Option<Entity>> {
        let paths: Vec<RelationPath> = metadata
            .all_relations()
            .into_iter()
            .map(|r| r.property.clone())
            .collect();
        let Some(root) = self.loader.find_by_id(metadata, id, &paths).await? else {
            return Ok(None);
        };

        let mut seen = HashSet::from([root.instance_key()]);
        let mut stack = vec![(root.clone(), metadata.clone())];
        while let Some((entity, metadata)) = stack.pop() {
            let id = entity.id_of(metadata.identity_properties());
            let unloaded: Vec<_> = metadata
                .all_relations()
                .into_iter()
                .filter(|r| entity.relation(&r.property).is_none())
                .collect();
            let loaded = try_join_all(
                unloaded
                    .iter()
                    .map(|r| self.loader.load_relation(&metadata, &id, &r.property)),
            )
            .await?;
            for (relation, value) in unloaded.iter().zip(loaded) {
                match value {
                    RelationValue::One(related) => entity.set_one(relation.property.clone(), related),
                    RelationValue::Many(related) => entity.set_many(relation.property.clone(), related),
                }
            }

            for relation in metadata.all_relations() {
                if !relation.cascade.remove {
                    continue;
                }
                let Some(value) = entity.relation(&relation.property) else {
                    continue;
                };
                for related in value.entities() {
                    if seen.insert(related.instance_key()) {
                        let target = self.registry.get(&related.target())?.clone();
                        stack.push((related, target));
                    }
                }
            }
        }
        Ok(Some(root))
    }
}

/// Clear the identity of caller-side instances whose rows were deleted.
fn detach_removed(plan: &PersistOperation, new_refs: &[EntityRef]) {
    for removed in plan.deletes() {
        for new_ref in new_refs {
            if new_ref.same_row_as(&removed.target, &removed.entity_id) {
                for property in new_ref.metadata().identity_properties() {
                    new_ref.entity().unset(property);
                }
            }
        }
    }
}
