use super::flatten::GraphFlattener;
use super::operate::EntityRef;
use crate::error::OrmResult;
use crate::loader::{EntityLoader, RelationPath};
use crate::metadata::MetadataRegistry;
use futures_util::future::try_join_all;

/// Loads db-side state for identified new-side entities the root graph did not reach.
pub struct MissingEntityLoader<'a> {
    registry: &'a MetadataRegistry,
    loader: &'a dyn EntityLoader,
}

impl<'a> MissingEntityLoader<'a> {
    pub fn new(registry: &'a MetadataRegistry, loader: &'a dyn EntityLoader) -> Self {
        Self { registry, loader }
    }

    /// Extend `db_refs` with the rows of every identified ref in `new_refs`
    /// that has no same-row counterpart yet.
    ///
    /// Each lookup also loads the relations the new-side instance carries, so
    /// the planner can diff them. Rows that do not exist are skipped.
    pub async fn fill(&self, new_refs: &[EntityRef], mut db_refs: Vec<EntityRef>) -> OrmResult<Vec<EntityRef>> {
        let mut missing: Vec<&EntityRef> = Vec::new();
        for candidate in new_refs {
            if !candidate.has_identity()
                || db_refs.iter().any(|db| db.same_row(candidate))
                || missing.iter().any(|m| m.same_row(candidate))
            {
                continue;
            }
            missing.push(candidate);
        }
        if missing.is_empty() {
            return Ok(db_refs);
        }

        tracing::debug!(
            target: "entigraph.persist",
            count = missing.len(),
            "loading entities missing from the db-side graph"
        );

        let loaded = try_join_all(missing.iter().map(|candidate| async move {
            let relations: Vec<RelationPath> = candidate
                .entity()
                .loaded_relations()
                .into_iter()
                .filter(|name| candidate.metadata().find_relation(name).is_some())
                .collect();
            self.loader
                .find_by_id(candidate.metadata(), &candidate.identity(), &relations)
                .await
        }))
        .await?;

        let flattener = GraphFlattener::new(self.registry);
        for (candidate, entity) in missing.into_iter().zip(loaded) {
            let Some(entity) = entity else {
                continue;
            };
            for db_ref in flattener.flatten(&entity, candidate.metadata())? {
                let known = db_refs
                    .iter()
                    .any(|existing| existing.same_instance(&db_ref) || existing.same_row(&db_ref));
                if !known {
                    db_refs.push(db_ref);
                }
            }
        }
        Ok(db_refs)
    }
}
