use super::operate::EntityRef;
use crate::entity::Entity;
use crate::error::OrmResult;
use crate::metadata::{EntityMetadata, MetadataRegistry};
use std::collections::HashSet;
use std::sync::Arc;

/// Collects every entity instance reachable from a root through loaded relations.
#[derive(Debug, Clone, Copy)]
pub struct GraphFlattener<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> GraphFlattener<'a> {
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Depth-first, root first; each instance appears once.
    ///
    /// Related instances are described by their own entity name, so a relation
    /// to a class-table parent may yield child refs.
    pub fn flatten(&self, root: &Entity, metadata: &Arc<EntityMetadata>) -> OrmResult<Vec<EntityRef>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![EntityRef::new(metadata.clone(), root.clone())];

        while let Some(current) = stack.pop() {
            if !seen.insert(current.entity().instance_key()) {
                continue;
            }
            let mut children = Vec::new();
            for relation in current.metadata().all_relations() {
                let Some(value) = current.entity().relation(&relation.property) else {
                    continue;
                };
                for related in value.entities() {
                    if seen.contains(&related.instance_key()) {
                        continue;
                    }
                    let related_metadata = self.registry.get(&related.target())?;
                    children.push(EntityRef::new(related_metadata.clone(), related));
                }
            }
            // Reversed so the first declared relation is visited first.
            stack.extend(children.into_iter().rev());
            out.push(current);
        }
        Ok(out)
    }
}
