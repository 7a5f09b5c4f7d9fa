//! Dynamic entity records.
//!
//! An [`Entity`] is a shared handle to a record of property values and
//! relation slots. Cloning the handle does not copy the record: two handles
//! are the same instance iff [`Entity::ptr_eq`] holds, which is what graph
//! traversal uses to detect cycles.

use crate::value::{Value, ValueMap};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Identity property name to value.
pub type EntityId = ValueMap;

/// Value held by a loaded relation slot.
#[derive(Debug, Clone)]
pub enum RelationValue {
    /// To-one side; `None` is an explicit "no related entity".
    One(Option<Entity>),
    /// Collection side.
    Many(Vec<Entity>),
}

impl RelationValue {
    /// Related entities in declaration order.
    pub fn entities(&self) -> Vec<Entity> {
        match self {
            RelationValue::One(v) => v.iter().cloned().collect(),
            RelationValue::Many(v) => v.clone(),
        }
    }
}

/// State of one relation on an entity.
#[derive(Debug, Clone)]
pub enum RelationSlot {
    /// Lazy relation not fetched yet.
    Unloaded,
    /// A load is in flight; the receiver flips to `true` once it settles.
    Loading(watch::Receiver<bool>),
    Loaded(RelationValue),
}

struct EntityState {
    target: String,
    values: ValueMap,
    relations: BTreeMap<String, RelationSlot>,
}

/// Shared handle to an entity record.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<RwLock<EntityState>>,
}

impl Entity {
    /// Create an empty record of entity type `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EntityState {
                target: target.into(),
                values: ValueMap::new(),
                relations: BTreeMap::new(),
            })),
        }
    }

    /// Set a property and return the handle (builder style).
    pub fn with(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    /// Set a to-one relation and return the handle.
    pub fn with_one(self, property: impl Into<String>, related: Entity) -> Self {
        self.set_one(property, Some(related));
        self
    }

    /// Set a collection relation and return the handle.
    pub fn with_many(self, property: impl Into<String>, related: Vec<Entity>) -> Self {
        self.set_many(property, related);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self) -> String {
        self.read().target.clone()
    }

    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address of the shared record; equal for handles of the same instance.
    pub(crate) fn instance_key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Property value; `None` when the property was never set.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.read().values.get(property).cloned()
    }

    pub fn set(&self, property: impl Into<String>, value: impl Into<Value>) {
        self.write().values.insert(property.into(), value.into());
    }

    /// Forget a property so it reads as never set.
    pub fn unset(&self, property: &str) {
        self.write().values.remove(property);
    }

    pub fn values(&self) -> ValueMap {
        self.read().values.clone()
    }

    /// Values of `properties`, skipping the ones that are unset or null.
    pub fn id_of(&self, properties: &[String]) -> EntityId {
        let state = self.read();
        properties
            .iter()
            .filter_map(|p| {
                let value = state.values.get(p)?;
                value.is_set().then(|| (p.clone(), value.clone()))
            })
            .collect()
    }

    pub fn set_one(&self, property: impl Into<String>, related: Option<Entity>) {
        self.set_slot(property, RelationSlot::Loaded(RelationValue::One(related)));
    }

    pub fn set_many(&self, property: impl Into<String>, related: Vec<Entity>) {
        self.set_slot(property, RelationSlot::Loaded(RelationValue::Many(related)));
    }

    /// Append to a collection relation, initialising it when absent.
    pub fn push(&self, property: &str, related: Entity) {
        let mut state = self.write();
        match state.relations.get_mut(property) {
            Some(RelationSlot::Loaded(RelationValue::Many(items))) => items.push(related),
            _ => {
                state.relations.insert(
                    property.to_string(),
                    RelationSlot::Loaded(RelationValue::Many(vec![related])),
                );
            }
        }
    }

    /// Remove `related` from a loaded collection relation.
    pub fn remove_from(&self, property: &str, related: &Entity) {
        if let Some(RelationSlot::Loaded(RelationValue::Many(items))) =
            self.write().relations.get_mut(property)
        {
            items.retain(|e| !e.ptr_eq(related));
        }
    }

    /// Loaded relation value; `None` if absent or not loaded.
    pub fn relation(&self, property: &str) -> Option<RelationValue> {
        match self.read().relations.get(property) {
            Some(RelationSlot::Loaded(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Single related entity of a loaded to-one relation.
    pub fn related_one(&self, property: &str) -> Option<Entity> {
        match self.relation(property)? {
            RelationValue::One(related) => related,
            RelationValue::Many(_) => None,
        }
    }

    pub fn slot(&self, property: &str) -> Option<RelationSlot> {
        self.read().relations.get(property).cloned()
    }

    pub fn set_slot(&self, property: impl Into<String>, slot: RelationSlot) {
        self.write().relations.insert(property.into(), slot);
    }

    /// Mark a lazy relation as not yet fetched.
    pub fn mark_unloaded(&self, property: impl Into<String>) {
        self.set_slot(property, RelationSlot::Unloaded);
    }

    /// Names of relations currently loaded on this record.
    pub fn loaded_relations(&self) -> Vec<String> {
        self.read()
            .relations
            .iter()
            .filter(|(_, slot)| matches!(slot, RelationSlot::Loaded(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Switch an absent or unloaded slot to `Loading`.
    ///
    /// Returns `None` when another load is in flight or the slot is loaded.
    pub(crate) fn begin_loading(&self, property: &str) -> Option<watch::Sender<bool>> {
        let mut state = self.write();
        match state.relations.get(property) {
            Some(RelationSlot::Loading(_)) | Some(RelationSlot::Loaded(_)) => None,
            _ => {
                let (tx, rx) = watch::channel(false);
                state
                    .relations
                    .insert(property.to_string(), RelationSlot::Loading(rx));
                Some(tx)
            }
        }
    }
}

// Relations are printed by name only; graphs are usually cyclic.
impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Entity")
            .field("target", &state.target)
            .field("values", &state.values)
            .field("relations", &state.relations.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_record() {
        let a = Entity::new("Post").with("title", "a");
        let b = a.clone();
        b.set("title", "b");

        assert!(a.ptr_eq(&b));
        assert_eq!(a.get("title"), Some(Value::from("b")));
        assert!(!a.ptr_eq(&Entity::new("Post")));
    }

    #[test]
    fn id_of_skips_unset_and_null() {
        let e = Entity::new("Post").with("id", 3).with("slug", Value::Null);
        let id = e.id_of(&["id".to_string(), "slug".to_string(), "other".to_string()]);
        assert_eq!(id.len(), 1);
        assert_eq!(id.get("id"), Some(&Value::Int(3)));
    }

    #[test]
    fn push_creates_and_extends_collections() {
        let post = Entity::new("Post");
        let c1 = Entity::new("Comment");
        let c2 = Entity::new("Comment");
        post.push("comments", c1.clone());
        post.push("comments", c2.clone());

        let items = post.relation("comments").map(|r| r.entities()).unwrap_or_default();
        assert_eq!(items.len(), 2);

        post.remove_from("comments", &c1);
        let items = post.relation("comments").map(|r| r.entities()).unwrap_or_default();
        assert_eq!(items.len(), 1);
        assert!(items[0].ptr_eq(&c2));
    }

    #[test]
    fn unloaded_slot_is_not_a_relation_value() {
        let post = Entity::new("Post");
        post.mark_unloaded("comments");
        assert!(post.relation("comments").is_none());
        assert!(post.loaded_relations().is_empty());
        assert!(post.begin_loading("comments").is_some());
        assert!(post.begin_loading("comments").is_none());
    }

    #[test]
    fn debug_does_not_recurse_into_cycles() {
        let a = Entity::new("Node");
        let b = Entity::new("Node").with_one("parent", a.clone());
        a.push("children", b.clone());
        let printed = format!("{a:?}");
        assert!(printed.contains("children"));
    }
}
