//! Local listener registry keyed by entity type.

use std::collections::HashMap;
use std::sync::Arc;

use super::protocol::Update;

/// Handler invoked for every remote update of a subscribed entity type.
pub type Callback = Arc<dyn Fn(&Update) + Send + Sync>;

/// Handle returned by `subscribe`, used to remove exactly that callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered callback lists per entity type.
#[derive(Default)]
pub struct Subscriptions {
    next_id: u64,
    handlers: HashMap<String, Vec<(SubscriptionId, Callback)>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a callback to the list for `entity_type`.
    pub fn insert(&mut self, entity_type: &str, callback: Callback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers
            .entry(entity_type.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Removes the callback registered under `id`.
    ///
    /// Returns false if no such subscription exists for `entity_type`.
    pub fn remove(&mut self, entity_type: &str, id: SubscriptionId) -> bool {
        let Some(list) = self.handlers.get_mut(entity_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;

        if list.is_empty() {
            self.handlers.remove(entity_type);
        }
        removed
    }

    /// Callbacks for `entity_type` in registration order.
    ///
    /// Returned as owned handles so they can run without holding any lock.
    pub fn handlers_for(&self, entity_type: &str) -> Vec<Callback> {
        self.handlers
            .get(entity_type)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.handlers.get(entity_type).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(entity_type, list)| (entity_type.as_str(), list.len()))
            .collect();
        f.debug_struct("Subscriptions")
            .field("handlers", &counts)
            .finish()
    }
}
