//! Stream registry: published stream name → the call publishing it.

use crate::call::BindingId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<DashMap<String, BindingId>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `binding`. Returns `false` if the name is taken.
    pub fn publish(&self, name: &str, binding: BindingId) -> bool {
        match self.streams.entry(name.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(binding);
                true
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<BindingId> {
        self.streams.get(name).map(|b| *b)
    }

    /// Remove `name` only if it still points at `binding`.
    pub fn unpublish(&self, name: &str, binding: BindingId) -> bool {
        self.streams.remove_if(name, |_, b| *b == binding).is_some()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_claimed_once() {
        let streams = StreamRegistry::new();
        let (first, second) = (BindingId::new(), BindingId::new());

        assert!(streams.publish("room1", first));
        assert!(!streams.publish("room1", second));
        assert_eq!(streams.lookup("room1"), Some(first));
    }

    #[test]
    fn unpublish_ignores_other_owners() {
        let streams = StreamRegistry::new();
        let (owner, other) = (BindingId::new(), BindingId::new());
        streams.publish("room1", owner);

        assert!(!streams.unpublish("room1", other));
        assert!(streams.unpublish("room1", owner));
        assert!(streams.is_empty());
    }
}
