use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use crate::path::Path;

use super::controller::NodeSnapshot;

pub(super) type SubscriberFn = Arc<dyn Fn(&NodeSnapshot) + Send + Sync>;

#[derive(Default)]
pub(super) struct SubscriberMap {
    next_id: u64,
    entries: BTreeMap<Path, Vec<(u64, SubscriberFn)>>,
}

impl SubscriberMap {
    pub(super) fn insert(&mut self, path: Path, callback: SubscriberFn) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.entry(path).or_default().push((id, callback));
        id
    }

    pub(super) fn remove(&mut self, path: &Path, id: u64) {
        if let Some(list) = self.entries.get_mut(path) {
            list.retain(|(entry_id, _)| *entry_id != id);
            if list.is_empty() {
                self.entries.remove(path);
            }
        }
    }

    pub(super) fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys()
    }

    pub(super) fn callbacks_for(&self, path: &Path) -> Vec<SubscriberFn> {
        self.entries
            .get(path)
            .map(|list| list.iter().map(|(_, callback)| callback.clone()).collect())
            .unwrap_or_default()
    }
}

/// Guard returned by [`crate::Form::subscribe`]. Dropping it removes the
/// callback; the form itself is only weakly referenced, so a guard held
/// past the form's lifetime is inert rather than leaky.
#[derive(Debug)]
pub struct Subscription {
    pub(super) path: Path,
    pub(super) id: u64,
    pub(super) registry: Weak<RwLock<SubscriberMap>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut map) = registry.write() {
                map.remove(&self.path, self.id);
            }
        }
    }
}
