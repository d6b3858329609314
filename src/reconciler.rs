use std::{
    collections::{HashMap, HashSet},
    future::Future,
};

use futures::future::join_all;
use homie5::HomieID;

use crate::TreeError;

/// An entity the [`reconcile`] pass can create, subscribe and stop.
pub trait ChildEntity: Send {
    /// Whether the child's attribute subscriptions are in place (restored children are not).
    fn is_subscribed(&self) -> bool;

    fn subscribe_child(&mut self) -> impl Future<Output = Result<(), TreeError>> + Send;

    fn stop_child(&mut self) -> impl Future<Output = ()> + Send;
}

/// Keyed child collection that remembers the declared order of its keys.
#[derive(Debug)]
pub struct ChildMap<C> {
    entries: HashMap<HomieID, C>,
    order: Vec<HomieID>,
}

impl<C> Default for ChildMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ChildMap<C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &HomieID) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &HomieID) -> Option<&C> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &HomieID) -> Option<&mut C> {
        self.entries.get_mut(id)
    }

    /// Keys in declared order.
    pub fn ids(&self) -> impl Iterator<Item = &HomieID> {
        self.order.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HomieID, &C)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|child| (id, child)))
    }

    /// Mutable access to all children, in no particular order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&HomieID, &mut C)> {
        self.entries.iter_mut()
    }

    /// Inserts or replaces a child. New keys are appended to the order.
    pub fn insert(&mut self, id: HomieID, child: C) -> Option<C> {
        let previous = self.entries.insert(id.clone(), child);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    pub fn remove(&mut self, id: &HomieID) -> Option<C> {
        let child = self.entries.remove(id)?;
        self.order.retain(|key| key != id);
        Some(child)
    }

    /// Reorders the keys to follow `desired`, keys missing from it keep their relative
    /// order at the end.
    pub fn arrange(&mut self, desired: &[HomieID]) {
        let mut order: Vec<HomieID> = desired
            .iter()
            .filter(|id| self.entries.contains_key(id))
            .cloned()
            .collect();
        for id in &self.order {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        self.order = order;
    }

    /// Removes all children, in declared order.
    pub fn drain(&mut self) -> Vec<(HomieID, C)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|child| (id, child)))
            .collect()
    }
}

/// What a [`reconcile`] pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<HomieID>,
    pub removed: Vec<HomieID>,
    /// Created children whose subscription failed. They are not part of the collection.
    pub failed: Vec<HomieID>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Synchronizes `existing` with the `desired` id list.
///
/// Children no longer desired are stopped, handed to `removed` and dropped. Missing children
/// are built with `create`, inserted and then subscribed concurrently. A failing subscription
/// is logged, the child is stopped and left out of the collection. Children present in both
/// are not touched. Duplicate ids are ignored, the first occurrence wins.
pub async fn reconcile<C, F, R>(
    desired: &[HomieID],
    existing: &mut ChildMap<C>,
    mut create: F,
    mut removed: R,
) -> ReconcileReport
where
    C: ChildEntity,
    F: FnMut(&HomieID) -> C,
    R: FnMut(&HomieID, C),
{
    let mut seen = HashSet::new();
    let desired: Vec<HomieID> = desired
        .iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect();
    let mut report = ReconcileReport::default();

    let stale: Vec<HomieID> = existing
        .ids()
        .filter(|id| !desired.contains(id))
        .cloned()
        .collect();
    for id in stale {
        // stopped while still in the collection, a cancelled pass leaves it to the owner's stop()
        if let Some(child) = existing.get_mut(&id) {
            child.stop_child().await;
        }
        if let Some(child) = existing.remove(&id) {
            removed(&id, child);
            report.removed.push(id);
        }
    }

    let missing: Vec<HomieID> = desired
        .iter()
        .filter(|id| !existing.contains(id))
        .cloned()
        .collect();
    for id in &missing {
        existing.insert(id.clone(), create(id));
    }
    existing.arrange(&desired);

    let mut pending = Vec::with_capacity(missing.len());
    for (id, child) in existing.entries.iter_mut() {
        if missing.contains(id) {
            pending.push(subscribe_entry(id.clone(), child));
        }
    }
    let mut results = join_all(pending).await;
    results.sort_by_key(|(id, _)| missing.iter().position(|m| m == id));

    for (id, result) in results {
        match result {
            Ok(()) => report.created.push(id),
            Err(err) => {
                log::warn!("Failed to subscribe [{}], leaving it out: {}", id, err);
                if let Some(child) = existing.get_mut(&id) {
                    child.stop_child().await;
                }
                existing.remove(&id);
                report.failed.push(id);
            }
        }
    }
    report
}

async fn subscribe_entry<C: ChildEntity>(
    id: HomieID,
    child: &mut C,
) -> (HomieID, Result<(), TreeError>) {
    let result = child.subscribe_child().await;
    (id, result)
}

/// Subscribes children that were inserted without a subscription (e.g. restored ones).
/// Failures are logged and the child is kept as it is.
pub async fn subscribe_pending<C: ChildEntity>(existing: &mut ChildMap<C>) {
    let mut pending = Vec::new();
    for (id, child) in existing.entries.iter_mut() {
        if !child.is_subscribed() {
            pending.push(subscribe_entry(id.clone(), child));
        }
    }
    let results = join_all(pending).await;
    for (id, result) in results {
        if let Err(err) = result {
            log::warn!("Failed to subscribe [{}]: {}", id, err);
        }
    }
}
