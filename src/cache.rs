//! Generic keyed, order-preserving entity cache.
//!
//! One cache per entity type is the single source of truth for that type
//! within a client process. Mutations flow only through the apply-event and
//! optimistic-mutation entry points; consumers read ordered snapshots and
//! subscribe to change notifications.

use std::collections::BTreeMap;

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError};
use tracing::debug;

use crate::model::{Entity, Keyed};

/// Per-subscriber change queue depth. Change notifications are pings, not
/// data: a subscriber that falls behind re-reads the snapshot, so overflow
/// drops the ping rather than the subscriber.
const CHANGE_QUEUE_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
}

/// Tags one in-flight bulk fetch. Responses carrying a stale generation are
/// dropped on arrival instead of being applied to a reset cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadTicket {
    pub generation: u64,
}

/// What `load_once` decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome<T> {
    /// Already loaded: the current snapshot, no network call.
    Hit(Vec<T>),
    /// A bulk fetch is already in flight; await it.
    InFlight,
    /// Caller must perform the bulk fetch and feed `complete_load`.
    Fetch(LoadTicket),
}

/// Whether an apply operation changed the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Duplicate create, update for an unknown key, or delete of an absent
    /// key. Never an error.
    Ignored,
}

impl ApplyOutcome {
    pub fn applied(self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheChange<Id> {
    BulkLoaded,
    Created(Id),
    Updated(Id),
    Deleted(Id),
}

/// Receiving half of a change subscription. Dropping it unsubscribes; the
/// cache prunes the dead sender on the next notification.
pub struct CacheSubscription<Id> {
    receiver: Receiver<CacheChange<Id>>,
}

impl<Id> CacheSubscription<Id> {
    pub fn try_recv(&self) -> Result<CacheChange<Id>, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn drain(&self) -> Vec<CacheChange<Id>> {
        let mut changes = Vec::new();
        while let Ok(change) = self.receiver.try_recv() {
            changes.push(change);
        }
        changes
    }
}

pub struct EntityCache<T: Entity> {
    rows: BTreeMap<T::Id, T>,
    order: Vec<T::Id>,
    state: LoadState,
    generation: u64,
    subscribers: Vec<Sender<CacheChange<T::Id>>>,
    label: &'static str,
}

impl<T: Entity> EntityCache<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            rows: BTreeMap::new(),
            order: Vec::new(),
            state: LoadState::NotLoaded,
            generation: 0,
            subscribers: Vec::new(),
            label,
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &T::Id) -> Option<&T> {
        self.rows.get(id)
    }

    /// Current snapshot in the entity's documented order.
    pub fn snapshot(&self) -> Vec<T> {
        self.order
            .iter()
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }

    /// Cache-hit path when `Loaded`; coalesces onto an in-flight load when
    /// `Loading`; otherwise starts a generation-tagged bulk fetch.
    pub fn load_once(&mut self) -> LoadOutcome<T> {
        match self.state {
            LoadState::Loaded => LoadOutcome::Hit(self.snapshot()),
            LoadState::Loading => LoadOutcome::InFlight,
            LoadState::NotLoaded => LoadOutcome::Fetch(self.begin_load()),
        }
    }

    /// Unconditional re-fetch. Invalidates any in-flight load: its eventual
    /// response carries a stale generation and is dropped on arrival.
    pub fn force_refresh(&mut self) -> LoadTicket {
        self.begin_load()
    }

    /// Apply a completed bulk fetch. Returns false (and leaves the cache
    /// untouched) when the ticket's generation is stale.
    pub fn complete_load(&mut self, ticket: LoadTicket, entities: Vec<T>) -> bool {
        if ticket.generation != self.generation || self.state != LoadState::Loading {
            debug!(
                cache = self.label,
                stale = ticket.generation,
                current = self.generation,
                "stale bulk load dropped"
            );
            return false;
        }
        self.rows.clear();
        for entity in entities {
            self.rows.insert(entity.id().clone(), entity);
        }
        self.resort();
        self.state = LoadState::Loaded;
        self.notify(CacheChange::BulkLoaded);
        true
    }

    /// Idempotent create: an existing key is a no-op, protecting against the
    /// echo of a create this client already applied optimistically.
    pub fn apply_create(&mut self, entity: T) -> ApplyOutcome {
        if self.rows.contains_key(entity.id()) {
            debug!(cache = self.label, id = %entity.id(), "duplicate create ignored");
            return ApplyOutcome::Ignored;
        }
        let id = entity.id().clone();
        self.rows.insert(id.clone(), entity);
        self.resort();
        self.notify(CacheChange::Created(id));
        ApplyOutcome::Applied
    }

    /// Merge a partial patch by key; an absent key is dropped, never
    /// fabricated into a placeholder row.
    pub fn apply_update(&mut self, patch: &T::Patch) -> ApplyOutcome {
        let id = patch.id().clone();
        match self.rows.get_mut(&id) {
            Some(entity) => {
                entity.apply_patch(patch);
                self.resort();
                self.notify(CacheChange::Updated(id));
                ApplyOutcome::Applied
            }
            None => {
                debug!(cache = self.label, id = %id, "update for unknown key dropped");
                ApplyOutcome::Ignored
            }
        }
    }

    pub fn apply_delete(&mut self, id: &T::Id) -> ApplyOutcome {
        if self.rows.remove(id).is_none() {
            return ApplyOutcome::Ignored;
        }
        self.resort();
        self.notify(CacheChange::Deleted(id.clone()));
        ApplyOutcome::Applied
    }

    /// Insert or replace directly. Reserved for the optimistic-mutation path,
    /// which originates the change rather than observing it and therefore
    /// bypasses deduplication.
    pub(crate) fn upsert_local(&mut self, entity: T) {
        let id = entity.id().clone();
        let existed = self.rows.insert(id.clone(), entity).is_some();
        self.resort();
        self.notify(if existed {
            CacheChange::Updated(id)
        } else {
            CacheChange::Created(id)
        });
    }

    /// Remove directly (optimistic delete / rollback of a create).
    pub(crate) fn remove_local(&mut self, id: &T::Id) {
        if self.rows.remove(id).is_some() {
            self.resort();
            self.notify(CacheChange::Deleted(id.clone()));
        }
    }

    /// Drop all rows and invalidate any in-flight load. Used on logout.
    pub fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.rows.clear();
        self.order.clear();
        self.state = LoadState::NotLoaded;
        self.notify(CacheChange::BulkLoaded);
    }

    pub fn subscribe(&mut self) -> CacheSubscription<T::Id> {
        let (sender, receiver) = crossbeam::channel::bounded(CHANGE_QUEUE_DEPTH);
        self.subscribers.push(sender);
        CacheSubscription { receiver }
    }

    fn begin_load(&mut self) -> LoadTicket {
        self.generation = self.generation.wrapping_add(1);
        self.state = LoadState::Loading;
        LoadTicket {
            generation: self.generation,
        }
    }

    fn resort(&mut self) {
        self.order = self.rows.keys().cloned().collect();
        let rows = &self.rows;
        self.order.sort_by(|a, b| {
            let (left, right) = (&rows[a], &rows[b]);
            left.cmp_order(right)
        });
    }

    fn notify(&mut self, change: CacheChange<T::Id>) {
        self.subscribers.retain(|sender| {
            match sender.try_send(change.clone()) {
                Ok(()) => true,
                // Slow subscriber: drop the ping, keep the subscription.
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Row {
        id: String,
        name: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct RowPatch {
        id: String,
        name: Option<String>,
    }

    impl Keyed for Row {
        type Id = String;
        fn id(&self) -> &String {
            &self.id
        }
    }

    impl Keyed for RowPatch {
        type Id = String;
        fn id(&self) -> &String {
            &self.id
        }
    }

    impl Entity for Row {
        type Patch = RowPatch;

        fn apply_patch(&mut self, patch: &RowPatch) {
            if let Some(name) = &patch.name {
                self.name = name.clone();
            }
        }

        fn cmp_order(&self, other: &Self) -> Ordering {
            self.name.cmp(&other.name).then_with(|| self.id.cmp(&other.id))
        }
    }

    fn row(id: &str, name: &str) -> Row {
        Row {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn create_is_idempotent() {
        let mut cache = EntityCache::<Row>::new("rows");
        assert_eq!(cache.apply_create(row("1", "first")), ApplyOutcome::Applied);
        assert_eq!(cache.apply_create(row("1", "other")), ApplyOutcome::Ignored);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"1".to_string()).unwrap().name, "first");
    }

    #[test]
    fn update_for_unknown_key_is_dropped() {
        let mut cache = EntityCache::<Row>::new("rows");
        let patch = RowPatch {
            id: "missing".to_string(),
            name: Some("x".to_string()),
        };
        assert_eq!(cache.apply_update(&patch), ApplyOutcome::Ignored);
        assert!(cache.is_empty());
    }

    #[test]
    fn snapshot_is_always_ordered() {
        let mut cache = EntityCache::<Row>::new("rows");
        cache.apply_create(row("1", "B"));
        cache.apply_create(row("2", "A"));
        cache.apply_create(row("3", "C"));
        let names: Vec<_> = cache.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["A", "B", "C"]);

        cache.apply_update(&RowPatch {
            id: "3".to_string(),
            name: Some("0".to_string()),
        });
        let names: Vec<_> = cache.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["0", "A", "B"]);
    }

    #[test]
    fn load_once_coalesces_and_hits() {
        let mut cache = EntityCache::<Row>::new("rows");
        let ticket = match cache.load_once() {
            LoadOutcome::Fetch(t) => t,
            other => panic!("expected fetch, got {other:?}"),
        };
        assert_eq!(cache.load_once(), LoadOutcome::InFlight);

        assert!(cache.complete_load(ticket, vec![row("1", "A")]));
        match cache.load_once() {
            LoadOutcome::Hit(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn stale_generation_load_is_dropped() {
        let mut cache = EntityCache::<Row>::new("rows");
        let old = match cache.load_once() {
            LoadOutcome::Fetch(t) => t,
            other => panic!("expected fetch, got {other:?}"),
        };
        let fresh = cache.force_refresh();

        assert!(!cache.complete_load(old, vec![row("1", "stale")]));
        assert_eq!(cache.load_state(), LoadState::Loading);

        assert!(cache.complete_load(fresh, vec![row("2", "fresh")]));
        assert_eq!(cache.load_state(), LoadState::Loaded);
        assert_eq!(cache.snapshot()[0].name, "fresh");
    }

    #[test]
    fn force_refresh_replaces_wholesale() {
        let mut cache = EntityCache::<Row>::new("rows");
        let ticket = cache.force_refresh();
        cache.complete_load(ticket, vec![row("1", "A"), row("2", "B")]);

        let ticket = cache.force_refresh();
        assert!(cache.complete_load(ticket, vec![row("3", "C")]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn subscribers_see_changes_and_unsubscribe_on_drop() {
        let mut cache = EntityCache::<Row>::new("rows");
        let sub = cache.subscribe();
        cache.apply_create(row("1", "A"));
        assert_eq!(
            sub.try_recv().expect("change"),
            CacheChange::Created("1".to_string())
        );

        drop(sub);
        cache.apply_create(row("2", "B"));
        // Pruned on notify; a fresh subscriber still works.
        let sub = cache.subscribe();
        cache.apply_delete(&"2".to_string());
        assert_eq!(
            sub.try_recv().expect("change"),
            CacheChange::Deleted("2".to_string())
        );
    }

    #[test]
    fn clear_invalidates_in_flight_load() {
        let mut cache = EntityCache::<Row>::new("rows");
        let ticket = match cache.load_once() {
            LoadOutcome::Fetch(t) => t,
            other => panic!("expected fetch, got {other:?}"),
        };
        cache.clear();
        assert!(!cache.complete_load(ticket, vec![row("1", "A")]));
        assert_eq!(cache.load_state(), LoadState::NotLoaded);
        assert!(cache.is_empty());
    }
}
