use super::*;

#[derive(Debug, Default)]
struct EventStoreInner {
  by_id: HashMap<EventId, usize, BuildNoHashHasher<EventId>>,
  events: Vec<Arc<SampledEvent>>,
}

/// Bounded, insertion-ordered table of sampled events.
///
/// Structural changes (insert, clear) take the write lock; enumeration and
/// reconciliation take the read lock only long enough to copy out the event
/// handles. Event state lives in an atomic inside each event, so a state
/// change never needs the write lock.
#[derive(Debug)]
pub struct EventStore {
  capacity: usize,
  dropped: AtomicU64,
  full_reported: AtomicBool,
  inner: RwLock<EventStoreInner>,
}

impl EventStore {
  #[must_use]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Remove every event and reset the drop counter.
  pub fn clear(&self) {
    let mut inner = self.write_inner();
    inner.events.clear();
    inner.by_id.clear();
    self.dropped.store(0, Ordering::Relaxed);
    self.full_reported.store(false, Ordering::Relaxed);
  }

  /// Number of samples refused because the store was full.
  #[must_use]
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Events currently classified as garbage whose trace satisfies
  /// `predicate`.
  #[must_use]
  pub fn garbage_matching<P>(&self, predicate: P) -> Events<P>
  where
    P: Fn(&StackTrace) -> bool,
  {
    Events::new(self.view(), predicate, true)
  }

  #[must_use]
  pub fn get(&self, id: EventId) -> Option<Arc<SampledEvent>> {
    let inner = self.read_inner();
    let index = *inner.by_id.get(&id)?;
    inner.events.get(index).cloned()
  }

  /// Append an event. Returns `false` without touching existing entries when
  /// the store is full.
  pub fn insert(&self, event: SampledEvent) -> bool {
    let mut inner = self.write_inner();

    if inner.events.len() >= self.capacity {
      drop(inner);
      self.dropped.fetch_add(1, Ordering::Relaxed);

      if !self.full_reported.swap(true, Ordering::Relaxed) {
        warn!(
          capacity = self.capacity,
          "event store is full, dropping new samples"
        );
      }

      return false;
    }

    let index = inner.events.len();
    inner.by_id.insert(event.id(), index);
    inner.events.push(Arc::new(event));

    true
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.read_inner().events.is_empty()
  }

  /// All stored events, in insertion order.
  #[must_use]
  pub fn iter(&self) -> Events<fn(&StackTrace) -> bool> {
    let any: fn(&StackTrace) -> bool = |_| true;
    Events::new(self.view(), any, false)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.read_inner().events.len()
  }

  /// Events whose trace satisfies `predicate`, in insertion order.
  ///
  /// The returned iterator walks a point-in-time view: events inserted after
  /// this call are not visited, but state changes made by the reconciler are.
  #[must_use]
  pub fn matching<P>(&self, predicate: P) -> Events<P>
  where
    P: Fn(&StackTrace) -> bool,
  {
    Events::new(self.view(), predicate, false)
  }

  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      dropped: AtomicU64::new(0),
      full_reported: AtomicBool::new(false),
      inner: RwLock::new(EventStoreInner::default()),
    }
  }

  fn read_inner(&self) -> RwLockReadGuard<'_, EventStoreInner> {
    self.inner.read().unwrap_or_else(PoisonError::into_inner)
  }

  /// Copy the event handles out under the read lock.
  pub(crate) fn view(&self) -> Arc<[Arc<SampledEvent>]> {
    Arc::from(self.read_inner().events.as_slice())
  }

  fn write_inner(&self) -> RwLockWriteGuard<'_, EventStoreInner> {
    self.inner.write().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Lazy, restartable iterator over a view of the event store.
///
/// Cloning the iterator restarts it from the same view.
#[derive(Clone)]
pub struct Events<P> {
  garbage_only: bool,
  position: usize,
  predicate: P,
  view: Arc<[Arc<SampledEvent>]>,
}

impl<P> Events<P> {
  fn new(
    view: Arc<[Arc<SampledEvent>]>,
    predicate: P,
    garbage_only: bool,
  ) -> Self {
    Self {
      garbage_only,
      position: 0,
      predicate,
      view,
    }
  }

  /// Rewind to the first event of the view.
  pub fn restart(&mut self) {
    self.position = 0;
  }
}

impl<P> Iterator for Events<P>
where
  P: Fn(&StackTrace) -> bool,
{
  type Item = Arc<SampledEvent>;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(event) = self.view.get(self.position) {
      self.position += 1;

      if self.garbage_only && !event.is_garbage() {
        continue;
      }

      if (self.predicate)(event.trace()) {
        return Some(Arc::clone(event));
      }
    }

    None
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (0, Some(self.view.len().saturating_sub(self.position)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frames(name: &str) -> Vec<Frame> {
    vec![Frame::new(name, "()V", "Test.java", 1)]
  }

  fn event(table: &StackTable, id: EventId, name: &str) -> SampledEvent {
    SampledEvent::new(id, ObjectId(id), 16, table.intern(frames(name)))
  }

  #[test]
  fn starts_empty() {
    let store = EventStore::new(4);

    assert!(store.is_empty());
    assert_eq!(store.len(), 0);
    assert_eq!(store.iter().count(), 0);
  }

  #[test]
  fn preserves_insertion_order() {
    let table = StackTable::new();
    let store = EventStore::new(8);

    for id in [3, 1, 2] {
      assert!(store.insert(event(&table, id, "f")));
    }

    let ids = store.iter().map(|event| event.id()).collect::<Vec<_>>();

    assert_eq!(ids, vec![3, 1, 2]);
    assert_eq!(store.get(1).map(|event| event.id()), Some(1));
    assert!(store.get(9).is_none());
  }

  #[test]
  fn full_store_drops_new_samples_without_touching_existing_ones() {
    let table = StackTable::new();
    let store = EventStore::new(2);

    assert!(store.insert(event(&table, 1, "a")));
    assert!(store.insert(event(&table, 2, "b")));
    assert!(!store.insert(event(&table, 3, "c")));
    assert!(!store.insert(event(&table, 4, "d")));

    assert_eq!(store.len(), 2);
    assert_eq!(store.dropped(), 2);
    assert!(store.get(3).is_none());
    assert_eq!(store.get(1).map(|event| event.id()), Some(1));
    assert_eq!(store.get(2).map(|event| event.weight()), Some(16));
  }

  #[test]
  fn matching_filters_by_trace() {
    let table = StackTable::new();
    let store = EventStore::new(8);
    store.insert(event(&table, 1, "a"));
    store.insert(event(&table, 2, "b"));
    store.insert(event(&table, 3, "a"));

    let pattern = TracePattern::Leading(frames("a"));
    let ids = store
      .matching(|trace| pattern.matches(trace))
      .map(|event| event.id())
      .collect::<Vec<_>>();

    assert_eq!(ids, vec![1, 3]);
  }

  #[test]
  fn garbage_matching_only_yields_garbage() {
    let table = StackTable::new();
    let store = EventStore::new(8);
    store.insert(event(&table, 1, "a"));
    store.insert(event(&table, 2, "a"));

    assert_eq!(store.garbage_matching(|_| true).count(), 0);

    store.get(2).unwrap().mark_garbage();

    let ids = store
      .garbage_matching(|_| true)
      .map(|event| event.id())
      .collect::<Vec<_>>();

    assert_eq!(ids, vec![2]);
  }

  #[test]
  fn iterators_are_restartable() {
    let table = StackTable::new();
    let store = EventStore::new(8);
    store.insert(event(&table, 1, "a"));
    store.insert(event(&table, 2, "a"));

    let mut events = store.matching(|_| true);
    let replay = events.clone();

    assert_eq!(events.by_ref().count(), 2);
    assert_eq!(events.next().map(|event| event.id()), None);

    events.restart();
    assert_eq!(events.count(), 2);
    assert_eq!(replay.count(), 2);
  }

  #[test]
  fn view_ignores_later_inserts() {
    let table = StackTable::new();
    let store = EventStore::new(8);
    store.insert(event(&table, 1, "a"));

    let events = store.iter();
    store.insert(event(&table, 2, "a"));

    assert_eq!(events.count(), 1);
    assert_eq!(store.len(), 2);
  }

  #[test]
  fn clear_resets_contents_and_drop_count() {
    let table = StackTable::new();
    let store = EventStore::new(1);
    store.insert(event(&table, 1, "a"));
    store.insert(event(&table, 2, "a"));

    store.clear();

    assert!(store.is_empty());
    assert_eq!(store.dropped(), 0);
    assert!(store.get(1).is_none());
    assert!(store.insert(event(&table, 3, "a")));
  }

  #[test]
  fn concurrent_inserts_respect_capacity() {
    let table = StackTable::new();
    let store = EventStore::new(100);
    let next_id = AtomicU64::new(0);

    std::thread::scope(|scope| {
      for _ in 0..4 {
        scope.spawn(|| {
          for _ in 0..50 {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            store.insert(event(&table, id, "t"));
            let _ = store.iter().count();
          }
        });
      }
    });

    assert_eq!(store.len(), 100);
    assert_eq!(store.dropped(), 100);
  }
}
