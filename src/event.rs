use super::*;

/// Identifier assigned to each sampled event, unique per monitor.
pub type EventId = u64;

/// Non-owning identity of a heap object, as understood by the host collector.
///
/// Holding an `ObjectId` never keeps the object reachable; only the host's
/// liveness oracle can tell whether it still is.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl nohash_hasher::IsEnabled for ObjectId {}

impl Display for ObjectId {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "obj#{:x}", self.0)
  }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
  Live,
  /// The collector found the sampled object unreachable.
  Garbage,
}

impl EventState {
  const GARBAGE: u8 = 1;
  const LIVE: u8 = 0;

  fn from_raw(raw: u8) -> Self {
    if raw == Self::GARBAGE {
      Self::Garbage
    } else {
      Self::Live
    }
  }
}

/// One sampled allocation.
///
/// Everything but the liveness state is fixed at construction, so a reader
/// holding an `Arc<SampledEvent>` always sees a complete record.
#[derive(Debug)]
pub struct SampledEvent {
  id: EventId,
  object: ObjectId,
  state: AtomicU8,
  timestamp: Instant,
  trace: Arc<StackTrace>,
  weight: u64,
}

impl SampledEvent {
  #[must_use]
  pub fn new(
    id: EventId,
    object: ObjectId,
    weight: u64,
    trace: Arc<StackTrace>,
  ) -> Self {
    Self {
      id,
      object,
      state: AtomicU8::new(EventState::LIVE),
      timestamp: Instant::now(),
      trace,
      weight,
    }
  }

  #[must_use]
  pub fn id(&self) -> EventId {
    self.id
  }

  #[must_use]
  pub fn is_garbage(&self) -> bool {
    self.state() == EventState::Garbage
  }

  /// Transition `Live -> Garbage`.
  ///
  /// Returns `true` only for the call that performed the transition.
  pub(crate) fn mark_garbage(&self) -> bool {
    self
      .state
      .compare_exchange(
        EventState::LIVE,
        EventState::GARBAGE,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  #[must_use]
  pub fn object(&self) -> ObjectId {
    self.object
  }

  #[must_use]
  pub fn state(&self) -> EventState {
    EventState::from_raw(self.state.load(Ordering::Acquire))
  }

  #[must_use]
  pub fn timestamp(&self) -> Instant {
    self.timestamp
  }

  #[must_use]
  pub fn trace(&self) -> &Arc<StackTrace> {
    &self.trace
  }

  /// Bytes allocated by the sampled allocation.
  #[must_use]
  pub fn weight(&self) -> u64 {
    self.weight
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event() -> SampledEvent {
    let table = StackTable::new();
    let trace = table.intern(vec![Frame::new("f", "()V", "F.java", 1)]);
    SampledEvent::new(1, ObjectId(0x10), 64, trace)
  }

  #[test]
  fn starts_live() {
    let event = event();

    assert_eq!(event.state(), EventState::Live);
    assert!(!event.is_garbage());
    assert_eq!(event.weight(), 64);
  }

  #[test]
  fn garbage_transition_happens_once() {
    let event = event();

    assert!(event.mark_garbage());
    assert!(!event.mark_garbage());
    assert_eq!(event.state(), EventState::Garbage);
  }

  #[test]
  fn only_one_racing_thread_wins_the_transition() {
    let event = event();
    let wins = AtomicU64::new(0);

    std::thread::scope(|scope| {
      for _ in 0..8 {
        scope.spawn(|| {
          if event.mark_garbage() {
            wins.fetch_add(1, Ordering::Relaxed);
          }
        });
      }
    });

    assert_eq!(wins.load(Ordering::Relaxed), 1);
    assert!(event.is_garbage());
  }
}
