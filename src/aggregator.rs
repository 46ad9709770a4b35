use {super::*, crate::snapshot::FramesExport};

/// Sampled-event totals attributed to one stack trace.
#[derive(Debug, Clone)]
pub struct StackSummary {
  pub garbage_bytes: u64,
  pub garbage_events: u64,
  pub live_bytes: u64,
  pub live_events: u64,
  pub trace: Arc<StackTrace>,
}

impl StackSummary {
  fn new(trace: Arc<StackTrace>) -> Self {
    Self {
      garbage_bytes: 0,
      garbage_events: 0,
      live_bytes: 0,
      live_events: 0,
      trace,
    }
  }

  fn on_garbage(&mut self, weight: u64) {
    self.garbage_bytes = self.garbage_bytes.saturating_add(weight);
    self.garbage_events = self.garbage_events.saturating_add(1);
  }

  fn on_live(&mut self, weight: u64) {
    self.live_bytes = self.live_bytes.saturating_add(weight);
    self.live_events = self.live_events.saturating_add(1);
  }
}

impl Serialize for StackSummary {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("StackSummary", 6)?;
    state.serialize_field("stack_id", &self.trace.id())?;
    state.serialize_field("live_events", &self.live_events)?;
    state.serialize_field("live_bytes", &self.live_bytes)?;
    state.serialize_field("garbage_events", &self.garbage_events)?;
    state.serialize_field("garbage_bytes", &self.garbage_bytes)?;
    state.serialize_field("frames", &FramesExport(self.trace.frames()))?;
    state.end()
  }
}

/// Groups sampled events by stack.
#[derive(Debug, Default)]
pub struct Aggregator {
  stats: HashMap<StackId, StackSummary, BuildNoHashHasher<StackId>>,
}

impl Aggregator {
  /// Fold a batch of events into the per-stack totals.
  pub fn ingest<'a, I>(&mut self, events: I)
  where
    I: IntoIterator<Item = &'a Arc<SampledEvent>>,
  {
    for event in events {
      let summary = self
        .stats
        .entry(event.trace().id())
        .or_insert_with(|| StackSummary::new(Arc::clone(event.trace())));

      match event.state() {
        EventState::Live => summary.on_live(event.weight()),
        EventState::Garbage => summary.on_garbage(event.weight()),
      }
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reset(&mut self) {
    self.stats.clear();
  }

  /// Per-stack totals, largest live footprint first.
  #[must_use]
  pub fn summaries(&self) -> Vec<StackSummary> {
    let mut summaries: Vec<_> = self.stats.values().cloned().collect();

    summaries.sort_by(|a, b| {
      b.live_bytes
        .cmp(&a.live_bytes)
        .then(b.garbage_bytes.cmp(&a.garbage_bytes))
        .then(a.trace.id().cmp(&b.trace.id()))
    });

    summaries
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn groups_events_by_stack() {
    let table = StackTable::new();
    let hot = table.intern(vec![Frame::new("hot", "()V", "A.java", 1)]);
    let cold = table.intern(vec![Frame::new("cold", "()V", "A.java", 2)]);

    let events = vec![
      Arc::new(SampledEvent::new(1, ObjectId(1), 128, Arc::clone(&hot))),
      Arc::new(SampledEvent::new(2, ObjectId(2), 64, Arc::clone(&hot))),
      Arc::new(SampledEvent::new(3, ObjectId(3), 32, Arc::clone(&cold))),
    ];
    events[1].mark_garbage();

    let mut aggregator = Aggregator::new();
    aggregator.ingest(&events);

    let summaries = aggregator.summaries();
    assert_eq!(summaries.len(), 2);

    let first = &summaries[0];
    assert_eq!(first.trace.id(), hot.id());
    assert_eq!(first.live_events, 1);
    assert_eq!(first.live_bytes, 128);
    assert_eq!(first.garbage_events, 1);
    assert_eq!(first.garbage_bytes, 64);

    assert_eq!(summaries[1].live_bytes, 32);
  }

  #[test]
  fn reset_clears_totals() {
    let table = StackTable::new();
    let trace = table.intern(vec![Frame::new("f", "()V", "A.java", 1)]);
    let events = vec![Arc::new(SampledEvent::new(1, ObjectId(1), 8, trace))];

    let mut aggregator = Aggregator::new();
    aggregator.ingest(&events);
    aggregator.reset();

    assert!(aggregator.summaries().is_empty());
  }
}
