use super::*;

#[derive(Serialize)]
struct FrameExport<'a> {
  line: u32,
  name: &'a str,
  signature: &'a str,
  source_file: &'a str,
}

/// Serializes a frame slice without copying it.
pub(crate) struct FramesExport<'a>(pub(crate) &'a [Frame]);

impl Serialize for FramesExport<'_> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.collect_seq(self.0.iter().map(|frame| FrameExport {
      line: frame.line,
      name: frame.name.as_ref(),
      signature: frame.signature.as_ref(),
      source_file: frame.source_file.as_ref(),
    }))
  }
}

/// Point-in-time copy of one sampled event.
#[derive(Debug, Clone)]
pub struct EventRecord {
  pub age: Duration,
  pub id: EventId,
  pub object: ObjectId,
  pub state: EventState,
  pub trace: Arc<StackTrace>,
  pub weight: u64,
}

impl From<&SampledEvent> for EventRecord {
  fn from(event: &SampledEvent) -> Self {
    Self {
      age: event.timestamp().elapsed(),
      id: event.id(),
      object: event.object(),
      state: event.state(),
      trace: Arc::clone(event.trace()),
      weight: event.weight(),
    }
  }
}

impl Serialize for EventRecord {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("EventRecord", 7)?;
    state.serialize_field("id", &self.id)?;
    state.serialize_field("object", &self.object.0)?;
    state.serialize_field("weight", &self.weight)?;
    state.serialize_field("state", &self.state)?;
    state.serialize_field("age_ms", &self.age.as_millis())?;
    state.serialize_field("stack_id", &self.trace.id())?;
    state.serialize_field("frames", &FramesExport(self.trace.frames()))?;
    state.end()
  }
}

/// Immutable view of the monitor's contents.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
  records: Vec<EventRecord>,
  stacks: Vec<StackSummary>,
  stats: MonitorStats,
}

impl Serialize for Snapshot {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("Snapshot", 3)?;
    state.serialize_field("stats", &self.stats)?;
    state.serialize_field("stacks", &self.stacks)?;
    state.serialize_field("records", &self.records)?;
    state.end()
  }
}

impl Snapshot {
  pub(crate) fn capture<'a, I>(events: I, stats: MonitorStats) -> Self
  where
    I: IntoIterator<Item = &'a Arc<SampledEvent>>,
  {
    let mut aggregator = Aggregator::new();
    let mut records = Vec::new();

    for event in events {
      aggregator.ingest(std::iter::once(event));
      records.push(EventRecord::from(&**event));
    }

    Self {
      records,
      stacks: aggregator.summaries(),
      stats,
    }
  }

  /// Serialize the snapshot to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails or the writer cannot be
  /// flushed.
  pub fn export_json<W: Write>(
    &self,
    mut writer: W,
  ) -> Result<(), ExportError> {
    serde_json::to_writer(&mut writer, self)?;
    writer.flush()?;
    Ok(())
  }

  /// Events in insertion order.
  #[must_use]
  pub fn records(&self) -> &[EventRecord] {
    &self.records
  }

  #[must_use]
  pub fn stacks(&self) -> &[StackSummary] {
    &self.stacks
  }

  #[must_use]
  pub fn stats(&self) -> MonitorStats {
    self.stats
  }
}
