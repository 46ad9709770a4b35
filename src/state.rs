use super::*;

/// Whether the monitor is currently sampling allocations.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
  Disabled,
  Enabled,
}

/// Counters describing the monitor's current contents.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct MonitorStats {
  pub cycles_reconciled: u64,
  /// Samples refused because the store was full.
  pub dropped: u64,
  pub garbage: usize,
  pub live: usize,
  /// Samples accepted into the store since construction.
  pub samples_taken: u64,
  pub sampled_bytes: u64,
}

/// Thin builder that customizes `MonitorConfig` and the stack capture.
#[derive(Default)]
pub struct MonitorBuilder {
  capture: Option<Arc<dyn StackCapture>>,
  config: MonitorConfig,
}

impl MonitorBuilder {
  #[must_use]
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.config.capacity = capacity;
    self
  }

  /// Use a custom stack capture instead of native backtraces.
  #[must_use]
  pub fn capture(mut self, capture: impl StackCapture + 'static) -> Self {
    let capture: Arc<dyn StackCapture> = Arc::new(capture);
    self.capture = Some(capture);
    self
  }

  #[must_use]
  pub fn collection_timeout(mut self, timeout: Duration) -> Self {
    self.config.collection_timeout = Some(timeout);
    self
  }

  #[must_use]
  pub fn finish(self) -> Monitor {
    let capture: Arc<dyn StackCapture> = match self.capture {
      Some(capture) => capture,
      None => Arc::new(BacktraceCapture::new(self.config.native_skip_frames)),
    };

    Monitor::with_capture(self.config, capture)
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: u16) -> Self {
    self.config.max_stack_depth = depth;
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn sampling_interval(mut self, bytes: u64) -> Self {
    self.config.sampling_interval = bytes;
    self
  }

  #[must_use]
  pub fn seed(mut self, seed: u64) -> Self {
    self.config.seed = Some(seed);
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: MonitorConfig) -> Self {
    self.config = config;
    self
  }
}

struct MonitorInner {
  capture: Arc<dyn StackCapture>,
  config: MonitorConfig,
  enabled: AtomicBool,
  next_event_id: AtomicU64,
  reconciler: Reconciler,
  sampled_bytes: AtomicU64,
  sampler: Sampler,
  samples_taken: AtomicU64,
  stacks: StackTable,
  store: EventStore,
}

/// Controller owning the sampler, the event store and the reconciler.
///
/// `Monitor` is a cheap handle; clones share the same state, so one can be
/// handed to the host collector while another drives queries. Independent
/// monitors never share anything.
#[derive(Clone)]
pub struct Monitor {
  inner: Arc<MonitorInner>,
}

impl fmt::Debug for Monitor {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("Monitor")
      .field("state", &self.state())
      .field("events", &self.inner.store.len())
      .field("config", &self.inner.config)
      .finish_non_exhaustive()
  }
}

impl Default for Monitor {
  fn default() -> Self {
    Self::new()
  }
}

impl Monitor {
  /// Every stored event, in insertion order.
  #[must_use]
  pub fn all_events(&self) -> Events<fn(&StackTrace) -> bool> {
    self.inner.store.iter()
  }

  #[must_use]
  pub fn builder() -> MonitorBuilder {
    MonitorBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &MonitorConfig {
    &self.inner.config
  }

  /// Stop sampling. Stored events and their states are kept.
  ///
  /// Returns whether the state changed.
  pub fn disable(&self) -> bool {
    let changed = self.inner.enabled.swap(false, Ordering::AcqRel);

    if changed {
      debug!("heap sampling disabled");
    }

    changed
  }

  pub fn disable_sampling_events(&self) {
    self.disable();
  }

  /// Start sampling. Existing events are kept.
  ///
  /// Returns whether the state changed.
  pub fn enable(&self) -> bool {
    let changed = !self.inner.enabled.swap(true, Ordering::AcqRel);

    if changed {
      debug!(
        interval = self.inner.sampler.interval(),
        "heap sampling enabled"
      );
    }

    changed
  }

  pub fn enable_sampling_events(&self) {
    self.enable();
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    self.inner.enabled.load(Ordering::Acquire)
  }

  #[must_use]
  pub fn event(&self, id: EventId) -> Option<Arc<SampledEvent>> {
    self.inner.store.get(id)
  }

  #[must_use]
  pub fn event_storage_is_empty(&self) -> bool {
    self.inner.store.is_empty()
  }

  /// Events whose trace satisfies `pattern`.
  #[must_use]
  pub fn events_matching(
    &self,
    pattern: TracePattern,
  ) -> Events<impl Fn(&StackTrace) -> bool + Clone> {
    self.inner.store.matching(move |trace| pattern.matches(trace))
  }

  /// Force a collection and wait until this monitor has reconciled the cycle
  /// it produced.
  ///
  /// Only a pass that finishes after the request counts, so a host whose
  /// cycle numbers repeat those of an earlier pass still gets a fresh
  /// reconciliation.
  ///
  /// # Errors
  ///
  /// Returns `MonitorError::CollectionTimeout` when a `collection_timeout` is
  /// configured and the cycle is not reconciled in time. Reconciliation
  /// still happens whenever the host reports the cycle.
  pub fn force_garbage_collection(
    &self,
    collector: &dyn Collector,
  ) -> Result<ReconcileReport, MonitorError> {
    let started = Instant::now();
    let waiter = self.inner.reconciler.waiter();
    let cycle = collector.request_collection();

    debug!(cycle, "waiting for forced collection to be reconciled");

    waiter
      .wait(cycle, self.inner.config.collection_timeout)
      .ok_or_else(|| MonitorError::CollectionTimeout {
        cycle,
        waited: started.elapsed(),
      })
  }

  /// Whether any garbage event's trace starts with `frames`.
  #[must_use]
  pub fn garbage_contains(&self, frames: &[Frame]) -> bool {
    self
      .inner
      .store
      .garbage_matching(|trace| trace.starts_with(frames))
      .next()
      .is_some()
  }

  /// Garbage events whose trace satisfies `pattern`.
  #[must_use]
  pub fn garbage_matching(
    &self,
    pattern: TracePattern,
  ) -> Events<impl Fn(&StackTrace) -> bool + Clone> {
    self
      .inner
      .store
      .garbage_matching(move |trace| pattern.matches(trace))
  }

  /// Store an already-built sample, bypassing the sampler.
  ///
  /// Refused while disabled or when the store is full.
  pub fn insert(
    &self,
    object: ObjectId,
    weight: u64,
    trace: Arc<StackTrace>,
  ) -> Option<EventId> {
    if !self.enabled() {
      return None;
    }

    let id = self.inner.next_event_id.fetch_add(1, Ordering::Relaxed);

    if !self
      .inner
      .store
      .insert(SampledEvent::new(id, object, weight, trace))
    {
      return None;
    }

    self.inner.samples_taken.fetch_add(1, Ordering::Relaxed);
    self.inner.sampled_bytes.fetch_add(weight, Ordering::Relaxed);

    trace!(event = id, %object, weight, "sampled allocation");

    Some(id)
  }

  /// Report an allocation of `size` bytes; the stack is captured only when
  /// the allocation is sampled.
  #[inline(never)]
  pub fn on_allocation(&self, object: ObjectId, size: u64) -> Option<EventId> {
    if !self.should_sample(size) {
      return None;
    }

    let depth = self.max_depth();
    let captured = self.inner.capture.capture(depth);
    let frames = crate::stack_capture::normalize(captured, depth);

    self.insert(object, size, self.inner.stacks.intern(frames))
  }

  /// Report an allocation whose stack the caller already knows, innermost
  /// frame first.
  pub fn on_allocation_with_frames(
    &self,
    object: ObjectId,
    size: u64,
    frames: &[Frame],
  ) -> Option<EventId> {
    if !self.should_sample(size) {
      return None;
    }

    let depth = self.max_depth();
    let frames = crate::stack_capture::normalize(frames.to_vec(), depth);

    self.insert(object, size, self.inner.stacks.intern(frames))
  }

  /// Whether any stored event's trace starts with `frames`.
  ///
  /// `frames` is innermost first; the recorded trace may continue with
  /// further outer frames.
  #[must_use]
  pub fn obtained_events(&self, frames: &[Frame]) -> bool {
    self
      .inner
      .store
      .matching(|trace| trace.starts_with(frames))
      .next()
      .is_some()
  }

  /// Reclassify stored events against the collector's liveness answers for
  /// `cycle`. Called by the host once per completed collection.
  pub fn reconcile(
    &self,
    cycle: u64,
    oracle: &dyn LivenessOracle,
  ) -> ReconcileReport {
    self.inner.reconciler.reconcile(&self.inner.store, cycle, oracle)
  }

  #[must_use]
  pub fn new() -> Self {
    Self::builder().finish()
  }

  /// Drop every stored event and interned stack.
  pub fn reset_event_storage(&self) {
    self.inner.store.clear();
    self.inner.stacks.clear();
    debug!("event storage reset");
  }

  #[must_use]
  pub fn sampling_interval(&self) -> u64 {
    self.inner.sampler.interval()
  }

  pub fn set_sampling_interval(&self, bytes: u64) {
    self.inner.sampler.set_interval(bytes);
    debug!(interval = bytes, "sampling interval changed");
  }

  #[must_use]
  pub fn snapshot(&self) -> Snapshot {
    Snapshot::capture(self.inner.store.view().iter(), self.stats())
  }

  #[must_use]
  pub fn state(&self) -> MonitorState {
    if self.enabled() {
      MonitorState::Enabled
    } else {
      MonitorState::Disabled
    }
  }

  #[must_use]
  pub fn stats(&self) -> MonitorStats {
    let (garbage, live) = self
      .inner
      .store
      .iter()
      .fold((0, 0), |(garbage, live), event| {
        if event.is_garbage() {
          (garbage + 1, live)
        } else {
          (garbage, live + 1)
        }
      });

    MonitorStats {
      cycles_reconciled: self.inner.reconciler.completed_cycle(),
      dropped: self.inner.store.dropped(),
      garbage,
      live,
      samples_taken: self.inner.samples_taken.load(Ordering::Relaxed),
      sampled_bytes: self.inner.sampled_bytes.load(Ordering::Relaxed),
    }
  }

  #[must_use]
  pub fn with_capture(
    config: MonitorConfig,
    capture: Arc<dyn StackCapture>,
  ) -> Self {
    let inner = MonitorInner {
      capture,
      enabled: AtomicBool::new(config.start_enabled),
      next_event_id: AtomicU64::new(1),
      reconciler: Reconciler::new(),
      sampled_bytes: AtomicU64::new(0),
      sampler: Sampler::new(config.sampling_interval, config.seed),
      samples_taken: AtomicU64::new(0),
      stacks: StackTable::new(),
      store: EventStore::new(config.capacity),
      config,
    };

    Self {
      inner: Arc::new(inner),
    }
  }

  #[must_use]
  pub fn with_config(config: MonitorConfig) -> Self {
    Self::builder().with_config(config).finish()
  }

  fn max_depth(&self) -> usize {
    usize::from(self.inner.config.max_stack_depth.max(1))
  }

  fn should_sample(&self, size: u64) -> bool {
    self.enabled() && self.inner.sampler.sample(size)
  }
}
