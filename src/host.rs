//! Minimal in-process host runtime.
//!
//! `ManagedHeap` hands out strong [`Handle`]s to the objects it allocates and
//! keeps only weak references itself, so an object becomes unreachable as
//! soon as the last handle is dropped. It reports allocations to attached
//! monitors, answers liveness queries, and runs collection cycles either on
//! the calling thread or on a dedicated collector thread.

use {
  super::*,
  std::{
    any::Any,
    sync::{
      Weak,
      mpsc::{self, Sender},
    },
    thread::{self, JoinHandle},
  },
};

type ObjectTable =
  HashMap<ObjectId, Weak<dyn Any + Send + Sync>, BuildNoHashHasher<ObjectId>>;

/// Strong reference to an object allocated on a `ManagedHeap`.
#[derive(Debug)]
pub struct Handle<T> {
  object: ObjectId,
  value: Arc<T>,
}

impl<T> Clone for Handle<T> {
  fn clone(&self) -> Self {
    Self {
      object: self.object,
      value: Arc::clone(&self.value),
    }
  }
}

impl<T> std::ops::Deref for Handle<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.value
  }
}

impl<T> Handle<T> {
  #[must_use]
  pub fn object(&self) -> ObjectId {
    self.object
  }
}

#[derive(Default)]
struct HeapInner {
  last_cycle: AtomicU64,
  monitors: Mutex<Vec<Monitor>>,
  next_object: AtomicU64,
  objects: Mutex<ObjectTable>,
}

impl HeapInner {
  /// Finish `cycle`: let every monitor reconcile against the current object
  /// table, then sweep the entries of unreachable objects.
  fn collect(&self, cycle: u64) {
    let monitors = lock(&self.monitors).clone();

    for monitor in &monitors {
      monitor.reconcile(cycle, self);
    }

    let mut objects = lock(&self.objects);
    let before = objects.len();
    objects.retain(|_, weak| weak.strong_count() > 0);

    debug!(cycle, swept = before - objects.len(), "collection finished");
  }
}

impl LivenessOracle for HeapInner {
  fn is_reachable(&self, object: ObjectId) -> Result<bool, OracleError> {
    lock(&self.objects)
      .get(&object)
      .map(|weak| weak.strong_count() > 0)
      .ok_or(OracleError::UnknownObject(object))
  }
}

struct BackgroundCollector {
  requests: Option<Sender<u64>>,
  worker: Option<JoinHandle<()>>,
}

impl Drop for BackgroundCollector {
  fn drop(&mut self) {
    self.requests.take();

    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

/// Reference heap used to drive monitors end to end.
#[derive(Default)]
pub struct ManagedHeap {
  background: Option<BackgroundCollector>,
  inner: Arc<HeapInner>,
}

impl ManagedHeap {
  /// Allocate `value`, reporting `size` bytes and the given stack (innermost
  /// frame first) to every attached monitor.
  pub fn allocate<T>(&self, value: T, size: u64, frames: &[Frame]) -> Handle<T>
  where
    T: Any + Send + Sync,
  {
    let object =
      ObjectId(self.inner.next_object.fetch_add(1, Ordering::Relaxed) + 1);
    let value = Arc::new(value);
    let erased: Arc<dyn Any + Send + Sync> = value.clone();

    lock(&self.inner.objects).insert(object, Arc::downgrade(&erased));

    for monitor in lock(&self.inner.monitors).iter() {
      monitor.on_allocation_with_frames(object, size, frames);
    }

    Handle { object, value }
  }

  /// Allocate a `size`-byte buffer that is unreachable as soon as this call
  /// returns.
  ///
  /// The allocation is reported with two heap-internal frames followed by
  /// `callers`; only the internal frames are returned, so a caller can append
  /// its own frame to rebuild the recorded stack.
  pub fn allocate_garbage(&self, size: u64, callers: &[Frame]) -> Vec<Frame> {
    let internal = vec![
      Frame::new("allocate_buffer", "(u64)", file!(), line!()),
      Frame::new("allocate_garbage", "(u64)", file!(), line!()),
    ];

    let mut frames = internal.clone();
    frames.extend_from_slice(callers);

    let capacity = usize::try_from(size).unwrap_or(0);
    drop(self.allocate(Vec::<u8>::with_capacity(capacity), size, &frames));

    internal
  }

  /// Report this heap's allocations and collections to `monitor`.
  pub fn attach(&self, monitor: &Monitor) {
    lock(&self.inner.monitors).push(monitor.clone());
  }

  /// Number of objects the heap still tracks, reachable or not.
  #[must_use]
  pub fn len(&self) -> usize {
    lock(&self.inner.objects).len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Run collection cycles on a dedicated thread instead of the caller's.
  #[must_use]
  pub fn with_background_collector(mut self) -> Self {
    let (requests, pending) = mpsc::channel::<u64>();
    let inner = Arc::clone(&self.inner);

    let worker = thread::Builder::new()
      .name("heap-collector".into())
      .spawn(move || {
        while let Ok(cycle) = pending.recv() {
          inner.collect(cycle);
        }
      });

    match worker {
      Ok(worker) => {
        self.background = Some(BackgroundCollector {
          requests: Some(requests),
          worker: Some(worker),
        });
      }
      Err(err) => {
        warn!(%err, "could not spawn collector thread, collecting inline");
      }
    }

    self
  }
}

impl Collector for ManagedHeap {
  fn request_collection(&self) -> u64 {
    let cycle = self.inner.last_cycle.fetch_add(1, Ordering::AcqRel) + 1;

    let queued = self
      .background
      .as_ref()
      .and_then(|background| background.requests.as_ref())
      .is_some_and(|requests| requests.send(cycle).is_ok());

    if !queued {
      self.inner.collect(cycle);
    }

    cycle
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
