use super::*;

/// Unique identifier for an interned stack trace.
pub type StackId = u64;

/// One frame of a captured call stack.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Frame {
  pub line: u32,
  pub name: Arc<str>,
  pub signature: Arc<str>,
  pub source_file: Arc<str>,
}

impl Frame {
  #[must_use]
  pub fn new(
    name: impl Into<String>,
    signature: impl Into<String>,
    source_file: impl Into<String>,
    line: u32,
  ) -> Self {
    Self {
      line,
      name: Arc::<str>::from(name.into()),
      signature: Arc::<str>::from(signature.into()),
      source_file: Arc::<str>::from(source_file.into()),
    }
  }

  #[must_use]
  pub(crate) fn unknown() -> Self {
    Self::new("<unknown>", "", "<unknown>", 0)
  }
}

impl Display for Frame {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}{} ({}:{})",
      self.name, self.signature, self.source_file, self.line
    )
  }
}

/// An interned call stack, innermost frame first.
///
/// Index 0 is the frame that performed the allocation and the last element
/// is the outermost caller.
#[derive(Debug, Clone)]
pub struct StackTrace {
  frames: Arc<[Frame]>,
  id: StackId,
}

impl StackTrace {
  /// The frames of this trace, innermost first.
  #[must_use]
  pub fn frames(&self) -> &[Frame] {
    &self.frames
  }

  #[must_use]
  pub fn id(&self) -> StackId {
    self.id
  }

  /// Whether `pattern` equals the innermost `pattern.len()` frames.
  #[must_use]
  pub fn starts_with(&self, pattern: &[Frame]) -> bool {
    !pattern.is_empty() && self.frames.starts_with(pattern)
  }
}

/// How a caller-supplied frame list is compared against recorded traces.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TracePattern {
  /// The recorded trace must be exactly these frames.
  Exact(Vec<Frame>),
  /// These frames must be the innermost frames of the recorded trace. Extra
  /// outer frames are allowed.
  Leading(Vec<Frame>),
}

impl TracePattern {
  /// Empty patterns never match anything.
  #[must_use]
  pub fn matches(&self, trace: &StackTrace) -> bool {
    match self {
      Self::Exact(frames) => {
        !frames.is_empty() && trace.frames() == frames.as_slice()
      }
      Self::Leading(frames) => trace.starts_with(frames),
    }
  }
}

#[derive(Debug)]
struct StackTableInner {
  by_frames: HashMap<Arc<[Frame]>, Arc<StackTrace>>,
  next_id: StackId,
}

impl Default for StackTableInner {
  fn default() -> Self {
    Self {
      by_frames: HashMap::new(),
      next_id: 1,
    }
  }
}

/// Interns stack traces so identical stacks share one allocation.
#[derive(Debug, Default)]
pub struct StackTable {
  inner: Mutex<StackTableInner>,
}

impl StackTable {
  /// Forget every interned trace. Traces already handed out stay valid.
  pub fn clear(&self) {
    self.lock_inner().by_frames.clear();
  }

  /// Intern the provided frames and return the shared trace.
  pub fn intern<I>(&self, frames: I) -> Arc<StackTrace>
  where
    I: Into<Vec<Frame>>,
  {
    let frames: Arc<[Frame]> = Arc::from(frames.into().into_boxed_slice());

    let mut inner = self.lock_inner();

    if let Some(existing) = inner.by_frames.get(&frames) {
      return Arc::clone(existing);
    }

    let id = inner.next_id;
    inner.next_id = inner.next_id.saturating_add(1);

    let trace = Arc::new(StackTrace {
      frames: Arc::clone(&frames),
      id,
    });

    inner.by_frames.insert(frames, Arc::clone(&trace));

    trace
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.lock_inner().by_frames.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock_inner(&self) -> MutexGuard<'_, StackTableInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }
}
