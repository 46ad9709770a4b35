use super::*;

/// Why the host could not answer a liveness query.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OracleError {
  /// The identity was already freed or was never known to the collector.
  UnknownObject(ObjectId),
  /// Any other host-side failure.
  Host(String),
}

impl Display for OracleError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::UnknownObject(object) => write!(f, "unknown object {object}"),
      Self::Host(message) => write!(f, "liveness query failed: {message}"),
    }
  }
}

impl std::error::Error for OracleError {}

/// Reachability answers supplied by the host collector at the end of a cycle.
pub trait LivenessOracle {
  /// # Errors
  ///
  /// Returns an `OracleError` when the identity cannot be resolved. The
  /// reconciler treats that as unreachable.
  fn is_reachable(&self, object: ObjectId) -> Result<bool, OracleError>;
}

impl<F> LivenessOracle for F
where
  F: Fn(ObjectId) -> Result<bool, OracleError>,
{
  fn is_reachable(&self, object: ObjectId) -> Result<bool, OracleError> {
    self(object)
  }
}

/// Host hook used to force a collection.
pub trait Collector {
  /// Start a collection and return the number of the cycle it will complete
  /// as. The host must call `Monitor::reconcile` with that number once the
  /// cycle's liveness information is final, on any thread.
  fn request_collection(&self) -> u64;
}

/// Outcome of a single reconciliation pass.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct ReconcileReport {
  /// Events that were already garbage and left untouched.
  pub already_garbage: usize,
  pub cycle: u64,
  /// Events visited during the pass.
  pub examined: usize,
  /// Events newly moved to garbage in this pass.
  pub newly_garbage: usize,
  /// Oracle errors or panics, each counted as unreachable.
  pub oracle_faults: usize,
  /// Events confirmed reachable.
  pub still_live: usize,
}

#[derive(Debug, Default)]
struct CycleState {
  completed: u64,
  last_report: Option<ReconcileReport>,
  next_ticket: u64,
  /// Reports of passes finished since each waiter registered, keyed by
  /// ticket.
  waiters: HashMap<u64, Vec<ReconcileReport>, BuildNoHashHasher<u64>>,
}

/// Reclassifies stored events at collection boundaries and lets callers wait
/// for a particular cycle to be reconciled.
#[derive(Debug, Default)]
pub struct Reconciler {
  cycle: Mutex<CycleState>,
  reconciled: Condvar,
}

impl Reconciler {
  /// Highest cycle number reconciled so far.
  #[must_use]
  pub fn completed_cycle(&self) -> u64 {
    self.lock_cycle().completed
  }

  #[must_use]
  pub fn last_report(&self) -> Option<ReconcileReport> {
    self.lock_cycle().last_report
  }

  fn lock_cycle(&self) -> MutexGuard<'_, CycleState> {
    self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Walk the store once, moving every live event whose object the oracle
  /// reports unreachable to garbage, then publish `cycle` as completed.
  ///
  /// Events inserted while the walk is in progress may be skipped until the
  /// next cycle.
  pub fn reconcile(
    &self,
    store: &EventStore,
    cycle: u64,
    oracle: &dyn LivenessOracle,
  ) -> ReconcileReport {
    let mut report = ReconcileReport {
      cycle,
      ..ReconcileReport::default()
    };

    for event in store.view().iter() {
      report.examined += 1;

      if event.is_garbage() {
        report.already_garbage += 1;
        continue;
      }

      let reachable = match query(oracle, event.object()) {
        Ok(reachable) => reachable,
        Err(err) => {
          debug!(
            event = event.id(),
            %err,
            "liveness query failed, treating object as garbage"
          );
          report.oracle_faults += 1;
          false
        }
      };

      if reachable {
        report.still_live += 1;
      } else if event.mark_garbage() {
        report.newly_garbage += 1;
      } else {
        report.already_garbage += 1;
      }
    }

    info!(
      cycle,
      examined = report.examined,
      newly_garbage = report.newly_garbage,
      oracle_faults = report.oracle_faults,
      "reconciled sampled events"
    );

    let mut state = self.lock_cycle();
    state.completed = state.completed.max(cycle);
    state.last_report = Some(report);

    for seen in state.waiters.values_mut() {
      seen.push(report);
    }

    drop(state);

    self.reconciled.notify_all();

    report
  }

  /// Register interest in passes that finish from now on.
  ///
  /// Take the waiter before asking the host for a collection, so a pass
  /// that completes before `CycleWaiter::wait` is called is not missed.
  #[must_use]
  pub fn waiter(&self) -> CycleWaiter<'_> {
    let mut state = self.lock_cycle();
    let ticket = state.next_ticket;
    state.next_ticket += 1;
    state.waiters.insert(ticket, Vec::new());

    CycleWaiter {
      reconciler: self,
      ticket,
    }
  }
}

/// Pending wait for a pass that finishes after the waiter was created.
///
/// Cycle numbers from different hosts, or from a restarted host, may repeat
/// or go backwards; only passes observed after registration count.
#[derive(Debug)]
pub struct CycleWaiter<'a> {
  reconciler: &'a Reconciler,
  ticket: u64,
}

impl CycleWaiter<'_> {
  /// Block until a pass for `cycle` has finished since this waiter was
  /// created, returning that pass's report.
  ///
  /// Returns `None` if `timeout` elapsed first.
  #[must_use]
  pub fn wait(
    self,
    cycle: u64,
    timeout: Option<Duration>,
  ) -> Option<ReconcileReport> {
    let ticket = self.ticket;
    let pending = |state: &mut CycleState| {
      !state
        .waiters
        .get(&ticket)
        .is_some_and(|seen| seen.iter().any(|report| report.cycle == cycle))
    };

    let state = self.reconciler.lock_cycle();

    let state = match timeout {
      None => self
        .reconciler
        .reconciled
        .wait_while(state, pending)
        .unwrap_or_else(PoisonError::into_inner),
      Some(timeout) => {
        self
          .reconciler
          .reconciled
          .wait_timeout_while(state, timeout, pending)
          .unwrap_or_else(PoisonError::into_inner)
          .0
      }
    };

    state
      .waiters
      .get(&ticket)
      .and_then(|seen| seen.iter().find(|report| report.cycle == cycle))
      .copied()
  }
}

impl Drop for CycleWaiter<'_> {
  fn drop(&mut self) {
    self.reconciler.lock_cycle().waiters.remove(&self.ticket);
  }
}

/// Ask the oracle, absorbing panics as faults.
fn query(
  oracle: &dyn LivenessOracle,
  object: ObjectId,
) -> Result<bool, OracleError> {
  panic::catch_unwind(AssertUnwindSafe(|| oracle.is_reachable(object)))
    .unwrap_or_else(|_| {
      Err(OracleError::Host(format!("oracle panicked for {object}")))
    })
}
