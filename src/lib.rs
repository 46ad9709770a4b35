//! Core library entry point for the sampling heap monitor.
//!
//! The monitor probabilistically records allocation events together with the
//! call stack that produced them, keeps them in a bounded table, and
//! reconciles that table against the host collector so callers can tell which
//! sampled objects are still live and which were reclaimed.

mod aggregator;
mod config;
mod error;
mod event;
pub mod host;
mod reconciler;
mod sampler;
mod snapshot;
mod stack;
mod stack_capture;
mod state;
mod store;

use {
  backtrace::SymbolName,
  nohash_hasher::BuildNoHashHasher,
  rand::{Rng, SeedableRng, rngs::SmallRng},
  serde::{Serialize, Serializer, ser::SerializeStruct},
  std::{
    collections::HashMap,
    ffi::OsStr,
    fmt::{self, Display, Formatter},
    io::{self, Write},
    panic::{self, AssertUnwindSafe},
    sync::{
      Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard,
      RwLockWriteGuard,
      atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
  },
  tracing::{debug, info, trace, warn},
};

pub use {
  aggregator::{Aggregator, StackSummary},
  config::MonitorConfig,
  error::{ExportError, MonitorError},
  event::{EventId, EventState, ObjectId, SampledEvent},
  reconciler::{
    Collector, CycleWaiter, LivenessOracle, OracleError, ReconcileReport,
    Reconciler,
  },
  sampler::Sampler,
  snapshot::{EventRecord, Snapshot},
  stack::{Frame, StackId, StackTable, StackTrace, TracePattern},
  stack_capture::{BacktraceCapture, NoCapture, StackCapture},
  state::{Monitor, MonitorBuilder, MonitorState, MonitorStats},
  store::{EventStore, Events},
};
