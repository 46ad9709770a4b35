use super::*;

/// Errors surfaced by the monitor's control operations.
///
/// Sampling itself never fails: dropped samples and liveness oracle faults
/// are absorbed and counted instead of being reported here.
#[derive(Debug)]
pub enum MonitorError {
  /// The forced collection cycle did not finish reconciling in time.
  CollectionTimeout { cycle: u64, waited: Duration },
  /// A configuration value could not be parsed.
  InvalidConfig { key: String, value: String },
}

impl Display for MonitorError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::CollectionTimeout { cycle, waited } => write!(
        f,
        "collection cycle {cycle} was not reconciled within {waited:?}"
      ),
      Self::InvalidConfig { key, value } => {
        write!(f, "invalid value {value:?} for {key}")
      }
    }
  }
}

impl std::error::Error for MonitorError {}

/// Errors that can occur when exporting a snapshot.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode snapshot as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}
