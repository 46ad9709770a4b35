use super::*;

const ENV_PREFIX: &str = "HEAP_MONITOR_";

/// Controls how the monitor samples allocations and stores events.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
  /// Maximum number of events retained before new samples are dropped.
  pub capacity: usize,
  /// Upper bound on how long `force_garbage_collection` waits for its cycle.
  ///
  /// `None` blocks until reconciliation completes.
  pub collection_timeout: Option<Duration>,
  /// Maximum number of frames captured per sampled allocation.
  pub max_stack_depth: u16,
  /// Native frames skipped past the monitor's own, such as host allocator
  /// wrappers.
  pub native_skip_frames: usize,
  /// Mean number of allocated bytes between two samples. Zero samples every
  /// non-empty allocation.
  pub sampling_interval: u64,
  /// Seed for the threshold generator. `None` seeds from the OS.
  pub seed: Option<u64>,
  /// Whether sampling starts enabled once the monitor is constructed.
  pub start_enabled: bool,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      capacity: 64 * 1024,
      collection_timeout: None,
      max_stack_depth: 64,
      native_skip_frames: 0,
      sampling_interval: 512 * 1024,
      seed: None,
      start_enabled: false,
    }
  }
}

impl MonitorConfig {
  /// Explicitly enable sampling at construction time.
  #[must_use]
  pub fn enabled(mut self) -> Self {
    self.start_enabled = true;
    self
  }

  /// Build a configuration from `HEAP_MONITOR_*` environment variables,
  /// falling back to defaults for anything unset.
  ///
  /// # Errors
  ///
  /// Returns `MonitorError::InvalidConfig` when a variable is set but cannot
  /// be parsed.
  pub fn from_env() -> Result<Self, MonitorError> {
    Self::default().with_env_overrides()
  }

  /// Override fields of this configuration with any `HEAP_MONITOR_*`
  /// environment variables that are set; unset variables keep the current
  /// values.
  ///
  /// Recognized keys: `SAMPLING_INTERVAL`, `CAPACITY`, `MAX_STACK_DEPTH`,
  /// `NATIVE_SKIP_FRAMES`, `SEED`, `COLLECTION_TIMEOUT_MS` and `ENABLED`.
  ///
  /// # Errors
  ///
  /// Returns `MonitorError::InvalidConfig` when a variable is set but cannot
  /// be parsed.
  pub fn with_env_overrides(self) -> Result<Self, MonitorError> {
    self.overlay(|key| std::env::var(key).ok())
  }

  pub(crate) fn overlay<F>(mut self, lookup: F) -> Result<Self, MonitorError>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(value) = parse_var(&lookup, "SAMPLING_INTERVAL")? {
      self.sampling_interval = value;
    }

    if let Some(value) = parse_var(&lookup, "CAPACITY")? {
      self.capacity = value;
    }

    if let Some(value) = parse_var(&lookup, "MAX_STACK_DEPTH")? {
      self.max_stack_depth = value;
    }

    if let Some(value) = parse_var(&lookup, "NATIVE_SKIP_FRAMES")? {
      self.native_skip_frames = value;
    }

    if let Some(seed) = parse_var(&lookup, "SEED")? {
      self.seed = Some(seed);
    }

    if let Some(millis) = parse_var(&lookup, "COLLECTION_TIMEOUT_MS")? {
      self.collection_timeout = Some(Duration::from_millis(millis));
    }

    if let Some(raw) = lookup(&format!("{ENV_PREFIX}ENABLED")) {
      self.start_enabled = parse_bool("ENABLED", &raw)?;
    }

    Ok(self)
  }

  /// Builder-style helper to adjust the store capacity.
  #[must_use]
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  /// Builder-style helper to adjust the maximum stack depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: u16) -> Self {
    self.max_stack_depth = depth;
    self
  }

  /// Builder-style helper to adjust the mean sampling interval.
  #[must_use]
  pub fn with_sampling_interval(mut self, bytes: u64) -> Self {
    self.sampling_interval = bytes;
    self
  }

  #[must_use]
  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = Some(seed);
    self
  }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, MonitorError>
where
  T: std::str::FromStr,
  F: Fn(&str) -> Option<String>,
{
  let Some(raw) = lookup(&format!("{ENV_PREFIX}{key}")) else {
    return Ok(None);
  };

  raw
    .trim()
    .parse::<T>()
    .map(Some)
    .map_err(|_| MonitorError::InvalidConfig {
      key: format!("{ENV_PREFIX}{key}"),
      value: raw,
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, MonitorError> {
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(MonitorError::InvalidConfig {
      key: format!("{ENV_PREFIX}{key}"),
      value: raw.to_string(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(key, value)| (format!("{ENV_PREFIX}{key}"), (*value).to_string()))
      .collect()
  }

  #[test]
  fn defaults_when_nothing_is_set() {
    let config = MonitorConfig::default().overlay(|_| None).unwrap();

    assert_eq!(config.sampling_interval, 512 * 1024);
    assert_eq!(config.capacity, 64 * 1024);
    assert!(!config.start_enabled);
    assert!(config.seed.is_none());
    assert!(config.collection_timeout.is_none());
  }

  #[test]
  fn reads_overrides() {
    let env = env_of(&[
      ("SAMPLING_INTERVAL", "1024"),
      ("CAPACITY", "8"),
      ("SEED", "7"),
      ("COLLECTION_TIMEOUT_MS", "250"),
      ("ENABLED", "yes"),
    ]);
    let config = MonitorConfig::default()
      .overlay(|key| env.get(key).cloned())
      .unwrap();

    assert_eq!(config.sampling_interval, 1024);
    assert_eq!(config.capacity, 8);
    assert_eq!(config.seed, Some(7));
    assert_eq!(config.collection_timeout, Some(Duration::from_millis(250)));
    assert!(config.start_enabled);
  }

  #[test]
  fn unset_variables_keep_existing_values() {
    let base = MonitorConfig::default()
      .with_sampling_interval(1024)
      .with_seed(48);

    let config = base.clone().overlay(|_| None).unwrap();

    assert_eq!(config.sampling_interval, 1024);
    assert_eq!(config.seed, Some(48));

    let env = env_of(&[("SAMPLING_INTERVAL", "4096"), ("SEED", "9")]);
    let config = base.overlay(|key| env.get(key).cloned()).unwrap();

    assert_eq!(config.sampling_interval, 4096);
    assert_eq!(config.seed, Some(9));
  }

  #[test]
  fn rejects_malformed_values() {
    let env = env_of(&[("CAPACITY", "lots")]);
    let err = MonitorConfig::default()
      .overlay(|key| env.get(key).cloned())
      .unwrap_err();

    match err {
      MonitorError::InvalidConfig { key, value } => {
        assert_eq!(key, "HEAP_MONITOR_CAPACITY");
        assert_eq!(value, "lots");
      }
      other => panic!("unexpected error: {other}"),
    }

    let env = env_of(&[("ENABLED", "maybe")]);
    assert!(
      MonitorConfig::default()
        .overlay(|key| env.get(key).cloned())
        .is_err()
    );
  }
}
