use super::*;

/// Bound on how many fresh thresholds a single allocation may consume when
/// carrying its excess forward.
const MAX_CARRY_DRAWS: u32 = 64;

/// Byte-interval sampler.
///
/// Allocated bytes are subtracted from a countdown; the allocation that
/// exhausts it is sampled and the countdown is refilled with a threshold drawn
/// from an exponential distribution whose mean is the sampling interval. The
/// probability of sampling an allocation of `S` bytes is therefore roughly
/// `S / interval`, regardless of what was allocated before it.
#[derive(Debug)]
pub struct Sampler {
  interval: AtomicU64,
  remaining: AtomicU64,
  rng: Mutex<SmallRng>,
}

impl Sampler {
  /// Mean number of bytes between samples.
  #[must_use]
  pub fn interval(&self) -> u64 {
    self.interval.load(Ordering::Relaxed)
  }

  #[must_use]
  pub fn new(interval: u64, seed: Option<u64>) -> Self {
    let mut rng = match seed {
      Some(seed) => SmallRng::seed_from_u64(seed),
      None => SmallRng::from_entropy(),
    };

    let remaining = draw_threshold(&mut rng, interval);

    Self {
      interval: AtomicU64::new(interval),
      remaining: AtomicU64::new(remaining),
      rng: Mutex::new(rng),
    }
  }

  /// Bytes left before the next allocation gets sampled.
  #[must_use]
  pub fn remaining(&self) -> u64 {
    self.remaining.load(Ordering::Acquire)
  }

  /// Account for an allocation of `size` bytes and decide whether to sample
  /// it.
  ///
  /// The countdown update is a single compare-and-exchange, so when several
  /// threads race across the same threshold exactly one of them observes the
  /// crossing.
  pub fn sample(&self, size: u64) -> bool {
    if size == 0 {
      return false;
    }

    let interval = self.interval();

    if interval == 0 {
      return true;
    }

    let mut crossed = false;

    // The closure may run more than once under contention; only the value it
    // returned for the successful exchange counts.
    let _ = self.remaining.fetch_update(
      Ordering::AcqRel,
      Ordering::Acquire,
      |remaining| {
        if size < remaining {
          crossed = false;
          return Some(remaining - size);
        }

        crossed = true;
        Some(self.refill(size - remaining, interval))
      },
    );

    crossed
  }

  /// Change the mean interval. The current countdown is redrawn.
  pub fn set_interval(&self, interval: u64) {
    self.interval.store(interval, Ordering::Relaxed);
    let threshold = draw_threshold(&mut self.lock_rng(), interval);
    self.remaining.store(threshold, Ordering::Release);
  }

  fn lock_rng(&self) -> MutexGuard<'_, SmallRng> {
    self.rng.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Next countdown after a crossing, with `excess` bytes already consumed.
  fn refill(&self, mut excess: u64, interval: u64) -> u64 {
    let mut rng = self.lock_rng();

    for _ in 0..MAX_CARRY_DRAWS {
      let threshold = draw_threshold(&mut rng, interval);

      if excess < threshold {
        return threshold - excess;
      }

      excess -= threshold;
    }

    draw_threshold(&mut rng, interval)
  }
}

/// Draw from an exponential distribution with the given mean, never below one
/// byte.
fn draw_threshold(rng: &mut SmallRng, mean: u64) -> u64 {
  if mean == 0 {
    return 1;
  }

  // 1 - U keeps the argument of ln within (0, 1].
  let uniform = 1.0 - rng.r#gen::<f64>();
  let threshold = -uniform.ln() * mean as f64;

  if threshold >= u64::MAX as f64 {
    u64::MAX
  } else {
    (threshold as u64).max(1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sampled_fraction(sampler: &Sampler, size: u64, trials: u32) -> f64 {
    let hits = (0..trials).filter(|_| sampler.sample(size)).count();
    hits as f64 / f64::from(trials)
  }

  #[test]
  fn zero_sized_allocations_are_never_sampled() {
    let sampler = Sampler::new(1, Some(1));

    for _ in 0..1000 {
      assert!(!sampler.sample(0));
    }
  }

  #[test]
  fn zero_interval_samples_everything() {
    let sampler = Sampler::new(0, Some(1));

    assert!(sampler.sample(1));
    assert!(sampler.sample(16));
    assert!(!sampler.sample(0));
  }

  #[test]
  fn allocations_below_the_countdown_only_decrement_it() {
    let sampler = Sampler::new(1 << 40, Some(3));
    let before = sampler.remaining();

    assert!(!sampler.sample(8));
    assert_eq!(sampler.remaining(), before - 8);
  }

  #[test]
  fn allocation_larger_than_countdown_is_sampled() {
    let sampler = Sampler::new(1024, Some(5));
    let remaining = sampler.remaining();

    assert!(sampler.sample(remaining));
    assert!(sampler.remaining() >= 1);
  }

  #[test]
  fn sampling_probability_tracks_size_over_interval() {
    let sampler = Sampler::new(1024, Some(42));

    let small = sampled_fraction(&sampler, 64, 200_000);
    let expected = 64.0 / 1024.0;

    assert!(
      (small - expected).abs() < expected * 0.1,
      "sampled {small}, expected about {expected}"
    );
  }

  #[test]
  fn large_allocations_are_almost_always_sampled() {
    let sampler = Sampler::new(1024, Some(9));

    let fraction = sampled_fraction(&sampler, 64 * 1024, 10_000);

    assert!(fraction > 0.99, "sampled {fraction}");
  }

  #[test]
  fn huge_allocation_does_not_force_the_next_sample() {
    let mut forced = 0;

    for seed in 0..200 {
      let sampler = Sampler::new(1024, Some(seed));
      assert!(sampler.sample(1 << 20));
      if sampler.sample(1) {
        forced += 1;
      }
    }

    assert!(forced < 10, "{forced} follow-up samples");
  }

  #[test]
  fn concurrent_sampling_never_loses_or_duplicates_crossings() {
    let interval = 4096;
    let sampler = Sampler::new(interval, Some(11));
    let samples = AtomicU64::new(0);
    let threads = 8;
    let per_thread = 50_000;
    let size = 32;

    std::thread::scope(|scope| {
      for _ in 0..threads {
        scope.spawn(|| {
          for _ in 0..per_thread {
            if sampler.sample(size) {
              samples.fetch_add(1, Ordering::Relaxed);
            }
          }
        });
      }
    });

    let total_bytes = threads * per_thread * size;
    let expected = total_bytes as f64 / interval as f64;
    let observed = samples.load(Ordering::Relaxed) as f64;

    assert!(
      (observed - expected).abs() < expected * 0.1,
      "observed {observed}, expected about {expected}"
    );
  }

  #[test]
  fn set_interval_redraws_countdown() {
    let sampler = Sampler::new(1 << 40, Some(2));
    sampler.set_interval(0);

    assert_eq!(sampler.interval(), 0);
    assert!(sampler.sample(1));
  }
}
