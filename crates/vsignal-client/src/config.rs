// Tunable knobs of the SDK runtime, with environment overrides.
use std::time::Duration;

const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_MAX_METADATA_LOOKUPS: usize = 5;
const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_FACTOR: u32 = 2;
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(2000);

/// Runtime configuration of one SDK context.
///
/// Defaults match the broker deployment profile this SDK ships against;
/// `from_env` layers `VSIGNAL_*` overrides on top.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Worker tasks draining the shared job queue.
    pub worker_threads: usize,
    /// Upper bound on concurrently in-flight metadata lookups.
    pub max_parallel_metadata_lookups: usize,
    /// First resubscribe delay after a transient subscription loss.
    pub backoff_initial: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: u32,
    /// Ceiling the delay saturates at.
    pub backoff_cap: Duration,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            max_parallel_metadata_lookups: DEFAULT_MAX_METADATA_LOOKUPS,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl SdkConfig {
    /// Defaults overridden by `VSIGNAL_WORKER_THREADS`,
    /// `VSIGNAL_MAX_METADATA_LOOKUPS`, `VSIGNAL_BACKOFF_INITIAL_MS` and
    /// `VSIGNAL_BACKOFF_CAP_MS`. Unparseable values are ignored with a
    /// warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_env::<usize>("VSIGNAL_WORKER_THREADS") {
            config.worker_threads = n.max(1);
        }
        if let Some(n) = parse_env::<usize>("VSIGNAL_MAX_METADATA_LOOKUPS") {
            config.max_parallel_metadata_lookups = n.max(1);
        }
        if let Some(ms) = parse_env::<u64>("VSIGNAL_BACKOFF_INITIAL_MS") {
            config.backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("VSIGNAL_BACKOFF_CAP_MS") {
            config.backoff_cap = Duration::from_millis(ms);
        }
        config
    }

    /// Delay for a retry attempt, zero-based: initial * factor^attempt,
    /// saturating at the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1);
        let mut delay = self.backoff_initial;
        for _ in 0..attempt {
            delay = delay.saturating_mul(factor);
            if delay >= self.backoff_cap {
                return self.backoff_cap;
            }
        }
        delay.min(self.backoff_cap)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%name, %raw, "ignoring unparseable override");
            None
        }
    }
}
