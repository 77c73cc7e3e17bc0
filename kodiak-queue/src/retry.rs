//! The Retry Resolver (component B): computes a job's next-attempt delay
//! from its backoff config before the worker reports a failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::job::BackoffKind;

/// A registered custom backoff strategy: `(attemptsMade, baseDelay) -> delay`.
pub type BackoffStrategyFn = dyn Fn(u32, Duration) -> Duration + Send + Sync;

/// Registry of named backoff strategies a `Worker` can dispatch to, beyond
/// the built-in `fixed`/`exponential` kinds. Mirrors
/// `WorkerOptions::backoff_strategies` in SPEC_FULL.md §6.
#[derive(Clone, Default)]
pub struct BackoffStrategies(HashMap<String, Arc<BackoffStrategyFn>>);

impl BackoffStrategies {
    pub fn new() -> Self {
        BackoffStrategies(HashMap::new())
    }

    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(u32, Duration) -> Duration + Send + Sync + 'static,
    {
        self.0.insert(name.into(), Arc::new(f));
        self
    }

    /// Resolve the next-attempt delay for a failed job. Returns `None` if
    /// no backoff is configured, which tells `fail_job` to retry
    /// immediately, and `None` for an unrecognized custom strategy name
    /// (also treated as immediate retry, per SPEC_FULL.md §4.7).
    pub fn resolve(
        &self,
        kind: &BackoffKind,
        base_delay: Duration,
        attempts_made: u32,
    ) -> Option<Duration> {
        match kind {
            BackoffKind::Fixed => Some(base_delay),
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                Some(base_delay.saturating_mul(factor as u32))
            }
            BackoffKind::Custom(name) => self.0.get(name).map(|f| f(attempts_made, base_delay)),
        }
    }
}

impl std::fmt::Debug for BackoffStrategies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffStrategies")
            .field("names", &self.0.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let strategies = BackoffStrategies::new();
        let delay = Duration::from_millis(1000);
        assert_eq!(
            strategies.resolve(&BackoffKind::Fixed, delay, 1),
            Some(delay)
        );
        assert_eq!(
            strategies.resolve(&BackoffKind::Fixed, delay, 5),
            Some(delay)
        );
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let strategies = BackoffStrategies::new();
        let base = Duration::from_millis(500);
        assert_eq!(
            strategies.resolve(&BackoffKind::Exponential, base, 1),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            strategies.resolve(&BackoffKind::Exponential, base, 2),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            strategies.resolve(&BackoffKind::Exponential, base, 3),
            Some(Duration::from_millis(2000))
        );
    }

    #[test]
    fn unregistered_custom_strategy_resolves_to_none() {
        let strategies = BackoffStrategies::new();
        let base = Duration::from_millis(100);
        assert_eq!(
            strategies.resolve(&BackoffKind::Custom("nonexistent".into()), base, 1),
            None
        );
    }

    #[test]
    fn registered_custom_strategy_is_dispatched() {
        let strategies =
            BackoffStrategies::new().register("double-plus-ten", |attempts, base| {
                base * attempts + Duration::from_millis(10)
            });
        let base = Duration::from_millis(100);
        assert_eq!(
            strategies.resolve(&BackoffKind::Custom("double-plus-ten".into()), base, 3),
            Some(Duration::from_millis(310))
        );
    }
}
