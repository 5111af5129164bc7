use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Stream reserved for search proposals. Loss years use streams `0..years`,
/// so this sits well above any realistic batch size.
const SEARCH_STREAM: u64 = u64::MAX;

/// Shared cancellation flag. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run state: seed, search RNG, cancellation and the wall-clock budget.
/// One context per optimisation run; concurrent runs never share one.
pub struct RunContext {
    pub seed: u64,
    pub rng: ChaCha20Rng,
    pub cancel: CancelToken,
    started: Instant,
    time_budget: Option<Duration>,
}

impl RunContext {
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        rng.set_stream(SEARCH_STREAM);
        RunContext {
            seed,
            rng,
            cancel: CancelToken::new(),
            started: Instant::now(),
            time_budget: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn out_of_time(&self) -> bool {
        self.time_budget.is_some_and(|b| self.started.elapsed() >= b)
    }
}

/// A seed for callers that did not supply one; echoed back in the run report.
pub fn fresh_seed() -> u64 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!handle.is_cancelled());
        token.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn same_seed_gives_same_search_stream() {
        let mut a = RunContext::new(7);
        let mut b = RunContext::new(7);
        let xs: Vec<u64> = (0..8).map(|_| a.rng.random()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.rng.random()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn zero_time_budget_is_immediately_exhausted() {
        let ctx = RunContext::new(1).with_time_budget(Duration::ZERO);
        assert!(ctx.out_of_time());
        assert!(!RunContext::new(1).out_of_time());
    }
}
