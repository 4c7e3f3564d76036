//! Work probes for exercising guarded writes.
//!
//! A [`WorkProbe`] stands in for the side-effecting write. Tests assert on how often it
//! ran, and script it to fail, to take time, or to block until released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;

/// Scripted failure returned by [`WorkProbe::invoke`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("scripted failure on call {call}")]
pub struct ProbeFailure {
    /// 1-based call number that failed.
    pub call: usize,
}

/// Counts invocations of a stand-in unit of work.
#[derive(Debug, Default)]
pub struct WorkProbe {
    calls: AtomicUsize,
    completed: AtomicUsize,
    failures_remaining: AtomicUsize,
    delay: Option<Duration>,
    gate: Option<Semaphore>,
}

impl WorkProbe {
    /// Creates a probe that always succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a probe whose first `n` invocations fail.
    #[must_use]
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Makes every invocation take `delay` before finishing.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every invocation block until [`release`](Self::release) is called.
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Lets one blocked (or future) invocation through the gate.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Runs the stand-in work. Returns the 1-based call number.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeFailure`] while scripted failures remain.
    pub async fn invoke(&self) -> Result<usize, ProbeFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate never closed").forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ProbeFailure { call });
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(call)
    }

    /// Number of invocations started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of invocations that succeeded.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` invocations have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn probe_counts_calls() {
        let probe = WorkProbe::new();
        assert_eq!(probe.invoke().await, Ok(1));
        assert_eq!(probe.invoke().await, Ok(2));
        assert_eq!(probe.calls(), 2);
        assert_eq!(probe.completed(), 2);
    }

    #[tokio::test]
    async fn probe_scripted_failures() {
        let probe = WorkProbe::failing_first(1);
        assert_eq!(probe.invoke().await, Err(ProbeFailure { call: 1 }));
        assert_eq!(probe.invoke().await, Ok(2));
        assert_eq!(probe.completed(), 1);
    }

    #[tokio::test]
    async fn probe_gate_blocks_until_released() {
        let probe = Arc::new(WorkProbe::new().gated());
        let task = tokio::spawn({
            let probe = Arc::clone(&probe);
            async move { probe.invoke().await }
        });

        probe.wait_for_calls(1).await;
        assert_eq!(probe.completed(), 0);

        probe.release();
        assert_eq!(task.await.expect("join"), Ok(1));
    }
}
