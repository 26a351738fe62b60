//! Reconnect policies.

use std::sync::Arc;
use std::time::Duration;

use crate::error::HubError;

/// What a [`RetryPolicy`] knows when asked for the next delay.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Failed reconnect attempts so far. Zero when the connection just dropped.
    pub previous_retry_count: u32,
    /// Time spent reconnecting so far.
    pub elapsed: Duration,
    /// Why the connection was lost, or why the last attempt failed.
    pub retry_reason: Arc<HubError>,
}

/// Decides whether, and after how long, to attempt the next reconnect.
pub trait RetryPolicy: Send + Sync + 'static {
    /// `None` stops reconnecting.
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration>;
}

/// Walks a fixed list of delays, then gives up.
#[derive(Debug, Clone)]
pub struct DelayRetryPolicy {
    delays: Vec<Duration>,
}

impl DelayRetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for DelayRetryPolicy {
    /// 0, 2, 10 and 30 seconds.
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

impl RetryPolicy for DelayRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self.delays.get(context.previous_retry_count as usize).copied()
    }
}

impl<F> RetryPolicy for F
where
    F: Fn(&RetryContext) -> Option<Duration> + Send + Sync + 'static,
{
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(previous_retry_count: u32) -> RetryContext {
        RetryContext {
            previous_retry_count,
            elapsed: Duration::ZERO,
            retry_reason: Arc::new(HubError::Transport("lost".into())),
        }
    }

    #[test]
    fn test_default_delays() {
        let policy = DelayRetryPolicy::default();
        let delays: Vec<_> = (0..5).map(|n| policy.next_retry_delay(&context(n))).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::ZERO),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(30)),
                None,
            ]
        );
    }

    #[test]
    fn test_empty_policy_never_retries() {
        let policy = DelayRetryPolicy::new(vec![]);
        assert_eq!(policy.next_retry_delay(&context(0)), None);
    }

    #[test]
    fn test_closure_policy() {
        let policy = |ctx: &RetryContext| {
            (ctx.previous_retry_count < 2).then(|| Duration::from_millis(10))
        };
        assert_eq!(policy.next_retry_delay(&context(1)), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_retry_delay(&context(2)), None);
    }
}
