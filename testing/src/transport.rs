//! Scripted stand-in for a remote dependency.
//!
//! A [`ScriptedTransport`] answers calls from a queue of canned results and
//! records when each call arrived (on tokio's clock, so paused-time tests can
//! assert exact backoff gaps) and with which correlation context.

use conduit_core::{CorrelationContext, TransportError};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// One call observed by a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Context the client sent with the call
    pub context: CorrelationContext,
    /// When the call arrived
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct Step<T> {
    delay: Option<Duration>,
    result: Result<T, TransportError>,
}

/// Transport answering from a script.
///
/// ```
/// use conduit_core::{CorrelationContext, TransportError};
/// use conduit_testing::ScriptedTransport;
///
/// # tokio_test::block_on(async {
/// let transport = ScriptedTransport::new()
///     .then_status(503)
///     .then_ok("pong");
///
/// let ctx = CorrelationContext::new_root();
/// assert!(transport.call(ctx.clone()).await.is_err());
/// assert_eq!(transport.call(ctx).await.unwrap(), "pong");
/// assert_eq!(transport.call_count(), 2);
/// # });
/// ```
#[derive(Debug)]
pub struct ScriptedTransport<T> {
    steps: Mutex<VecDeque<Step<T>>>,
    fallback: Option<Step<T>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl<T: Clone + Send> ScriptedTransport<T> {
    /// Empty script. Calls past the end fail with [`TransportError::Other`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer the next call with `value`.
    #[must_use]
    pub fn then_ok(self, value: T) -> Self {
        self.then(None, Ok(value))
    }

    /// Fail the next call with `error`.
    #[must_use]
    pub fn then_err(self, error: TransportError) -> Self {
        self.then(None, Err(error))
    }

    /// Fail the next call with a bare HTTP status.
    #[must_use]
    pub fn then_status(self, status: u16) -> Self {
        self.then_err(TransportError::status(status))
    }

    /// Answer the next call with `result` after `delay`.
    #[must_use]
    pub fn then_delayed(self, delay: Duration, result: Result<T, TransportError>) -> Self {
        self.then(Some(delay), result)
    }

    /// Answer every call past the end of the script with `result`.
    #[must_use]
    pub fn otherwise(mut self, result: Result<T, TransportError>) -> Self {
        self.fallback = Some(Step { delay: None, result });
        self
    }

    fn then(mut self, delay: Option<Duration>, result: Result<T, TransportError>) -> Self {
        self.steps
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Step { delay, result });
        self
    }

    /// Serve one call.
    ///
    /// # Errors
    ///
    /// Returns the scripted error, or [`TransportError::Other`] once the script
    /// is exhausted and no fallback is set.
    pub async fn call(&self, context: CorrelationContext) -> Result<T, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                context,
                at: Instant::now(),
            });

        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.fallback.clone());

        let Some(step) = step else {
            return Err(TransportError::Other("script exhausted".to_string()));
        };
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        step.result
    }

    /// Every call so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Time between consecutive calls.
    #[must_use]
    pub fn gaps(&self) -> Vec<Duration> {
        self.calls()
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect()
    }
}

impl<T: Clone + Send> Default for ScriptedTransport<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausted_script_fails() {
        let transport = ScriptedTransport::<()>::new();
        let err = transport.call(CorrelationContext::new_root()).await.unwrap_err();
        assert!(matches!(err, TransportError::Other(_)));
    }

    #[tokio::test]
    async fn fallback_answers_forever() {
        let transport = ScriptedTransport::new().then_ok(1).otherwise(Ok(2));
        let ctx = CorrelationContext::new_root();
        assert_eq!(transport.call(ctx.clone()).await.unwrap(), 1);
        assert_eq!(transport.call(ctx.clone()).await.unwrap(), 2);
        assert_eq!(transport.call(ctx).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn records_arrival_times() {
        let transport = ScriptedTransport::new().otherwise(Ok(()));
        let ctx = CorrelationContext::new_root();
        transport.call(ctx.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        transport.call(ctx.clone()).await.unwrap();

        let gaps = transport.gaps();
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0] >= Duration::from_millis(250));
        assert!(gaps[0] < Duration::from_millis(260));
        assert_eq!(transport.calls()[1].context, ctx);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_step_sleeps() {
        let transport = ScriptedTransport::new().then_delayed(Duration::from_secs(5), Ok(()));
        let started = Instant::now();
        transport.call(CorrelationContext::new_root()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
