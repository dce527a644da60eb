//! Retry/Backoff Controller
//!
//! Two concerns:
//!
//! 1. **Classification** ([`classify`]): given why a connection went away,
//!    decide whether to reconnect, stop quietly, or fail.
//! 2. **Coordination** ([`BackoffGate`]): when many operations notice the
//!    same closure at once, the first one starts a single backoff wait in
//!    its own task. Everyone queues behind it and is released together.
//!
//! ```text
//!   op A ──► wait(2) ─── root: spawns retry_wait(2) ───┐
//!   op B ──► wait(2) ─── follower ─────────────────────┤ released together
//!   op C ──► wait(2) ─── follower ─────────────────────┘
//! ```

use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::config::{FatalPredicate, RetryWait};
use crate::error::ClientError;
use crate::protocol::CloseCode;

/// Base delay of the default backoff
const BASE_DELAY_MS: u64 = 1000;

/// Exponent cap so unlimited retries cannot overflow the delay
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Jitter range added to the default backoff, in milliseconds
const JITTER_MS: std::ops::Range<u64> = 300..3000;

/// Outcome of classifying a connection failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Reconnect (after the shared backoff)
    Retry,
    /// Stop without surfacing an error
    Stop,
    /// Surface this error
    Fail(ClientError),
}

/// Connection facts the classification depends on.
pub struct RetryContext<'a> {
    pub retries: u32,
    pub retry_attempts: u32,
    pub disposed: bool,
    pub is_fatal_connection_problem: Option<&'a FatalPredicate>,
}

/// Close codes that are reported immediately and never retried.
pub fn is_terminal_close_code(code: u16) -> bool {
    match CloseCode::from(code) {
        CloseCode::ProtocolError
        | CloseCode::InternalError
        | CloseCode::InternalServerError
        | CloseCode::InternalClientError
        | CloseCode::BadRequest
        | CloseCode::BadResponse
        | CloseCode::Unauthorized
        | CloseCode::SubscriberAlreadyExists
        | CloseCode::TooManyInitialisationRequests => true,
        // Reserved 1xxx codes are fatal unless they describe a transient condition
        _ => (1000..=1999).contains(&code) && !matches!(code, 1000 | 1001 | 1005 | 1006 | 1012 | 1013 | 1014),
    }
}

/// Close codes that end all work without an error.
pub fn is_silent_close_code(code: u16) -> bool {
    matches!(
        CloseCode::from(code),
        CloseCode::NormalClosure | CloseCode::Terminated
    )
}

/// Decide what to do after the connection failed with `error`.
pub fn classify(error: &ClientError, ctx: &RetryContext<'_>) -> RetryDecision {
    let event = match error.close_event() {
        Some(event) => event,
        None => return RetryDecision::Fail(error.clone()),
    };

    if is_terminal_close_code(event.code) {
        return RetryDecision::Fail(error.clone());
    }

    if ctx.disposed || is_silent_close_code(event.code) {
        return RetryDecision::Stop;
    }

    if ctx.retry_attempts == 0 || ctx.retries >= ctx.retry_attempts {
        return RetryDecision::Fail(error.clone());
    }

    if ctx.is_fatal_connection_problem.is_some_and(|fatal| fatal(event)) {
        return RetryDecision::Fail(error.clone());
    }

    RetryDecision::Retry
}

/// Exponential backoff with random jitter.
pub fn backoff_delay(retries: u32) -> Duration {
    let exponential = BASE_DELAY_MS << retries.min(MAX_BACKOFF_EXPONENT);
    let jitter = rand::thread_rng().gen_range(JITTER_MS);
    Duration::from_millis(exponential + jitter)
}

/// Default `retry_wait`.
pub async fn default_retry_wait(retries: u32) {
    tokio::time::sleep(backoff_delay(retries)).await;
}

/// Shares one backoff wait among everyone waiting to reconnect.
#[derive(Default)]
pub struct BackoffGate {
    /// Receiver of the running episode, if any
    episode: Arc<Mutex<Option<watch::Receiver<bool>>>>,
}

impl BackoffGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait out the backoff for `retries`.
    ///
    /// The first caller of an episode spawns `retry_wait`; every caller,
    /// that one included, returns when it finishes. Dropping a waiting
    /// caller leaves the episode running for the others.
    pub async fn wait(&self, retries: u32, retry_wait: &RetryWait) {
        let mut released = {
            let mut episode = self.episode.lock().unwrap_or_else(|e| e.into_inner());
            match episode.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(false);
                    *episode = Some(rx.clone());
                    let release = EpisodeRelease {
                        episode: Arc::clone(&self.episode),
                        tx,
                    };
                    let backoff = retry_wait(retries);
                    debug!(retries = retries, "Waiting before reconnect");
                    tokio::spawn(async move {
                        let _release = release;
                        backoff.await;
                    });
                    rx
                }
            }
        };

        // Err means the episode task is gone, which also ends the wait
        let _ = released.wait_for(|released| *released).await;
    }

    /// Whether an episode is in progress.
    pub fn is_waiting(&self) -> bool {
        self.episode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Ends the episode when its wait finishes or its task is dropped.
struct EpisodeRelease {
    episode: Arc<Mutex<Option<watch::Receiver<bool>>>>,
    tx: watch::Sender<bool>,
}

impl Drop for EpisodeRelease {
    fn drop(&mut self) {
        self.episode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CloseEvent;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(retries: u32, retry_attempts: u32) -> RetryContext<'static> {
        RetryContext {
            retries,
            retry_attempts,
            disposed: false,
            is_fatal_connection_problem: None,
        }
    }

    fn closed(code: u16) -> ClientError {
        ClientError::Closed(CloseEvent::new(code, "reason"))
    }

    #[test]
    fn test_non_close_errors_fail_immediately() {
        let err = ClientError::Internal("bug".into());
        assert_eq!(classify(&err, &ctx(0, 5)), RetryDecision::Fail(err));
    }

    #[test]
    fn test_terminal_codes_fail_immediately() {
        for code in [1002, 1011, 4004, 4005, 4400, 4401, 4409, 4429, 4500, 1003, 1015] {
            assert_eq!(
                classify(&closed(code), &ctx(0, 5)),
                RetryDecision::Fail(closed(code)),
                "code {}",
                code
            );
        }
    }

    #[test]
    fn test_silent_codes_stop() {
        assert_eq!(classify(&closed(1000), &ctx(0, 5)), RetryDecision::Stop);
        assert_eq!(classify(&closed(4499), &ctx(0, 5)), RetryDecision::Stop);
    }

    #[test]
    fn test_transient_codes_retry() {
        for code in [1001, 1005, 1006, 1012, 1013, 1014, 4408, 4504, 4403] {
            assert_eq!(classify(&closed(code), &ctx(0, 5)), RetryDecision::Retry, "code {}", code);
        }
    }

    #[test]
    fn test_budget_exhaustion_fails() {
        assert_eq!(classify(&closed(1006), &ctx(0, 0)), RetryDecision::Fail(closed(1006)));
        assert_eq!(classify(&closed(1006), &ctx(2, 3)), RetryDecision::Retry);
        assert_eq!(classify(&closed(1006), &ctx(3, 3)), RetryDecision::Fail(closed(1006)));
        assert_eq!(
            classify(&closed(1006), &ctx(1_000_000, crate::config::RETRY_FOREVER)),
            RetryDecision::Retry
        );
    }

    #[test]
    fn test_disposed_stops_even_when_retryable() {
        let mut context = ctx(0, 5);
        context.disposed = true;
        assert_eq!(classify(&closed(1006), &context), RetryDecision::Stop);
    }

    #[test]
    fn test_fatal_predicate_is_consulted() {
        let fatal: FatalPredicate = Arc::new(|event: &CloseEvent| event.code == 4408);
        let context = RetryContext {
            retries: 0,
            retry_attempts: 5,
            disposed: false,
            is_fatal_connection_problem: Some(&fatal),
        };
        assert_eq!(classify(&closed(4408), &context), RetryDecision::Fail(closed(4408)));
        assert_eq!(classify(&closed(1006), &context), RetryDecision::Retry);
    }

    #[test]
    fn test_backoff_delay_grows_with_jitter() {
        for retries in 0..4 {
            let delay = backoff_delay(retries).as_millis() as u64;
            let base = BASE_DELAY_MS << retries;
            assert!(delay >= base + 300 && delay < base + 3000, "{} -> {}", retries, delay);
        }
        // capped, not overflowing
        let _ = backoff_delay(u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_root_waits() {
        let sleeps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sleeps);
        let retry_wait: RetryWait = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).boxed()
        });

        let gate = Arc::new(BackoffGate::new());
        let started = tokio::time::Instant::now();

        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let retry_wait = Arc::clone(&retry_wait);
                tokio::spawn(async move { gate.wait(0, &retry_wait).await })
            })
            .collect();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(sleeps.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!gate.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_episode_waits_again() {
        let sleeps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sleeps);
        let retry_wait: RetryWait = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).boxed()
        });

        let gate = BackoffGate::new();
        gate.wait(0, &retry_wait).await;
        gate.wait(1, &retry_wait).await;
        assert_eq!(sleeps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_root_leaves_the_wait_running() {
        let retry_wait: RetryWait = Arc::new(|_| tokio::time::sleep(Duration::from_secs(10)).boxed());
        let gate = Arc::new(BackoffGate::new());
        let started = tokio::time::Instant::now();

        let root = {
            let gate = Arc::clone(&gate);
            let retry_wait = Arc::clone(&retry_wait);
            tokio::spawn(async move { gate.wait(0, &retry_wait).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let follower = {
            let gate = Arc::clone(&gate);
            let retry_wait = Arc::clone(&retry_wait);
            tokio::spawn(async move { gate.wait(0, &retry_wait).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        root.abort();
        assert!(gate.is_waiting());

        follower.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!gate.is_waiting());
    }
}
