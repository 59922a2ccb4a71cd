// ai
//! 🔄 Retry: "have you tried turning it off and on again?" but with math.
//!
//! 🎬 *[a Postgres container restarts. somewhere, a query waits.]*
//! *[100ms. 200ms. 400ms. the delays double like a bad investment.]*
//! *[at 10 seconds the ceiling says "enough". the query keeps knocking anyway.]*
//!
//! A [`RetryPolicy`] is handed to every I/O call site explicitly, so when you
//! read `retry.run("postgres page", ...)` you know that call retries. No hidden
//! decorators. No surprise sleeps. 🦆
//!
//! Only *transient* failures are retried: an unreachable store, a timeout, a
//! 503. A malformed bulk request will be exactly as malformed on attempt 47,
//! so those bubble up immediately.

use std::future::Future;
use std::iter::{Chain, Once, Take};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::warn;

use crate::backends::IndexError;

/// 🔧 Retry knobs as they appear in config. Milliseconds, because humans type config files.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    /// ✖️ Whole-number growth per attempt. 1 keeps the delay flat.
    #[serde(default = "default_factor")]
    pub factor: u64,
    #[serde(default = "default_ceiling_ms")]
    pub ceiling_ms: u64,
    /// 🔢 Total attempts per call. `0` means "retry until an operator intervenes".
    /// Bounded by default so a dead cluster cannot livelock the service forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

fn default_start_delay_ms() -> u64 {
    100
}

fn default_factor() -> u64 {
    2
}

fn default_ceiling_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: default_start_delay_ms(),
            factor: default_factor(),
            ceiling_ms: default_ceiling_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// ⏱️ The delays between attempts: `start, start×factor, start×factor², ...`, each capped at the ceiling.
type Backoff = Take<Chain<Once<Duration>, ExponentialBackoff>>;

/// 🔄 Exponential backoff: `start_delay × factor^attempt`, capped at `ceiling`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    start_delay: Duration,
    factor: u64,
    ceiling: Duration,
    max_attempts: Option<u32>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            start_delay: Duration::from_millis(config.start_delay_ms),
            factor: config.factor,
            ceiling: Duration::from_millis(config.ceiling_ms),
            max_attempts: config.max_attempts.filter(|max| *max > 0),
        }
    }
}

impl RetryPolicy {
    pub fn new(start_delay: Duration, factor: u64, ceiling: Duration, max_attempts: Option<u32>) -> Self {
        Self { start_delay, factor, ceiling, max_attempts }
    }

    /// 🧪 One attempt, no sleeping. For tests that want failures to fail right now.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1, Duration::ZERO, Some(1))
    }

    /// ⏱️ The sleep schedule for one call. Its length is the number of retries allowed.
    ///
    /// tokio-retry's `ExponentialBackoff` yields `factor^(n+1) × start`, so the
    /// first delay is chained on in front of it.
    fn strategy(&self) -> Backoff {
        let start_ms = u64::try_from(self.start_delay.as_millis()).unwrap_or(u64::MAX);
        let retries = self
            .max_attempts
            .map_or(usize::MAX, |max| max.saturating_sub(1) as usize);
        std::iter::once(self.start_delay.min(self.ceiling))
            .chain(
                ExponentialBackoff::from_millis(self.factor)
                    .factor(start_ms)
                    .max_delay(self.ceiling),
            )
            .take(retries)
    }

    /// 🚀 Run `op` until it succeeds, fails non-transiently, or runs out of attempts.
    ///
    /// `what` names the call in logs, so the 3am reader knows *which* store is sulking.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // -- mirrors the schedule RetryIf consumes, so the log can say how long it will nap
        let mut upcoming = self.strategy();
        let mut attempts_made: u32 = 0;
        let result = RetryIf::spawn(self.strategy(), op, |err: &anyhow::Error| {
            attempts_made = attempts_made.saturating_add(1);
            if !is_transient(err) {
                return false;
            }
            match upcoming.next() {
                Some(delay) => {
                    warn!(
                        operation = what,
                        attempt = attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "🔄 transient failure, backing off and trying again"
                    );
                    true
                }
                None => false,
            }
        })
        .await;
        result.map_err(|err| err.context(format!("💀 '{what}' gave up after {attempts_made} attempt(s)")))
    }
}

/// 🕵️ Sniff the error chain for signs of a flaky network rather than a bad request.
///
/// Same truffle-pig approach the CLI uses for its connection hint, just with types
/// instead of string matching.
pub(crate) fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(index_err) = cause.downcast_ref::<IndexError>() {
            return index_err.is_transient();
        }
        if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
            return http_err.is_connect() || http_err.is_timeout() || http_err.is_request();
        }
        if let Some(db_err) = cause.downcast_ref::<sqlx::Error>() {
            return matches!(
                db_err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            );
        }
        if let Some(kv_err) = cause.downcast_ref::<redis::RedisError>() {
            return kv_err.is_io_error()
                || kv_err.is_connection_refusal()
                || kv_err.is_connection_dropped()
                || kv_err.is_timeout();
        }
        cause.downcast_ref::<std::io::Error>().is_some()
    })
}
