use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(500),
            factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Classifies a failed attempt.
#[derive(Debug)]
pub enum Retry<E> {
    Transient(E),
    Fatal(E),
}

impl<E> Retry<E> {
    pub fn into_inner(self) -> E {
        match self {
            Retry::Transient(e) | Retry::Fatal(e) => e,
        }
    }
}

pub fn retry_blocking<T, E, F>(backoff: &Backoff, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, Retry<E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(Retry::Transient(err)) if attempt < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                debug!(target: "plexus::retry", what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err.into_inner()),
        }
    }
}

pub async fn retry_async<T, E, F, Fut>(backoff: &Backoff, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Retry<E>>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(Retry::Transient(err)) if attempt < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                debug!(target: "plexus::retry", what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into_inner()),
        }
    }
}
