//! Small async helpers shared across the coordinator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

pub mod http;

/// A sleep that something else may cut short.
///
/// The poller sleeps between passes on one of these; the sub-result
/// endpoint wakes it so freshly terminal node results are fetched without
/// waiting out the current backoff delay.
#[derive(Default)]
pub struct AsyncSleeper {
    notify: Notify,
}

impl AsyncSleeper {
    pub fn new() -> AsyncSleeper {
        AsyncSleeper { notify: Notify::new() }
    }

    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Cooperative cancellation flag.
///
/// Cloned tokens share state. Once cancelled, `cancelled()` resolves for
/// every current and future waiter; the flag never resets. Built on a
/// watch channel, whose versioning makes the signal immune to wake-ups
/// lost between check and sleep.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

/// Retry pacing: an immediate first round, then sleeps growing from
/// `initial` by `multiplier` up to `maximum`, until `duration` of wall
/// clock has passed since the first round.
///
/// `tick` returns false once the budget is exhausted. When a sleeper is
/// attached the in-between sleeps can be cut short externally; the budget
/// check still applies.
pub struct ExponentialBackoff<'a> {
    delay: Duration,
    multiplier: f64,
    maximum: Duration,
    deadline: Instant,
    sleeper: Option<&'a AsyncSleeper>,
    started: bool,
}

impl<'a> ExponentialBackoff<'a> {
    pub fn new(
        initial: Duration,
        multiplier: f64,
        maximum: Duration,
        duration: Duration,
        sleeper: Option<&'a AsyncSleeper>,
    ) -> ExponentialBackoff<'a> {
        ExponentialBackoff {
            delay: initial,
            multiplier,
            maximum,
            deadline: Instant::now() + duration,
            sleeper,
            started: false,
        }
    }

    pub async fn tick(&mut self) -> bool {
        if !self.started {
            self.started = true;
            return true;
        }
        if Instant::now() >= self.deadline {
            return false;
        }
        match self.sleeper {
            Some(sleeper) => sleeper.sleep(self.delay).await,
            None => tokio::time::sleep(self.delay).await,
        }
        self.delay = std::cmp::min(self.delay.mul_f64(self.multiplier), self.maximum);
        if Instant::now() >= self.deadline {
            return false;
        }
        true
    }
}
