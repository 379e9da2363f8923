//! Trailing-edge debouncing on the tokio clock.
//!
//! Tests drive it with `#[tokio::test(start_paused = true)]`, so no test ever
//! waits on the wall clock.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Runs only the most recently scheduled effect, once `delay` has passed
/// without another `schedule` call.
///
/// The effect is spawned as its own task once the delay expires, so a later
/// `schedule` or `cancel` never tears an effect that has already started.
pub struct Debouncer {
    delay: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, timer: Mutex::new(None) }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn schedule<F>(&self, effect: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(effect);
        }));
    }

    pub fn cancel(&self) {
        if let Some(previous) = self.timer.lock().take() {
            previous.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.timer.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
