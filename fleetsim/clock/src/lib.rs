//! Unified time source for the simulation: a real variant backed by the host
//! clock and a fake variant whose time only moves on request, so scenarios
//! measuring hours run in milliseconds and stay reproducible.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

pub mod fake;
pub mod system;
mod timer;

pub use fake::FakeClock;
pub use system::SystemClock;
pub use timer::{Ticker, Timer, WakeReceiver};

/// Fire-and-forget callback armed via [`Clock::after_func`].
pub type Callback = Box<dyn FnMut() + Send + 'static>;

/// Time capability threaded through every component that measures or delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time on this clock's timeline.
    fn now(&self) -> SystemTime;

    /// Elapsed time since `earlier`; zero if `earlier` is in the future.
    fn since(&self, earlier: SystemTime) -> Duration {
        self.now().duration_since(earlier).unwrap_or_default()
    }

    /// Remaining time until `later`; zero if already past.
    fn until(&self, later: SystemTime) -> Duration {
        later.duration_since(self.now()).unwrap_or_default()
    }

    /// Suspends the caller for `duration`. A zero duration returns
    /// immediately without touching the scheduler.
    async fn sleep(&self, duration: Duration);

    /// Channel that receives the firing time once `duration` elapses.
    /// `after(0)` delivers the current time synchronously.
    fn after(&self, duration: Duration) -> WakeReceiver;

    /// One-shot timer delivering on its wake channel.
    fn timer(&self, duration: Duration) -> Timer;

    /// One-shot timer invoking `callback` instead of a channel send.
    fn after_func(&self, duration: Duration, callback: Callback) -> Timer;

    /// Periodic ticker anchored to its own cadence.
    ///
    /// # Panics
    /// Panics if `duration` is zero.
    fn ticker(&self, duration: Duration) -> Ticker;
}
