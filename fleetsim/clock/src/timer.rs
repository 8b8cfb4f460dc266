use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

/// Receiving half of a wake channel; buffered so the scheduler's
/// non-blocking send never races the receiver.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<SystemTime>,
}

impl WakeReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<SystemTime>) -> Self {
        Self { rx }
    }

    /// Waits for the wake-up and returns the firing time. `None` means the
    /// sending side is gone without firing.
    pub async fn recv(&mut self) -> Option<SystemTime> {
        self.rx.recv().await
    }

    /// Non-blocking probe of the channel.
    pub fn try_recv(&mut self) -> Option<SystemTime> {
        self.rx.try_recv().ok()
    }
}

pub(crate) trait TimerHandle: Send + Sync {
    /// Cancels a pending fire; true iff one was still queued.
    fn stop(&self) -> bool;

    /// Re-arms with a deadline computed from the clock's current time;
    /// true iff a pending fire was removed in the process.
    fn reset(&self, duration: Duration) -> bool;
}

/// One-shot timer. Channel-flavoured timers deliver the firing time on
/// [`Timer::fired`]; callback-flavoured ones have no channel.
pub struct Timer {
    handle: std::sync::Arc<dyn TimerHandle>,
    rx: Option<WakeReceiver>,
}

impl Timer {
    pub(crate) fn new(handle: std::sync::Arc<dyn TimerHandle>, rx: Option<WakeReceiver>) -> Self {
        Self { handle, rx }
    }

    /// True iff a still-pending fire was cancelled.
    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    /// Re-arms relative to the clock's current time, not the original arm
    /// time. True iff a pending fire was removed.
    pub fn reset(&self, duration: Duration) -> bool {
        self.handle.reset(duration)
    }

    /// Waits for the timer to fire. Callback-flavoured timers return `None`
    /// immediately.
    pub async fn fired(&mut self) -> Option<SystemTime> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Non-blocking probe of the wake channel.
    pub fn try_fired(&mut self) -> Option<SystemTime> {
        self.rx.as_mut().and_then(WakeReceiver::try_recv)
    }
}

pub(crate) trait TickerHandle: Send + Sync {
    fn stop(&self);

    /// Re-anchors the cadence at `now + duration`.
    ///
    /// # Panics
    /// Panics if `duration` is zero.
    fn reset(&self, duration: Duration);
}

/// Periodic ticker. Ticks are delivered with a non-blocking send and
/// dropped when the receiver has not drained the previous one.
pub struct Ticker {
    handle: std::sync::Arc<dyn TickerHandle>,
    rx: WakeReceiver,
}

impl Ticker {
    pub(crate) fn new(handle: std::sync::Arc<dyn TickerHandle>, rx: WakeReceiver) -> Self {
        Self { handle, rx }
    }

    /// Waits for the next tick.
    pub async fn tick(&mut self) -> Option<SystemTime> {
        self.rx.recv().await
    }

    /// Non-blocking probe for a pending tick.
    pub fn try_tick(&mut self) -> Option<SystemTime> {
        self.rx.try_recv()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn reset(&self, duration: Duration) {
        self.handle.reset(duration);
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.stop();
    }
}
