use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    Callback, Clock,
    timer::{Ticker, TickerHandle, Timer, TimerHandle, WakeReceiver},
};

/// Clock delegating to the host time facility via tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::time::sleep(duration).await;
    }

    fn after(&self, duration: Duration) -> WakeReceiver {
        let (tx, rx) = mpsc::channel(1);
        if duration.is_zero() {
            let _ = tx.try_send(SystemTime::now());
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ = tx.try_send(SystemTime::now());
            });
        }
        WakeReceiver::new(rx)
    }

    fn timer(&self, duration: Duration) -> Timer {
        let (tx, rx) = mpsc::channel(1);
        let handle = Arc::new(SystemTimer::new(Flavor::Channel(tx)));
        handle.arm(duration);
        Timer::new(handle, Some(WakeReceiver::new(rx)))
    }

    fn after_func(&self, duration: Duration, callback: Callback) -> Timer {
        let handle = Arc::new(SystemTimer::new(Flavor::Callback(Arc::new(Mutex::new(
            callback,
        )))));
        handle.arm(duration);
        Timer::new(handle, None)
    }

    fn ticker(&self, duration: Duration) -> Ticker {
        assert!(
            !duration.is_zero(),
            "ticker requires a positive tick interval"
        );
        let (tx, rx) = mpsc::channel(1);
        let handle = Arc::new(SystemTicker {
            tx,
            task: Mutex::new(None),
        });
        handle.arm(duration);
        Ticker::new(handle, WakeReceiver::new(rx))
    }
}

enum Flavor {
    Channel(mpsc::Sender<SystemTime>),
    Callback(Arc<Mutex<Callback>>),
}

struct SystemTimer {
    flavor: Flavor,
    fired: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SystemTimer {
    fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            fired: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    fn arm(&self, duration: Duration) {
        let fired = Arc::clone(&self.fired);
        let task = match &self.flavor {
            Flavor::Channel(tx) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    fired.store(true, Ordering::SeqCst);
                    let _ = tx.try_send(SystemTime::now());
                })
            }
            Flavor::Callback(callback) => {
                let callback = Arc::clone(callback);
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    fired.store(true, Ordering::SeqCst);
                    let mut callback = callback.lock().expect("timer callback poisoned");
                    (callback)();
                })
            }
        };
        let previous = self
            .task
            .lock()
            .expect("timer state poisoned")
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel(&self) -> bool {
        let handle = self.task.lock().expect("timer state poisoned").take();
        handle.is_some_and(|handle| {
            let pending = !handle.is_finished() && !self.fired.load(Ordering::SeqCst);
            handle.abort();
            pending
        })
    }
}

impl TimerHandle for SystemTimer {
    fn stop(&self) -> bool {
        self.cancel()
    }

    fn reset(&self, duration: Duration) -> bool {
        let removed = self.cancel();
        self.fired.store(false, Ordering::SeqCst);
        self.arm(duration);
        removed
    }
}

struct SystemTicker {
    tx: mpsc::Sender<SystemTime>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SystemTicker {
    fn arm(&self, period: Duration) {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            // interval_at so the first tick lands a full period out.
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let _ = tx.try_send(SystemTime::now());
            }
        });
        let previous = self
            .task
            .lock()
            .expect("ticker state poisoned")
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl TickerHandle for SystemTicker {
    fn stop(&self) {
        if let Some(task) = self.task.lock().expect("ticker state poisoned").take() {
            task.abort();
        }
    }

    fn reset(&self, duration: Duration) {
        assert!(
            !duration.is_zero(),
            "ticker requires a positive tick interval"
        );
        self.arm(duration);
    }
}
