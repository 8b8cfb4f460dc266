//! Deterministic clock: time moves only on [`FakeClock::advance`] /
//! [`FakeClock::advance_to`], or automatically once every registered task is
//! blocked on the clock.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    Callback, Clock,
    timer::{Ticker, TickerHandle, Timer, TimerHandle, WakeReceiver},
};

type SharedCallback = Arc<Mutex<Callback>>;

/// Key into the pending-waiter map: deadline first, then a monotone id so
/// equal deadlines fire in insertion order.
type WaiterKey = (SystemTime, u64);

enum Wake {
    Channel(mpsc::Sender<SystemTime>),
    Callback(SharedCallback),
}

struct FakeState {
    now: SystemTime,
    pending: BTreeMap<WaiterKey, Wake>,
}

struct FakeClockCore {
    state: Mutex<FakeState>,
    /// Tasks currently blocked on a wake channel.
    waiters: AtomicUsize,
    /// Registered live tasks (auto-advance bookkeeping).
    active: AtomicUsize,
    next_id: AtomicU64,
    auto_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl FakeClockCore {
    fn new(start: SystemTime) -> Self {
        Self {
            state: Mutex::new(FakeState {
                now: start,
                pending: BTreeMap::new(),
            }),
            waiters: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            auto_tx: Mutex::new(None),
        }
    }

    fn now(&self) -> SystemTime {
        self.state.lock().expect("clock state poisoned").now
    }

    fn signal(&self) {
        if let Some(tx) = self.auto_tx.lock().expect("auto signal poisoned").as_ref() {
            let _ = tx.send(());
        }
    }

    /// Inserts a waiter `delay` from now. The waiter count is bumped before
    /// the lock is released so a concurrent advance can never fire a channel
    /// waiter whose increment has not happened yet.
    fn insert_after(&self, delay: Duration, wake: Wake) -> WaiterKey {
        let key = {
            let mut state = self.state.lock().expect("clock state poisoned");
            let deadline = state.now + delay;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if matches!(wake, Wake::Channel(_)) {
                self.waiters.fetch_add(1, Ordering::SeqCst);
            }
            state.pending.insert((deadline, id), wake);
            (deadline, id)
        };
        self.signal();
        key
    }

    /// Inserts a waiter at an absolute deadline (ticker re-arm).
    fn insert_at(&self, deadline: SystemTime, wake: Wake) -> WaiterKey {
        let key = {
            let mut state = self.state.lock().expect("clock state poisoned");
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if matches!(wake, Wake::Channel(_)) {
                self.waiters.fetch_add(1, Ordering::SeqCst);
            }
            state.pending.insert((deadline, id), wake);
            (deadline, id)
        };
        self.signal();
        key
    }

    /// Removes a still-queued waiter. True iff it was present; channel
    /// waiters also give back their waiter-count slot.
    fn remove(&self, key: WaiterKey) -> bool {
        let removed = self
            .state
            .lock()
            .expect("clock state poisoned")
            .pending
            .remove(&key);
        match removed {
            Some(Wake::Channel(_)) => {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                true
            }
            Some(Wake::Callback(_)) => true,
            None => false,
        }
    }

    /// Moves time to `target`, firing every waiter whose deadline is due.
    ///
    /// Waiters are popped one at a time and fired with the lock released:
    /// a ticker callback re-arms itself through this same mutex, and a
    /// re-armed deadline still ≤ `target` must fire within this advance,
    /// so the map is re-checked after every fire.
    fn advance_to(&self, target: SystemTime) {
        loop {
            let due = {
                let mut state = self.state.lock().expect("clock state poisoned");
                if target < state.now {
                    return;
                }
                let next_key = match state.pending.first_key_value() {
                    Some((&(deadline, id), _)) if deadline <= target => Some((deadline, id)),
                    _ => None,
                };
                match next_key {
                    Some(key) => {
                        let wake = state.pending.remove(&key).expect("peeked entry vanished");
                        state.now = key.0;
                        Some((key.0, wake))
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            let Some((deadline, wake)) = due else {
                break;
            };
            match wake {
                Wake::Channel(tx) => {
                    let _ = tx.try_send(deadline);
                    self.waiters.fetch_sub(1, Ordering::SeqCst);
                }
                Wake::Callback(callback) => {
                    let mut callback = callback.lock().expect("waiter callback poisoned");
                    (callback)();
                }
            }
        }
    }

    /// One auto-advance round: if every registered task is blocked on the
    /// clock and something is queued, jump to the earliest deadline.
    fn try_auto_advance(&self) -> bool {
        let target = {
            let state = self.state.lock().expect("clock state poisoned");
            let active = self.active.load(Ordering::SeqCst);
            let waiting = self.waiters.load(Ordering::SeqCst);
            if active == 0 || waiting < active {
                return false;
            }
            match state.pending.first_key_value() {
                Some((&(deadline, _), _)) => deadline,
                None => return false,
            }
        };
        self.advance_to(target);
        true
    }
}

/// Manually advanceable clock with FIFO ordering for equal deadlines.
#[derive(Clone)]
pub struct FakeClock {
    core: Arc<FakeClockCore>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Clock parked at the unix epoch; advances only on request.
    #[must_use]
    pub fn new() -> Self {
        Self::at(SystemTime::UNIX_EPOCH)
    }

    /// Clock parked at `start`.
    #[must_use]
    pub fn at(start: SystemTime) -> Self {
        Self {
            core: Arc::new(FakeClockCore::new(start)),
        }
    }

    /// Clock that advances itself to the earliest deadline whenever every
    /// registered task is blocked on it. Must be created inside a tokio
    /// runtime.
    #[must_use]
    pub fn auto() -> Self {
        let clock = Self::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *clock.core.auto_tx.lock().expect("auto signal poisoned") = Some(tx);

        let weak: Weak<FakeClockCore> = Arc::downgrade(&clock.core);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(core) = weak.upgrade() else { break };
                if core.try_auto_advance() {
                    // Another round may already be possible.
                    core.signal();
                }
            }
        });
        clock
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let target = self.core.now() + duration;
        self.core.advance_to(target);
    }

    /// Moves time to `target`; a target in the past is a no-op.
    pub fn advance_to(&self, target: SystemTime) {
        self.core.advance_to(target);
    }

    /// Declares a live task that will block on this clock. Auto-advance only
    /// triggers once all registered tasks are waiting.
    pub fn register_task(&self) {
        self.core.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Retires a registered task and lets auto-advance re-evaluate.
    pub fn unregister_task(&self) {
        self.core.active.fetch_sub(1, Ordering::SeqCst);
        self.core.signal();
    }

    /// Tasks currently blocked on a wake channel.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.core.waiters.load(Ordering::SeqCst)
    }

    /// Test-only synchronization: resolves once at least `count` tasks have
    /// reached their wake channel. Spins on real time with a microsecond
    /// backoff.
    pub async fn block_until_waiters(&self, count: usize) {
        while self.waiter_count() < count {
            tokio::time::sleep(Duration::from_micros(100)).await;
        }
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        self.core.now()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let mut rx = self.after(duration);
        let _ = rx.recv().await;
    }

    fn after(&self, duration: Duration) -> WakeReceiver {
        let (tx, rx) = mpsc::channel(1);
        if duration.is_zero() {
            let _ = tx.try_send(self.core.now());
        } else {
            self.core.insert_after(duration, Wake::Channel(tx));
        }
        WakeReceiver::new(rx)
    }

    fn timer(&self, duration: Duration) -> Timer {
        let (tx, rx) = mpsc::channel(1);
        let handle = Arc::new(FakeTimer {
            clock: Arc::clone(&self.core),
            flavor: TimerFlavor::Channel(tx),
            key: Mutex::new(None),
        });
        handle.arm(duration);
        Timer::new(handle, Some(WakeReceiver::new(rx)))
    }

    fn after_func(&self, duration: Duration, callback: Callback) -> Timer {
        let handle = Arc::new(FakeTimer {
            clock: Arc::clone(&self.core),
            flavor: TimerFlavor::Callback(Arc::new(Mutex::new(callback))),
            key: Mutex::new(None),
        });
        handle.arm(duration);
        Timer::new(handle, None)
    }

    fn ticker(&self, duration: Duration) -> Ticker {
        assert!(
            !duration.is_zero(),
            "ticker requires a positive tick interval"
        );
        let (tx, rx) = mpsc::channel(1);
        let core = Arc::new(FakeTickerCore {
            clock: Arc::clone(&self.core),
            tx,
            callback: Mutex::new(None),
            state: Mutex::new(FakeTickerState {
                interval: duration,
                next_tick: self.core.now() + duration,
                key: None,
                stopped: false,
            }),
        });

        let fire_target: Weak<FakeTickerCore> = Arc::downgrade(&core);
        let callback: SharedCallback = Arc::new(Mutex::new(Box::new(move || {
            if let Some(ticker) = fire_target.upgrade() {
                ticker.on_fire();
            }
        })));
        *core.callback.lock().expect("ticker callback poisoned") = Some(Arc::clone(&callback));
        {
            let mut state = core.state.lock().expect("ticker state poisoned");
            let key = core.clock.insert_at(state.next_tick, Wake::Callback(callback));
            state.key = Some(key);
        }

        Ticker::new(core, WakeReceiver::new(rx))
    }
}

enum TimerFlavor {
    Channel(mpsc::Sender<SystemTime>),
    Callback(SharedCallback),
}

struct FakeTimer {
    clock: Arc<FakeClockCore>,
    flavor: TimerFlavor,
    key: Mutex<Option<WaiterKey>>,
}

impl FakeTimer {
    fn arm(&self, duration: Duration) {
        let wake = match &self.flavor {
            TimerFlavor::Channel(tx) => Wake::Channel(tx.clone()),
            TimerFlavor::Callback(callback) => Wake::Callback(Arc::clone(callback)),
        };
        let key = self.clock.insert_after(duration, wake);
        *self.key.lock().expect("timer key poisoned") = Some(key);
    }
}

impl TimerHandle for FakeTimer {
    fn stop(&self) -> bool {
        let key = self.key.lock().expect("timer key poisoned").take();
        key.is_some_and(|key| self.clock.remove(key))
    }

    fn reset(&self, duration: Duration) -> bool {
        let removed = {
            let key = self.key.lock().expect("timer key poisoned").take();
            key.is_some_and(|key| self.clock.remove(key))
        };
        self.arm(duration);
        removed
    }
}

struct FakeTickerState {
    interval: Duration,
    next_tick: SystemTime,
    key: Option<WaiterKey>,
    stopped: bool,
}

struct FakeTickerCore {
    clock: Arc<FakeClockCore>,
    tx: mpsc::Sender<SystemTime>,
    /// Re-arm closure, installed once at construction.
    callback: Mutex<Option<SharedCallback>>,
    state: Mutex<FakeTickerState>,
}

impl FakeTickerCore {
    fn rearm_callback(&self) -> SharedCallback {
        self.callback
            .lock()
            .expect("ticker callback poisoned")
            .clone()
            .expect("ticker callback installed at construction")
    }

    /// Fires one tick: non-blocking delivery, then re-arm one interval past
    /// the previous tick so the cadence stays anchored under jitter.
    fn on_fire(&self) {
        let callback = self.rearm_callback();
        let mut state = self.state.lock().expect("ticker state poisoned");
        if state.stopped {
            return;
        }
        let fired_at = state.next_tick;
        let _ = self.tx.try_send(fired_at);
        state.next_tick = fired_at + state.interval;
        let key = self
            .clock
            .insert_at(state.next_tick, Wake::Callback(callback));
        state.key = Some(key);
    }
}

impl TickerHandle for FakeTickerCore {
    fn stop(&self) {
        let mut state = self.state.lock().expect("ticker state poisoned");
        state.stopped = true;
        if let Some(key) = state.key.take() {
            self.clock.remove(key);
        }
    }

    fn reset(&self, duration: Duration) {
        assert!(
            !duration.is_zero(),
            "ticker requires a positive tick interval"
        );
        let callback = self.rearm_callback();
        let now = self.clock.now();
        let mut state = self.state.lock().expect("ticker state poisoned");
        if let Some(key) = state.key.take() {
            self.clock.remove(key);
        }
        state.stopped = false;
        state.interval = duration;
        state.next_tick = now + duration;
        let key = self
            .clock
            .insert_at(state.next_tick, Wake::Callback(callback));
        state.key = Some(key);
    }
}
