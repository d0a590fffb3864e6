use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Purpose of a session timer; each has at most one live instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Heartbeat,
    Search,
    Reconnect,
    Reboot,
}

/// Timer expiry delivered to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    token: u64,
}

struct Slot {
    token: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

/// One cancellable timer slot per [`TimerKind`]
///
/// Starting a slot aborts whatever was running in it. Expiries carry a token
/// so one that was already queued when its slot was replaced is ignored.
pub struct Timers<E> {
    slots: HashMap<TimerKind, Slot>,
    next_token: u64,
    tx: mpsc::UnboundedSender<E>,
}

impl<E: From<TimerFired> + Send + 'static> Timers<E> {
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            slots: HashMap::new(),
            next_token: 0,
            tx,
        }
    }

    /// Fire once after `delay`
    pub fn start_once(&mut self, kind: TimerKind, delay: Duration) {
        let fired = self.arm(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(fired.into());
        });
        self.store(kind, fired.token, false, handle);
    }

    /// Fire every `period`, first after one full period
    pub fn start_interval(&mut self, kind: TimerKind, period: Duration) {
        let fired = self.arm(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tx.send(fired.into()).is_err() {
                    break;
                }
            }
        });
        self.store(kind, fired.token, true, handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots.remove(&kind) {
            slot.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.handle.abort();
        }
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Accept an expiry; `false` if it belongs to a cancelled or replaced timer
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.slots.get(&fired.kind) {
            Some(slot) if slot.token == fired.token => {
                if !slot.repeating {
                    self.slots.remove(&fired.kind);
                }
                true
            }
            _ => false,
        }
    }

    fn arm(&mut self, kind: TimerKind) -> TimerFired {
        self.cancel(kind);
        self.next_token += 1;
        TimerFired {
            kind,
            token: self.next_token,
        }
    }

    fn store(&mut self, kind: TimerKind, token: u64, repeating: bool, handle: JoinHandle<()>) {
        self.slots.insert(
            kind,
            Slot {
                token,
                repeating,
                handle,
            },
        );
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.handle.abort();
        }
    }
}
