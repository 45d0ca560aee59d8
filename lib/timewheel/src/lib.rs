//! A hashed timing wheel for cheap, high-volume delayed tasks.
//!
//! One background loop owns every slot and the key index; all mutation
//! travels to it over a single command channel, so the public operations
//! never contend on a lock and keep their submission order per key.

#[macro_use]
extern crate tracing;

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("timing wheel is closed already")]
    Closed,
    #[error("incorrect task argument")]
    Argument,
}

type Execute<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

enum Command<K, V> {
    Set { key: K, value: V, delay: Duration },
    Move { key: K, delay: Duration },
    Remove { key: K },
    Drain { f: Box<dyn Fn(K, V) + Send> },
}

/// Handle to a running wheel. Cloning shares the same loop; the loop exits
/// on [`TimingWheel::stop`] or when the last handle is dropped.
pub struct TimingWheel<K, V> {
    tx: mpsc::Sender<Command<K, V>>,
    stop: Arc<watch::Sender<bool>>,
}

impl<K, V> Clone for TimingWheel<K, V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stop: Arc::clone(&self.stop),
        }
    }
}

impl<K, V> TimingWheel<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Starts a wheel ticking every `interval` over `num_slots` slots.
    /// `execute` runs for each fired task, on a wheel-owned worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F>(interval: Duration, num_slots: usize, execute: F) -> Result<Self, Error>
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        if interval.is_zero() || num_slots == 0 {
            return Err(Error::Argument);
        }

        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let wheel = Wheel {
            interval,
            num_slots,
            slots: vec![Vec::new(); num_slots],
            entries: HashMap::new(),
            timers: HashMap::new(),
            // at the previous virtual circle, so the first tick lands on slot 0
            ticked: num_slots - 1,
            next_id: 0,
            execute: Arc::new(execute),
        };
        tokio::spawn(wheel.run(rx, stop_rx));

        Ok(Self {
            tx,
            stop: Arc::new(stop_tx),
        })
    }

    /// Schedules `execute(key, value)` to run after `delay`. Setting an
    /// already scheduled key replaces its value and reschedules it.
    pub async fn set_timer(&self, key: K, value: V, delay: Duration) -> Result<(), Error> {
        if delay.is_zero() {
            return Err(Error::Argument);
        }

        self.submit(Command::Set { key, value, delay }).await
    }

    /// Reschedules the task with `key` to fire after `delay` from now.
    /// Unknown keys are ignored.
    pub async fn move_timer(&self, key: K, delay: Duration) -> Result<(), Error> {
        if delay.is_zero() {
            return Err(Error::Argument);
        }

        self.submit(Command::Move { key, delay }).await
    }

    /// Cancels the task with `key`. The slot entry is garbage collected on
    /// the next tick through its slot.
    pub async fn remove_timer(&self, key: K) -> Result<(), Error> {
        self.submit(Command::Remove { key }).await
    }

    /// Removes every pending task and runs `f` on each.
    pub async fn drain<F>(&self, f: F) -> Result<(), Error>
    where
        F: Fn(K, V) + Send + 'static,
    {
        self.submit(Command::Drain { f: Box::new(f) }).await
    }

    /// Stops the wheel. Pending tasks never fire; subsequent operations
    /// return [`Error::Closed`].
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    async fn submit(&self, cmd: Command<K, V>) -> Result<(), Error> {
        if *self.stop.borrow() {
            return Err(Error::Closed);
        }

        self.tx.send(cmd).await.map_err(|_| Error::Closed)
    }
}

struct Entry<K, V> {
    key: K,
    value: Option<V>,
    // full revolutions remaining before this entry is due
    circle: usize,
    // deferred slot shift applied when the entry's old slot is scanned
    diff: usize,
    removed: bool,
    pos: usize,
}

struct Wheel<K, V> {
    interval: Duration,
    num_slots: usize,
    slots: Vec<Vec<u64>>,
    entries: HashMap<u64, Entry<K, V>>,
    timers: HashMap<K, u64>,
    ticked: usize,
    next_id: u64,
    execute: Execute<K, V>,
}

enum Scan {
    Drop,
    Keep,
    Relocate(usize),
    Due,
}

impl<K, V> Wheel<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::Receiver<Command<K, V>>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                _ = stop.changed() => break,
                cmd = rx.recv() => match cmd {
                    Some(Command::Set { key, value, delay }) => self.set_task(key, value, delay),
                    Some(Command::Move { key, delay }) => self.move_task(key, delay),
                    Some(Command::Remove { key }) => self.remove_task(&key),
                    Some(Command::Drain { f }) => self.drain_all(f),
                    None => break,
                },
            }
        }
    }

    fn position(&self, delay: Duration) -> (usize, usize) {
        let steps = (delay.as_nanos() / self.interval.as_nanos()) as usize;
        let pos = (self.ticked + steps) % self.num_slots;
        let circle = steps.saturating_sub(1) / self.num_slots;

        (pos, circle)
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_task(&mut self, key: K, value: V, mut delay: Duration) {
        if delay < self.interval {
            delay = self.interval;
        }

        if let Some(&id) = self.timers.get(&key) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.value = Some(value);
            }
            self.move_task(key, delay);
            return;
        }

        let (pos, circle) = self.position(delay);
        let id = self.alloc_id();
        self.entries.insert(
            id,
            Entry {
                key: key.clone(),
                value: Some(value),
                circle,
                diff: 0,
                removed: false,
                pos,
            },
        );
        self.slots[pos].push(id);
        self.timers.insert(key, id);
    }

    fn move_task(&mut self, key: K, delay: Duration) {
        let Some(&id) = self.timers.get(&key) else {
            return;
        };

        if delay < self.interval {
            // already due within this tick, fire right away
            let Some(entry) = self.entries.get(&id) else {
                return;
            };
            if let Some(value) = entry.value.clone() {
                let execute = Arc::clone(&self.execute);
                let key = entry.key.clone();
                tokio::spawn(async move {
                    run_guarded(&execute, key, value);
                });
            }
            return;
        }

        let (pos, circle) = self.position(delay);
        let num_slots = self.num_slots;
        let replaced = {
            let Some(entry) = self.entries.get_mut(&id) else {
                return;
            };

            if pos >= entry.pos {
                // shift forward when the old slot is scanned; no list surgery
                entry.circle = circle;
                entry.diff = pos - entry.pos;
                None
            } else if circle > 0 {
                entry.circle = circle - 1;
                entry.diff = num_slots + pos - entry.pos;
                None
            } else {
                // due earlier in the current revolution, replace the entry
                entry.removed = true;
                Some(entry.value.take())
            }
        };

        if let Some(value) = replaced {
            let new_id = self.alloc_id();
            self.entries.insert(
                new_id,
                Entry {
                    key: key.clone(),
                    value,
                    circle: 0,
                    diff: 0,
                    removed: false,
                    pos,
                },
            );
            self.slots[pos].push(new_id);
            self.timers.insert(key, new_id);
        }
    }

    fn remove_task(&mut self, key: &K) {
        if let Some(id) = self.timers.remove(key) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.removed = true;
            }
        }
    }

    fn on_tick(&mut self) {
        self.ticked = (self.ticked + 1) % self.num_slots;
        let ids = std::mem::take(&mut self.slots[self.ticked]);

        let mut keep = Vec::with_capacity(ids.len());
        let mut due = Vec::new();
        for id in ids {
            let scan = match self.entries.get_mut(&id) {
                None => Scan::Drop,
                Some(entry) if entry.removed => Scan::Drop,
                Some(entry) if entry.circle > 0 => {
                    entry.circle -= 1;
                    Scan::Keep
                }
                Some(entry) if entry.diff > 0 => {
                    let diff = entry.diff;
                    entry.diff = 0;
                    Scan::Relocate(diff)
                }
                Some(_) => Scan::Due,
            };

            match scan {
                Scan::Drop => {
                    self.entries.remove(&id);
                }
                Scan::Keep => keep.push(id),
                Scan::Relocate(diff) => {
                    let pos = (self.ticked + diff) % self.num_slots;
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.pos = pos;
                    }
                    self.slots[pos].push(id);
                }
                Scan::Due => {
                    if let Some(entry) = self.entries.remove(&id) {
                        self.timers.remove(&entry.key);
                        if let Some(value) = entry.value {
                            due.push((entry.key, value));
                        }
                    }
                }
            }
        }
        self.slots[self.ticked] = keep;

        self.fire(due);
    }

    fn drain_all(&mut self, f: Box<dyn Fn(K, V) + Send>) {
        let mut tasks = Vec::new();
        for slot in &mut self.slots {
            for id in slot.drain(..) {
                if let Some(entry) = self.entries.remove(&id) {
                    if entry.removed {
                        continue;
                    }
                    if let Some(value) = entry.value {
                        tasks.push((entry.key, value));
                    }
                }
            }
        }
        self.entries.clear();
        self.timers.clear();

        if tasks.is_empty() {
            return;
        }

        tokio::spawn(async move {
            for (key, value) in tasks {
                if let Err(err) = catch_unwind(AssertUnwindSafe(|| f(key, value))) {
                    error!(message = "drained task panicked", panic = panic_message(&err));
                }
            }
        });
    }

    fn fire(&self, due: Vec<(K, V)>) {
        if due.is_empty() {
            return;
        }

        let execute = Arc::clone(&self.execute);
        tokio::spawn(async move {
            for (key, value) in due {
                run_guarded(&execute, key, value);
            }
        });
    }
}

fn run_guarded<K, V>(execute: &Execute<K, V>, key: K, value: V) {
    if let Err(err) = catch_unwind(AssertUnwindSafe(|| execute(key, value))) {
        error!(message = "timer task panicked", panic = panic_message(&err));
    }
}

fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else if let Some(s) = err.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
