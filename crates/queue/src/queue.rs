// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The multi-state queue: five sub-queues and the state machine that moves
//! items between them.
//!
//! One mutex guards all sub-queues and the dependency index. Reserve waiters
//! park on a condvar signalled by every transition into ready. Two
//! housekeeping threads watch the delay and run heads; both re-read the head
//! after every wake, so they stay correct under concurrent add/remove.

use crate::error::QueueError;
use crate::item::{AddPolicy, Item, ItemDef, ItemState, ItemUpdate};
use crate::sub_queue::{SortKey, SubQueue};
use muster_core::ItemKey;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Per-sub-queue item counts plus lifetime totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub delayed: usize,
    pub ready: usize,
    pub running: usize,
    pub buried: usize,
    pub dependent: usize,
    /// Items ever added.
    pub added: u64,
    /// Items ever removed.
    pub removed: u64,
}

impl Stats {
    /// Items currently tracked, across all sub-queues.
    pub fn total(&self) -> usize {
        self.delayed + self.ready + self.running + self.buried + self.dependent
    }
}

struct Inner {
    items: HashMap<ItemKey, Item>,
    delay: SubQueue,
    /// One ready sub-queue per scheduling group.
    ready: HashMap<String, SubQueue>,
    run: SubQueue,
    /// Ordered by key for deterministic iteration.
    bury: BTreeSet<ItemKey>,
    /// Dependency index: key -> items waiting on that key.
    waiters: HashMap<ItemKey, BTreeSet<ItemKey>>,
    closed: bool,
    next_seq: u64,
    added: u64,
    removed: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled on every transition into ready.
    ready_cv: Condvar,
    /// Wakes the delay housekeeping thread when the delay head changes.
    delay_cv: Condvar,
    /// Wakes the TTR housekeeping thread when the run head changes.
    run_cv: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// The lifecycle queue. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
}

impl Queue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                delay: SubQueue::new(),
                ready: HashMap::new(),
                run: SubQueue::new(),
                bury: BTreeSet::new(),
                waiters: HashMap::new(),
                closed: false,
                next_seq: 0,
                added: 0,
                removed: 0,
            }),
            ready_cv: Condvar::new(),
            delay_cv: Condvar::new(),
            run_cv: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        });

        let delay_shared = Arc::clone(&shared);
        let delay_handle = std::thread::Builder::new()
            .name("muster-queue-delay".into())
            .spawn(move || delay_loop(delay_shared))
            .ok();

        let run_shared = Arc::clone(&shared);
        let run_handle = std::thread::Builder::new()
            .name("muster-queue-ttr".into())
            .spawn(move || ttr_loop(run_shared))
            .ok();

        let mut handles = shared.handles.lock();
        handles.extend(delay_handle);
        handles.extend(run_handle);
        drop(handles);

        Self { shared }
    }

    /// Insert a new item. Routing: unmet dependencies -> dependent,
    /// delay > 0 -> delay, otherwise ready.
    pub fn add(&self, def: ItemDef, policy: AddPolicy) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let replacing = inner.items.contains_key(&def.key);
        if replacing && policy == AddPolicy::Reject {
            return Err(QueueError::KeyExists(def.key));
        }

        if def.depends_on.contains(&def.key) {
            return Err(QueueError::DependencyCycle(def.key));
        }

        // Dependencies on keys that already left the queue count as
        // satisfied; only live items carry edges, so a cycle must pass
        // through the key being inserted.
        let unmet: BTreeSet<ItemKey> = def
            .depends_on
            .iter()
            .filter(|dep| *dep != &def.key && inner.items.contains_key(*dep))
            .cloned()
            .collect();
        if would_cycle(&inner, &def.key, &unmet) {
            return Err(QueueError::DependencyCycle(def.key));
        }

        let mut notify = Notify::default();
        if replacing {
            // A replace is an update: anything waiting on this key keeps
            // waiting for the new incarnation, so the waiter index is left
            // alone.
            let removal = remove_locked(&mut inner, &def.key, false)?;
            notify.merge(removal);
        }

        let now = Instant::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut item = Item::from_def(def, now, seq);
        let key = item.key.clone();

        if !unmet.is_empty() {
            for dep in &unmet {
                inner.waiters.entry(dep.clone()).or_default().insert(key.clone());
            }
            item.unresolved = unmet;
            item.state = ItemState::Dependent;
        } else if item.delay > Duration::ZERO {
            item.state = ItemState::Delay;
            inner.delay.push(key.clone(), SortKey::Time(item.ready_at), seq);
            notify.delay = true;
        } else {
            item.state = ItemState::Ready;
            push_ready(&mut inner, &key, item.priority, &item.group, seq);
            notify.ready = true;
        }

        tracing::debug!(key = %key, state = %item.state, "added item");
        inner.items.insert(key, item);
        inner.added += 1;
        drop(inner);
        self.fire(notify);
        Ok(())
    }

    /// Snapshot of an item by key.
    pub fn get(&self, key: &ItemKey) -> Result<Item, QueueError> {
        let inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.items.get(key).cloned().ok_or_else(|| QueueError::NotFound(key.clone()))
    }

    /// Change an item's priority, delay, TTR or payload.
    ///
    /// A delay change re-anchors ready-at to now + delay. A TTR change takes
    /// effect at the next reserve or touch.
    pub fn update(&self, key: &ItemKey, changes: ItemUpdate) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if !inner.items.contains_key(key) {
            return Err(QueueError::NotFound(key.clone()));
        }

        let mut notify = Notify::default();
        let (state, group) = {
            let item = inner.items.get_mut(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
            if let Some(data) = changes.data {
                item.data = data;
            }
            if let Some(ttr) = changes.ttr {
                item.ttr = ttr;
            }
            if let Some(priority) = changes.priority {
                item.priority = priority;
            }
            if let Some(delay) = changes.delay {
                item.delay = delay;
                if item.state == ItemState::Delay {
                    item.ready_at = Instant::now() + delay;
                }
            }
            (item.state, item.group.clone())
        };

        if let Some(priority) = changes.priority {
            if state == ItemState::Ready {
                if let Some(sub) = inner.ready.get_mut(&group) {
                    sub.update(key, SortKey::PriorityFifo(priority));
                }
                notify.ready = true;
            }
        }
        if changes.delay.is_some() && state == ItemState::Delay {
            let ready_at = inner.items[key].ready_at;
            inner.delay.update(key, SortKey::Time(ready_at));
            notify.delay = true;
        }
        drop(inner);
        self.fire(notify);
        Ok(())
    }

    /// Pop the highest-priority ready item for the group, blocking up to
    /// `timeout` for one to appear. The reserved item gets a release
    /// deadline of now + TTR and moves to the run sub-queue.
    ///
    /// Within a group, reserve order is priority descending then FIFO.
    pub fn reserve(&self, group: &str, timeout: Duration) -> Result<Item, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.closed {
                return Err(QueueError::Closed);
            }

            let popped = match inner.ready.get_mut(group) {
                Some(sub) => sub.pop(),
                None => None,
            };
            if let Some(key) = popped {
                if inner.ready.get(group).is_some_and(|s| s.is_empty()) {
                    inner.ready.remove(group);
                }
                let now = Instant::now();
                let item = inner
                    .items
                    .get_mut(&key)
                    .ok_or_else(|| QueueError::NotFound(key.clone()))?;
                item.state = ItemState::Run;
                item.attempts += 1;
                item.release_at = now + item.ttr;
                let sort = SortKey::Time(item.release_at);
                let seq = item.seq;
                let reserved = item.clone();
                inner.run.push(key, sort, seq);
                drop(inner);
                self.shared.run_cv.notify_all();
                return Ok(reserved);
            }

            if Instant::now() >= deadline {
                return Err(QueueError::Timeout);
            }
            self.shared.ready_cv.wait_until(&mut inner, deadline);
        }
    }

    /// Push a reserved item's release deadline back to now + TTR.
    pub fn touch(&self, key: &ItemKey) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let item =
            inner.items.get_mut(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
        if item.state != ItemState::Run {
            return Err(QueueError::WrongState { key: key.clone(), state: item.state, op: "touch" });
        }
        item.release_at = Instant::now() + item.ttr;
        let sort = SortKey::Time(item.release_at);
        inner.run.update(key, sort);
        drop(inner);
        self.shared.run_cv.notify_all();
        Ok(())
    }

    /// Return a reserved item to ready, or to delay when a back-off is
    /// supplied.
    pub fn release(&self, key: &ItemKey, backoff: Option<Duration>) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let item =
            inner.items.get_mut(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
        if item.state != ItemState::Run {
            return Err(QueueError::WrongState {
                key: key.clone(),
                state: item.state,
                op: "release",
            });
        }
        inner.run.remove(key);

        let mut notify = Notify { run: true, ..Notify::default() };
        let item = inner.items.get_mut(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
        match backoff {
            Some(d) if d > Duration::ZERO => {
                item.state = ItemState::Delay;
                item.ready_at = Instant::now() + d;
                let (ready_at, seq) = (item.ready_at, item.seq);
                inner.delay.push(key.clone(), SortKey::Time(ready_at), seq);
                notify.delay = true;
            }
            _ => {
                item.state = ItemState::Ready;
                let (priority, group, seq) = (item.priority, item.group.clone(), item.seq);
                push_ready(&mut inner, key, priority, &group, seq);
                notify.ready = true;
            }
        }
        drop(inner);
        self.fire(notify);
        Ok(())
    }

    /// Move a reserved item to the bury sub-queue.
    pub fn bury(&self, key: &ItemKey) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let item =
            inner.items.get_mut(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
        if item.state != ItemState::Run {
            return Err(QueueError::WrongState { key: key.clone(), state: item.state, op: "bury" });
        }
        item.state = ItemState::Bury;
        inner.run.remove(key);
        inner.bury.insert(key.clone());
        drop(inner);
        self.shared.run_cv.notify_all();
        Ok(())
    }

    /// Return a buried item to ready.
    pub fn kick(&self, key: &ItemKey) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let item =
            inner.items.get_mut(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
        if item.state != ItemState::Bury {
            return Err(QueueError::WrongState { key: key.clone(), state: item.state, op: "kick" });
        }
        item.state = ItemState::Ready;
        let (priority, group, seq) = (item.priority, item.group.clone(), item.seq);
        inner.bury.remove(key);
        push_ready(&mut inner, key, priority, &group, seq);
        drop(inner);
        self.shared.ready_cv.notify_all();
        Ok(())
    }

    /// Remove an item from whichever sub-queue holds it, waking any
    /// dependents whose last dependency this was.
    pub fn remove(&self, key: &ItemKey) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let notify = remove_locked(&mut inner, key, true)?;
        drop(inner);
        self.fire(notify);
        Ok(())
    }

    /// Current per-sub-queue counts and lifetime add/remove totals.
    pub fn stats(&self) -> Result<Stats, QueueError> {
        let inner = self.shared.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        Ok(Stats {
            delayed: inner.delay.len(),
            ready: inner.ready.values().map(|s| s.len()).sum(),
            running: inner.run.len(),
            buried: inner.bury.len(),
            dependent: inner
                .items
                .values()
                .filter(|i| i.state == ItemState::Dependent)
                .count(),
            added: inner.added,
            removed: inner.removed,
        })
    }

    /// Close the queue. Every blocked reserve returns `Closed`, both
    /// housekeeping threads exit, and all items are dropped. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.items.clear();
        inner.delay.clear();
        inner.ready.clear();
        inner.run.clear();
        inner.bury.clear();
        inner.waiters.clear();
        drop(inner);

        self.shared.ready_cv.notify_all();
        self.shared.delay_cv.notify_all();
        self.shared.run_cv.notify_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("queue destroyed");
    }

    fn fire(&self, notify: Notify) {
        if notify.ready {
            self.shared.ready_cv.notify_all();
        }
        if notify.delay {
            self.shared.delay_cv.notify_all();
        }
        if notify.run {
            self.shared.run_cv.notify_all();
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

/// Which condvars a mutation needs to signal once the lock drops.
#[derive(Default)]
struct Notify {
    ready: bool,
    delay: bool,
    run: bool,
}

impl Notify {
    fn merge(&mut self, other: Notify) {
        self.ready |= other.ready;
        self.delay |= other.delay;
        self.run |= other.run;
    }
}

fn push_ready(inner: &mut Inner, key: &ItemKey, priority: u8, group: &str, seq: u64) {
    inner
        .ready
        .entry(group.to_string())
        .or_default()
        .push(key.clone(), SortKey::PriorityFifo(priority), seq);
}

/// True if `key` is reachable from any of `deps` along unresolved edges.
fn would_cycle(inner: &Inner, key: &ItemKey, deps: &BTreeSet<ItemKey>) -> bool {
    let mut stack: Vec<&ItemKey> = deps.iter().collect();
    let mut seen: BTreeSet<&ItemKey> = BTreeSet::new();
    while let Some(current) = stack.pop() {
        if current == key {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(item) = inner.items.get(current) {
            stack.extend(item.unresolved.iter());
        }
    }
    false
}

/// Take an item out of whichever structure holds it. `wake_waiters` is
/// false during a replace, where dependents keep waiting for the new
/// incarnation of the key.
fn remove_locked(
    inner: &mut Inner,
    key: &ItemKey,
    wake_waiters: bool,
) -> Result<Notify, QueueError> {
    let item = inner.items.remove(key).ok_or_else(|| QueueError::NotFound(key.clone()))?;
    let mut notify = Notify::default();
    match item.state {
        ItemState::Delay => {
            inner.delay.remove(key);
            notify.delay = true;
        }
        ItemState::Ready => {
            if let Some(sub) = inner.ready.get_mut(&item.group) {
                sub.remove(key);
                if sub.is_empty() {
                    inner.ready.remove(&item.group);
                }
            }
        }
        ItemState::Run => {
            inner.run.remove(key);
            notify.run = true;
        }
        ItemState::Bury => {
            inner.bury.remove(key);
        }
        ItemState::Dependent => {
            for dep in &item.unresolved {
                if let Some(ws) = inner.waiters.get_mut(dep) {
                    ws.remove(key);
                    if ws.is_empty() {
                        inner.waiters.remove(dep);
                    }
                }
            }
        }
    }
    inner.removed += 1;
    if !wake_waiters {
        return Ok(notify);
    }

    // Wake anything that was waiting on this key.
    if let Some(waiting) = inner.waiters.remove(key) {
        let now = Instant::now();
        for wkey in waiting {
            let Some(waiter) = inner.items.get_mut(&wkey) else {
                continue;
            };
            waiter.unresolved.remove(key);
            if !waiter.unresolved.is_empty() || waiter.state != ItemState::Dependent {
                continue;
            }
            if waiter.delay > Duration::ZERO {
                waiter.state = ItemState::Delay;
                waiter.ready_at = now + waiter.delay;
                let (ready_at, seq) = (waiter.ready_at, waiter.seq);
                inner.delay.push(wkey, SortKey::Time(ready_at), seq);
                notify.delay = true;
            } else {
                waiter.state = ItemState::Ready;
                let (priority, group, seq) =
                    (waiter.priority, waiter.group.clone(), waiter.seq);
                push_ready(inner, &wkey, priority, &group, seq);
                notify.ready = true;
            }
        }
    }
    Ok(notify)
}

/// Housekeeping: promote the delay head to ready when its time arrives.
/// Waits until the head's ready-at; any head change re-signals the condvar.
fn delay_loop(shared: Arc<Shared>) {
    let mut inner = shared.inner.lock();
    loop {
        if inner.closed {
            return;
        }
        match inner.delay.peek() {
            Some((_, &SortKey::Time(at))) => {
                if at <= Instant::now() {
                    if let Some(key) = inner.delay.pop() {
                        if let Some(item) = inner.items.get_mut(&key) {
                            item.state = ItemState::Ready;
                            let (priority, group, seq) =
                                (item.priority, item.group.clone(), item.seq);
                            push_ready(&mut inner, &key, priority, &group, seq);
                            tracing::debug!(key = %key, "delay elapsed, item ready");
                            shared.ready_cv.notify_all();
                        }
                    }
                    // Re-check the next head without waiting.
                    continue;
                }
                shared.delay_cv.wait_until(&mut inner, at);
            }
            Some((_, &SortKey::PriorityFifo(_))) | None => {
                shared.delay_cv.wait(&mut inner);
            }
        }
    }
}

/// Housekeeping: bury the run head once its release deadline passes; the
/// runner is presumed lost.
fn ttr_loop(shared: Arc<Shared>) {
    let mut inner = shared.inner.lock();
    loop {
        if inner.closed {
            return;
        }
        match inner.run.peek() {
            Some((_, &SortKey::Time(at))) => {
                if at <= Instant::now() {
                    if let Some(key) = inner.run.pop() {
                        if let Some(item) = inner.items.get_mut(&key) {
                            item.state = ItemState::Bury;
                            inner.bury.insert(key.clone());
                            tracing::warn!(key = %key, "item exceeded its ttr, burying");
                        }
                    }
                    continue;
                }
                shared.run_cv.wait_until(&mut inner, at);
            }
            Some((_, &SortKey::PriorityFifo(_))) | None => {
                shared.run_cv.wait(&mut inner);
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
