//! C4 — Debouncer / BatchDebouncer. Collapses a burst of invocations into a
//! single trailing call after a quiet period (spec §4.4, §8 property 7).
//!
//! The teacher's `fsmonitor.rs` batches on a fixed 10ms window read off a
//! channel; this is the re-triggerable sibling the spec calls for — every
//! `trigger`/`add` resets the deadline. The subtlety flagged in spec §9
//! ("a timer that fires after `cancel`") is handled with a generation
//! counter: a spawned timer only invokes the callback if the generation it
//! captured is still current when it wakes up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct Inner<F> {
    pending: Mutex<Option<F>>,
    generation: AtomicU64,
    delay: Duration,
}

/// Debounces calls to a single pending closure `F`. `F` must be `FnOnce` +
/// `Send` + `'static` so it can be handed to a spawned task.
pub struct Debouncer<F: FnOnce() + Send + 'static> {
    inner: Arc<Inner<F>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: FnOnce() + Send + 'static> Debouncer<F> {
    pub fn new(delay: Duration) -> Self {
        Debouncer {
            inner: Arc::new(Inner {
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                delay,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Record `f` as the pending call and (re)start the quiet-period timer.
    /// Any previously pending call is discarded without being invoked.
    pub fn trigger(&self, f: F) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.pending.lock().unwrap() = Some(f);

        let inner = self.inner.clone();
        let delay = inner.delay;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            fire_if_current(&inner, generation);
        });

        if let Some(old) = self.handle.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Discard any pending call without invoking it.
    pub fn cancel(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.pending.lock().unwrap() = None;
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Invoke the pending call immediately, then clear it.
    pub fn flush(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        let f = self.inner.pending.lock().unwrap().take();
        if let Some(f) = f {
            f();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().unwrap().is_some()
    }
}

fn fire_if_current<F: FnOnce() + Send + 'static>(inner: &Arc<Inner<F>>, generation: u64) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    let f = inner.pending.lock().unwrap().take();
    if let Some(f) = f {
        f();
    }
}

/// Accumulates events and, after a quiet period, hands the whole batch to
/// `emit` in arrival order (spec §4.4).
pub struct BatchDebouncer<T: Send + 'static> {
    events: Arc<Mutex<Vec<T>>>,
    generation: Arc<AtomicU64>,
    delay: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    emit: Arc<dyn Fn(Vec<T>) + Send + Sync>,
}

impl<T: Send + 'static> BatchDebouncer<T> {
    pub fn new(delay: Duration, emit: impl Fn(Vec<T>) + Send + Sync + 'static) -> Self {
        BatchDebouncer {
            events: Arc::new(Mutex::new(Vec::new())),
            generation: Arc::new(AtomicU64::new(0)),
            delay,
            handle: Mutex::new(None),
            emit: Arc::new(emit),
        }
    }

    pub fn add(&self, event: T) {
        self.events.lock().unwrap().push(event);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        let gen_cell = self.generation.clone();
        let emit = self.emit.clone();
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if gen_cell.load(Ordering::SeqCst) != generation {
                return;
            }
            let batch = std::mem::take(&mut *events.lock().unwrap());
            if !batch.is_empty() {
                emit(batch);
            }
        });

        if let Some(old) = self.handle.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().clear();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn flush(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        let batch = std::mem::take(&mut *self.events.lock().unwrap());
        if !batch.is_empty() {
            (self.emit)(batch);
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}
