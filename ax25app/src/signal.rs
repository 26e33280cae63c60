use std::sync::{Arc, Mutex, Weak};

type SlotFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// A multi-subscriber event notifier.
///
/// Slots are called synchronously on whichever thread emits, in connection
/// order. Permanent connections stay until disconnected; one-shot
/// connections detach themselves the first time the signal is emitted.
pub struct Signal<T> {
    inner: Arc<Mutex<SignalInner<T>>>,
}

struct SignalInner<T> {
    next_id: usize,
    slots: Vec<SlotEntry<T>>,
}

struct SlotEntry<T> {
    id: usize,
    callback: SlotFn<T>,
    oneshot: bool,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal {
            inner: Arc::new(Mutex::new(SignalInner {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Connect a permanent slot. The returned id can be used to disconnect.
    pub fn connect(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> usize {
        self.add(Arc::new(callback), false).0
    }

    /// Connect a slot that detaches itself on the first emission. The
    /// returned handle can also be called directly, which likewise detaches
    /// it.
    pub fn connect_oneshot(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Slot<T> {
        let (id, callback) = self.add(Arc::new(callback), true);
        Slot {
            signal: Arc::downgrade(&self.inner),
            id,
            callback,
        }
    }

    pub fn disconnect(&self, id: usize) {
        self.inner.lock().unwrap().slots.retain(|slot| slot.id != id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every connected slot with the payload. One-shot slots are
    /// detached before their callback runs, so a slot emitting the same
    /// signal recursively cannot fire twice.
    pub fn emit(&self, payload: &T) {
        let snapshot: Vec<SlotFn<T>> = {
            let mut inner = self.inner.lock().unwrap();
            let snapshot = inner
                .slots
                .iter()
                .map(|slot| slot.callback.clone())
                .collect();
            inner.slots.retain(|slot| !slot.oneshot);
            snapshot
        };
        for callback in snapshot {
            callback(payload);
        }
    }

    fn add(&self, callback: SlotFn<T>, oneshot: bool) -> (usize, SlotFn<T>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.push(SlotEntry {
            id,
            callback: callback.clone(),
            oneshot,
        });
        (id, callback)
    }
}

/// Handle to a one-shot connection.
///
/// Calling it runs the slot and detaches it from the signal. The handle only
/// holds a weak reference, so it keeps working (and simply skips the detach)
/// after the signal itself is gone.
pub struct Slot<T> {
    signal: Weak<Mutex<SignalInner<T>>>,
    id: usize,
    callback: SlotFn<T>,
}

impl<T> Slot<T> {
    pub fn call(&self, payload: &T) {
        if let Some(signal) = self.signal.upgrade() {
            signal
                .lock()
                .unwrap()
                .slots
                .retain(|slot| slot.id != self.id);
        }
        (self.callback)(payload);
    }
}
