use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// A completed frequency change on one CPU (kHz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqTransition {
    pub cpu: usize,
    pub old: u32,
    pub new: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Key,
    Touch,
    Pointer,
}

/// User activity that opens a boost window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub at: Instant,
    pub kind: InputKind,
}

/// A CPU joined or left the online set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugEvent {
    pub cpu: usize,
    pub online: bool,
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Subscription-style event source.
///
/// Handlers run on the notifying thread with the registry locked, so
/// dropping a [`Subscription`] waits for an in-flight notification and no
/// handler runs once the drop has returned. A handler must therefore not
/// drop its own subscription or notify the same source.
pub struct Notifier<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Notifier<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut reg = lock(&self.inner);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).handlers.retain(|(h, _)| *h != id);
                }
            })),
        }
    }

    pub fn notify(&self, event: &T) {
        let reg = lock(&self.inner);
        for (_, handler) in &reg.handlers {
            handler(event);
        }
    }

    pub fn subscribers(&self) -> usize {
        lock(&self.inner).handlers.len()
    }
}

impl<T: 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Notifier::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Every event source the governors listen to.
#[derive(Clone, Default)]
pub struct EventBus {
    pub frequency: Notifier<FreqTransition>,
    pub input: Notifier<InputEvent>,
    pub hotplug: Notifier<HotplugEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}
