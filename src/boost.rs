use crate::events::{EventBus, InputEvent, InputKind, Subscription};
use evdev::{EventType, Key};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Remembers the latest user-input event and answers whether a boost
/// window of a given length is still open.
#[derive(Debug, Default)]
pub struct InputBoost {
    last_event: Mutex<Option<Instant>>,
}

impl InputBoost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Out-of-order timestamps never move the window backwards.
    pub fn record(&self, at: Instant) {
        let mut last = self.last_event.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_none_or(|prev| at > prev) {
            *last = Some(at);
        }
    }

    pub fn last_event(&self) -> Option<Instant> {
        *self.last_event.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active_at(&self, window: Duration, now: Instant) -> bool {
        self.last_event()
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    pub fn is_active(&self, window: Duration) -> bool {
        self.is_active_at(window, Instant::now())
    }

    /// Feeds this tracker from the bus until the subscription is dropped.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let boost = Arc::clone(self);
        bus.input
            .subscribe(move |event: &InputEvent| boost.record(event.at))
    }
}

/// Classifies one event read from an input device. Sync and misc events,
/// and key releases, are not activity.
pub fn classify_input(event: &evdev::InputEvent) -> Option<InputKind> {
    let kind = event.event_type();
    if kind == EventType::KEY {
        if event.value() == 0 {
            None
        } else if event.code() == Key::BTN_TOUCH.code() {
            Some(InputKind::Touch)
        } else {
            Some(InputKind::Key)
        }
    } else if kind == EventType::ABSOLUTE {
        Some(InputKind::Touch)
    } else if kind == EventType::RELATIVE {
        Some(InputKind::Pointer)
    } else {
        None
    }
}
