//! Lifecycle event multicast.
//!
//! Event subscribers are plain callbacks held outside the data plane. Each
//! invocation is isolated with `catch_unwind` so a panicking subscriber
//! cannot take down the dispatcher or starve the other subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::ParsedFrame;

type VoidListener = Arc<dyn Fn() + Send + Sync>;
type RestoredListener = Arc<dyn Fn(Duration) + Send + Sync>;
type FrameListener = Arc<dyn Fn(&ParsedFrame) + Send + Sync>;

/// Callback lists for the events a connection emits.
#[derive(Default)]
pub(crate) struct ConnectionEvents {
    connection_lost: Mutex<Vec<VoidListener>>,
    connection_restored: Mutex<Vec<RestoredListener>>,
    connection_closed: Mutex<Vec<VoidListener>>,
    closed: Mutex<Vec<VoidListener>>,
    activity_paused: Mutex<Vec<VoidListener>>,
    activity_unpaused: Mutex<Vec<VoidListener>>,
    unhandled_message: Mutex<Vec<FrameListener>>,
}

fn invoke(listeners: &Mutex<Vec<VoidListener>>) {
    let snapshot: Vec<VoidListener> = listeners.lock().clone();
    for listener in snapshot {
        if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
            tracing::error!("event subscriber panicked");
        }
    }
}

impl ConnectionEvents {
    pub(crate) fn on_connection_lost(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.connection_lost.lock().push(Arc::new(listener));
    }

    pub(crate) fn on_connection_restored(
        &self,
        listener: impl Fn(Duration) + Send + Sync + 'static,
    ) {
        self.connection_restored.lock().push(Arc::new(listener));
    }

    pub(crate) fn on_connection_closed(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.connection_closed.lock().push(Arc::new(listener));
    }

    pub(crate) fn on_closed(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.closed.lock().push(Arc::new(listener));
    }

    pub(crate) fn on_activity_paused(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.activity_paused.lock().push(Arc::new(listener));
    }

    pub(crate) fn on_activity_unpaused(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.activity_unpaused.lock().push(Arc::new(listener));
    }

    pub(crate) fn on_unhandled_message(
        &self,
        listener: impl Fn(&ParsedFrame) + Send + Sync + 'static,
    ) {
        self.unhandled_message.lock().push(Arc::new(listener));
    }

    pub(crate) fn emit_connection_lost(&self) {
        invoke(&self.connection_lost);
    }

    pub(crate) fn emit_connection_restored(&self, outage: Duration) {
        let snapshot: Vec<RestoredListener> = self.connection_restored.lock().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(outage))).is_err() {
                tracing::error!("event subscriber panicked");
            }
        }
    }

    pub(crate) fn emit_connection_closed(&self) {
        invoke(&self.connection_closed);
    }

    pub(crate) fn emit_closed(&self) {
        invoke(&self.closed);
    }

    pub(crate) fn emit_activity_paused(&self) {
        invoke(&self.activity_paused);
    }

    pub(crate) fn emit_activity_unpaused(&self) {
        invoke(&self.activity_unpaused);
    }

    pub(crate) fn emit_unhandled_message(&self, frame: &ParsedFrame) {
        let snapshot: Vec<FrameListener> = self.unhandled_message.lock().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(frame))).is_err() {
                tracing::error!("event subscriber panicked");
            }
        }
    }
}
