//! Low-memory signal source.

use std::sync::Arc;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

/// Broadcasts low-memory warnings.
///
/// Each `register()` call returns a receiver that fires at most once; a
/// consumer that wants later warnings registers again.
#[derive(Clone, Default)]
pub struct MemoryPressure {
    observers: Arc<Mutex<Vec<Sender<()>>>>,
}

impl MemoryPressure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Receiver<()> {
        let (tx, rx) = flume::bounded(1);
        self.observers.lock().push(tx);
        rx
    }

    /// Fire every current registration. Returns how many were notified.
    pub fn signal(&self) -> usize {
        let observers = std::mem::take(&mut *self.observers.lock());
        let notified = observers.iter().filter(|tx| tx.try_send(()).is_ok()).count();
        info!(notified, "Memory warning signalled");
        notified
    }
}
