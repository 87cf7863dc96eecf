//! Named-signal dispatcher.
//!
//! A signal is a plain string channel. Handlers connect to a signal and get
//! a [`SignalId`] back; they stay connected until explicitly disconnected.
//! Sending to a signal nobody listens on is not an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::services::ServiceError;

/// Payload carried by a signal.
pub type SignalPayload = Map<String, Value>;

pub type SignalHandler = Arc<dyn Fn(&SignalPayload) -> Result<(), ServiceError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(u64);

#[derive(Default)]
pub struct Dispatcher {
    signals: DashMap<String, Vec<(SignalId, SignalHandler)>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, signal: &str, handler: SignalHandler) -> SignalId {
        let id = SignalId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.signals
            .entry(signal.to_string())
            .or_default()
            .push((id, handler));
        tracing::trace!(signal = %signal, "Signal connected");
        id
    }

    pub fn disconnect(&self, signal: &str, id: SignalId) -> bool {
        let mut removed = false;
        if let Some(mut handlers) = self.signals.get_mut(signal) {
            let before = handlers.len();
            handlers.retain(|(h_id, _)| *h_id != id);
            removed = handlers.len() != before;
        }
        self.signals.remove_if(signal, |_, handlers| handlers.is_empty());
        removed
    }

    /// Deliver `payload` to every handler connected to `signal`.
    ///
    /// All handlers run even if one fails; the first failure is returned.
    /// On success, returns how many handlers ran.
    pub fn send(&self, signal: &str, payload: &SignalPayload) -> Result<usize, ServiceError> {
        let handlers: Vec<SignalHandler> = match self.signals.get(signal) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                tracing::trace!(signal = %signal, "Signal has no listeners");
                return Ok(0);
            }
        };

        let mut first_error = None;
        for handler in &handlers {
            if let Err(e) = handler(payload) {
                tracing::warn!(signal = %signal, error = %e, "Signal handler failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(handlers.len()),
        }
    }

    /// Handlers connected across all signals.
    pub fn total_listeners(&self) -> usize {
        self.signals.iter().map(|entry| entry.value().len()).sum()
    }

    #[cfg(test)]
    pub fn listener_count(&self, signal: &str) -> usize {
        self.signals.get(signal).map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> SignalHandler {
        Arc::new(move |_payload: &SignalPayload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_send_reaches_connected_handlers() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.connect("SIGNAL_a", counting_handler(counter.clone()));
        dispatcher.connect("SIGNAL_a", counting_handler(counter.clone()));
        dispatcher.connect("SIGNAL_b", counting_handler(counter.clone()));

        assert_eq!(dispatcher.send("SIGNAL_a", &Map::new()).unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.total_listeners(), 3);
    }

    #[test]
    fn test_send_without_listeners_is_ok() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.send("SIGNAL_nobody", &Map::new()).unwrap(), 0);
    }

    #[test]
    fn test_disconnect() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.connect("SIGNAL_a", counting_handler(counter.clone()));
        assert_eq!(dispatcher.listener_count("SIGNAL_a"), 1);

        assert!(dispatcher.disconnect("SIGNAL_a", id));
        assert!(!dispatcher.disconnect("SIGNAL_a", id));
        assert_eq!(dispatcher.listener_count("SIGNAL_a"), 0);
        dispatcher.send("SIGNAL_a", &Map::new()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_does_not_stop_other_handlers() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.connect(
            "SIGNAL_a",
            Arc::new(|_: &SignalPayload| -> Result<(), ServiceError> {
                Err(ServiceError::CallFailed("boom".to_string()))
            }),
        );
        dispatcher.connect("SIGNAL_a", counting_handler(counter.clone()));

        let result = dispatcher.send("SIGNAL_a", &Map::new());
        assert!(matches!(result, Err(ServiceError::CallFailed(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_disconnect_itself() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slot: Arc<std::sync::Mutex<Option<SignalId>>> = Arc::default();
        let d = dispatcher.clone();
        let s = slot.clone();
        let id = dispatcher.connect(
            "SIGNAL_once",
            Arc::new(move |_: &SignalPayload| {
                if let Some(id) = *s.lock().unwrap() {
                    d.disconnect("SIGNAL_once", id);
                }
                Ok(())
            }),
        );
        *slot.lock().unwrap() = Some(id);

        assert_eq!(dispatcher.send("SIGNAL_once", &Map::new()).unwrap(), 1);
        assert_eq!(dispatcher.listener_count("SIGNAL_once"), 0);
    }
}
