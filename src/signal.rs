//! Change notifications.
//!
//! Components own a [`Signal`] per event type and call `emit` after their
//! state changed. Listeners run synchronously on the emitting thread.

use std::fmt;

type Listener<E> = Box<dyn Fn(&E) + Send + Sync>;

pub struct Signal<E> {
    listeners: Vec<Listener<E>>,
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<E> fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<E> Signal<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, listener: impl Fn(&E) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            listener(event);
        }
    }

    pub fn disconnect_all(&mut self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Collects emitted events; handy for wiring a signal into tests or a
/// polling front end.
#[derive(Debug)]
pub struct EventLog<E> {
    events: std::sync::Arc<std::sync::Mutex<Vec<E>>>,
}

impl<E> Clone for EventLog<E> {
    fn clone(&self) -> Self {
        Self {
            events: std::sync::Arc::clone(&self.events),
        }
    }
}

impl<E> Default for EventLog<E> {
    fn default() -> Self {
        Self {
            events: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone + Send + 'static> EventLog<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches this log to `signal`.
    pub fn attach(&self, signal: &mut Signal<E>) {
        let events = std::sync::Arc::clone(&self.events);
        signal.connect(move |event: &E| {
            if let Ok(mut events) = events.lock() {
                events.push(event.clone());
            }
        });
    }

    /// Returns and clears everything recorded so far.
    pub fn drain(&self) -> Vec<E> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_every_listener() {
        let mut signal = Signal::<u32>::new();
        let a = EventLog::new();
        let b = EventLog::new();
        a.attach(&mut signal);
        b.attach(&mut signal);

        signal.emit(&7);
        signal.emit(&9);

        assert_eq!(a.drain(), vec![7, 9]);
        assert_eq!(b.drain(), vec![7, 9]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn disconnect_all_silences_signal() {
        let mut signal = Signal::<u32>::new();
        let log = EventLog::new();
        log.attach(&mut signal);
        signal.disconnect_all();
        signal.emit(&1);
        assert_eq!(signal.listener_count(), 0);
        assert!(log.drain().is_empty());
    }
}
