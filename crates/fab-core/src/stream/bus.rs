//! Synchronous fan-out of events to registered handlers.
//!
//! The handler list sits behind a read-write lock and every emission walks
//! a snapshot of it. A handler may therefore register or remove handlers
//! while being invoked; the change takes effect from the next emission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Identifies a registration for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.len())
            .finish()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns whether the handler was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Invoke every handler registered before this call, exactly once.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_every_subscriber() {
        let bus = EventBus::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = Arc::clone(&total);
            bus.subscribe(move |n| {
                total.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }
        bus.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::<u32>::new());
        let late_hits = Arc::new(AtomicUsize::new(0));
        let registered = Arc::new(AtomicUsize::new(0));

        let inner_bus = Arc::clone(&bus);
        let inner_hits = Arc::clone(&late_hits);
        let inner_registered = Arc::clone(&registered);
        bus.subscribe(move |_| {
            if inner_registered.fetch_add(1, Ordering::SeqCst) == 0 {
                let hits = Arc::clone(&inner_hits);
                inner_bus.subscribe(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        bus.emit(&1);
        // The handler added mid-emission is not invoked for that emission.
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        bus.emit(&2);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_registration_while_emitting() {
        const PER_THREAD: usize = 50;
        const EMISSIONS: u64 = 200;

        let bus = Arc::new(EventBus::<u64>::new());
        // Per handler: the events it received, in order.
        let logs: Arc<Mutex<Vec<Arc<Mutex<Vec<u64>>>>>> = Arc::new(Mutex::new(Vec::new()));

        let registrars: Vec<_> = (0..2)
            .map(|_| {
                let bus = Arc::clone(&bus);
                let logs = Arc::clone(&logs);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let log = Arc::new(Mutex::new(Vec::new()));
                        logs.lock().unwrap().push(Arc::clone(&log));
                        bus.subscribe(move |n| log.lock().unwrap().push(*n));
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        let emitter = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                for n in 1..=EMISSIONS {
                    bus.emit(&n);
                    std::thread::yield_now();
                }
            })
        };

        for handle in registrars {
            handle.join().unwrap();
        }
        emitter.join().unwrap();

        assert_eq!(bus.len(), 2 * PER_THREAD);
        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 2 * PER_THREAD);
        for log in logs.iter() {
            let seen = log.lock().unwrap();
            // Once registered, a handler sees every later emission exactly
            // once and in order: its log is a contiguous tail of 1..=EMISSIONS.
            if let Some(first) = seen.first() {
                let expected: Vec<u64> = (*first..=EMISSIONS).collect();
                assert_eq!(*seen, expected);
            }
        }
    }
}
