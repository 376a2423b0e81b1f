use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

enum Outlet<T> {
    Unbounded(Sender<T>),
    /// Bounded subscribers are lossy: a full queue drops the value rather
    /// than blocking the publisher.
    Bounded(Sender<T>),
}

/// Fan-out registry: one producer, any number of queued subscribers.
///
/// Pure broadcast, no transformation. Each subscriber gets its own channel
/// consumed on its own thread; disconnected subscribers are pruned on the
/// next publish.
pub struct Hub<T> {
    outlets: Mutex<Vec<Outlet<T>>>,
}

impl<T: Clone> Default for Hub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Hub<T> {
    pub fn new() -> Self {
        Self {
            outlets: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe with an unbounded queue. The publisher never blocks.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.outlets.lock().push(Outlet::Unbounded(tx));
        rx
    }

    /// Subscribe with a bounded queue; values published while the queue is
    /// full are dropped for this subscriber only.
    pub fn subscribe_bounded(&self, cap: usize) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::bounded(cap);
        self.outlets.lock().push(Outlet::Bounded(tx));
        rx
    }

    pub fn publish(&self, value: T) {
        let mut outlets = self.outlets.lock();
        outlets.retain(|outlet| match outlet {
            Outlet::Unbounded(tx) => tx.send(value.clone()).is_ok(),
            Outlet::Bounded(tx) => match tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            },
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.outlets.lock().len()
    }
}
