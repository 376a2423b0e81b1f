use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Slot<T> {
    value: Option<T>,
    closed: bool,
    replaced: u64,
}

/// Single-slot hand-off with latest-wins semantics.
///
/// While the consumer is busy, a newly posted value replaces any waiting
/// value, so the consumer always sees the freshest item. This is the one
/// place in the detection path where frames may be dropped under load, and
/// it is intentional: it keeps latency bounded instead of queue depth.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    value: None,
                    closed: false,
                    replaced: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Post a value, replacing any value not yet taken.
    ///
    /// Returns true when a waiting value was replaced. Posting to a closed
    /// mailbox is a no-op returning false.
    pub fn post(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.closed {
            return false;
        }
        let replaced = slot.value.replace(value).is_some();
        if replaced {
            slot.replaced += 1;
        }
        self.inner.cond.notify_one();
        replaced
    }

    /// Block until a value is available or the mailbox is closed.
    ///
    /// Returns None only after close, once any remaining value has been
    /// drained.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(v) = slot.value.take() {
                return Some(v);
            }
            if slot.closed {
                return None;
            }
            self.inner.cond.wait(&mut slot);
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.inner.slot.lock().value.take()
    }

    /// Close the mailbox and wake any waiting consumer. Idempotent.
    pub fn close(&self) {
        let mut slot = self.inner.slot.lock();
        slot.closed = true;
        self.inner.cond.notify_all();
    }

    /// Number of values that were overwritten before being taken.
    pub fn replaced_count(&self) -> u64 {
        self.inner.slot.lock().replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_wins() {
        let mb = Mailbox::new();
        assert!(!mb.post(1));
        assert!(mb.post(2));
        assert!(mb.post(3));
        assert_eq!(mb.take(), Some(3));
        assert_eq!(mb.replaced_count(), 2);
    }

    #[test]
    fn close_drains_then_ends() {
        let mb = Mailbox::new();
        mb.post(7);
        mb.close();
        assert_eq!(mb.take(), Some(7));
        assert_eq!(mb.take(), None);
        assert!(!mb.post(8));
    }

    #[test]
    fn take_wakes_on_post_from_other_thread() {
        let mb = Mailbox::new();
        let mb2 = mb.clone();
        let handle = std::thread::spawn(move || mb2.take());
        std::thread::sleep(std::time::Duration::from_millis(20));
        mb.post(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }
}
