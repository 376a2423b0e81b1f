use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct State {
    coupled: bool,
    released: bool,
    published: u64,
    processed: u64,
}

/// Hand-shake coupling a file-playback reader to detector completion.
///
/// When coupled, the reader marks each frame published and then blocks
/// until the detector reports it processed, so deterministic playback never
/// skips a frame. When uncoupled (detection off), the wait is
/// short-circuited and playback runs at its target cadence.
///
/// Sequence counters rather than a flag: the detector may finish (and
/// notify) before the reader reaches its wait, so the notification must not
/// be lost. The reader marks *before* publishing the frame.
pub struct PlaybackSync {
    state: Mutex<State>,
    processed: Condvar,
}

impl Default for PlaybackSync {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PlaybackSync {
    pub fn new(coupled: bool) -> Self {
        Self {
            state: Mutex::new(State {
                coupled,
                released: false,
                published: 0,
                processed: 0,
            }),
            processed: Condvar::new(),
        }
    }

    pub fn shared(coupled: bool) -> Arc<Self> {
        Arc::new(Self::new(coupled))
    }

    /// Enabling coupling mid-run starts from a clean slate so frames
    /// dropped while uncoupled are not waited for.
    pub fn set_coupled(&self, coupled: bool) {
        let mut state = self.state.lock();
        state.coupled = coupled;
        state.processed = state.published;
        self.processed.notify_all();
    }

    pub fn is_coupled(&self) -> bool {
        self.state.lock().coupled
    }

    /// Reader side, step 1: account for a frame about to be published.
    ///
    /// Must be called before the frame becomes visible to the detector,
    /// otherwise the processed notification can arrive first and be lost.
    pub fn mark_published(&self) {
        self.state.lock().published += 1;
    }

    /// Reader side, step 2: block until the marked frame was processed.
    pub fn wait_processed(&self) {
        let mut state = self.state.lock();
        while state.coupled && !state.released && state.processed < state.published {
            self.processed.wait(&mut state);
        }
    }

    /// Detector side: one frame finished processing.
    pub fn notify_processed(&self) {
        let mut state = self.state.lock();
        // never run ahead of the reader; uncoupled stretches would
        // otherwise bank notifications and void future waits
        state.processed = state.published.min(state.processed + 1);
        self.processed.notify_all();
    }

    /// Permanently release any current and future waiter, used at shutdown.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.processed.notify_all();
    }
}
