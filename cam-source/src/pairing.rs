use std::collections::VecDeque;

use pupil_types::GrayImage;

pub const DEFAULT_PAIR_WINDOW_MS: i64 = 5;

const QUEUE_CAPACITY: usize = 8;

/// One frame from one physical camera, stamped and numbered by its grabber
/// thread. Emitted pairs carry the primary's timestamp and frame number.
#[derive(Debug)]
pub struct TimedFrame {
    pub timestamp_ms: i64,
    pub frame_number: u64,
    pub image: GrayImage,
}

/// Binds two independently-grabbed frame streams into pairs by timestamp
/// proximity.
///
/// Both FIFOs are bounded; whenever both are non-empty the heads are
/// compared. Heads within the pair window are emitted as one pair carrying
/// the primary's timestamp; otherwise the older head is dropped and
/// counted. A pair emitted here is guaranteed to stem from one shared
/// trigger pulse, because the trigger period is always much larger than the
/// pair window.
pub struct Pairer {
    primary: VecDeque<TimedFrame>,
    secondary: VecDeque<TimedFrame>,
    window_ms: i64,
    drops: u64,
}

impl Pairer {
    pub fn new(window_ms: i64) -> Self {
        Self {
            primary: VecDeque::with_capacity(QUEUE_CAPACITY),
            secondary: VecDeque::with_capacity(QUEUE_CAPACITY),
            window_ms,
            drops: 0,
        }
    }

    pub fn push_primary(&mut self, frame: TimedFrame) -> Vec<(TimedFrame, TimedFrame)> {
        Self::push_bounded(&mut self.primary, frame, &mut self.drops);
        self.drain_pairs()
    }

    pub fn push_secondary(&mut self, frame: TimedFrame) -> Vec<(TimedFrame, TimedFrame)> {
        Self::push_bounded(&mut self.secondary, frame, &mut self.drops);
        self.drain_pairs()
    }

    fn push_bounded(queue: &mut VecDeque<TimedFrame>, frame: TimedFrame, drops: &mut u64) {
        if queue.len() == QUEUE_CAPACITY {
            queue.pop_front();
            *drops += 1;
        }
        queue.push_back(frame);
    }

    fn drain_pairs(&mut self) -> Vec<(TimedFrame, TimedFrame)> {
        let mut pairs = Vec::new();
        while let (Some(p), Some(s)) = (self.primary.front(), self.secondary.front()) {
            let dt = p.timestamp_ms - s.timestamp_ms;
            if dt.abs() <= self.window_ms {
                let p = self.primary.pop_front().unwrap();
                let s = self.secondary.pop_front().unwrap();
                pairs.push((p, s));
            } else if dt > 0 {
                // secondary head is older and unmatched
                self.secondary.pop_front();
                self.drops += 1;
            } else {
                self.primary.pop_front();
                self.drops += 1;
            }
        }
        pairs
    }

    /// Unmatched frames dropped so far.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.primary.len(), self.secondary.len())
    }
}
