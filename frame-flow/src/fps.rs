use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub fps: f64,
    pub frames: u32,
}

/// Counts frames over a one-second sliding window.
///
/// Call [FpsCounter::tick] once per frame; a report is returned once per
/// elapsed window.
pub struct FpsCounter {
    window: Duration,
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            window_start: Instant::now(),
            frames: 0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> Option<FpsReport> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.window {
            let report = FpsReport {
                fps: self.frames as f64 / elapsed.as_secs_f64(),
                frames: self.frames,
            };
            self.window_start = now;
            self.frames = 0;
            Some(report)
        } else {
            None
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_once_per_window() {
        let start = Instant::now();
        let mut c = FpsCounter::with_window(Duration::from_millis(100));
        c.window_start = start;
        for i in 1..10 {
            assert_eq!(c.tick(start + Duration::from_millis(i * 10)), None);
        }
        let report = c.tick(start + Duration::from_millis(100)).unwrap();
        assert_eq!(report.frames, 10);
        assert!((report.fps - 100.0).abs() < 1.0);
        // window restarted
        assert_eq!(c.tick(start + Duration::from_millis(110)), None);
    }
}
