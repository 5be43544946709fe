//! High-resolution timer for frame timing and profiling.

use std::time::{Duration, Instant};

/// High-resolution timer for measuring elapsed time.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
        }
    }

    /// Get the total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get the time elapsed since the last call to `tick()`.
    /// This is useful for calculating delta time in a game loop.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        delta
    }

    /// Get the delta time in seconds since the last tick.
    pub fn delta_secs(&mut self) -> f32 {
        self.tick().as_secs_f32()
    }

    /// Delta seconds since the last tick, clamped to `[0, max_secs]`.
    pub fn delta_secs_clamped(&mut self, max_secs: f32) -> f32 {
        self.delta_secs().clamp(0.0, max_secs)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts frames and reports the rate once per reporting interval.
#[derive(Debug)]
pub struct FpsCounter {
    interval: Duration,
    window_start: Instant,
    frames: u32,
    last_fps: f32,
}

impl FpsCounter {
    /// Creates a counter that reports every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            frames: 0,
            last_fps: 0.0,
        }
    }

    /// Records one frame. Returns the new rate when an interval has elapsed.
    pub fn frame(&mut self) -> Option<f32> {
        self.frame_at(Instant::now())
    }

    fn frame_at(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        self.last_fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(self.last_fps)
    }

    /// Most recently reported rate, 0 before the first report.
    pub fn fps(&self) -> f32 {
        self.last_fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_is_clamped() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(5));
        let delta = timer.delta_secs_clamped(0.001);
        assert!(delta <= 0.001);
        assert!(delta >= 0.0);
    }

    #[test]
    fn test_fps_reported_once_per_interval() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(Duration::from_secs(1));
        counter.window_start = start;

        for i in 1..60 {
            assert_eq!(counter.frame_at(start + Duration::from_millis(i * 16)), None);
        }
        let fps = counter.frame_at(start + Duration::from_secs(1)).unwrap();
        assert!((fps - 60.0).abs() < 0.01);
        assert_eq!(counter.fps(), fps);
        assert_eq!(counter.frames, 0);
    }
}
