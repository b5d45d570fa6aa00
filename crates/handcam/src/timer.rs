//! Performance measurement tools.

use std::{
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

/// A timer that measures how long an operation takes.
///
/// Timings are summarized and reset whenever the timer is displayed using `{}`
/// ([`std::fmt::Display`]).
pub struct Timer {
    name: &'static str,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    total: Duration,
    max: Duration,
    count: u32,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation using a drop guard.
    ///
    /// When the returned [`TimerGuard`] is dropped, the time between the call to `start` and the
    /// drop is recorded.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    fn record(&self, duration: Duration) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.total += duration;
        state.max = state.max.max(duration);
        state.count += 1;
    }
}

/// Displays the average and maximum recorded time and resets both.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.lock() {
            Ok(mut state) => std::mem::take(&mut *state),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let avg_ms = match state.count {
            0 => 0.0,
            n => state.total.as_secs_f32() * 1000.0 / n as f32,
        };
        let max_ms = state.max.as_secs_f32() * 1000.0;

        write!(
            f,
            "{}: {}x{avg_ms:.01}ms (max {max_ms:.01}ms)",
            self.name, state.count
        )
    }
}

/// Guard returned by [`Timer::start`]. Stops timing the operation when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// Logs frames per second with optional timer summaries.
pub struct FpsCounter {
    name: String,
    frames: u32,
    start: Instant,
}

impl FpsCounter {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start: Instant::now(),
        }
    }

    /// Advances the frame counter by 1 and logs FPS if one second has passed.
    pub fn tick(&mut self) {
        self.tick_with(std::iter::empty::<&Timer>());
    }

    /// Advances the frame counter by 1 and logs FPS and the given timers if one second has passed.
    ///
    /// Timers are only displayed (and therefore reset) when a log line is written.
    pub fn tick_with<'a, I: IntoIterator<Item = &'a Timer>>(&mut self, timers: I) {
        self.frames += 1;
        if self.start.elapsed() < Duration::from_secs(1) {
            return;
        }

        let extra = timers
            .into_iter()
            .map(|timer| timer.to_string())
            .collect::<Vec<_>>();
        if extra.is_empty() {
            log::debug!("{}: {} FPS", self.name, self.frames);
        } else {
            log::debug!("{}: {} FPS ({})", self.name, self.frames, extra.join(", "));
        }

        self.frames = 0;
        self.start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_resets() {
        let timer = Timer::new("op");
        timer.time(|| {});
        timer.time(|| {});
        let shown = timer.to_string();
        assert!(shown.starts_with("op: 2x"), "{shown}");
        assert_eq!(timer.to_string(), "op: 0x0.0ms (max 0.0ms)");
    }

    #[test]
    fn time_returns_value() {
        let timer = Timer::new("op");
        assert_eq!(timer.time(|| 42), 42);
    }
}
