//! Progress reporting decoupled from any UI.
//!
//! Long-running operations (pipeline stages, stack alignment) accept a
//! [`ProgressSink`] and report a fraction in `[0, 1]` together with an
//! optional one-line message. Sinks must be callable from worker threads.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait ProgressSink: Send + Sync {
    fn start_indeterminate(&self, message: Option<&str>);
    fn set(&self, progress_0_1: f32, message: Option<&str>);
    fn finish(&self, message: Option<&str>);
    fn reset(&self);
}

/// Shared handle type used throughout the crate.
pub type SharedProgress = Arc<dyn ProgressSink>;

pub struct NoopProgress;
impl ProgressSink for NoopProgress {
    fn start_indeterminate(&self, _message: Option<&str>) {}
    fn set(&self, _progress_0_1: f32, _message: Option<&str>) {}
    fn finish(&self, _message: Option<&str>) {}
    fn reset(&self) {}
}

pub fn noop_progress() -> SharedProgress {
    Arc::new(NoopProgress)
}

/// Forwards `set` updates to a closure, throttled to avoid flooding the
/// receiver when stages report every few rows.
pub struct FnProgress<F: Fn(f32, Option<&str>) + Send + Sync> {
    callback: F,
    last_update: Mutex<Instant>,
    min_interval: Duration,
}

impl<F: Fn(f32, Option<&str>) + Send + Sync> FnProgress<F> {
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            last_update: Mutex::new(Instant::now() - Duration::from_millis(100)),
            min_interval: Duration::from_millis(80),
        }
    }

    /// Disables throttling; every update is forwarded.
    pub fn unthrottled(callback: F) -> Self {
        Self {
            callback,
            last_update: Mutex::new(Instant::now() - Duration::from_millis(100)),
            min_interval: Duration::ZERO,
        }
    }
}

impl<F: Fn(f32, Option<&str>) + Send + Sync> ProgressSink for FnProgress<F> {
    fn start_indeterminate(&self, message: Option<&str>) {
        (self.callback)(-1.0, message);
        *self.last_update.lock().unwrap() = Instant::now();
    }

    fn set(&self, progress_0_1: f32, message: Option<&str>) {
        let clamped = progress_0_1.clamp(0.0, 1.0);
        // Duży skok lub komunikat – aktualizuj natychmiast, inaczej throttling
        let force = message.is_some() || clamped >= 0.99 || clamped <= 0.01;
        let mut last = self.last_update.lock().unwrap();
        let now = Instant::now();
        if force || now.duration_since(*last) >= self.min_interval {
            (self.callback)(clamped, message);
            *last = now;
        }
    }

    fn finish(&self, message: Option<&str>) {
        (self.callback)(1.0, message);
    }

    fn reset(&self) {
        (self.callback)(0.0, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_progress_forwards_updates() {
        let log = Mutex::new(Vec::new());
        let sink = FnProgress::unthrottled(|f, m: Option<&str>| {
            log.lock().unwrap().push((f, m.map(String::from)));
        });
        sink.set(0.25, Some("working"));
        sink.finish(None);

        let entries = log.into_inner().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 0.25);
        assert_eq!(entries[0].1.as_deref(), Some("working"));
        assert_eq!(entries[1].0, 1.0);
    }

    #[test]
    fn fraction_is_clamped() {
        let max = Mutex::new(0.0f32);
        let sink = FnProgress::unthrottled(|f, _| {
            let mut m = max.lock().unwrap();
            if f > *m {
                *m = f;
            }
        });
        sink.set(3.5, None);
        assert_eq!(*max.lock().unwrap(), 1.0);
    }
}
