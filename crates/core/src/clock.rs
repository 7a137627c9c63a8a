//! Arrangement position derived from a monotonic time source.

use std::sync::{Arc, Mutex, PoisonError};

use studio_engine::FrameClock;

/// A monotonic clock in seconds.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> f64;
}

impl TimeSource for FrameClock {
    fn now(&self) -> f64 {
        self.seconds()
    }
}

/// A time source that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    now: Arc<Mutex<f64>>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += seconds;
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    running: bool,
    /// Source time at which the arrangement was at position 0.
    anchor: f64,
    /// Position reported while stopped.
    frozen: f64,
}

/// Shared handle onto the transport position.
///
/// Clones observe the same state, so the display loop can hold one and read
/// the position without going through the session.
#[derive(Clone)]
pub struct TransportClock {
    source: Arc<dyn TimeSource>,
    state: Arc<Mutex<ClockState>>,
}

impl TransportClock {
    pub fn new(source: impl TimeSource) -> Self {
        Self {
            source: Arc::new(source),
            state: Arc::new(Mutex::new(ClockState {
                running: false,
                anchor: 0.0,
                frozen: 0.0,
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, from: f64) {
        let now = self.source.now();
        let mut state = self.state();
        state.anchor = now - from.max(0.0);
        state.running = true;
    }

    /// Freeze at the current position.
    pub fn stop(&self) {
        let now = self.source.now();
        let mut state = self.state();
        if state.running {
            state.frozen = (now - state.anchor).max(0.0);
            state.running = false;
        }
    }

    pub fn seek(&self, position: f64) {
        let position = position.max(0.0);
        let now = self.source.now();
        let mut state = self.state();
        if state.running {
            state.anchor = now - position;
        } else {
            state.frozen = position;
        }
    }

    pub fn position(&self) -> f64 {
        let now = self.source.now();
        let state = self.state();
        if state.running {
            (now - state.anchor).max(0.0)
        } else {
            state.frozen
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }
}

impl std::fmt::Debug for TransportClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClock")
            .field("position", &self.position())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> (ManualTime, TransportClock) {
        let time = ManualTime::new();
        (time.clone(), TransportClock::new(time))
    }

    #[test]
    fn test_position_tracks_source_while_running() {
        let (time, clock) = clock();
        time.advance(10.0);
        clock.start(2.0);
        assert_eq!(clock.position(), 2.0);

        time.advance(1.5);
        assert_eq!(clock.position(), 3.5);
    }

    #[test]
    fn test_stop_freezes() {
        let (time, clock) = clock();
        clock.start(0.0);
        time.advance(4.0);
        clock.stop();
        time.advance(100.0);

        assert_eq!(clock.position(), 4.0);
        assert!(!clock.is_running());
    }

    #[test]
    fn test_seek_while_stopped_moves_frozen_position() {
        let (time, clock) = clock();
        clock.seek(7.0);
        time.advance(3.0);
        assert_eq!(clock.position(), 7.0);
    }

    #[test]
    fn test_seek_while_running_reanchors() {
        let (time, clock) = clock();
        clock.start(0.0);
        time.advance(5.0);
        clock.seek(1.0);
        time.advance(0.5);
        assert_eq!(clock.position(), 1.5);
    }

    #[test]
    fn test_negative_positions_clamp() {
        let (_, clock) = clock();
        clock.seek(-3.0);
        assert_eq!(clock.position(), 0.0);
        clock.start(-1.0);
        assert_eq!(clock.position(), 0.0);
    }

    #[test]
    fn test_clones_share_state() {
        let (time, clock) = clock();
        let reader = clock.clone();
        clock.start(1.0);
        time.advance(1.0);
        assert_eq!(reader.position(), 2.0);
    }
}
