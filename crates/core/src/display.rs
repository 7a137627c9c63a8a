//! Periodic position and spectrum updates for a UI.

use std::sync::Arc;
use std::time::Duration;

use studio_engine::AnalysisTap;
use studio_engine::analysis::BIN_COUNT;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::TransportClock;

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub position: f64,
    pub playing: bool,
    /// Byte magnitudes from the master bus analysis tap.
    pub spectrum: Vec<u8>,
}

impl Default for DisplayFrame {
    fn default() -> Self {
        Self {
            position: 0.0,
            playing: false,
            spectrum: vec![0; BIN_COUNT],
        }
    }
}

pub(crate) fn sample(clock: &TransportClock, tap: Option<&AnalysisTap>) -> DisplayFrame {
    DisplayFrame {
        position: clock.position(),
        playing: clock.is_running(),
        spectrum: tap.map_or_else(|| vec![0; BIN_COUNT], AnalysisTap::snapshot),
    }
}

/// A task publishing a [`DisplayFrame`] every tick. Aborted when dropped.
#[derive(Debug)]
pub struct DisplayLoop {
    task: JoinHandle<()>,
}

impl DisplayLoop {
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        every: Duration,
        clock: TransportClock,
        tap: Option<AnalysisTap>,
        frames: Arc<watch::Sender<DisplayFrame>>,
    ) -> Self {
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                frames.send_replace(sample(&clock, tap.as_ref()));
            }
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for DisplayLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}
