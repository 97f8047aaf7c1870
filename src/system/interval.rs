use crate::{s_debug, s_error};
use may::coroutine::JoinHandle;
use may::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

/// A task that runs on a fixed period in its own coroutine until stopped.
///
/// Stop is cooperative: a tick that is already running finishes first.
pub struct Interval {
    name: &'static str,
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Interval {
    pub fn start<F>(name: &'static str, period: Duration, mut task: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = may::go!(move || {
            loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    // explicit stop or the handle was dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            s_debug!("interval {name} stopped");
        });
        s_debug!("interval {name} started with period {period:?}");

        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task and wait for its coroutine to exit.
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                s_error!("interval {} panicked", self.name);
            }
        }
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        // detached: the coroutine notices on its next wake-up
        let _ = self.stop.send(());
    }
}
