//! A named background poll thread (spec [ADD] under §5, grounded on the
//! teacher's `std::thread::Builder::new().name(...).spawn(...)` idiom in
//! its VM tick loop, generalized here to wrap any polling closure instead
//! of one hardcoded to the BPMN VM).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs `tick` repeatedly on its own thread until stopped, sleeping
/// `idle_sleep` whenever `tick` reports no work was done.
pub struct PollThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollThread {
    pub fn spawn<F>(name: impl Into<String>, idle_sleep: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let handle = std::thread::Builder::new().name(name.into()).spawn(move || {
            while !stop_thread.load(Ordering::Relaxed) {
                let did_work = tick();
                if !did_work {
                    std::thread::sleep(idle_sleep);
                }
            }
        })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn tick_runs_until_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let thread = PollThread::spawn("test-poll", Duration::from_millis(1), move || {
            c.fetch_add(1, Ordering::Relaxed);
            true
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        thread.stop();
        assert!(counter.load(Ordering::Relaxed) > 0);
    }
}
