//! Background polling threads.
//!
//! A [`WorkerThread`] runs a tick closure, waits `interval`, and repeats
//! until stopped. Each tick folds its result into a state value that is
//! handed back by [`WorkerThread::stop`].
//!
//! ```ignore
//! let worker = WorkerThread::spawn("outbox-publisher", interval, PublishStats::default(), move |stats| {
//!     if let Ok(cycle) = publisher.publish_pending() {
//!         stats.merge(cycle);
//!     }
//! })?;
//!
//! // ... later
//! let WorkerStats { polls, stats } = worker.stop();
//! ```

use std::io;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

/// What a worker accumulated before it stopped.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerStats<T> {
    pub polls: usize,
    pub stats: T,
}

/// A named thread calling `tick` every `interval` until stopped.
pub struct WorkerThread<T> {
    name: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<WorkerStats<T>>>,
}

impl<T: Default + Send + 'static> WorkerThread<T> {
    /// Start the thread. The first tick runs immediately.
    ///
    /// A zero `interval` ticks back to back, for ticks that block on their
    /// own (such as waiting for a broker delivery).
    pub fn spawn<F>(name: &str, interval: Duration, state: T, mut tick: F) -> io::Result<Self>
    where
        F: FnMut(&mut T) + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel();
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut stats = WorkerStats { polls: 0, stats: state };
            debug!(worker = %thread_name, "Worker started");

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                stats.polls += 1;
                tick(&mut stats.stats);

                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }

            debug!(worker = %thread_name, polls = stats.polls, "Worker stopped");
            stats
        })?;

        Ok(Self {
            name: name.to_string(),
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to stop and wait for it to finish.
    ///
    /// A worker whose tick panicked reports default stats.
    pub fn stop(mut self) -> WorkerStats<T> {
        let _ = self.stop_tx.send(());
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!(worker = %self.name, "Worker panicked");
                WorkerStats::default()
            }
            None => WorkerStats::default(),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl<T> Drop for WorkerThread<T> {
    fn drop(&mut self) {
        // the thread exits on its own once it sees the signal
        let _ = self.stop_tx.send(());
    }
}
