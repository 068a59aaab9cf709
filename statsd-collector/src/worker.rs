use std::{
    io,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info};

/// A named background thread that can be started and stopped, any number of times.
///
/// The thread body receives a shutdown channel. Stopping the worker drops the sending half, which disconnects the
/// channel, so the body sees shutdown through either `recv` returning an error or `select!` firing on it.
pub(crate) struct Worker<T> {
    name: &'static str,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<T>>,
}

impl<T> Worker<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(name: &'static str) -> Self {
        Self { name, shutdown: None, handle: None }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawns the thread, unless it is already running.
    pub(crate) fn start<F>(&mut self, body: F) -> io::Result<()>
    where
        F: FnOnce(Receiver<()>) -> T + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }

        info!(worker = self.name, "Starting.");

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = thread::Builder::new().name(self.name.to_string()).spawn(move || body(shutdown_rx))?;

        self.shutdown = Some(shutdown_tx);
        self.handle = Some(handle);

        info!(worker = self.name, "Started.");
        Ok(())
    }

    /// Signals shutdown and waits for the thread to exit, returning whatever the thread body returned.
    ///
    /// Returns `None` if the worker was not running, or if the thread panicked.
    pub(crate) fn stop(&mut self) -> Option<T> {
        let handle = self.handle.take()?;

        info!(worker = self.name, "Stopping.");
        drop(self.shutdown.take());

        match handle.join() {
            Ok(value) => {
                info!(worker = self.name, "Stopped.");
                Some(value)
            }
            Err(_) => {
                error!(worker = self.name, "Worker thread panicked.");
                None
            }
        }
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
