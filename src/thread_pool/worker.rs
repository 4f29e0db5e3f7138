/// Single-Thread Job Worker
///
/// Runs boxed jobs in submission order on one named thread. Each async
/// resource cache owns a worker so that slow device uploads never run on
/// the render thread. A panicking job is logged and the thread moves on to
/// the next one; the job's owner learns of the failure through whatever the
/// job dropped while unwinding.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::error::CacheResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Worker {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a worker thread with the given name
    pub fn spawn(name: impl Into<String>) -> CacheResult<Self> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver.iter() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("[Worker:{}] Job panicked", thread_name);
                }
            }
        })?;

        log::debug!("[Worker:{}] Started", name);

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. The queue is unbounded; jobs submitted after shutdown are
    /// dropped with a warning.
    pub fn invoke(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(Box::new(job)).is_err() {
                    log::warn!("[Worker:{}] Thread exited, job dropped", self.name);
                }
            }
            None => log::warn!("[Worker:{}] Invoked after shutdown, job dropped", self.name),
        }
    }

    /// Finish queued jobs and join the thread. Must not be called from a job
    /// running on this worker.
    pub fn shutdown(&self) {
        // closing the channel ends the receive loop once the queue drains
        self.sender.lock().take();

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                log::error!("[Worker:{}] Shutdown requested from its own thread", self.name);
                return;
            }
            if handle.join().is_err() {
                log::error!("[Worker:{}] Thread panicked", self.name);
            }
            log::debug!("[Worker:{}] Stopped", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
