//! # Work Queues
//!
//! Deferred work leaves the interrupt path through a bounded queue drained by
//! one named worker thread. Interrupt context only ever uses
//! [`WorkQueue::try_enqueue`], which never blocks.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use spin::Mutex;

use crate::{HbaError, HbaResult};

/// Bounded queue with a dedicated worker thread
pub struct WorkQueue<T> {
    name: String,
    tx: Mutex<Option<SyncSender<T>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Starts a worker that runs `handler` on every queued item
    pub fn spawn<F>(name: &str, depth: usize, mut handler: F) -> HbaResult<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<T>(depth);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for item in rx {
                    handler(item);
                }
            })
            .map_err(|e| {
                log::warn!("{}: unable to start worker: {}", name, e);
                HbaError::NoMemory
            })?;

        Ok(Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues without blocking. A full or stopped queue hands the item back.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(item) => {
                    log::warn!("{}: queue full", self.name);
                    item
                }
                TrySendError::Disconnected(item) => item,
            }),
            None => Err(item),
        }
    }

    /// Queues, waiting for room. Never call from interrupt context.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(item),
        };
        tx.send(item).map_err(|e| e.0)
    }
}

impl<T> WorkQueue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting work, lets the worker drain and joins it
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // a handler may drop the last controller reference itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
