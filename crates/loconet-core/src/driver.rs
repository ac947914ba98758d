//! Threaded runtime for a [`SlotManager`].
//!
//! The manager lives on one processing thread. Inbound frames, API calls and
//! timer polls all reach it as commands over a channel, so they never run
//! concurrently with each other. Between commands the thread wakes every
//! `tick_ms` to fire due timers.
//!
//! Listener callbacks run on the processing thread. From there, use
//! [`ManagerHandle::submit`] to queue follow-up work; [`ManagerHandle::call`]
//! would wait on the thread it is running on and is refused.

use std::io::Read;
use std::sync::mpsc;
use std::thread::{self, ThreadId};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::manager::SlotManager;
use crate::slot::Slot;
use crate::transport::{FrameReader, LocoNetTransport};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceError {
    #[error("slot manager thread has stopped")]
    Stopped,

    #[error("blocking call from the slot manager thread")]
    Reentrant,
}

type Job<T, C> = Box<dyn FnOnce(&mut SlotManager<T, C>) + Send>;

enum Command<T: LocoNetTransport, C: Clock> {
    Frame(Vec<u8>),
    Run(Job<T, C>),
    Shutdown,
}

/// Cloneable handle for talking to a running [`ManagerService`].
pub struct ManagerHandle<T: LocoNetTransport, C: Clock> {
    sender: mpsc::Sender<Command<T, C>>,
    worker: ThreadId,
}

impl<T: LocoNetTransport, C: Clock> Clone for ManagerHandle<T, C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            worker: self.worker,
        }
    }
}

impl<T, C> ManagerHandle<T, C>
where
    T: LocoNetTransport + 'static,
    C: Clock + 'static,
{
    /// Queue one inbound frame.
    pub fn frame(&self, bytes: Vec<u8>) -> Result<(), ServiceError> {
        self.sender
            .send(Command::Frame(bytes))
            .map_err(|_| ServiceError::Stopped)
    }

    /// Queue `f` to run on the processing thread without waiting for it.
    ///
    /// Safe to use from listener callbacks.
    pub fn submit<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut SlotManager<T, C>) + Send + 'static,
    {
        self.sender
            .send(Command::Run(Box::new(f)))
            .map_err(|_| ServiceError::Stopped)
    }

    /// Run `f` on the processing thread and wait for its result.
    ///
    /// Fails with [`ServiceError::Reentrant`] when called from the
    /// processing thread itself.
    pub fn call<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SlotManager<T, C>) -> R + Send + 'static,
    {
        if thread::current().id() == self.worker {
            return Err(ServiceError::Reentrant);
        }
        let (reply, result) = mpsc::channel();
        let job: Job<T, C> = Box::new(move |manager| {
            let _ = reply.send(f(manager));
        });
        self.sender
            .send(Command::Run(job))
            .map_err(|_| ServiceError::Stopped)?;
        result.recv().map_err(|_| ServiceError::Stopped)
    }

    /// Copy of the whole slot table.
    pub fn snapshot(&self) -> Result<Vec<Slot>, ServiceError> {
        self.call(|manager| manager.slots().iter().cloned().collect())
    }

    pub fn in_use_slot_count(&self) -> Result<usize, ServiceError> {
        self.call(|manager| manager.in_use_slot_count())
    }

    /// Feed frames read from `reader` until it ends or the service stops.
    pub fn feed_from<R>(&self, reader: R) -> thread::JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        let handle = self.clone();
        thread::spawn(move || {
            for frame in FrameReader::new(reader) {
                match frame {
                    Ok(msg) => {
                        if handle.frame(msg.into_bytes()).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Framing error on input"),
                }
            }
            debug!("Frame input ended");
        })
    }
}

/// A [`SlotManager`] running on its own thread.
pub struct ManagerService<T: LocoNetTransport, C: Clock> {
    handle: ManagerHandle<T, C>,
    thread: Option<thread::JoinHandle<SlotManager<T, C>>>,
}

impl<T, C> ManagerService<T, C>
where
    T: LocoNetTransport + 'static,
    C: Clock + 'static,
{
    /// Move `manager` onto a new processing thread.
    pub fn spawn(mut manager: SlotManager<T, C>) -> Self {
        let tick = manager.config().tick();
        let (sender, receiver) = mpsc::channel::<Command<T, C>>();

        let thread = thread::spawn(move || {
            info!(tick_ms = tick.as_millis() as u64, "Slot manager service running");
            loop {
                match receiver.recv_timeout(tick) {
                    Ok(Command::Frame(bytes)) => manager.on_frame(&bytes),
                    Ok(Command::Run(job)) => job(&mut manager),
                    Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                manager.poll();
            }
            info!("Slot manager service stopped");
            manager
        });

        Self {
            handle: ManagerHandle {
                sender,
                worker: thread.thread().id(),
            },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> ManagerHandle<T, C> {
        self.handle.clone()
    }

    /// Stop the processing thread and take the manager back.
    pub fn shutdown(mut self) -> Option<SlotManager<T, C>> {
        let _ = self.handle.sender.send(Command::Shutdown);
        self.thread.take().and_then(|t| t.join().ok())
    }
}

impl<T: LocoNetTransport, C: Clock> Drop for ManagerService<T, C> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.sender.send(Command::Shutdown);
            let _ = thread.join();
        }
    }
}
