//! Single-writer affinity contexts.
//!
//! An [`Affinity`] identifies one owning thread that drains a mailbox of jobs.
//! Stores capture the ambient affinity of the thread that constructs them and
//! route every mutation through it:
//!
//! - on the owning thread, the job runs inline;
//! - on any other thread, the job is sent to the mailbox and the caller blocks
//!   until the owner has run it;
//! - without a captured affinity, everything runs inline and callers
//!   synchronize externally.
//!
//! The mailbox is a `tokio` unbounded channel drained with `blocking_recv`,
//! answers travel back over a `oneshot`. Blocking calls must not be made from
//! inside an async runtime worker; use `spawn_blocking` there.

use crate::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

enum Envelope {
    Run(Job),
    Shutdown,
}

static NEXT_AFFINITY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Affinity>> = const { RefCell::new(None) };
}

/// Handle to an owning execution context.
#[derive(Clone)]
pub struct Affinity {
    id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Affinity {
    /// Create a new context and the mailbox its owner must drain.
    pub fn channel() -> (Affinity, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let affinity = Affinity {
            id: NEXT_AFFINITY_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        let mailbox = Mailbox {
            affinity: affinity.clone(),
            rx,
        };
        (affinity, mailbox)
    }

    /// Start a dedicated owner thread.
    pub fn spawn(name: impl Into<String>) -> Result<AffinityThread> {
        let (affinity, mailbox) = Affinity::channel();
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || mailbox.run())
            .map_err(|e| Error::ThreadSpawn(e.to_string()))?;

        tracing::debug!(affinity = affinity.id, thread = %name, "Affinity thread started");

        Ok(AffinityThread {
            affinity,
            handle: Some(handle),
        })
    }

    /// The affinity the calling thread is currently associated with.
    pub fn current() -> Option<Affinity> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Unique id of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the calling thread is this context's owner.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.borrow().as_ref().map(|a| a.id) == Some(self.id))
    }

    /// Associate the calling thread with this context until the guard drops.
    pub fn enter(&self) -> AffinityGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        AffinityGuard { previous }
    }

    /// Run `job` on the owner: inline when already there, otherwise dispatched
    /// and awaited.
    pub fn invoke<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Run(Box::new(move || {
                let _ = resp_tx.send(job());
            })))
            .map_err(|_| Error::AffinityClosed)?;

        resp_rx.blocking_recv().map_err(|_| Error::AffinityClosed)
    }
}

/// Run `job` under `affinity`, or inline when there is none.
pub(crate) fn run_on<R, F>(affinity: Option<&Affinity>, job: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match affinity {
        Some(affinity) => affinity.invoke(job),
        None => Ok(job()),
    }
}

impl PartialEq for Affinity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Affinity {}

impl fmt::Debug for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Affinity").field("id", &self.id).finish()
    }
}

/// Restores the previous ambient affinity on drop.
#[must_use = "the affinity is only ambient while the guard is alive"]
pub struct AffinityGuard {
    previous: Option<Affinity>,
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Receiving side of an affinity context.
pub struct Mailbox {
    affinity: Affinity,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Mailbox {
    /// The context this mailbox serves.
    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }

    /// Drain jobs on the calling thread until shutdown is requested.
    pub fn run(mut self) {
        let _guard = self.affinity.enter();
        while let Some(envelope) = self.rx.blocking_recv() {
            match envelope {
                Envelope::Run(job) => self.execute(job),
                Envelope::Shutdown => break,
            }
        }
        tracing::debug!(affinity = self.affinity.id, "Affinity mailbox closed");
    }

    /// Run every job already queued, without blocking. Returns how many ran.
    ///
    /// Lets an existing event loop act as the owner.
    pub fn run_pending(&mut self) -> usize {
        let _guard = self.affinity.enter();
        let mut ran = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            match envelope {
                Envelope::Run(job) => {
                    self.execute(job);
                    ran += 1;
                }
                Envelope::Shutdown => break,
            }
        }
        ran
    }

    fn execute(&self, job: Job) {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!(affinity = self.affinity.id, "Job panicked on affinity thread");
        }
    }
}

/// A dedicated owner thread. Shuts down and joins on drop.
pub struct AffinityThread {
    affinity: Affinity,
    handle: Option<JoinHandle<()>>,
}

impl AffinityThread {
    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }

    /// Run `job` on the owner thread and wait for its result.
    pub fn invoke<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.affinity.invoke(job)
    }

    /// Stop the thread after the jobs already queued have run.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.affinity.tx.send(Envelope::Shutdown);
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
            tracing::debug!(affinity = self.affinity.id, "Affinity thread stopped");
        }
    }
}

impl Drop for AffinityThread {
    fn drop(&mut self) {
        self.stop();
    }
}
