//! # Outbox
//!
//! The send path of one connection, shared by server sessions and client links.
//!
//! ## Invariants
//! - `send` never blocks. If the send lock is contended the frame joins a FIFO
//!   pending queue and a single retry task flushes it after `retry_delay`.
//! - Whoever holds the lock drains the pending queue before its own frame, so
//!   frames leave in the order `send` was called.
//! - Frames are handed to a dedicated writer task; socket I/O never happens
//!   under the lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::TryLockError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use remowire::Message;
use remowire::Role;

use crate::config::Transcript;
use crate::error::LinkError;

struct Inner {
    role: Role,
    label: String,
    /// The send lock. `None` once the outbox is closed.
    sink: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    retry_scheduled: AtomicBool,
    retry_delay: Duration,
    transcript: Option<Transcript>,
    runtime: Handle,
}

/// Cloneable handle to one connection's send path.
#[derive(Clone)]
pub(crate) struct Outbox {
    inner: Arc<Inner>,
}

impl Outbox {
    /// Creates an outbox and the receiving end its frames are written to.
    ///
    /// Must be called within a tokio runtime.
    pub fn channel(
        role: Role,
        label: impl Into<String>,
        retry_delay: Duration,
        transcript: Option<Transcript>,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            role,
            label: label.into(),
            sink: Mutex::new(Some(tx)),
            pending: Mutex::new(VecDeque::new()),
            retry_scheduled: AtomicBool::new(false),
            retry_delay,
            transcript,
            runtime: Handle::current(),
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Creates an outbox whose frames are written to `writer` by a spawned task.
    pub fn spawn(
        role: Role,
        label: impl Into<String>,
        retry_delay: Duration,
        transcript: Option<Transcript>,
        writer: OwnedWriteHalf,
    ) -> Self {
        let label = label.into();
        let (outbox, rx) = Self::channel(role, label.clone(), retry_delay, transcript);
        tokio::spawn(write_loop(label, rx, writer));
        outbox
    }

    /// Queues a message for sending.
    pub fn send(&self, msg: &Message) -> Result<(), LinkError> {
        let ty = msg.message_type();
        if !ty.sendable_by(self.inner.role) {
            warn!(peer = %self.inner.label, kind = %ty, "refusing to send message in the wrong direction");
            return Err(LinkError::Misdirected(ty));
        }
        let frame = remowire::encode(msg)?;
        self.note(">>", msg);
        self.submit(frame)
    }

    /// Records a received message in the transcript.
    pub fn note_received(&self, msg: &Message) {
        self.note("<<", msg);
    }

    fn note(&self, arrow: &str, msg: &Message) {
        trace!(peer = %self.inner.label, id = msg.id, kind = %msg.message_type(), "{}", arrow);
        if let Some(transcript) = &self.inner.transcript {
            transcript(&format!("{} {} {}", self.inner.label, arrow, msg));
        }
    }

    fn submit(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        let guard = match self.inner.sink.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(peer = %self.inner.label, "send lock contended, queueing");
                self.lock_pending().push_back(frame);
                self.schedule_retry();
                return Ok(());
            }
        };
        let Some(tx) = guard.as_ref() else {
            return Err(LinkError::Closed);
        };
        self.flush_pending(tx)?;
        tx.send(frame).map_err(|_| LinkError::Closed)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_pending(&self, tx: &mpsc::UnboundedSender<Vec<u8>>) -> Result<(), LinkError> {
        let queued: Vec<Vec<u8>> = self.lock_pending().drain(..).collect();
        for frame in queued {
            tx.send(frame).map_err(|_| LinkError::Closed)?;
        }
        Ok(())
    }

    fn schedule_retry(&self) {
        if self.inner.retry_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let outbox = self.clone();
        self.inner.runtime.spawn(async move {
            loop {
                tokio::time::sleep(outbox.inner.retry_delay).await;
                match outbox.try_flush() {
                    Some(_) => break,
                    None => debug!(peer = %outbox.inner.label, "send lock still contended"),
                }
            }
            outbox.inner.retry_scheduled.store(false, Ordering::Release);
            // A frame may have been queued between the flush and the store.
            if !outbox.lock_pending().is_empty() {
                outbox.schedule_retry();
            }
        });
    }

    /// Flushes the pending queue if the lock is free. `None` when contended.
    fn try_flush(&self) -> Option<Result<(), LinkError>> {
        let guard = match self.inner.sink.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        match guard.as_ref() {
            Some(tx) => Some(self.flush_pending(tx)),
            None => {
                self.lock_pending().clear();
                Some(Err(LinkError::Closed))
            }
        }
    }

    /// Flushes what is queued and stops accepting frames. The writer task
    /// finishes the backlog and shuts the socket down.
    pub fn close(&self) {
        let mut guard = self.inner.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = self.flush_pending(tx);
        }
        *guard = None;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.sink.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Holds the send lock until the guard drops.
    #[cfg(test)]
    pub fn hold(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<u8>>>> {
        self.inner.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_loop(label: String, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: OwnedWriteHalf) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(peer = %label, error = %e, "write failed, stopping writer");
            return;
        }
    }
    let _ = writer.shutdown().await;
    trace!(peer = %label, "writer finished");
}
