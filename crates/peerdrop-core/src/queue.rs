//! Strictly ordered, single-consumer processing queue.
//!
//! Every inbound event of a peer flows through one [`MessageQueue`]. A
//! dedicated drain task hands items to the installed [`QueueHandler`] one at
//! a time and awaits it before taking the next, so handlers never
//! interleave even when they suspend.
//!
//! Items enqueued before a handler is installed are buffered. A failing or
//! panicking handler is logged for that item only; the drain loop keeps
//! going.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};

/// Processor for queued items.
#[async_trait]
pub trait QueueHandler<T>: Send + 'static {
    /// Handle one item. The next item is not dequeued until this returns.
    async fn handle(&mut self, item: T) -> Result<()>;
}

struct Envelope<T> {
    epoch: u64,
    item: T,
}

enum Command<T> {
    Item(Envelope<T>),
    SetHandler(Box<dyn QueueHandler<T>>),
    Close,
}

struct Shared {
    epoch: AtomicU64,
    pending: AtomicUsize,
}

/// Handle to a FIFO drained by a background task.
///
/// Cloning the handle yields another producer for the same queue.
pub struct MessageQueue<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    shared: Arc<Shared>,
    finished: watch::Receiver<bool>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            finished: self.finished.clone(),
        }
    }
}

impl<T> fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> MessageQueue<T> {
    /// Items enqueued but not yet handled or discarded.
    pub fn len(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Whether no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> MessageQueue<T> {
    /// Create a queue and spawn its drain task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (finished_tx, finished) = watch::channel(false);
        let shared = Arc::new(Shared {
            epoch: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        });

        tokio::spawn(drain(rx, Arc::clone(&shared), finished_tx));

        Self {
            tx,
            shared,
            finished,
        }
    }

    /// Install the handler. Buffered items are processed immediately.
    ///
    /// Installing a second handler replaces the first for all later items.
    pub fn set_handler<H>(&self, handler: H) -> Result<()>
    where
        H: QueueHandler<T>,
    {
        self.tx
            .send(Command::SetHandler(Box::new(handler)))
            .map_err(|_| closed())
    }

    /// Append an item.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue has been closed.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let envelope = Envelope {
            epoch: self.shared.epoch.load(Ordering::Acquire),
            item,
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(Command::Item(envelope)).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            closed()
        })
    }

    /// Discard every item enqueued so far without handling it.
    ///
    /// An item already inside the handler is not interrupted.
    pub fn clear(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Stop the drain task after the items enqueued so far are handled.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    /// Wait until the drain task has exited.
    pub async fn closed(&self) {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl<T: Send + 'static> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn closed() -> Error {
    Error::Internal("message queue is closed".to_string())
}

async fn drain<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    shared: Arc<Shared>,
    finished: watch::Sender<bool>,
) {
    let mut handler: Option<Box<dyn QueueHandler<T>>> = None;
    let mut backlog: VecDeque<Envelope<T>> = VecDeque::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Item(envelope) => {
                if let Some(handler) = handler.as_mut() {
                    process(handler.as_mut(), &shared, envelope).await;
                } else {
                    backlog.push_back(envelope);
                }
            }
            Command::SetHandler(new_handler) => {
                let handler = handler.insert(new_handler);
                while let Some(envelope) = backlog.pop_front() {
                    process(handler.as_mut(), &shared, envelope).await;
                }
            }
            Command::Close => break,
        }
    }

    rx.close();
    let mut dropped = backlog.len();
    while let Ok(command) = rx.try_recv() {
        if matches!(command, Command::Item(_)) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        shared.pending.fetch_sub(dropped, Ordering::AcqRel);
        tracing::debug!("Message queue closed with {} unhandled items", dropped);
    }

    let _ = finished.send(true);
}

async fn process<T: Send + 'static>(
    handler: &mut dyn QueueHandler<T>,
    shared: &Shared,
    envelope: Envelope<T>,
) {
    if envelope.epoch < shared.epoch.load(Ordering::Acquire) {
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    match AssertUnwindSafe(handler.handle(envelope.item))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Queue handler failed"),
        Err(_) => tracing::error!("Queue handler panicked; continuing with next item"),
    }

    shared.pending.fetch_sub(1, Ordering::AcqRel);
}
