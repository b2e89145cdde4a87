//! Settle-once outcome cells.
//!
//! A [`Settle`] starts unsettled and transitions exactly once to either
//! `Ok` or `Err`.  Any number of tasks may wait on it, before or after it
//! settles; late waiters see the stored outcome immediately.  Clones share
//! the same cell, and the stored outcome stays readable after every clone
//! held by the producer side has been dropped.

use std::sync::Arc;

use tokio::sync::watch;

type Slot<T, E> = Option<Result<T, E>>;

/// A shareable cell that settles exactly once.
pub struct Settle<T, E> {
    tx: Arc<watch::Sender<Slot<T, E>>>,
}

impl<T, E> Clone for Settle<T, E> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone, E: Clone> Default for Settle<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> Settle<T, E> {
    /// Create an unsettled cell.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Store `outcome` if the cell is still unsettled.
    ///
    /// Returns `false` (and drops `outcome`) when the cell had already
    /// settled.
    pub fn settle(&self, outcome: Result<T, E>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// The stored outcome, if settled.
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.tx.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Register a waiter.  The waiter observes the outcome even if it is
    /// stored before [`Waiter::wait`] is first polled.
    pub fn waiter(&self) -> Waiter<T, E> {
        Waiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Result<T, E> {
        let waiter = self.waiter();
        match waiter.wait().await {
            Some(outcome) => outcome,
            // The sender lives in `self`, so the channel cannot close here.
            None => unreachable!("settle cell closed while borrowed"),
        }
    }
}

/// A registered waiter on a [`Settle`] cell.
pub struct Waiter<T, E> {
    rx: watch::Receiver<Slot<T, E>>,
}

impl<T: Clone, E: Clone> Waiter<T, E> {
    /// Resolve with the outcome, or `None` if every clone of the cell was
    /// dropped without settling.
    pub async fn wait(mut self) -> Option<Result<T, E>> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome
    }
}
