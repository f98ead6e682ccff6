//! Cooperative cancellation, threaded through every long-running operation.
//!
//! A [`Context`] carries a cancellation channel that is closed (never sent
//! on) when the matching [`Canceller`] fires.  Workers either poll
//! [`Context::check`] between sub-operations or select on
//! [`Context::done`] alongside their work channels.

use std::{convert::Infallible, sync::Mutex};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, never};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
}

/// A cancellation-aware context handed to stages and workers.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: Option<Receiver<Infallible>>,
}

impl Context {
    /// A context that can never be cancelled.
    pub fn background() -> Self {
        Self { cancel: None }
    }

    /// A fresh cancellable context and the handle that cancels it.
    pub fn cancellable() -> (Canceller, Self) {
        let (tx, rx) = bounded(0);
        (
            Canceller {
                tx: Mutex::new(Some(tx)),
            },
            Self { cancel: Some(rx) },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.cancel {
            Some(rx) => matches!(rx.try_recv(), Err(TryRecvError::Disconnected)),
            None => false,
        }
    }

    /// Errors with [`SessionError::Cancelled`] if the context is done.
    pub fn check(&self) -> Result<(), SessionError> {
        if self.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A channel that becomes ready exactly when the context is cancelled.
    ///
    /// Intended for `crossbeam_channel::select!` arms; the channel never
    /// yields a value, it only disconnects.
    pub fn done(&self) -> Receiver<Infallible> {
        self.cancel.clone().unwrap_or_else(never)
    }

    /// Sends `value` on `tx`, aborting with `Cancelled` if the context ends
    /// first or the receiver has gone away.
    pub fn send_or_cancel<T>(&self, tx: &Sender<T>, value: T) -> Result<(), SessionError> {
        crossbeam_channel::select! {
            send(tx, value) -> res => res.map_err(|_| SessionError::Cancelled),
            recv(self.done()) -> _ => Err(SessionError::Cancelled),
        }
    }
}

/// The cancelling end of a [`Context`].
#[derive(Debug)]
pub struct Canceller {
    tx: Mutex<Option<Sender<Infallible>>>,
}

impl Canceller {
    /// Cancels every context cloned from this pair.  Idempotent.
    pub fn cancel(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_cancels() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.check(), Ok(()));
    }

    #[test]
    fn cancel_reaches_all_clones() {
        let (canceller, ctx) = Context::cancellable();
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        canceller.cancel();
        assert!(ctx.is_cancelled());
        assert!(clone.is_cancelled());
        assert_eq!(clone.check(), Err(SessionError::Cancelled));
    }

    #[test]
    fn cancel_is_idempotent() {
        let (canceller, ctx) = Context::cancellable();
        canceller.cancel();
        canceller.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn send_or_cancel_aborts_on_cancel() {
        let (canceller, ctx) = Context::cancellable();
        // Zero-capacity channel with no reader: the send can never complete.
        let (tx, _rx) = bounded::<u32>(0);
        canceller.cancel();
        assert_eq!(ctx.send_or_cancel(&tx, 1), Err(SessionError::Cancelled));
    }

    #[test]
    fn done_channel_fires_on_cancel() {
        let (canceller, ctx) = Context::cancellable();
        let done = ctx.done();
        canceller.cancel();
        assert!(done.recv().is_err());
    }
}
