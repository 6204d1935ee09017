//! The one-shot completion cell shared by every asynchronous operation.
//!
//! A [`BaseFuture`] starts out pending and is completed exactly once, by whichever thread first observes the
//! outcome: an I/O callback, a timeout task or the caller itself when it can short-circuit. Every other completion
//! attempt loses the race and is told so through the `bool` returned by [`BaseFuture::complete`].
//!
//! Listeners registered with [`BaseFuture::add_listener`] run exactly once, in registration order, and never while
//! the future's lock is held. A listener added after completion runs immediately on the caller's thread.

use futures::channel::oneshot;
use log::*;
use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FutureState {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl FutureState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FutureState::Pending)
    }
}

impl Display for FutureState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FutureState::Pending => write!(f, "Pending"),
            FutureState::Success => write!(f, "Success"),
            FutureState::Failed => write!(f, "Failed"),
            FutureState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The terminal value of a future.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Success(T),
    Failed(E),
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    pub fn state(&self) -> FutureState {
        match self {
            Outcome::Success(_) => FutureState::Success,
            Outcome::Failed(_) => FutureState::Failed,
            Outcome::Cancelled => FutureState::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&E> {
        match self {
            Outcome::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

pub type Listener<T, E> = Box<dyn FnOnce(&Outcome<T, E>) + Send + 'static>;

struct Completion<T, E> {
    outcome: Option<Arc<Outcome<T, E>>>,
    listeners: Vec<Listener<T, E>>,
}

struct Shared<T, E> {
    completion: Mutex<Completion<T, E>>,
    done: Condvar,
}

/// A cheaply cloneable handle to a one-shot completion cell. All clones observe the same state.
pub struct BaseFuture<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for BaseFuture<T, E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T, E> Default for BaseFuture<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> BaseFuture<T, E> {
    /// Create a new pending future.
    pub fn new() -> Self {
        let completion = Completion { outcome: None, listeners: Vec::new() };
        Self { shared: Arc::new(Shared { completion: Mutex::new(completion), done: Condvar::new() }) }
    }

    /// Create a future that is already terminal, e.g. for a request that was granted synchronously.
    pub fn completed(outcome: Outcome<T, E>) -> Self {
        let future = Self::new();
        future.complete(outcome);
        future
    }

    /// Move the future from pending to the given terminal outcome.
    ///
    /// Returns `true` only for the single call that performed the transition. That caller has fired the listeners
    /// by the time this returns. A `false` return means another thread got there first and the caller must not
    /// report any side effects of its own outcome.
    pub fn complete(&self, outcome: Outcome<T, E>) -> bool {
        let (outcome, listeners) = {
            let mut completion = self.shared.completion.lock();
            if completion.outcome.is_some() {
                return false;
            }
            let outcome = Arc::new(outcome);
            completion.outcome = Some(Arc::clone(&outcome));
            (outcome, std::mem::take(&mut completion.listeners))
        };
        self.shared.done.notify_all();
        trace!("Future completed as {}. Notifying {} listener(s)", outcome.state(), listeners.len());
        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    pub fn fail(&self, reason: E) -> bool {
        self.complete(Outcome::Failed(reason))
    }

    /// Cancel the future if it is still pending. Cancelling a terminal future does nothing and returns `false`.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    /// Register a listener for the final outcome.
    ///
    /// If the future is already terminal the listener runs right away on the calling thread, otherwise it runs on
    /// the completing thread after all previously registered listeners.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let mut completion = self.shared.completion.lock();
        if let Some(outcome) = completion.outcome.clone() {
            drop(completion);
            listener(&outcome);
            return;
        }
        completion.listeners.push(Box::new(listener));
    }

    /// Block the calling thread until the future is terminal.
    ///
    /// Never call this from the thread that is responsible for completing the future (e.g. from inside a listener
    /// of a future whose completion depends on this one, or from a transport's I/O callback); it will deadlock.
    pub fn await_uninterruptibly(&self) -> Arc<Outcome<T, E>> {
        let mut completion = self.shared.completion.lock();
        loop {
            if let Some(outcome) = &completion.outcome {
                return Arc::clone(outcome);
            }
            self.shared.done.wait(&mut completion);
        }
    }

    /// Like [`Self::await_uninterruptibly`], but gives up after `timeout`, returning `None` if still pending.
    pub fn await_timeout(&self, timeout: Duration) -> Option<Arc<Outcome<T, E>>> {
        let deadline = Instant::now() + timeout;
        let mut completion = self.shared.completion.lock();
        loop {
            if let Some(outcome) = &completion.outcome {
                return Some(Arc::clone(outcome));
            }
            if self.shared.done.wait_until(&mut completion, deadline).timed_out() {
                return completion.outcome.clone();
            }
        }
    }

    /// Wait for the outcome from async code without blocking the executor.
    pub async fn completion(&self) -> Arc<Outcome<T, E>> {
        let (sender, receiver) = oneshot::channel::<()>();
        self.add_listener(move |_| {
            let _ = sender.send(());
        });
        if receiver.await.is_err() {
            warn!("Completion listener was dropped before it fired");
        }
        // The listener only fires once the outcome is set, so this does not block.
        self.await_uninterruptibly()
    }

    pub fn outcome(&self) -> Option<Arc<Outcome<T, E>>> {
        self.shared.completion.lock().outcome.clone()
    }

    pub fn state(&self) -> FutureState {
        self.shared.completion.lock().outcome.as_ref().map(|o| o.state()).unwrap_or(FutureState::Pending)
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.state() == FutureState::Success
    }

    pub fn is_failed(&self) -> bool {
        self.state() == FutureState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// `true` if both handles point at the same completion cell.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The number of listeners still waiting for completion.
    pub fn pending_listeners(&self) -> usize {
        self.shared.completion.lock().listeners.len()
    }
}

impl<T: Clone, E> BaseFuture<T, E> {
    pub fn result(&self) -> Option<T> {
        self.outcome().and_then(|o| o.success().cloned())
    }
}

impl<T, E: Clone> BaseFuture<T, E> {
    pub fn failure(&self) -> Option<E> {
        self.outcome().and_then(|o| o.failure().cloned())
    }
}

impl<T, E> Debug for BaseFuture<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BaseFuture({})", self.state())
    }
}

/// Forwards the common future API of a wrapper type to its inner [`BaseFuture`].
#[macro_export]
macro_rules! delegate_future {
    ($wrapper:ty, $field:ident, $value:ty, $reason:ty) => {
        impl $wrapper {
            pub fn state(&self) -> $crate::future::FutureState {
                self.$field.state()
            }

            pub fn is_completed(&self) -> bool {
                self.$field.is_completed()
            }

            pub fn is_success(&self) -> bool {
                self.$field.is_success()
            }

            pub fn is_failed(&self) -> bool {
                self.$field.is_failed()
            }

            pub fn is_cancelled(&self) -> bool {
                self.$field.is_cancelled()
            }

            pub fn outcome(&self) -> Option<std::sync::Arc<$crate::future::Outcome<$value, $reason>>> {
                self.$field.outcome()
            }

            pub fn add_listener<F>(&self, listener: F)
            where
                F: FnOnce(&$crate::future::Outcome<$value, $reason>) + Send + 'static,
            {
                self.$field.add_listener(listener)
            }

            pub fn await_uninterruptibly(&self) -> std::sync::Arc<$crate::future::Outcome<$value, $reason>> {
                self.$field.await_uninterruptibly()
            }

            pub fn await_timeout(
                &self,
                timeout: std::time::Duration,
            ) -> Option<std::sync::Arc<$crate::future::Outcome<$value, $reason>>> {
                self.$field.await_timeout(timeout)
            }

            pub async fn completion(&self) -> std::sync::Arc<$crate::future::Outcome<$value, $reason>> {
                self.$field.completion().await
            }

            pub fn cancel(&self) -> bool {
                self.$field.cancel()
            }
        }
    };
}
