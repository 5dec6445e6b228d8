//! Synchronization primitives whose waiters always observe an outcome.
//!
//! A failed round must release every blocked task with an error instead of
//! leaving it parked on a counter that will never reach zero. [`Gate`] is a
//! countdown latch with an explicit abort path; [`Signal`] is a one-shot
//! value cell with the same property.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Returned by waiters of a gate or signal whose round was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("round aborted")]
pub struct Aborted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Counting(usize),
    Open,
    Aborted,
}

/// Countdown latch: opens after `count` arrivals, or fails all waiters on
/// [`Gate::abort`]. Arrivals after opening are ignored; an abort is sticky
/// and wins over late arrivals.
#[derive(Debug)]
pub struct Gate {
    state: Mutex<State>,
    notify: Notify,
}

impl Gate {
    pub fn new(count: usize) -> Self {
        let state = if count == 0 {
            State::Open
        } else {
            State::Counting(count)
        };
        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    /// Record one arrival.
    pub fn arrive(&self) {
        let mut state = self.state.lock();
        if let State::Counting(n) = *state {
            *state = if n <= 1 {
                State::Open
            } else {
                State::Counting(n - 1)
            };
            if *state == State::Open {
                self.notify.notify_waiters();
            }
        }
    }

    /// Fail the gate; every current and future waiter observes [`Aborted`].
    pub fn abort(&self) {
        *self.state.lock() = State::Aborted;
        self.notify.notify_waiters();
    }

    /// Wait until the gate opens or the round is aborted.
    pub async fn wait(&self) -> Result<(), Aborted> {
        loop {
            let notified = self.notify.notified();
            match *self.state.lock() {
                State::Open => return Ok(()),
                State::Aborted => return Err(Aborted),
                State::Counting(_) => {}
            }
            notified.await;
        }
    }
}

/// One-shot result cell: a producer publishes a value (or an abort) exactly
/// once and any number of waiters receive it.
#[derive(Debug)]
pub struct Signal<T> {
    cell: Mutex<Option<Result<T, Aborted>>>,
    notify: Notify,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Publish the value. Later calls are ignored.
    pub fn set(&self, value: T) {
        let mut cell = self.cell.lock();
        if cell.is_none() {
            *cell = Some(Ok(value));
            self.notify.notify_waiters();
        }
    }

    /// Fail the signal; waiters observe [`Aborted`].
    pub fn abort(&self) {
        let mut cell = self.cell.lock();
        if cell.is_none() {
            *cell = Some(Err(Aborted));
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) -> Result<T, Aborted> {
        loop {
            let notified = self.notify.notified();
            if let Some(res) = self.cell.lock().clone() {
                return res;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_opens_after_count() {
        let gate = Arc::new(Gate::new(3));
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        gate.arrive();
        gate.arrive();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        gate.arrive();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn gate_abort_releases_waiters() {
        let gate = Arc::new(Gate::new(2));
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        gate.arrive();
        gate.abort();
        assert_eq!(waiter.await.unwrap(), Err(Aborted));
        // abort is sticky
        gate.arrive();
        assert_eq!(gate.wait().await, Err(Aborted));
    }

    #[tokio::test]
    async fn zero_count_gate_is_open() {
        let gate = Gate::new(0);
        assert_eq!(gate.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn signal_delivers_once() {
        let sig = Arc::new(Signal::new());
        let waiter = {
            let sig = sig.clone();
            tokio::spawn(async move { sig.wait().await })
        };
        sig.set(7u32);
        sig.set(9u32);
        assert_eq!(waiter.await.unwrap(), Ok(7));
        assert_eq!(sig.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn signal_abort() {
        let sig: Signal<u32> = Signal::new();
        sig.abort();
        assert_eq!(sig.wait().await, Err(Aborted));
    }
}
